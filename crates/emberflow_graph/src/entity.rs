// SPDX-License-Identifier: MIT OR Apache-2.0
//! Entity-system collaborator contracts.
//!
//! The graph never talks to an entity system directly; it is handed an
//! [`EntityResolver`] at construction and asks it three things: does an
//! entity exist, is it parked in an entity pool, and can it supply a
//! forwarding-target callable. Everything else about entities lives
//! outside this crate.

use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// Reference to an entity owned by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// The "no entity" sentinel.
    pub const NONE: EntityId = EntityId(0);

    /// Whether this id refers to an entity at all.
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::NONE
    }
}

/// Callable that yields the current forwarding target for a bound
/// entity. Returning `None` models an invocation failure (missing
/// behavior table, script error); the caller reverts to not
/// forwarding.
pub type ForwardingFn = Rc<dyn Fn() -> Option<EntityId>>;

/// Host-side entity lookup consumed by entity forwarding.
pub trait EntityResolver {
    /// Whether the entity currently exists and can be queried.
    fn entity_exists(&self, id: EntityId) -> bool;

    /// Whether the entity is transiently parked in an entity pool.
    ///
    /// The exact predicate is owned by the host; the graph only uses
    /// it to keep a previous forwarding target alive while the bound
    /// entity is parked.
    fn is_pooled(&self, id: EntityId) -> bool;

    /// Look up the entity's behavior surface and return its forwarding
    /// getter, if it has one.
    fn forwarding_getter(&self, id: EntityId) -> Option<ForwardingFn>;
}

/// Resolver for hosts without an entity system: nothing exists,
/// nothing is pooled, nothing forwards.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEntityResolver;

impl EntityResolver for NullEntityResolver {
    fn entity_exists(&self, _id: EntityId) -> bool {
        false
    }

    fn is_pooled(&self, _id: EntityId) -> bool {
        false
    }

    fn forwarding_getter(&self, _id: EntityId) -> Option<ForwardingFn> {
        None
    }
}
