// SPDX-License-Identifier: MIT OR Apache-2.0
//! Flow-graph execution engine.
//!
//! This crate provides the dataflow core behind visual scripting:
//! - Typed ports carrying tagged values with defined conversions
//! - A node contract ([`FlowNode`]) hosts implement for their catalogs
//! - A dirty-worklist scheduler that runs each update to a fixed point
//! - Entity binding and transparent entity forwarding
//! - An observation seam ([`ActivationObserver`]) for debuggers
//!
//! ## Execution model
//!
//! Values written to an output port fan out along the sorted edge
//! table into downstream input buffers, marking those nodes dirty.
//! [`FlowGraph::update`] sweeps the dirty list, delivering one
//! `Activate` per node per round and re-sweeping while deliveries
//! dirty more nodes. A value arriving at a port whose previous write
//! has not been delivered yet is queued, not overwritten, so every
//! activation is observed discretely and in order.
//!
//! ## Entity forwarding
//!
//! A node bound to an entity may be transparently re-pointed at
//! another entity the host designates (the forwarding target). Ahead
//! of every delivery the slot re-resolves its target through the
//! graph's [`EntityResolver`]: a cached getter supplies the current
//! target, a failed invocation reverts to not forwarding, and a bound
//! entity that vanished into an entity pool keeps the previous target
//! until it returns. Every transition is announced to the node with a
//! single `SetEntityId` event.

pub mod entity;
pub mod graph;
pub mod node;
pub mod observer;
pub mod slot;
pub mod value;

pub use entity::{EntityId, EntityResolver, ForwardingFn, NullEntityResolver};
pub use graph::{
    ActivationCtx, CreateNodeError, Edge, FlowGraph, LinkError, NodeId, PortAddr, PortId,
};
pub use node::{
    FlowEvent, FlowNode, GraphHook, InputPortConfig, NodeConfig, NodeFactory, NodeFlags,
    NodeRegistry, OutputPortConfig, MAX_DYNAMIC_OUTPUTS,
};
pub use observer::{ActivationObserver, EdgeVerdict};
pub use slot::{NodeSlot, ACTIVATE_PORT_NAME, ENTITY_PORT_NAME};
pub use value::{ConversionError, PortValue, Value, ValueTag};
