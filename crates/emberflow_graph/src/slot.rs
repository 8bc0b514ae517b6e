// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-node port state: input buffers, fan-out bookkeeping and entity
//! forwarding.
//!
//! A [`NodeSlot`] owns one hosted node plus everything the scheduler
//! needs to know about it between deliveries: the buffered input
//! values, the per-output first-edge indexes into the graph's sorted
//! edge table, and the forwarding state machine for entity-targeting
//! nodes.

use crate::entity::{EntityId, EntityResolver, ForwardingFn};
use crate::graph::PortId;
use crate::node::{
    FlowNode, InputPortConfig, NodeFlags, OutputPortConfig, MAX_DYNAMIC_OUTPUTS,
};
use crate::value::{PortValue, Value, ValueTag};

/// Name of the implicit entity-id input port.
pub const ENTITY_PORT_NAME: &str = "entity";

/// Name of the implicit activation-trigger input port.
pub const ACTIVATE_PORT_NAME: &str = "activate";

/// Sentinel for "no outgoing edges resolved yet" in the first-edge
/// array. Consumers always re-check the edge span, so a stale index is
/// harmless; this value just guarantees an empty span.
pub(crate) const NO_EDGE: usize = usize::MAX;

/// Entity-forwarding state for one slot.
#[derive(Default)]
struct ForwardingState {
    /// Currently forwarded target, `NONE` while not forwarding.
    target: EntityId,
    /// Cached forwarding getter from the entity's behavior surface.
    getter: Option<ForwardingFn>,
    /// The getter must be (re)fetched on the next delivery.
    needs_retry: bool,
}

/// Result of resolving forwarding ahead of one delivery.
pub(crate) struct ForwardingOutcome {
    /// The entity the node should act as for this delivery only.
    pub effective: EntityId,
    /// If set, deliver one `SetEntityId` presenting this entity before
    /// the main event (re-target or reversion notification).
    pub notify: Option<EntityId>,
}

/// One graph slot: the hosted node and its per-port state.
#[derive(Default)]
pub struct NodeSlot {
    node: Option<Box<dyn FlowNode>>,
    /// The node is temporarily checked out for event dispatch.
    in_flight: bool,
    /// Bumped every time the slot is freed, so a recycled id is never
    /// mistaken for its predecessor.
    serial: u32,
    type_name: String,
    name: String,
    inputs: Vec<PortValue>,
    input_configs: Vec<InputPortConfig>,
    output_configs: Vec<OutputPortConfig>,
    output_first_edge: Vec<usize>,
    flags: NodeFlags,
    forwarding: ForwardingState,
    initialized: bool,
}

impl NodeSlot {
    /// Install a node into this slot and derive its port state.
    pub(crate) fn occupy(&mut self, node: Box<dyn FlowNode>, name: String, type_name: String) {
        self.node = Some(node);
        self.in_flight = false;
        self.name = name;
        self.type_name = type_name;
        self.inputs.clear();
        self.input_configs.clear();
        self.output_configs.clear();
        self.output_first_edge.clear();
        self.forwarding = ForwardingState::default();
        self.initialized = false;
        self.configure();
    }

    /// Free the slot. The id may be recycled afterwards.
    pub(crate) fn free(&mut self) {
        self.node = None;
        self.in_flight = false;
        self.serial = self.serial.wrapping_add(1);
        self.name.clear();
        self.type_name.clear();
        self.inputs.clear();
        self.input_configs.clear();
        self.output_configs.clear();
        self.output_first_edge.clear();
        self.forwarding = ForwardingState::default();
        self.initialized = false;
    }

    /// Whether this slot currently hosts a node (including one checked
    /// out for dispatch).
    pub fn is_valid(&self) -> bool {
        self.node.is_some() || self.in_flight
    }

    pub(crate) fn serial(&self) -> u32 {
        self.serial
    }

    /// Check the node out for event dispatch.
    pub(crate) fn take_node(&mut self) -> Option<Box<dyn FlowNode>> {
        let node = self.node.take()?;
        self.in_flight = true;
        Some(node)
    }

    /// Return a checked-out node.
    pub(crate) fn put_node(&mut self, node: Box<dyn FlowNode>) {
        debug_assert!(self.node.is_none());
        self.node = Some(node);
        self.in_flight = false;
    }

    /// Immutable access to the hosted node, if present and not checked
    /// out.
    pub fn node(&self) -> Option<&dyn FlowNode> {
        self.node.as_deref()
    }

    /// The node's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    /// The node's type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Declared behavior flags, as of the last configuration.
    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    /// Re-read the node's declared configuration and rebuild the port
    /// arrays if either count changed.
    ///
    /// Implicit ports are prepended to the declared inputs: the
    /// entity-id port (locked against ordinary writes) when the node
    /// targets an entity, then the activation trigger when the node
    /// asks for one. Port values are rebuilt from declared defaults on
    /// any resize; old values are not preserved.
    pub(crate) fn configure(&mut self) {
        let Some(node) = self.node.as_deref() else {
            return;
        };
        let config = node.configuration();
        self.flags = config.flags;

        let mut input_configs = Vec::with_capacity(
            config.inputs.len() + usize::from(config.flags.targets_entity)
                + usize::from(config.flags.activation_input),
        );
        if config.flags.targets_entity {
            input_configs.push(InputPortConfig::new(ENTITY_PORT_NAME, ValueTag::Entity));
        }
        if config.flags.activation_input {
            input_configs.push(InputPortConfig::new(ACTIVATE_PORT_NAME, ValueTag::Any));
        }
        input_configs.extend(config.inputs);

        let output_count = if config.flags.dynamic_outputs {
            MAX_DYNAMIC_OUTPUTS
        } else {
            config.outputs.len()
        };

        if input_configs.len() != self.inputs.len() {
            self.inputs = input_configs
                .iter()
                .map(|c| PortValue::new(c.tag, c.default.as_ref()))
                .collect();
            if config.flags.targets_entity {
                self.inputs[0].lock();
            }
        }
        self.input_configs = input_configs;

        if output_count != self.output_first_edge.len() {
            self.output_first_edge = vec![NO_EDGE; output_count];
        }
        self.output_configs = config.outputs;
    }

    /// Number of effective input ports (implicit ports included).
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Number of effective output ports.
    pub fn output_count(&self) -> usize {
        self.output_first_edge.len()
    }

    /// Whether a port index is in range for the given direction.
    pub fn validate_port(&self, port: PortId, is_output: bool) -> bool {
        let index = port.index();
        if is_output {
            index < self.output_count()
        } else {
            index < self.input_count()
        }
    }

    /// Resolve a port name to its index.
    ///
    /// Matching is case-insensitive. If no declared name matches
    /// exactly, declared names carrying a legacy type prefix
    /// (`"type_name"`) are retried against the substring after the
    /// first underscore; such a match is logged as deprecated.
    /// Declared names starting with `t_` belong to a reserved port
    /// family and only ever match literally.
    pub fn resolve_port(&self, name: &str, is_output: bool) -> Option<PortId> {
        let exact = |candidate: &str| candidate.eq_ignore_ascii_case(name);
        let stripped = |candidate: &str| {
            if candidate.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("t_")) {
                return false;
            }
            match candidate.split_once('_') {
                Some((_, rest)) => rest.eq_ignore_ascii_case(name),
                None => false,
            }
        };

        let found = if is_output {
            self.output_configs
                .iter()
                .position(|c| exact(&c.name))
                .or_else(|| {
                    self.output_configs.iter().position(|c| stripped(&c.name)).inspect(|_| {
                        tracing::warn!(
                            node = %self.name,
                            port = name,
                            "resolved output port via legacy prefix stripping; use the full name"
                        );
                    })
                })
        } else {
            self.input_configs
                .iter()
                .position(|c| exact(&c.name))
                .or_else(|| {
                    self.input_configs.iter().position(|c| stripped(&c.name)).inspect(|_| {
                        tracing::warn!(
                            node = %self.name,
                            port = name,
                            "resolved input port via legacy prefix stripping; use the full name"
                        );
                    })
                })
        };
        found.map(|index| PortId(index as u16))
    }

    /// Declared name of a port, if it has one. Dynamic output ports
    /// beyond the declared list are unnamed.
    pub fn port_name(&self, port: PortId, is_output: bool) -> Option<&str> {
        if is_output {
            self.output_configs.get(port.index()).map(|c| c.name.as_str())
        } else {
            self.input_configs.get(port.index()).map(|c| c.name.as_str())
        }
    }

    /// Buffered value of an input port.
    pub fn input(&self, port: PortId) -> Option<&PortValue> {
        self.inputs.get(port.index())
    }

    /// All buffered input values, in port order.
    pub fn inputs(&self) -> &[PortValue] {
        &self.inputs
    }

    /// Write an input with conversion and flag it for delivery.
    ///
    /// Returns `false` if the port index is out of range or the write
    /// was rejected (locked port, no conversion).
    pub(crate) fn activate_input(&mut self, port: PortId, value: &Value) -> bool {
        let Some(slot) = self.inputs.get_mut(port.index()) else {
            return false;
        };
        if !slot.set(value) {
            return false;
        }
        slot.mark_written();
        true
    }

    /// Whether an input port has a write pending delivery.
    pub fn input_written(&self, port: PortId) -> bool {
        self.inputs.get(port.index()).is_some_and(PortValue::is_written)
    }

    /// Flag every input as written (initial state push).
    pub(crate) fn flag_all_inputs_written(&mut self) {
        for input in &mut self.inputs {
            input.mark_written();
        }
    }

    /// Consume all pending-write flags after a delivery.
    pub(crate) fn clear_written_flags(&mut self) {
        for input in &mut self.inputs {
            input.clear_written();
        }
    }

    pub(crate) fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    /// Whether the initial state push has been delivered.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether this node declared the implicit entity port.
    pub fn has_entity_port(&self) -> bool {
        self.flags.targets_entity && !self.inputs.is_empty()
    }

    /// The entity id literally stored on the entity port. Unaffected
    /// by forwarding.
    pub fn entity_id(&self) -> EntityId {
        if !self.has_entity_port() {
            return EntityId::NONE;
        }
        match self.inputs[0].value() {
            Value::Entity(id) => *id,
            _ => EntityId::NONE,
        }
    }

    /// Rebind the entity port.
    ///
    /// Unlocks the port, writes the id, flags it for delivery and
    /// re-locks it; the cached forwarding getter is dropped and marked
    /// for retry. Binding `EntityId::NONE` also clears the current
    /// forwarding target. Returns `false` if the node has no entity
    /// port.
    pub(crate) fn set_entity_id(&mut self, id: EntityId) -> bool {
        if !self.has_entity_port() {
            return false;
        }
        let port = &mut self.inputs[0];
        port.set_ignoring_lock(&Value::Entity(id));
        port.mark_written();

        self.forwarding.getter = None;
        self.forwarding.needs_retry = true;
        if id.is_none() {
            self.forwarding.target = EntityId::NONE;
        }
        true
    }

    /// The currently forwarded target, `NONE` while not forwarding.
    pub fn forwarding_target(&self) -> EntityId {
        self.forwarding.target
    }

    /// Run the forwarding state machine ahead of one delivery.
    ///
    /// The outcome's effective entity substitutes the node's bound
    /// entity for that delivery only. See the state machine notes on
    /// the crate root.
    pub(crate) fn resolve_forwarding(
        &mut self,
        resolver: &dyn EntityResolver,
    ) -> ForwardingOutcome {
        let bound = self.entity_id();
        if !self.has_entity_port() {
            return ForwardingOutcome { effective: EntityId::NONE, notify: None };
        }

        let mut notify = None;
        if self.forwarding.getter.is_some() || self.forwarding.needs_retry {
            if self.forwarding.needs_retry {
                if bound.is_none() || !resolver.entity_exists(bound) {
                    if !self.forwarding.target.is_none() && resolver.is_pooled(bound) {
                        // Bound entity is parked in a pool: keep the
                        // previous target and retry on a later
                        // delivery. Preserves continuity across
                        // save/load of pooled entities.
                    } else {
                        if !self.forwarding.target.is_none() {
                            notify = Some(bound);
                        }
                        self.forwarding.target = EntityId::NONE;
                        self.forwarding.getter = None;
                        self.forwarding.needs_retry = false;
                    }
                } else {
                    self.forwarding.getter = resolver.forwarding_getter(bound);
                    self.forwarding.needs_retry = false;
                    if self.forwarding.getter.is_none() && !self.forwarding.target.is_none() {
                        notify = Some(bound);
                        self.forwarding.target = EntityId::NONE;
                    }
                }
            }

            if let Some(getter) = self.forwarding.getter.clone() {
                match getter() {
                    Some(target) if !target.is_none() => {
                        if target != self.forwarding.target {
                            notify = Some(target);
                            self.forwarding.target = target;
                        }
                    }
                    _ => {
                        // Invocation failed: revert to not forwarding
                        // and tell the node once.
                        notify = Some(bound);
                        self.forwarding.target = EntityId::NONE;
                        self.forwarding.getter = None;
                    }
                }
            }
        }

        let effective =
            if self.forwarding.target.is_none() { bound } else { self.forwarding.target };
        ForwardingOutcome { effective, notify }
    }

    /// First edge index into the graph's sorted edge table for an
    /// output port. Only meaningful while the edge table is sorted.
    pub(crate) fn output_first_edge(&self, port: PortId) -> usize {
        self.output_first_edge.get(port.index()).copied().unwrap_or(NO_EDGE)
    }

    pub(crate) fn set_output_first_edge(&mut self, port: usize, edge_index: usize) {
        if let Some(slot) = self.output_first_edge.get_mut(port) {
            *slot = edge_index;
        }
    }

    /// Deep-copy this slot for a cloned graph.
    pub(crate) fn clone_for_graph(&self) -> NodeSlot {
        NodeSlot {
            node: self.node.as_ref().map(|n| n.clone_node()),
            in_flight: false,
            serial: self.serial,
            type_name: self.type_name.clone(),
            name: self.name.clone(),
            inputs: self.inputs.clone(),
            input_configs: self.input_configs.clone(),
            output_configs: self.output_configs.clone(),
            output_first_edge: self.output_first_edge.clone(),
            flags: self.flags,
            forwarding: ForwardingState {
                target: self.forwarding.target,
                getter: self.forwarding.getter.clone(),
                needs_retry: self.forwarding.needs_retry,
            },
            initialized: self.initialized,
        }
    }
}
