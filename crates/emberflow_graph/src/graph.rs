// SPDX-License-Identifier: MIT OR Apache-2.0
//! The graph container and activation scheduler.
//!
//! A [`FlowGraph`] owns a table of [`NodeSlot`]s indexed by recycled
//! 16-bit ids, an edge table kept sorted for contiguous fan-out scans,
//! and the dirty-node worklists that drive [`FlowGraph::update`]. The
//! scheduler is single-threaded and runs each update to a fixed point;
//! re-entrancy (a node mutating the graph from inside its own event
//! handler) is handled by double-buffered worklists, per-slot serial
//! numbers and worklist scrubbing on removal, never by locks.

use crate::entity::{EntityId, EntityResolver, NullEntityResolver};
use crate::node::{FlowEvent, FlowNode, GraphHook, NodeRegistry};
use crate::observer::{ActivationObserver, EdgeVerdict};
use crate::slot::NodeSlot;
use crate::value::{PortValue, Value};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use thiserror::Error;

/// Sweep iterations per update before the remainder is deferred to the
/// next update with a warning. A graph that keeps re-dirtying itself
/// past this is a caller bug, not a scheduler failure.
const MAX_SWEEP_LOOPS: usize = 256;

/// Identifier of a node within one graph. Stable while the node
/// exists; recycled through a free list after removal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u16);

impl NodeId {
    /// The id as a table index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Index of a port on a node, in declared order (implicit ports
/// first for inputs).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PortId(pub u16);

impl PortId {
    /// The id as an array index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Fully-qualified port address within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortAddr {
    /// Owning node.
    pub node: NodeId,
    /// Port index on that node.
    pub port: PortId,
    /// Direction: outputs are edge sources, inputs are edge sinks.
    pub is_output: bool,
}

impl PortAddr {
    /// Address an output port.
    pub fn output(node: NodeId, port: PortId) -> Self {
        Self { node, port, is_output: true }
    }

    /// Address an input port.
    pub fn input(node: NodeId, port: PortId) -> Self {
        Self { node, port, is_output: false }
    }
}

/// A directed wire from an output port to an input port.
///
/// The derived ordering (`from_node`, `from_port`, `to_node`,
/// `to_port`) is the edge table's sort order and therefore the fan-out
/// delivery order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Edge {
    /// Source node.
    pub from_node: NodeId,
    /// Source output port.
    pub from_port: PortId,
    /// Destination node.
    pub to_node: NodeId,
    /// Destination input port.
    pub to_port: PortId,
}

impl Edge {
    fn involves(&self, id: NodeId) -> bool {
        self.from_node == id || self.to_node == id
    }
}

/// Error creating a node.
#[derive(Debug, Error)]
pub enum CreateNodeError {
    /// The type name is not registered.
    #[error("unknown node type: {0}")]
    UnknownType(String),
    /// Another node already carries this name.
    #[error("duplicate node name: {0}")]
    DuplicateName(String),
    /// All 16-bit ids are in use.
    #[error("node id space exhausted")]
    IdSpaceExhausted,
    /// A registered creation hook vetoed the node.
    #[error("node creation vetoed by hook")]
    Vetoed,
}

/// Error linking or unlinking two ports.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Both addresses point the same direction.
    #[error("cannot link two ports of the same direction")]
    SameDirection,
    /// An address does not resolve to a live node and in-range port.
    #[error("invalid address {0:?}")]
    InvalidAddress(PortAddr),
    /// The edge to unlink does not exist.
    #[error("link not found")]
    NotFound,
}

/// Context handed to a node while it processes an event.
///
/// Exposes the node's buffered inputs, typed output activation, and
/// the owning graph itself: handlers may create or remove nodes,
/// re-wire edges and activate ports re-entrantly.
pub struct ActivationCtx<'a> {
    graph: &'a mut FlowGraph,
    node_id: NodeId,
    entity_id: EntityId,
}

impl ActivationCtx<'_> {
    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The entity this delivery acts as: the bound entity, or the
    /// forwarded target if forwarding resolved.
    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    /// The owning graph, for re-entrant mutation.
    pub fn graph(&mut self) -> &mut FlowGraph {
        self.graph
    }

    /// Buffered value of one of this node's input ports.
    pub fn input(&self, port: PortId) -> Option<&PortValue> {
        self.graph.slot(self.node_id)?.input(port)
    }

    /// Whether an input port was written since the last delivery.
    pub fn is_port_active(&self, port: PortId) -> bool {
        self.graph.slot(self.node_id).is_some_and(|s| s.input_written(port))
    }

    /// Activate one of this node's own output ports. Fans out
    /// immediately; downstream nodes are delivered on the next sweep
    /// round.
    pub fn activate_output(&mut self, port: PortId, value: impl Into<Value>) {
        let addr = PortAddr::output(self.node_id, port);
        self.graph.perform_activation(addr, &value.into());
    }

    /// Ask for one deferred activation at the very end of this update.
    pub fn request_final_activation(&mut self) {
        self.graph.request_final_activation(self.node_id);
    }

    /// Subscribe or unsubscribe this node from the per-update tick.
    pub fn set_regularly_updated(&mut self, updated: bool) {
        self.graph.set_regularly_updated(self.node_id, updated);
    }
}

/// A flow graph: node table, sorted edge table and activation
/// scheduler.
pub struct FlowGraph {
    registry: Rc<NodeRegistry>,
    resolver: Rc<dyn EntityResolver>,
    slots: Vec<NodeSlot>,
    free_ids: Vec<NodeId>,
    name_to_id: IndexMap<String, NodeId>,
    edges: Vec<Edge>,
    edges_sorted: bool,
    /// Nodes awaiting delivery next sweep round, in insertion order.
    dirty: IndexSet<NodeId>,
    /// Nodes being delivered this sweep round (double buffer).
    activating: IndexSet<NodeId>,
    /// Nodes to activate once at the very end of the update.
    final_activating: IndexSet<NodeId>,
    /// Values that arrived for a port whose previous write was still
    /// undelivered. Replayed in FIFO order, one value per port per
    /// round, so every value produces its own activation.
    cached_activations: HashMap<NodeId, VecDeque<(PortId, Value)>>,
    regular_updates: Vec<NodeId>,
    hooks: Vec<Box<dyn GraphHook>>,
    observer: Option<Box<dyn ActivationObserver>>,
    enabled: bool,
    active: bool,
    suspended: bool,
    needs_update: bool,
    needs_initialize: bool,
    in_update: bool,
}

impl FlowGraph {
    /// Create a graph with no entity system attached.
    pub fn new(registry: Rc<NodeRegistry>) -> Self {
        Self::with_entity_resolver(registry, Rc::new(NullEntityResolver))
    }

    /// Create a graph wired to a host entity system.
    pub fn with_entity_resolver(
        registry: Rc<NodeRegistry>,
        resolver: Rc<dyn EntityResolver>,
    ) -> Self {
        Self {
            registry,
            resolver,
            slots: Vec::new(),
            free_ids: Vec::new(),
            name_to_id: IndexMap::new(),
            edges: Vec::new(),
            edges_sorted: true,
            dirty: IndexSet::new(),
            activating: IndexSet::new(),
            final_activating: IndexSet::new(),
            cached_activations: HashMap::new(),
            regular_updates: Vec::new(),
            hooks: Vec::new(),
            observer: None,
            enabled: true,
            active: true,
            suspended: false,
            needs_update: false,
            needs_initialize: false,
            in_update: false,
        }
    }

    // ---- node table -----------------------------------------------

    /// Create a node of a registered type under a unique name.
    pub fn create_node(&mut self, type_name: &str, name: &str) -> Result<NodeId, CreateNodeError> {
        if self.name_to_id.contains_key(name) {
            tracing::warn!(name, "node name already in use");
            return Err(CreateNodeError::DuplicateName(name.to_owned()));
        }
        let Some(node) = self.registry.create(type_name) else {
            tracing::warn!(type_name, name, "unknown node type");
            return Err(CreateNodeError::UnknownType(type_name.to_owned()));
        };
        let Some(id) = self.allocate_id() else {
            tracing::warn!(name, "node id space exhausted");
            return Err(CreateNodeError::IdSpaceExhausted);
        };

        for i in 0..self.hooks.len() {
            if !self.hooks[i].created_node(id, name, type_name) {
                for j in 0..i {
                    self.hooks[j].cancel_created_node(id, name, type_name);
                }
                self.release_id(id);
                return Err(CreateNodeError::Vetoed);
            }
        }

        self.slots[id.index()].occupy(node, name.to_owned(), type_name.to_owned());
        self.name_to_id.insert(name.to_owned(), id);
        self.edges_sorted = false;
        self.needs_initialize = true;
        self.needs_update = true;
        Ok(id)
    }

    /// Remove a node and every edge touching it. The id is returned to
    /// the free pool and scrubbed from every worklist, so the node is
    /// never delivered another event, even if removal happens
    /// mid-sweep.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        if !self.validate_node(id) {
            tracing::warn!(id = id.0, "trying to remove non-existent node");
            return false;
        }
        self.edges.retain(|e| !e.involves(id));
        self.edges_sorted = false;

        self.name_to_id.shift_remove(self.slots[id.index()].name());
        self.slots[id.index()].free();
        self.free_ids.push(id);

        self.dirty.shift_remove(&id);
        self.activating.shift_remove(&id);
        self.final_activating.shift_remove(&id);
        self.cached_activations.remove(&id);
        self.regular_updates.retain(|&r| r != id);
        true
    }

    /// Remove a node by name.
    pub fn remove_node_by_name(&mut self, name: &str) -> bool {
        match self.name_to_id.get(name) {
            Some(&id) => self.remove_node(id),
            None => {
                tracing::warn!(name, "no node with that name");
                false
            }
        }
    }

    /// Rename a node. Fails if the new name is taken.
    pub fn set_node_name(&mut self, id: NodeId, name: &str) -> bool {
        if !self.validate_node(id) {
            return false;
        }
        if self.name_to_id.contains_key(name) {
            tracing::warn!(name, "cannot rename node: name already in use");
            return false;
        }
        self.name_to_id.shift_remove(self.slots[id.index()].name());
        self.slots[id.index()].set_name(name.to_owned());
        self.name_to_id.insert(name.to_owned(), id);
        true
    }

    /// Register a creation veto hook.
    pub fn register_hook(&mut self, hook: Box<dyn GraphHook>) {
        self.hooks.push(hook);
    }

    /// Whether an id refers to a live node.
    pub fn validate_node(&self, id: NodeId) -> bool {
        self.slots.get(id.index()).is_some_and(NodeSlot::is_valid)
    }

    /// Whether an address refers to a live node and in-range port.
    pub fn validate_address(&self, addr: PortAddr) -> bool {
        self.validate_node(addr.node)
            && self.slots[addr.node.index()].validate_port(addr.port, addr.is_output)
    }

    /// The slot for a live node.
    pub fn slot(&self, id: NodeId) -> Option<&NodeSlot> {
        self.slots.get(id.index()).filter(|s| s.is_valid())
    }

    /// Look up a node by name.
    pub fn resolve_node(&self, name: &str) -> Option<NodeId> {
        self.name_to_id.get(name).copied()
    }

    /// Resolve a `"node:port"` specifier to an address.
    pub fn resolve_address(&self, spec: &str, is_output: bool) -> Option<PortAddr> {
        let (node_name, port_name) = spec.split_once(':')?;
        self.resolve_node_port(node_name, port_name, is_output)
    }

    /// Resolve a node name and port name to an address.
    pub fn resolve_node_port(
        &self,
        node_name: &str,
        port_name: &str,
        is_output: bool,
    ) -> Option<PortAddr> {
        let node = self.resolve_node(node_name)?;
        let port = self.slots[node.index()].resolve_port(port_name, is_output)?;
        Some(PortAddr { node, port, is_output })
    }

    /// Human-readable `"node:port"` form of an address.
    pub fn pretty_address(&self, addr: PortAddr) -> String {
        match self.slot(addr.node) {
            Some(slot) => format!(
                "{}:{}",
                slot.name(),
                slot.port_name(addr.port, addr.is_output).unwrap_or("?")
            ),
            None => format!("<dead {}>:{}", addr.node.0, addr.port.0),
        }
    }

    /// Ids of all live nodes, in table order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_valid())
            .map(|(i, _)| NodeId(i as u16))
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_valid()).count()
    }

    fn allocate_id(&mut self) -> Option<NodeId> {
        if let Some(id) = self.free_ids.pop() {
            return Some(id);
        }
        if self.slots.len() >= usize::from(u16::MAX) {
            return None;
        }
        let id = NodeId(self.slots.len() as u16);
        self.slots.push(NodeSlot::default());
        Some(id)
    }

    fn release_id(&mut self, id: NodeId) {
        self.slots[id.index()].free();
        self.free_ids.push(id);
    }

    // ---- edges ----------------------------------------------------

    /// Insert an edge from an output to an input port.
    ///
    /// Reversed addresses are fixed up with a warning, matching how
    /// hand-edited graph files have historically been tolerated.
    pub fn link_nodes(&mut self, from: PortAddr, to: PortAddr) -> Result<(), LinkError> {
        let (from, to) = self.validate_link(from, to)?;
        self.edges.push(Edge {
            from_node: from.node,
            from_port: from.port,
            to_node: to.node,
            to_port: to.port,
        });
        self.edges_sorted = false;
        self.needs_initialize = true;
        self.needs_update = true;
        Ok(())
    }

    /// Remove the edge between two ports.
    pub fn unlink_nodes(&mut self, from: PortAddr, to: PortAddr) -> Result<(), LinkError> {
        let (from, to) = self.validate_link(from, to)?;
        self.ensure_sorted_edges();
        let probe = Edge {
            from_node: from.node,
            from_port: from.port,
            to_node: to.node,
            to_port: to.port,
        };
        match self.edges.binary_search(&probe) {
            Ok(index) => {
                self.edges.remove(index);
                self.edges_sorted = false;
                Ok(())
            }
            Err(_) => {
                tracing::warn!("link not found");
                Err(LinkError::NotFound)
            }
        }
    }

    fn validate_link(
        &self,
        mut from: PortAddr,
        mut to: PortAddr,
    ) -> Result<(PortAddr, PortAddr), LinkError> {
        if from.is_output == to.is_output {
            tracing::warn!(output = from.is_output, "attempt to link two same-direction ports");
            return Err(LinkError::SameDirection);
        }
        if !from.is_output {
            tracing::warn!("link given input-first; reversing");
            std::mem::swap(&mut from, &mut to);
        }
        if !self.validate_address(from) {
            return Err(LinkError::InvalidAddress(from));
        }
        if !self.validate_address(to) {
            return Err(LinkError::InvalidAddress(to));
        }
        Ok((from, to))
    }

    /// All edges. Sorted only after the last mutation has been
    /// followed by a sweep or an explicit sort.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    fn ensure_sorted_edges(&mut self) {
        if !self.edges_sorted {
            self.sort_edges();
        }
    }

    fn sort_edges(&mut self) {
        self.edges.sort_unstable();
        self.edges.dedup();

        for index in 0..self.slots.len() {
            if !self.slots[index].is_valid() {
                continue;
            }
            let node = NodeId(index as u16);
            for port in 0..self.slots[index].output_count() {
                let key = (node, PortId(port as u16));
                let first = self
                    .edges
                    .partition_point(|e| (e.from_node, e.from_port) < key);
                self.slots[index].set_output_first_edge(port, first);
            }
        }
        self.edges_sorted = true;
    }

    // ---- values and entities --------------------------------------

    /// Activate an output port with a typed value (external entry
    /// point).
    pub fn activate_port(&mut self, addr: PortAddr, value: impl Into<Value>) {
        self.perform_activation(addr, &value.into());
    }

    /// Activate an output port with an already-tagged value.
    pub fn activate_port_any(&mut self, addr: PortAddr, value: &Value) {
        self.perform_activation(addr, value);
    }

    /// Write an input port directly, bypassing edge fan-out, and mark
    /// the node for delivery. Used by deserialization and script
    /// bindings.
    pub fn set_input_value(&mut self, node: NodeId, port: PortId, value: &Value) -> bool {
        if !self.validate_address(PortAddr::input(node, port)) {
            return false;
        }
        if !self.slots[node.index()].activate_input(port, value) {
            return false;
        }
        self.mark_dirty(node);
        true
    }

    /// Read an input port's buffered value.
    pub fn input_value(&self, node: NodeId, port: PortId) -> Option<&PortValue> {
        self.slot(node)?.input(port)
    }

    /// Rebind a node's entity port and schedule a delivery.
    pub fn set_entity_id(&mut self, node: NodeId, entity: EntityId) -> bool {
        if !self.validate_node(node) {
            return false;
        }
        if self.slots[node.index()].set_entity_id(entity) {
            self.mark_dirty(node);
            true
        } else {
            false
        }
    }

    /// The entity id literally bound to a node (unaffected by
    /// forwarding).
    pub fn entity_id(&self, node: NodeId) -> EntityId {
        self.slot(node).map_or(EntityId::NONE, NodeSlot::entity_id)
    }

    // ---- scheduler state ------------------------------------------

    /// Mark a node dirty: it will be delivered in the next sweep
    /// round.
    pub fn mark_dirty(&mut self, id: NodeId) {
        if !self.validate_node(id) {
            return;
        }
        self.dirty.insert(id);
        self.needs_update = true;
    }

    /// Request one deduplicated activation at the end of the current
    /// update. Only meaningful from inside an event handler.
    pub fn request_final_activation(&mut self, id: NodeId) {
        debug_assert!(self.in_update);
        if self.validate_node(id) {
            self.final_activating.insert(id);
        }
    }

    /// Subscribe or unsubscribe a node from the per-update tick.
    pub fn set_regularly_updated(&mut self, id: NodeId, updated: bool) {
        if updated {
            if !self.regular_updates.contains(&id) {
                self.regular_updates.push(id);
            }
            self.needs_update = true;
        } else {
            self.regular_updates.retain(|&r| r != id);
        }
    }

    /// Enable or disable the graph. A disabled graph neither updates
    /// nor propagates.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if enabled {
            self.needs_update = true;
        }
    }

    /// Whether the graph is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Activate or deactivate the graph. Like enable, but intended for
    /// the host's lifecycle (e.g. level visibility) rather than user
    /// toggling.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
        if active {
            self.needs_update = true;
        }
    }

    /// Whether the graph is active.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Suspend or resume the graph, broadcasting the transition to all
    /// nodes.
    pub fn set_suspended(&mut self, suspended: bool) {
        if self.suspended == suspended {
            return;
        }
        self.suspended = suspended;
        let event = if suspended { FlowEvent::Suspend } else { FlowEvent::Resume };
        let ids: Vec<NodeId> = self.node_ids().collect();
        for id in ids {
            self.dispatch_node_event(id, event);
        }
        if !suspended {
            self.needs_update = true;
        }
    }

    /// Whether the graph is suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    // ---- observer -------------------------------------------------

    /// Attach the activation observer, replacing any previous one.
    pub fn set_observer(&mut self, observer: Box<dyn ActivationObserver>) {
        self.observer = Some(observer);
    }

    /// Detach and return the observer.
    pub fn clear_observer(&mut self) -> Option<Box<dyn ActivationObserver>> {
        self.observer.take()
    }

    /// Run a closure against the observer and the graph together. The
    /// observer is temporarily detached so the closure may drive the
    /// graph (the debugger's resume path).
    pub fn with_observer<R>(
        &mut self,
        f: impl FnOnce(&mut dyn ActivationObserver, &mut FlowGraph) -> R,
    ) -> Option<R> {
        let mut observer = self.observer.take()?;
        let result = f(observer.as_mut(), self);
        self.observer = Some(observer);
        Some(result)
    }

    fn observe_intercept(&mut self, from: PortAddr, value: &Value) -> bool {
        match self.observer.take() {
            Some(mut obs) => {
                let intercepted = obs.intercept(self, from, value);
                self.observer = Some(obs);
                intercepted
            }
            None => false,
        }
    }

    fn observe_edge(
        &mut self,
        from: PortAddr,
        to: PortAddr,
        edge_index: usize,
        value: &Value,
    ) -> EdgeVerdict {
        match self.observer.take() {
            Some(mut obs) => {
                let verdict = obs.on_edge(self, from, to, edge_index, value);
                self.observer = Some(obs);
                verdict
            }
            None => EdgeVerdict::Continue,
        }
    }

    fn observe_terminal(&mut self, from: PortAddr, value: &Value) {
        if let Some(mut obs) = self.observer.take() {
            obs.on_terminal(self, from, value);
            self.observer = Some(obs);
        }
    }

    // ---- propagation ----------------------------------------------

    /// Fan an output-port value out along the sorted edge span.
    ///
    /// Destinations whose previous write is still awaiting delivery
    /// get the new value appended to their activation queue instead of
    /// overwritten, preserving one discrete activation per value.
    pub fn perform_activation(&mut self, from: PortAddr, value: &Value) {
        if !self.enabled || !self.active {
            return;
        }
        debug_assert!(from.is_output);
        if !self.validate_address(from) {
            tracing::warn!(node = from.node.0, port = from.port.0, "activating invalid address");
            return;
        }
        if self.observe_intercept(from, value) {
            return;
        }
        self.ensure_sorted_edges();
        let first = self.slots[from.node.index()].output_first_edge(from.port);
        self.walk_edges(from, value, first, true);
    }

    /// Re-walk an edge span from a stored edge index, for observer
    /// replay after a halt. Does not re-run the intercept step.
    pub fn resume_from(&mut self, from: PortAddr, value: &Value, start_edge: usize) {
        if !self.enabled || !self.active {
            return;
        }
        self.ensure_sorted_edges();
        self.walk_edges(from, value, start_edge, false);
    }

    fn walk_edges(&mut self, from: PortAddr, value: &Value, first: usize, notify_terminal: bool) {
        let mut index = first;
        let mut delivered = false;
        while index < self.edges.len() {
            let edge = self.edges[index];
            if edge.from_node != from.node || edge.from_port != from.port {
                break;
            }
            let to = PortAddr::input(edge.to_node, edge.to_port);
            if self.observe_edge(from, to, index, value) == EdgeVerdict::Halt {
                return;
            }
            self.deliver_edge(edge, value);
            delivered = true;
            index += 1;
        }
        if !delivered && notify_terminal {
            self.observe_terminal(from, value);
        }
    }

    fn deliver_edge(&mut self, edge: Edge, value: &Value) {
        if !self.validate_node(edge.to_node) {
            return;
        }
        let awaiting_delivery =
            self.dirty.contains(&edge.to_node) || self.activating.contains(&edge.to_node);
        if awaiting_delivery && self.slots[edge.to_node.index()].input_written(edge.to_port) {
            self.cached_activations
                .entry(edge.to_node)
                .or_default()
                .push_back((edge.to_port, value.clone()));
            return;
        }
        if self.slots[edge.to_node.index()].activate_input(edge.to_port, value) {
            self.mark_dirty(edge.to_node);
        }
    }

    // ---- update ---------------------------------------------------

    /// Run the activation scheduler to a fixed point.
    ///
    /// Sweeps the dirty list (re-sweeping as long as deliveries dirty
    /// more nodes), then runs the deduplicated final-activation pass.
    /// Returns immediately if nothing is pending or the graph is
    /// disabled, inactive or suspended.
    pub fn update(&mut self) {
        if !self.enabled || !self.active || self.suspended || !self.needs_update {
            return;
        }
        if self.in_update {
            return;
        }
        if self.needs_initialize {
            self.initialize_values();
        }

        self.in_update = true;
        let ticking = self.regular_updates.clone();
        for id in ticking {
            self.dispatch_node_event(id, FlowEvent::Update);
        }

        self.do_update(FlowEvent::Activate);

        self.needs_update = !self.dirty.is_empty() || !self.regular_updates.is_empty();
        self.in_update = false;
    }

    /// Push initial state: every node gets all inputs flagged and an
    /// `Initialize` sweep, ignoring the usual already-written
    /// coalescing.
    fn initialize_values(&mut self) {
        self.flush_pending();
        if self.suspended || !self.active || !self.enabled {
            return;
        }
        self.in_update = true;
        for index in 0..self.slots.len() {
            if !self.slots[index].is_valid() {
                continue;
            }
            self.slots[index].flag_all_inputs_written();
            self.dirty.insert(NodeId(index as u16));
        }
        self.do_update(FlowEvent::Initialize);
        self.needs_initialize = false;
        self.in_update = false;
    }

    /// Drop all pending activations without delivering them.
    fn flush_pending(&mut self) {
        let pending: Vec<NodeId> = self.dirty.drain(..).chain(self.activating.drain(..)).collect();
        for id in pending {
            if id.index() < self.slots.len() {
                self.slots[id.index()].clear_written_flags();
            }
        }
        self.final_activating.clear();
        self.cached_activations.clear();
    }

    fn do_update(&mut self, event: FlowEvent) {
        let mut loops = 0;
        while !self.dirty.is_empty() {
            loops += 1;
            if loops > MAX_SWEEP_LOOPS {
                tracing::warn!(
                    loops = MAX_SWEEP_LOOPS,
                    "sweep iteration cap reached; deferring remaining activations"
                );
                if event == FlowEvent::Initialize {
                    // Leftover initialize-time activations must not
                    // leak into the next update under a different
                    // event.
                    self.flush_pending();
                }
                break;
            }
            debug_assert!(self.activating.is_empty());
            std::mem::swap(&mut self.activating, &mut self.dirty);

            while let Some(id) = pop_front(&mut self.activating) {
                self.dispatch_activation(id, event);
            }
        }

        while let Some(id) = pop_front(&mut self.final_activating) {
            self.dispatch_activation(id, FlowEvent::Activate);
        }

        if !self.dirty.is_empty() {
            self.needs_update = true;
        }
    }

    /// Deliver one activation to a node, then replay its queued
    /// multi-activations (one value per port per round, each
    /// re-dirtying the node so every value gets its own delivery).
    fn dispatch_activation(&mut self, id: NodeId, event: FlowEvent) {
        self.dispatch_node_event(id, event);

        let Some(mut queue) = self.cached_activations.remove(&id) else {
            return;
        };
        let mut touched: Vec<PortId> = Vec::new();
        while let Some((port, value)) = queue.pop_front() {
            if touched.contains(&port) {
                queue.push_front((port, value));
                break;
            }
            if self.validate_node(id) && self.slots[id.index()].activate_input(port, &value) {
                self.mark_dirty(id);
            }
            touched.push(port);
        }
        if !queue.is_empty() && self.validate_node(id) {
            self.cached_activations.insert(id, queue);
        }
    }

    /// Deliver one event through the full protocol: resolve
    /// forwarding, deliver pending entity-change notifications, then
    /// the main event, then consume the written flags.
    ///
    /// The node is checked out of its slot for the duration so the
    /// handler can re-enter the graph; it is only checked back in if
    /// the slot still belongs to it (same serial), which is what makes
    /// mid-sweep self-removal safe.
    fn dispatch_node_event(&mut self, id: NodeId, event: FlowEvent) {
        if !self.validate_node(id) {
            return;
        }
        let index = id.index();
        let Some(mut node) = self.slots[index].take_node() else {
            // Already checked out: re-entrant delivery to the node
            // currently being processed is not supported.
            return;
        };
        let serial = self.slots[index].serial();
        let resolver = Rc::clone(&self.resolver);
        let outcome = self.slots[index].resolve_forwarding(resolver.as_ref());

        if let Some(presented) = outcome.notify {
            let mut ctx = ActivationCtx { graph: self, node_id: id, entity_id: presented };
            node.process_event(FlowEvent::SetEntityId, &mut ctx);
        }

        let ordinary = matches!(event, FlowEvent::Activate | FlowEvent::Initialize);
        if ordinary
            && self.slot_owned_by(id, serial)
            && self.slots[index].has_entity_port()
            && self.slots[index].input_written(PortId(0))
        {
            let mut ctx =
                ActivationCtx { graph: self, node_id: id, entity_id: outcome.effective };
            node.process_event(FlowEvent::SetEntityId, &mut ctx);
        }

        if self.slot_owned_by(id, serial) {
            let mut ctx =
                ActivationCtx { graph: self, node_id: id, entity_id: outcome.effective };
            node.process_event(event, &mut ctx);
        }

        if self.slot_owned_by(id, serial) {
            let slot = &mut self.slots[index];
            if ordinary {
                slot.clear_written_flags();
            }
            if event == FlowEvent::Initialize {
                slot.mark_initialized();
            }
            slot.put_node(node);
        }
        // Slot freed mid-dispatch: the node is dropped here and the id
        // may be recycled without ever aliasing it.
    }

    fn slot_owned_by(&self, id: NodeId, serial: u32) -> bool {
        self.slots.get(id.index()).is_some_and(|s| s.is_valid() && s.serial() == serial)
    }

    // ---- cloning --------------------------------------------------

    /// Deep-copy this graph: nodes are duplicated via their `Clone`
    /// contract, edges and scheduler state are carried over. Hooks and
    /// the observer are not cloned.
    pub fn clone_graph(&self) -> FlowGraph {
        FlowGraph {
            registry: Rc::clone(&self.registry),
            resolver: Rc::clone(&self.resolver),
            slots: self.slots.iter().map(NodeSlot::clone_for_graph).collect(),
            free_ids: self.free_ids.clone(),
            name_to_id: self.name_to_id.clone(),
            edges: self.edges.clone(),
            edges_sorted: self.edges_sorted,
            dirty: self.dirty.clone(),
            activating: IndexSet::new(),
            final_activating: self.final_activating.clone(),
            cached_activations: self.cached_activations.clone(),
            regular_updates: self.regular_updates.clone(),
            hooks: Vec::new(),
            observer: None,
            enabled: self.enabled,
            active: self.active,
            suspended: self.suspended,
            needs_update: self.needs_update,
            needs_initialize: self.needs_initialize,
            in_update: false,
        }
    }
}

fn pop_front(set: &mut IndexSet<NodeId>) -> Option<NodeId> {
    let id = *set.get_index(0)?;
    set.shift_remove_index(0);
    Some(id)
}
