// SPDX-License-Identifier: MIT OR Apache-2.0
//! The node contract: configuration, events and the factory registry.
//!
//! A graph hosts values of `Box<dyn FlowNode>`. The engine never looks
//! inside a node; it only reads the declared configuration, delivers
//! events, and clones nodes when a graph is cloned. The concrete node
//! catalog is the host application's business.

use crate::graph::ActivationCtx;
use crate::value::{Value, ValueTag};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Upper bound on ports of a dynamic-output node. Such nodes always
/// report this many outputs so wiring can grow after deserialization
/// without reallocating the edge bookkeeping.
pub const MAX_DYNAMIC_OUTPUTS: usize = 64;

/// Events delivered to a node via [`FlowNode::process_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
    /// Initial state push, sent once after structural changes.
    Initialize,
    /// One or more input ports have been activated.
    Activate,
    /// Periodic tick, sent to nodes registered for regular updates.
    Update,
    /// The node's effective entity changed (rebind or forwarding).
    SetEntityId,
    /// The owning graph was suspended.
    Suspend,
    /// The owning graph was resumed.
    Resume,
}

/// Behavior flags a node declares in its configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    /// The node targets an entity; an implicit entity-id input port is
    /// prepended to its declared inputs.
    pub targets_entity: bool,
    /// The node wants an explicit activation-trigger input port.
    pub activation_input: bool,
    /// The node grows its output list at runtime; it always reports
    /// [`MAX_DYNAMIC_OUTPUTS`] outputs.
    pub dynamic_outputs: bool,
}

/// Declared input port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputPortConfig {
    /// Port name used for resolution (case-insensitive).
    pub name: String,
    /// Declared value type.
    pub tag: ValueTag,
    /// Default payload; the tag's default if absent.
    pub default: Option<Value>,
}

impl InputPortConfig {
    /// Declare an input port.
    pub fn new(name: impl Into<String>, tag: ValueTag) -> Self {
        Self { name: name.into(), tag, default: None }
    }

    /// Set the default payload.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Declared output port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPortConfig {
    /// Port name used for resolution (case-insensitive).
    pub name: String,
    /// Declared value type.
    pub tag: ValueTag,
}

impl OutputPortConfig {
    /// Declare an output port.
    pub fn new(name: impl Into<String>, tag: ValueTag) -> Self {
        Self { name: name.into(), tag }
    }
}

/// A node's declared port lists and flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Declared input ports, in port-index order.
    pub inputs: Vec<InputPortConfig>,
    /// Declared output ports, in port-index order.
    pub outputs: Vec<OutputPortConfig>,
    /// Behavior flags.
    pub flags: NodeFlags,
}

impl NodeConfig {
    /// Configuration with the given ports and default flags.
    pub fn new(inputs: Vec<InputPortConfig>, outputs: Vec<OutputPortConfig>) -> Self {
        Self { inputs, outputs, flags: NodeFlags::default() }
    }

    /// Set the behavior flags.
    pub fn with_flags(mut self, flags: NodeFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// The polymorphic unit of behavior hosted by a graph.
pub trait FlowNode {
    /// Declared ports and flags. Re-read whenever the slot is
    /// (re)configured; dynamic-output nodes may change their answer.
    fn configuration(&self) -> NodeConfig;

    /// Handle one event. The context exposes this node's buffered
    /// inputs, output activation, and the owning graph for re-entrant
    /// mutation.
    fn process_event(&mut self, event: FlowEvent, ctx: &mut ActivationCtx<'_>);

    /// Duplicate internal state. Required for dynamic-output nodes and
    /// any node hosted inside a cloned graph.
    fn clone_node(&self) -> Box<dyn FlowNode>;
}

/// Factory producing fresh instances of one node type.
pub type NodeFactory = Box<dyn Fn() -> Box<dyn FlowNode>>;

/// Registry of available node types, keyed by type name.
#[derive(Default)]
pub struct NodeRegistry {
    factories: IndexMap<String, NodeFactory>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { factories: IndexMap::new() }
    }

    /// Register a node type. Replaces any previous registration under
    /// the same name.
    pub fn register(&mut self, type_name: impl Into<String>, factory: NodeFactory) {
        self.factories.insert(type_name.into(), factory);
    }

    /// Whether a type is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Instantiate a node of the given type.
    pub fn create(&self, type_name: &str) -> Option<Box<dyn FlowNode>> {
        self.factories.get(type_name).map(|f| f())
    }

    /// Registered type names, in registration order.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

/// Veto hook consulted when nodes are created in a graph.
pub trait GraphHook {
    /// Called after a node is constructed but before it is installed.
    /// Returning `false` vetoes the creation.
    fn created_node(&mut self, id: crate::graph::NodeId, name: &str, type_name: &str) -> bool;

    /// Called for hooks that already accepted a creation which a later
    /// hook vetoed.
    fn cancel_created_node(
        &mut self,
        _id: crate::graph::NodeId,
        _name: &str,
        _type_name: &str,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    impl FlowNode for Probe {
        fn configuration(&self) -> NodeConfig {
            NodeConfig::new(
                vec![InputPortConfig::new("in", ValueTag::Int).with_default(Value::Int(9))],
                vec![OutputPortConfig::new("out", ValueTag::Int)],
            )
        }

        fn process_event(&mut self, _event: FlowEvent, _ctx: &mut ActivationCtx<'_>) {}

        fn clone_node(&self) -> Box<dyn FlowNode> {
            Box::new(Probe)
        }
    }

    #[test]
    fn test_registry_create() {
        let mut registry = NodeRegistry::new();
        registry.register("test:probe", Box::new(|| Box::new(Probe)));

        assert!(registry.contains("test:probe"));
        assert!(!registry.contains("test:missing"));

        let node = registry.create("test:probe").unwrap();
        let config = node.configuration();
        assert_eq!(config.inputs.len(), 1);
        assert_eq!(config.inputs[0].default, Some(Value::Int(9)));
        assert_eq!(config.outputs[0].name, "out");
    }

    #[test]
    fn test_registry_order() {
        let mut registry = NodeRegistry::new();
        registry.register("b", Box::new(|| Box::new(Probe)));
        registry.register("a", Box::new(|| Box::new(Probe)));
        let names: Vec<_> = registry.type_names().collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
