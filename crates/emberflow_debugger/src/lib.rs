// SPDX-License-Identifier: MIT OR Apache-2.0
//! Interactive debugger for flow graphs.
//!
//! [`FlowDebugger`] is an [`ActivationObserver`]: installed on a graph
//! it watches every edge traversal, halts propagation at breakpoints
//! and queues any activation that arrives while halted. Resuming
//! replays the halted edge, walks the rest of its span and then
//! re-plays the queued activations in arrival order, so debugging
//! never drops or reorders values.
//!
//! Breakpoints sit on ports. An input-port breakpoint fires when an
//! edge is about to deliver into that port; an output-port breakpoint
//! fires once per activation, on the first edge of the port's fan-out
//! span. A breakpoint flagged as a tracepoint never halts: it reports
//! the value to the [`DebugListener`] and lets propagation continue.

use emberflow_graph::{
    ActivationObserver, EdgeVerdict, FlowGraph, PortAddr, Value,
};
use indexmap::IndexMap;
use std::any::Any;
use std::collections::VecDeque;

/// Per-port breakpoint settings.
#[derive(Debug, Clone, Copy)]
pub struct Breakpoint {
    /// Disabled breakpoints are kept but never fire.
    pub enabled: bool,
    /// Tracepoints report instead of halting.
    pub tracepoint: bool,
}

impl Default for Breakpoint {
    fn default() -> Self {
        Self { enabled: true, tracepoint: false }
    }
}

/// Everything known about the propagation step the debugger halted on.
#[derive(Debug, Clone)]
pub struct HaltInfo {
    /// The activated output port.
    pub from: PortAddr,
    /// The input port the halted edge would have delivered into.
    pub to: PortAddr,
    /// The breakpoint that fired (either `from` or `to`).
    pub breakpoint: PortAddr,
    /// Index of the halted edge in the graph's edge table.
    pub edge_index: usize,
    /// The value in flight.
    pub value: Value,
}

/// Host-side sink for debugger notifications.
pub trait DebugListener {
    /// A breakpoint fired and propagation is now halted.
    fn on_break(&mut self, info: &HaltInfo);

    /// A tracepoint saw a value pass through.
    fn on_trace(&mut self, breakpoint: PortAddr, value: &Value) {
        let _ = (breakpoint, value);
    }

    /// The halted propagation is about to be replayed.
    fn on_resume(&mut self, info: &HaltInfo) {
        let _ = info;
    }
}

enum DebugState {
    Idle,
    /// Replaying a previously halted edge; the matching `on_edge` call
    /// passes through without re-checking breakpoints.
    Resuming { from: PortAddr, edge_index: usize },
    Halted(HaltInfo),
}

/// Breakpoint debugger, installed on a graph via
/// [`FlowGraph::set_observer`].
pub struct FlowDebugger {
    breakpoints: IndexMap<PortAddr, Breakpoint>,
    state: DebugState,
    /// Activations that arrived while halted, in arrival order.
    delayed: VecDeque<(PortAddr, Value)>,
    listener: Option<Box<dyn DebugListener>>,
}

impl Default for FlowDebugger {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowDebugger {
    /// Debugger with no breakpoints and no listener.
    pub fn new() -> Self {
        Self {
            breakpoints: IndexMap::new(),
            state: DebugState::Idle,
            delayed: VecDeque::new(),
            listener: None,
        }
    }

    /// Debugger reporting to the given listener.
    pub fn with_listener(listener: Box<dyn DebugListener>) -> Self {
        Self { listener: Some(listener), ..Self::new() }
    }

    // ---- breakpoint management ------------------------------------

    /// Set a halting breakpoint on a port. Replaces existing settings.
    pub fn set_breakpoint(&mut self, addr: PortAddr) {
        self.breakpoints.insert(addr, Breakpoint::default());
    }

    /// Set a tracepoint on a port: values are reported, never halted.
    pub fn set_tracepoint(&mut self, addr: PortAddr) {
        self.breakpoints
            .insert(addr, Breakpoint { enabled: true, tracepoint: true });
    }

    /// Remove the breakpoint on a port.
    pub fn remove_breakpoint(&mut self, addr: PortAddr) -> bool {
        self.breakpoints.shift_remove(&addr).is_some()
    }

    /// Enable or disable a breakpoint without forgetting it.
    pub fn set_breakpoint_enabled(&mut self, addr: PortAddr, enabled: bool) -> bool {
        match self.breakpoints.get_mut(&addr) {
            Some(bp) => {
                bp.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Remove every breakpoint.
    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    /// Whether a port carries a breakpoint (enabled or not).
    pub fn has_breakpoint(&self, addr: PortAddr) -> bool {
        self.breakpoints.contains_key(&addr)
    }

    /// All breakpoints, in insertion order.
    pub fn breakpoints(&self) -> impl Iterator<Item = (PortAddr, Breakpoint)> + '_ {
        self.breakpoints.iter().map(|(a, b)| (*a, *b))
    }

    // ---- halt state -----------------------------------------------

    /// Whether propagation is currently halted.
    pub fn is_halted(&self) -> bool {
        matches!(self.state, DebugState::Halted(_))
    }

    /// The halted propagation step, if halted.
    pub fn halt_info(&self) -> Option<&HaltInfo> {
        match &self.state {
            DebugState::Halted(info) => Some(info),
            _ => None,
        }
    }

    /// Number of activations queued behind the halt.
    pub fn delayed_count(&self) -> usize {
        self.delayed.len()
    }

    /// Resume a graph halted by its installed `FlowDebugger`.
    ///
    /// Replays the halted edge (skipping the breakpoint that fired),
    /// finishes the interrupted fan-out, then re-issues the queued
    /// activations in arrival order. Any of those may hit another
    /// breakpoint, in which case the remainder queues up again behind
    /// the new halt. Returns `false` if the graph's observer is not a
    /// halted `FlowDebugger`.
    ///
    /// Only propagation is replayed; call [`FlowGraph::update`]
    /// afterwards to deliver the buffered values to their nodes.
    pub fn resume(graph: &mut FlowGraph) -> bool {
        let resumed = graph.with_observer(|obs, _| {
            let debugger = obs.as_any_mut().downcast_mut::<FlowDebugger>()?;
            debugger.begin_resume()
        });
        let Some(Some((info, pending))) = resumed else {
            return false;
        };

        graph.resume_from(info.from, &info.value, info.edge_index);
        graph.with_observer(|obs, _| {
            if let Some(debugger) = obs.as_any_mut().downcast_mut::<FlowDebugger>() {
                debugger.finish_resume();
            }
        });

        // Queued activations go back through the normal entry point:
        // if one of them halts, the ones after it are intercepted and
        // queued again in order.
        for (from, value) in pending {
            graph.activate_port_any(from, &value);
        }
        true
    }

    /// Hand out the halt to replay and arm the skip marker.
    fn begin_resume(&mut self) -> Option<(HaltInfo, VecDeque<(PortAddr, Value)>)> {
        let DebugState::Halted(info) = std::mem::replace(&mut self.state, DebugState::Idle)
        else {
            return None;
        };
        if let Some(listener) = self.listener.as_mut() {
            listener.on_resume(&info);
        }
        self.state =
            DebugState::Resuming { from: info.from, edge_index: info.edge_index };
        Some((info, std::mem::take(&mut self.delayed)))
    }

    /// Clear a skip marker the replay never consumed (the halted edge
    /// was unlinked in the meantime).
    fn finish_resume(&mut self) {
        if matches!(self.state, DebugState::Resuming { .. }) {
            self.state = DebugState::Idle;
        }
    }

    /// The breakpoint relevant to one edge delivery: the output port
    /// on the first edge of its span, else the destination input port.
    fn firing_breakpoint(
        &self,
        graph: &FlowGraph,
        from: PortAddr,
        to: PortAddr,
        edge_index: usize,
    ) -> Option<(PortAddr, Breakpoint)> {
        let first_of_span = edge_index == 0 || {
            let prev = graph.edges()[edge_index - 1];
            prev.from_node != from.node || prev.from_port != from.port
        };
        let candidates = if first_of_span { [Some(from), Some(to)] } else { [None, Some(to)] };
        for addr in candidates.into_iter().flatten() {
            if let Some(bp) = self.breakpoints.get(&addr) {
                if bp.enabled {
                    return Some((addr, *bp));
                }
            }
        }
        None
    }
}

impl ActivationObserver for FlowDebugger {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn intercept(&mut self, graph: &FlowGraph, from: PortAddr, value: &Value) -> bool {
        if !self.is_halted() {
            return false;
        }
        tracing::debug!(
            port = %graph.pretty_address(from),
            "activation while halted; queueing"
        );
        self.delayed.push_back((from, value.clone()));
        true
    }

    fn on_edge(
        &mut self,
        graph: &FlowGraph,
        from: PortAddr,
        to: PortAddr,
        edge_index: usize,
        value: &Value,
    ) -> EdgeVerdict {
        if let DebugState::Resuming { from: resumed_from, edge_index: resumed_edge } =
            self.state
        {
            if resumed_from == from && resumed_edge == edge_index {
                self.state = DebugState::Idle;
                return EdgeVerdict::Continue;
            }
        }

        let Some((addr, bp)) = self.firing_breakpoint(graph, from, to, edge_index) else {
            return EdgeVerdict::Continue;
        };

        if bp.tracepoint {
            tracing::trace!(
                port = %graph.pretty_address(addr),
                value = ?value,
                "tracepoint"
            );
            if let Some(listener) = self.listener.as_mut() {
                listener.on_trace(addr, value);
            }
            return EdgeVerdict::Continue;
        }

        let info = HaltInfo {
            from,
            to,
            breakpoint: addr,
            edge_index,
            value: value.clone(),
        };
        tracing::debug!(
            port = %graph.pretty_address(addr),
            value = ?value,
            "breakpoint hit; halting propagation"
        );
        if let Some(listener) = self.listener.as_mut() {
            listener.on_break(&info);
        }
        self.state = DebugState::Halted(info);
        EdgeVerdict::Halt
    }

    fn on_terminal(&mut self, graph: &FlowGraph, from: PortAddr, value: &Value) {
        if let Some(bp) = self.breakpoints.get(&from) {
            if bp.enabled && bp.tracepoint {
                if let Some(listener) = self.listener.as_mut() {
                    listener.on_trace(from, value);
                }
            } else if bp.enabled {
                // Nothing to halt: the port has no outgoing edges.
                tracing::debug!(
                    port = %graph.pretty_address(from),
                    "breakpoint on unconnected output; nothing to halt"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberflow_graph::{
        ActivationCtx, FlowEvent, FlowNode, InputPortConfig, NodeConfig, NodeId,
        NodeRegistry, OutputPortConfig, PortId, PortValue, ValueTag,
    };
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<(String, Value)>>>;

    /// Records activated values; forwards them to its output.
    struct Relay {
        label: String,
        log: Log,
    }

    impl FlowNode for Relay {
        fn configuration(&self) -> NodeConfig {
            NodeConfig::new(
                vec![InputPortConfig::new("in", ValueTag::Any)],
                vec![OutputPortConfig::new("out", ValueTag::Any)],
            )
        }

        fn process_event(&mut self, event: FlowEvent, ctx: &mut ActivationCtx<'_>) {
            if event != FlowEvent::Activate || !ctx.is_port_active(PortId(0)) {
                return;
            }
            let Some(value) = ctx.input(PortId(0)).map(PortValue::value).cloned() else {
                return;
            };
            self.log.borrow_mut().push((self.label.clone(), value.clone()));
            ctx.activate_output(PortId(0), value);
        }

        fn clone_node(&self) -> Box<dyn FlowNode> {
            Box::new(Relay { label: self.label.clone(), log: Rc::clone(&self.log) })
        }
    }

    struct CapturingListener {
        breaks: Rc<RefCell<Vec<HaltInfo>>>,
        traces: Rc<RefCell<Vec<(PortAddr, Value)>>>,
    }

    impl DebugListener for CapturingListener {
        fn on_break(&mut self, info: &HaltInfo) {
            self.breaks.borrow_mut().push(info.clone());
        }

        fn on_trace(&mut self, breakpoint: PortAddr, value: &Value) {
            self.traces.borrow_mut().push((breakpoint, value.clone()));
        }
    }

    /// source -> sink chain with the debugger installed; returns the
    /// node ids and the shared delivery log.
    fn debug_graph(
        debugger: FlowDebugger,
    ) -> (FlowGraph, NodeId, NodeId, Log) {
        let log: Log = Rc::default();
        let mut registry = NodeRegistry::new();
        for label in ["src", "mid", "sink"] {
            let log = Rc::clone(&log);
            registry.register(
                format!("dbg:{label}"),
                Box::new(move || {
                    Box::new(Relay { label: label.to_owned(), log: Rc::clone(&log) })
                }),
            );
        }
        let mut graph = FlowGraph::new(Rc::new(registry));
        let src = graph.create_node("dbg:src", "src").unwrap();
        let sink = graph.create_node("dbg:sink", "sink").unwrap();
        let from = graph.resolve_node_port("src", "out", true).unwrap();
        let to = graph.resolve_node_port("sink", "in", false).unwrap();
        graph.link_nodes(from, to).unwrap();
        graph.update();
        log.borrow_mut().clear();
        graph.set_observer(Box::new(debugger));
        (graph, src, sink, log)
    }

    fn deliveries(log: &Log, label: &str) -> Vec<Value> {
        log.borrow()
            .iter()
            .filter(|(l, _)| l == label)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn with_debugger<R>(
        graph: &mut FlowGraph,
        f: impl FnOnce(&mut FlowDebugger) -> R,
    ) -> R {
        graph
            .with_observer(|obs, _| {
                let debugger = obs
                    .as_any_mut()
                    .downcast_mut::<FlowDebugger>()
                    .unwrap();
                f(debugger)
            })
            .unwrap()
    }

    #[test]
    fn test_breakpoint_halts_delivery() {
        let breaks = Rc::new(RefCell::new(Vec::new()));
        let traces = Rc::new(RefCell::new(Vec::new()));
        let debugger = FlowDebugger::with_listener(Box::new(CapturingListener {
            breaks: Rc::clone(&breaks),
            traces: Rc::clone(&traces),
        }));
        let (mut graph, src, sink, log) = debug_graph(debugger);
        let bp = PortAddr::input(sink, PortId(0));
        with_debugger(&mut graph, |d| d.set_breakpoint(bp));

        graph.activate_port(PortAddr::output(src, PortId(0)), 41);
        graph.update();

        // The value never reached the sink.
        assert!(deliveries(&log, "sink").is_empty());
        assert_eq!(breaks.borrow().len(), 1);
        assert_eq!(breaks.borrow()[0].breakpoint, bp);
        assert_eq!(breaks.borrow()[0].value, Value::Int(41));
        assert!(with_debugger(&mut graph, |d| d.is_halted()));
    }

    #[test]
    fn test_resume_replays_halted_edge() {
        let (mut graph, src, sink, log) = debug_graph(FlowDebugger::new());
        let bp = PortAddr::input(sink, PortId(0));
        with_debugger(&mut graph, |d| d.set_breakpoint(bp));

        graph.activate_port(PortAddr::output(src, PortId(0)), 41);
        graph.update();
        assert!(deliveries(&log, "sink").is_empty());

        assert!(FlowDebugger::resume(&mut graph));
        graph.update();

        // Exactly one delivery; the breakpoint did not re-fire on the
        // replayed edge.
        assert_eq!(deliveries(&log, "sink"), vec![Value::Int(41)]);
        assert!(!with_debugger(&mut graph, |d| d.is_halted()));

        // The breakpoint is still armed for the next activation.
        graph.activate_port(PortAddr::output(src, PortId(0)), 42);
        graph.update();
        assert_eq!(deliveries(&log, "sink").len(), 1);
        assert!(with_debugger(&mut graph, |d| d.is_halted()));
    }

    #[test]
    fn test_activations_while_halted_queue_in_order() {
        let (mut graph, src, sink, log) = debug_graph(FlowDebugger::new());
        let bp = PortAddr::input(sink, PortId(0));
        with_debugger(&mut graph, |d| d.set_breakpoint(bp));
        let out = PortAddr::output(src, PortId(0));

        graph.activate_port(out, 1);
        graph.update();
        // Halted on 1; these two queue up.
        graph.activate_port(out, 2);
        graph.activate_port(out, 3);
        assert_eq!(with_debugger(&mut graph, |d| d.delayed_count()), 2);
        assert!(deliveries(&log, "sink").is_empty());

        // First resume replays 1 and immediately re-halts on 2.
        assert!(FlowDebugger::resume(&mut graph));
        graph.update();
        assert_eq!(deliveries(&log, "sink"), vec![Value::Int(1)]);
        assert_eq!(with_debugger(&mut graph, |d| d.delayed_count()), 1);

        assert!(FlowDebugger::resume(&mut graph));
        graph.update();
        assert_eq!(deliveries(&log, "sink"), vec![Value::Int(1), Value::Int(2)]);

        assert!(FlowDebugger::resume(&mut graph));
        graph.update();
        assert_eq!(
            deliveries(&log, "sink"),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
        assert!(!with_debugger(&mut graph, |d| d.is_halted()));
    }

    #[test]
    fn test_tracepoint_does_not_halt() {
        let breaks = Rc::new(RefCell::new(Vec::new()));
        let traces = Rc::new(RefCell::new(Vec::new()));
        let debugger = FlowDebugger::with_listener(Box::new(CapturingListener {
            breaks: Rc::clone(&breaks),
            traces: Rc::clone(&traces),
        }));
        let (mut graph, src, sink, log) = debug_graph(debugger);
        let tp = PortAddr::input(sink, PortId(0));
        with_debugger(&mut graph, |d| d.set_tracepoint(tp));

        graph.activate_port(PortAddr::output(src, PortId(0)), 7);
        graph.update();

        assert_eq!(deliveries(&log, "sink"), vec![Value::Int(7)]);
        assert!(breaks.borrow().is_empty());
        assert_eq!(traces.borrow().len(), 1);
        assert_eq!(traces.borrow()[0], (tp, Value::Int(7)));
    }

    #[test]
    fn test_disabled_breakpoint_ignored() {
        let (mut graph, src, sink, log) = debug_graph(FlowDebugger::new());
        let bp = PortAddr::input(sink, PortId(0));
        with_debugger(&mut graph, |d| {
            d.set_breakpoint(bp);
            assert!(d.set_breakpoint_enabled(bp, false));
        });

        graph.activate_port(PortAddr::output(src, PortId(0)), 5);
        graph.update();
        assert_eq!(deliveries(&log, "sink"), vec![Value::Int(5)]);

        // Re-enabled, it fires again.
        with_debugger(&mut graph, |d| {
            assert!(d.set_breakpoint_enabled(bp, true));
        });
        graph.activate_port(PortAddr::output(src, PortId(0)), 6);
        graph.update();
        assert_eq!(deliveries(&log, "sink").len(), 1);
        assert!(with_debugger(&mut graph, |d| d.is_halted()));
    }

    #[test]
    fn test_output_breakpoint_fires_once_per_activation() {
        // src fans out to two sinks; a breakpoint on src's output
        // halts before either edge, and one resume finishes the whole
        // span.
        let log: Log = Rc::default();
        let mut registry = NodeRegistry::new();
        for label in ["src", "a", "b"] {
            let log = Rc::clone(&log);
            registry.register(
                format!("dbg:{label}"),
                Box::new(move || {
                    Box::new(Relay { label: label.to_owned(), log: Rc::clone(&log) })
                }),
            );
        }
        let mut graph = FlowGraph::new(Rc::new(registry));
        let src = graph.create_node("dbg:src", "src").unwrap();
        graph.create_node("dbg:a", "a").unwrap();
        graph.create_node("dbg:b", "b").unwrap();
        let from = graph.resolve_node_port("src", "out", true).unwrap();
        let to_a = graph.resolve_node_port("a", "in", false).unwrap();
        let to_b = graph.resolve_node_port("b", "in", false).unwrap();
        graph.link_nodes(from, to_a).unwrap();
        graph.link_nodes(from, to_b).unwrap();
        graph.update();
        log.borrow_mut().clear();
        graph.set_observer(Box::new(FlowDebugger::new()));

        let out = PortAddr::output(src, PortId(0));
        with_debugger(&mut graph, |d| d.set_breakpoint(out));

        graph.activate_port(out, 9);
        graph.update();
        assert!(deliveries(&log, "a").is_empty());
        assert!(deliveries(&log, "b").is_empty());

        assert!(FlowDebugger::resume(&mut graph));
        graph.update();
        assert_eq!(deliveries(&log, "a"), vec![Value::Int(9)]);
        assert_eq!(deliveries(&log, "b"), vec![Value::Int(9)]);
        assert!(!with_debugger(&mut graph, |d| d.is_halted()));
    }

    #[test]
    fn test_breakpoint_bookkeeping() {
        let mut debugger = FlowDebugger::new();
        let addr = PortAddr::input(NodeId(0), PortId(0));
        assert!(!debugger.has_breakpoint(addr));
        debugger.set_breakpoint(addr);
        assert!(debugger.has_breakpoint(addr));
        assert_eq!(debugger.breakpoints().count(), 1);
        assert!(debugger.remove_breakpoint(addr));
        assert!(!debugger.remove_breakpoint(addr));
        assert!(!debugger.set_breakpoint_enabled(addr, false));
        debugger.set_breakpoint(addr);
        debugger.clear_breakpoints();
        assert_eq!(debugger.breakpoints().count(), 0);
    }

    #[test]
    fn test_resume_without_halt_is_a_no_op() {
        let (mut graph, _src, _sink, _log) = debug_graph(FlowDebugger::new());
        assert!(!FlowDebugger::resume(&mut graph));
    }
}
