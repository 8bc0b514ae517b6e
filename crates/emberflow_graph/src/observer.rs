// SPDX-License-Identifier: MIT OR Apache-2.0
//! Observation seam for value propagation.
//!
//! A graph carries at most one [`ActivationObserver`]. It is consulted
//! around every individual edge traversal and may veto propagation for
//! that edge, which is how the debugger implements breakpoints without
//! the scheduler knowing anything about them.

use crate::graph::{FlowGraph, PortAddr};
use crate::value::Value;
use std::any::Any;

/// Observer decision for a single edge traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeVerdict {
    /// Deliver this edge and keep walking the span.
    Continue,
    /// Abort propagation at this edge. The observer is expected to
    /// remember enough state to replay via [`FlowGraph::resume_from`].
    Halt,
}

/// Hook into every propagation step of a graph.
///
/// All methods default to pass-through, so an observer only implements
/// what it cares about.
pub trait ActivationObserver {
    /// Downcast support, so hosts can get their concrete observer back
    /// out of the graph.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Consulted once per activation request, before any edge is
    /// walked. Returning `true` swallows the request entirely (used to
    /// queue activations while halted).
    fn intercept(&mut self, _graph: &FlowGraph, _from: PortAddr, _value: &Value) -> bool {
        false
    }

    /// Consulted before each edge delivery.
    fn on_edge(
        &mut self,
        _graph: &FlowGraph,
        _from: PortAddr,
        _to: PortAddr,
        _edge_index: usize,
        _value: &Value,
    ) -> EdgeVerdict {
        EdgeVerdict::Continue
    }

    /// An output port with no outgoing edges was activated.
    fn on_terminal(&mut self, _graph: &FlowGraph, _from: PortAddr, _value: &Value) {}
}
