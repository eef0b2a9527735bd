//! Unit graph: an arena of nodes converging on one sink.
//!
//! Every node has at most one downstream edge, so the topology is a forest of
//! in-trees whose roots feed the sink. Edges are stored as ids, never as
//! references, and each node keeps one scratch input buffer per upstream node
//! in the same order as its input list.
//!
//! ```
//! use trackcore::graph::{Graph, Target};
//! use trackcore::nodes::{Gain, Oscillator, Waveform};
//! use trackcore::{NodeIds, ProcessContext};
//!
//! let mut graph = Graph::new(64, 2, NodeIds::new());
//! let osc = graph.add(Oscillator::new(Waveform::Sine, 440.0));
//! let gain = graph.add(Gain::new(-6.0));
//! graph.connect(osc.id, Target::Node(gain.id)).unwrap();
//! graph.connect(gain.id, Target::Sink).unwrap();
//!
//! let mut out = vec![0.0; 128];
//! graph.process(&mut ProcessContext::new(48_000, 64, 2), &mut out);
//! ```

use hashbrown::HashMap;

use crate::error::{GraphError, PostError, UnitError};
use crate::mailbox::{mailbox, MailboxReader, MailboxWriter};
use crate::node::{Inputs, NoteEvent, NodeId, NodeIds, ParamSnapshot, ProcessContext, ProcessingUnit};
use crate::queue::{message_queue, MessageReceiver, MessageSender};

/// Where a node's output goes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Target {
    /// The graph's terminal mix point.
    Sink,
    Node(NodeId),
}

/// Lifecycle state of a node id.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeState {
    Unconnected,
    Connected,
    Destroyed,
}

/// Default number of note events a node can queue between ticks.
pub const DEFAULT_EVENT_DEPTH: usize = 64;
/// Upstream nodes one node can take without allocating.
pub const MAX_INPUTS: usize = 16;

/// Sends note events to one node.
pub struct EventSender {
    sender: MessageSender,
}

impl EventSender {
    /// Queue `event` for delivery before the node's next `process`.
    #[inline]
    pub fn send(&mut self, event: NoteEvent) -> Result<(), PostError> {
        self.sender.post(&event.encode())
    }
}

/// Control handles returned when a node is created.
///
/// The fields can be split up: the sequencer keeps an instrument's `events`,
/// the UI keeps its `params`.
pub struct NodeHandle {
    pub id: NodeId,
    pub events: EventSender,
    pub params: MailboxWriter<ParamSnapshot>,
}

impl NodeHandle {
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Change one parameter; the whole snapshot is posted.
    pub fn set_param(&mut self, index: usize, value: f32) -> bool {
        self.params.update(|p| p.set(index, value))
    }
}

/// One unit plus its buffers and edges.
pub struct GraphNode {
    id: NodeId,
    unit: Box<dyn ProcessingUnit>,
    output: Vec<f32>,
    inputs: Vec<NodeId>,
    input_buffers: Vec<Vec<f32>>,
    downstream: Option<Target>,
    events: MessageReceiver,
    params: MailboxReader<ParamSnapshot>,
}

impl GraphNode {
    /// Wrap `unit` in a node with buffers sized for `block_len` interleaved
    /// samples. The node is not part of any graph until inserted.
    pub fn new(
        id: NodeId,
        unit: Box<dyn ProcessingUnit>,
        block_len: usize,
        event_depth: usize,
    ) -> (Self, NodeHandle) {
        let (event_tx, event_rx) = message_queue(NoteEvent::ENCODED_LEN, event_depth);
        let (param_tx, param_rx) = mailbox(ParamSnapshot::of(unit.as_ref()));
        let node = Self {
            id,
            unit,
            output: vec![0.0; block_len],
            inputs: Vec::with_capacity(MAX_INPUTS),
            input_buffers: Vec::with_capacity(MAX_INPUTS),
            downstream: None,
            events: event_rx,
            params: param_rx,
        };
        let handle = NodeHandle { id, events: EventSender { sender: event_tx }, params: param_tx };
        (node, handle)
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn unit(&self) -> &dyn ProcessingUnit {
        self.unit.as_ref()
    }

    #[inline]
    pub fn unit_mut(&mut self) -> &mut dyn ProcessingUnit {
        self.unit.as_mut()
    }

    /// Upstream nodes, in the order their scratch buffers are passed.
    #[inline]
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    #[inline]
    pub fn downstream(&self) -> Option<Target> {
        self.downstream
    }

    /// Output of the most recent block.
    #[inline]
    pub fn output(&self) -> &[f32] {
        &self.output
    }

    /// Deliver pending parameters and events, then process one block.
    ///
    /// On failure the output is silenced and the error returned for
    /// reporting.
    fn run(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), UnitError> {
        if let Some(params) = self.params.latest() {
            for (index, value) in params.as_slice().iter().enumerate() {
                self.unit.set_param(index, *value);
            }
        }

        let mut bytes = [0u8; NoteEvent::ENCODED_LEN];
        while let Some(msg) = self.events.read() {
            msg.copy_to(&mut bytes);
            if let Some(event) = NoteEvent::decode(&bytes) {
                self.unit.note_event(event);
            }
        }

        let result = self
            .unit
            .process(ctx, Inputs::new(&self.input_buffers), &mut self.output)
            .and_then(|()| {
                if self.output.iter().all(|s| s.is_finite()) {
                    Ok(())
                } else {
                    Err(UnitError::NonFinite)
                }
            });
        if result.is_err() {
            self.output.fill(0.0);
        }
        result
    }
}

/// Builds nodes away from the audio thread, sized for one graph.
///
/// A live graph accepts these through [`Graph::insert`], which only moves
/// them into place.
#[derive(Clone, Debug)]
pub struct NodeBuilder {
    ids: NodeIds,
    block_len: usize,
    event_depth: usize,
}

impl NodeBuilder {
    pub fn new(ids: NodeIds, block_len: usize, event_depth: usize) -> Self {
        Self { ids, block_len, event_depth }
    }

    /// Wrap `unit` in a fresh node and return it with its control handles.
    pub fn build(&self, unit: Box<dyn ProcessingUnit>) -> (GraphNode, NodeHandle) {
        GraphNode::new(self.ids.next(), unit, self.block_len, self.event_depth)
    }

    #[inline]
    pub fn ids(&self) -> &NodeIds {
        &self.ids
    }

    #[inline]
    pub fn block_len(&self) -> usize {
        self.block_len
    }
}

/// The node arena and its executor.
pub struct Graph {
    nodes: HashMap<NodeId, GraphNode>,
    ids: NodeIds,
    sink_inputs: Vec<NodeId>,

    order: Vec<NodeId>,
    order_dirty: bool,
    stack: Vec<(NodeId, usize)>,

    spare: Vec<Vec<f32>>,
    failures: Vec<(NodeId, UnitError)>,

    max_nodes: usize,
    block_len: usize,
    event_depth: usize,
}

const MAX_FAILURES_PER_TICK: usize = 32;

impl Graph {
    /// Create an empty graph for blocks of `block_size` frames.
    pub fn new(block_size: usize, channels: usize, ids: NodeIds) -> Self {
        Self::with_capacity(block_size, channels, ids, 64, 16)
    }

    /// Create a graph that can hold `nodes` nodes and make `spare_buffers`
    /// new connections without allocating.
    ///
    /// Past those limits [`connect`](Self::connect) fails and
    /// [`can_insert`](Self::can_insert) is false until
    /// [`reserve`](Self::reserve) makes room.
    pub fn with_capacity(
        block_size: usize,
        channels: usize,
        ids: NodeIds,
        nodes: usize,
        spare_buffers: usize,
    ) -> Self {
        let block_len = block_size * channels;
        // every scratch buffer can end up back in the pool at once
        let mut spare = Vec::with_capacity(nodes + spare_buffers);
        spare.extend((0..spare_buffers).map(|_| vec![0.0; block_len]));
        Self {
            nodes: HashMap::with_capacity(nodes),
            ids,
            sink_inputs: Vec::with_capacity(nodes),
            order: Vec::with_capacity(nodes),
            order_dirty: false,
            stack: Vec::with_capacity(nodes),
            spare,
            failures: Vec::with_capacity(MAX_FAILURES_PER_TICK),
            max_nodes: nodes,
            block_len,
            event_depth: DEFAULT_EVENT_DEPTH,
        }
    }

    /// Set the note-event queue depth for nodes added from now on.
    pub fn with_event_depth(mut self, depth: usize) -> Self {
        self.event_depth = depth;
        self
    }

    /// Add a unit, returning handles to control it.
    pub fn add(&mut self, unit: impl ProcessingUnit) -> NodeHandle {
        self.add_boxed(Box::new(unit))
    }

    pub fn add_boxed(&mut self, unit: Box<dyn ProcessingUnit>) -> NodeHandle {
        self.reserve(1, 1);
        let (node, handle) = self.builder().build(unit);
        self.insert(node);
        handle
    }

    /// A builder producing nodes that fit this graph.
    pub fn builder(&self) -> NodeBuilder {
        NodeBuilder::new(self.ids.clone(), self.block_len, self.event_depth)
    }

    /// Make room for `nodes` more nodes and `connections` more node-to-node
    /// edges. This allocates; call it away from the audio thread.
    pub fn reserve(&mut self, nodes: usize, connections: usize) {
        let wanted = self.nodes.len() + nodes;
        if wanted > self.max_nodes {
            self.nodes.reserve(wanted - self.nodes.len());
            self.sink_inputs.reserve(wanted - self.sink_inputs.len());
            self.order.reserve(wanted - self.order.len());
            self.stack.reserve(wanted - self.stack.len());
            self.max_nodes = wanted;
        }
        let missing = connections.saturating_sub(self.spare.len());
        self.spare.reserve(self.max_nodes + missing);
        let block_len = self.block_len;
        self.spare.extend((0..missing).map(|_| vec![0.0; block_len]));
    }

    /// Nodes that can still be inserted without allocating.
    #[inline]
    pub fn free_slots(&self) -> usize {
        self.max_nodes.saturating_sub(self.nodes.len())
    }

    /// Node-to-node connections that can still be made without allocating.
    #[inline]
    pub fn spare_buffers(&self) -> usize {
        self.spare.len()
    }

    #[inline]
    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    /// Whether [`insert`](Self::insert) can take `node` without allocating:
    /// there is a free slot and its buffers are sized for this graph.
    pub fn can_insert(&self, node: &GraphNode) -> bool {
        self.free_slots() > 0
            && node.output.len() == self.block_len
            && !self.nodes.contains_key(&node.id)
    }

    /// Insert a node built elsewhere, e.g. on the control thread.
    ///
    /// The node keeps no edges from wherever it was before.
    pub fn insert(&mut self, mut node: GraphNode) {
        node.downstream = None;
        node.inputs.clear();
        node.input_buffers.clear();
        node.output.resize(self.block_len, 0.0);
        self.nodes.insert(node.id, node);
    }

    /// Route `from`'s output into `to`.
    ///
    /// A node that already has a downstream edge is disconnected from it
    /// first, so every node keeps at most one.
    pub fn connect(&mut self, from: NodeId, to: Target) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&from) {
            return Err(GraphError::UnknownNode(from));
        }
        if let Target::Node(parent) = to {
            if !self.nodes.contains_key(&parent) {
                return Err(GraphError::UnknownNode(parent));
            }
            // walk down from the new parent; meeting `from` means `to` feeds it
            let mut cursor = parent;
            loop {
                if cursor == from {
                    return Err(GraphError::Cycle { from, to: parent });
                }
                match self.nodes.get(&cursor).and_then(|n| n.downstream) {
                    Some(Target::Node(next)) => cursor = next,
                    _ => break,
                }
            }
        }

        self.check_room(from, to)?;
        self.disconnect(from)?;

        match to {
            Target::Sink => self.sink_inputs.push(from),
            Target::Node(parent) => {
                let scratch = self.spare.pop().ok_or(GraphError::NoSpareBuffer)?;
                if let Some(parent) = self.nodes.get_mut(&parent) {
                    parent.inputs.push(from);
                    parent.input_buffers.push(scratch);
                }
            }
        }
        if let Some(node) = self.nodes.get_mut(&from) {
            node.downstream = Some(to);
        }
        self.order_dirty = true;
        Ok(())
    }

    /// Fail unless connecting `from` to `to` fits in reserved capacity.
    fn check_room(&self, from: NodeId, to: Target) -> Result<(), GraphError> {
        let current = self.nodes.get(&from).and_then(|n| n.downstream);
        if current == Some(to) {
            return Ok(());
        }
        match to {
            Target::Sink => {
                if self.sink_inputs.len() == self.sink_inputs.capacity() {
                    return Err(GraphError::Full);
                }
            }
            Target::Node(parent) => {
                let inputs = self.nodes.get(&parent).map(|p| &p.inputs);
                if inputs.map_or(false, |i| i.len() == i.capacity()) {
                    return Err(GraphError::TooManyInputs(parent));
                }
                // moving `from` off another node frees its old buffer
                let frees_one = matches!(current, Some(Target::Node(_)));
                if self.spare.is_empty() && !frees_one {
                    return Err(GraphError::NoSpareBuffer);
                }
            }
        }
        Ok(())
    }

    /// Cut `id`'s downstream edge. Does nothing if it has none.
    pub fn disconnect(&mut self, id: NodeId) -> Result<(), GraphError> {
        let downstream = self
            .nodes
            .get_mut(&id)
            .ok_or(GraphError::UnknownNode(id))?
            .downstream
            .take();

        match downstream {
            None => return Ok(()),
            Some(Target::Sink) => {
                if let Some(pos) = self.sink_inputs.iter().position(|n| *n == id) {
                    self.sink_inputs.remove(pos);
                }
            }
            Some(Target::Node(parent)) => {
                if let Some(parent) = self.nodes.get_mut(&parent) {
                    if let Some(pos) = parent.inputs.iter().position(|n| *n == id) {
                        parent.inputs.remove(pos);
                        let scratch = parent.input_buffers.remove(pos);
                        self.spare.push(scratch);
                    }
                }
            }
        }
        self.order_dirty = true;
        Ok(())
    }

    /// Unlink `id` from everything and take it out of the graph.
    ///
    /// Its upstream nodes are left unconnected.
    pub fn remove(&mut self, id: NodeId) -> Result<GraphNode, GraphError> {
        self.disconnect(id)?;
        while let Some(upstream) = self.nodes.get(&id).and_then(|n| n.inputs.last().copied()) {
            self.disconnect(upstream)?;
        }
        self.order_dirty = true;
        self.nodes.remove(&id).ok_or(GraphError::UnknownNode(id))
    }

    pub fn state(&self, id: NodeId) -> NodeState {
        match self.nodes.get(&id) {
            Some(node) if node.downstream.is_some() => NodeState::Connected,
            Some(_) => NodeState::Unconnected,
            None => NodeState::Destroyed,
        }
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(&id)
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut GraphNode> {
        self.nodes.get_mut(&id)
    }

    #[inline]
    pub fn unit(&self, id: NodeId) -> Option<&dyn ProcessingUnit> {
        self.nodes.get(&id).map(GraphNode::unit)
    }

    /// Roots feeding the sink, in mix order.
    #[inline]
    pub fn sink_inputs(&self) -> &[NodeId] {
        &self.sink_inputs
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn block_len(&self) -> usize {
        self.block_len
    }

    #[inline]
    pub fn event_depth(&self) -> usize {
        self.event_depth
    }

    #[inline]
    pub fn ids(&self) -> &NodeIds {
        &self.ids
    }

    /// Reset every unit's internal state.
    pub fn reset(&mut self) {
        for node in self.nodes.values_mut() {
            node.unit.reset();
        }
    }

    /// Run one block through every node that reaches the sink, and write the
    /// sum of the sink's inputs to `out`.
    ///
    /// Nodes are visited once each, upstream before downstream. A failing
    /// unit contributes silence; the failure is kept for
    /// [`take_failures`](Self::take_failures).
    pub fn process(&mut self, ctx: &mut ProcessContext<'_>, out: &mut [f32]) {
        if self.order_dirty {
            self.rebuild_order();
        }

        for i in 0..self.order.len() {
            let id = self.order[i];
            // the scratch buffers are taken out so upstream outputs can be
            // read while they are filled; empty vecs do not allocate
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let mut buffers = std::mem::take(&mut node.input_buffers);
            let inputs = std::mem::take(&mut node.inputs);
            for (scratch, upstream) in buffers.iter_mut().zip(&inputs) {
                match self.nodes.get(upstream) {
                    Some(upstream) => scratch.copy_from_slice(&upstream.output),
                    None => scratch.fill(0.0),
                }
            }

            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            node.input_buffers = buffers;
            node.inputs = inputs;
            if let Err(err) = node.run(ctx) {
                if self.failures.len() < MAX_FAILURES_PER_TICK {
                    self.failures.push((id, err));
                }
            }
        }

        out.fill(0.0);
        for root in &self.sink_inputs {
            if let Some(node) = self.nodes.get(root) {
                for (o, s) in out.iter_mut().zip(&node.output) {
                    *o += *s;
                }
            }
        }
    }

    /// Failures recorded by [`process`](Self::process) since the last call.
    pub fn take_failures(&mut self) -> impl Iterator<Item = (NodeId, UnitError)> + '_ {
        self.failures.drain(..)
    }

    /// Post-order walk from the sink: every node after all of its inputs.
    fn rebuild_order(&mut self) {
        self.order.clear();
        self.stack.clear();

        for r in 0..self.sink_inputs.len() {
            self.stack.push((self.sink_inputs[r], 0));
            while let Some(top) = self.stack.last_mut() {
                let (id, next) = *top;
                let child = self.nodes.get(&id).and_then(|n| n.inputs.get(next).copied());
                match child {
                    Some(child) => {
                        top.1 += 1;
                        self.stack.push((child, 0));
                    }
                    None => {
                        self.order.push(id);
                        self.stack.pop();
                    }
                }
            }
        }
        self.order_dirty = false;
    }
}
