// pipeline/graph.rs — Building, validating and running a pipeline.
//
// BUILD
// ─────
//   let mut b = PipelineBuilder::new();
//   let src  = b.add(ImageSource::new("source")?)?;
//   let sink = b.add(ImageSink::new("image")?)?;
//   b.connect(src, "out", sink, "in")?;
//   let pipeline = b.init()?;
//
// `init` sorts the nodes topologically, validates the sequence (non-empty,
// starts with a source, has a sink) and the links (every input connected),
// creates the device and initialises the nodes in order.
//
// TICK
// ────
// For each node in topological order:
//
//   clear outputs ─► pull inputs ─► run ─┬─ Ready ──────────────────┬─► check outputs
//                                        └─ Pending ─► await ─► complete
//
// A readback is the only suspension point. The node arena is not borrowed
// while a readback is awaited, so `lose_context()` (or another `run()`,
// which waits its turn) can interleave there. Sinks are exported once every
// node has run, and all ports are cleared whatever the outcome.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::BTreeMap;

use tracing::{debug, info, trace};

use crate::error::{PipelineError, Result};
use crate::gpu::config::GpuConfig;
use crate::gpu::reader::yield_now;
use crate::gpu::GpuContext;
use crate::keypoint::Keypoint;
use crate::media::Bitmap;
use crate::pipeline::message::Message;
use crate::pipeline::node::{NodeId, NodeTask, PipelineNode, SinkOutput};
use crate::pipeline::port::PortRef;

/// Results of one tick, keyed by sink name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineOutput {
    sinks: BTreeMap<String, SinkOutput>,
}

impl PipelineOutput {
    pub fn get(&self, sink: &str) -> Option<&SinkOutput> {
        self.sinks.get(sink)
    }

    pub fn image(&self, sink: &str) -> Option<&Bitmap> {
        self.get(sink).and_then(SinkOutput::as_image)
    }

    pub fn keypoints(&self, sink: &str) -> Option<&[Keypoint]> {
        self.get(sink).and_then(SinkOutput::as_keypoints)
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SinkOutput)> {
        self.sinks.iter().map(|(k, v)| (k.as_str(), v))
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects nodes and links before the pipeline is initialised.
pub struct PipelineBuilder {
    config: GpuConfig,
    nodes: Vec<Box<dyn PipelineNode>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::with_config(GpuConfig::default())
    }

    pub fn with_config(config: GpuConfig) -> Self {
        PipelineBuilder { config, nodes: Vec::new() }
    }

    /// Add a node.
    ///
    /// # Errors
    /// `DuplicateNode` if a node with the same name was added already.
    pub fn add<N: PipelineNode>(&mut self, node: N) -> Result<NodeId> {
        let name = node.core().name();
        if self.nodes.iter().any(|n| n.core().name() == name) {
            return Err(PipelineError::DuplicateNode(name.to_string()));
        }
        self.nodes.push(Box::new(node));
        Ok(NodeId(self.nodes.len() - 1))
    }

    /// Link output port `output` of `from` to input port `input` of `to`.
    ///
    /// # Errors
    /// `SelfLink`, `UnknownNode`, `UnknownPort`, `AlreadyConnected` (an
    /// input takes a single link) or `IncompatiblePorts` (message types
    /// differ).
    pub fn connect(&mut self, from: NodeId, output: &str, to: NodeId, input: &str) -> Result<()> {
        let source = self.get(from)?.core();
        let target = self.get(to)?.core();
        if from == to {
            return Err(PipelineError::SelfLink(source.full_name()));
        }

        let out_index = source.output_index(output)?;
        let in_index = target.input_index(input)?;
        let out_port = &source.outputs()[out_index];
        let in_port = &target.inputs()[in_index];

        if in_port.link().is_some() {
            return Err(PipelineError::AlreadyConnected {
                node: target.full_name(),
                port: input.to_string(),
            });
        }
        if !out_port.spec().is_compatible_with(in_port.spec()) {
            return Err(PipelineError::IncompatiblePorts {
                from: format!("{}.{}", source.full_name(), output),
                from_type: out_port.spec().expected().name(),
                to: format!("{}.{}", target.full_name(), input),
                to_type: in_port.spec().expected().name(),
            });
        }

        self.nodes[to.0].core_mut().inputs_mut()[in_index]
            .set_link(PortRef { node: from, port: out_index });
        Ok(())
    }

    fn get(&self, id: NodeId) -> Result<&dyn PipelineNode> {
        self.nodes
            .get(id.0)
            .map(|n| &**n)
            .ok_or_else(|| PipelineError::UnknownNode(format!("#{}", id.0)))
    }

    /// Sort, validate and initialise.
    ///
    /// # Errors
    /// `Cycle`, `NoNodes`, `NoSource`, `NoSink`, `NoIncomingLink` for an
    /// input left unconnected, or whatever a node's `init()` fails with.
    pub fn init(self) -> Result<Pipeline> {
        let sequence = tsort(&self.nodes)?;
        validate_sequence(&self.nodes, &sequence)?;
        validate_links(&self.nodes)?;

        let mut gpu = GpuContext::new(self.config);
        let mut nodes = self.nodes;
        for &id in &sequence {
            nodes[id.0].init(&mut gpu)?;
        }
        info!(
            nodes = sequence.len(),
            order = ?sequence.iter().map(|id| nodes[id.0].core().full_name()).collect::<Vec<_>>(),
            "pipeline initialized"
        );

        Ok(Pipeline {
            inner: RefCell::new(Inner { nodes, sequence, gpu }),
            busy: Cell::new(false),
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Topological order by iterative depth-first search. A node reached again
/// while still open is on the current path: that's a cycle.
fn tsort(nodes: &[Box<dyn PipelineNode>]) -> Result<Vec<NodeId>> {
    let n = nodes.len();
    let mut outlinks: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (to, node) in nodes.iter().enumerate() {
        for port in node.core().inputs() {
            if let Some(link) = port.link() {
                let from = link.node.0;
                if !outlinks[from].contains(&to) {
                    outlinks[from].push(to);
                }
            }
        }
    }

    let mut stack: Vec<(usize, bool)> = (0..n).map(|i| (i, false)).collect();
    let mut visited = vec![false; n];
    let mut finished = vec![false; n];
    let mut sorted = vec![NodeId(0); n];
    let mut j = n;

    while let Some((i, done)) = stack.pop() {
        if done {
            finished[i] = true;
            j -= 1;
            sorted[j] = NodeId(i);
            continue;
        }
        if visited[i] {
            continue;
        }
        visited[i] = true;
        stack.push((i, true));
        for &k in &outlinks[i] {
            if visited[k] && !finished[k] {
                return Err(PipelineError::Cycle(nodes[k].core().full_name()));
            }
            stack.push((k, false));
        }
    }

    debug_assert_eq!(j, 0);
    Ok(sorted)
}

fn validate_sequence(nodes: &[Box<dyn PipelineNode>], sequence: &[NodeId]) -> Result<()> {
    match sequence.first() {
        None => Err(PipelineError::NoNodes),
        Some(first) if !nodes[first.0].core().is_source() => Err(PipelineError::NoSource),
        Some(_) if !sequence.iter().any(|id| nodes[id.0].core().is_sink()) => {
            Err(PipelineError::NoSink)
        }
        Some(_) => Ok(()),
    }
}

/// Every input port must be linked before the first tick.
fn validate_links(nodes: &[Box<dyn PipelineNode>]) -> Result<()> {
    for node in nodes {
        let core = node.core();
        if let Some(port) = core.inputs().iter().find(|p| p.link().is_none()) {
            return Err(PipelineError::NoIncomingLink {
                node: core.full_name(),
                port: port.name().to_string(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

struct Inner {
    nodes: Vec<Box<dyn PipelineNode>>,
    sequence: Vec<NodeId>,
    gpu: GpuContext,
}

impl Inner {
    /// Clear outputs, pull inputs and run the `i`-th node of the sequence.
    fn execute(&mut self, i: usize) -> Result<NodeTask> {
        let id = self.sequence[i];
        let incoming = self.incoming(id)?;

        let Inner { nodes, gpu, .. } = self;
        let node = &mut nodes[id.0];
        let full_name = node.core().full_name();
        node.core_mut().clear_outputs();
        for (port, message) in node.core_mut().inputs_mut().iter_mut().zip(incoming) {
            port.pull(&full_name, message)?;
        }

        trace!(node = %full_name, "running node");
        node.run(gpu)
    }

    /// Messages currently published on the outputs linked to `id`'s inputs.
    fn incoming(&self, id: NodeId) -> Result<Vec<Message>> {
        let core = self.nodes[id.0].core();
        core.inputs()
            .iter()
            .map(|port| {
                let link = port.link().ok_or_else(|| PipelineError::NoIncomingLink {
                    node: core.full_name(),
                    port: port.name().to_string(),
                })?;
                let upstream = self.nodes[link.node.0].core();
                upstream.outputs()[link.port].message().copied().ok_or_else(|| {
                    PipelineError::EmptyOutput {
                        node: upstream.full_name(),
                        port: upstream.outputs()[link.port].name().to_string(),
                    }
                })
            })
            .collect()
    }

    fn export(&self) -> PipelineOutput {
        let sinks = self
            .sequence
            .iter()
            .map(|id| &self.nodes[id.0])
            .filter(|n| n.core().is_sink())
            .filter_map(|n| n.export().map(|out| (n.core().name().to_string(), out)))
            .collect();
        PipelineOutput { sinks }
    }

    fn clear_ports(&mut self) {
        for id in self.sequence.iter().rev() {
            self.nodes[id.0].core_mut().clear_ports();
        }
    }
}

/// Marks the pipeline busy for the duration of a tick.
struct BusyGuard<'a> {
    pipeline: &'a Pipeline,
}

impl<'a> BusyGuard<'a> {
    fn acquire(pipeline: &'a Pipeline) -> Self {
        pipeline.busy.set(true);
        BusyGuard { pipeline }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.pipeline.inner.try_borrow_mut() {
            inner.clear_ports();
        }
        self.pipeline.busy.set(false);
    }
}

/// An initialised pipeline.
pub struct Pipeline {
    inner: RefCell<Inner>,
    busy: Cell<bool>,
}

impl Pipeline {
    /// Run every node once and collect the sink outputs.
    ///
    /// A call made while another `run()` is in flight waits for it to
    /// finish, then runs.
    ///
    /// # Errors
    /// The first error raised by any node. Ports are cleared either way.
    pub async fn run(&self) -> Result<PipelineOutput> {
        while self.busy.get() {
            yield_now().await;
        }
        let _guard = BusyGuard::acquire(self);

        let len = self.inner.borrow().sequence.len();
        for i in 0..len {
            let task = self.inner.borrow_mut().execute(i)?;
            if let NodeTask::Pending(readback) = task {
                let pixels = readback.await?;
                let mut inner = self.inner.borrow_mut();
                let id = inner.sequence[i];
                inner.nodes[id.0].complete(pixels)?;
            }
            let inner = self.inner.borrow();
            inner.nodes[inner.sequence[i].0].core().check_outputs()?;
        }

        let output = self.inner.borrow().export();
        trace!(sinks = output.len(), "pipeline tick complete");
        Ok(output)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }

    /// Id of the node called `name`.
    pub fn node_id(&self, name: &str) -> Result<NodeId> {
        self.inner
            .borrow()
            .nodes
            .iter()
            .position(|n| n.core().name() == name)
            .map(NodeId)
            .ok_or_else(|| PipelineError::UnknownNode(name.to_string()))
    }

    /// Node names in execution order.
    pub fn sequence(&self) -> Vec<String> {
        let inner = self.inner.borrow();
        inner.sequence.iter().map(|id| inner.nodes[id.0].core().name().to_string()).collect()
    }

    /// Shared access to a node of concrete type `T`.
    pub fn node<T: PipelineNode>(&self, id: NodeId) -> Result<Ref<'_, T>> {
        let inner = self.inner.try_borrow().map_err(|_| PipelineError::Busy)?;
        let name = Self::node_name(&inner, id)?;
        Ref::filter_map(inner, |i| (*i.nodes[id.0]).as_any().downcast_ref::<T>())
            .map_err(|_| PipelineError::WrongNodeType(name))
    }

    /// Exclusive access to a node of concrete type `T`, for configuration.
    ///
    /// # Errors
    /// `Busy` while a tick is in flight, `WrongNodeType` if the node isn't
    /// a `T`.
    pub fn node_mut<T: PipelineNode>(&self, id: NodeId) -> Result<RefMut<'_, T>> {
        if self.busy.get() {
            return Err(PipelineError::Busy);
        }
        let inner = self.inner.try_borrow_mut().map_err(|_| PipelineError::Busy)?;
        let name = Self::node_name(&inner, id)?;
        RefMut::filter_map(inner, |i| (*i.nodes[id.0]).as_any_mut().downcast_mut::<T>())
            .map_err(|_| PipelineError::WrongNodeType(name))
    }

    fn node_name(inner: &Inner, id: NodeId) -> Result<String> {
        inner
            .nodes
            .get(id.0)
            .map(|n| n.core().full_name())
            .ok_or_else(|| PipelineError::UnknownNode(format!("#{}", id.0)))
    }

    /// Generation of the underlying device.
    pub fn generation(&self) -> u64 {
        self.inner.borrow().gpu.generation()
    }

    /// Free textures left in the pool.
    pub fn available_textures(&self) -> usize {
        self.inner.borrow().gpu.pool().available()
    }

    /// Simulate a device loss. Takes effect immediately, even while a tick
    /// is awaiting a readback.
    pub fn lose_context(&self) -> Result<()> {
        let mut inner = self.inner.try_borrow_mut().map_err(|_| PipelineError::Busy)?;
        inner.gpu.lose_context();
        Ok(())
    }

    pub fn is_context_lost(&self) -> bool {
        self.inner.borrow().gpu.is_lost()
    }

    /// Rebuild the device and re-initialise every node in order, keeping
    /// the graph and the node configuration.
    pub fn restore(&self) -> Result<()> {
        if self.busy.get() {
            return Err(PipelineError::Busy);
        }
        let mut inner = self.inner.try_borrow_mut().map_err(|_| PipelineError::Busy)?;
        let Inner { nodes, sequence, gpu } = &mut *inner;
        gpu.restore();
        for id in sequence.iter() {
            let node = &mut nodes[id.0];
            node.core_mut().forget_textures();
            node.init(gpu)?;
        }
        debug!(generation = gpu.generation(), "pipeline restored");
        Ok(())
    }

    /// Release every node in reverse order, then drop the device.
    pub fn release(self) -> Result<()> {
        if self.busy.get() {
            return Err(PipelineError::Busy);
        }
        let Inner { mut nodes, sequence, mut gpu } = self.inner.into_inner();
        for id in sequence.iter().rev() {
            nodes[id.0].release(&mut gpu)?;
        }
        info!(nodes = sequence.len(), "pipeline released");
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("sequence", &self.sequence())
            .field("busy", &self.busy.get())
            .finish()
    }
}
