// pipeline/mod.rs — Typed dataflow graph of GPU nodes.
//
//   message   values on the wire (Nothing / Image / Keypoints)
//   port      named, typed, predicate-checked endpoints
//   node      PipelineNode trait + NodeCore plumbing
//   graph     builder, topological sort, the async tick loop
//   nodes     the node catalogue

pub mod graph;
pub mod message;
pub mod node;
pub mod nodes;
pub mod port;

pub use graph::{Pipeline, PipelineBuilder, PipelineOutput};
pub use message::{ImageFormat, KeypointsMessage, Message, MessageType};
pub use node::{NodeCore, NodeId, NodeTask, PipelineNode, SinkOutput};
pub use port::{InputPort, OutputPort, PortRef, PortSpec};
