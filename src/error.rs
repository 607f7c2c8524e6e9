// error.rs — Error type shared by the pipeline and the reference device.
//
// TAXONOMY
// ────────
//   Configuration  programmer errors: wrong port name, wrong message type,
//                  missing media, cyclic graph, bad kernel arguments, ...
//                  Fatal. Detected as early as possible (ideally at init).
//
//   Device         the device went away (context loss) or ran out of pooled
//                  textures. Recoverable by rebuilding the device-bound state
//                  with `Pipeline::restore()`.
//
// Keypoints that fail validity checks (null / discarded records, invalid
// permutation entries) are NOT errors. They travel in-band inside the
// encoded textures and are filtered by whoever decodes them.
//
// Every variant that can be localised carries the node and port names, so a
// failing tick points at the exact call site that broke the contract.

use thiserror::Error;

/// Broad classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Illegal argument / illegal operation. Never silently recovered.
    Configuration,
    /// Context loss or resource exhaustion on the device.
    Device,
}

/// Errors raised while building, running or tearing down a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ---- graph construction ------------------------------------------------
    #[error("invalid node name {0:?}")]
    InvalidNodeName(String),

    #[error("no ports have been declared in node {0}")]
    NoPorts(String),

    #[error("duplicate port {port:?} in node {node}")]
    DuplicatePort { node: String, port: String },

    #[error("a node named {0:?} already exists in this pipeline")]
    DuplicateNode(String),

    #[error("can't find node {0:?}")]
    UnknownNode(String),

    #[error("can't find {direction} port {port:?} in node {node}")]
    UnknownPort {
        node: String,
        port: String,
        direction: &'static str,
    },

    #[error("incompatible ports: {from} ({from_type}) can't feed {to} ({to_type})")]
    IncompatiblePorts {
        from: String,
        from_type: &'static str,
        to: String,
        to_type: &'static str,
    },

    #[error("input port {port:?} of node {node} is already connected")]
    AlreadyConnected { node: String, port: String },

    #[error("node {0} can't be connected to itself")]
    SelfLink(String),

    #[error("pipeline networks cannot have cycles (detected at node {0})")]
    Cycle(String),

    #[error("pipeline doesn't have nodes")]
    NoNodes,

    #[error("pipeline doesn't have a source")]
    NoSource,

    #[error("pipeline doesn't have a sink")]
    NoSink,

    #[error("node {0} is not of the requested type")]
    WrongNodeType(String),

    #[error("the pipeline is busy")]
    Busy,

    #[error("node {0} has not been initialized")]
    NotInitialized(String),

    // ---- tick-time contracts -----------------------------------------------
    #[error("input port {port:?} of node {node} has no incoming link")]
    NoIncomingLink { node: String, port: String },

    #[error("port {port:?} of node {node} rejected a {message}")]
    MessageRejected {
        node: String,
        port: String,
        message: String,
    },

    #[error("did you forget to write data to the output port {port:?} of {node}?")]
    EmptyOutput { node: String, port: String },

    #[error("node {0} requires media; call set_media() before running the pipeline")]
    MissingMedia(String),

    #[error("can't merge two sets of keypoints that have different formats in node {0}")]
    FormatMismatch(String),

    #[error("invalid input port index {index} in node {node} (it has {count} inputs)")]
    InvalidPortIndex {
        node: String,
        index: usize,
        count: usize,
    },

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("portal error: {0} holds no data")]
    PortalEmpty(String),

    #[error("{0} has no source")]
    NoPortalSource(String),

    // ---- kernels -----------------------------------------------------------
    #[error("unknown program {group}.{name}")]
    UnknownProgram { group: String, name: String },

    #[error("can't run kernel {kernel}: expected {expected} arguments, got {got}")]
    KernelArity {
        kernel: String,
        expected: usize,
        got: usize,
    },

    #[error("can't run kernel {kernel}: bad argument {param:?} ({reason})")]
    KernelArgument {
        kernel: String,
        param: String,
        reason: String,
    },

    #[error("kernel {0} can't read from the texture it is writing to; use ping-pong outputs")]
    KernelFeedback(String),

    #[error("kernel {0} has no output configured; call outputs() first")]
    NoKernelOutput(String),

    // ---- resources ---------------------------------------------------------
    #[error("unmanaged texture or double free (handle {0})")]
    DoubleFree(u32),

    #[error("invalid texture handle {0}")]
    InvalidTexture(u32),

    #[error("texture size {width}x{height} exceeds the device limit of {max}")]
    TextureTooLarge { width: u32, height: u32, max: u32 },

    #[error("the GPU context has been lost")]
    ContextLost,

    #[error("exhausted texture pool (capacity: {0})")]
    OutOfMemory(usize),
}

impl PipelineError {
    /// Configuration errors are fatal; device errors call for `restore()`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::ContextLost | PipelineError::OutOfMemory(_) => ErrorKind::Device,
            _ => ErrorKind::Configuration,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_are_classified() {
        assert_eq!(PipelineError::ContextLost.kind(), ErrorKind::Device);
        assert_eq!(PipelineError::OutOfMemory(16).kind(), ErrorKind::Device);
        assert_eq!(PipelineError::NoSink.kind(), ErrorKind::Configuration);
        assert_eq!(PipelineError::Cycle("a".into()).kind(), ErrorKind::Configuration);
    }

    #[test]
    fn messages_name_the_fault_site() {
        let e = PipelineError::EmptyOutput { node: "Clipper[clip]".into(), port: "out".into() };
        let s = e.to_string();
        assert!(s.contains("Clipper[clip]") && s.contains("\"out\""), "{s}");
    }
}
