// pipeline/port.rs — Typed, predicate-checked node ports.
//
// A port belongs to exactly one node. It declares the type of message it
// accepts and, optionally, a predicate the message must also satisfy:
//
//   InputPort::new("in").expects(MessageType::Keypoints)
//       .satisfying(|m| m.as_keypoints().is_some_and(|k| k.descriptor_size == 0))
//
// PER-TICK STATE
// ──────────────
//   Empty ──write/pull──► Holding ──clear──► Empty
//
// Output ports are cleared right before their node runs; input ports pull
// from their link right after. Everything is cleared again at the end of
// the tick, whether it succeeded or not.

use std::fmt;

use crate::error::{PipelineError, Result};
use crate::pipeline::message::{Message, MessageType};
use crate::pipeline::node::NodeId;

pub const DEFAULT_INPUT: &str = "in";
pub const DEFAULT_OUTPUT: &str = "out";

/// Extra condition on accepted messages.
pub type MessagePredicate = fn(&Message) -> bool;

/// What a port accepts.
#[derive(Clone, Copy)]
pub struct PortSpec {
    expected: MessageType,
    predicate: Option<MessagePredicate>,
}

impl PortSpec {
    pub fn expected(&self) -> MessageType {
        self.expected
    }

    /// Connections are nominal: both ends must expect the same type.
    pub fn is_compatible_with(&self, other: &PortSpec) -> bool {
        self.expected == other.expected
    }

    pub fn accepts(&self, message: &Message) -> bool {
        message.message_type() == self.expected && self.predicate.map_or(true, |p| p(message))
    }
}

impl fmt::Debug for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortSpec")
            .field("expected", &self.expected)
            .field("constrained", &self.predicate.is_some())
            .finish()
    }
}

/// The output port an input port is linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node: NodeId,
    pub port: usize,
}

/// A named input port.
#[derive(Debug, Clone)]
pub struct InputPort {
    name: String,
    spec: PortSpec,
    link: Option<PortRef>,
    message: Option<Message>,
}

impl InputPort {
    pub fn new(name: impl Into<String>) -> Self {
        InputPort {
            name: name.into(),
            spec: PortSpec { expected: MessageType::Nothing, predicate: None },
            link: None,
            message: None,
        }
    }

    /// # Panics
    /// Panics if `ty` is `Nothing`: no port ever expects an empty message.
    pub fn expects(mut self, ty: MessageType) -> Self {
        assert_ne!(ty, MessageType::Nothing, "a port can't expect Nothing");
        self.spec.expected = ty;
        self
    }

    /// # Panics
    /// Panics if called before `expects`.
    pub fn satisfying(mut self, predicate: MessagePredicate) -> Self {
        assert_ne!(
            self.spec.expected,
            MessageType::Nothing,
            "declare the expected message type first"
        );
        self.spec.predicate = Some(predicate);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &PortSpec {
        &self.spec
    }

    pub fn link(&self) -> Option<PortRef> {
        self.link
    }

    pub(crate) fn set_link(&mut self, link: PortRef) {
        self.link = Some(link);
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Receive the message published on the linked output.
    ///
    /// # Errors
    /// `MessageRejected` if the message fails the type or the predicate.
    pub(crate) fn pull(&mut self, node: &str, message: Message) -> Result<()> {
        if !self.spec.accepts(&message) {
            return Err(PipelineError::MessageRejected {
                node: node.to_string(),
                port: self.name.clone(),
                message: message.to_string(),
            });
        }
        self.message = Some(message);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.message = None;
    }
}

/// A named output port. Fans out to any number of inputs.
#[derive(Debug, Clone)]
pub struct OutputPort {
    name: String,
    spec: PortSpec,
    message: Option<Message>,
}

impl OutputPort {
    pub fn new(name: impl Into<String>) -> Self {
        OutputPort {
            name: name.into(),
            spec: PortSpec { expected: MessageType::Nothing, predicate: None },
            message: None,
        }
    }

    /// # Panics
    /// Panics if `ty` is `Nothing`.
    pub fn expects(mut self, ty: MessageType) -> Self {
        assert_ne!(ty, MessageType::Nothing, "a port can't expect Nothing");
        self.spec.expected = ty;
        self
    }

    /// # Panics
    /// Panics if called before `expects`.
    pub fn satisfying(mut self, predicate: MessagePredicate) -> Self {
        assert_ne!(
            self.spec.expected,
            MessageType::Nothing,
            "declare the expected message type first"
        );
        self.spec.predicate = Some(predicate);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &PortSpec {
        &self.spec
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Publish a message for this tick.
    ///
    /// # Errors
    /// `MessageRejected` if the message doesn't match this port's own spec.
    pub(crate) fn write(&mut self, node: &str, message: Message) -> Result<()> {
        if !self.spec.accepts(&message) {
            return Err(PipelineError::MessageRejected {
                node: node.to_string(),
                port: self.name.clone(),
                message: message.to_string(),
            });
        }
        self.message = Some(message);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.message = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::TextureHandle;
    use crate::pipeline::message::{ImageFormat, KeypointsMessage};

    fn no_descriptors(m: &Message) -> bool {
        m.as_keypoints().is_some_and(|k| k.descriptor_size == 0)
    }

    #[test]
    fn input_checks_type_and_predicate() {
        let mut port = InputPort::new("in")
            .expects(MessageType::Keypoints)
            .satisfying(no_descriptors);
        let h = TextureHandle::SURFACE;

        let image = Message::image(h, ImageFormat::Rgba);
        assert!(matches!(
            port.pull("Clipper[c]", image),
            Err(PipelineError::MessageRejected { .. })
        ));

        let with_desc = Message::Keypoints(KeypointsMessage::new(h, 32, 0, 8).unwrap());
        assert!(port.pull("Clipper[c]", with_desc).is_err());

        let plain = Message::Keypoints(KeypointsMessage::new(h, 0, 0, 8).unwrap());
        port.pull("Clipper[c]", plain).unwrap();
        assert_eq!(port.message(), Some(&plain));
        port.clear();
        assert!(port.message().is_none());
    }

    #[test]
    fn compatibility_is_nominal() {
        let a = OutputPort::new("out").expects(MessageType::Image);
        let b = InputPort::new("in").expects(MessageType::Image);
        let c = InputPort::new("in").expects(MessageType::Keypoints);
        assert!(a.spec().is_compatible_with(b.spec()));
        assert!(!a.spec().is_compatible_with(c.spec()));
    }

    #[test]
    #[should_panic(expected = "declare the expected message type first")]
    fn predicate_needs_a_type() {
        let _ = InputPort::new("in").satisfying(no_descriptors);
    }
}
