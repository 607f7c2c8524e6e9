// gpu/reader.rs — Asynchronous readback and cooperative yielding.
//
// A readback is the only point where the pipeline suspends. The pixels are
// captured when the readback is issued (that is when a real device would
// enqueue the transfer into a pixel buffer object); the future then polls a
// completion fence until it signals:
//
//   poll #1 ── fence pending ── wake_by_ref(), Pending
//   poll #2 ── fence pending ── wake_by_ref(), Pending
//   poll #n ── fence signalled ── Ready(Ok(bitmap))
//
// The fence is polled, never waited on: each pending poll re-schedules the
// task and returns, so other futures on the same executor make progress.
// There is no timeout. A fence whose device is lost resolves to
// `ContextLost` on its next poll.

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{PipelineError, Result};
use crate::gpu::context::DeviceState;
use crate::media::Bitmap;

/// Completion fence for one transfer.
#[derive(Debug)]
pub struct Fence {
    state: Rc<DeviceState>,
    remaining: u32,
}

impl Fence {
    pub(crate) fn new(state: Rc<DeviceState>, latency: u32) -> Self {
        Fence { state, remaining: latency }
    }

    /// Check the fence once. `Some` when it has resolved.
    pub fn client_wait(&mut self) -> Option<Result<()>> {
        if self.state.is_lost() {
            return Some(Err(PipelineError::ContextLost));
        }
        match self.remaining {
            0 => Some(Ok(())),
            _ => {
                self.remaining -= 1;
                None
            }
        }
    }
}

impl Future for Fence {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.client_wait() {
            Some(status) => Poll::Ready(status),
            None => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

/// Pending readback of a texture.
#[derive(Debug)]
pub struct Readback {
    fence: Fence,
    pixels: Option<Bitmap>,
}

impl Readback {
    pub(crate) fn new(pixels: Bitmap, state: Rc<DeviceState>, latency: u32) -> Self {
        Readback {
            fence: Fence::new(state, latency),
            pixels: Some(pixels),
        }
    }
}

impl Future for Readback {
    type Output = Result<Bitmap>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.fence).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => match self.pixels.take() {
                Some(pixels) => Poll::Ready(Ok(pixels)),
                None => Poll::Ready(Err(PipelineError::IllegalArgument(
                    "readback polled after completion".into(),
                ))),
            },
        }
    }
}

/// Yield to the executor once.
pub(crate) fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub(crate) struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
