//! Turns the start / object / ready|cancel event stream into complete frames

use std::fmt;

use crate::error::MirrorError;
use crate::frame::{FrameMetadata, PendingFrame, PlaneDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Retrying is expected to succeed
    Transient,
    /// The output can no longer be captured
    Permanent,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Transient => write!(f, "transient"),
            CancelReason::Permanent => write!(f, "permanent"),
        }
    }
}

/// Presentation time of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameTimestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl FrameTimestamp {
    pub fn from_parts(secs_hi: u32, secs_lo: u32, nanos: u32) -> Self {
        Self {
            secs: (u64::from(secs_hi) << 32) | u64::from(secs_lo),
            nanos,
        }
    }
}

/// One event of a capture request's sequence.
#[derive(Debug)]
pub enum CaptureEvent {
    Start(FrameMetadata),
    Object(PlaneDescriptor),
    Ready(FrameTimestamp),
    Cancel(CancelReason),
}

/// What the assembler made of an event.
#[derive(Debug)]
pub enum Assembly {
    InProgress,
    Complete(PendingFrame, FrameTimestamp),
    /// The in-flight frame was discarded and its handles closed
    Cancelled(CancelReason),
}

#[derive(Debug, Default)]
pub struct FrameAssembler {
    current: Option<PendingFrame>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_assembling(&self) -> bool {
        self.current.is_some()
    }

    pub fn handle_event(&mut self, event: CaptureEvent) -> Result<Assembly, MirrorError> {
        match event {
            CaptureEvent::Start(metadata) => {
                if self.is_assembling() {
                    self.discard();
                    return Err(MirrorError::protocol(
                        "frame start while another frame is assembling",
                    ));
                }
                tracing::debug!(
                    width = metadata.width,
                    height = metadata.height,
                    format = format_args!("{:#010x}", metadata.format),
                    modifier = format_args!("{:#018x}", metadata.modifier),
                    objects = metadata.num_objects,
                    "frame start"
                );
                self.current = Some(PendingFrame::new(metadata)?);
                Ok(Assembly::InProgress)
            }
            CaptureEvent::Object(plane) => {
                let frame = self
                    .current
                    .as_mut()
                    .ok_or_else(|| MirrorError::protocol("buffer object without frame start"))?;
                tracing::trace!(
                    index = plane.index,
                    plane = plane.plane_index,
                    size = plane.byte_size,
                    offset = plane.byte_offset,
                    stride = plane.row_stride,
                    "buffer object"
                );
                if let Err(err) = frame.insert(plane) {
                    self.discard();
                    return Err(err);
                }
                Ok(Assembly::InProgress)
            }
            CaptureEvent::Ready(timestamp) => {
                let frame = self
                    .current
                    .take()
                    .ok_or_else(|| MirrorError::protocol("frame ready without frame start"))?;
                if !frame.is_complete() {
                    let received = frame.received();
                    let declared = frame.metadata().num_objects;
                    Self::close(frame);
                    return Err(MirrorError::protocol(format!(
                        "frame ready with {received} of {declared} objects"
                    )));
                }
                Ok(Assembly::Complete(frame, timestamp))
            }
            CaptureEvent::Cancel(reason) => {
                let frame = self
                    .current
                    .take()
                    .ok_or_else(|| MirrorError::protocol("frame cancel without frame start"))?;
                Self::close(frame);
                Ok(Assembly::Cancelled(reason))
            }
        }
    }

    /// Drop the in-flight frame, closing whatever handles it holds.
    pub fn discard(&mut self) -> usize {
        self.current.take().map(Self::close).unwrap_or(0)
    }

    fn close(mut frame: PendingFrame) -> usize {
        let closed = frame.close_all();
        tracing::debug!(closed, "discarded pending frame");
        closed
    }
}
