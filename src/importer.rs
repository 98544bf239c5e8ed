//! Builds displayable buffers out of assembled DMA-BUF frames

use std::os::fd::BorrowedFd;

use crate::error::MirrorError;
use crate::frame::{BufferId, FrameMetadata, PendingFrame, PlaneDescriptor, ReadyFrame};

/// `zwp_linux_buffer_params_v1.flags.y_invert`
pub const BUFFER_FLAG_Y_INVERT: u32 = 1;

#[derive(Debug, Clone, Copy)]
pub struct PlaneLayout<'a> {
    pub fd: BorrowedFd<'a>,
    pub plane_index: u32,
    pub offset: u32,
    pub stride: u32,
    pub modifier_hi: u32,
    pub modifier_lo: u32,
}

/// Everything the display subsystem needs for one immediate import.
#[derive(Debug, Clone)]
pub struct ImportDescriptor<'a> {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub flags: u32,
    pub planes: Vec<PlaneLayout<'a>>,
}

impl<'a> ImportDescriptor<'a> {
    /// The invert bit is always cleared: the mirror window presents top-down
    /// whatever orientation the source reports.
    pub fn new(
        metadata: &FrameMetadata,
        planes: &'a [PlaneDescriptor],
    ) -> Result<Self, MirrorError> {
        let planes = planes
            .iter()
            .map(|plane| {
                let fd = plane.handle.as_fd().ok_or_else(|| {
                    MirrorError::import(format!("object {} has no open handle", plane.index))
                })?;
                Ok(PlaneLayout {
                    fd,
                    plane_index: plane.plane_index,
                    offset: plane.byte_offset,
                    stride: plane.row_stride,
                    modifier_hi: metadata.modifier_hi(),
                    modifier_lo: metadata.modifier_lo(),
                })
            })
            .collect::<Result<Vec<_>, MirrorError>>()?;

        Ok(Self {
            width: metadata.width,
            height: metadata.height,
            format: metadata.format,
            flags: metadata.buffer_flags & !BUFFER_FLAG_Y_INVERT,
            planes,
        })
    }
}

/// The compositor side of buffer import.
pub trait DisplaySubsystem {
    type Buffer;

    /// Import immediately. The subsystem may still report a failure for
    /// `id` later.
    fn import(
        &mut self,
        id: BufferId,
        descriptor: &ImportDescriptor<'_>,
    ) -> Result<Self::Buffer, MirrorError>;

    fn destroy(&mut self, buffer: Self::Buffer);
}

/// Import an assembled frame.
///
/// On failure every plane handle is closed before the error is returned; on
/// success the handles belong to the returned frame.
pub fn import<D: DisplaySubsystem>(
    frame: PendingFrame,
    id: BufferId,
    display: &mut D,
) -> Result<ReadyFrame<D::Buffer>, MirrorError> {
    let (metadata, mut planes) = match frame.into_planes() {
        Ok(parts) => parts,
        Err(mut frame) => {
            frame.close_all();
            return Err(MirrorError::import("frame is missing buffer objects"));
        }
    };

    let imported = ImportDescriptor::new(&metadata, &planes)
        .and_then(|descriptor| display.import(id, &descriptor));

    match imported {
        Ok(buffer) => {
            tracing::debug!(buffer = id.0, planes = planes.len(), "imported frame");
            Ok(ReadyFrame {
                id,
                metadata,
                planes,
                buffer,
            })
        }
        Err(err) => {
            for plane in planes.iter_mut() {
                plane.handle.close();
            }
            Err(err)
        }
    }
}
