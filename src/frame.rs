//! DMA-BUF frame bookkeeping: plane handles, pending and ready frames

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use crate::error::MirrorError;

/// Token naming one imported buffer across its asynchronous lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Owned kernel buffer handle delivered by the capture service.
///
/// The descriptor is closed by `close()` or when the handle is dropped,
/// whichever comes first, and never twice.
#[derive(Debug)]
pub struct PlaneHandle {
    fd: Option<OwnedFd>,
}

impl PlaneHandle {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }

    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd)
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Close the descriptor. Returns false if it was already closed.
    pub fn close(&mut self) -> bool {
        match self.fd.take() {
            Some(fd) => {
                tracing::trace!(fd = fd.as_raw_fd(), "closing plane handle");
                drop(fd);
                true
            }
            None => false,
        }
    }
}

/// One buffer object of a frame.
#[derive(Debug)]
pub struct PlaneDescriptor {
    /// Object slot in the frame, `< num_objects`
    pub index: u32,
    /// Plane this object backs, passed through to the import
    pub plane_index: u32,
    pub handle: PlaneHandle,
    pub byte_size: u32,
    pub byte_offset: u32,
    pub row_stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub width: u32,
    pub height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub buffer_flags: u32,
    /// DRM fourcc
    pub format: u32,
    pub modifier: u64,
    pub num_objects: u32,
}

impl FrameMetadata {
    pub fn modifier_from_halves(hi: u32, lo: u32) -> u64 {
        (u64::from(hi) << 32) | u64::from(lo)
    }

    pub fn modifier_hi(&self) -> u32 {
        (self.modifier >> 32) as u32
    }

    pub fn modifier_lo(&self) -> u32 {
        self.modifier as u32
    }
}

/// A frame whose buffer objects are still arriving.
#[derive(Debug)]
pub struct PendingFrame {
    metadata: FrameMetadata,
    planes: Box<[Option<PlaneDescriptor>]>,
}

impl PendingFrame {
    /// Allocate the plane table for `metadata.num_objects` objects.
    pub fn new(metadata: FrameMetadata) -> Result<Self, MirrorError> {
        let count = metadata.num_objects as usize;
        let mut planes = Vec::new();
        planes
            .try_reserve_exact(count)
            .map_err(|_| MirrorError::AllocationFailure {
                objects: metadata.num_objects,
            })?;
        planes.resize_with(count, || None);

        Ok(Self {
            metadata,
            planes: planes.into_boxed_slice(),
        })
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    /// Store a buffer object at its declared slot.
    ///
    /// On error the rejected descriptor is dropped, which closes its handle.
    pub fn insert(&mut self, plane: PlaneDescriptor) -> Result<(), MirrorError> {
        let declared = self.planes.len();
        let slot = self
            .planes
            .get_mut(plane.index as usize)
            .ok_or_else(|| {
                MirrorError::protocol(format!(
                    "object index {} out of range for {} declared objects",
                    plane.index, declared
                ))
            })?;

        if slot.is_some() {
            return Err(MirrorError::protocol(format!(
                "object index {} delivered twice",
                plane.index
            )));
        }

        *slot = Some(plane);
        Ok(())
    }

    pub fn received(&self) -> usize {
        self.planes.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.planes.iter().all(Option::is_some)
    }

    #[cfg(test)]
    pub fn plane(&self, index: usize) -> Option<&PlaneDescriptor> {
        self.planes.get(index).and_then(Option::as_ref)
    }

    /// Close every handle still held. Safe to call repeatedly.
    pub fn close_all(&mut self) -> usize {
        self.planes
            .iter_mut()
            .flatten()
            .map(|plane| plane.handle.close())
            .filter(|&closed| closed)
            .count()
    }

    /// Give up the plane list once every slot is filled.
    pub fn into_planes(self) -> Result<(FrameMetadata, Vec<PlaneDescriptor>), Self> {
        if !self.is_complete() {
            return Err(self);
        }
        let planes = self.planes.into_vec().into_iter().flatten().collect();
        Ok((self.metadata, planes))
    }
}

/// An imported frame. Its handles stay open until `release` runs.
#[derive(Debug)]
pub struct ReadyFrame<B> {
    pub id: BufferId,
    pub metadata: FrameMetadata,
    pub planes: Vec<PlaneDescriptor>,
    pub buffer: B,
}

impl<B> ReadyFrame<B> {
    /// Hand the buffer back to `destroy` and close all plane handles.
    pub fn release(self, destroy: impl FnOnce(B)) -> usize {
        let Self {
            id,
            mut planes,
            buffer,
            ..
        } = self;
        destroy(buffer);
        let closed = planes
            .iter_mut()
            .map(|plane| plane.handle.close())
            .filter(|&closed| closed)
            .count();
        tracing::trace!(buffer = id.0, closed, "released frame");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{metadata, tracked_plane};

    #[test]
    fn test_modifier_halves() {
        let modifier = FrameMetadata::modifier_from_halves(0x0100_0000, 0x0000_0004);
        assert_eq!(modifier, 0x0100_0000_0000_0004);

        let mut meta = metadata(1);
        meta.modifier = modifier;
        assert_eq!(meta.modifier_hi(), 0x0100_0000);
        assert_eq!(meta.modifier_lo(), 0x0000_0004);
    }

    #[test]
    fn test_out_of_order_insertion() {
        let mut frame = PendingFrame::new(metadata(3)).unwrap();
        let mut probes = Vec::new();
        for index in [2, 0, 1] {
            let (plane, probe) = tracked_plane(index);
            frame.insert(plane).unwrap();
            probes.push((index, probe));
        }

        assert!(frame.is_complete());
        for i in 0..3 {
            assert_eq!(frame.plane(i).unwrap().index, i as u32);
        }
        assert!(probes.iter().all(|(_, p)| !p.is_closed()));
    }

    #[test]
    fn test_index_out_of_range_closes_handle() {
        let mut frame = PendingFrame::new(metadata(1)).unwrap();
        let (plane, probe) = tracked_plane(1);

        let err = frame.insert(plane).unwrap_err();
        assert!(matches!(err, MirrorError::ProtocolViolation { .. }));
        assert!(probe.is_closed());
        assert_eq!(frame.received(), 0);
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let mut frame = PendingFrame::new(metadata(2)).unwrap();
        let (first, first_probe) = tracked_plane(0);
        let (dup, dup_probe) = tracked_plane(0);

        frame.insert(first).unwrap();
        assert!(frame.insert(dup).is_err());
        assert!(dup_probe.is_closed());
        assert!(!first_probe.is_closed());
    }

    #[test]
    fn test_close_all_is_idempotent() {
        let mut frame = PendingFrame::new(metadata(3)).unwrap();
        let (a, probe_a) = tracked_plane(0);
        let (b, probe_b) = tracked_plane(2);
        frame.insert(a).unwrap();
        frame.insert(b).unwrap();

        // slot 1 never arrived and is skipped
        assert_eq!(frame.close_all(), 2);
        assert_eq!(frame.close_all(), 0);
        assert!(probe_a.is_closed());
        assert!(probe_b.is_closed());
    }

    #[test]
    fn test_into_planes_requires_complete_frame() {
        let mut frame = PendingFrame::new(metadata(2)).unwrap();
        let (plane, _probe) = tracked_plane(0);
        frame.insert(plane).unwrap();

        let frame = frame.into_planes().unwrap_err();
        assert_eq!(frame.received(), 1);
    }

    #[test]
    fn test_ready_frame_release() {
        let (plane, probe) = tracked_plane(0);
        let frame = ReadyFrame {
            id: BufferId(9),
            metadata: metadata(1),
            planes: vec![plane],
            buffer: "buffer",
        };

        let mut destroyed = None;
        assert_eq!(frame.release(|b| destroyed = Some(b)), 1);
        assert_eq!(destroyed, Some("buffer"));
        assert!(probe.is_closed());
    }

    #[test]
    fn test_release_counts_only_open_handles() {
        let (mut first, first_probe) = tracked_plane(0);
        let (second, second_probe) = tracked_plane(1);
        first.handle.close();
        let frame = ReadyFrame {
            id: BufferId(4),
            metadata: metadata(2),
            planes: vec![first, second],
            buffer: (),
        };

        assert_eq!(frame.release(|_| {}), 1);
        assert!(first_probe.is_closed());
        assert!(second_probe.is_closed());
    }
}
