//! Test doubles for the capture service, display subsystem and surface

use std::io::{ErrorKind, Read};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use crate::error::MirrorError;
use crate::frame::{BufferId, FrameMetadata, PendingFrame, PlaneDescriptor, PlaneHandle, ReadyFrame};
use crate::importer::{DisplaySubsystem, ImportDescriptor};
use crate::presentation::PresentationSurface;
use crate::session::{CaptureService, RequestId, SourceId};

/// XRGB8888
const FORMAT_XRGB8888: u32 = 0x3432_5258;

/// Observes whether the descriptor handed out with it has been closed.
pub struct Probe {
    peer: UnixStream,
}

impl Probe {
    pub fn is_closed(&self) -> bool {
        let mut buf = [0u8; 1];
        match (&self.peer).read(&mut buf) {
            Ok(0) => true,
            Err(e) if e.kind() == ErrorKind::WouldBlock => false,
            other => panic!("unexpected probe read: {:?}", other),
        }
    }
}

pub fn tracked_handle() -> (PlaneHandle, Probe) {
    let (ours, peer) = UnixStream::pair().unwrap();
    peer.set_nonblocking(true).unwrap();
    (PlaneHandle::new(OwnedFd::from(ours)), Probe { peer })
}

pub fn tracked_plane(index: u32) -> (PlaneDescriptor, Probe) {
    let (handle, probe) = tracked_handle();
    let plane = PlaneDescriptor {
        index,
        plane_index: index,
        handle,
        byte_size: 1920 * 1080 * 4,
        byte_offset: 0,
        row_stride: 1920 * 4,
    };
    (plane, probe)
}

pub fn metadata(num_objects: u32) -> FrameMetadata {
    FrameMetadata {
        width: 1920,
        height: 1080,
        offset_x: 0,
        offset_y: 0,
        buffer_flags: 0,
        format: FORMAT_XRGB8888,
        modifier: 0,
        num_objects,
    }
}

/// A fully populated pending frame, objects inserted in `order`.
pub fn complete_frame(meta: FrameMetadata, order: &[u32]) -> (PendingFrame, Vec<Probe>) {
    let mut frame = PendingFrame::new(meta).unwrap();
    let probes = order
        .iter()
        .map(|&index| {
            let (mut plane, probe) = tracked_plane(index);
            plane.row_stride = meta.width * 4;
            frame.insert(plane).unwrap();
            probe
        })
        .collect();
    (frame, probes)
}

pub fn ready_frame(id: u64) -> (ReadyFrame<FakeBuffer>, Vec<Probe>) {
    let (plane, probe) = tracked_plane(0);
    let frame = ReadyFrame {
        id: BufferId(id),
        metadata: metadata(1),
        planes: vec![plane],
        buffer: FakeBuffer(BufferId(id)),
    };
    (frame, vec![probe])
}

#[derive(Debug, PartialEq, Eq)]
pub struct FakeBuffer(pub BufferId);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPlane {
    pub plane_index: u32,
    pub offset: u32,
    pub stride: u32,
    pub modifier_hi: u32,
    pub modifier_lo: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedImport {
    pub id: BufferId,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub flags: u32,
    pub planes: Vec<RecordedPlane>,
}

/// Records every call the session makes.
#[derive(Debug, Default)]
pub struct FakeBackend {
    pub configured: bool,
    pub fail_imports: bool,
    pub requests: Vec<(RequestId, SourceId, bool)>,
    pub imports: Vec<RecordedImport>,
    pub destroyed: Vec<BufferId>,
    pub surface_ops: Vec<String>,
    pub commits: Vec<BufferId>,
    attached: Option<BufferId>,
    shown: Vec<BufferId>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configured() -> Self {
        Self {
            configured: true,
            ..Self::default()
        }
    }

    /// Ids of buffers that were committed but are no longer on screen,
    /// each returned once.
    pub fn take_attached_except_last(&mut self) -> Vec<BufferId> {
        let keep = self.shown.pop();
        let released = std::mem::take(&mut self.shown);
        self.shown.extend(keep);
        released
    }
}

impl CaptureService for FakeBackend {
    fn request_capture(
        &mut self,
        request: RequestId,
        source: SourceId,
        include_cursor: bool,
    ) -> Result<(), MirrorError> {
        self.requests.push((request, source, include_cursor));
        Ok(())
    }
}

impl DisplaySubsystem for FakeBackend {
    type Buffer = FakeBuffer;

    fn import(
        &mut self,
        id: BufferId,
        descriptor: &ImportDescriptor<'_>,
    ) -> Result<FakeBuffer, MirrorError> {
        self.imports.push(RecordedImport {
            id,
            width: descriptor.width,
            height: descriptor.height,
            format: descriptor.format,
            flags: descriptor.flags,
            planes: descriptor
                .planes
                .iter()
                .map(|p| RecordedPlane {
                    plane_index: p.plane_index,
                    offset: p.offset,
                    stride: p.stride,
                    modifier_hi: p.modifier_hi,
                    modifier_lo: p.modifier_lo,
                })
                .collect(),
        });
        if self.fail_imports {
            return Err(MirrorError::import("unsupported format/modifier"));
        }
        Ok(FakeBuffer(id))
    }

    fn destroy(&mut self, buffer: FakeBuffer) {
        self.destroyed.push(buffer.0);
    }
}

impl PresentationSurface for FakeBackend {
    fn is_configured(&self) -> bool {
        self.configured
    }

    fn attach(&mut self, buffer: &FakeBuffer) {
        self.attached = Some(buffer.0);
        self.surface_ops.push(format!("attach:{}", buffer.0 .0));
    }

    fn damage_all(&mut self) {
        self.surface_ops.push("damage".to_string());
    }

    fn commit(&mut self) {
        self.surface_ops.push("commit".to_string());
        if let Some(id) = self.attached {
            self.commits.push(id);
            self.shown.push(id);
        }
    }
}
