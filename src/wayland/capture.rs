//! wlr-export-dmabuf capture and linux-dmabuf import on a live connection

use wayland_client::protocol::wl_buffer::{self, WlBuffer};
use wayland_client::{delegate_noop, Connection, Dispatch, QueueHandle, WEnum};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_buffer_params_v1::{
    self, ZwpLinuxBufferParamsV1,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1;
use wayland_protocols_wlr::export_dmabuf::v1::client::zwlr_export_dmabuf_frame_v1::{
    self, ZwlrExportDmabufFrameV1,
};
use wayland_protocols_wlr::export_dmabuf::v1::client::zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1;

use crate::assembler::{CancelReason, CaptureEvent, FrameTimestamp};
use crate::error::MirrorError;
use crate::frame::{BufferId, FrameMetadata, PlaneDescriptor, PlaneHandle};
use crate::importer::{DisplaySubsystem, ImportDescriptor};
use crate::presentation::PresentationSurface;
use crate::session::{CaptureService, RequestId, SourceId};

use super::display::OutputList;
use super::window::Window;
use super::{App, Globals};

/// A wl_buffer created from DMA-BUF planes.
///
/// The params object stays alive with the buffer so a late `failed` event
/// can still be matched to it.
pub struct ImportedDmabuf {
    buffer: WlBuffer,
    params: ZwpLinuxBufferParamsV1,
}

/// The session's view of the connection for the duration of one dispatch.
pub struct WaylandPort<'a> {
    globals: &'a Globals,
    window: &'a mut Window,
    outputs: &'a OutputList,
    capture_frame: &'a mut Option<ZwlrExportDmabufFrameV1>,
    qh: &'a QueueHandle<App>,
}

impl<'a> WaylandPort<'a> {
    pub fn new(
        globals: &'a Globals,
        window: &'a mut Window,
        outputs: &'a OutputList,
        capture_frame: &'a mut Option<ZwlrExportDmabufFrameV1>,
        qh: &'a QueueHandle<App>,
    ) -> Self {
        Self {
            globals,
            window,
            outputs,
            capture_frame,
            qh,
        }
    }
}

impl CaptureService for WaylandPort<'_> {
    fn request_capture(
        &mut self,
        request: RequestId,
        source: SourceId,
        include_cursor: bool,
    ) -> Result<(), MirrorError> {
        let output = self
            .outputs
            .find(source.0)
            .ok_or(MirrorError::SourceUnavailable { id: source.0 })?;
        let frame = self.globals.export_manager.capture_output(
            i32::from(include_cursor),
            &output.proxy,
            self.qh,
            request,
        );
        *self.capture_frame = Some(frame);
        Ok(())
    }
}

fn to_i32(value: u32, what: &str) -> Result<i32, MirrorError> {
    i32::try_from(value)
        .map_err(|_| MirrorError::import(format!("{} {} out of range", what, value)))
}

impl DisplaySubsystem for WaylandPort<'_> {
    type Buffer = ImportedDmabuf;

    fn import(
        &mut self,
        id: BufferId,
        descriptor: &ImportDescriptor<'_>,
    ) -> Result<ImportedDmabuf, MirrorError> {
        let width = to_i32(descriptor.width, "width")?;
        let height = to_i32(descriptor.height, "height")?;

        let params = self.globals.dmabuf.create_params(self.qh, id);
        for plane in &descriptor.planes {
            params.add(
                plane.fd,
                plane.plane_index,
                plane.offset,
                plane.stride,
                plane.modifier_hi,
                plane.modifier_lo,
            );
        }
        let buffer = params.create_immed(
            width,
            height,
            descriptor.format,
            zwp_linux_buffer_params_v1::Flags::from_bits_truncate(descriptor.flags),
            self.qh,
            id,
        );

        Ok(ImportedDmabuf { buffer, params })
    }

    fn destroy(&mut self, imported: ImportedDmabuf) {
        imported.buffer.destroy();
        imported.params.destroy();
    }
}

impl PresentationSurface for WaylandPort<'_> {
    fn is_configured(&self) -> bool {
        self.window.is_configured()
    }

    fn attach(&mut self, imported: &ImportedDmabuf) {
        self.window.surface().attach(Some(&imported.buffer), 0, 0);
    }

    fn damage_all(&mut self) {
        self.window.damage_all();
    }

    fn commit(&mut self) {
        self.window.surface().commit();
    }
}

fn cancel_reason(reason: WEnum<zwlr_export_dmabuf_frame_v1::CancelReason>) -> CancelReason {
    match reason {
        WEnum::Value(zwlr_export_dmabuf_frame_v1::CancelReason::Permanent) => {
            CancelReason::Permanent
        }
        // temporary, resizing and anything newer are worth another try
        _ => CancelReason::Transient,
    }
}

fn capture_event(event: zwlr_export_dmabuf_frame_v1::Event) -> Option<CaptureEvent> {
    use zwlr_export_dmabuf_frame_v1::Event;

    let event = match event {
        Event::Frame {
            width,
            height,
            offset_x,
            offset_y,
            buffer_flags,
            format,
            mod_high,
            mod_low,
            num_objects,
            ..
        } => CaptureEvent::Start(FrameMetadata {
            width,
            height,
            offset_x,
            offset_y,
            buffer_flags,
            format,
            modifier: FrameMetadata::modifier_from_halves(mod_high, mod_low),
            num_objects,
        }),
        Event::Object {
            index,
            fd,
            size,
            offset,
            stride,
            plane_index,
        } => CaptureEvent::Object(PlaneDescriptor {
            index,
            plane_index,
            handle: PlaneHandle::new(fd),
            byte_size: size,
            byte_offset: offset,
            row_stride: stride,
        }),
        Event::Ready {
            tv_sec_hi,
            tv_sec_lo,
            tv_nsec,
        } => CaptureEvent::Ready(FrameTimestamp::from_parts(tv_sec_hi, tv_sec_lo, tv_nsec)),
        Event::Cancel { reason } => CaptureEvent::Cancel(cancel_reason(reason)),
        _ => return None,
    };
    Some(event)
}

/// Clear the outstanding slot if `finished` is what it holds. A newer request
/// may already have replaced it.
fn forget_finished<T: PartialEq>(outstanding: &mut Option<T>, finished: &T) -> bool {
    if outstanding.as_ref() == Some(finished) {
        *outstanding = None;
        true
    } else {
        false
    }
}

impl Dispatch<ZwlrExportDmabufFrameV1, RequestId> for App {
    fn event(
        state: &mut Self,
        frame: &ZwlrExportDmabufFrameV1,
        event: zwlr_export_dmabuf_frame_v1::Event,
        request: &RequestId,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        let Some(event) = capture_event(event) else {
            return;
        };
        // ready and cancel end the request on the compositor side
        if matches!(event, CaptureEvent::Ready(_) | CaptureEvent::Cancel(_)) {
            if let Some(mirror) = state.mirror.as_mut() {
                forget_finished(&mut mirror.capture_frame, frame);
            }
            frame.destroy();
        }
        state.with_port(qh, |session, port| session.handle_event(*request, event, port));
    }
}

impl Dispatch<ZwpLinuxBufferParamsV1, BufferId> for App {
    fn event(
        state: &mut Self,
        _params: &ZwpLinuxBufferParamsV1,
        event: zwp_linux_buffer_params_v1::Event,
        id: &BufferId,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let zwp_linux_buffer_params_v1::Event::Failed = event {
            state.with_port(qh, |session, port| session.import_failed(*id, port));
        }
    }
}

impl Dispatch<WlBuffer, BufferId> for App {
    fn event(
        state: &mut Self,
        _buffer: &WlBuffer,
        event: wl_buffer::Event,
        id: &BufferId,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            tracing::trace!(buffer = id.0, "buffer released");
            state.with_port(qh, |session, port| session.buffer_released(*id, port));
        }
    }
}

delegate_noop!(App: ignore ZwpLinuxDmabufV1);
delegate_noop!(App: ZwlrExportDmabufManagerV1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_reason_mapping() {
        use zwlr_export_dmabuf_frame_v1::CancelReason as Wire;

        assert_eq!(cancel_reason(WEnum::Value(Wire::Permanent)), CancelReason::Permanent);
        assert_eq!(cancel_reason(WEnum::Value(Wire::Temporary)), CancelReason::Transient);
        assert_eq!(cancel_reason(WEnum::Value(Wire::Resizing)), CancelReason::Transient);
        assert_eq!(cancel_reason(WEnum::Unknown(9)), CancelReason::Transient);
    }

    #[test]
    fn test_ready_event_timestamp() {
        let event = capture_event(zwlr_export_dmabuf_frame_v1::Event::Ready {
            tv_sec_hi: 1,
            tv_sec_lo: 2,
            tv_nsec: 500,
        });
        match event {
            Some(CaptureEvent::Ready(ts)) => {
                assert_eq!(ts.secs, (1u64 << 32) | 2);
                assert_eq!(ts.nanos, 500);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_frame_event_metadata() {
        let event = capture_event(zwlr_export_dmabuf_frame_v1::Event::Frame {
            width: 800,
            height: 600,
            offset_x: 0,
            offset_y: 0,
            buffer_flags: 1,
            flags: WEnum::Unknown(0),
            format: 0x3432_5258,
            mod_high: 0x0100_0000,
            mod_low: 4,
            num_objects: 1,
        });
        match event {
            Some(CaptureEvent::Start(meta)) => {
                assert_eq!((meta.width, meta.height), (800, 600));
                assert_eq!(meta.modifier, 0x0100_0000_0000_0004);
                assert_eq!(meta.buffer_flags, 1);
                assert_eq!(meta.num_objects, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_finished_frame_is_forgotten() {
        let mut outstanding = Some(3);
        assert!(!forget_finished(&mut outstanding, &2));
        assert_eq!(outstanding, Some(3));
        assert!(forget_finished(&mut outstanding, &3));
        assert_eq!(outstanding, None);
        assert!(!forget_finished(&mut outstanding, &3));
    }

    #[test]
    fn test_dimension_conversion() {
        assert_eq!(to_i32(1920, "width"), Ok(1920));
        assert!(matches!(
            to_i32(u32::MAX, "width"),
            Err(MirrorError::ImportFailed { .. })
        ));
    }
}
