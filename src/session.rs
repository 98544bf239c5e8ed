//! Capture session controller
//!
//! Drives the request/response cycle against the capture service: one
//! request in flight at a time, events fed through the [`FrameAssembler`],
//! completed frames imported and handed to the [`PresentationSlots`], and a
//! new request issued as soon as the previous one finished. Transient
//! cancellations are retried immediately; permanent ones and protocol errors
//! end the session.

use crate::assembler::{Assembly, CancelReason, CaptureEvent, FrameAssembler, FrameTimestamp};
use crate::error::MirrorError;
use crate::frame::{BufferId, PendingFrame};
use crate::importer;
use crate::presentation::{PresentationSlots, PresentationSurface};
use crate::shutdown::StopFlag;

/// Opaque identifier of a capturable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u32);

/// Token tying capture events to the request that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// The compositor side of frame capture.
pub trait CaptureService {
    /// Ask for one frame of `source`. Events for it must be delivered tagged
    /// with `request`.
    fn request_capture(
        &mut self,
        request: RequestId,
        source: SourceId,
        include_cursor: bool,
    ) -> Result<(), MirrorError>;
}

/// Everything the controller talks to.
pub trait MirrorBackend: CaptureService + PresentationSurface {}

impl<T: CaptureService + PresentationSurface> MirrorBackend for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Requested,
    Assembling,
    Terminated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub requests: u64,
    pub captured: u64,
    pub presented: u64,
    pub superseded: u64,
    pub import_failures: u64,
    pub retries: u64,
}

#[derive(Debug)]
pub struct CaptureSession<B> {
    source: SourceId,
    include_cursor: bool,
    state: SessionState,
    active_request: Option<RequestId>,
    next_request: u64,
    next_buffer: u64,
    assembler: FrameAssembler,
    slots: PresentationSlots<B>,
    last_error: Option<MirrorError>,
    stop: StopFlag,
    stats: SessionStats,
}

impl<B> CaptureSession<B> {
    pub fn new(source: SourceId, include_cursor: bool, stop: StopFlag) -> Self {
        Self {
            source,
            include_cursor,
            state: SessionState::Idle,
            active_request: None,
            next_request: 0,
            next_buffer: 0,
            assembler: FrameAssembler::new(),
            slots: PresentationSlots::new(),
            last_error: None,
            stop,
            stats: SessionStats::default(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    #[cfg(test)]
    pub fn active_request(&self) -> Option<RequestId> {
        self.active_request
    }

    pub fn last_error(&self) -> Option<&MirrorError> {
        self.last_error.as_ref()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    #[cfg(test)]
    pub fn slots(&self) -> &PresentationSlots<B> {
        &self.slots
    }

    /// Issue the first capture request.
    pub fn start<D>(&mut self, backend: &mut D) -> Result<(), MirrorError>
    where
        D: MirrorBackend<Buffer = B>,
    {
        tracing::info!(
            source = self.source.0,
            cursor = self.include_cursor,
            "starting capture session"
        );
        match self.request_capture(backend) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Issue a capture request unless one is already outstanding.
    ///
    /// Returns `Ok(None)` without issuing anything once a stop was requested.
    pub fn request_capture<D>(
        &mut self,
        backend: &mut D,
    ) -> Result<Option<RequestId>, MirrorError>
    where
        D: MirrorBackend<Buffer = B>,
    {
        if self.is_terminated() {
            return Err(MirrorError::SessionTerminated);
        }
        if self.active_request.is_some() {
            return Err(MirrorError::RequestInFlight);
        }
        if self.stop.is_stopped() {
            tracing::debug!("stop requested, not issuing capture request");
            return Ok(None);
        }

        let request = RequestId(self.next_request);
        self.next_request += 1;
        backend.request_capture(request, self.source, self.include_cursor)?;

        self.active_request = Some(request);
        self.state = SessionState::Requested;
        self.stats.requests += 1;
        tracing::trace!(request = request.0, "capture requested");
        Ok(Some(request))
    }

    /// Feed one capture event for `request`.
    pub fn handle_event<D>(&mut self, request: RequestId, event: CaptureEvent, backend: &mut D)
    where
        D: MirrorBackend<Buffer = B>,
    {
        if self.is_terminated() {
            tracing::debug!(request = request.0, "event after termination dropped");
            return;
        }
        if self.active_request != Some(request) {
            tracing::warn!(
                request = request.0,
                active = ?self.active_request.map(|r| r.0),
                "dropping event for stale capture request"
            );
            return;
        }

        if let Err(err) = self.step(event, backend) {
            self.fail(err);
        }
    }

    fn step<D>(&mut self, event: CaptureEvent, backend: &mut D) -> Result<(), MirrorError>
    where
        D: MirrorBackend<Buffer = B>,
    {
        match self.assembler.handle_event(event)? {
            Assembly::InProgress => {
                self.state = SessionState::Assembling;
                Ok(())
            }
            Assembly::Complete(frame, timestamp) => {
                self.finish_request();
                self.stats.captured += 1;
                self.deliver(frame, timestamp, backend);
                self.rearm(backend)
            }
            Assembly::Cancelled(CancelReason::Transient) => {
                self.finish_request();
                self.stats.retries += 1;
                tracing::debug!("capture cancelled (transient), retrying");
                self.rearm(backend)
            }
            Assembly::Cancelled(CancelReason::Permanent) => {
                self.finish_request();
                Err(MirrorError::CaptureCancelled(CancelReason::Permanent))
            }
        }
    }

    fn deliver<D>(&mut self, frame: PendingFrame, timestamp: FrameTimestamp, backend: &mut D)
    where
        D: MirrorBackend<Buffer = B>,
    {
        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;

        let ready = match importer::import(frame, id, backend) {
            Ok(ready) => ready,
            Err(err) => {
                self.stats.import_failures += 1;
                tracing::warn!(buffer = id.0, "skipping frame: {}", err);
                return;
            }
        };

        tracing::trace!(
            buffer = id.0,
            secs = timestamp.secs,
            nanos = timestamp.nanos,
            "frame ready"
        );
        if self.slots.publish(ready, backend).is_some() {
            self.stats.superseded += 1;
        }
        if backend.is_configured() {
            self.present(backend);
        }
    }

    fn present<D>(&mut self, backend: &mut D)
    where
        D: MirrorBackend<Buffer = B>,
    {
        if self.slots.present(backend) {
            self.stats.presented += 1;
        }
    }

    fn rearm<D>(&mut self, backend: &mut D) -> Result<(), MirrorError>
    where
        D: MirrorBackend<Buffer = B>,
    {
        self.request_capture(backend).map(|_| ())
    }

    fn finish_request(&mut self) {
        self.active_request = None;
        self.state = SessionState::Idle;
    }

    /// The surface finished its first configure; show whatever is waiting.
    pub fn surface_configured<D>(&mut self, backend: &mut D)
    where
        D: MirrorBackend<Buffer = B>,
    {
        if !self.stop.is_stopped() {
            self.present(backend);
        }
    }

    /// Release notification from the display layer.
    pub fn buffer_released<D>(&mut self, id: BufferId, backend: &mut D)
    where
        D: MirrorBackend<Buffer = B>,
    {
        self.slots.release(id, backend);
    }

    /// The display subsystem rejected buffer `id` after an immediate import.
    pub fn import_failed<D>(&mut self, id: BufferId, backend: &mut D)
    where
        D: MirrorBackend<Buffer = B>,
    {
        tracing::warn!(buffer = id.0, "compositor rejected imported buffer");
        if self.slots.release(id, backend) {
            self.stats.import_failures += 1;
        }
    }

    fn fail(&mut self, err: MirrorError) {
        self.assembler.discard();
        self.active_request = None;
        self.state = SessionState::Terminated;
        tracing::error!("capture session terminated: {}", err);
        self.last_error = Some(err);
    }

    /// Release the in-flight frame and every presented or pending buffer.
    pub fn shutdown<D>(&mut self, backend: &mut D)
    where
        D: MirrorBackend<Buffer = B>,
    {
        let closed = self.assembler.discard();
        let released = self.slots.release_all(backend);
        self.active_request = None;
        self.state = SessionState::Terminated;
        tracing::debug!(closed, released, "capture session shut down");
    }
}
