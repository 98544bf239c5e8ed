//! Wayland support module
//!
//! Binds the globals the mirror needs, enumerates outputs, and runs the
//! single-threaded dispatch loop that feeds capture, release and window
//! events into the capture session.

pub mod capture;
pub mod display;
pub mod window;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io::ErrorKind;
use wayland_client::backend::WaylandError;
use wayland_client::globals::{registry_queue_init, GlobalList, GlobalListContents};
use wayland_client::protocol::wl_compositor::WlCompositor;
use wayland_client::protocol::wl_output::WlOutput;
use wayland_client::protocol::wl_registry::{self, WlRegistry};
use wayland_client::{Connection, Dispatch, EventQueue, Proxy, QueueHandle};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1;
use wayland_protocols::wp::viewporter::client::wp_viewporter::WpViewporter;
use wayland_protocols::xdg::shell::client::xdg_wm_base::XdgWmBase;
use wayland_protocols_wlr::export_dmabuf::v1::client::zwlr_export_dmabuf_frame_v1::ZwlrExportDmabufFrameV1;
use wayland_protocols_wlr::export_dmabuf::v1::client::zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1;

use crate::cli::MirrorConfig;
use crate::error::MirrorError;
use crate::session::{CaptureSession, SessionStats};
use crate::shutdown::StopFlag;

use capture::{ImportedDmabuf, WaylandPort};
use display::{OutputInfo, OutputList};
use window::Window;

/// How long one poll waits before the stop flag is checked again
const POLL_INTERVAL_MS: u16 = 100;

/// Optional globals as advertised by the compositor.
#[derive(Debug, Default)]
pub struct Protocols {
    compositor: Option<WlCompositor>,
    wm_base: Option<XdgWmBase>,
    export_manager: Option<ZwlrExportDmabufManagerV1>,
    dmabuf: Option<ZwpLinuxDmabufV1>,
    viewporter: Option<WpViewporter>,
}

impl Protocols {
    fn bind(globals: &GlobalList, qh: &QueueHandle<App>) -> Self {
        Self {
            compositor: globals.bind(qh, 1..=4, ()).ok(),
            wm_base: globals.bind(qh, 1..=3, ()).ok(),
            export_manager: globals.bind(qh, 1..=1, ()).ok(),
            dmabuf: globals.bind(qh, 3..=3, ()).ok(),
            viewporter: globals.bind(qh, 1..=1, ()).ok(),
        }
    }

    /// Everything mirroring cannot work without.
    fn require(&self) -> Result<Globals, MirrorError> {
        fn missing(interface: &str) -> MirrorError {
            MirrorError::UnsupportedCapability {
                interface: interface.to_string(),
            }
        }

        Ok(Globals {
            compositor: self.compositor.clone().ok_or_else(|| missing("wl_compositor"))?,
            wm_base: self.wm_base.clone().ok_or_else(|| missing("xdg_wm_base"))?,
            export_manager: self
                .export_manager
                .clone()
                .ok_or_else(|| missing("zwlr_export_dmabuf_manager_v1"))?,
            dmabuf: self
                .dmabuf
                .clone()
                .ok_or_else(|| missing("zwp_linux_dmabuf_v1 (version 3)"))?,
            viewporter: self.viewporter.clone(),
        })
    }
}

pub struct Globals {
    pub compositor: WlCompositor,
    pub wm_base: XdgWmBase,
    pub export_manager: ZwlrExportDmabufManagerV1,
    pub dmabuf: ZwpLinuxDmabufV1,
    pub viewporter: Option<WpViewporter>,
}

/// State of an active mirror.
pub struct Mirror {
    globals: Globals,
    window: Window,
    session: CaptureSession<ImportedDmabuf>,
    /// Frame object of the outstanding capture request
    capture_frame: Option<ZwlrExportDmabufFrameV1>,
}

/// Dispatch state for the whole connection.
pub struct App {
    outputs: OutputList,
    protocols: Protocols,
    mirror: Option<Mirror>,
    stop: StopFlag,
}

impl App {
    /// Run `f` against the session with a port onto the live connection.
    /// Does nothing when no mirror is active.
    fn with_port<R>(
        &mut self,
        qh: &QueueHandle<App>,
        f: impl FnOnce(&mut CaptureSession<ImportedDmabuf>, &mut WaylandPort<'_>) -> R,
    ) -> Option<R> {
        let App {
            outputs,
            mirror: Some(mirror),
            ..
        } = self
        else {
            return None;
        };
        let Mirror {
            globals,
            window,
            session,
            capture_frame,
        } = mirror;
        let mut port = WaylandPort::new(globals, window, outputs, capture_frame, qh);
        Some(f(session, &mut port))
    }

    fn should_stop(&self) -> bool {
        self.stop.is_stopped()
            || self
                .mirror
                .as_ref()
                .map_or(true, |mirror| mirror.session.is_terminated())
    }
}

impl Dispatch<WlRegistry, GlobalListContents> for App {
    fn event(
        state: &mut Self,
        registry: &WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } if interface == "wl_output" => {
                let output = registry.bind::<WlOutput, _, _>(name, version.min(4), qh, name);
                state.outputs.add(name, output);
            }
            wl_registry::Event::GlobalRemove { name } => {
                if let Some(output) = state.outputs.remove(name) {
                    tracing::info!(id = name, make = %output.info.make, "output removed");
                    if output.proxy.version() >= 3 {
                        output.proxy.release();
                    }
                }
            }
            _ => {}
        }
    }
}

fn connect(stop: StopFlag) -> Result<(Connection, EventQueue<App>, App)> {
    let conn = Connection::connect_to_env().context("Failed to connect to Wayland display")?;
    let (globals, mut queue) =
        registry_queue_init::<App>(&conn).context("Failed to read Wayland globals")?;
    let qh = queue.handle();

    let mut outputs = OutputList::default();
    let advertised: Vec<(u32, u32)> = globals.contents().with_list(|list| {
        list.iter()
            .filter(|global| global.interface == "wl_output")
            .map(|global| (global.name, global.version))
            .collect()
    });
    for (name, version) in advertised {
        let output = globals
            .registry()
            .bind::<WlOutput, _, _>(name, version.min(4), &qh, name);
        outputs.add(name, output);
    }

    let mut app = App {
        outputs,
        protocols: Protocols::bind(&globals, &qh),
        mirror: None,
        stop,
    };

    // output geometry and modes arrive after the bind
    queue
        .roundtrip(&mut app)
        .context("Failed to query Wayland outputs")?;

    Ok((conn, queue, app))
}

/// Enumerate capturable outputs.
pub fn list_outputs() -> Result<Vec<OutputInfo>> {
    let (_conn, _queue, app) = connect(StopFlag::new())?;
    Ok(app.outputs.infos())
}

/// Mirror `config.source` until the window is closed, `stop` is set, or the
/// capture session ends.
pub fn mirror(config: &MirrorConfig, stop: StopFlag) -> Result<SessionStats> {
    let (conn, mut queue, mut app) = connect(stop)?;
    let qh = queue.handle();

    let globals = app.protocols.require()?;
    let source = app
        .outputs
        .find(config.source.0)
        .ok_or(MirrorError::SourceUnavailable {
            id: config.source.0,
        })?
        .info
        .clone();
    println!(
        "Mirroring output: {} Model: {}: ID: {}",
        source.make, source.model, source.id
    );

    tracing::info!(
        width = source.width,
        height = source.height,
        refresh_hz = source.refresh_hz(),
        "source mode"
    );

    let window = Window::create(&globals, &qh, &config.title, source.width, source.height);
    app.mirror = Some(Mirror {
        globals,
        window,
        session: CaptureSession::new(config.source, config.include_cursor, app.stop.clone()),
        capture_frame: None,
    });

    let started = app
        .with_port(&qh, |session, port| session.start(port))
        .unwrap_or(Err(MirrorError::SessionTerminated));
    let result = match started {
        Ok(()) => run(&mut queue, &mut app, config.show_progress),
        Err(err) => Err(err.into()),
    };

    let outcome = app
        .mirror
        .as_ref()
        .map(|mirror| (mirror.session.stats(), mirror.session.last_error().cloned()));
    teardown(&conn, &qh, &mut app);
    result?;

    match outcome {
        Some((_, Some(err))) if err.is_fatal() => Err(err.into()),
        Some((stats, _)) => Ok(stats),
        None => Ok(SessionStats::default()),
    }
}

fn run(queue: &mut EventQueue<App>, app: &mut App, show_progress: bool) -> Result<()> {
    let pb = if show_progress {
        ProgressBar::new_spinner()
    } else {
        ProgressBar::hidden()
    };
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} Mirroring... {elapsed_precise} {msg}")
            .context("Invalid progress template")?,
    );

    while !app.should_stop() {
        queue
            .dispatch_pending(app)
            .context("Failed to dispatch Wayland events")?;
        if app.should_stop() {
            break;
        }
        queue
            .flush()
            .context("Failed to flush Wayland connection")?;

        // events already queued, dispatch them first
        let Some(guard) = queue.prepare_read() else {
            continue;
        };

        let readable = {
            let mut fds = [PollFd::new(guard.connection_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(ready) => ready > 0,
                Err(Errno::EINTR) => false,
                Err(err) => return Err(err).context("Failed to poll Wayland connection"),
            }
        };

        if readable {
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(err)) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => return Err(err).context("Failed to read Wayland events"),
            }
        }

        if let Some(mirror) = app.mirror.as_ref() {
            let stats = mirror.session.stats();
            pb.set_message(format!(
                "frames: {} dropped: {}",
                stats.presented,
                stats.superseded + stats.import_failures
            ));
        }
        pb.tick();
    }

    pb.finish_and_clear();
    Ok(())
}

/// Release every frame and window object before the connection goes away.
fn teardown(conn: &Connection, qh: &QueueHandle<App>, app: &mut App) {
    app.with_port(qh, |session, port| session.shutdown(port));

    if let Some(mut mirror) = app.mirror.take() {
        if let Some(frame) = mirror.capture_frame.take() {
            tracing::debug!("destroying outstanding capture frame");
            frame.destroy();
        }
        let stats = mirror.session.stats();
        tracing::info!(
            requests = stats.requests,
            captured = stats.captured,
            presented = stats.presented,
            superseded = stats.superseded,
            import_failures = stats.import_failures,
            retries = stats.retries,
            "mirror stopped"
        );
        mirror.window.destroy();
    }

    if let Err(err) = conn.flush() {
        tracing::warn!("Failed to flush Wayland connection on exit: {}", err);
    }
}
