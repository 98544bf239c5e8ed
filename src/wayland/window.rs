//! The xdg-shell toplevel the mirrored output is shown in

use wayland_client::protocol::wl_compositor::WlCompositor;
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_client::{delegate_noop, Connection, Dispatch, QueueHandle};
use wayland_protocols::wp::viewporter::client::wp_viewport::WpViewport;
use wayland_protocols::wp::viewporter::client::wp_viewporter::WpViewporter;
use wayland_protocols::xdg::shell::client::xdg_surface::{self, XdgSurface};
use wayland_protocols::xdg::shell::client::xdg_toplevel::{self, XdgToplevel};
use wayland_protocols::xdg::shell::client::xdg_wm_base::{self, XdgWmBase};

use super::{App, Globals};

const APP_ID: &str = "wdomirror";

pub struct Window {
    surface: WlSurface,
    xdg_surface: XdgSurface,
    toplevel: XdgToplevel,
    viewport: Option<WpViewport>,
    configured: bool,
    width: i32,
    height: i32,
}

impl Window {
    pub fn create(
        globals: &Globals,
        qh: &QueueHandle<App>,
        title: &str,
        width: i32,
        height: i32,
    ) -> Self {
        let surface = globals.compositor.create_surface(qh, ());
        let xdg_surface = globals.wm_base.get_xdg_surface(&surface, qh, ());
        let toplevel = xdg_surface.get_toplevel(qh, ());
        let viewport = globals
            .viewporter
            .as_ref()
            .map(|viewporter| viewporter.get_viewport(&surface, qh, ()));

        toplevel.set_title(title.to_string());
        toplevel.set_app_id(APP_ID.to_string());
        // initial commit without a buffer starts the configure sequence
        surface.commit();

        Self {
            surface,
            xdg_surface,
            toplevel,
            viewport,
            configured: false,
            width,
            height,
        }
    }

    pub fn surface(&self) -> &WlSurface {
        &self.surface
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Returns true for the first configure only.
    fn mark_configured(&mut self) -> bool {
        !std::mem::replace(&mut self.configured, true)
    }

    /// Zero means the compositor leaves the size to us.
    fn resize(&mut self, width: i32, height: i32) {
        if width > 0 {
            self.width = width;
        }
        if height > 0 {
            self.height = height;
        }
        if let Some(viewport) = &self.viewport {
            if self.width > 0 && self.height > 0 {
                viewport.set_destination(self.width, self.height);
            }
        }
    }

    pub fn damage_all(&self) {
        let (width, height) = if self.width > 0 && self.height > 0 {
            (self.width, self.height)
        } else {
            (i32::MAX, i32::MAX)
        };
        self.surface.damage(0, 0, width, height);
    }

    pub fn destroy(self) {
        if let Some(viewport) = self.viewport {
            viewport.destroy();
        }
        self.toplevel.destroy();
        self.xdg_surface.destroy();
        self.surface.destroy();
    }
}

impl Dispatch<XdgWmBase, ()> for App {
    fn event(
        _state: &mut Self,
        wm_base: &XdgWmBase,
        event: xdg_wm_base::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<XdgSurface, ()> for App {
    fn event(
        state: &mut Self,
        xdg_surface: &XdgSurface,
        event: xdg_surface::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        let xdg_surface::Event::Configure { serial } = event else {
            return;
        };
        xdg_surface.ack_configure(serial);

        let first = state
            .mirror
            .as_mut()
            .is_some_and(|mirror| mirror.window.mark_configured());
        if first {
            tracing::debug!("window configured");
            state.with_port(qh, |session, port| session.surface_configured(port));
        }
    }
}

impl Dispatch<XdgToplevel, ()> for App {
    fn event(
        state: &mut Self,
        _toplevel: &XdgToplevel,
        event: xdg_toplevel::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                if let Some(mirror) = state.mirror.as_mut() {
                    mirror.window.resize(width, height);
                }
            }
            xdg_toplevel::Event::Close => {
                tracing::info!("window closed");
                state.stop.request_stop();
            }
            _ => {}
        }
    }
}

delegate_noop!(App: WlCompositor);
delegate_noop!(App: ignore WlSurface);
delegate_noop!(App: WpViewporter);
delegate_noop!(App: WpViewport);
