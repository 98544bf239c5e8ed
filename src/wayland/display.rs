//! Wayland output enumeration

use serde::Serialize;
use wayland_client::protocol::wl_output::{self, WlOutput};
use wayland_client::{Connection, Dispatch, QueueHandle, WEnum};

use super::App;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputInfo {
    /// Registry name, used as the source id on the command line
    pub id: u32,
    /// Connector name (e.g. "DP-1"), wl_output v4 only
    pub name: Option<String>,
    pub make: String,
    pub model: String,
    pub width: i32,
    pub height: i32,
    /// Refresh rate of the current mode in mHz
    pub refresh_mhz: i32,
}

impl OutputInfo {
    pub fn refresh_hz(&self) -> f64 {
        self.refresh_mhz as f64 / 1000.0
    }
}

pub struct Output {
    pub info: OutputInfo,
    pub proxy: WlOutput,
}

/// Outputs in the order the compositor announced them.
#[derive(Default)]
pub struct OutputList {
    outputs: Vec<Output>,
}

impl OutputList {
    pub fn add(&mut self, id: u32, proxy: WlOutput) {
        self.outputs.push(Output {
            info: OutputInfo {
                id,
                ..OutputInfo::default()
            },
            proxy,
        });
    }

    pub fn remove(&mut self, id: u32) -> Option<Output> {
        let pos = self.outputs.iter().position(|o| o.info.id == id)?;
        Some(self.outputs.remove(pos))
    }

    pub fn find(&self, id: u32) -> Option<&Output> {
        self.outputs.iter().find(|o| o.info.id == id)
    }

    fn find_mut(&mut self, id: u32) -> Option<&mut OutputInfo> {
        self.outputs
            .iter_mut()
            .find(|o| o.info.id == id)
            .map(|o| &mut o.info)
    }

    pub fn infos(&self) -> Vec<OutputInfo> {
        self.outputs.iter().map(|o| o.info.clone()).collect()
    }
}

impl Dispatch<WlOutput, u32> for App {
    fn event(
        state: &mut Self,
        _output: &WlOutput,
        event: wl_output::Event,
        id: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(info) = state.outputs.find_mut(*id) else {
            return;
        };

        match event {
            wl_output::Event::Geometry { make, model, .. } => {
                info.make = make;
                info.model = model;
            }
            wl_output::Event::Mode {
                flags: WEnum::Value(flags),
                width,
                height,
                refresh,
            } if flags.contains(wl_output::Mode::Current) => {
                info.width = width;
                info.height = height;
                info.refresh_mhz = refresh;
            }
            wl_output::Event::Name { name } => {
                info.name = Some(name);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_hz() {
        let info = OutputInfo {
            refresh_mhz: 59_951,
            ..OutputInfo::default()
        };
        assert!((info.refresh_hz() - 59.951).abs() < 1e-9);
    }

    #[test]
    fn test_output_info_json() {
        let info = OutputInfo {
            id: 48,
            name: Some("DP-1".into()),
            make: "Dell Inc.".into(),
            model: "U2720Q".into(),
            width: 3840,
            height: 2160,
            refresh_mhz: 60_000,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["id"], 48);
        assert_eq!(json["name"], "DP-1");
        assert_eq!(json["width"], 3840);
    }
}
