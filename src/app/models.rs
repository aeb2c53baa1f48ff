use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Online,
    Offline,
    Unauthorized,
    Other,
}

impl DeviceState {
    pub fn from_adb(state: &str) -> Self {
        match state.trim() {
            "device" => DeviceState::Online,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            _ => DeviceState::Other,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceProperties {
    pub api_level: Option<u32>,
    pub density_dpi: Option<u32>,
    /// `ro.build.characteristics`, e.g. `tablet` or `tv,nosdcard`.
    pub characteristics: Option<String>,
    /// Physical screen size in pixels as reported by `wm size`.
    pub screen_size: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub serial: String,
    pub state: DeviceState,
    pub model: Option<String>,
    pub properties: DeviceProperties,
}

impl Device {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: DeviceState::Online,
            model: None,
            properties: DeviceProperties::default(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == DeviceState::Online
    }

    pub fn display_name(&self) -> String {
        match &self.model {
            Some(model) => format!("{} ({model})", self.serial),
            None => self.serial.clone(),
        }
    }
}
