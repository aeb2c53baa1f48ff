use serde::{Deserialize, Serialize};

use crate::app::models::Device;

/// Android "smallest width" breakpoint between phone and tablet layouts.
const TABLET_MIN_SMALLEST_WIDTH_DP: u32 = 600;
const BASELINE_DENSITY_DPI: u32 = 160;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Phone,
    Tablet,
    Tv,
    Wearable,
    Automotive,
    Unknown,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
            DeviceType::Wearable => "wearable",
            DeviceType::Automotive => "automotive",
            DeviceType::Unknown => "unknown",
        }
    }
}

pub trait DeviceTypeClassifier: Send + Sync {
    fn classify(&self, device: &Device) -> DeviceType;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDeviceTypeClassifier;

impl DeviceTypeClassifier for DefaultDeviceTypeClassifier {
    fn classify(&self, device: &Device) -> DeviceType {
        let props = &device.properties;
        if let Some(characteristics) = props.characteristics.as_deref() {
            for token in characteristics.split(',').map(str::trim) {
                match token {
                    "tv" => return DeviceType::Tv,
                    "watch" => return DeviceType::Wearable,
                    "automotive" => return DeviceType::Automotive,
                    "tablet" => return DeviceType::Tablet,
                    _ => {}
                }
            }
        }
        if let (Some((width, height)), Some(density)) = (props.screen_size, props.density_dpi) {
            if density > 0 {
                let smallest_dp = width.min(height) * BASELINE_DENSITY_DPI / density;
                return if smallest_dp >= TABLET_MIN_SMALLEST_WIDTH_DP {
                    DeviceType::Tablet
                } else {
                    DeviceType::Phone
                };
            }
        }
        if props.api_level.is_some() {
            DeviceType::Phone
        } else {
            DeviceType::Unknown
        }
    }
}
