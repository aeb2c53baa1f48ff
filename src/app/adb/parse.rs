use std::collections::HashMap;

use regex::Regex;

use crate::app::models::{Device, DeviceProperties, DeviceState};

pub fn parse_adb_devices(output: &str) -> Vec<Device> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let model = tokens
                .iter()
                .skip(2)
                .find_map(|token| token.strip_prefix("model:"))
                .map(|value| value.to_string());
            Some(Device {
                serial: tokens[0].to_string(),
                state: DeviceState::from_adb(tokens[1]),
                model,
                properties: DeviceProperties::default(),
            })
        })
        .collect()
}

pub fn parse_getprop_map(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('[') {
            continue;
        }
        let Some((key_part, value_part)) = trimmed.split_once("]: [") else {
            continue;
        };
        let key = key_part.trim_start_matches('[').trim();
        let value = value_part.trim_end_matches(']').trim();
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

pub fn build_device_properties(getprop_map: &HashMap<String, String>) -> DeviceProperties {
    DeviceProperties {
        api_level: getprop_map
            .get("ro.build.version.sdk")
            .and_then(|value| value.trim().parse().ok()),
        density_dpi: getprop_map
            .get("ro.sf.lcd_density")
            .and_then(|value| value.trim().parse().ok()),
        characteristics: getprop_map
            .get("ro.build.characteristics")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        screen_size: None,
    }
}

/// `wm size` prints `Physical size: 1080x2400`, optionally followed by an
/// `Override size:` line which takes precedence.
pub fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    let size_re = Regex::new(r"(?i)(physical|override)\s+size:\s*(\d+)x(\d+)").ok()?;
    let mut physical = None;
    let mut override_size = None;
    for line in output.lines() {
        if let Some(caps) = size_re.captures(line.trim()) {
            let width = caps[2].parse().ok()?;
            let height = caps[3].parse().ok()?;
            if caps[1].eq_ignore_ascii_case("override") {
                override_size = Some((width, height));
            } else {
                physical = Some((width, height));
            }
        }
    }
    override_size.or(physical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_adb_devices_output() {
        let output = "List of devices attached\n0123456789ABCDEF device product:sdk_gphone64_arm64 model:Pixel_7 device:emu64a transport_id:1\nemulator-5554 unauthorized transport_id:2\n";
        let parsed = parse_adb_devices(output);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].serial, "0123456789ABCDEF");
        assert_eq!(parsed[0].state, DeviceState::Online);
        assert_eq!(parsed[0].model.as_deref(), Some("Pixel_7"));
        assert_eq!(parsed[1].state, DeviceState::Unauthorized);
    }

    #[test]
    fn skips_daemon_banner_lines() {
        let output = "* daemon not running; starting now at tcp:5037\n* daemon started successfully\nList of devices attached\nemulator-5556 offline\n";
        let parsed = parse_adb_devices(output);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].state, DeviceState::Offline);
    }

    #[test]
    fn builds_properties_from_getprop() {
        let output = "[ro.build.version.sdk]: [34]\n[ro.sf.lcd_density]: [420]\n[ro.build.characteristics]: [tablet]\n[ro.product.model]: [Pixel Tablet]\n";
        let props = build_device_properties(&parse_getprop_map(output));
        assert_eq!(props.api_level, Some(34));
        assert_eq!(props.density_dpi, Some(420));
        assert_eq!(props.characteristics.as_deref(), Some("tablet"));
    }

    #[test]
    fn ignores_unparseable_numeric_props() {
        let output = "[ro.build.version.sdk]: [UpsideDownCake]\n[ro.build.characteristics]: []\n";
        let props = build_device_properties(&parse_getprop_map(output));
        assert_eq!(props.api_level, None);
        assert_eq!(props.characteristics, None);
    }

    #[test]
    fn parses_wm_size_preferring_override() {
        assert_eq!(parse_wm_size("Physical size: 1080x2400\n"), Some((1080, 2400)));
        assert_eq!(
            parse_wm_size("Physical size: 1080x2400\nOverride size: 720x1600\n"),
            Some((720, 1600))
        );
        assert_eq!(parse_wm_size("error: no devices"), None);
    }
}
