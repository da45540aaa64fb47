//! Device enumeration and selection.

use serde::{Deserialize, Serialize};

#[cfg(feature = "audio-cpal")]
use cpal::traits::{DeviceTrait, HostTrait};
#[cfg(feature = "audio-cpal")]
use tracing::warn;

#[cfg(feature = "audio-cpal")]
use crate::error::{Result, VoiceError};

/// Which side of the call a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default for its direction.
    pub is_default: bool,
}

/// Trim a user-supplied device name; blank means "use the default".
pub fn normalize_device_name(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Sort defaults first, then by case-insensitive name.
pub fn sort_devices(list: &mut [DeviceInfo]) {
    list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
}

#[cfg(feature = "audio-cpal")]
fn describe<I>(devices: I, default_name: Option<String>, direction: DeviceDirection) -> Vec<DeviceInfo>
where
    I: Iterator<Item = cpal::Device>,
{
    let mut list = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Device {}", idx + 1));
            let is_default = default_name.as_deref() == Some(name.as_str());
            DeviceInfo {
                name,
                direction,
                is_default,
            }
        })
        .collect::<Vec<_>>();
    sort_devices(&mut list);
    list
}

/// List microphones and speakers. Empty when enumeration fails.
#[cfg(feature = "audio-cpal")]
pub fn list_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let mut all = Vec::new();

    let default_in = host.default_input_device().and_then(|d| d.name().ok());
    match host.input_devices() {
        Ok(devices) => all.extend(describe(devices, default_in, DeviceDirection::Input)),
        Err(e) => warn!("failed to enumerate input devices: {e}"),
    }

    let default_out = host.default_output_device().and_then(|d| d.name().ok());
    match host.output_devices() {
        Ok(devices) => all.extend(describe(devices, default_out, DeviceDirection::Output)),
        Err(e) => warn!("failed to enumerate output devices: {e}"),
    }

    all
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices() -> Vec<DeviceInfo> {
    vec![]
}

/// Preferred microphone by exact name, else the default, else the first one.
#[cfg(feature = "audio-cpal")]
pub(crate) fn pick_input(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    if let Some(wanted) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(found) = devices.find(|d| d.name().is_ok_and(|n| n == wanted)) {
                    return Ok(found);
                }
                warn!("preferred input device '{wanted}' not found, falling back");
            }
            Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
        }
    }

    if let Some(default) = host.default_input_device() {
        return Ok(default);
    }
    host.input_devices()
        .map_err(|e| VoiceError::DeviceAcquisition(e.to_string()))?
        .next()
        .ok_or_else(|| VoiceError::DeviceAcquisition("no microphone available".into()))
}

/// Preferred speaker by exact name, else the default output.
#[cfg(feature = "audio-cpal")]
pub(crate) fn pick_output(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    if let Some(wanted) = preferred {
        match host.output_devices() {
            Ok(mut devices) => {
                if let Some(found) = devices.find(|d| d.name().is_ok_and(|n| n == wanted)) {
                    return Ok(found);
                }
                warn!("preferred output device '{wanted}' not found, falling back");
            }
            Err(e) => warn!("failed to list output devices while resolving preference: {e}"),
        }
    }

    host.default_output_device()
        .ok_or_else(|| VoiceError::DeviceAcquisition("no output device available".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_names_mean_default() {
        assert_eq!(normalize_device_name(Some("   ")), None);
        assert_eq!(normalize_device_name(None), None);
        assert_eq!(
            normalize_device_name(Some("  USB Mic ")).as_deref(),
            Some("USB Mic")
        );
    }

    #[test]
    fn defaults_sort_first() {
        let mut list = vec![
            DeviceInfo {
                name: "b speaker".into(),
                direction: DeviceDirection::Output,
                is_default: false,
            },
            DeviceInfo {
                name: "Z headset".into(),
                direction: DeviceDirection::Output,
                is_default: true,
            },
            DeviceInfo {
                name: "A speaker".into(),
                direction: DeviceDirection::Output,
                is_default: false,
            },
        ];
        sort_devices(&mut list);
        let names: Vec<_> = list.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["Z headset", "A speaker", "b speaker"]);
    }
}
