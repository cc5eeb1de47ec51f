//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

#[cfg(feature = "audio-cpal")]
use crate::error::{Result, VoiceError};

/// Which side of the audio graph a device belongs to.
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
    pub name: String,
    pub direction: DeviceDirection,
    pub is_default: bool,
    /// Input devices that most likely capture system output instead of a voice.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "virtual output",
];

const MIC_KEYWORDS: &[&str] = &["microphone", "mic", "headset", "array", "usb", "webcam"];

pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Higher means more likely to be a voice microphone.
pub fn mic_preference_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = if is_loopback_like_name(&lowered) { -16 } else { 8 };
    if MIC_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 6;
    }
    score
}

/// Resolve the input device: preferred name, then system default, then the
/// best-scoring enumerated device.
#[cfg(feature = "audio-cpal")]
pub fn select_input_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    if let Some(name) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(found) =
                    devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
                {
                    return Ok(found);
                }
                tracing::warn!("preferred input device '{name}' not found, falling back");
            }
            Err(e) => tracing::warn!("failed to list input devices: {e}"),
        }
    }

    if let Some(default) = host.default_input_device() {
        return Ok(default);
    }

    let devices = host
        .input_devices()
        .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;
    let best = devices
        .max_by_key(|d| mic_preference_score(&d.name().unwrap_or_default()))
        .ok_or(VoiceError::NoDefaultInputDevice)?;
    tracing::warn!("no default input device, using best available microphone");
    Ok(best)
}

/// Resolve the output device: preferred name, then system default.
#[cfg(feature = "audio-cpal")]
pub fn select_output_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    if let Some(name) = preferred {
        if let Ok(mut devices) = host.output_devices() {
            if let Some(found) = devices.find(|d| d.name().map(|n| n == name).unwrap_or(false)) {
                return Ok(found);
            }
        }
        tracing::warn!("preferred output device '{name}' not found, falling back");
    }

    host.default_output_device()
        .ok_or(VoiceError::NoDefaultOutputDevice)
}

/// List input and output devices, microphones first.
#[cfg(feature = "audio-cpal")]
pub fn list_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_in = host.default_input_device().and_then(|d| d.name().ok());
    let default_out = host.default_output_device().and_then(|d| d.name().ok());

    let mut list = Vec::new();
    match host.input_devices() {
        Ok(devices) => {
            for (idx, device) in devices.enumerate() {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                list.push(DeviceInfo {
                    is_default: default_in.as_deref() == Some(name.as_str()),
                    is_loopback_like: is_loopback_like_name(&name),
                    direction: DeviceDirection::Input,
                    name,
                });
            }
        }
        Err(e) => tracing::warn!("failed to enumerate input devices: {e}"),
    }
    match host.output_devices() {
        Ok(devices) => {
            for (idx, device) in devices.enumerate() {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
                list.push(DeviceInfo {
                    is_default: default_out.as_deref() == Some(name.as_str()),
                    is_loopback_like: false,
                    direction: DeviceDirection::Output,
                    name,
                });
            }
        }
        Err(e) => tracing::warn!("failed to enumerate output devices: {e}"),
    }

    sort_devices(&mut list);
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices() -> Vec<DeviceInfo> {
    vec![]
}

fn sort_devices(list: &mut [DeviceInfo]) {
    list.sort_by_key(|d| {
        (
            d.direction == DeviceDirection::Output,
            !d.is_default,
            -mic_preference_score(&d.name),
            d.name.to_ascii_lowercase(),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(!is_loopback_like_name("MacBook Pro Microphone"));
    }

    #[test]
    fn microphones_outscore_loopback_devices() {
        assert!(
            mic_preference_score("Microphone Array (USB PnP)")
                > mic_preference_score("Stereo Mix (Realtek Audio)")
        );
    }

    #[test]
    fn inputs_sort_before_outputs_and_defaults_first() {
        let mut list = vec![
            DeviceInfo {
                name: "Speakers".into(),
                direction: DeviceDirection::Output,
                is_default: true,
                is_loopback_like: false,
            },
            DeviceInfo {
                name: "Stereo Mix".into(),
                direction: DeviceDirection::Input,
                is_default: false,
                is_loopback_like: true,
            },
            DeviceInfo {
                name: "Headset Mic".into(),
                direction: DeviceDirection::Input,
                is_default: true,
                is_loopback_like: false,
            },
        ];
        sort_devices(&mut list);
        let names: Vec<_> = list.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["Headset Mic", "Stereo Mix", "Speakers"]);
    }
}
