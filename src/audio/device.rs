//! Audio device enumeration and selection
//!
//! Device ids follow the `input:<name>` / `output:<name>` scheme. On Windows
//! every output device is also offered as a `loopback:<name>` capture source
//! (WASAPI loopback).

use serde::Serialize;

use super::capture::SyntheticSource;
use super::playback::NullSink;
use super::{FrameSink, FrameSource};
use crate::config::AudioConfig;

/// Name fragments that mark a capture source as system-output loopback
const LOOPBACK_MARKERS: &[&str] = &["loopback", "stereo mix", "what u hear", "monitor"];

/// What a capture source records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// The system's own audio output
    Loopback,
    Microphone,
}

/// Classify a capture source by its name
pub fn classify_source(name: &str) -> SourceKind {
    let name = name.to_lowercase();
    if LOOPBACK_MARKERS.iter().any(|marker| name.contains(marker)) {
        SourceKind::Loopback
    } else {
        SourceKind::Microphone
    }
}

/// Enumerated device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    /// Set for capture sources only
    pub kind: Option<SourceKind>,
}

/// Backend that ended up serving a device slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackend {
    Cpal,
    Synthetic,
}

impl std::fmt::Display for DeviceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceBackend::Cpal => write!(f, "cpal"),
            DeviceBackend::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// Outcome of opening a source or sink
pub struct DeviceSelection<T> {
    pub backend: DeviceBackend,
    pub device: T,
    /// Why the hardware backend was not used, if it was not
    pub fallback_reason: Option<String>,
}

/// Choose a capture source from `sources`
///
/// An explicit id (or bare name) must match. Otherwise the first loopback
/// source wins when `prefer_loopback` is set, then the default device, then
/// the first one listed.
pub fn pick_source<'a>(
    sources: &'a [DeviceInfo],
    requested: Option<&str>,
    prefer_loopback: bool,
) -> Option<&'a DeviceInfo> {
    if let Some(requested) = requested {
        return sources.iter().find(|d| d.id == requested || d.name == requested);
    }

    if prefer_loopback {
        if let Some(found) = sources.iter().find(|d| d.kind == Some(SourceKind::Loopback)) {
            return Some(found);
        }
    }

    sources.iter().find(|d| d.is_default).or_else(|| sources.first())
}

/// Choose a playback device from `sinks`
pub fn pick_sink<'a>(sinks: &'a [DeviceInfo], requested: Option<&str>) -> Option<&'a DeviceInfo> {
    match requested {
        Some(requested) => sinks.iter().find(|d| d.id == requested || d.name == requested),
        None => sinks.iter().find(|d| d.is_default).or_else(|| sinks.first()),
    }
}

/// List capture sources
pub fn list_sources() -> Vec<DeviceInfo> {
    #[cfg(feature = "device")]
    {
        host::sources()
    }
    #[cfg(not(feature = "device"))]
    {
        Vec::new()
    }
}

/// List playback devices
pub fn list_sinks() -> Vec<DeviceInfo> {
    #[cfg(feature = "device")]
    {
        host::sinks()
    }
    #[cfg(not(feature = "device"))]
    {
        Vec::new()
    }
}

/// Open the configured capture source, falling back to silence
pub fn open_source(config: &AudioConfig) -> DeviceSelection<Box<dyn FrameSource>> {
    #[cfg(feature = "device")]
    let fallback_reason = match super::capture::CpalSource::open(config) {
        Ok(source) => {
            tracing::info!("Capture source: {}", source.name());
            return DeviceSelection {
                backend: DeviceBackend::Cpal,
                device: Box::new(source),
                fallback_reason: None,
            };
        }
        Err(e) => e.to_string(),
    };
    #[cfg(not(feature = "device"))]
    let fallback_reason = "built without device support".to_string();

    tracing::warn!("No capture device, sending silence: {}", fallback_reason);
    DeviceSelection {
        backend: DeviceBackend::Synthetic,
        device: Box::new(SyntheticSource::silence(config.codec_params())),
        fallback_reason: Some(fallback_reason),
    }
}

/// Open the configured playback device, falling back to a null sink
pub fn open_sink(config: &AudioConfig) -> DeviceSelection<Box<dyn FrameSink>> {
    #[cfg(feature = "device")]
    let fallback_reason = match super::playback::CpalSink::open(config) {
        Ok(sink) => {
            tracing::info!("Playback device: {}", sink.name());
            return DeviceSelection {
                backend: DeviceBackend::Cpal,
                device: Box::new(sink),
                fallback_reason: None,
            };
        }
        Err(e) => e.to_string(),
    };
    #[cfg(not(feature = "device"))]
    let fallback_reason = "built without device support".to_string();

    tracing::warn!("No playback device, discarding received audio: {}", fallback_reason);
    DeviceSelection {
        backend: DeviceBackend::Synthetic,
        device: Box::new(NullSink::new(config.codec_params())),
        fallback_reason: Some(fallback_reason),
    }
}

#[cfg(feature = "device")]
pub(crate) mod host {
    //! cpal host queries

    use cpal::traits::{DeviceTrait, HostTrait};

    use super::{classify_source, pick_sink, pick_source, DeviceInfo};
    use crate::config::AudioConfig;
    use crate::error::AudioError;

    pub fn sources() -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let mut sources = Vec::new();

        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if let Ok(name) = device.name() {
                    sources.push(DeviceInfo {
                        id: format!("input:{}", name),
                        is_default: default_name.as_ref() == Some(&name),
                        kind: Some(classify_source(&name)),
                        name,
                    });
                }
            }
        }

        // WASAPI can capture any render endpoint
        #[cfg(target_os = "windows")]
        {
            if let Ok(devices) = host.output_devices() {
                for device in devices {
                    if let Ok(name) = device.name() {
                        sources.push(DeviceInfo {
                            id: format!("loopback:{}", name),
                            name: format!("{} (loopback)", name),
                            is_default: false,
                            kind: Some(super::SourceKind::Loopback),
                        });
                    }
                }
            }
        }

        sources
    }

    pub fn sinks() -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        let mut sinks = Vec::new();

        if let Ok(devices) = host.output_devices() {
            for device in devices {
                if let Ok(name) = device.name() {
                    sinks.push(DeviceInfo {
                        id: format!("output:{}", name),
                        is_default: default_name.as_ref() == Some(&name),
                        kind: None,
                        name,
                    });
                }
            }
        }

        sinks
    }

    /// Find a cpal device by id
    pub fn device_by_id(id: &str) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();

        let (devices, name) = if let Some(name) = id.strip_prefix("input:") {
            (host.input_devices(), name)
        } else if let Some(name) = id.strip_prefix("output:") {
            (host.output_devices(), name)
        } else if let Some(name) = id.strip_prefix("loopback:") {
            (host.output_devices(), name)
        } else {
            (host.input_devices(), id)
        };

        let mut devices = devices.map_err(|e| AudioError::BackendUnavailable(e.to_string()))?;
        devices
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
    }

    /// Resolve the capture device for `config`
    pub fn resolve_source(config: &AudioConfig) -> Result<(cpal::Device, DeviceInfo), AudioError> {
        let sources = sources();
        let info = pick_source(&sources, config.input_device.as_deref(), config.loopback)
            .cloned()
            .ok_or_else(|| {
                AudioError::DeviceNotFound(
                    config.input_device.clone().unwrap_or_else(|| "no capture devices".to_string()),
                )
            })?;

        Ok((device_by_id(&info.id)?, info))
    }

    /// Resolve the playback device for `config`
    pub fn resolve_sink(config: &AudioConfig) -> Result<(cpal::Device, DeviceInfo), AudioError> {
        let sinks = sinks();
        let info = pick_sink(&sinks, config.output_device.as_deref())
            .cloned()
            .ok_or_else(|| {
                AudioError::DeviceNotFound(
                    config.output_device.clone().unwrap_or_else(|| "no playback devices".to_string()),
                )
            })?;

        Ok((device_by_id(&info.id)?, info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: &str, is_default: bool) -> DeviceInfo {
        let name = id.trim_start_matches("input:").to_string();
        DeviceInfo {
            id: id.to_string(),
            kind: Some(classify_source(&name)),
            name,
            is_default,
        }
    }

    fn sources() -> Vec<DeviceInfo> {
        vec![
            source("input:USB Mic", false),
            source("input:Headset", true),
            source("input:Stereo Mix (Realtek)", false),
        ]
    }

    #[test]
    fn test_classify_source() {
        assert_eq!(classify_source("Stereo Mix (Realtek Audio)"), SourceKind::Loopback);
        assert_eq!(classify_source("Monitor of Built-in Audio"), SourceKind::Loopback);
        assert_eq!(classify_source("What U Hear"), SourceKind::Loopback);
        assert_eq!(classify_source("Speakers (Loopback)"), SourceKind::Loopback);
        assert_eq!(classify_source("Microphone Array"), SourceKind::Microphone);
    }

    #[test]
    fn test_pick_source_prefers_loopback() {
        let sources = sources();
        let picked = pick_source(&sources, None, true).unwrap();
        assert_eq!(picked.id, "input:Stereo Mix (Realtek)");
    }

    #[test]
    fn test_pick_source_default_without_loopback_preference() {
        let sources = sources();
        assert_eq!(pick_source(&sources, None, false).unwrap().name, "Headset");
    }

    #[test]
    fn test_pick_source_explicit() {
        let sources = sources();
        assert_eq!(pick_source(&sources, Some("input:USB Mic"), true).unwrap().name, "USB Mic");
        assert_eq!(pick_source(&sources, Some("USB Mic"), true).unwrap().id, "input:USB Mic");
        assert!(pick_source(&sources, Some("input:Missing"), true).is_none());
    }

    #[test]
    fn test_pick_sink_falls_back_to_first() {
        let sinks = vec![DeviceInfo {
            id: "output:Speakers".to_string(),
            name: "Speakers".to_string(),
            is_default: false,
            kind: None,
        }];
        assert_eq!(pick_sink(&sinks, None).unwrap().name, "Speakers");
        assert!(pick_sink(&[], None).is_none());
    }
}
