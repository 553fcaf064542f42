//! Capture device model and camera selection
//!
//! Engines supply the device list from their own enumeration primitive;
//! selection is a pure function over that list.

use serde::{Deserialize, Serialize};

/// Track/device media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Camera orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera
    #[default]
    User,
    /// Back camera
    Environment,
}

impl FacingMode {
    pub fn opposite(&self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

impl std::fmt::Display for FacingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FacingMode::User => write!(f, "user"),
            FacingMode::Environment => write!(f, "environment"),
        }
    }
}

/// Capture device as enumerated by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDeviceInfo {
    pub device_id: String,
    /// Engine-provided label; may be empty
    pub label: String,
    pub kind: MediaKind,
    /// Known orientation (cameras only)
    pub facing: Option<FacingMode>,
}

impl MediaDeviceInfo {
    pub fn camera(device_id: impl Into<String>, facing: Option<FacingMode>) -> Self {
        Self {
            device_id: device_id.into(),
            label: String::new(),
            kind: MediaKind::Video,
            facing,
        }
    }

    pub fn microphone(device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            label: label.into(),
            kind: MediaKind::Audio,
            facing: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Label shown to the application, synthesized when the engine has none
    pub fn display_label(&self) -> String {
        if !self.label.is_empty() {
            return self.label.clone();
        }
        match (self.kind, self.facing) {
            (MediaKind::Video, Some(FacingMode::User)) => "Front Camera".to_string(),
            (MediaKind::Video, Some(FacingMode::Environment)) => "Back Camera".to_string(),
            (MediaKind::Video, None) => format!("Camera {}", self.device_id),
            (MediaKind::Audio, _) => format!("Audio Input {}", self.device_id),
        }
    }
}

/// `{deviceId, label}` entry returned by the device listing operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDevice {
    pub device_id: String,
    pub label: String,
}

impl From<&MediaDeviceInfo> for InputDevice {
    fn from(info: &MediaDeviceInfo) -> Self {
        Self {
            device_id: info.device_id.clone(),
            label: info.display_label(),
        }
    }
}

/// Placeholder entry used when the engine cannot enumerate microphones
pub fn default_audio_input() -> InputDevice {
    InputDevice {
        device_id: "default".to_string(),
        label: "Default Audio Input".to_string(),
    }
}

/// Pick the camera for `getUserMedia`
///
/// Explicit device id first, then the first camera with the requested
/// facing mode, then the first camera in the list.
pub fn select_camera<'a>(
    devices: &'a [MediaDeviceInfo],
    device_id: Option<&str>,
    facing: FacingMode,
) -> Option<&'a MediaDeviceInfo> {
    let cameras = || devices.iter().filter(|d| d.kind == MediaKind::Video);

    if let Some(id) = device_id {
        if let Some(device) = cameras().find(|d| d.device_id == id) {
            return Some(device);
        }
    }

    cameras()
        .find(|d| d.facing == Some(facing))
        .or_else(|| cameras().next())
}

/// Pick the camera `switchCamera` moves to
///
/// Needs at least two cameras. Prefers a camera facing `target` other than
/// the current one; without facing information it cycles to the next camera
/// in enumeration order.
pub fn select_switch_target<'a>(
    devices: &'a [MediaDeviceInfo],
    current_device_id: Option<&str>,
    target: FacingMode,
) -> Option<&'a MediaDeviceInfo> {
    let cameras: Vec<&MediaDeviceInfo> = devices
        .iter()
        .filter(|d| d.kind == MediaKind::Video)
        .collect();

    if cameras.len() < 2 {
        return None;
    }

    let is_current = |d: &MediaDeviceInfo| Some(d.device_id.as_str()) == current_device_id;

    if let Some(device) = cameras
        .iter()
        .copied()
        .find(|d| d.facing == Some(target) && !is_current(d))
    {
        return Some(device);
    }

    let current_index = cameras.iter().position(|d| is_current(d));
    let next = match current_index {
        Some(i) => (i + 1) % cameras.len(),
        None => 0,
    };
    Some(cameras[next])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phone_cameras() -> Vec<MediaDeviceInfo> {
        vec![
            MediaDeviceInfo::camera("back-0", Some(FacingMode::Environment)),
            MediaDeviceInfo::camera("front-1", Some(FacingMode::User)),
            MediaDeviceInfo::microphone("mic-0", "Built-in Microphone"),
        ]
    }

    #[test]
    fn test_explicit_device_id_wins() {
        let devices = phone_cameras();
        let selected = select_camera(&devices, Some("back-0"), FacingMode::User).unwrap();
        assert_eq!(selected.device_id, "back-0");
    }

    #[test]
    fn test_facing_mode_scan() {
        let devices = phone_cameras();
        let front = select_camera(&devices, None, FacingMode::User).unwrap();
        assert_eq!(front.device_id, "front-1");
        let back = select_camera(&devices, None, FacingMode::Environment).unwrap();
        assert_eq!(back.device_id, "back-0");
    }

    #[test]
    fn test_fallback_to_first_camera() {
        let devices = vec![
            MediaDeviceInfo::microphone("mic-0", ""),
            MediaDeviceInfo::camera("usb-cam", None),
        ];
        let selected = select_camera(&devices, Some("missing"), FacingMode::Environment).unwrap();
        assert_eq!(selected.device_id, "usb-cam");
    }

    #[test]
    fn test_no_camera() {
        let devices = vec![MediaDeviceInfo::microphone("mic-0", "")];
        assert!(select_camera(&devices, None, FacingMode::User).is_none());
    }

    #[test]
    fn test_switch_requires_two_cameras() {
        let devices = vec![MediaDeviceInfo::camera("only", Some(FacingMode::User))];
        assert!(select_switch_target(&devices, Some("only"), FacingMode::Environment).is_none());
    }

    #[test]
    fn test_switch_alternates() {
        let devices = phone_cameras();
        let first = select_switch_target(&devices, Some("front-1"), FacingMode::Environment)
            .unwrap();
        assert_eq!(first.device_id, "back-0");
        let second =
            select_switch_target(&devices, Some(&first.device_id), FacingMode::User).unwrap();
        assert_eq!(second.device_id, "front-1");
    }

    #[test]
    fn test_switch_cycles_without_facing() {
        let devices = vec![
            MediaDeviceInfo::camera("a", None),
            MediaDeviceInfo::camera("b", None),
        ];
        let next = select_switch_target(&devices, Some("a"), FacingMode::Environment).unwrap();
        assert_eq!(next.device_id, "b");
        let back = select_switch_target(&devices, Some("b"), FacingMode::User).unwrap();
        assert_eq!(back.device_id, "a");
    }

    #[test]
    fn test_display_labels() {
        let devices = phone_cameras();
        assert_eq!(devices[0].display_label(), "Back Camera");
        assert_eq!(devices[1].display_label(), "Front Camera");
        assert_eq!(devices[2].display_label(), "Built-in Microphone");
        assert_eq!(
            MediaDeviceInfo::camera("usb", None).display_label(),
            "Camera usb"
        );
    }
}
