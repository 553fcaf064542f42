//! Local media: capture devices and the track registry

pub mod device;
pub mod track;

pub use device::{
    default_audio_input, select_camera, select_switch_target, FacingMode, InputDevice,
    MediaDeviceInfo, MediaKind,
};
pub use track::{GetUserMediaOptions, LocalTrack, TrackConstraint, TrackInfo, TrackRegistry};
