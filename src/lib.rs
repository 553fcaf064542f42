//! cap-webrtc - single peer-connection WebRTC sessions
//!
//! This crate drives one peer connection on behalf of a host application:
//! SDP/ICE negotiation, local capture tracks, data channels and native
//! video views, with connection activity reported as events.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod platform;
pub mod webrtc;

pub use error::{AppError, Result};
