//! Local track registry
//!
//! Owns every capture track created by `getUserMedia`, keyed by track id.
//! The peer connection only references tracks through its senders.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::device::{select_camera, select_switch_target, FacingMode, MediaKind};
use crate::engine::{LocalTrackBackend, PeerConnectionBackend, RtcEngine, RtpSenderBackend};
use crate::error::{AppError, Result};

/// Track descriptor returned to the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub track_id: String,
    pub kind: MediaKind,
    pub enabled: bool,
    pub muted: bool,
}

/// `audio`/`video` may be a flag or a constraints object (object means "on")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackConstraint {
    Enabled(bool),
    Constraints(serde_json::Map<String, serde_json::Value>),
}

impl TrackConstraint {
    pub fn is_requested(&self) -> bool {
        match self {
            TrackConstraint::Enabled(on) => *on,
            TrackConstraint::Constraints(_) => true,
        }
    }
}

/// `getUserMedia` options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetUserMediaOptions {
    /// Defaults to on
    pub audio: Option<TrackConstraint>,
    /// Defaults to on
    pub video: Option<TrackConstraint>,
    pub audio_device_id: Option<String>,
    pub video_device_id: Option<String>,
    /// Defaults to `user`
    pub facing_mode: Option<FacingMode>,
}

impl GetUserMediaOptions {
    pub fn audio_only() -> Self {
        Self {
            video: Some(TrackConstraint::Enabled(false)),
            ..Default::default()
        }
    }

    pub fn video_only(facing: FacingMode) -> Self {
        Self {
            audio: Some(TrackConstraint::Enabled(false)),
            facing_mode: Some(facing),
            ..Default::default()
        }
    }

    fn wants_audio(&self) -> bool {
        self.audio.as_ref().map(|c| c.is_requested()).unwrap_or(true)
    }

    fn wants_video(&self) -> bool {
        self.video.as_ref().map(|c| c.is_requested()).unwrap_or(true)
    }
}

/// Registry entry: the engine track plus the device it captures from
#[derive(Clone)]
pub struct LocalTrack {
    pub backend: Arc<dyn LocalTrackBackend>,
    pub device_id: Option<String>,
    pub facing: Option<FacingMode>,
}

impl LocalTrack {
    pub fn id(&self) -> &str {
        self.backend.id()
    }

    pub fn info(&self) -> TrackInfo {
        let enabled = self.backend.enabled();
        TrackInfo {
            track_id: self.backend.id().to_string(),
            kind: self.backend.kind(),
            enabled,
            muted: !enabled,
        }
    }
}

/// Local tracks keyed by track id, in creation order
#[derive(Default)]
pub struct TrackRegistry {
    tracks: HashMap<String, LocalTrack>,
    order: Vec<String>,
    facing: FacingMode,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, track: LocalTrack) {
        let id = track.id().to_string();
        if track.backend.kind() == MediaKind::Video {
            if let Some(facing) = track.facing {
                self.facing = facing;
            }
        }
        if self.tracks.insert(id.clone(), track).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, track_id: &str) -> Result<LocalTrack> {
        self.tracks
            .get(track_id)
            .cloned()
            .ok_or_else(|| AppError::unknown_track(track_id))
    }

    /// Descriptors in creation order
    pub fn infos(&self) -> Vec<TrackInfo> {
        self.order
            .iter()
            .filter_map(|id| self.tracks.get(id))
            .map(LocalTrack::info)
            .collect()
    }

    pub fn set_enabled(&self, track_id: &str, enabled: bool) -> Result<()> {
        let track = self
            .tracks
            .get(track_id)
            .ok_or_else(|| AppError::unknown_track(track_id))?;
        track.backend.set_enabled(enabled);
        debug!("Track {} enabled={}", track_id, enabled);
        Ok(())
    }

    /// Most recently created video track
    pub fn active_video(&self) -> Option<LocalTrack> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.tracks.get(id))
            .find(|t| t.backend.kind() == MediaKind::Video)
            .cloned()
    }

    /// Facing mode of the last camera opened
    pub fn current_facing(&self) -> FacingMode {
        self.facing
    }

    /// Swap a video track for its replacement, keeping its position
    pub fn replace(&mut self, old_id: &str, track: LocalTrack) {
        let new_id = track.id().to_string();
        self.tracks.remove(old_id);
        match self.order.iter().position(|id| id == old_id) {
            Some(i) => self.order[i] = new_id.clone(),
            None => self.order.push(new_id.clone()),
        }
        if let Some(facing) = track.facing {
            self.facing = facing;
        }
        self.tracks.insert(new_id, track);
    }

    /// Remove every track, in creation order
    pub fn drain(&mut self) -> Vec<LocalTrack> {
        let order = std::mem::take(&mut self.order);
        let mut drained = Vec::with_capacity(order.len());
        for id in order {
            if let Some(track) = self.tracks.remove(&id) {
                drained.push(track);
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

fn new_track_id(kind: MediaKind) -> String {
    format!("{}_track_{}", kind, uuid::Uuid::new_v4())
}

/// Open the capture tracks requested by `options`
///
/// Nothing is registered here; on failure every track already opened by
/// this call is stopped.
pub async fn open_user_media(
    engine: &dyn RtcEngine,
    options: &GetUserMediaOptions,
) -> Result<Vec<LocalTrack>> {
    let mut created: Vec<LocalTrack> = Vec::new();

    if options.wants_audio() {
        let track_id = new_track_id(MediaKind::Audio);
        let backend = engine
            .create_audio_track(&track_id, options.audio_device_id.as_deref())
            .await?;
        created.push(LocalTrack {
            backend,
            device_id: options.audio_device_id.clone(),
            facing: None,
        });
    }

    if options.wants_video() {
        match open_camera(engine, options).await {
            Ok(track) => created.push(track),
            Err(e) => {
                for track in &created {
                    track.backend.stop();
                }
                return Err(e);
            }
        }
    }

    info!(
        "getUserMedia opened {} track(s): {:?}",
        created.len(),
        created.iter().map(|t| t.id().to_string()).collect::<Vec<_>>()
    );
    Ok(created)
}

async fn open_camera(engine: &dyn RtcEngine, options: &GetUserMediaOptions) -> Result<LocalTrack> {
    let facing = options.facing_mode.unwrap_or_default();
    let devices = engine.video_input_devices().await?;
    let device = select_camera(&devices, options.video_device_id.as_deref(), facing)
        .ok_or_else(|| AppError::DeviceUnavailable("no camera available".to_string()))?;

    debug!(
        "Selected camera {} (requested facing={}, device facing={:?})",
        device.device_id, facing, device.facing
    );

    let track_id = new_track_id(MediaKind::Video);
    let backend = engine.create_video_track(&track_id, device).await?;
    Ok(LocalTrack {
        backend,
        device_id: Some(device.device_id.clone()),
        facing: Some(device.facing.unwrap_or(facing)),
    })
}

async fn find_sender(
    peer: &dyn PeerConnectionBackend,
    track_id: &str,
) -> Option<Arc<dyn RtpSenderBackend>> {
    for sender in peer.senders().await {
        if sender.track_id().await.as_deref() == Some(track_id) {
            return Some(sender);
        }
    }
    None
}

/// Attach a registered track to the peer connection
pub async fn attach_track(peer: &dyn PeerConnectionBackend, track: &LocalTrack) -> Result<()> {
    peer.add_track(track.backend.clone()).await?;
    info!("Track {} ({}) added to peer connection", track.id(), track.backend.kind());
    Ok(())
}

/// Detach a track by removing the sender it is bound to
pub async fn detach_track(peer: &dyn PeerConnectionBackend, track_id: &str) -> Result<()> {
    let sender = find_sender(peer, track_id)
        .await
        .ok_or_else(|| AppError::TrackNotAttached(track_id.to_string()))?;
    peer.remove_track(sender).await?;
    info!("Track {} removed from peer connection", track_id);
    Ok(())
}

/// Video sender left without a track (e.g. after `remove_track`)
async fn free_video_sender(peer: &dyn PeerConnectionBackend) -> Option<Arc<dyn RtpSenderBackend>> {
    for sender in peer.senders().await {
        if sender.kind() == MediaKind::Video && sender.track_id().await.is_none() {
            return Some(sender);
        }
    }
    None
}

/// Move `current` to the camera facing the other way
///
/// The replacement track is swapped onto the sender carrying `current` (no
/// renegotiation), or onto an idle video sender, or added as a new one.
/// `current` keeps capturing unless the swap succeeds.
pub async fn switch_camera(
    engine: &dyn RtcEngine,
    peer: &dyn PeerConnectionBackend,
    current: &LocalTrack,
    current_facing: FacingMode,
) -> Result<LocalTrack> {
    let target = current_facing.opposite();
    let devices = engine.video_input_devices().await?;
    let device = select_switch_target(&devices, current.device_id.as_deref(), target)
        .ok_or_else(|| {
            AppError::DeviceUnavailable(format!("no {} camera to switch to", target))
        })?;

    let track_id = new_track_id(MediaKind::Video);
    let backend = engine.create_video_track(&track_id, device).await?;
    backend.set_enabled(current.backend.enabled());

    let sender = match find_sender(peer, current.id()).await {
        Some(sender) => Some(sender),
        None => free_video_sender(peer).await,
    };
    let swapped = match sender {
        Some(sender) => sender.replace_track(backend.clone()).await,
        None => peer.add_track(backend.clone()).await.map(|_| ()),
    };
    if let Err(e) = swapped {
        warn!("Camera switch failed, keeping {}: {}", current.id(), e);
        backend.stop();
        return Err(e);
    }
    current.backend.stop();

    let replacement = LocalTrack {
        backend,
        device_id: Some(device.device_id.clone()),
        facing: Some(device.facing.unwrap_or(target)),
    };

    info!(
        "Switched camera {} -> {} ({})",
        current.device_id.as_deref().unwrap_or("?"),
        device.device_id,
        target
    );
    Ok(replacement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::engine::{PeerConfig, PeerEventSlots};

    async fn camera(engine: &MemoryEngine, facing: FacingMode) -> LocalTrack {
        open_user_media(engine, &GetUserMediaOptions::video_only(facing))
            .await
            .unwrap()
            .remove(0)
    }

    async fn peer(engine: &MemoryEngine) -> Arc<dyn PeerConnectionBackend> {
        engine
            .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_user_media_defaults() {
        let engine = MemoryEngine::new();
        let tracks = open_user_media(&engine, &GetUserMediaOptions::default())
            .await
            .unwrap();

        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].backend.kind(), MediaKind::Audio);
        assert_eq!(tracks[1].backend.kind(), MediaKind::Video);
        assert_eq!(tracks[1].facing, Some(FacingMode::User));
        assert!(tracks.iter().all(|t| t.info().enabled && !t.info().muted));
        assert_ne!(tracks[0].id(), tracks[1].id());
    }

    #[tokio::test]
    async fn test_open_user_media_nothing_requested() {
        let engine = MemoryEngine::new();
        let options = GetUserMediaOptions {
            audio: Some(TrackConstraint::Enabled(false)),
            video: Some(TrackConstraint::Enabled(false)),
            ..Default::default()
        };
        assert!(open_user_media(&engine, &options).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_user_media_without_camera() {
        let engine = MemoryEngine::with_devices(vec![]);
        let result = open_user_media(&engine, &GetUserMediaOptions::default()).await;
        assert!(matches!(result, Err(AppError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_constraints_object_means_requested() {
        let options: GetUserMediaOptions =
            serde_json::from_str(r#"{"audio": false, "video": {"width": 640}}"#).unwrap();
        assert!(!options.wants_audio());
        assert!(options.wants_video());
    }

    #[tokio::test]
    async fn test_registry_order_and_replace() {
        let engine = MemoryEngine::new();
        let mut registry = TrackRegistry::new();
        for track in open_user_media(&engine, &GetUserMediaOptions::default())
            .await
            .unwrap()
        {
            registry.insert(track);
        }
        assert_eq!(registry.len(), 2);

        let video = registry.active_video().unwrap();
        let replacement = open_user_media(&engine, &GetUserMediaOptions::video_only(FacingMode::Environment))
            .await
            .unwrap()
            .remove(0);
        let new_id = replacement.id().to_string();
        registry.replace(video.id(), replacement);

        let infos = registry.infos();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[1].track_id, new_id);
        assert_eq!(registry.current_facing(), FacingMode::Environment);
        assert!(registry.get(video.id()).is_err());

        registry.set_enabled(&new_id, false).unwrap();
        assert!(registry.infos()[1].muted);
        assert!(matches!(
            registry.set_enabled("missing", true),
            Err(AppError::UnknownResource { .. })
        ));

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_switch_keeps_current_when_replace_refused() {
        let engine = MemoryEngine::new();
        let peer = peer(&engine).await;
        let current = camera(&engine, FacingMode::User).await;
        attach_track(peer.as_ref(), &current).await.unwrap();

        engine.peer(0).unwrap().refuse_sender_changes(true);
        let result = switch_camera(&engine, peer.as_ref(), &current, FacingMode::User).await;
        assert!(matches!(result, Err(AppError::Engine(_))));
        assert_eq!(engine.live_track_count(), 1);
        let senders = peer.senders().await;
        assert_eq!(senders.len(), 1);
        assert_eq!(senders[0].track_id().await.as_deref(), Some(current.id()));

        engine.peer(0).unwrap().refuse_sender_changes(false);
        let replacement = switch_camera(&engine, peer.as_ref(), &current, FacingMode::User)
            .await
            .unwrap();
        assert_eq!(engine.live_track_count(), 1);
        assert_eq!(replacement.facing, Some(FacingMode::Environment));
        assert_eq!(
            senders[0].track_id().await.as_deref(),
            Some(replacement.id())
        );
    }

    #[tokio::test]
    async fn test_switch_keeps_current_when_add_refused() {
        let engine = MemoryEngine::new();
        let peer = peer(&engine).await;
        let current = camera(&engine, FacingMode::User).await;

        engine.peer(0).unwrap().refuse_sender_changes(true);
        assert!(switch_camera(&engine, peer.as_ref(), &current, FacingMode::User)
            .await
            .is_err());
        assert_eq!(engine.live_track_count(), 1);
        assert!(peer.senders().await.is_empty());
    }

    #[tokio::test]
    async fn test_switch_leaves_other_video_senders_alone() {
        let engine = MemoryEngine::new();
        let peer = peer(&engine).await;
        let first = camera(&engine, FacingMode::User).await;
        let second = camera(&engine, FacingMode::Environment).await;
        attach_track(peer.as_ref(), &first).await.unwrap();

        let replacement = switch_camera(&engine, peer.as_ref(), &second, FacingMode::Environment)
            .await
            .unwrap();
        let senders = peer.senders().await;
        assert_eq!(senders.len(), 2);
        assert_eq!(senders[0].track_id().await.as_deref(), Some(first.id()));
        assert_eq!(senders[1].track_id().await.as_deref(), Some(replacement.id()));
    }

    #[tokio::test]
    async fn test_switch_reuses_idle_video_sender() {
        let engine = MemoryEngine::new();
        let peer = peer(&engine).await;
        let current = camera(&engine, FacingMode::User).await;
        attach_track(peer.as_ref(), &current).await.unwrap();
        detach_track(peer.as_ref(), current.id()).await.unwrap();

        let replacement = switch_camera(&engine, peer.as_ref(), &current, FacingMode::User)
            .await
            .unwrap();
        let senders = peer.senders().await;
        assert_eq!(senders.len(), 1);
        assert_eq!(senders[0].track_id().await.as_deref(), Some(replacement.id()));
    }
}
