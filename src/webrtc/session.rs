//! Session controller
//!
//! Owns the single peer connection of a session and the three registries
//! hanging off it. State is `Idle` (no session) or `Started`.
//!
//! Locking: all session state sits behind one mutex. Operations take what
//! they need under the lock, release it, await the engine, then lock again
//! to record the result. A session generation number guards that second
//! step; if `stop` ran in between, the freshly created resource is released
//! and the call fails with `NotStarted`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::data_channel::{
    channel_handlers, encode_outbound, ChannelEntry, CreateDataChannelRequest,
    DataChannelRegistry, SendDataRequest,
};
use super::negotiation::{NegotiationEngine, NegotiationStats};
use super::signaling::{ConnectionState, IceCandidate, SdpDescription};
use super::view::{CreateVideoViewRequest, UpdateVideoViewRequest, ViewRegistry};
use crate::config::SessionConfig;
use crate::engine::{
    ChannelEventSlots, DataChannelBackend, PeerConfig, PeerConnectionBackend, PeerEventHandlers,
    PeerEventSlots, RemoteTrack, RtcEngine,
};
use crate::error::{AppError, Result};
use crate::events::{EventBus, EventSink, SessionEvent};
use crate::media::track::{attach_track, detach_track, open_user_media, switch_camera};
use crate::media::{default_audio_input, GetUserMediaOptions, InputDevice, TrackInfo, TrackRegistry};
use crate::platform::Platform;

/// Live session state
struct Session {
    generation: u64,
    peer: Arc<dyn PeerConnectionBackend>,
    peer_events: Arc<PeerEventSlots>,
    negotiation: Arc<NegotiationEngine>,
    tracks: TrackRegistry,
    channels: DataChannelRegistry,
    views: ViewRegistry,
}

/// What an operation needs from the session while it awaits the engine
struct SessionHandle {
    generation: u64,
    peer: Arc<dyn PeerConnectionBackend>,
    negotiation: Arc<NegotiationEngine>,
}

type SharedSession = Arc<Mutex<Option<Session>>>;

/// Top-level state machine for one peer connection
pub struct SessionController {
    engine: Arc<dyn RtcEngine>,
    platform: Platform,
    events: Arc<EventBus>,
    generation: Arc<AtomicU64>,
    session: SharedSession,
    /// Serializes start/stop
    lifecycle: tokio::sync::Mutex<()>,
    background: AtomicBool,
}

impl SessionController {
    pub fn new(engine: Arc<dyn RtcEngine>, platform: Platform) -> Self {
        Self {
            engine,
            platform,
            events: Arc::new(EventBus::new()),
            generation: Arc::new(AtomicU64::new(0)),
            session: Arc::new(Mutex::new(None)),
            lifecycle: tokio::sync::Mutex::new(()),
            background: AtomicBool::new(false),
        }
    }

    /// Publish on an existing bus instead of a private one
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn is_started(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Engine-reported state of the current peer connection
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.peer.connection_state())
    }

    pub fn negotiation_stats(&self) -> Option<NegotiationStats> {
        self.session.lock().as_ref().map(|s| s.negotiation.stats())
    }

    fn handle(&self) -> Result<SessionHandle> {
        self.session
            .lock()
            .as_ref()
            .map(|s| SessionHandle {
                generation: s.generation,
                peer: s.peer.clone(),
                negotiation: s.negotiation.clone(),
            })
            .ok_or(AppError::NotStarted)
    }

    fn with_started<T>(&self, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let mut guard = self.session.lock();
        let session = guard.as_mut().ok_or(AppError::NotStarted)?;
        f(session)
    }

    /// Run `f` only if the session that started an operation is still live
    fn with_live<T>(&self, generation: u64, f: impl FnOnce(&mut Session) -> T) -> Option<T> {
        let mut guard = self.session.lock();
        guard
            .as_mut()
            .filter(|s| s.generation == generation)
            .map(f)
    }

    /// An engine error raised after `stop` tore the session down reads as `NotStarted`
    fn stale_or(&self, generation: u64, err: AppError) -> AppError {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Dropping engine error from stopped session: {}", err);
            return AppError::NotStarted;
        }
        err
    }

    fn sink(&self, generation: u64) -> EventSink {
        EventSink::new(self.events.clone(), self.generation.clone(), generation)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create the peer connection and register its callbacks
    pub async fn start(&self, config: SessionConfig) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_started() {
            return Err(AppError::AlreadyStarted);
        }
        config.validate()?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let peer_events = PeerEventSlots::new(self.peer_handlers(generation));
        let peer_config = PeerConfig {
            ice_servers: config.ice_servers.clone(),
        };
        let peer = match self
            .engine
            .create_peer_connection(&peer_config, peer_events.clone())
            .await
        {
            Ok(peer) => peer,
            Err(e) => {
                peer_events.clear();
                return Err(e);
            }
        };

        if config.enable_background_audio {
            if let Err(e) = self.platform.keep_alive.start() {
                warn!("Failed to start background keep-alive: {}", e);
            }
        }

        let mut views = ViewRegistry::new();
        if self.background.load(Ordering::SeqCst) {
            views.set_hidden(true);
        }

        *self.session.lock() = Some(Session {
            generation,
            peer,
            peer_events,
            negotiation: Arc::new(NegotiationEngine::new()),
            tracks: TrackRegistry::new(),
            channels: DataChannelRegistry::new(),
            views,
        });

        info!(
            "Session {} started on {} engine ({} ICE server(s), background audio: {})",
            generation,
            self.engine.name(),
            config.ice_servers.len(),
            config.enable_background_audio
        );
        Ok(())
    }

    /// Tear the session down; a no-op when idle
    ///
    /// Callbacks are deregistered before anything is released, then views,
    /// data channels, local tracks and finally the peer connection go.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let taken = self.session.lock().take();
        let Some(mut session) = taken else {
            debug!("stop() with no active session");
            return Ok(());
        };

        session.peer_events.clear();
        session.channels.clear_handlers();
        self.generation.fetch_add(1, Ordering::SeqCst);

        let views = session.views.clear();
        let channels = session.channels.drain();
        let tracks = session.tracks.drain();
        let peer = session.peer.clone();
        drop(session);

        for entry in &channels {
            if let Err(e) = entry.backend.close().await {
                warn!("Failed to close data channel {}: {}", entry.backend.label(), e);
            }
        }
        for track in &tracks {
            track.backend.stop();
        }
        if let Err(e) = peer.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
        if let Err(e) = self.platform.keep_alive.stop() {
            debug!("Keep-alive stop failed: {}", e);
        }

        info!(
            "Session stopped: released {} view(s), {} data channel(s), {} track(s)",
            views,
            channels.len(),
            tracks.len()
        );
        Ok(())
    }

    fn peer_handlers(&self, generation: u64) -> PeerEventHandlers {
        let sink = self.sink(generation);

        let ice_sink = sink.clone();
        let state_sink = sink.clone();
        let track_session = self.session.clone();
        let channel_session = self.session.clone();

        PeerEventHandlers {
            on_ice_candidate: Some(Box::new(move |candidate: IceCandidate| {
                ice_sink.publish(SessionEvent::IceCandidate {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                });
            })),
            on_connection_state: Some(Box::new(move |state: ConnectionState| {
                info!("Connection state: {}", state);
                state_sink.publish(SessionEvent::ConnectionState {
                    state: state.to_string(),
                });
            })),
            on_remote_track: Some(Box::new(move |track: RemoteTrack| {
                let mut guard = track_session.lock();
                match guard.as_mut().filter(|s| s.generation == generation) {
                    Some(session) => {
                        info!("Remote {} track {} available", track.kind, track.id);
                        session.views.set_remote_track(track);
                    }
                    None => debug!("Remote track {} for stale session", track.id),
                }
            })),
            on_data_channel: Some(Box::new(move |channel: Arc<dyn DataChannelBackend>| {
                register_inbound(&channel_session, generation, &sink, channel);
            })),
        }
    }

    // ========================================================================
    // Negotiation
    // ========================================================================

    pub async fn set_remote_description(&self, desc: SdpDescription) -> Result<()> {
        let handle = self.handle()?;
        handle
            .negotiation
            .set_remote_description(handle.peer.as_ref(), desc)
            .await
            .map_err(|e| self.stale_or(handle.generation, e))
    }

    pub async fn set_local_description(&self, desc: SdpDescription) -> Result<()> {
        let handle = self.handle()?;
        handle
            .negotiation
            .set_local_description(handle.peer.as_ref(), desc)
            .await
            .map_err(|e| self.stale_or(handle.generation, e))
    }

    pub async fn create_offer(&self) -> Result<SdpDescription> {
        let handle = self.handle()?;
        handle
            .negotiation
            .create_offer(handle.peer.as_ref())
            .await
            .map_err(|e| self.stale_or(handle.generation, e))
    }

    pub async fn create_answer(&self) -> Result<SdpDescription> {
        let handle = self.handle()?;
        handle
            .negotiation
            .create_answer(handle.peer.as_ref())
            .await
            .map_err(|e| self.stale_or(handle.generation, e))
    }

    /// Apply a remote candidate; unusable candidates are dropped, not errors
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let handle = self.handle()?;
        handle
            .negotiation
            .add_ice_candidate(handle.peer.as_ref(), candidate)
            .await
            .map(|_| ())
            .map_err(|e| self.stale_or(handle.generation, e))
    }

    // ========================================================================
    // Video views
    // ========================================================================

    pub fn create_video_view(&self, request: &CreateVideoViewRequest) -> Result<String> {
        let surfaces = self.platform.surfaces.clone();
        self.with_started(|s| s.views.create(surfaces.as_ref(), request))
    }

    pub fn update_video_view(&self, request: &UpdateVideoViewRequest) -> Result<()> {
        self.with_started(|s| s.views.update(request))
    }

    /// Unknown ids and an idle controller are both fine
    pub fn destroy_video_view(&self, view_id: &str) -> Result<()> {
        let destroyed = self
            .session
            .lock()
            .as_mut()
            .map(|s| s.views.destroy(view_id))
            .unwrap_or(false);
        if !destroyed {
            debug!("destroyVideoView: no view {}", view_id);
        }
        Ok(())
    }

    pub fn set_speakerphone_on(&self, on: bool) -> Result<()> {
        self.platform.audio.set_speakerphone(on)
    }

    /// App moved to the background: hide every view, media keeps flowing
    pub fn enter_background(&self) {
        self.background.store(true, Ordering::SeqCst);
        if let Some(session) = self.session.lock().as_mut() {
            session.views.set_hidden(true);
        }
        info!("Entered background");
    }

    pub fn enter_foreground(&self) {
        self.background.store(false, Ordering::SeqCst);
        if let Some(session) = self.session.lock().as_mut() {
            session.views.set_hidden(false);
        }
        info!("Entered foreground");
    }

    // ========================================================================
    // Data channels
    // ========================================================================

    /// Create a local channel; its label doubles as the channel id
    pub async fn create_data_channel(&self, request: CreateDataChannelRequest) -> Result<String> {
        if request.label.is_empty() {
            return Err(AppError::MissingArgument("label"));
        }
        let init = request.options.to_init()?;
        let handle = self.handle()?;

        let label = request.label;
        let backend = handle
            .peer
            .create_data_channel(&label, &init)
            .await
            .map_err(|e| self.stale_or(handle.generation, e))?;
        let slots = ChannelEventSlots::new(channel_handlers(&label, self.sink(handle.generation)));

        let registered = self.with_live(handle.generation, |s| {
            s.channels.insert(
                &label,
                ChannelEntry {
                    backend: backend.clone(),
                    slots: slots.clone(),
                },
            )
        });
        if registered.is_none() {
            let _ = backend.close().await;
            return Err(AppError::NotStarted);
        }

        backend.attach_events(slots);
        info!(
            "Data channel {} created (ordered={}, negotiated id={:?})",
            label, init.ordered, init.negotiated_id
        );
        Ok(label)
    }

    pub async fn send_data(&self, request: SendDataRequest) -> Result<()> {
        if request.channel_id.is_empty() {
            return Err(AppError::MissingArgument("channelId"));
        }
        let channel = self.with_started(|s| s.channels.get(&request.channel_id))?;
        let frame = encode_outbound(request.data, request.binary)?;
        debug!(
            "Sending {} bytes on {} (binary={})",
            frame.data.len(),
            request.channel_id,
            frame.binary
        );
        channel.send(frame).await
    }

    /// Close and deregister; unknown ids succeed
    ///
    /// The channel keeps its state handler so `closing`/`closed` still reach
    /// the application.
    pub async fn close_data_channel(&self, channel_id: &str) -> Result<()> {
        let entry = self
            .session
            .lock()
            .as_mut()
            .and_then(|s| s.channels.remove(channel_id));
        let Some(entry) = entry else {
            debug!("closeDataChannel: no channel {}", channel_id);
            return Ok(());
        };
        if let Err(e) = entry.backend.close().await {
            warn!("Failed to close data channel {}: {}", channel_id, e);
        }
        info!("Data channel {} closed", channel_id);
        Ok(())
    }

    // ========================================================================
    // Local media
    // ========================================================================

    /// Open capture tracks and register them
    pub async fn get_user_media(&self, options: GetUserMediaOptions) -> Result<Vec<TrackInfo>> {
        let handle = self.handle()?;
        let tracks = open_user_media(self.engine.as_ref(), &options)
            .await
            .map_err(|e| self.stale_or(handle.generation, e))?;
        let infos: Vec<TrackInfo> = tracks.iter().map(|t| t.info()).collect();

        let registered = self.with_live(handle.generation, |s| {
            for track in &tracks {
                s.tracks.insert(track.clone());
            }
        });
        if registered.is_none() {
            for track in &tracks {
                track.backend.stop();
            }
            return Err(AppError::NotStarted);
        }
        Ok(infos)
    }

    pub async fn add_track(&self, track_id: &str) -> Result<()> {
        let handle = self.handle()?;
        let track = self.with_started(|s| s.tracks.get(track_id))?;
        attach_track(handle.peer.as_ref(), &track)
            .await
            .map_err(|e| self.stale_or(handle.generation, e))
    }

    /// Detach a track from the peer connection; the track keeps capturing
    pub async fn remove_track(&self, track_id: &str) -> Result<()> {
        let handle = self.handle()?;
        self.with_started(|s| s.tracks.get(track_id))?;
        detach_track(handle.peer.as_ref(), track_id)
            .await
            .map_err(|e| self.stale_or(handle.generation, e))
    }

    pub fn get_tracks(&self) -> Result<Vec<TrackInfo>> {
        self.with_started(|s| Ok(s.tracks.infos()))
    }

    pub fn set_track_enabled(&self, track_id: &str, enabled: bool) -> Result<()> {
        self.with_started(|s| s.tracks.set_enabled(track_id, enabled))
    }

    /// Move the active video track to the camera facing the other way
    pub async fn switch_camera(&self) -> Result<()> {
        let handle = self.handle()?;
        let (current, facing) = self.with_started(|s| {
            let current = s.tracks.active_video().ok_or_else(|| {
                AppError::DeviceUnavailable("no active video track to switch".to_string())
            })?;
            Ok((current, s.tracks.current_facing()))
        })?;

        let replacement =
            switch_camera(self.engine.as_ref(), handle.peer.as_ref(), &current, facing)
                .await
                .map_err(|e| self.stale_or(handle.generation, e))?;

        let replaced = self.with_live(handle.generation, |s| {
            s.tracks.replace(current.id(), replacement.clone())
        });
        if replaced.is_none() {
            replacement.backend.stop();
            return Err(AppError::NotStarted);
        }
        Ok(())
    }

    pub async fn get_audio_input_devices(&self) -> Result<Vec<InputDevice>> {
        let devices: Vec<InputDevice> = self
            .engine
            .audio_input_devices()
            .await?
            .iter()
            .map(InputDevice::from)
            .collect();
        if devices.is_empty() {
            return Ok(vec![default_audio_input()]);
        }
        Ok(devices)
    }

    pub async fn get_video_input_devices(&self) -> Result<Vec<InputDevice>> {
        Ok(self
            .engine
            .video_input_devices()
            .await?
            .iter()
            .map(InputDevice::from)
            .collect())
    }
}

/// Register a channel the remote peer opened
///
/// The `dataChannel` event goes out before message handlers are attached,
/// so no message can precede it.
fn register_inbound(
    session: &SharedSession,
    generation: u64,
    sink: &EventSink,
    channel: Arc<dyn DataChannelBackend>,
) {
    let label = channel.label().to_string();
    let slots = ChannelEventSlots::new(channel_handlers(&label, sink.clone()));

    {
        let mut guard = session.lock();
        let Some(live) = guard.as_mut().filter(|s| s.generation == generation) else {
            debug!("Inbound data channel {} for stale session", label);
            return;
        };
        live.channels.insert(
            &label,
            ChannelEntry {
                backend: channel.clone(),
                slots: slots.clone(),
            },
        );
    }

    info!("Remote opened data channel {}", label);
    sink.publish(SessionEvent::DataChannel {
        channel_id: label.clone(),
        label,
    });
    channel.attach_events(slots);
}
