//! Platform collaborators
//!
//! Audio routing, background keep-alive and video surfaces belong to the
//! host platform. The session only talks to them through these traits.
//! The defaults here are headless: they log what a real platform would do
//! and keep counters so behavior can be observed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::engine::RemoteTrack;
use crate::error::Result;
use crate::webrtc::view::{FitMode, ViewGeometry};

/// Speaker/earpiece routing
pub trait AudioRouting: Send + Sync {
    fn set_speakerphone(&self, on: bool) -> Result<()>;
}

/// Keeps the process alive while backgrounded
pub trait KeepAlive: Send + Sync {
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;
}

/// Creates rendering surfaces for video views
pub trait SurfaceFactory: Send + Sync {
    fn create_surface(&self, geometry: &ViewGeometry, mode: FitMode)
        -> Result<Box<dyn VideoSurface>>;
}

/// One rendering surface
pub trait VideoSurface: Send {
    fn set_geometry(&mut self, geometry: &ViewGeometry);

    fn set_mode(&mut self, mode: FitMode);

    /// Start presenting frames from `track`
    fn attach(&mut self, track: &RemoteTrack);

    /// Stop presenting; the track itself keeps running
    fn detach(&mut self);

    fn set_hidden(&mut self, hidden: bool);

    /// Tear the surface down
    fn release(&mut self);
}

/// Collaborators handed to the session controller
#[derive(Clone)]
pub struct Platform {
    pub audio: Arc<dyn AudioRouting>,
    pub keep_alive: Arc<dyn KeepAlive>,
    pub surfaces: Arc<dyn SurfaceFactory>,
}

impl Platform {
    pub fn new(
        audio: Arc<dyn AudioRouting>,
        keep_alive: Arc<dyn KeepAlive>,
        surfaces: Arc<dyn SurfaceFactory>,
    ) -> Self {
        Self {
            audio,
            keep_alive,
            surfaces,
        }
    }

    /// Headless platform plus handles on its counters
    pub fn headless() -> (Self, HeadlessHandles) {
        let handles = HeadlessHandles {
            audio: Arc::new(LoggingAudioRouting::default()),
            keep_alive: Arc::new(LoggingKeepAlive::default()),
            surfaces: Arc::new(SurfaceStats::default()),
        };
        let platform = Self::new(
            handles.audio.clone(),
            handles.keep_alive.clone(),
            Arc::new(HeadlessSurfaceFactory::new(handles.surfaces.clone())),
        );
        (platform, handles)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::headless().0
    }
}

/// Observable side of [`Platform::headless`]
#[derive(Clone)]
pub struct HeadlessHandles {
    pub audio: Arc<LoggingAudioRouting>,
    pub keep_alive: Arc<LoggingKeepAlive>,
    pub surfaces: Arc<SurfaceStats>,
}

#[derive(Default)]
pub struct LoggingAudioRouting {
    speaker: AtomicBool,
}

impl LoggingAudioRouting {
    pub fn speaker_on(&self) -> bool {
        self.speaker.load(Ordering::SeqCst)
    }
}

impl AudioRouting for LoggingAudioRouting {
    fn set_speakerphone(&self, on: bool) -> Result<()> {
        self.speaker.store(on, Ordering::SeqCst);
        info!("Speakerphone {}", if on { "on" } else { "off" });
        Ok(())
    }
}

#[derive(Default)]
pub struct LoggingKeepAlive {
    active: AtomicBool,
}

impl LoggingKeepAlive {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl KeepAlive for LoggingKeepAlive {
    fn start(&self) -> Result<()> {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!("Background keep-alive started");
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("Background keep-alive stopped");
        }
        Ok(())
    }
}

/// Surface counters
#[derive(Default)]
pub struct SurfaceStats {
    created: AtomicUsize,
    released: AtomicUsize,
    attached: AtomicUsize,
    detached: AtomicUsize,
    hidden: AtomicUsize,
}

impl SurfaceStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Total stream bindings made
    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn detached(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }

    /// Surfaces currently hidden
    pub fn hidden(&self) -> usize {
        self.hidden.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.created().saturating_sub(self.released())
    }
}

pub struct HeadlessSurfaceFactory {
    stats: Arc<SurfaceStats>,
}

impl HeadlessSurfaceFactory {
    pub fn new(stats: Arc<SurfaceStats>) -> Self {
        Self { stats }
    }
}

impl SurfaceFactory for HeadlessSurfaceFactory {
    fn create_surface(
        &self,
        geometry: &ViewGeometry,
        mode: FitMode,
    ) -> Result<Box<dyn VideoSurface>> {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(HeadlessSurface {
            stats: self.stats.clone(),
            geometry: *geometry,
            mode,
            track: None,
            hidden: false,
            released: false,
        }))
    }
}

/// Surface that renders nothing
pub struct HeadlessSurface {
    stats: Arc<SurfaceStats>,
    geometry: ViewGeometry,
    mode: FitMode,
    track: Option<String>,
    hidden: bool,
    released: bool,
}

impl VideoSurface for HeadlessSurface {
    fn set_geometry(&mut self, geometry: &ViewGeometry) {
        self.geometry = *geometry;
        debug!("Surface geometry {:?}", self.geometry);
    }

    fn set_mode(&mut self, mode: FitMode) {
        self.mode = mode;
    }

    fn attach(&mut self, track: &RemoteTrack) {
        self.stats.attached.fetch_add(1, Ordering::SeqCst);
        debug!("Surface ({:?}, {}) bound to {}", self.geometry, self.mode, track.id);
        self.track = Some(track.id.clone());
    }

    fn detach(&mut self) {
        if self.track.take().is_some() {
            self.stats.detached.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn set_hidden(&mut self, hidden: bool) {
        if self.hidden == hidden {
            return;
        }
        self.hidden = hidden;
        if hidden {
            self.stats.hidden.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stats.hidden.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.set_hidden(false);
        self.released = true;
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}
