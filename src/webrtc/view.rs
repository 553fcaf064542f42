//! Video view registry
//!
//! One remote video stream is tracked for rendering: the first remote video
//! track the session sees. Views bind it when they are created after its
//! arrival, or when it arrives while they are still empty. Views never own
//! the stream.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::RemoteTrack;
use crate::error::{AppError, Result};
use crate::media::MediaKind;
use crate::platform::{SurfaceFactory, VideoSurface};

/// View position and size in platform pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewGeometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ViewGeometry {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    fn validate(&self) -> Result<()> {
        let values = [self.x, self.y, self.width, self.height];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(AppError::InvalidArgument(
                "view geometry must be finite".to_string(),
            ));
        }
        if self.width < 0.0 || self.height < 0.0 {
            return Err(AppError::InvalidArgument(format!(
                "negative view size {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// How frames are scaled into the view
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    /// Letterbox
    #[default]
    Fit,
    /// Crop to fill
    Fill,
}

impl std::fmt::Display for FitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitMode::Fit => write!(f, "fit"),
            FitMode::Fill => write!(f, "fill"),
        }
    }
}

/// `createVideoView` request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateVideoViewRequest {
    #[serde(flatten)]
    pub geometry: ViewGeometry,
    #[serde(default)]
    pub mode: Option<FitMode>,
}

/// `updateVideoView` request; absent fields keep their value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateVideoViewRequest {
    pub view_id: String,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub mode: Option<FitMode>,
}

impl UpdateVideoViewRequest {
    fn apply(&self, geometry: &ViewGeometry) -> ViewGeometry {
        ViewGeometry {
            x: self.x.unwrap_or(geometry.x),
            y: self.y.unwrap_or(geometry.y),
            width: self.width.unwrap_or(geometry.width),
            height: self.height.unwrap_or(geometry.height),
        }
    }

    fn moves(&self) -> bool {
        self.x.is_some() || self.y.is_some() || self.width.is_some() || self.height.is_some()
    }
}

struct VideoView {
    geometry: ViewGeometry,
    mode: FitMode,
    surface: Box<dyn VideoSurface>,
    /// Id of the bound remote track
    bound: Option<String>,
}

impl VideoView {
    fn bind(&mut self, track: &RemoteTrack) -> bool {
        if self.bound.is_some() {
            return false;
        }
        self.surface.attach(track);
        self.bound = Some(track.id.clone());
        true
    }

    fn teardown(mut self) {
        if self.bound.take().is_some() {
            self.surface.detach();
        }
        self.surface.release();
    }
}

/// Views keyed by generated id
#[derive(Default)]
pub struct ViewRegistry {
    views: HashMap<String, VideoView>,
    remote: Option<RemoteTrack>,
    hidden: bool,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a surface and bind the current remote stream, if any
    pub fn create(
        &mut self,
        surfaces: &dyn SurfaceFactory,
        request: &CreateVideoViewRequest,
    ) -> Result<String> {
        request.geometry.validate()?;
        let mode = request.mode.unwrap_or_default();
        let surface = surfaces.create_surface(&request.geometry, mode)?;

        let mut view = VideoView {
            geometry: request.geometry,
            mode,
            surface,
            bound: None,
        };
        if self.hidden {
            view.surface.set_hidden(true);
        }
        if let Some(track) = &self.remote {
            view.bind(track);
        }

        let view_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Video view {} created at {:?} ({}, bound={})",
            view_id,
            request.geometry,
            mode,
            view.bound.is_some()
        );
        self.views.insert(view_id.clone(), view);
        Ok(view_id)
    }

    pub fn update(&mut self, request: &UpdateVideoViewRequest) -> Result<()> {
        let view = self
            .views
            .get_mut(&request.view_id)
            .ok_or_else(|| AppError::unknown_view(&request.view_id))?;

        if request.moves() {
            let geometry = request.apply(&view.geometry);
            geometry.validate()?;
            view.geometry = geometry;
            view.surface.set_geometry(&geometry);
        }
        if let Some(mode) = request.mode {
            view.mode = mode;
            view.surface.set_mode(mode);
        }
        debug!("Video view {} now {:?} ({})", request.view_id, view.geometry, view.mode);
        Ok(())
    }

    /// Detach and release; unknown ids are ignored
    pub fn destroy(&mut self, view_id: &str) -> bool {
        match self.views.remove(view_id) {
            Some(view) => {
                view.teardown();
                info!("Video view {} destroyed", view_id);
                true
            }
            None => false,
        }
    }

    /// Offer a remote track for rendering
    ///
    /// Only the first video track is kept. Returns how many views it was
    /// bound to.
    pub fn set_remote_track(&mut self, track: RemoteTrack) -> usize {
        if track.kind != MediaKind::Video {
            return 0;
        }
        if let Some(current) = &self.remote {
            debug!(
                "Ignoring remote video track {}; already rendering {}",
                track.id, current.id
            );
            return 0;
        }
        self.remote = Some(track);
        self.attach_pending()
    }

    /// Bind the current remote stream into every empty view
    fn attach_pending(&mut self) -> usize {
        let Some(track) = &self.remote else {
            return 0;
        };
        let bound = self
            .views
            .values_mut()
            .map(|view| view.bind(track))
            .filter(|bound| *bound)
            .count();
        if bound > 0 {
            info!("Remote video {} bound to {} view(s)", track.id, bound);
        }
        bound
    }

    pub fn remote_track(&self) -> Option<&RemoteTrack> {
        self.remote.as_ref()
    }

    /// Hide or show every surface (backgrounding)
    pub fn set_hidden(&mut self, hidden: bool) {
        self.hidden = hidden;
        for view in self.views.values_mut() {
            view.surface.set_hidden(hidden);
        }
    }

    pub fn geometry(&self, view_id: &str) -> Option<(ViewGeometry, FitMode)> {
        self.views.get(view_id).map(|v| (v.geometry, v.mode))
    }

    pub fn is_bound(&self, view_id: &str) -> bool {
        self.views
            .get(view_id)
            .map(|v| v.bound.is_some())
            .unwrap_or(false)
    }

    /// Tear down every view and forget the remote stream
    pub fn clear(&mut self) -> usize {
        let count = self.views.len();
        for (_, view) in self.views.drain() {
            view.teardown();
        }
        self.remote = None;
        count
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{HeadlessSurfaceFactory, SurfaceStats};
    use std::sync::Arc;

    fn remote(id: &str, kind: MediaKind) -> RemoteTrack {
        RemoteTrack::new(id, kind, Arc::new(()))
    }

    fn request(width: f64, height: f64) -> CreateVideoViewRequest {
        CreateVideoViewRequest {
            geometry: ViewGeometry::new(0.0, 0.0, width, height),
            mode: None,
        }
    }

    #[test]
    fn test_view_binds_once() {
        let stats = Arc::new(SurfaceStats::default());
        let factory = HeadlessSurfaceFactory::new(stats.clone());
        let mut views = ViewRegistry::new();

        let early = views.create(&factory, &request(320.0, 240.0)).unwrap();
        assert!(!views.is_bound(&early));

        assert_eq!(views.set_remote_track(remote("audio-1", MediaKind::Audio)), 0);
        assert_eq!(views.set_remote_track(remote("video-1", MediaKind::Video)), 1);
        assert_eq!(views.set_remote_track(remote("video-2", MediaKind::Video)), 0);
        assert_eq!(stats.attached(), 1);

        let late = views.create(&factory, &request(640.0, 480.0)).unwrap();
        assert!(views.is_bound(&late));
        assert_eq!(views.remote_track().unwrap().id, "video-1");
        assert_eq!(stats.attached(), 2);
    }

    #[test]
    fn test_partial_update() {
        let factory = HeadlessSurfaceFactory::new(Arc::new(SurfaceStats::default()));
        let mut views = ViewRegistry::new();
        let id = views
            .create(
                &factory,
                &CreateVideoViewRequest {
                    geometry: ViewGeometry::new(10.0, 20.0, 300.0, 200.0),
                    mode: Some(FitMode::Fill),
                },
            )
            .unwrap();

        views
            .update(&UpdateVideoViewRequest {
                view_id: id.clone(),
                width: Some(640.0),
                ..Default::default()
            })
            .unwrap();

        let (geometry, mode) = views.geometry(&id).unwrap();
        assert_eq!(geometry, ViewGeometry::new(10.0, 20.0, 640.0, 200.0));
        assert_eq!(mode, FitMode::Fill);

        let missing = views.update(&UpdateVideoViewRequest {
            view_id: "nope".to_string(),
            ..Default::default()
        });
        assert!(matches!(missing, Err(AppError::UnknownResource { kind: "viewId", .. })));
    }

    #[test]
    fn test_destroy_detaches_without_stopping() {
        let stats = Arc::new(SurfaceStats::default());
        let factory = HeadlessSurfaceFactory::new(stats.clone());
        let mut views = ViewRegistry::new();
        views.set_remote_track(remote("video-1", MediaKind::Video));
        let id = views.create(&factory, &request(1.0, 1.0)).unwrap();

        assert!(views.destroy(&id));
        assert!(!views.destroy(&id));
        assert_eq!(stats.detached(), 1);
        assert_eq!(stats.released(), 1);
        assert!(views.remote_track().is_some());
    }

    #[test]
    fn test_hidden_views() {
        let stats = Arc::new(SurfaceStats::default());
        let factory = HeadlessSurfaceFactory::new(stats.clone());
        let mut views = ViewRegistry::new();
        views.create(&factory, &request(1.0, 1.0)).unwrap();
        views.set_hidden(true);
        views.create(&factory, &request(1.0, 1.0)).unwrap();
        assert_eq!(stats.hidden(), 2);

        views.set_hidden(false);
        assert_eq!(stats.hidden(), 0);
        assert_eq!(views.clear(), 2);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn test_rejects_negative_size() {
        let factory = HeadlessSurfaceFactory::new(Arc::new(SurfaceStats::default()));
        let mut views = ViewRegistry::new();
        assert!(matches!(
            views.create(&factory, &request(-1.0, 10.0)),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_request_wire_format() {
        let request: CreateVideoViewRequest =
            serde_json::from_str(r#"{"x":0,"y":50,"width":360,"height":640,"mode":"fill"}"#)
                .unwrap();
        assert_eq!(request.geometry.height, 640.0);
        assert_eq!(request.mode, Some(FitMode::Fill));

        let update: UpdateVideoViewRequest =
            serde_json::from_str(r#"{"viewId":"v1","y":10}"#).unwrap();
        assert_eq!(update.y, Some(10.0));
        assert_eq!(update.mode, None);
    }
}
