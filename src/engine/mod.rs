/// Reconstruction engine capability: the host application behind a typed
/// interface. All geometric computation happens on the other side; the
/// workflow only issues commands and stores the reported results.
pub mod host;
#[cfg(test)]
pub mod sim;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{BlendingMode, DataSource, FilterMode, SurfaceType, WorkflowConfig};
use crate::project::{
    Chunk, Crs, DenseCloud, DepthMapSet, Elevation, Location, Mesh, Orthomosaic, TiePointCloud,
};

#[derive(Debug, Error)]
pub enum EngineError {
    /// The host rejected a parameter only the richer call variant carries.
    /// This is the one error kind stage executors may fall back on; every
    /// other kind propagates.
    #[error("unsupported parameter: {parameter}")]
    UnsupportedParameter { parameter: String },

    #[error("{operation} failed: {message}")]
    Failed { operation: String, message: String },

    #[error("engine i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("unreadable {operation} result: {source}")]
    Protocol {
        operation: String,
        source: serde_json::Error,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Tie-point quality metric used by the outlier-reduction loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMetric {
    ReconstructionUncertainty,
    ProjectionAccuracy,
    ReprojectionError,
}

impl FilterMetric {
    pub fn label(&self) -> &'static str {
        match self {
            FilterMetric::ReconstructionUncertainty => "reconstruction uncertainty",
            FilterMetric::ProjectionAccuracy => "projection accuracy",
            FilterMetric::ReprojectionError => "reprojection error",
        }
    }
}

/// Dense-cloud point classes the workflow manipulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointClass {
    Ground,
    /// Spurious below-ground points flagged by ground classification.
    LowPoint,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlignmentParams {
    pub downscale: u32,
    pub keypoint_limit: u32,
    pub tiepoint_limit: u32,
    pub generic_preselection: bool,
    pub reference_preselection: bool,
}

impl AlignmentParams {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            downscale: config.alignment_downscale,
            keypoint_limit: config.keypoint_limit,
            tiepoint_limit: config.tiepoint_limit,
            generic_preselection: true,
            reference_preselection: true,
        }
    }
}

/// Lens-model fit set for camera optimization. The standard set fits
/// f, cx, cy, k1-k3, p1, p2; the extended set adds b1, b2, k4, p3, p4.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizeParams {
    pub fit_extended: bool,
    pub adaptive_fitting: bool,
    pub tie_point_accuracy: Option<f64>,
}

impl OptimizeParams {
    pub fn standard() -> Self {
        Self {
            fit_extended: false,
            adaptive_fitting: false,
            tie_point_accuracy: None,
        }
    }

    pub fn full() -> Self {
        Self {
            fit_extended: true,
            adaptive_fitting: false,
            tie_point_accuracy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DepthMapParams {
    pub downscale: u32,
    pub filter_mode: FilterMode,
    pub reuse_depth: bool,
    pub max_neighbors: u32,
}

impl DepthMapParams {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            downscale: config.depth_map_downscale,
            filter_mode: config.depth_map_filter,
            reuse_depth: true,
            max_neighbors: config.max_neighbors,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DenseCloudParams {
    pub point_colors: bool,
    pub max_neighbors: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroundParams {
    pub max_angle: f64,
    pub max_distance: f64,
    pub cell_size: f64,
}

impl GroundParams {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            max_angle: config.ground_max_angle,
            max_distance: config.ground_max_distance,
            cell_size: config.ground_cell_size,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelParams {
    pub surface: SurfaceType,
    pub source: DataSource,
    pub interpolation: bool,
    pub vertex_colors: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ElevationParams {
    pub source: DataSource,
    pub resolution: f64,
    /// Supply an explicit map projection; hosts without that capability
    /// answer with `UnsupportedParameter`.
    pub projected: bool,
    pub ground_only: bool,
    pub interpolation: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrthomosaicParams {
    pub blending: BlendingMode,
    pub color_correction: bool,
    pub fill_holes: bool,
    pub projected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PointExportParams {
    pub path: PathBuf,
    pub save_colors: bool,
}

/// Fixed raster export contract: lossy TIFF, tiled with overviews.
#[derive(Debug, Clone, Serialize)]
pub struct RasterExportParams {
    pub path: PathBuf,
    pub jpeg_quality: u8,
    pub tiled: bool,
    pub overviews: bool,
    pub alpha: bool,
    pub white_background: bool,
    pub description: String,
}

/// Every operation blocks until the host finishes and returns a typed
/// result or a typed error. The controller depends only on this trait,
/// which is what makes the whole suite testable without the real engine.
pub trait ReconstructionEngine {
    /// Estimate per-photo quality for enabled cameras: (label, quality).
    fn analyze_photos(&mut self, chunk: &Chunk) -> EngineResult<Vec<(String, f64)>>;

    /// Feature matching plus camera alignment; yields the sparse cloud.
    fn match_and_align(
        &mut self,
        chunk: &Chunk,
        params: &AlignmentParams,
    ) -> EngineResult<TiePointCloud>;

    fn optimize_cameras(&mut self, chunk: &Chunk, params: &OptimizeParams) -> EngineResult<()>;

    /// Current metric value per tie point, aligned with the chunk's
    /// tie-point order.
    fn estimate_tie_point_metric(
        &mut self,
        chunk: &Chunk,
        metric: FilterMetric,
    ) -> EngineResult<Vec<f64>>;

    fn build_depth_maps(
        &mut self,
        chunk: &Chunk,
        params: &DepthMapParams,
    ) -> EngineResult<DepthMapSet>;

    fn build_dense_cloud(
        &mut self,
        chunk: &Chunk,
        params: &DenseCloudParams,
    ) -> EngineResult<DenseCloud>;

    /// Label terrain points; returns the ground point count.
    fn classify_ground_points(&mut self, chunk: &Chunk, params: &GroundParams)
    -> EngineResult<u64>;

    /// Remove every dense-cloud point of the class; returns removed count.
    fn remove_point_class(&mut self, chunk: &Chunk, class: PointClass) -> EngineResult<u64>;

    fn calibrate_colors(
        &mut self,
        chunk: &Chunk,
        source: DataSource,
        color_balance: bool,
    ) -> EngineResult<()>;

    fn build_model(&mut self, chunk: &Chunk, params: &ModelParams) -> EngineResult<Mesh>;

    fn build_elevation(
        &mut self,
        chunk: &Chunk,
        params: &ElevationParams,
    ) -> EngineResult<Elevation>;

    fn build_orthomosaic(
        &mut self,
        chunk: &Chunk,
        params: &OrthomosaicParams,
    ) -> EngineResult<Orthomosaic>;

    fn export_points(&mut self, chunk: &Chunk, params: &PointExportParams) -> EngineResult<()>;

    fn export_raster(&mut self, chunk: &Chunk, params: &RasterExportParams) -> EngineResult<()>;

    fn transform_location(
        &mut self,
        location: Location,
        from: &Crs,
        to: &Crs,
    ) -> EngineResult<Location>;
}
