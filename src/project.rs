/// Persisted project state: chunks, cameras, derived products and the
/// stage ledger. Saved as pretty JSON after every completed stage so a
/// crash or manual abort loses at most one stage's work.
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{BlendingMode, DataSource, SurfaceType};
use crate::error::Result;
use crate::stage::{Stage, StageLedger};

/// Fixed regional target system for reference coordinates.
pub const TARGET_CRS_AUTHORITY: &str = "EPSG::31983";
pub const TARGET_CRS_NAME: &str = "SIRGAS 2000 / UTM zone 23S";

/// Label suffix of the duplicated chunk carrying the ground-only DEM.
pub const DEM_SUFFIX: &str = "_DEM";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Coordinate reference system of a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Crs {
    /// Unprojected local coordinates; conversion never applies.
    Local,
    Projected { authority: String, name: String },
}

impl Crs {
    pub fn target() -> Self {
        Crs::Projected {
            authority: TARGET_CRS_AUTHORITY.to_string(),
            name: TARGET_CRS_NAME.to_string(),
        }
    }

    /// Conversion is skipped for local coordinates and for any system
    /// already carrying the target datum name.
    pub fn is_target_or_local(&self) -> bool {
        match self {
            Crs::Local => true,
            Crs::Projected { name, .. } => name.contains("SIRGAS 2000"),
        }
    }
}

/// One photo. Disabling a camera is the only accepted way to drop a bad
/// photo during processing; files move only in cleanup mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub label: String,
    pub photo_path: PathBuf,
    pub enabled: bool,
    pub quality: Option<f64>,
    pub reference: Option<Location>,
}

impl Camera {
    pub fn new(label: &str, photo_path: impl Into<PathBuf>) -> Self {
        Self {
            label: label.to_string(),
            photo_path: photo_path.into(),
            enabled: true,
            quality: None,
            reference: None,
        }
    }
}

/// Ground-control point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub label: String,
    pub reference: Option<Location>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiePoint {
    pub id: u32,
}

/// Sparse tie points produced by alignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TiePointCloud {
    pub points: Vec<TiePoint>,
}

impl TiePointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Per-camera depth maps, keyed by camera label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthMapSet {
    pub downscale: u32,
    pub cameras: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseCloud {
    /// Ground sampling resolution reported by the host, in chunk units.
    pub resolution: f64,
    pub point_count: u64,
    pub ground_classified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mesh {
    pub surface: SurfaceType,
    pub source: DataSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Elevation {
    pub source: DataSource,
    pub resolution: f64,
    /// True for the secondary DEM restricted to ground-classified points.
    pub ground_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orthomosaic {
    pub blending: BlendingMode,
}

/// One reconstruction unit. Product fields transition absent -> present
/// exactly once; the ledger is the authoritative completion record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub label: String,
    pub enabled: bool,
    pub crs: Crs,
    pub transform_scale: f64,
    pub tie_point_accuracy: f64,
    pub cameras: Vec<Camera>,
    pub markers: Vec<Marker>,
    pub tie_points: Option<TiePointCloud>,
    pub depth_maps: Option<DepthMapSet>,
    pub dense_cloud: Option<DenseCloud>,
    pub mesh: Option<Mesh>,
    pub elevation: Option<Elevation>,
    pub orthomosaic: Option<Orthomosaic>,
    pub ledger: StageLedger,
}

impl Chunk {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            enabled: true,
            crs: Crs::target(),
            transform_scale: 1.0,
            tie_point_accuracy: 1.0,
            cameras: Vec::new(),
            markers: Vec::new(),
            tie_points: None,
            depth_maps: None,
            dense_cloud: None,
            mesh: None,
            elevation: None,
            orthomosaic: None,
            ledger: StageLedger::default(),
        }
    }

    pub fn has_disabled_cameras(&self) -> bool {
        self.cameras.iter().any(|camera| !camera.enabled)
    }

    pub fn enabled_camera_count(&self) -> usize {
        self.cameras.iter().filter(|camera| camera.enabled).count()
    }

    /// Labels of enabled cameras the depth-map set does not cover. All
    /// enabled cameras count as uncovered when no set exists yet.
    pub fn cameras_missing_depth_maps(&self) -> Vec<String> {
        self.cameras
            .iter()
            .filter(|camera| camera.enabled)
            .filter(|camera| {
                self.depth_maps
                    .as_ref()
                    .is_none_or(|set| !set.cameras.contains(&camera.label))
            })
            .map(|camera| camera.label.clone())
            .collect()
    }

    /// Drop tie points by index, keeping the remaining order.
    pub fn remove_tie_points(&mut self, indices: &[usize]) {
        if let Some(tie_points) = &mut self.tie_points {
            let drop: HashSet<usize> = indices.iter().copied().collect();
            let mut index = 0usize;
            tie_points.points.retain(|_| {
                let keep = !drop.contains(&index);
                index += 1;
                keep
            });
        }
    }

    /// Duplicate for the ground-only DEM. One chunk holds one elevation
    /// product, so the secondary model is built on a copy carrying the
    /// cameras, alignment, depth maps and the classified dense cloud, but
    /// no mesh, elevation or orthomosaic.
    pub fn duplicate_for_ground_dem(&self) -> Chunk {
        let mut ledger = StageLedger::default();
        ledger.mark(Stage::Alignment);
        ledger.mark(Stage::DepthMaps);
        if self.dense_cloud.is_some() {
            ledger.mark(Stage::DenseCloud);
        }
        if self
            .dense_cloud
            .as_ref()
            .is_some_and(|dense| dense.ground_classified)
        {
            ledger.mark(Stage::GroundClassification);
        }

        Chunk {
            label: format!("{}{DEM_SUFFIX}", self.label),
            enabled: true,
            crs: self.crs.clone(),
            transform_scale: self.transform_scale,
            tie_point_accuracy: self.tie_point_accuracy,
            cameras: self.cameras.clone(),
            markers: self.markers.clone(),
            tie_points: self.tie_points.clone(),
            depth_maps: self.depth_maps.clone(),
            dense_cloud: self.dense_cloud.clone(),
            mesh: None,
            elevation: None,
            orthomosaic: None,
            ledger,
        }
    }
}

/// Root persisted object, created externally and mutated by every stage.
/// Never destroyed by the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    #[serde(skip)]
    pub path: PathBuf,
    pub chunks: Vec<Chunk>,
}

impl Project {
    pub fn new(path: impl Into<PathBuf>, chunks: Vec<Chunk>) -> Self {
        Self {
            path: path.into(),
            chunks,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut project: Project = serde_json::from_str(&text)?;
        project.path = path.to_path_buf();
        Ok(project)
    }

    /// Checkpoint: durably persist the whole project state.
    pub fn save(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(&self.path, text)?;
        Ok(())
    }

    /// Project base name, used to derive export file names.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }
}
