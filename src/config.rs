/// Operator-editable workflow configuration.
///
/// Every knob the operator used to edit at the top of the legacy script
/// lives here as an immutable struct handed to the controller at
/// construction. A `workflow.json` sibling of the project file overrides
/// the defaults; absent fields keep their default value.
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Depth-map filtering strength applied by the host engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    NoFiltering,
    Mild,
    Moderate,
    Aggressive,
}

/// Orthomosaic blending strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendingMode {
    Disabled,
    Average,
    Min,
    Max,
    Mosaic,
}

/// Mesh surface model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceType {
    Arbitrary,
    HeightField,
}

/// Source product an engine operation reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    TiePoints,
    DenseCloud,
    DepthMaps,
    Elevation,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Host reconstruction binary driven one subprocess per stage.
    pub engine_exe: PathBuf,
    /// Name of the export folder searched for next to the project folder.
    pub export_dir_name: String,
    /// Full export path override; leave unset to let the workflow resolve it.
    pub export_dir_override: Option<PathBuf>,
    /// Point-cloud-to-web-viewer converter executable.
    pub web_converter_exe: PathBuf,

    /// Disable cameras whose estimated quality falls below the criteria.
    pub quality_filter: bool,
    pub quality_criteria: f64,

    /// Alignment image downscale: 0=highest 1=high 2=medium 4=low 8=lowest.
    pub alignment_downscale: u32,
    pub keypoint_limit: u32,
    pub tiepoint_limit: u32,

    /// Depth map downscale: 1=ultra 2=high 4=medium 8=low 16=lowest. This
    /// also sets the dense cloud resolution.
    pub depth_map_downscale: u32,
    pub depth_map_filter: FilterMode,
    /// Reduce when depth-map processing takes too long (host default 100).
    pub max_neighbors: u32,

    pub classify_ground: bool,
    /// Slopes steeper than this angle (degrees) are never ground.
    pub ground_max_angle: f64,
    /// Cell size in meters; too small and rooftops classify as ground.
    pub ground_cell_size: f64,
    /// Maximum distance in meters evaluated during classification.
    pub ground_max_distance: f64,

    pub blending_mode: BlendingMode,
    /// Color correction requires a mesh (build_mesh = true).
    pub color_correction: bool,
    pub color_balance: bool,

    pub build_mesh: bool,
    pub mesh_surface: SurfaceType,
    pub mesh_source: DataSource,

    /// 1.0 = same resolution as the dense cloud (very slow); 2 or 4 is
    /// usually enough.
    pub dem_downscale: f64,
    /// Build a second elevation model restricted to ground points, on a
    /// duplicated chunk.
    pub ground_dem: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            engine_exe: PathBuf::from("photogrammetry-engine"),
            export_dir_name: "saida".to_string(),
            export_dir_override: None,
            web_converter_exe: PathBuf::from("/usr/local/bin/PotreeConverter"),
            quality_filter: false,
            quality_criteria: 0.7,
            alignment_downscale: 1,
            keypoint_limit: 40_000,
            tiepoint_limit: 4_000,
            depth_map_downscale: 2,
            depth_map_filter: FilterMode::Mild,
            max_neighbors: 30,
            classify_ground: false,
            ground_max_angle: 10.0,
            ground_cell_size: 20.0,
            ground_max_distance: 1.0,
            blending_mode: BlendingMode::Mosaic,
            color_correction: false,
            color_balance: false,
            build_mesh: false,
            mesh_surface: SurfaceType::HeightField,
            mesh_source: DataSource::DepthMaps,
            dem_downscale: 2.0,
            ground_dem: false,
        }
    }
}

impl WorkflowConfig {
    pub const FILE_NAME: &'static str = "workflow.json";

    /// Load the configuration sitting next to the project file, falling
    /// back to defaults when none exists.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(Self::FILE_NAME);
        if path.exists() {
            let text = fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&text)?)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_the_legacy_constants() {
        let config = WorkflowConfig::default();
        assert_eq!(config.export_dir_name, "saida");
        assert_eq!(config.alignment_downscale, 1);
        assert_eq!(config.keypoint_limit, 40_000);
        assert_eq!(config.tiepoint_limit, 4_000);
        assert_eq!(config.depth_map_downscale, 2);
        assert_eq!(config.depth_map_filter, FilterMode::Mild);
        assert_eq!(config.max_neighbors, 30);
        assert!(!config.quality_filter);
        assert!(!config.classify_ground);
        assert!(!config.build_mesh);
        assert!(!config.ground_dem);
        assert_eq!(config.dem_downscale, 2.0);
        assert_eq!(config.blending_mode, BlendingMode::Mosaic);
    }

    #[test]
    fn partial_file_keeps_defaults_for_absent_fields() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(WorkflowConfig::FILE_NAME),
            r#"{"classify_ground": true, "dem_downscale": 4.0}"#,
        )
        .unwrap();

        let config = WorkflowConfig::load_or_default(dir.path()).unwrap();
        assert!(config.classify_ground);
        assert_eq!(config.dem_downscale, 4.0);
        assert_eq!(config.keypoint_limit, 40_000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkflowConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.quality_criteria, 0.7);
    }
}
