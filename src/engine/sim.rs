/// Scriptable in-memory engine double. Records the operation sequence and
/// produces deterministic results so controller, refinement and export
/// behavior can be tested without the real host.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;

use super::{
    AlignmentParams, DenseCloudParams, DepthMapParams, ElevationParams, EngineError, EngineResult,
    FilterMetric, GroundParams, ModelParams, OptimizeParams, OrthomosaicParams, PointClass,
    PointExportParams, RasterExportParams, ReconstructionEngine,
};
use crate::config::DataSource;
use crate::project::{
    Chunk, Crs, DenseCloud, DepthMapSet, Elevation, Location, Mesh, Orthomosaic, TiePoint,
    TiePointCloud,
};

pub struct SimEngine {
    /// Operation names in invocation order.
    pub calls: Vec<String>,
    /// Operations that fail with `EngineError::Failed`.
    pub fail_ops: HashSet<&'static str>,
    /// Parameter names the simulated host rejects ("projection",
    /// "depth_maps_source").
    pub unsupported_params: HashSet<&'static str>,
    /// Per-camera quality estimates; unknown labels report 1.0.
    pub quality: HashMap<String, f64>,
    /// Tie points produced by alignment.
    pub tie_point_count: u32,
    /// Enabled camera labels build_depth_maps leaves uncovered.
    pub depth_map_gaps: BTreeSet<String>,
    pub dense_resolution: f64,
    /// Current metric value per tie-point id.
    pub metric_values: HashMap<u32, f64>,
    /// Factor applied to every metric value by optimize_cameras.
    pub optimize_decay: f64,
}

impl Default for SimEngine {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            fail_ops: HashSet::new(),
            unsupported_params: HashSet::new(),
            quality: HashMap::new(),
            tie_point_count: 100,
            depth_map_gaps: BTreeSet::new(),
            dense_resolution: 0.05,
            metric_values: HashMap::new(),
            optimize_decay: 1.0,
        }
    }
}

impl SimEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls.iter().filter(|call| *call == operation).count()
    }

    fn record(&mut self, operation: &str) -> EngineResult<()> {
        self.calls.push(operation.to_string());
        if self.fail_ops.contains(operation) {
            return Err(EngineError::Failed {
                operation: operation.to_string(),
                message: "simulated failure".to_string(),
            });
        }
        Ok(())
    }

    fn rejects(&self, parameter: &'static str) -> EngineResult<()> {
        if self.unsupported_params.contains(parameter) {
            return Err(EngineError::UnsupportedParameter {
                parameter: parameter.to_string(),
            });
        }
        Ok(())
    }
}

impl ReconstructionEngine for SimEngine {
    fn analyze_photos(&mut self, chunk: &Chunk) -> EngineResult<Vec<(String, f64)>> {
        self.record("analyze_photos")?;
        Ok(chunk
            .cameras
            .iter()
            .filter(|camera| camera.enabled)
            .map(|camera| {
                let quality = self.quality.get(&camera.label).copied().unwrap_or(1.0);
                (camera.label.clone(), quality)
            })
            .collect())
    }

    fn match_and_align(
        &mut self,
        _chunk: &Chunk,
        _params: &AlignmentParams,
    ) -> EngineResult<TiePointCloud> {
        self.record("match_and_align")?;
        Ok(TiePointCloud {
            points: (0..self.tie_point_count).map(|id| TiePoint { id }).collect(),
        })
    }

    fn optimize_cameras(&mut self, _chunk: &Chunk, params: &OptimizeParams) -> EngineResult<()> {
        self.record(if params.fit_extended {
            "optimize_cameras_full"
        } else {
            "optimize_cameras"
        })?;
        for value in self.metric_values.values_mut() {
            *value *= self.optimize_decay;
        }
        Ok(())
    }

    fn estimate_tie_point_metric(
        &mut self,
        chunk: &Chunk,
        _metric: FilterMetric,
    ) -> EngineResult<Vec<f64>> {
        self.record("estimate_metric")?;
        Ok(chunk
            .tie_points
            .as_ref()
            .map(|tie_points| {
                tie_points
                    .points
                    .iter()
                    .map(|point| self.metric_values.get(&point.id).copied().unwrap_or(0.0))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn build_depth_maps(
        &mut self,
        chunk: &Chunk,
        params: &DepthMapParams,
    ) -> EngineResult<DepthMapSet> {
        self.record("build_depth_maps")?;
        Ok(DepthMapSet {
            downscale: params.downscale,
            cameras: chunk
                .cameras
                .iter()
                .filter(|camera| camera.enabled && !self.depth_map_gaps.contains(&camera.label))
                .map(|camera| camera.label.clone())
                .collect(),
        })
    }

    fn build_dense_cloud(
        &mut self,
        _chunk: &Chunk,
        _params: &DenseCloudParams,
    ) -> EngineResult<DenseCloud> {
        self.record("build_dense_cloud")?;
        Ok(DenseCloud {
            resolution: self.dense_resolution,
            point_count: 1_000_000,
            ground_classified: false,
        })
    }

    fn classify_ground_points(
        &mut self,
        _chunk: &Chunk,
        _params: &GroundParams,
    ) -> EngineResult<u64> {
        self.record("classify_ground")?;
        Ok(250_000)
    }

    fn remove_point_class(&mut self, _chunk: &Chunk, _class: PointClass) -> EngineResult<u64> {
        self.record("remove_class")?;
        Ok(1_000)
    }

    fn calibrate_colors(
        &mut self,
        _chunk: &Chunk,
        _source: DataSource,
        _color_balance: bool,
    ) -> EngineResult<()> {
        self.record("calibrate_colors")
    }

    fn build_model(&mut self, _chunk: &Chunk, params: &ModelParams) -> EngineResult<Mesh> {
        self.record("build_model")?;
        if params.source == DataSource::DepthMaps {
            self.rejects("depth_maps_source")?;
        }
        Ok(Mesh {
            surface: params.surface,
            source: params.source,
        })
    }

    fn build_elevation(
        &mut self,
        _chunk: &Chunk,
        params: &ElevationParams,
    ) -> EngineResult<Elevation> {
        self.record("build_elevation")?;
        if params.projected {
            self.rejects("projection")?;
        }
        Ok(Elevation {
            source: params.source,
            resolution: params.resolution,
            ground_only: params.ground_only,
        })
    }

    fn build_orthomosaic(
        &mut self,
        _chunk: &Chunk,
        params: &OrthomosaicParams,
    ) -> EngineResult<Orthomosaic> {
        self.record("build_orthomosaic")?;
        if params.projected {
            self.rejects("projection")?;
        }
        Ok(Orthomosaic {
            blending: params.blending,
        })
    }

    fn export_points(&mut self, _chunk: &Chunk, params: &PointExportParams) -> EngineResult<()> {
        self.record("export_points")?;
        fs::write(&params.path, b"simulated point cloud")?;
        Ok(())
    }

    fn export_raster(&mut self, _chunk: &Chunk, params: &RasterExportParams) -> EngineResult<()> {
        self.record("export_raster")?;
        fs::write(&params.path, b"simulated raster")?;
        Ok(())
    }

    fn transform_location(
        &mut self,
        location: Location,
        _from: &Crs,
        _to: &Crs,
    ) -> EngineResult<Location> {
        self.record("transform_location")?;
        // Visible deterministic shift so tests can assert mutation.
        Ok(Location {
            x: location.x + 1000.0,
            y: location.y + 1000.0,
            z: location.z,
        })
    }
}
