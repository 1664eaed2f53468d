/// Subprocess-backed engine: one blocking host invocation per operation.
///
/// The host binary receives the operation name, the project path, the
/// chunk label and a JSON parameter blob, and prints its structured result
/// as the final stdout line. A rejection of a parameter the richer call
/// variants carry is signalled on stderr with the `unsupported parameter:`
/// prefix; everything else maps to a plain failure.
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{
    AlignmentParams, DenseCloudParams, DepthMapParams, ElevationParams, EngineError, EngineResult,
    FilterMetric, GroundParams, ModelParams, OptimizeParams, OrthomosaicParams, PointClass,
    PointExportParams, RasterExportParams, ReconstructionEngine,
};
use crate::config::DataSource;
use crate::project::{
    Chunk, Crs, DenseCloud, DepthMapSet, Elevation, Location, Mesh, Orthomosaic, TiePointCloud,
};

const UNSUPPORTED_PREFIX: &str = "unsupported parameter:";

#[derive(Debug, serde::Deserialize)]
struct CountResult {
    count: u64,
}

pub struct HostEngine {
    exe: PathBuf,
    project_path: PathBuf,
}

impl HostEngine {
    pub fn new(exe: &Path, project_path: &Path) -> Self {
        Self {
            exe: exe.to_path_buf(),
            project_path: project_path.to_path_buf(),
        }
    }

    /// Run one host operation and return its raw stdout.
    fn invoke(&self, operation: &str, chunk: &str, params: Option<String>) -> EngineResult<String> {
        let mut command = Command::new(&self.exe);
        command
            .arg(operation)
            .arg("--project")
            .arg(&self.project_path)
            .arg("--chunk")
            .arg(chunk);
        if let Some(params) = params {
            command.arg("--params").arg(params);
        }

        let output = command.output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if let Some(parameter) = stderr.strip_prefix(UNSUPPORTED_PREFIX) {
                return Err(EngineError::UnsupportedParameter {
                    parameter: parameter.trim().to_string(),
                });
            }
            return Err(EngineError::Failed {
                operation: operation.to_string(),
                message: stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Parse the final non-empty stdout line as the typed result.
    fn parse_result<T: DeserializeOwned>(&self, operation: &str, stdout: &str) -> EngineResult<T> {
        let line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("");
        serde_json::from_str(line.trim()).map_err(|source| EngineError::Protocol {
            operation: operation.to_string(),
            source,
        })
    }

    fn call<P: Serialize, T: DeserializeOwned>(
        &self,
        operation: &str,
        chunk: &Chunk,
        params: &P,
    ) -> EngineResult<T> {
        let encoded = serde_json::to_string(params).map_err(|source| EngineError::Protocol {
            operation: operation.to_string(),
            source,
        })?;
        let stdout = self.invoke(operation, &chunk.label, Some(encoded))?;
        self.parse_result(operation, &stdout)
    }

    fn call_unit<P: Serialize>(&self, operation: &str, chunk: &Chunk, params: &P) -> EngineResult<()> {
        let encoded = serde_json::to_string(params).map_err(|source| EngineError::Protocol {
            operation: operation.to_string(),
            source,
        })?;
        self.invoke(operation, &chunk.label, Some(encoded))?;
        Ok(())
    }
}

impl ReconstructionEngine for HostEngine {
    fn analyze_photos(&mut self, chunk: &Chunk) -> EngineResult<Vec<(String, f64)>> {
        let stdout = self.invoke("analyze-photos", &chunk.label, None)?;
        self.parse_result("analyze-photos", &stdout)
    }

    fn match_and_align(
        &mut self,
        chunk: &Chunk,
        params: &AlignmentParams,
    ) -> EngineResult<TiePointCloud> {
        self.call("match-and-align", chunk, params)
    }

    fn optimize_cameras(&mut self, chunk: &Chunk, params: &OptimizeParams) -> EngineResult<()> {
        self.call_unit("optimize-cameras", chunk, params)
    }

    fn estimate_tie_point_metric(
        &mut self,
        chunk: &Chunk,
        metric: FilterMetric,
    ) -> EngineResult<Vec<f64>> {
        self.call("estimate-metric", chunk, &json!({ "metric": metric }))
    }

    fn build_depth_maps(
        &mut self,
        chunk: &Chunk,
        params: &DepthMapParams,
    ) -> EngineResult<DepthMapSet> {
        self.call("build-depth-maps", chunk, params)
    }

    fn build_dense_cloud(
        &mut self,
        chunk: &Chunk,
        params: &DenseCloudParams,
    ) -> EngineResult<DenseCloud> {
        self.call("build-dense-cloud", chunk, params)
    }

    fn classify_ground_points(
        &mut self,
        chunk: &Chunk,
        params: &GroundParams,
    ) -> EngineResult<u64> {
        let result: CountResult = self.call("classify-ground", chunk, params)?;
        Ok(result.count)
    }

    fn remove_point_class(&mut self, chunk: &Chunk, class: PointClass) -> EngineResult<u64> {
        let result: CountResult = self.call("remove-class", chunk, &json!({ "class": class }))?;
        Ok(result.count)
    }

    fn calibrate_colors(
        &mut self,
        chunk: &Chunk,
        source: DataSource,
        color_balance: bool,
    ) -> EngineResult<()> {
        self.call_unit(
            "calibrate-colors",
            chunk,
            &json!({ "source": source, "color_balance": color_balance }),
        )
    }

    fn build_model(&mut self, chunk: &Chunk, params: &ModelParams) -> EngineResult<Mesh> {
        self.call("build-model", chunk, params)
    }

    fn build_elevation(
        &mut self,
        chunk: &Chunk,
        params: &ElevationParams,
    ) -> EngineResult<Elevation> {
        self.call("build-elevation", chunk, params)
    }

    fn build_orthomosaic(
        &mut self,
        chunk: &Chunk,
        params: &OrthomosaicParams,
    ) -> EngineResult<Orthomosaic> {
        self.call("build-orthomosaic", chunk, params)
    }

    fn export_points(&mut self, chunk: &Chunk, params: &PointExportParams) -> EngineResult<()> {
        self.call_unit("export-points", chunk, params)
    }

    fn export_raster(&mut self, chunk: &Chunk, params: &RasterExportParams) -> EngineResult<()> {
        self.call_unit("export-raster", chunk, params)
    }

    fn transform_location(
        &mut self,
        location: Location,
        from: &Crs,
        to: &Crs,
    ) -> EngineResult<Location> {
        let params = json!({ "location": location, "from": from, "to": to })
            .to_string();
        let stdout = self.invoke("transform", "", Some(params))?;
        self.parse_result("transform", &stdout)
    }
}
