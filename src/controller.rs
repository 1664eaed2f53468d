/// Run-mode selection and stage sequencing. One controller pass inspects
/// the persisted state of each enabled chunk, picks exactly one mode
/// (cleanup, align or process) and checkpoints the project after every
/// completed stage, so an aborted run resumes where it stopped.
use std::path::Path;

use crate::config::{DataSource, WorkflowConfig};
use crate::console::{banner, stage_spinner};
use crate::engine::{
    AlignmentParams, DenseCloudParams, DepthMapParams, ElevationParams, EngineError, GroundParams,
    ModelParams, OptimizeParams, OrthomosaicParams, PointClass, ReconstructionEngine,
};
use crate::error::{Result, WorkflowError};
use crate::export::{ExportManager, resolve_export_dir};
use crate::project::{Chunk, Crs, DEM_SUFFIX, Elevation, Project, TARGET_CRS_NAME};
use crate::quarantine::relocate_disabled_photos;
use crate::stage::{Stage, StageOracle};

/// Coverage repair disables at most this many uncovered cameras; beyond
/// that the operator has to intervene.
const MAX_REPAIRABLE_GAPS: usize = 2;

/// Mode a chunk ended the pass in. Cleanup and alignment halt the whole
/// invocation; the operator acts and runs the workflow again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Disabled photos were quarantined; re-run to continue.
    Cleanup,
    /// Cameras were aligned; place control points, then re-run.
    Aligned,
    /// All pending stages ran and exports were evaluated.
    Processed,
}

pub struct WorkflowController<E> {
    engine: E,
    config: WorkflowConfig,
}

impl<E: ReconstructionEngine> WorkflowController<E> {
    pub fn new(engine: E, config: WorkflowConfig) -> Self {
        Self { engine, config }
    }

    /// Run one pass over every enabled chunk. Secondary DEM chunks are
    /// driven by their parent and never processed on their own.
    pub fn run(&mut self, project: &mut Project) -> Result<Vec<(String, RunOutcome)>> {
        let mut outcomes = Vec::new();
        for index in 0..project.chunks.len() {
            let chunk = &project.chunks[index];
            if !chunk.enabled || chunk.label.ends_with(DEM_SUFFIX) {
                continue;
            }
            let outcome = self.run_chunk(project, index)?;
            outcomes.push((project.chunks[index].label.clone(), outcome));
            if matches!(outcome, RunOutcome::Cleanup | RunOutcome::Aligned) {
                break;
            }
        }
        Ok(outcomes)
    }

    fn run_chunk(&mut self, project: &mut Project, index: usize) -> Result<RunOutcome> {
        banner(&format!(
            "PROCESSING CHUNK \"{}\"",
            project.chunks[index].label
        ));

        if self.convert_crs(&mut project.chunks[index])? {
            project.save()?;
        }

        if project.chunks[index].has_disabled_cameras() {
            relocate_disabled_photos(&mut project.chunks[index]);
            project.save()?;
            banner("CLEANUP FINISHED.\nRUN THE WORKFLOW AGAIN TO CONTINUE PROCESSING");
            return Ok(RunOutcome::Cleanup);
        }

        if !project.chunks[index].ledger.is_complete(Stage::Alignment) {
            self.align(project, index)?;
            return Ok(RunOutcome::Aligned);
        }

        // Resolve the export folder before the expensive stages so a bad
        // override fails immediately, not hours later.
        let export_dir = resolve_export_dir(project.dir(), &self.config)?;
        self.process(project, index)?;
        self.export(project, index, &export_dir)?;
        Ok(RunOutcome::Processed)
    }

    /// Convert every reference location to the fixed regional system.
    /// Returns whether anything changed, so the caller can checkpoint.
    fn convert_crs(&mut self, chunk: &mut Chunk) -> Result<bool> {
        if chunk.crs.is_target_or_local() {
            banner(&format!(
                "COORDINATE CONVERSION SKIPPED.\nTHE CHUNK IS ALREADY IN {TARGET_CRS_NAME} OR LOCAL COORDINATES"
            ));
            return Ok(false);
        }

        banner(&format!(
            "CONVERTING REFERENCE COORDINATES TO {TARGET_CRS_NAME}"
        ));
        let source = chunk.crs.clone();
        let target = Crs::target();
        for camera in &mut chunk.cameras {
            if let Some(reference) = camera.reference {
                camera.reference =
                    Some(self.engine.transform_location(reference, &source, &target)?);
            }
        }
        for marker in &mut chunk.markers {
            if let Some(reference) = marker.reference {
                marker.reference =
                    Some(self.engine.transform_location(reference, &source, &target)?);
            }
        }
        chunk.crs = target;
        Ok(true)
    }

    fn align(&mut self, project: &mut Project, index: usize) -> Result<()> {
        if self.config.quality_filter {
            self.filter_low_quality(&mut project.chunks[index])?;
            project.save()?;
        }

        banner("MATCHING AND ALIGNING PHOTOS");
        let chunk = &mut project.chunks[index];
        println!("aligning {} photos...", chunk.enabled_camera_count());

        let spinner = stage_spinner("matching and aligning");
        let tie_points = self
            .engine
            .match_and_align(chunk, &AlignmentParams::from_config(&self.config))?;
        spinner.finish_with_message(format!("alignment produced {} tie points", tie_points.len()));

        chunk.tie_points = Some(tie_points);
        self.engine
            .optimize_cameras(chunk, &OptimizeParams::standard())?;
        chunk.ledger.mark(Stage::Alignment);
        project.save()?;

        banner(
            "ALIGNMENT FINISHED.\nPLACE THE CONTROL POINTS, THEN RUN THE WORKFLOW AGAIN TO CONTINUE",
        );
        Ok(())
    }

    /// Disable enabled cameras whose estimated quality falls below the
    /// criteria. Quality is estimated once; cameras already carrying a
    /// value are not re-analyzed.
    fn filter_low_quality(&mut self, chunk: &mut Chunk) -> Result<()> {
        banner(&format!(
            "DISABLING PHOTOS WITH QUALITY BELOW {}",
            self.config.quality_criteria
        ));

        let needs_estimate = chunk
            .cameras
            .iter()
            .any(|camera| camera.enabled && camera.quality.is_none());
        if needs_estimate {
            let spinner = stage_spinner("estimating photo quality");
            let estimates = self.engine.analyze_photos(chunk)?;
            spinner.finish_with_message("quality estimation done");
            for (label, quality) in estimates {
                if let Some(camera) = chunk.cameras.iter_mut().find(|c| c.label == label) {
                    camera.quality = Some(quality);
                }
            }
        }

        let mut disabled = 0usize;
        for camera in &mut chunk.cameras {
            if !camera.enabled {
                continue;
            }
            let Some(quality) = camera.quality else {
                continue;
            };
            if quality < self.config.quality_criteria {
                camera.enabled = false;
                disabled += 1;
                println!("disabled {} (quality {quality:.3})", camera.label);
            }
        }
        println!("{disabled} of {} photos disabled", chunk.cameras.len());
        Ok(())
    }

    /// Full-process mode: run every pending stage in order, checkpointing
    /// after each one.
    fn process(&mut self, project: &mut Project, index: usize) -> Result<()> {
        loop {
            let next = {
                let chunk = &project.chunks[index];
                StageOracle::new(&chunk.ledger, &self.config).next_incomplete()
            };
            let Some(stage) = next else { break };

            match stage {
                Stage::DepthMaps => self.build_depth_maps(&mut project.chunks[index])?,
                Stage::DenseCloud => self.build_dense_cloud(project, index)?,
                Stage::GroundClassification => self.classify_ground(&mut project.chunks[index])?,
                Stage::Mesh => self.build_mesh(&mut project.chunks[index])?,
                Stage::Elevation => self.build_dsm(&mut project.chunks[index])?,
                Stage::GroundElevation => self.build_ground_dem(project, index)?,
                Stage::Orthomosaic => self.build_orthomosaic(&mut project.chunks[index])?,
                // Alignment has its own run mode and never appears in the
                // process order.
                Stage::Alignment => break,
            }

            project.chunks[index].ledger.mark(stage);
            project.save()?;
        }
        Ok(())
    }

    fn build_depth_maps(&mut self, chunk: &mut Chunk) -> Result<()> {
        banner("BUILDING DEPTH MAPS");
        let spinner = stage_spinner("building depth maps");
        let depth_maps = self
            .engine
            .build_depth_maps(chunk, &DepthMapParams::from_config(&self.config))?;
        spinner.finish_with_message(format!("depth maps for {} cameras", depth_maps.cameras.len()));
        chunk.depth_maps = Some(depth_maps);
        Ok(())
    }

    fn build_dense_cloud(&mut self, project: &mut Project, index: usize) -> Result<()> {
        if self.repair_depth_map_coverage(&mut project.chunks[index])? {
            project.save()?;
        }

        banner("BUILDING DENSE POINT CLOUD");
        let chunk = &mut project.chunks[index];
        let spinner = stage_spinner("building dense cloud");
        let dense_cloud = self.engine.build_dense_cloud(
            chunk,
            &DenseCloudParams {
                point_colors: true,
                max_neighbors: self.config.max_neighbors,
            },
        )?;
        spinner.finish_with_message(format!(
            "{} points at {:.4} units/px",
            dense_cloud.point_count, dense_cloud.resolution
        ));
        chunk.dense_cloud = Some(dense_cloud);
        Ok(())
    }

    /// Uncovered cameras poison dense-cloud reconstruction. Up to
    /// MAX_REPAIRABLE_GAPS of them are disabled automatically; more than
    /// that is fatal and lists the labels for the operator.
    fn repair_depth_map_coverage(&mut self, chunk: &mut Chunk) -> Result<bool> {
        let missing = chunk.cameras_missing_depth_maps();
        if missing.is_empty() {
            return Ok(false);
        }
        if missing.len() > MAX_REPAIRABLE_GAPS {
            return Err(WorkflowError::MissingDepthMaps { cameras: missing });
        }

        banner(&format!(
            "DISABLING {} PHOTOS WITHOUT A DEPTH MAP",
            missing.len()
        ));
        for camera in &mut chunk.cameras {
            if missing.contains(&camera.label) {
                camera.enabled = false;
                println!("disabled {}", camera.label);
            }
        }
        Ok(true)
    }

    fn classify_ground(&mut self, chunk: &mut Chunk) -> Result<()> {
        if chunk.dense_cloud.is_none() {
            return Err(WorkflowError::ProductMissing {
                product: "dense cloud",
            });
        }

        banner("CLASSIFYING GROUND POINTS");
        let spinner = stage_spinner("classifying ground points");
        let ground = self
            .engine
            .classify_ground_points(chunk, &GroundParams::from_config(&self.config))?;
        let removed = self.engine.remove_point_class(chunk, PointClass::LowPoint)?;
        spinner.finish_with_message(format!(
            "{ground} ground points, {removed} low points removed"
        ));

        if let Some(dense_cloud) = chunk.dense_cloud.as_mut() {
            dense_cloud.ground_classified = true;
        }
        Ok(())
    }

    fn build_mesh(&mut self, chunk: &mut Chunk) -> Result<()> {
        banner("BUILDING MESH");
        let params = ModelParams {
            surface: self.config.mesh_surface,
            source: self.config.mesh_source,
            interpolation: true,
            vertex_colors: true,
        };
        let spinner = stage_spinner("building mesh");
        let mesh = match self.engine.build_model(chunk, &params) {
            Ok(mesh) => mesh,
            Err(EngineError::UnsupportedParameter { parameter }) => {
                println!("host rejected {parameter}; rebuilding from the dense cloud");
                self.engine.build_model(
                    chunk,
                    &ModelParams {
                        source: DataSource::DenseCloud,
                        ..params
                    },
                )?
            }
            Err(err) => return Err(err.into()),
        };
        spinner.finish_with_message("mesh built");
        chunk.mesh = Some(mesh);
        Ok(())
    }

    fn build_dsm(&mut self, chunk: &mut Chunk) -> Result<()> {
        let resolution = elevation_resolution(chunk, &self.config)?;
        banner(&format!(
            "BUILDING ELEVATION MODEL AT {resolution:.4} M/PX"
        ));

        let spinner = stage_spinner("building elevation model");
        let elevation = self.build_elevation_with_fallback(
            chunk,
            ElevationParams {
                source: DataSource::DepthMaps,
                resolution,
                projected: true,
                ground_only: false,
                interpolation: true,
            },
        )?;
        spinner.finish_with_message("elevation model built");
        chunk.elevation = Some(elevation);
        Ok(())
    }

    /// Secondary DEM restricted to ground points, built on a duplicated
    /// chunk so the primary elevation model survives. The duplicate is
    /// checkpointed as soon as it exists and reused on resume.
    fn build_ground_dem(&mut self, project: &mut Project, index: usize) -> Result<()> {
        let resolution = elevation_resolution(&project.chunks[index], &self.config)?;
        let dem_label = format!("{}{DEM_SUFFIX}", project.chunks[index].label);

        let dem_index = match project.chunks.iter().position(|c| c.label == dem_label) {
            Some(existing) => existing,
            None => {
                banner(&format!(
                    "DUPLICATING CHUNK FOR THE GROUND-ONLY ELEVATION MODEL (\"{dem_label}\")"
                ));
                let duplicate = project.chunks[index].duplicate_for_ground_dem();
                project.chunks.push(duplicate);
                project.save()?;
                project.chunks.len() - 1
            }
        };

        banner(&format!(
            "BUILDING GROUND-ONLY ELEVATION MODEL AT {resolution:.4} M/PX"
        ));
        let spinner = stage_spinner("building ground-only elevation model");
        let elevation = self.build_elevation_with_fallback(
            &project.chunks[dem_index],
            ElevationParams {
                source: DataSource::DepthMaps,
                resolution,
                projected: true,
                ground_only: true,
                interpolation: true,
            },
        )?;
        spinner.finish_with_message("ground-only elevation model built");

        let dem_chunk = &mut project.chunks[dem_index];
        dem_chunk.elevation = Some(elevation);
        dem_chunk.ledger.mark(Stage::Elevation);
        Ok(())
    }

    /// First attempt carries the explicit projection; a host that rejects
    /// the parameter gets a second call without it. Any other error kind
    /// propagates.
    fn build_elevation_with_fallback(
        &mut self,
        chunk: &Chunk,
        params: ElevationParams,
    ) -> Result<Elevation> {
        match self.engine.build_elevation(chunk, &params) {
            Ok(elevation) => Ok(elevation),
            Err(EngineError::UnsupportedParameter { parameter }) => {
                println!("host rejected {parameter}; rebuilding without an explicit projection");
                Ok(self.engine.build_elevation(
                    chunk,
                    &ElevationParams {
                        projected: false,
                        ..params
                    },
                )?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The rich call carries the explicit projection and in-build color
    /// correction. A host that rejects either gets colors calibrated
    /// separately first, then the reduced call without both parameters.
    fn build_orthomosaic(&mut self, chunk: &mut Chunk) -> Result<()> {
        banner("BUILDING ORTHOMOSAIC");
        let params = OrthomosaicParams {
            blending: self.config.blending_mode,
            color_correction: self.config.color_correction,
            fill_holes: true,
            projected: true,
        };
        let spinner = stage_spinner("building orthomosaic");
        let orthomosaic = match self.engine.build_orthomosaic(chunk, &params) {
            Ok(orthomosaic) => orthomosaic,
            Err(EngineError::UnsupportedParameter { parameter }) => {
                println!("host rejected {parameter}; rebuilding with the reduced parameter set");
                if self.config.color_correction {
                    self.engine.calibrate_colors(
                        chunk,
                        DataSource::Model,
                        self.config.color_balance,
                    )?;
                }
                self.engine.build_orthomosaic(
                    chunk,
                    &OrthomosaicParams {
                        color_correction: false,
                        projected: false,
                        ..params
                    },
                )?
            }
            Err(err) => return Err(err.into()),
        };
        spinner.finish_with_message("orthomosaic built");
        chunk.orthomosaic = Some(orthomosaic);
        Ok(())
    }

    fn export(&mut self, project: &Project, index: usize, export_dir: &Path) -> Result<()> {
        let manager = ExportManager::new(export_dir, &project.stem());
        manager.run(
            &mut self.engine,
            &project.chunks[index],
            &self.config.web_converter_exe,
        )?;
        Ok(())
    }
}

/// DSM resolution derived from the dense cloud: host-reported resolution
/// scaled into meters by the chunk transform, then downscaled.
pub fn elevation_resolution(chunk: &Chunk, config: &WorkflowConfig) -> Result<f64> {
    let dense_cloud = chunk
        .dense_cloud
        .as_ref()
        .ok_or(WorkflowError::ProductMissing {
            product: "dense cloud",
        })?;
    Ok(dense_cloud.resolution * chunk.transform_scale * config.dem_downscale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::SimEngine;
    use crate::project::{Camera, Location, TiePoint, TiePointCloud};
    use std::fs;
    use std::path::Path;

    fn chunk_with_cameras(count: usize) -> Chunk {
        let mut chunk = Chunk::new("area-1");
        for index in 0..count {
            let label = format!("img_{index}");
            chunk
                .cameras
                .push(Camera::new(&label, format!("/photos/{label}.jpg")));
        }
        chunk
    }

    fn aligned_chunk(count: usize) -> Chunk {
        let mut chunk = chunk_with_cameras(count);
        chunk.ledger.mark(Stage::Alignment);
        chunk.tie_points = Some(TiePointCloud {
            points: (0..10).map(|id| TiePoint { id }).collect(),
        });
        chunk
    }

    /// Project under <root>/area/proj with a pre-created export sibling,
    /// so everything the run touches stays inside the tempdir.
    fn project_at(root: &Path, chunk: Chunk) -> Project {
        let project_dir = root.join("area").join("proj");
        fs::create_dir_all(project_dir.join("saida")).unwrap();
        Project::new(project_dir.join("survey.json"), vec![chunk])
    }

    fn controller() -> WorkflowController<SimEngine> {
        WorkflowController::new(SimEngine::new(), WorkflowConfig::default())
    }

    #[test]
    fn align_mode_runs_once_and_halts() {
        let root = tempfile::tempdir().unwrap();
        let mut project = project_at(root.path(), chunk_with_cameras(10));
        let mut controller = controller();

        let outcomes = controller.run(&mut project).unwrap();

        assert_eq!(outcomes, vec![("area-1".to_string(), RunOutcome::Aligned)]);
        assert_eq!(controller.engine.call_count("match_and_align"), 1);
        assert_eq!(controller.engine.call_count("optimize_cameras"), 1);
        assert_eq!(controller.engine.call_count("build_depth_maps"), 0);
        assert!(project.chunks[0].ledger.is_complete(Stage::Alignment));
        assert_eq!(project.chunks[0].tie_points.as_ref().unwrap().len(), 100);

        // The halt checkpointed the alignment.
        let reloaded = Project::load(&project.path).unwrap();
        assert!(reloaded.chunks[0].ledger.is_complete(Stage::Alignment));
    }

    #[test]
    fn cleanup_mode_halts_before_any_engine_work() {
        let root = tempfile::tempdir().unwrap();
        let mut chunk = chunk_with_cameras(3);
        chunk.cameras[1].enabled = false;
        let mut project = project_at(root.path(), chunk);
        let mut controller = controller();

        let outcomes = controller.run(&mut project).unwrap();

        assert_eq!(outcomes, vec![("area-1".to_string(), RunOutcome::Cleanup)]);
        assert!(controller.engine.calls.is_empty());
        // The photo file never existed, so the camera was detached anyway.
        assert_eq!(project.chunks[0].cameras.len(), 2);
    }

    #[test]
    fn full_process_builds_every_default_stage() {
        let root = tempfile::tempdir().unwrap();
        let mut chunk = aligned_chunk(5);
        chunk.transform_scale = 2.0;
        let mut project = project_at(root.path(), chunk);
        let mut controller = controller();

        let outcomes = controller.run(&mut project).unwrap();

        assert_eq!(outcomes, vec![("area-1".to_string(), RunOutcome::Processed)]);
        assert_eq!(controller.engine.call_count("build_depth_maps"), 1);
        assert_eq!(controller.engine.call_count("build_dense_cloud"), 1);
        assert_eq!(controller.engine.call_count("build_elevation"), 1);
        assert_eq!(controller.engine.call_count("build_orthomosaic"), 1);
        assert_eq!(controller.engine.call_count("classify_ground"), 0);
        assert_eq!(controller.engine.call_count("build_model"), 0);

        // 0.05 dense resolution x 2.0 transform scale x 2.0 downscale,
        // built from the depth maps.
        let elevation = project.chunks[0].elevation.as_ref().unwrap();
        assert!((elevation.resolution - 0.2).abs() < 1e-9);
        assert_eq!(elevation.source, DataSource::DepthMaps);

        let export_dir = root.path().join("area").join("proj").join("saida");
        assert!(export_dir.join("survey.las").exists());
        assert!(export_dir.join("survey.tif").exists());
    }

    #[test]
    fn second_pass_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let mut project = project_at(root.path(), aligned_chunk(5));
        let mut controller = controller();

        controller.run(&mut project).unwrap();
        let calls_after_first = controller.engine.calls.len();
        let outcomes = controller.run(&mut project).unwrap();

        assert_eq!(outcomes, vec![("area-1".to_string(), RunOutcome::Processed)]);
        assert_eq!(controller.engine.calls.len(), calls_after_first);

        // Products built on the first pass survive the second untouched.
        let chunk = &project.chunks[0];
        assert!(chunk.tie_points.is_some());
        assert!(chunk.depth_maps.is_some());
        assert!(chunk.dense_cloud.is_some());
        assert!(chunk.elevation.is_some());
        assert!(chunk.orthomosaic.is_some());
    }

    #[test]
    fn successful_rich_orthomosaic_call_skips_color_calibration() {
        let root = tempfile::tempdir().unwrap();
        let mut project = project_at(root.path(), aligned_chunk(4));
        let mut config = WorkflowConfig::default();
        config.color_correction = true;
        let mut controller = WorkflowController::new(SimEngine::new(), config);

        controller.run(&mut project).unwrap();

        // The host accepted in-build color correction, so the separate
        // calibration pass never runs.
        assert_eq!(controller.engine.call_count("calibrate_colors"), 0);
        assert_eq!(controller.engine.call_count("build_orthomosaic"), 1);
    }

    #[test]
    fn orthomosaic_fallback_calibrates_colors_before_the_reduced_call() {
        let root = tempfile::tempdir().unwrap();
        let mut project = project_at(root.path(), aligned_chunk(4));
        let mut config = WorkflowConfig::default();
        config.color_correction = true;
        let mut controller = WorkflowController::new(SimEngine::new(), config);
        controller.engine.unsupported_params.insert("projection");

        controller.run(&mut project).unwrap();

        assert_eq!(controller.engine.call_count("calibrate_colors"), 1);
        assert_eq!(controller.engine.call_count("build_orthomosaic"), 2);
        // Calibration sits between the rejected rich call and the retry.
        let calls = &controller.engine.calls;
        let position = calls
            .iter()
            .position(|call| call == "calibrate_colors")
            .unwrap();
        assert_eq!(calls[position - 1], "build_orthomosaic");
        assert_eq!(calls[position + 1], "build_orthomosaic");
        assert!(project.chunks[0].orthomosaic.is_some());
    }

    #[test]
    fn bad_export_override_fails_before_any_stage_runs() {
        let root = tempfile::tempdir().unwrap();
        let mut config = WorkflowConfig::default();
        config.export_dir_override = Some(root.path().join("nowhere"));
        let mut project = project_at(root.path(), aligned_chunk(4));
        let mut controller = WorkflowController::new(SimEngine::new(), config);

        let err = controller.run(&mut project).unwrap_err();

        assert!(matches!(err, WorkflowError::ExportDirUnavailable { .. }));
        assert!(controller.engine.calls.is_empty());
        assert!(!project.chunks[0].ledger.is_complete(Stage::DepthMaps));
    }

    #[test]
    fn up_to_two_depth_map_gaps_are_repaired() {
        let root = tempfile::tempdir().unwrap();
        let mut project = project_at(root.path(), aligned_chunk(5));
        let mut controller = controller();
        controller.engine.depth_map_gaps =
            ["img_1".to_string(), "img_3".to_string()].into_iter().collect();

        let outcomes = controller.run(&mut project).unwrap();

        assert_eq!(outcomes, vec![("area-1".to_string(), RunOutcome::Processed)]);
        let chunk = &project.chunks[0];
        assert!(!chunk.cameras[1].enabled);
        assert!(!chunk.cameras[3].enabled);
        assert_eq!(chunk.enabled_camera_count(), 3);
        assert!(chunk.dense_cloud.is_some());
    }

    #[test]
    fn three_depth_map_gaps_are_fatal_but_checkpointed() {
        let root = tempfile::tempdir().unwrap();
        let mut project = project_at(root.path(), aligned_chunk(6));
        let mut controller = controller();
        controller.engine.depth_map_gaps = ["img_0", "img_2", "img_4"]
            .into_iter()
            .map(String::from)
            .collect();

        let err = controller.run(&mut project).unwrap_err();

        match err {
            WorkflowError::MissingDepthMaps { cameras } => assert_eq!(cameras.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
        // The depth-map stage completed and survived the abort.
        let reloaded = Project::load(&project.path).unwrap();
        assert!(reloaded.chunks[0].ledger.is_complete(Stage::DepthMaps));
        assert!(!reloaded.chunks[0].ledger.is_complete(Stage::DenseCloud));
    }

    #[test]
    fn projection_rejection_falls_back_to_the_reduced_call() {
        let root = tempfile::tempdir().unwrap();
        let mut project = project_at(root.path(), aligned_chunk(4));
        let mut controller = controller();
        controller.engine.unsupported_params.insert("projection");

        let outcomes = controller.run(&mut project).unwrap();

        assert_eq!(outcomes, vec![("area-1".to_string(), RunOutcome::Processed)]);
        // Both raster products retried once without the projection.
        assert_eq!(controller.engine.call_count("build_elevation"), 2);
        assert_eq!(controller.engine.call_count("build_orthomosaic"), 2);
        assert!(project.chunks[0].elevation.is_some());
        assert!(project.chunks[0].orthomosaic.is_some());
    }

    #[test]
    fn engine_failures_other_than_unsupported_parameter_propagate() {
        let root = tempfile::tempdir().unwrap();
        let mut project = project_at(root.path(), aligned_chunk(4));
        let mut controller = controller();
        controller.engine.fail_ops.insert("build_dense_cloud");

        let err = controller.run(&mut project).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Engine(EngineError::Failed { .. })
        ));

        let reloaded = Project::load(&project.path).unwrap();
        assert!(reloaded.chunks[0].ledger.is_complete(Stage::DepthMaps));
        assert!(!reloaded.chunks[0].ledger.is_complete(Stage::DenseCloud));
    }

    #[test]
    fn resume_skips_completed_stages() {
        let root = tempfile::tempdir().unwrap();
        let mut chunk = aligned_chunk(4);
        chunk.ledger.mark(Stage::DepthMaps);
        chunk.ledger.mark(Stage::DenseCloud);
        chunk.depth_maps = Some(crate::project::DepthMapSet {
            downscale: 2,
            cameras: chunk.cameras.iter().map(|c| c.label.clone()).collect(),
        });
        chunk.dense_cloud = Some(crate::project::DenseCloud {
            resolution: 0.1,
            point_count: 500_000,
            ground_classified: false,
        });
        let mut project = project_at(root.path(), chunk);
        let mut controller = controller();

        controller.run(&mut project).unwrap();

        assert_eq!(controller.engine.call_count("build_depth_maps"), 0);
        assert_eq!(controller.engine.call_count("build_dense_cloud"), 0);
        assert_eq!(controller.engine.call_count("build_elevation"), 1);
        // 0.1 x 1.0 x 2.0.
        let elevation = project.chunks[0].elevation.as_ref().unwrap();
        assert!((elevation.resolution - 0.2).abs() < 1e-9);
    }

    #[test]
    fn quality_filter_disables_weak_photos_before_alignment() {
        let root = tempfile::tempdir().unwrap();
        let mut project = project_at(root.path(), chunk_with_cameras(5));
        let mut config = WorkflowConfig::default();
        config.quality_filter = true;
        let mut controller = WorkflowController::new(SimEngine::new(), config);
        controller
            .engine
            .quality
            .insert("img_3".to_string(), 0.4);

        let outcomes = controller.run(&mut project).unwrap();

        assert_eq!(outcomes, vec![("area-1".to_string(), RunOutcome::Aligned)]);
        assert_eq!(controller.engine.call_count("analyze_photos"), 1);
        let chunk = &project.chunks[0];
        assert!(!chunk.cameras[3].enabled);
        assert_eq!(chunk.enabled_camera_count(), 4);
        assert_eq!(chunk.cameras[0].quality, Some(1.0));
    }

    #[test]
    fn ground_stages_run_when_enabled() {
        let root = tempfile::tempdir().unwrap();
        let mut project = project_at(root.path(), aligned_chunk(4));
        let mut config = WorkflowConfig::default();
        config.classify_ground = true;
        config.build_mesh = true;
        config.ground_dem = true;
        let mut controller = WorkflowController::new(SimEngine::new(), config);
        // Host without depth-map meshing: the mesh retries from the dense
        // cloud.
        controller.engine.unsupported_params.insert("depth_maps_source");

        let outcomes = controller.run(&mut project).unwrap();

        assert_eq!(outcomes, vec![("area-1".to_string(), RunOutcome::Processed)]);
        assert_eq!(controller.engine.call_count("classify_ground"), 1);
        assert_eq!(controller.engine.call_count("remove_class"), 1);
        assert_eq!(controller.engine.call_count("build_model"), 2);
        assert_eq!(controller.engine.call_count("build_elevation"), 2);

        assert_eq!(project.chunks.len(), 2);
        let primary = &project.chunks[0];
        assert!(primary.dense_cloud.as_ref().unwrap().ground_classified);
        assert!(primary.ledger.is_complete(Stage::GroundElevation));
        assert!(primary.mesh.is_some());

        let dem = &project.chunks[1];
        assert_eq!(dem.label, "area-1_DEM");
        assert!(dem.elevation.as_ref().unwrap().ground_only);
        assert_eq!(dem.elevation.as_ref().unwrap().source, DataSource::DepthMaps);
        assert!(!primary.elevation.as_ref().unwrap().ground_only);

        // A second pass drives nothing new and never treats the DEM chunk
        // as a primary.
        let calls_after_first = controller.engine.calls.len();
        let outcomes = controller.run(&mut project).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(controller.engine.calls.len(), calls_after_first);
        assert_eq!(project.chunks.len(), 2);
    }

    #[test]
    fn foreign_crs_references_are_transformed_once() {
        let root = tempfile::tempdir().unwrap();
        let mut chunk = chunk_with_cameras(2);
        chunk.crs = Crs::Projected {
            authority: "EPSG::4326".to_string(),
            name: "WGS 84".to_string(),
        };
        for camera in &mut chunk.cameras {
            camera.reference = Some(Location {
                x: 10.0,
                y: 20.0,
                z: 30.0,
            });
        }
        chunk.markers.push(crate::project::Marker {
            label: "gcp-1".to_string(),
            reference: Some(Location {
                x: 1.0,
                y: 2.0,
                z: 3.0,
            }),
        });
        let mut project = project_at(root.path(), chunk);
        let mut controller = controller();

        controller.run(&mut project).unwrap();

        assert_eq!(controller.engine.call_count("transform_location"), 3);
        let chunk = &project.chunks[0];
        assert_eq!(chunk.crs, Crs::target());
        assert_eq!(chunk.cameras[0].reference.unwrap().x, 1010.0);
        assert_eq!(chunk.markers[0].reference.unwrap().y, 1002.0);

        // Already converted: a second pass leaves the references alone.
        controller.run(&mut project).unwrap();
        assert_eq!(controller.engine.call_count("transform_location"), 3);
    }

    #[test]
    fn dsm_resolution_requires_a_dense_cloud() {
        let chunk = Chunk::new("c");
        let err = elevation_resolution(&chunk, &WorkflowConfig::default()).unwrap_err();
        assert!(matches!(err, WorkflowError::ProductMissing { .. }));
    }
}
