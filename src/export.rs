/// Idempotent artifact export: point cloud, orthomosaic raster and the
/// web-viewer package. Exports are never overwritten; a pre-existing file
/// is reported and left untouched so a long-running export can never be
/// clobbered by a re-run.
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command;

use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::config::WorkflowConfig;
use crate::console::banner;
use crate::engine::{PointExportParams, RasterExportParams, ReconstructionEngine};
use crate::error::{Result, WorkflowError};
use crate::project::Chunk;

/// Description string embedded in every exported raster.
pub const RASTER_DESCRIPTION: &str = "https://seusite.com.br";
/// Server-side directory the deploy instructions unpack into.
const DEPLOY_ROOT: &str = "/var/www/html/otherapps/pointcloud";
/// Working directory the web converter renders into before compression.
const WWW_DIR: &str = "www";

/// Resolve the export folder: explicit override first, then a sibling of
/// the project folder, then a grandparent sibling, created when absent.
pub fn resolve_export_dir(project_dir: &Path, config: &WorkflowConfig) -> Result<PathBuf> {
    if let Some(dir) = &config.export_dir_override {
        if dir.exists() {
            return Ok(dir.clone());
        }
        return Err(WorkflowError::ExportDirUnavailable { path: dir.clone() });
    }

    let sibling = project_dir.join(&config.export_dir_name);
    if sibling.exists() {
        return Ok(sibling);
    }
    if let Some(grandparent) = project_dir.parent() {
        let grandparent_sibling = grandparent.join(&config.export_dir_name);
        if !grandparent_sibling.exists() {
            fs::create_dir_all(&grandparent_sibling)?;
        }
        return Ok(grandparent_sibling);
    }
    fs::create_dir_all(&sibling)?;
    Ok(sibling)
}

/// Exports actually performed this run; empty means everything already
/// existed.
#[derive(Debug, Clone, Default)]
pub struct ExportSummary {
    pub point_cloud: Option<PathBuf>,
    pub raster: Option<PathBuf>,
    pub web_package: Option<PathBuf>,
}

impl ExportSummary {
    pub fn any(&self) -> bool {
        self.point_cloud.is_some() || self.raster.is_some() || self.web_package.is_some()
    }
}

pub struct ExportManager {
    export_dir: PathBuf,
    project_stem: String,
}

impl ExportManager {
    pub fn new(export_dir: &Path, project_stem: &str) -> Self {
        Self {
            export_dir: export_dir.to_path_buf(),
            project_stem: project_stem.to_string(),
        }
    }

    fn artifact_path(&self, suffix: &str) -> PathBuf {
        self.export_dir
            .join(format!("{}{suffix}", self.project_stem))
    }

    /// Run all three exports, skipping whatever already exists, and emit
    /// one final summary banner when anything was produced.
    pub fn run(
        &self,
        engine: &mut dyn ReconstructionEngine,
        chunk: &Chunk,
        converter_exe: &Path,
    ) -> Result<ExportSummary> {
        let mut summary = ExportSummary::default();

        let las_path = self.artifact_path(".las");
        if las_path.exists() {
            banner(&format!(
                "POINT CLOUD NOT EXPORTED.\nA FILE ALREADY EXISTS AT {}\nDELETE IT AND RUN THE WORKFLOW AGAIN",
                las_path.display()
            ));
        } else {
            banner(&format!("EXPORTING POINT CLOUD TO\n{}", las_path.display()));
            engine.export_points(
                chunk,
                &PointExportParams {
                    path: las_path.clone(),
                    save_colors: true,
                },
            )?;
            self.inspect_point_cloud(&las_path);
            summary.point_cloud = Some(las_path.clone());
        }

        let tif_path = self.artifact_path(".tif");
        if tif_path.exists() {
            banner(&format!(
                "ORTHOMOSAIC NOT EXPORTED.\nA FILE ALREADY EXISTS AT {}\nDELETE IT AND RUN THE WORKFLOW AGAIN",
                tif_path.display()
            ));
        } else {
            banner(&format!("EXPORTING ORTHOMOSAIC TO\n{}", tif_path.display()));
            engine.export_raster(
                chunk,
                &RasterExportParams {
                    path: tif_path.clone(),
                    jpeg_quality: 80,
                    tiled: true,
                    overviews: true,
                    alpha: false,
                    white_background: false,
                    description: RASTER_DESCRIPTION.to_string(),
                },
            )?;
            summary.raster = Some(tif_path);
        }

        let zip_path = self.artifact_path("_web.zip");
        if zip_path.exists() {
            banner(&format!(
                "WEB APPLICATION NOT GENERATED.\nA FILE ALREADY EXISTS AT {}\nDELETE IT AND RUN THE WORKFLOW AGAIN",
                zip_path.display()
            ));
        } else if !converter_exe.exists() {
            banner(&format!(
                "WEB APPLICATION NOT GENERATED.\nTHE EXECUTABLE {} WAS NOT FOUND",
                converter_exe.display()
            ));
        } else {
            banner(&format!("GENERATING WEB PAGE AT\n{}", zip_path.display()));
            let www_dir = self.export_dir.join(WWW_DIR);
            self.run_converter(converter_exe, &las_path, &www_dir)?;
            zip_directory(&www_dir, &zip_path)?;
            fs::remove_dir_all(&www_dir)?;
            self.write_deploy_instructions(&zip_path)?;
            summary.web_package = Some(zip_path);
        }

        if summary.any() {
            let mut message = format!(
                "PROCESSING FINISHED!\nTHE EXPORTED ITEMS ARE IN\n{}",
                self.export_dir.display()
            );
            if summary.web_package.is_some() {
                message.push_str("\n\n");
                message.push_str(&self.deploy_instructions());
            }
            banner(&message);
        }
        Ok(summary)
    }

    /// Drive the external point-cloud-to-web converter over the exported
    /// point cloud. A non-zero exit aborts the run: the partially rendered
    /// output directory is not a valid package.
    fn run_converter(&self, exe: &Path, las_path: &Path, www_dir: &Path) -> Result<()> {
        let output = Command::new(exe)
            .arg(las_path)
            .arg("-o")
            .arg(www_dir)
            .arg("--generate-page")
            .arg("index")
            .output()?;
        if !output.status.success() {
            return Err(WorkflowError::WebConverter {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    fn deploy_instructions(&self) -> String {
        let zip_name = format!("{}_web.zip", self.project_stem);
        format!(
            "Instrucoes para deploy da aplicacao web:\n\n\
             cd {DEPLOY_ROOT}\n\
             unzip -d {stem} {zip_name}\n\
             chown -R www-data:www-data {DEPLOY_ROOT}/{stem}\n\n\
             rm {zip_name}\n\
             Endereco: {RASTER_DESCRIPTION}/pointcloud/{stem}\n",
            stem = self.project_stem,
        )
    }

    /// Companion text file telling the operator how to publish the package.
    fn write_deploy_instructions(&self, zip_path: &Path) -> Result<()> {
        let txt_path = self.artifact_path("_web_instrucoes_deploy.txt");
        fs::write(&txt_path, self.deploy_instructions())?;
        println!(
            "deploy instructions for {} written to {}",
            zip_path.display(),
            txt_path.display()
        );
        Ok(())
    }

    /// Read back the exported point cloud header for the console log.
    /// Purely diagnostic; an unreadable file is reported, never fatal.
    fn inspect_point_cloud(&self, path: &Path) {
        let reader = match File::open(path) {
            Ok(file) => las::Reader::new(BufReader::new(file)),
            Err(err) => {
                println!("  could not open {}: {err}", path.display());
                return;
            }
        };
        match reader {
            Ok(reader) => {
                let header = reader.header();
                println!(
                    "  exported LAS {}.{} with {} points",
                    header.version().major,
                    header.version().minor,
                    header.number_of_points()
                );
            }
            Err(err) => println!("  could not inspect {}: {err}", path.display()),
        }
    }
}

/// Compress a directory tree into an archive, preserving relative paths.
fn zip_directory(dir: &Path, zip_path: &Path) -> Result<()> {
    let file = File::create(zip_path)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        writer.start_file(relative.to_string_lossy().into_owned(), options)?;
        let mut source = File::open(entry.path())?;
        io::copy(&mut source, &mut writer)?;
    }
    writer.finish()?;
    Ok(())
}
