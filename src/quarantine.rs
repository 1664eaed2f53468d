/// Cleanup run-mode: relocate the photos of disabled cameras into a
/// quarantine folder next to the originals and detach those cameras from
/// the chunk. Every file operation is individually guarded; one bad photo
/// never aborts the pass.
use std::fs;
use std::path::Path;

use crate::console::{banner, photo_progress};
use crate::project::{Camera, Chunk};

/// Discarded-photos folder created next to the quarantined sources.
pub const QUARANTINE_DIR: &str = "FotosDescartadas";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuarantineReport {
    /// Photos moved into the quarantine folder.
    pub moved: usize,
    /// Disabled cameras whose photo file no longer exists.
    pub missing: usize,
    /// Enabled cameras, left untouched.
    pub untouched: usize,
    /// Cameras detached from the chunk.
    pub detached: usize,
    /// Directory-creation or move failures; those cameras stay attached.
    pub errors: usize,
}

/// Move every disabled camera's photo to quarantine and detach the camera.
/// A camera whose photo cannot be moved stays attached so the file is
/// never lost track of.
pub fn relocate_disabled_photos(chunk: &mut Chunk) -> QuarantineReport {
    banner(&format!(
        "MOVING DISABLED CAMERAS OUT OF THE PROJECT, PHOTOS GO TO \"{QUARANTINE_DIR}\""
    ));
    println!("evaluating {} photos...", chunk.cameras.len());

    let pb = photo_progress(chunk.cameras.len() as u64, "relocating");
    let mut report = QuarantineReport::default();
    let mut kept: Vec<Camera> = Vec::with_capacity(chunk.cameras.len());

    for camera in chunk.cameras.drain(..) {
        if camera.enabled {
            report.untouched += 1;
            kept.push(camera);
            pb.inc(1);
            continue;
        }

        let photo = camera.photo_path.clone();
        if !photo.is_file() {
            println!("photo {} does not exist!", camera.label);
            report.missing += 1;
            report.detached += 1;
            pb.inc(1);
            continue;
        }

        let quarantine = photo.parent().unwrap_or(Path::new(".")).join(QUARANTINE_DIR);
        if !quarantine.exists() {
            match fs::create_dir_all(&quarantine) {
                Ok(()) => println!("created quarantine directory {}", quarantine.display()),
                Err(err) => {
                    // Can't create the directory, can't move the photo, so
                    // the camera must stay attached.
                    println!("ERROR creating {}: {err}", quarantine.display());
                    report.errors += 1;
                    kept.push(camera);
                    pb.inc(1);
                    continue;
                }
            }
        }

        let destination = quarantine.join(photo.file_name().unwrap_or_default());
        match fs::rename(&photo, &destination) {
            Ok(()) => {
                println!("moved {}", camera.label);
                report.moved += 1;
                report.detached += 1;
            }
            Err(err) => {
                println!("ERROR moving {}: {err}", camera.label);
                report.errors += 1;
                kept.push(camera);
            }
        }
        pb.inc(1);
    }

    chunk.cameras = kept;
    pb.finish_with_message("relocation done");

    println!(
        "done: {} photos moved, {} untouched, {} missing, {} cameras detached, {} errors",
        report.moved, report.untouched, report.missing, report.detached, report.errors
    );
    report
}
