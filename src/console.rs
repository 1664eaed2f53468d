/// Console diagnostics: banner-framed activity messages and progress
/// indicators for long-running stages.
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

const FENCE: &str =
    "################################################################################";

/// Print a banner-framed activity message. This is the workflow's only
/// user-visible channel; there is no structured error output.
pub fn banner(msg: &str) {
    println!("\n{FENCE}\n{msg}\n{FENCE}");
}

/// Spinner shown while a blocking engine stage runs. Stage durations range
/// from seconds to hours, so the steady tick keeps the console alive.
pub fn stage_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Progress bar over a known number of photos.
pub fn photo_progress(len: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40.green/blue}] {pos}/{len} photos ({percent}%) {msg}")
            .unwrap()
            .progress_chars("▉▊▋▌▍▎▏ "),
    );
    pb.set_message(msg.to_string());
    pb
}
