/// Workflow entry point: load the project and its configuration, build the
/// host engine and run one controller pass.
use std::env;
use std::path::Path;

use ortho_workflow::config::WorkflowConfig;
use ortho_workflow::controller::WorkflowController;
use ortho_workflow::engine::host::HostEngine;
use ortho_workflow::project::Project;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <project.json>", args[0]);
        std::process::exit(1);
    }

    let project_path = Path::new(&args[1]);
    let mut project = Project::load(project_path)?;
    let config = WorkflowConfig::load_or_default(project.dir())?;

    let engine = HostEngine::new(&config.engine_exe, project_path);
    let mut controller = WorkflowController::new(engine, config);
    controller.run(&mut project)?;

    Ok(())
}
