/// Pipeline stages, the persisted completion ledger, and the precondition
/// oracle the controller consults before running anything.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::WorkflowConfig;

/// One expensive, order-dependent pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Alignment,
    DepthMaps,
    DenseCloud,
    GroundClassification,
    Mesh,
    Elevation,
    GroundElevation,
    Orthomosaic,
}

impl Stage {
    /// Strict linear order of the full-process mode. Alignment is not
    /// listed: it belongs to its own run mode.
    pub const PROCESS_ORDER: [Stage; 7] = [
        Stage::DepthMaps,
        Stage::DenseCloud,
        Stage::GroundClassification,
        Stage::Mesh,
        Stage::Elevation,
        Stage::GroundElevation,
        Stage::Orthomosaic,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Alignment => "alignment",
            Stage::DepthMaps => "depth maps",
            Stage::DenseCloud => "dense cloud",
            Stage::GroundClassification => "ground classification",
            Stage::Mesh => "mesh",
            Stage::Elevation => "elevation model",
            Stage::GroundElevation => "ground-only elevation model",
            Stage::Orthomosaic => "orthomosaic",
        }
    }
}

/// Explicit record of completed stages, persisted with the chunk. The
/// controller is the only writer; completion is never un-marked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageLedger {
    completed: BTreeSet<Stage>,
}

impl StageLedger {
    pub fn mark(&mut self, stage: Stage) {
        self.completed.insert(stage);
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        self.completed.contains(&stage)
    }
}

/// Pure read over the ledger and configuration: decides whether a stage
/// still has to run. Re-evaluated on every controller pass, no caching.
pub struct StageOracle<'a> {
    ledger: &'a StageLedger,
    config: &'a WorkflowConfig,
}

impl<'a> StageOracle<'a> {
    pub fn new(ledger: &'a StageLedger, config: &'a WorkflowConfig) -> Self {
        Self { ledger, config }
    }

    /// Whether the configuration enables this stage at all.
    pub fn applies(&self, stage: Stage) -> bool {
        match stage {
            Stage::GroundClassification => self.config.classify_ground,
            Stage::Mesh => self.config.build_mesh,
            Stage::GroundElevation => self.config.ground_dem,
            _ => true,
        }
    }

    /// True when the stage is enabled and its output is not recorded yet.
    pub fn should_run(&self, stage: Stage) -> bool {
        self.applies(stage) && !self.ledger.is_complete(stage)
    }

    /// The next incomplete stage of the full-process order, if any.
    pub fn next_incomplete(&self) -> Option<Stage> {
        Stage::PROCESS_ORDER
            .into_iter()
            .find(|stage| self.should_run(*stage))
    }
}
