//! Idempotent, resumable workflow controller for drone photogrammetry.
//!
//! The controller drives an external reconstruction engine through the
//! alignment, reconstruction and export stages of an orthomosaic project,
//! checkpointing persisted state after every stage so any run can be
//! aborted and resumed. Each invocation selects one run mode per chunk:
//! cleanup (quarantine disabled photos), align (match photos, then halt
//! for control-point placement) or process (everything else plus export).
pub mod config;
pub mod console;
pub mod controller;
pub mod engine;
pub mod error;
pub mod export;
pub mod project;
pub mod quarantine;
pub mod refine;
pub mod stage;
