//! The four-phase automation pipeline.
//!
//! | Module          | Role                                                 |
//! |-----------------|------------------------------------------------------|
//! | `state`         | legal status transitions                             |
//! | `collaborators` | phase contracts and their payloads                   |
//! | `command`       | collaborators backed by shell commands               |
//! | `controller`    | drives one task from `created` to a terminal status  |
//! | `retry`         | the Test ⇄ CodeGen attempt loop                      |
//! | `runner`        | bounded concurrent execution and cancellation        |

pub mod collaborators;
pub mod command;
pub mod controller;
pub mod retry;
pub mod runner;
pub mod state;

pub use collaborators::{
    Blueprint, BlueprintCollaborator, CodeArtifact, CodeGenCollaborator, Collaborators,
    ImproveOutcome, ReportArtifact, ReportCollaborator, TestCollaborator, TestReport,
};
pub use command::{CommandCollaborator, collaborators_from_config};
pub use controller::{CANCELLED_REASON, PipelineController, PipelineSettings, TaskRequest};
pub use retry::{AcceptancePolicy, LoopOutcome};
pub use runner::PipelineRunner;
pub use state::{allowed_transitions, validate_transition};
