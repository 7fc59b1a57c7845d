//! The task state machine: which status may follow which.

use crate::errors::PipelineError;
use crate::models::TaskStatus;

pub fn allowed_transitions(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;
    match from {
        Created => &[BlueprintRunning, Failed],
        BlueprintRunning => &[BlueprintDone, Failed],
        BlueprintDone => &[CodeGenRunning, Failed],
        // TestDone: CodeGen declined to improve during the retry loop.
        CodeGenRunning => &[CodeGenDone, TestDone, Failed],
        CodeGenDone => &[TestRunning, Failed],
        TestRunning => &[TestDone, CodeGenRunning, Failed],
        TestDone => &[ReportRunning, Failed],
        ReportRunning => &[Completed, CompletedWithIssues, Failed],
        Completed | CompletedWithIssues | Failed => &[],
    }
}

pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), PipelineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(PipelineError::IllegalTransition { from, to })
    }
}
