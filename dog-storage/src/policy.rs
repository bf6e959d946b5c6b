use tracing::debug;

use crate::StorageError;

/// Decision returned by a resume policy after a stream fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    Continue,
    Stop,
}

/// Decides whether a broken stream should be reopened.
///
/// Policies are consulted synchronously and own their counters; one policy
/// instance belongs to exactly one reader.
pub trait ResumePolicy: Send {
    /// A stream (re)started successfully
    fn on_start_success(&mut self);

    /// A stream failed with `error`
    fn on_finish(&mut self, error: &StorageError) -> ResumeAction;
}

/// Resume transient failures until `maximum_resumes` have been used up
#[derive(Debug, Clone)]
pub struct LimitedErrorCountResumePolicy {
    maximum_resumes: u32,
    error_count: u32,
}

impl LimitedErrorCountResumePolicy {
    pub fn new(maximum_resumes: u32) -> Self {
        Self {
            maximum_resumes,
            error_count: 0,
        }
    }
}

impl ResumePolicy for LimitedErrorCountResumePolicy {
    fn on_start_success(&mut self) {}

    fn on_finish(&mut self, error: &StorageError) -> ResumeAction {
        if !error.is_transient() {
            return ResumeAction::Stop;
        }
        self.error_count += 1;
        if self.error_count > self.maximum_resumes {
            debug!(
                "Resume budget of {} exhausted: {}",
                self.maximum_resumes, error
            );
            return ResumeAction::Stop;
        }
        ResumeAction::Continue
    }
}

/// Resume once after each successful start, stop on two failures in a row
#[derive(Debug, Clone, Default)]
pub struct StopOnConsecutiveErrorsResumePolicy {
    next_action: Option<ResumeAction>,
}

impl StopOnConsecutiveErrorsResumePolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResumePolicy for StopOnConsecutiveErrorsResumePolicy {
    fn on_start_success(&mut self) {
        self.next_action = Some(ResumeAction::Continue);
    }

    fn on_finish(&mut self, error: &StorageError) -> ResumeAction {
        if !error.is_transient() {
            return ResumeAction::Stop;
        }
        let action = self.next_action.unwrap_or(ResumeAction::Continue);
        self.next_action = Some(ResumeAction::Stop);
        action
    }
}
