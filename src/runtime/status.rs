use crate::{ErrorDetails, Event, EventKind};

/// High-level orchestration status derived from the latest execution's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { details: ErrorDetails },
    Cancelled { reason: String },
    TimedOut,
    /// The execution ended and its successor has not been created yet.
    ContinuedAsNew { input: String },
}

impl OrchestrationStatus {
    /// Terminal for the instance as a whole. `ContinuedAsNew` is not: a new
    /// execution follows.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Cancelled { .. }
                | OrchestrationStatus::TimedOut
        )
    }

    pub fn from_history(history: &[Event]) -> Self {
        if history.is_empty() {
            return OrchestrationStatus::NotFound;
        }
        history
            .iter()
            .rev()
            .find_map(|e| match &e.kind {
                EventKind::OrchestrationCompleted { output } => Some(OrchestrationStatus::Completed {
                    output: output.clone(),
                }),
                EventKind::OrchestrationFailed { details } => Some(OrchestrationStatus::Failed {
                    details: details.clone(),
                }),
                EventKind::OrchestrationCancelled { reason } => Some(OrchestrationStatus::Cancelled {
                    reason: reason.clone(),
                }),
                EventKind::OrchestrationTimedOut => Some(OrchestrationStatus::TimedOut),
                EventKind::OrchestrationContinuedAsNew { input } => Some(OrchestrationStatus::ContinuedAsNew {
                    input: input.clone(),
                }),
                _ => None,
            })
            .unwrap_or(OrchestrationStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_status_from_last_terminal_event() {
        assert_eq!(OrchestrationStatus::from_history(&[]), OrchestrationStatus::NotFound);
        let started = Event::new(
            1,
            None,
            1,
            EventKind::OrchestrationStarted {
                name: "O".into(),
                version: "1.0.0".into(),
                input: "".into(),
                started_at_ms: 0,
                parent: None,
                run_timeout_ms: None,
            },
        );
        let mut h = vec![started];
        assert_eq!(OrchestrationStatus::from_history(&h), OrchestrationStatus::Running);
        h.push(Event::new(2, None, 1, EventKind::OrchestrationContinuedAsNew { input: "n".into() }));
        let status = OrchestrationStatus::from_history(&h);
        assert!(!status.is_terminal());
        assert_eq!(status, OrchestrationStatus::ContinuedAsNew { input: "n".into() });
    }
}
