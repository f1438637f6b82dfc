//! Pure state machine for the refinement loop
//!
//! `transition(state, event) -> (state, actions)` with no I/O. The loop
//! engine executes the actions and feeds the resulting events back in.
//!
//! - Invalid transitions go to `Failed` and still write the output (never panic)
//! - Every path that ends a run emits `WriteOutput` exactly once
//! - `Terminated` is reached only after the output has been written

use serde::{Deserialize, Serialize};

/// Why a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// Diff ratio dropped below the threshold
    Converged,
    /// Iteration limit reached without converging
    LimitReached,
    /// Backend failure; the last evaluated output was kept
    Failed(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::LimitReached => write!(f, "iteration limit reached"),
            Self::Failed(error) => write!(f, "failed: {}", error),
        }
    }
}

/// Loop state
#[derive(Debug, Clone, PartialEq)]
pub enum State {
    /// Nothing requested yet
    Idle,
    /// Waiting on the backend for iteration `iteration`
    Requesting { iteration: usize },
    /// Response received, not yet compared
    Evaluating { iteration: usize },
    /// Output accepted, another request follows
    Continuing { iteration: usize },
    /// Stopped below the threshold; output pending
    Converged { iteration: usize, diff_ratio: f64 },
    /// Stopped at the iteration limit; output pending
    LimitReached { iterations: usize },
    /// Stopped on a backend error; output pending
    Failed { iterations: usize, error: String },
    /// Output written, run over
    Terminated { reason: StopReason, iterations: usize },
}

impl State {
    /// Iterations whose output was evaluated
    pub fn completed_iterations(&self) -> usize {
        match self {
            Self::Idle => 0,
            Self::Requesting { iteration } | Self::Evaluating { iteration } => {
                iteration.saturating_sub(1)
            }
            Self::Continuing { iteration } | Self::Converged { iteration, .. } => *iteration,
            Self::LimitReached { iterations }
            | Self::Failed { iterations, .. }
            | Self::Terminated { iterations, .. } => *iterations,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}

/// Events fed back by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Begin a run with an optional iteration cap
    Start { limit: Option<usize> },
    /// The backend returned a response
    ResponseReceived,
    /// The backend failed for good (fatal or retries exhausted)
    RequestFailed { error: String },
    /// The new output was compared with the previous text
    Evaluated {
        diff_ratio: f64,
        threshold: f64,
        limit: Option<usize>,
    },
    /// The accepted output was folded into the history
    Advance,
    /// Final output has been written
    OutputWritten,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send the current history to the backend
    CallModel { iteration: usize },
    /// Compare the received output with the previous text
    EvaluateOutput { iteration: usize },
    /// Fold the output into the history under the session's policy
    AcceptOutput { iteration: usize },
    /// Persist the final text
    WriteOutput,
    /// Log a progress message
    Log { message: String },
}

/// Pure state transition function
///
/// # Invalid Transitions
/// Any invalid transition results in a Failed state that writes the output,
/// unless the session had already terminated.
/// This function never panics.
pub fn transition(state: State, event: Event) -> (State, Vec<Action>) {
    match (state, event) {
        (State::Idle, Event::Start { limit: Some(0) }) => (
            State::LimitReached { iterations: 0 },
            vec![
                Action::Log {
                    message: "Iteration limit is 0, keeping the input unchanged".to_string(),
                },
                Action::WriteOutput,
            ],
        ),

        (State::Idle, Event::Start { .. }) => (
            State::Requesting { iteration: 1 },
            vec![Action::CallModel { iteration: 1 }],
        ),

        (State::Requesting { iteration }, Event::ResponseReceived) => (
            State::Evaluating { iteration },
            vec![Action::EvaluateOutput { iteration }],
        ),

        (State::Requesting { iteration }, Event::RequestFailed { error }) => {
            let iterations = iteration.saturating_sub(1);
            let actions = vec![
                Action::Log {
                    message: format!(
                        "Iteration {} failed, keeping output of iteration {}: {}",
                        iteration, iterations, error
                    ),
                },
                Action::WriteOutput,
            ];
            (State::Failed { iterations, error }, actions)
        }

        (
            State::Evaluating { iteration },
            Event::Evaluated {
                diff_ratio,
                threshold,
                limit,
            },
        ) => {
            if diff_ratio < threshold {
                let actions = vec![
                    Action::Log {
                        message: format!(
                            "Converged at iteration {} (ratio {:.6} < {})",
                            iteration, diff_ratio, threshold
                        ),
                    },
                    Action::WriteOutput,
                ];
                (
                    State::Converged {
                        iteration,
                        diff_ratio,
                    },
                    actions,
                )
            } else if limit.is_some_and(|l| iteration >= l) {
                let actions = vec![
                    Action::Log {
                        message: format!(
                            "Reached iteration limit {} (last ratio {:.6})",
                            iteration, diff_ratio
                        ),
                    },
                    Action::WriteOutput,
                ];
                (State::LimitReached { iterations: iteration }, actions)
            } else {
                (
                    State::Continuing { iteration },
                    vec![Action::AcceptOutput { iteration }],
                )
            }
        }

        (State::Continuing { iteration }, Event::Advance) => {
            let next = iteration + 1;
            (
                State::Requesting { iteration: next },
                vec![Action::CallModel { iteration: next }],
            )
        }

        (State::Converged { iteration, .. }, Event::OutputWritten) => (
            State::Terminated {
                reason: StopReason::Converged,
                iterations: iteration,
            },
            vec![],
        ),

        (State::LimitReached { iterations }, Event::OutputWritten) => (
            State::Terminated {
                reason: StopReason::LimitReached,
                iterations,
            },
            vec![],
        ),

        (State::Failed { iterations, error }, Event::OutputWritten) => (
            State::Terminated {
                reason: StopReason::Failed(error),
                iterations,
            },
            vec![],
        ),

        (state, event) => {
            let iterations = state.completed_iterations();
            let actions = if state.is_terminal() {
                vec![]
            } else {
                vec![Action::WriteOutput]
            };
            (
                State::Failed {
                    iterations,
                    error: format!(
                        "Invalid state transition: {:?} cannot handle event {:?}",
                        state, event
                    ),
                },
                actions,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluated(diff_ratio: f64, limit: Option<usize>) -> Event {
        Event::Evaluated {
            diff_ratio,
            threshold: 0.2,
            limit,
        }
    }

    #[test]
    fn test_converges_after_two_iterations() {
        let (state, actions) = transition(State::Idle, Event::Start { limit: None });
        assert_eq!(state, State::Requesting { iteration: 1 });
        assert_eq!(actions, vec![Action::CallModel { iteration: 1 }]);

        let (state, actions) = transition(state, Event::ResponseReceived);
        assert_eq!(actions, vec![Action::EvaluateOutput { iteration: 1 }]);

        let (state, actions) = transition(state, evaluated(0.6, None));
        assert_eq!(state, State::Continuing { iteration: 1 });
        assert_eq!(actions, vec![Action::AcceptOutput { iteration: 1 }]);

        let (state, actions) = transition(state, Event::Advance);
        assert_eq!(actions, vec![Action::CallModel { iteration: 2 }]);

        let (state, _) = transition(state, Event::ResponseReceived);
        let (state, actions) = transition(state, evaluated(0.05, None));
        assert!(matches!(state, State::Converged { iteration: 2, .. }));
        assert_eq!(actions.last(), Some(&Action::WriteOutput));

        let (state, actions) = transition(state, Event::OutputWritten);
        assert_eq!(
            state,
            State::Terminated {
                reason: StopReason::Converged,
                iterations: 2
            }
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn test_zero_limit_skips_backend() {
        let (state, actions) = transition(State::Idle, Event::Start { limit: Some(0) });
        assert_eq!(state, State::LimitReached { iterations: 0 });
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::CallModel { .. })));
        assert_eq!(actions.last(), Some(&Action::WriteOutput));
    }

    #[test]
    fn test_limit_checked_after_evaluation() {
        let state = State::Evaluating { iteration: 3 };
        let (state, actions) = transition(state, evaluated(0.9, Some(3)));
        assert_eq!(state, State::LimitReached { iterations: 3 });
        assert_eq!(actions.last(), Some(&Action::WriteOutput));

        let (state, _) = transition(State::Evaluating { iteration: 2 }, evaluated(0.9, Some(3)));
        assert_eq!(state, State::Continuing { iteration: 2 });
    }

    #[test]
    fn test_convergence_wins_over_limit() {
        let (state, _) = transition(State::Evaluating { iteration: 1 }, evaluated(0.0, Some(1)));
        assert!(matches!(state, State::Converged { iteration: 1, .. }));
    }

    #[test]
    fn test_ratio_equal_to_threshold_continues() {
        let (state, _) = transition(State::Evaluating { iteration: 1 }, evaluated(0.2, None));
        assert_eq!(state, State::Continuing { iteration: 1 });
    }

    #[test]
    fn test_request_failure_keeps_previous_iteration() {
        let (state, actions) = transition(
            State::Requesting { iteration: 3 },
            Event::RequestFailed {
                error: "Gave up after 6 attempts".to_string(),
            },
        );
        assert!(matches!(state, State::Failed { iterations: 2, .. }));
        assert_eq!(actions.last(), Some(&Action::WriteOutput));

        let (state, _) = transition(state, Event::OutputWritten);
        assert!(matches!(
            state,
            State::Terminated {
                reason: StopReason::Failed(_),
                iterations: 2
            }
        ));
    }

    #[test]
    fn test_invalid_transition_never_panics() {
        let (state, actions) = transition(State::Idle, Event::ResponseReceived);
        assert!(matches!(state, State::Failed { iterations: 0, .. }));
        assert_eq!(actions, vec![Action::WriteOutput]);

        let (state, actions) = transition(State::Continuing { iteration: 4 }, Event::OutputWritten);
        assert!(matches!(state, State::Failed { iterations: 4, .. }));
        assert_eq!(actions, vec![Action::WriteOutput]);
    }

    #[test]
    fn test_invalid_transition_still_terminates_after_write() {
        let (state, _) = transition(
            State::Evaluating { iteration: 2 },
            Event::Start { limit: None },
        );
        let (state, actions) = transition(state, Event::OutputWritten);
        assert!(actions.is_empty());
        assert!(matches!(
            state,
            State::Terminated {
                reason: StopReason::Failed(_),
                iterations: 1
            }
        ));
    }

    #[test]
    fn test_terminated_rejects_events() {
        let done = State::Terminated {
            reason: StopReason::LimitReached,
            iterations: 5,
        };
        assert!(done.is_terminal());
        let (state, actions) = transition(done, Event::Start { limit: None });
        assert!(matches!(state, State::Failed { iterations: 5, .. }));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_stop_reason_serialization() {
        let json = serde_json::to_string(&StopReason::Failed("boom".into())).unwrap();
        assert_eq!(json, r#"{"kind":"failed","detail":"boom"}"#);
        let json = serde_json::to_string(&StopReason::Converged).unwrap();
        assert_eq!(json, r#"{"kind":"converged"}"#);
    }
}
