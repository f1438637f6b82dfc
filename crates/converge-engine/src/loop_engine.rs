//! Loop engine - drives one refinement session to a stop condition
//!
//! Control flow lives in [`crate::state_machine`]; this module executes the
//! actions it emits:
//! - `CallModel` sends the history through the retrying invoker and snapshots
//!   the raw response
//! - `EvaluateOutput` compares the response with the previous text and
//!   notifies sinks
//! - `AcceptOutput` folds the response into the history
//! - `WriteOutput` persists the final text
//!
//! A backend failure ends the run as `Failed` but still writes the last
//! evaluated output. Only local I/O errors on the final write surface as `Err`.

use crate::convergence::ConvergenceTracker;
use crate::debug_recorder::{DebugRecorder, RunSummary};
use crate::instructions::InstructionComposer;
use crate::notify::{excerpt, IterationProgress, NotificationSink};
use crate::output::{OutputMode, OutputWriter, WrittenOutputs};
use crate::sections::{SectionMap, SectionMapper};
use crate::state_machine::{transition, Action, Event, State, StopReason};
use chrono::Utc;
use converge_agent::{ModelClient, ModelResponse, RetryingInvoker, Usage};
use converge_core::fail_open::fail_open;
use converge_core::{
    AccumulationPolicy, ConvergeError, Document, IterationRecord, IterationSummary, Result,
};
use std::path::PathBuf;
use tracing::{error, info};
use uuid::Uuid;

/// Session parameters that do not come from the document
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Stop when the diff ratio drops below this value
    pub threshold: f64,
    /// Maximum iterations; `None` runs until convergence or failure
    pub limit: Option<usize>,
    /// Edit source files in place instead of writing a fallback artifact
    pub direct_edit: bool,
    /// Snapshot directory; `debug_<base>` when unset
    pub debug_dir: Option<PathBuf>,
    /// Directory for fallback artifacts
    pub output_dir: PathBuf,
    /// Characters of output included in notifications
    pub excerpt_chars: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            threshold: 0.2,
            limit: None,
            direct_edit: true,
            debug_dir: None,
            output_dir: PathBuf::from("."),
            excerpt_chars: 500,
        }
    }
}

/// Outcome of one session
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub session_id: Uuid,
    pub stop_reason: StopReason,
    /// Iterations whose output was evaluated
    pub iterations: usize,
    /// Text that was persisted
    pub final_text: String,
    pub mode: OutputMode,
    pub outputs: WrittenOutputs,
    pub history: Vec<IterationSummary>,
    pub usage: Usage,
    pub summary_path: Option<PathBuf>,
}

/// Mutable state of a running session
struct Session<'a> {
    document: &'a Document,
    instructions: String,
    mode: OutputMode,
    policy: AccumulationPolicy,
    mapper: Option<SectionMapper>,
    tracker: ConvergenceTracker,
    recorder: DebugRecorder,
    writer: OutputWriter,
    /// Text sent on the next request
    history: String,
    /// Latest evaluated output, or the input before the first one
    final_text: String,
    final_sections: Option<SectionMap>,
    /// Response received but not yet evaluated, with its snapshot path
    pending: Option<(ModelResponse, Option<PathBuf>)>,
    records: Vec<IterationSummary>,
    usage: Usage,
    outputs: WrittenOutputs,
}

/// Runs refinement sessions against one model client
pub struct LoopEngine<C: ModelClient> {
    invoker: RetryingInvoker<C>,
    config: LoopConfig,
    notifier: Option<Box<dyn NotificationSink>>,
}

impl<C: ModelClient> LoopEngine<C> {
    pub fn new(invoker: RetryingInvoker<C>, config: LoopConfig) -> Self {
        Self {
            invoker,
            config,
            notifier: None,
        }
    }

    /// Report every evaluated iteration to `sink`
    pub fn with_notifier(mut self, sink: Box<dyn NotificationSink>) -> Self {
        self.notifier = Some(sink);
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Refine `document` under `instructions` until a stop condition
    pub async fn run(&self, document: &Document, instructions: &str) -> Result<LoopResult> {
        let session_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mode = OutputMode::select(document, self.config.direct_edit);
        let policy = document.accumulation_policy();

        info!(
            "Session {} for '{}': mode={}, policy={}, threshold={}, limit={}",
            session_id,
            document.base,
            mode,
            policy,
            self.config.threshold,
            self.limit_display()
        );

        let mapper = (mode == OutputMode::MultiFile).then(|| {
            SectionMapper::new(document.paths().into_iter().map(PathBuf::from).collect())
        });
        let final_sections = mapper.as_ref().map(|m| m.map(&document.content));
        let debug_dir = self
            .config
            .debug_dir
            .clone()
            .unwrap_or_else(|| DebugRecorder::default_dir(&document.base));

        let mut session = Session {
            document,
            instructions: InstructionComposer::new(mode).compose(instructions, document),
            mode,
            policy,
            mapper,
            tracker: ConvergenceTracker::new(self.config.threshold, document.content.clone()),
            recorder: DebugRecorder::new(debug_dir, document.base.clone()),
            writer: OutputWriter::new(self.config.output_dir.clone()),
            history: document.content.clone(),
            final_text: document.content.clone(),
            final_sections,
            pending: None,
            records: Vec::new(),
            usage: Usage::default(),
            outputs: WrittenOutputs::default(),
        };

        let (mut state, mut actions) = transition(
            State::Idle,
            Event::Start {
                limit: self.config.limit,
            },
        );

        loop {
            let mut next = None;
            for action in actions {
                if let Some(event) = self.execute(action, &mut session).await? {
                    next = Some(event);
                }
            }
            match next {
                Some(event) => {
                    (state, actions) = transition(state, event);
                }
                None => break,
            }
        }

        let (reason, iterations) = match state {
            State::Terminated { reason, iterations } => (reason, iterations),
            other => {
                return Err(ConvergeError::Other(format!(
                    "Refinement loop stopped in unexpected state: {:?}",
                    other
                )))
            }
        };

        info!(
            "Session {} finished: {} after {} iteration(s)",
            session_id, reason, iterations
        );

        let summary = RunSummary {
            session_id,
            base: document.base.clone(),
            model: self.invoker.client().model_name().to_string(),
            mode: mode.to_string(),
            threshold: self.config.threshold,
            limit: self.config.limit,
            stop_reason: reason.clone(),
            iterations,
            started_at,
            finished_at: Utc::now(),
            usage: session.usage,
            history: session.records.clone(),
            outputs: session.outputs.all().cloned().collect(),
        };
        let summary_path = session.recorder.write_summary(&summary).await;

        Ok(LoopResult {
            session_id,
            stop_reason: reason,
            iterations,
            final_text: session.final_text,
            mode,
            outputs: session.outputs,
            history: session.records,
            usage: session.usage,
            summary_path,
        })
    }

    async fn execute(&self, action: Action, session: &mut Session<'_>) -> Result<Option<Event>> {
        match action {
            Action::CallModel { iteration } => {
                info!("=== Iteration {} of {} ===", iteration, self.limit_display());
                match self
                    .invoker
                    .invoke(&session.instructions, &session.history, iteration)
                    .await
                {
                    Ok(response) => {
                        if let Some(usage) = &response.usage {
                            session.usage.add(usage);
                        }
                        let snapshot = session.recorder.record(iteration, &response.text).await;
                        session.pending = Some((response, snapshot));
                        Ok(Some(Event::ResponseReceived))
                    }
                    Err(e) => {
                        error!("Iteration {} failed: {}", iteration, e);
                        Ok(Some(Event::RequestFailed {
                            error: e.to_string(),
                        }))
                    }
                }
            }

            Action::EvaluateOutput { iteration } => {
                let (response, snapshot) = session.pending.take().ok_or_else(|| {
                    ConvergeError::Other(format!("No response to evaluate for iteration {}", iteration))
                })?;

                let sections = session.mapper.as_ref().map(|m| m.map(&response.text));
                let outcome = match &sections {
                    Some(map) => session.tracker.observe(&map.concatenated()),
                    None => session.tracker.observe(&response.text),
                };

                let record = IterationRecord {
                    index: iteration,
                    raw_output: response.text,
                    diff_ratio: outcome.diff_ratio,
                    timestamp: Utc::now(),
                };
                info!(
                    "Iteration {}: diff ratio {:.6} (threshold {})",
                    iteration, record.diff_ratio, self.config.threshold
                );

                session
                    .records
                    .push(IterationSummary::from((&record, snapshot.clone())));
                self.notify(&session.document.base, &record, snapshot).await;

                session.final_text = record.raw_output;
                session.final_sections = sections;

                Ok(Some(Event::Evaluated {
                    diff_ratio: outcome.diff_ratio,
                    threshold: self.config.threshold,
                    limit: self.config.limit,
                }))
            }

            Action::AcceptOutput { .. } => {
                session
                    .policy
                    .apply(&mut session.history, &session.final_text);
                Ok(Some(Event::Advance))
            }

            Action::WriteOutput => {
                session.outputs = session
                    .writer
                    .write(
                        session.mode,
                        session.document,
                        &session.final_text,
                        session.final_sections.as_ref(),
                    )
                    .await?;
                Ok(Some(Event::OutputWritten))
            }

            Action::Log { message } => {
                info!("{}", message);
                Ok(None)
            }
        }
    }

    async fn notify(&self, base: &str, record: &IterationRecord, snapshot: Option<PathBuf>) {
        let Some(sink) = &self.notifier else {
            return;
        };

        let progress = IterationProgress {
            base: base.to_string(),
            iteration: record.index,
            diff_ratio: record.diff_ratio,
            excerpt: excerpt(&record.raw_output, self.config.excerpt_chars),
            snapshot,
        };
        let operation = format!("notify::{}", sink.name());
        fail_open(&operation, || sink.notify(&progress)).await;
    }

    fn limit_display(&self) -> String {
        self.config
            .limit
            .map(|l| l.to_string())
            .unwrap_or_else(|| "unlimited".to_string())
    }
}
