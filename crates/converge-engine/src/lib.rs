//! # converge-engine
//!
//! The refinement loop: aggregate the input, send it to the model, compare the
//! answer with the previous text, and repeat until the texts stop changing.
//!
//! ## Components
//!
//! - **InputAggregator**: turns files and directories into one document
//! - **InstructionComposer**: adds the output-format directive to user instructions
//! - **ConvergenceTracker**: structural diff ratio between consecutive outputs
//! - **SectionMapper**: splits multi-file responses at `--- FILE:` markers
//! - **State machine**: pure `transition(state, event) -> (state, actions)`
//! - **LoopEngine**: executes the state machine's actions
//! - **DebugRecorder**: per-iteration snapshots and a run summary (fail-open)
//! - **OutputWriter**: atomic in-place edits or a fallback artifact
//! - **NotificationSink**: per-iteration progress reports (fail-open)

pub mod convergence;
pub mod debug_recorder;
pub mod input;
pub mod instructions;
pub mod loop_engine;
pub mod notify;
pub mod output;
pub mod sections;
pub mod state_machine;

pub use convergence::{diff_ratio, resolve_threshold, Convergence, ConvergenceTracker, SequenceMatcher};
pub use debug_recorder::{DebugRecorder, RunSummary};
pub use input::{base_name, InputAggregator};
pub use instructions::{InstructionComposer, SOURCE_ONLY_DIRECTIVE};
pub use loop_engine::{LoopConfig, LoopEngine, LoopResult};
pub use notify::{excerpt, EmailNotifier, IterationProgress, NotificationSink};
pub use output::{write_atomic, OutputMode, OutputWriter, WrittenOutputs};
pub use sections::{render_sections, split_sections, SectionMap, SectionMapper, SplitOutput};
pub use state_machine::{transition, Action, Event, State, StopReason};
