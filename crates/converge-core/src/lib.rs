//! # converge-core
//!
//! Core types for converge, a convergence-driven refinement loop.
//!
//! converge sends a document to a generative model, feeds the answer back in,
//! and keeps going until two consecutive outputs barely differ. This crate
//! holds what every other crate agrees on:
//!
//! - The unified error type and its transient/fatal split
//! - The optional TOML configuration file
//! - Fail-open helpers for ancillary work (snapshots, notifications)
//! - The data model: documents, iteration records, file sections

mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::{
    ConvergeConfig, InputSettings, LoopSettings, ModelSettings, NotifySettings, RetrySettings,
};
pub use error::{ConvergeError, Result};
pub use types::*;
