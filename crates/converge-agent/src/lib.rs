//! # converge-agent
//!
//! Model access for the converge refinement loop.
//!
//! - [`ModelClient`]: one refinement request, no retries, transient vs fatal errors
//! - [`OpenAiClient`]: the Responses API implementation
//! - [`RetryingInvoker`]: bounded retries with a fixed delay and progress ticks
//!
//! Every call is stateless. The loop re-sends the accumulated history text on
//! each iteration, so nothing is kept between requests.

mod auth;
mod client;
mod retry;
mod types;

pub use auth::resolve_api_key;
pub use client::{ModelClient, OpenAiClient};
pub use retry::{token_len, RetryPolicy, RetryingInvoker};
pub use types::*;
