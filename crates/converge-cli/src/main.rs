//! converge CLI - refine a document with a language model until it converges
//!
//! Usage:
//!   converge <instructions> <target>...   Refine files or directories
//!   converge --init-config                Write .converge/config.toml

use anyhow::{Context, Result};
use clap::Parser;
use converge_agent::{resolve_api_key, OpenAiClient, RetryPolicy, RetryingInvoker};
use converge_core::ConvergeConfig;
use converge_engine::{
    resolve_threshold, EmailNotifier, InputAggregator, LoopConfig, LoopEngine, LoopResult,
    StopReason,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about = "Iteratively refine a document until the output stops changing")]
struct Cli {
    /// File containing the refinement instructions
    #[arg(required_unless_present = "init_config")]
    instructions: Option<PathBuf>,

    /// Files or directories to refine
    #[arg(required_unless_present = "init_config")]
    targets: Vec<PathBuf>,

    /// Stop once the diff ratio drops below this value (0-1]
    #[arg(long)]
    threshold: Option<f64>,

    /// Threshold as a percentage; overrides --threshold
    #[arg(long, value_name = "PERCENT")]
    threshold_percent: Option<f64>,

    /// Maximum number of iterations (0 keeps the input unchanged)
    #[arg(long)]
    limit: Option<usize>,

    /// Never overwrite source files; write output_<base>.txt instead
    #[arg(long)]
    no_direct: bool,

    /// Model identifier
    #[arg(long)]
    model: Option<String>,

    /// Email a progress report to this address after each iteration
    #[arg(long, value_name = "ADDRESS")]
    email: Option<String>,

    /// Directory for per-iteration snapshots (default: debug_<base>)
    #[arg(long, value_name = "DIR")]
    debug_dir: Option<PathBuf>,

    /// Directory for fallback artifacts
    #[arg(long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Retries after the first attempt of each request
    #[arg(long)]
    max_retries: Option<u32>,

    /// Seconds to wait between attempts
    #[arg(long, value_name = "SECS")]
    retry_delay: Option<f64>,

    /// API key (defaults to the OPENAI_API_KEY environment variable)
    #[arg(long)]
    api_key: Option<String>,

    /// Comma-separated programming extensions, e.g. "py,rs,go"
    #[arg(long, value_name = "LIST")]
    extensions: Option<String>,

    /// Config file (default: .converge/config.toml if present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write a default .converge/config.toml and exit
    #[arg(long)]
    init_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Layer command-line flags over file and default settings
    fn apply_overrides(&self, config: &mut ConvergeConfig) {
        if let Some(threshold) = self.threshold {
            config.loop_settings.threshold = threshold;
        }
        if let Some(limit) = self.limit {
            config.loop_settings.limit = Some(limit);
        }
        if let Some(model) = &self.model {
            config.model.name = model.clone();
        }
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries = max_retries;
        }
        if let Some(delay) = self.retry_delay {
            config.retry.delay_secs = delay;
        }
        if let Some(list) = &self.extensions {
            config.input.set_programming_extensions(list);
        }
    }

    /// API key for the session; a zero-iteration run never calls the model
    fn api_key_for(&self, config: &ConvergeConfig) -> converge_core::Result<String> {
        if config.loop_settings.limit == Some(0) {
            return Ok(String::new());
        }
        resolve_api_key(self.api_key.as_deref(), &config.model.api_key_env)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cwd = std::env::current_dir().context("Failed to determine working directory")?;

    if cli.init_config {
        let path = ConvergeConfig::write_default(&cwd)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mut config = ConvergeConfig::load_or_default(cli.config.as_deref(), &cwd)?;
    cli.apply_overrides(&mut config);
    let threshold = resolve_threshold(config.loop_settings.threshold, cli.threshold_percent)?;
    let retry_policy = RetryPolicy::from_secs(config.retry.max_retries, config.retry.delay_secs)?;

    let instructions_path = cli
        .instructions
        .as_ref()
        .context("An instructions file is required")?;
    let instructions = tokio::fs::read_to_string(instructions_path)
        .await
        .with_context(|| format!("Failed to read instructions from {}", instructions_path.display()))?;

    let document = InputAggregator::new(&config.input)
        .aggregate(&cli.targets)
        .await?;

    let api_key = cli.api_key_for(&config)?;
    let client = OpenAiClient::new(
        api_key,
        config.model.name.clone(),
        config.model.base_url.clone(),
        Duration::from_secs(config.model.request_timeout_secs),
    )?;

    let loop_config = LoopConfig {
        threshold,
        limit: config.loop_settings.limit,
        direct_edit: !cli.no_direct,
        debug_dir: cli.debug_dir.clone(),
        output_dir: cli.output_dir.clone(),
        excerpt_chars: config.notify.excerpt_chars,
    };

    let mut engine = LoopEngine::new(RetryingInvoker::new(client, retry_policy), loop_config);
    if let Some(to) = &cli.email {
        if let Some(notifier) = EmailNotifier::from_env(to, &config.notify) {
            info!("Emailing progress to {}", to);
            engine = engine.with_notifier(Box::new(notifier));
        }
    }

    let result = engine.run(&document, &instructions).await?;
    print_summary(&result);

    Ok(())
}

fn print_summary(result: &LoopResult) {
    println!();
    match &result.stop_reason {
        StopReason::Converged => println!(
            "Converged after {} iteration(s) (final ratio {:.6})",
            result.iterations,
            result.history.last().map(|h| h.diff_ratio).unwrap_or(0.0)
        ),
        StopReason::LimitReached => {
            println!("Stopped at the iteration limit ({})", result.iterations)
        }
        StopReason::Failed(error) => println!(
            "Stopped after {} iteration(s) because of an error: {}",
            result.iterations, error
        ),
    }

    for path in &result.outputs.updated {
        println!("  updated   {}", path.display());
    }
    for path in &result.outputs.unchanged {
        println!("  unchanged {}", path.display());
    }
    if let Some(path) = &result.outputs.fallback {
        println!("  wrote     {}", path.display());
    }
    if let Some(path) = &result.summary_path {
        println!("  summary   {}", path.display());
    }
    if result.usage.input_tokens + result.usage.output_tokens > 0 {
        println!(
            "Tokens: {} in / {} out",
            result.usage.input_tokens, result.usage.output_tokens
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("converge").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_positional_arguments() {
        let cli = parse(&["prompt.txt", "a.rs", "b.rs"]);
        assert_eq!(cli.instructions, Some(PathBuf::from("prompt.txt")));
        assert_eq!(cli.targets.len(), 2);
        assert!(!cli.no_direct);
        assert_eq!(cli.output_dir, PathBuf::from("."));
    }

    #[test]
    fn test_target_required() {
        assert!(Cli::try_parse_from(["converge", "prompt.txt"]).is_err());
        assert!(Cli::try_parse_from(["converge", "--init-config"]).is_ok());
    }

    #[test]
    fn test_overrides_beat_config() {
        let cli = parse(&[
            "p.txt",
            "doc.txt",
            "--threshold",
            "0.5",
            "--limit",
            "0",
            "--model",
            "gpt-test",
            "--max-retries",
            "1",
            "--retry-delay",
            "0.5",
            "--extensions",
            "kt,scala",
        ]);
        let mut config = ConvergeConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.loop_settings.threshold, 0.5);
        assert_eq!(config.loop_settings.limit, Some(0));
        assert_eq!(config.model.name, "gpt-test");
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.delay_secs, 0.5);
        assert_eq!(config.input.programming_extensions, vec![".kt", ".scala"]);
    }

    #[test]
    fn test_zero_limit_needs_no_api_key() {
        let mut config = ConvergeConfig::default();
        config.model.api_key_env = "CONVERGE_TEST_KEY_NEVER_SET".to_string();

        let cli = parse(&["p.txt", "doc.txt", "--limit", "0"]);
        cli.apply_overrides(&mut config);
        assert_eq!(cli.api_key_for(&config).unwrap(), "");

        let cli = parse(&["p.txt", "doc.txt", "--limit", "2"]);
        cli.apply_overrides(&mut config);
        assert!(cli.api_key_for(&config).is_err());

        let cli = parse(&["p.txt", "doc.txt", "--api-key", "sk-test"]);
        let config = ConvergeConfig::default();
        assert_eq!(cli.api_key_for(&config).unwrap(), "sk-test");
    }

    #[test]
    fn test_threshold_percent_wins() {
        let cli = parse(&["p.txt", "doc.txt", "--threshold", "0.9", "--threshold-percent", "5"]);
        let mut config = ConvergeConfig::default();
        cli.apply_overrides(&mut config);
        let threshold = resolve_threshold(config.loop_settings.threshold, cli.threshold_percent).unwrap();
        assert_eq!(threshold, 0.05);
    }
}
