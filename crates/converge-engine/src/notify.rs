//! Per-iteration progress notifications
//!
//! Sinks are called after each evaluated iteration. Delivery is best-effort:
//! the engine wraps every call in `fail_open`, so a broken sink never affects
//! the run.

use async_trait::async_trait;
use converge_core::{ConvergeError, NotifySettings, Result};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// What a sink is told about one iteration
#[derive(Debug, Clone, PartialEq)]
pub struct IterationProgress {
    pub base: String,
    pub iteration: usize,
    pub diff_ratio: f64,
    /// Leading characters of the raw output
    pub excerpt: String,
    /// Debug snapshot of the raw output, if it was written
    pub snapshot: Option<PathBuf>,
}

impl IterationProgress {
    pub fn subject(&self) -> String {
        format!(
            "Iteration {} completed (ratio {:.6})",
            self.iteration, self.diff_ratio
        )
    }

    pub fn body(&self) -> String {
        let location = self
            .snapshot
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(no snapshot written)".to_string());
        format!(
            "Response saved to {}\n\nFirst {} chars:\n{}",
            location,
            self.excerpt.chars().count(),
            self.excerpt
        )
    }
}

/// First `max_chars` characters of `text`
pub fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Receives progress after each evaluated iteration
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, progress: &IterationProgress) -> Result<()>;

    /// Sink name, for logging
    fn name(&self) -> &str;
}

/// Sends one email per iteration through SMTP, using `curl` as the transport
///
/// Credentials are passed on curl's stdin as a config snippet so they never
/// appear in the process list.
#[derive(Clone)]
pub struct EmailNotifier {
    smtp_url: String,
    from: String,
    password: String,
    to: String,
}

impl std::fmt::Debug for EmailNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailNotifier")
            .field("smtp_url", &self.smtp_url)
            .field("from", &self.from)
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

impl EmailNotifier {
    pub fn new(
        smtp_url: impl Into<String>,
        from: impl Into<String>,
        password: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            smtp_url: smtp_url.into(),
            from: from.into(),
            password: password.into(),
            to: to.into(),
        }
    }

    /// Build from the sender credentials in the environment
    ///
    /// Returns `None` (with a warning) when either variable is missing, which
    /// disables email without failing the run.
    pub fn from_env(to: &str, settings: &NotifySettings) -> Option<Self> {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        match (read(&settings.address_env), read(&settings.password_env)) {
            (Some(from), Some(password)) => {
                Some(Self::new(settings.smtp_url.clone(), from, password, to))
            }
            _ => {
                warn!(
                    "Email notifications disabled: set {} and {}",
                    settings.address_env, settings.password_env
                );
                None
            }
        }
    }

    /// RFC 5322 message for one iteration
    pub fn render_message(&self, progress: &IterationProgress) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            self.from,
            self.to,
            progress.subject(),
            progress.body().replace('\n', "\r\n")
        )
    }

    /// curl config snippet carrying the credentials
    fn credentials_config(&self) -> String {
        let user = format!("{}:{}", self.from, self.password)
            .replace('\\', "\\\\")
            .replace('"', "\\\"");
        format!("user = \"{}\"\n", user)
    }
}

#[async_trait]
impl NotificationSink for EmailNotifier {
    async fn notify(&self, progress: &IterationProgress) -> Result<()> {
        let mut message = tempfile::NamedTempFile::new()?;
        message.write_all(self.render_message(progress).as_bytes())?;
        message.flush()?;

        let mut child = Command::new("curl")
            .args(["--silent", "--show-error", "--ssl-reqd", "--url"])
            .arg(&self.smtp_url)
            .arg("--mail-from")
            .arg(&self.from)
            .arg("--mail-rcpt")
            .arg(&self.to)
            .arg("--upload-file")
            .arg(message.path())
            .args(["--config", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ConvergeError::Notification(format!("Failed to run curl: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(self.credentials_config().as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ConvergeError::Notification(format!(
                "curl exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!("Emailed iteration {} to {}", progress.iteration, self.to);
        Ok(())
    }

    fn name(&self) -> &str {
        "email"
    }
}
