//! Operator notifications.
use anyhow::{bail, Context, Result};
use log::{error, info};
use std::io::Write;
use std::process::{Command, Stdio};

pub trait Notifier {
    fn notify(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()>;
}

/// Writes notifications to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()> {
        error!("{subject} (for {})\n{body}", recipients.join(", "));
        Ok(())
    }
}

/// Pipes the body to a `mail`-compatible program:
/// `<program> -s <subject> <recipient>...`.
pub struct CommandNotifier {
    pub program: String,
}

impl Notifier for CommandNotifier {
    fn notify(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()> {
        if recipients.is_empty() {
            return LogNotifier.notify(subject, body, recipients);
        }
        let mut child = Command::new(&self.program)
            .arg("-s")
            .arg(subject)
            .args(recipients)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to run {}", self.program))?;
        {
            let Some(stdin) = child.stdin.as_mut() else {
                bail!("Failed to open stdin of {}", self.program);
            };
            stdin
                .write_all(body.as_bytes())
                .with_context(|| format!("Failed to write to stdin of {}", self.program))?;
        }
        let status = child.wait()?;
        if !status.success() {
            bail!("{} exited with {status}", self.program);
        }
        info!("Sent '{subject}' to {}", recipients.join(", "));
        Ok(())
    }
}
