// src/backend/command.rs

//! Shell command backend.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::backend::GenerationBackend;
use crate::errors::BackendError;
use crate::types::BoxFuture;

/// Longest stderr excerpt carried in a failure message.
const STDERR_TAIL: usize = 512;

/// Runs `cmd` through the platform shell once per prompt.
///
/// The prompt is written to the child's stdin, `FIELDGEN_MODEL` and
/// `FIELDGEN_TEMPERATURE` are set in its environment, and trimmed stdout is
/// the generated value. A non-zero exit is a per-row failure.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    cmd: String,
    models: Vec<String>,
}

impl CommandBackend {
    pub fn new(cmd: impl Into<String>, models: Vec<String>) -> Self {
        Self {
            cmd: cmd.into(),
            models,
        }
    }

    fn shell(&self) -> Command {
        if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.cmd);
            c
        }
    }

    async fn run(
        &self,
        model: &str,
        prompt: &str,
        temperature: Option<f32>,
    ) -> Result<String, BackendError> {
        let mut cmd = self.shell();
        cmd.env("FIELDGEN_MODEL", model)
            .env(
                "FIELDGEN_TEMPERATURE",
                temperature.map(|t| t.to_string()).unwrap_or_default(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        // Feed stdin from its own task so a chatty command cannot deadlock
        // against a large prompt.
        let writer = child.stdin.take().map(|mut stdin| {
            let input = prompt.as_bytes().to_vec();
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
                // Dropping stdin closes the pipe so the command sees EOF.
            })
        });

        let output = child.wait_with_output().await?;
        if let Some(writer) = writer {
            let _ = writer.await;
        }

        finish(
            &self.cmd,
            output.status,
            &output.stdout,
            &String::from_utf8_lossy(&output.stderr),
        )
    }
}

fn finish(
    cmd: &str,
    status: std::process::ExitStatus,
    stdout: &[u8],
    stderr: &str,
) -> Result<String, BackendError> {
    let code = status.code().unwrap_or(-1);
    debug!(cmd = %cmd, exit_code = code, "generation command exited");

    if !status.success() {
        let tail: String = {
            let trimmed = stderr.trim();
            let skip = trimmed.chars().count().saturating_sub(STDERR_TAIL);
            trimmed.chars().skip(skip).collect()
        };
        return Err(BackendError::Failed(format!(
            "command exited with status {}: {}",
            code, tail
        )));
    }

    Ok(String::from_utf8_lossy(stdout).trim().to_string())
}

impl GenerationBackend for CommandBackend {
    fn enabled_models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn prompt<'a>(
        &'a self,
        model: &'a str,
        prompt: &'a str,
        temperature: Option<f32>,
    ) -> BoxFuture<'a, Result<String, BackendError>> {
        Box::pin(self.run(model, prompt, temperature))
    }
}
