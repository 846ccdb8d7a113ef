use async_trait::async_trait;
use converge::{ActionCollaborator, CallContext, CollaboratorError, Config};
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::required_str;
use crate::config::expand_path;

/// Runs `command` through an interpreter (`["sh", "-c"]` unless `interpreter`
/// says otherwise), with optional `environment` and `working_dir`
///
/// The child is killed when the step times out or the run is cancelled.
pub struct ShellAction;

fn interpreter(config: &Config) -> Result<Vec<String>, CollaboratorError> {
    match config.get("interpreter") {
        None | Some(Value::Null) => Ok(vec!["sh".to_string(), "-c".to_string()]),
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| CollaboratorError::permanent("\"interpreter\" must be a list of strings"))
            })
            .collect(),
        Some(_) => Err(CollaboratorError::permanent(
            "\"interpreter\" must be a non-empty list of strings",
        )),
    }
}

fn build_command(config: &Config) -> Result<Command, CollaboratorError> {
    let script = required_str(config, "command")?;
    let interpreter = interpreter(config)?;

    let mut cmd = Command::new(&interpreter[0]);
    cmd.args(&interpreter[1..])
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(env) = config.get("environment") {
        let Value::Object(vars) = env else {
            return Err(CollaboratorError::permanent("\"environment\" must be an object"));
        };
        for (name, value) in vars {
            match value {
                Value::String(s) => cmd.env(name, s),
                other => cmd.env(name, other.to_string()),
            };
        }
    }

    if let Some(dir) = config.get("working_dir").and_then(Value::as_str) {
        cmd.current_dir(expand_path(dir));
    }

    Ok(cmd)
}

#[async_trait]
impl ActionCollaborator for ShellAction {
    async fn run(&self, ctx: &CallContext, config: &Config, timeout: Duration) -> Result<i32, CollaboratorError> {
        let mut cmd = build_command(config)?;
        log::info!(
            "{}: running {} (timeout {})",
            ctx.key,
            required_str(config, "command")?,
            converge::duration::format_duration(timeout)
        );

        let child = cmd
            .spawn()
            .map_err(|e| CollaboratorError::permanent(format!("Failed to start interpreter: {e}")))?;

        // Dropping the child (on cancellation) kills it
        let output = tokio::select! {
            () = ctx.cancel.cancelled() => {
                log::warn!("{}: interrupted, killing command", ctx.key);
                return Err(CollaboratorError::permanent("interrupted"));
            }
            output = child.wait_with_output() => output
                .map_err(|e| CollaboratorError::Other(anyhow::Error::new(e).context("Failed to wait for command")))?,
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            log::debug!("{}: {line}", ctx.key);
        }
        let code = output.status.code().unwrap_or(-1);
        if code != 0 {
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                log::warn!("{}: {line}", ctx.key);
            }
        }
        Ok(code)
    }
}
