//! CLI command step - run a shell command in a child process.
//!
//! Output capture is bounded per stream. Past the cap the stream is still
//! drained (so the child never blocks on a full pipe) but the bytes are
//! dropped and a truncation marker is appended.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::template::{resolve_template, resolve_value};
use super::types::{
    ConfigValidation, Step, StepBase, StepExecutionContext, StepLogger, StepResult,
};
use crate::error::{Error, Result};
use crate::substitution::stringify;

pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

const READ_CHUNK_BYTES: usize = 8192;
const MAX_LINE_BYTES: usize = 64 * 1024;
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Shell command step.
pub struct CliCommandStep {
    base: StepBase,
}

impl CliCommandStep {
    pub fn new(base: StepBase) -> Self {
        Self { base }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliCommandConfig {
    command: String,

    /// Appended to the command, each one shell-escaped
    #[serde(default)]
    args: Vec<Value>,

    #[serde(default)]
    cwd: Option<String>,

    /// Added on top of the inherited environment
    #[serde(default)]
    env: Map<String, Value>,

    #[serde(default)]
    shell: Option<String>,

    #[serde(default)]
    stdin: Option<String>,

    /// Milliseconds before the process is killed
    #[serde(default)]
    timeout: Option<u64>,

    #[serde(default = "default_exit_codes")]
    expected_exit_codes: Vec<i32>,

    #[serde(default = "default_true")]
    fail_on_error: bool,

    /// Log output lines as they arrive
    #[serde(default)]
    stream_output: bool,

    /// Per-stream capture cap in bytes
    #[serde(default)]
    max_output_size: Option<usize>,
}

fn default_exit_codes() -> Vec<i32> {
    vec![0]
}

fn default_true() -> bool {
    true
}

/// Quote an argument for a POSIX shell (or cmd.exe).
pub fn shell_escape(arg: &str, shell: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        return arg.to_string();
    }
    if is_cmd(shell) {
        format!("\"{}\"", arg.replace('"', "\"\""))
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

fn is_cmd(shell: &str) -> bool {
    let name = shell.rsplit(['/', '\\']).next().unwrap_or(shell);
    name.eq_ignore_ascii_case("cmd") || name.eq_ignore_ascii_case("cmd.exe")
}

/// Bytes captured from one stream.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

async fn read_buffered<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> std::io::Result<Captured> {
    let mut captured = Captured::default();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        captured.push(&chunk[..n], limit);
    }
    Ok(captured)
}

fn emit_line(
    logger: &dyn StepLogger,
    stream: &'static str,
    line: &[u8],
    captured: &mut Captured,
    limit: usize,
) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end_matches(['\n', '\r']);
    let data = json!({ "stream": stream });
    if stream == "stderr" {
        logger.warn(text, Some(&data));
    } else {
        logger.info(text, Some(&data));
    }
    captured.push(line, limit);
}

/// Log output line by line while capturing it. Lines longer than
/// `MAX_LINE_BYTES` are emitted in pieces.
async fn read_streaming<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    logger: Arc<dyn StepLogger>,
    stream: &'static str,
) -> std::io::Result<Captured> {
    let mut captured = Captured::default();
    let mut pending = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for piece in chunk[..n].split_inclusive(|b| *b == b'\n') {
            pending.extend_from_slice(piece);
            if piece.ends_with(b"\n") || pending.len() >= MAX_LINE_BYTES {
                emit_line(logger.as_ref(), stream, &pending, &mut captured, limit);
                pending.clear();
            }
        }
    }
    if !pending.is_empty() {
        emit_line(logger.as_ref(), stream, &pending, &mut captured, limit);
    }
    Ok(captured)
}

fn spawn_reader<R>(
    reader: Option<R>,
    limit: usize,
    streaming: Option<(Arc<dyn StepLogger>, &'static str)>,
) -> JoinHandle<std::io::Result<Captured>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(reader) = reader else {
            return Ok(Captured::default());
        };
        match streaming {
            Some((logger, stream)) => read_streaming(reader, limit, logger, stream).await,
            None => read_buffered(reader, limit).await,
        }
    })
}

/// Wait for a reader task. With a grace period, a reader still blocked
/// after it (e.g. a grandchild holds the pipe open) is abandoned.
async fn join_reader(
    mut handle: JoinHandle<std::io::Result<Captured>>,
    grace: Option<Duration>,
) -> Result<Captured> {
    let joined = match grace {
        Some(grace) => match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Ok(Captured::default());
            }
        },
        None => handle.await,
    };
    joined
        .map_err(|e| Error::Internal(format!("Output reader task failed: {}", e)))?
        .map_err(Error::Io)
}

#[async_trait]
impl Step for CliCommandStep {
    fn base(&self) -> &StepBase {
        &self.base
    }

    fn step_type(&self) -> &str {
        "cliCommand"
    }

    fn description(&self) -> &str {
        "Run a shell command"
    }

    fn validate_config(&self) -> ConfigValidation {
        let mut result = ConfigValidation::ok();

        match self.base.get("command") {
            Some(Value::String(command)) if !command.trim().is_empty() => {}
            Some(Value::String(_)) => result.error("command cannot be empty"),
            Some(_) => result.error("command must be a string"),
            None => result.error("command is required"),
        }

        if let Some(args) = self.base.get("args") {
            if !args.is_array() {
                result.error("args must be an array");
            }
        }

        for key in ["cwd", "shell", "stdin"] {
            if let Some(value) = self.base.get(key) {
                if !value.is_string() {
                    result.error(format!("{} must be a string", key));
                }
            }
        }

        if let Some(env) = self.base.get("env") {
            if !env.is_object() {
                result.error("env must be an object");
            }
        }

        for key in ["timeout", "maxOutputSize"] {
            if let Some(value) = self.base.get(key) {
                if !value.as_u64().is_some_and(|n| n > 0) {
                    result.error(format!("{} must be a positive number", key));
                }
            }
        }

        if let Some(codes) = self.base.get("expectedExitCodes") {
            let valid = codes
                .as_array()
                .is_some_and(|codes| codes.iter().all(|c| c.as_i64().is_some()));
            if !valid {
                result.error("expectedExitCodes must be an array of integers");
            }
        }

        result
    }

    async fn execute_step(&self, ctx: &mut StepExecutionContext) -> Result<StepResult> {
        let config: CliCommandConfig = self.base.parse_config("cliCommand")?;
        let settings = &self.base.settings.command;

        let shell = config
            .shell
            .as_deref()
            .map(|s| resolve_template(s, ctx))
            .unwrap_or_else(|| settings.shell.clone());

        let mut full_command = resolve_template(&config.command, ctx);
        for arg in &config.args {
            let arg = stringify(&resolve_value(arg, ctx));
            full_command.push(' ');
            full_command.push_str(&shell_escape(&arg, &shell));
        }

        let stdin = config.stdin.as_deref().map(|s| resolve_template(s, ctx));
        let streaming = config.stream_output || stdin.is_some();
        let limit = config.max_output_size.unwrap_or(settings.max_output_bytes);
        let timeout_ms = config.timeout.unwrap_or(settings.timeout_ms);
        let mode = if streaming { "streaming" } else { "buffered" };

        let mut command = Command::new(&shell);
        if is_cmd(&shell) {
            command.arg("/C");
        } else {
            command.arg("-c");
        }
        command
            .arg(&full_command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let cwd = config.cwd.as_deref().map(|c| resolve_template(c, ctx));
        if let Some(cwd) = &cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &config.env {
            command.env(key, stringify(&resolve_value(value, ctx)));
        }

        debug!(step_id = %self.base.id, shell = %shell, mode, "Running command: {}", full_command);
        let start = Instant::now();

        let mut child = command.spawn().map_err(|e| {
            Error::Execution(format!("Failed to start command '{}': {}", full_command, e))
        })?;

        let stream_logger = |stream: &'static str| streaming.then(|| (ctx.logger.clone(), stream));
        let stdout_task = spawn_reader(child.stdout.take(), limit, stream_logger("stdout"));
        let stderr_task = spawn_reader(child.stderr.take(), limit, stream_logger("stderr"));

        if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(payload.as_bytes()).await {
                    warn!("Failed to write command stdin: {}", e);
                }
                // dropping the pipe closes stdin
            });
        }

        let (status, timed_out) =
            match tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait()).await {
                Ok(status) => (Some(status?), false),
                Err(_) => {
                    warn!(
                        step_id = %self.base.id,
                        timeout_ms,
                        "Command timed out, killing process"
                    );
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill timed-out command: {}", e);
                    }
                    (None, true)
                }
            };

        let grace = timed_out.then_some(KILL_GRACE);
        let stdout = join_reader(stdout_task, grace).await?;
        let stderr = join_reader(stderr_task, grace).await?;
        let truncated = stdout.truncated || stderr.truncated;
        let stdout = stdout.into_text();
        let stderr = stderr.into_text();
        let duration = start.elapsed().as_millis() as u64;
        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);

        let mut outputs = Map::new();
        outputs.insert("stdout".into(), json!(stdout));
        outputs.insert("stderr".into(), json!(stderr));
        outputs.insert("exitCode".into(), json!(exit_code));
        outputs.insert("command".into(), json!(full_command));

        let metadata = json!({
            "mode": mode,
            "shell": shell,
            "cwd": cwd,
            "duration": duration,
            "timedOut": timed_out,
            "truncated": truncated,
        });

        if timed_out {
            return Ok(
                StepResult::failure(format!("Command timed out after {}ms", timeout_ms))
                    .with_outputs(outputs)
                    .with_metadata_map(metadata),
            );
        }

        let allowed = config.expected_exit_codes.contains(&exit_code);
        if !allowed && config.fail_on_error {
            let detail = stderr.trim();
            let message = if detail.is_empty() {
                format!("Command exited with code {}", exit_code)
            } else {
                format!("Command exited with code {}: {}", exit_code, detail)
            };
            return Ok(StepResult::failure(message)
                .with_outputs(outputs)
                .with_metadata_map(metadata));
        }

        Ok(StepResult::success(outputs).with_metadata_map(metadata))
    }
}
