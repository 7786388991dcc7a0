//! Turning a raw queue payload into a [`WorkResult`].
//!
//! Decoding and validation live in [`handle_work`]; running the command is
//! delegated to an [`Executor`] so callers can swap in their own.

use crate::protocol::{TIMING_DECODE, TIMING_EXECUTE, WORKER_ID_ENV, WorkItem, WorkResult};
use crate::telemetry::work::record_item;
use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::process::{Output, Stdio};
use std::time::Instant;
use tokio::process::Command;
use tracing::{Span, debug};

/// What running one command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Execution {
    pub exit_code: i32,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

impl Execution {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Runs a validated work item to completion.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, item: &WorkItem, worker_id: &str) -> Execution;
}

/// Executes work items as local subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    /// Build the subprocess for an item.
    ///
    /// The environment is the worker's own, overlaid by the item's, overlaid
    /// by [`WORKER_ID_ENV`], which the item cannot override.
    pub fn command(item: &WorkItem, worker_id: &str) -> Command {
        let mut cmd = Command::new(&item.command);
        cmd.args(&item.args)
            .envs(&item.environment)
            .env(WORKER_ID_ENV, worker_id)
            .stdin(Stdio::null());
        if !item.working_dir.is_empty() {
            cmd.current_dir(&item.working_dir);
        }
        cmd
    }
}

fn from_output(output: Output) -> Execution {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let (exit_code, error) = match output.status.code() {
        Some(code) => (code, None),
        None => {
            let reason = match output.status.signal() {
                Some(signal) => format!("terminated by signal {signal}"),
                None => format!("abnormal termination: {}", output.status),
            };
            (-1, Some(reason))
        }
    };
    Execution {
        exit_code,
        error,
        stdout,
        stderr,
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, item: &WorkItem, worker_id: &str) -> Execution {
        match Self::command(item, worker_id).output().await {
            Ok(output) => from_output(output),
            Err(e) => Execution::failed(format!("failed to run {}: {e}", item.command)),
        }
    }
}

/// A produced result plus the item it came from, when it decoded.
#[derive(Debug, Clone)]
pub struct Handled {
    pub result: WorkResult,
    pub item: Option<WorkItem>,
}

impl Handled {
    /// Undecodable payloads fall back to the protocol default (publish).
    pub fn publish_result(&self) -> bool {
        self.item.as_ref().is_none_or(|item| item.publish_result)
    }

    /// Correlation channel id, only when the result is published at all.
    pub fn correlation(&self) -> Option<&str> {
        self.item
            .as_ref()
            .filter(|item| item.publish_result)
            .and_then(WorkItem::correlation)
    }
}

fn elapsed_ms(since: Instant) -> i64 {
    i64::try_from(since.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Decode, validate and execute one payload.
///
/// Never fails: decode and validation errors become a result with exit
/// code -1 and no execution.
pub async fn handle_work(worker_id: &str, payload: &[u8], executor: &dyn Executor) -> Handled {
    let mut result = WorkResult::new(worker_id);

    let decode_start = Instant::now();
    let decoded = WorkItem::decode(payload);
    result
        .timings
        .insert(TIMING_DECODE.to_string(), elapsed_ms(decode_start));

    let item = match decoded {
        Ok(item) => item,
        Err(e) => {
            debug!(worker = worker_id, "undecodable work item: {e}");
            return Handled {
                result: result.failed(e.to_string()),
                item: None,
            };
        }
    };
    record_item(&Span::current(), &item.command, item.correlation());

    if item.command.is_empty() {
        return Handled {
            result: result.failed("must specify command"),
            item: Some(item),
        };
    }

    debug!(worker = worker_id, command = %item.command, "starting work");
    let execute_start = Instant::now();
    let execution = executor.execute(&item, worker_id).await;
    result
        .timings
        .insert(TIMING_EXECUTE.to_string(), elapsed_ms(execute_start));
    debug!(
        worker = worker_id,
        command = %item.command,
        exit_code = execution.exit_code,
        "finished work"
    );

    result.exit_code = execution.exit_code;
    result.error_message = execution.error;
    result.stdout = execution.stdout;
    result.stderr = execution.stderr;
    Handled {
        result,
        item: Some(item),
    }
}
