//! Wire protocol: work items, results, control messages, and channel naming.
//!
//! Every message is a JSON object with camelCase field tags. Decoding ignores
//! unknown fields and fills absent optional ones with safe defaults, so old
//! and new submitters/pools can share a queue.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Environment variable injected into every spawned command.
pub const WORKER_ID_ENV: &str = "RUNNER_WORKER_ID";

/// Timing key for payload decoding.
pub const TIMING_DECODE: &str = "decode";

/// Timing key for subprocess execution.
pub const TIMING_EXECUTE: &str = "execute";

// ---------------------------------------------------------------------------
// Channel naming
// ---------------------------------------------------------------------------

/// All broker names derived from one configured queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channels {
    queue: String,
}

impl Channels {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// The competing-consumer work queue.
    pub fn work_queue(&self) -> &str {
        &self.queue
    }

    /// Broadcast channel receiving every published result.
    pub fn results(&self) -> String {
        format!("{}:results", self.queue)
    }

    /// Per-job channel routing one result back to its submitter.
    pub fn correlation(&self, correlation_id: &str) -> String {
        format!("{}:results:{correlation_id}", self.queue)
    }

    /// Broadcast channel for control messages.
    pub fn control(&self) -> String {
        format!("{}:control", self.queue)
    }

    /// Membership set of registered pools.
    pub fn servers(&self) -> String {
        format!("{}:servers", self.queue)
    }
}

// ---------------------------------------------------------------------------
// Work item
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// Older submitters send an unset flag as `null`, which means publish.
fn null_as_true<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(true))
}

/// A command to run on some worker of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Routes the result to `<queue>:results:<id>` when non-empty.
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Extra environment, applied over the worker's own.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,

    #[serde(default)]
    pub command: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Empty means the worker's current directory.
    #[serde(default, alias = "dir")]
    pub working_dir: String,

    #[serde(default = "default_true", deserialize_with = "null_as_true")]
    pub publish_result: bool,
}

impl WorkItem {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            correlation_id: None,
            environment: HashMap::new(),
            command: command.into(),
            args: Vec::new(),
            working_dir: String::new(),
            publish_result: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn publish_result(mut self, publish: bool) -> Self {
        self.publish_result = publish;
        self
    }

    /// The correlation id, if present and non-empty.
    pub fn correlation(&self) -> Option<&str> {
        self.correlation_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn encode(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Outcome of one work item, produced by exactly one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkResult {
    #[serde(default)]
    pub source_worker_id: String,

    /// The subprocess exit status, or -1 when nothing ran to a normal exit.
    #[serde(default)]
    pub exit_code: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub stderr: String,

    /// Milliseconds spent per phase, keyed by [`TIMING_DECODE`] / [`TIMING_EXECUTE`].
    #[serde(default)]
    pub timings: HashMap<String, i64>,
}

impl WorkResult {
    pub fn new(source_worker_id: impl Into<String>) -> Self {
        Self {
            source_worker_id: source_worker_id.into(),
            ..Self::default()
        }
    }

    /// A result for an item that never reached execution.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.exit_code = -1;
        self.error_message = Some(error.into());
        self
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error_message.is_none()
    }

    pub fn encode(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    /// Stop every pool listening on the queue.
    Stop,
}

impl std::fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlCommand::Stop => write!(f, "stop"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub command: ControlCommand,
}

impl ControlMessage {
    pub fn stop() -> Self {
        Self {
            command: ControlCommand::Stop,
        }
    }

    pub fn encode(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
