//! Skill Executor: isolated invocation of a registered skill's entrypoint.
//!
//! Every subprocess skill runs as a separately addressable unit — the
//! executor never runs skill code in-process. This is a security boundary,
//! not an implementation convenience: a skill cannot observe or mutate
//! anything outside its own stdin/stdout/stderr and the fixed environment
//! it's handed.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default upper bound on a single skill invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// A request handed to a skill's entrypoint.
#[derive(Debug, Clone, Serialize)]
pub struct SkillRequest {
    /// Correlates this invocation with the router request that triggered it.
    pub request_id: String,
    /// Canonical owner token of the requesting principal.
    pub from: String,
    /// The LLM's chosen parameters for this skill invocation.
    pub params: serde_json::Value,
}

/// A successful skill invocation's parsed result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SkillOutcome {
    /// Text to incorporate into the composed reply.
    pub response: String,
    /// Arbitrary structured hints for the composition stage.
    #[serde(default)]
    pub hints: serde_json::Value,
}

/// Failure modes of a skill invocation.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The entrypoint could not be spawned or its pipes could not be used.
    #[error("failed to run skill entrypoint: {0}")]
    Infrastructure(#[from] std::io::Error),

    /// The invocation ran longer than the configured timeout.
    #[error("skill timed out after {seconds}s")]
    Timeout {
        /// The configured bound that was exceeded.
        seconds: u64,
    },

    /// The entrypoint exited with a non-zero status.
    #[error("skill exited with status {0}")]
    NonZeroExit(i32),

    /// The entrypoint produced no stdout at all.
    #[error("skill produced no output")]
    EmptyOutput,
}

/// Invokes a skill's entrypoint as an isolated subprocess.
#[async_trait]
pub trait SkillExecutor: Send + Sync {
    /// Run `entrypoint` against `request`, enforcing a timeout.
    async fn execute(
        &self,
        entrypoint: &str,
        request: &SkillRequest,
    ) -> Result<SkillOutcome, ExecutorError>;
}

/// Default [`SkillExecutor`]: spawns the entrypoint as a subprocess with
/// JSON on stdin and a bounded wait for JSON (or raw text) on stdout.
pub struct SubprocessExecutor {
    timeout: Duration,
}

impl SubprocessExecutor {
    /// Build an executor with the default timeout.
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Build an executor with an explicit timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SubprocessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SkillExecutor for SubprocessExecutor {
    async fn execute(
        &self,
        entrypoint: &str,
        request: &SkillRequest,
    ) -> Result<SkillOutcome, ExecutorError> {
        let stdin_payload = serde_json::to_vec(request).unwrap_or_default();

        let run = async {
            let mut child = Command::new(entrypoint)
                .env("BO_REQUEST_ID", &request.request_id)
                .env("BO_REQUEST_FROM", &request.from)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;

            if let Some(mut stdin) = child.stdin.take() {
                // An entrypoint that exits before reading its input closes
                // the pipe out from under us; that's an exit-status failure,
                // not an infrastructure one, so it's surfaced via the wait
                // below rather than propagated here.
                let _ = stdin.write_all(&stdin_payload).await;
            }

            let output = child.wait_with_output().await?;
            Ok::<_, std::io::Error>(output)
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| ExecutorError::Timeout {
                seconds: self.timeout.as_secs(),
            })??;

        if !output.status.success() {
            return Err(ExecutorError::NonZeroExit(output.status.code().unwrap_or(-1)));
        }

        if output.stdout.is_empty() {
            return Err(ExecutorError::EmptyOutput);
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(parse_outcome(&stdout))
    }
}

/// Parse a skill's stdout as `{response, hints?}`, falling back to
/// treating the raw text as the response with empty hints.
fn parse_outcome(stdout: &str) -> SkillOutcome {
    serde_json::from_str::<SkillOutcome>(stdout).unwrap_or_else(|_| SkillOutcome {
        response: stdout.trim().to_owned(),
        hints: serde_json::Value::Object(serde_json::Map::new()),
    })
}

/// An in-process skill implementation, for capabilities safe to run
/// without subprocess isolation (e.g. bookkeeping that only touches the
/// persistence layer). Registered behind the same outcome shape as
/// subprocess skills so the router can treat both uniformly.
#[async_trait]
pub trait InProcessSkill: Send + Sync {
    /// Run this skill against `request`.
    async fn invoke(&self, request: &SkillRequest) -> Result<SkillOutcome, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_json_stdout_parses_into_outcome() {
        let outcome = parse_outcome(r#"{"response": "done", "hints": {"x": 1}}"#);
        assert_eq!(outcome.response, "done");
        assert_eq!(outcome.hints, serde_json::json!({"x": 1}));
    }

    #[test]
    fn non_json_stdout_falls_back_to_raw_text() {
        let outcome = parse_outcome("it's 72 degrees and sunny\n");
        assert_eq!(outcome.response, "it's 72 degrees and sunny");
        assert_eq!(outcome.hints, serde_json::json!({}));
    }

    #[tokio::test]
    async fn nonexistent_entrypoint_is_an_infrastructure_error() {
        let executor = SubprocessExecutor::with_timeout(Duration::from_secs(2));
        let request = SkillRequest {
            request_id: "req-1".to_owned(),
            from: "5551234567".to_owned(),
            params: serde_json::json!({}),
        };
        let result = executor
            .execute("/nonexistent/skill/entrypoint", &request)
            .await;
        assert!(matches!(result, Err(ExecutorError::Infrastructure(_))));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let executor = SubprocessExecutor::with_timeout(Duration::from_secs(2));
        let request = SkillRequest {
            request_id: "req-1".to_owned(),
            from: "5551234567".to_owned(),
            params: serde_json::json!({}),
        };
        let result = executor.execute("/bin/false", &request).await;
        assert!(matches!(result, Err(ExecutorError::NonZeroExit(_))));
    }

    #[tokio::test]
    async fn successful_entrypoint_yields_parsed_outcome() {
        let executor = SubprocessExecutor::with_timeout(Duration::from_secs(2));
        let request = SkillRequest {
            request_id: "req-1".to_owned(),
            from: "5551234567".to_owned(),
            params: serde_json::json!({}),
        };
        // /bin/cat echoes the request JSON back, which doesn't satisfy the
        // {response, hints} shape, so it falls back to raw-text response.
        let result = executor.execute("/bin/cat", &request).await.unwrap();
        assert!(result.response.contains("req-1"));
    }
}
