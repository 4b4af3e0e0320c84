//! LLM Gateway: the single choke point every pipeline stage calls through
//! to reach a model. Every call is audited; a deterministic mock mode lets
//! tests and local development run with no network access at all.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::io::AsyncWriteExt;

use crate::config::ModelsConfig;
use crate::db::audit;

/// Which model tier a call should route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    /// Trivial extraction and classification work.
    Simple,
    /// Conversation, routing, and composition.
    Standard,
    /// Personality, safety, and crisis handling.
    Complex,
}

impl TaskType {
    fn select(self, models: &ModelsConfig) -> &str {
        match self {
            Self::Simple => &models.simple,
            Self::Standard => &models.standard,
            Self::Complex => &models.complex,
        }
    }
}

/// A single LLM call, fully describing what was asked and of whom.
#[derive(Debug, Clone)]
pub struct LlmCall<'a> {
    /// Correlates this call with the router request that issued it.
    pub request_id: &'a str,
    /// Canonical owner token the call is made on behalf of.
    pub owner: &'a str,
    /// Sender, for the audit log, if resolved.
    pub user_id: Option<i64>,
    /// Owning family, for the audit log, if resolved.
    pub family_id: Option<i64>,
    /// Which pipeline stage this call belongs to, e.g. `"fact_finding"`.
    pub step: &'a str,
    /// System-role instructions.
    pub system_text: &'a str,
    /// User-role content.
    pub user_text: &'a str,
    /// Sampling temperature.
    pub temperature: f32,
    /// Which model tier to route to when not mocked.
    pub task_type: TaskType,
}

/// The structured document sent to (or recorded for) a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RequestDoc {
    model: String,
    system: String,
    user: String,
    temperature: f32,
}

/// Failure modes of a gateway call. Audit-log writes are never surfaced as
/// failures; only the provider call itself can fail this way.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The HTTP call to the provider failed outright.
    #[error("llm provider call failed: {0}")]
    Provider(#[from] reqwest::Error),

    /// The provider's response had no usable choice.
    #[error("llm provider returned no content")]
    EmptyResponse,

    /// No API key was configured and no mock was available.
    #[error("no LLM provider configured and no mock path set")]
    Unconfigured,
}

/// One entry in a mock response map, keyed by pipeline step.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MockValue {
    Text(String),
    Other(serde_json::Value),
}

impl MockValue {
    fn into_text(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Other(v) => v.to_string(),
        }
    }
}

/// Default text returned for a mocked step with no matching entry.
const DEFAULT_MOCK_RESPONSE: &str = "ok";

/// Single choke-point for every LLM call in the system.
///
/// In mock mode (`mock_path` set), no network call is ever made: responses
/// come from a JSON object on disk keyed by pipeline step, and every
/// (request, response) pair is appended to that same file's sibling log
/// when a request log path is configured. Otherwise the call is sent to
/// the Anthropic Messages API using the model selected for its task type.
pub struct Gateway {
    pool: SqlitePool,
    models: ModelsConfig,
    api_key: Option<String>,
    mock_path: Option<PathBuf>,
    request_log: Option<PathBuf>,
    http: reqwest::Client,
}

impl Gateway {
    /// Build a gateway bound to a persistence pool and model configuration.
    pub fn new(
        pool: SqlitePool,
        models: ModelsConfig,
        api_key: Option<String>,
        mock_path: Option<PathBuf>,
        request_log: Option<PathBuf>,
    ) -> Self {
        Self {
            pool,
            models,
            api_key,
            mock_path,
            request_log,
            http: reqwest::Client::new(),
        }
    }

    /// Issue a call, persisting an audit entry regardless of outcome.
    /// Audit persistence failures are logged and swallowed, never
    /// propagated to the caller.
    pub async fn call(&self, call: LlmCall<'_>) -> Result<String, GatewayError> {
        let model = call.task_type.select(&self.models).to_owned();
        let doc = RequestDoc {
            model,
            system: call.system_text.to_owned(),
            user: call.user_text.to_owned(),
            temperature: call.temperature,
        };
        let request_json = serde_json::to_string(&doc).unwrap_or_default();

        let response_text = if let Some(mock_path) = &self.mock_path {
            self.mocked_response(mock_path, call.step).await?
        } else {
            self.live_response(&doc).await?
        };

        self.write_request_log(call.step, &request_json, &response_text)
            .await;

        if let Err(err) = audit::record(
            &self.pool,
            call.request_id,
            call.user_id,
            call.family_id,
            call.owner,
            call.step,
            &request_json,
            &response_text,
        )
        .await
        {
            tracing::warn!(error = %err, request_id = call.request_id, "failed to persist llm audit entry");
        }

        Ok(response_text)
    }

    async fn mocked_response(&self, mock_path: &Path, step: &str) -> Result<String, GatewayError> {
        let raw = tokio::fs::read_to_string(mock_path).await.unwrap_or_default();
        let table: HashMap<String, MockValue> = serde_json::from_str(&raw).unwrap_or_default();
        Ok(table
            .get(step)
            .cloned()
            .map(MockValue::into_text)
            .unwrap_or_else(|| DEFAULT_MOCK_RESPONSE.to_owned()))
    }

    async fn live_response(&self, doc: &RequestDoc) -> Result<String, GatewayError> {
        let api_key = self.api_key.as_ref().ok_or(GatewayError::Unconfigured)?;

        let response = self
            .http
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&serde_json::json!({
                "model": doc.model,
                "system": doc.system,
                "max_tokens": 1024,
                "temperature": doc.temperature,
                "messages": [{"role": "user", "content": doc.user}],
            }))
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = response.json().await?;
        let text = body["content"][0]["text"]
            .as_str()
            .ok_or(GatewayError::EmptyResponse)?;
        Ok(text.trim().to_owned())
    }

    async fn write_request_log(&self, step: &str, request_json: &str, response_text: &str) {
        let Some(path) = &self.request_log else {
            return;
        };
        let line = format!("[{step}] request={request_json} response={response_text}\n");
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await;
        if let Ok(mut file) = file {
            let _ = file.write_all(line.as_bytes()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn models() -> ModelsConfig {
        ModelsConfig {
            standard: "standard-model".to_owned(),
            simple: "simple-model".to_owned(),
            complex: "complex-model".to_owned(),
        }
    }

    #[tokio::test]
    async fn mock_mode_returns_configured_step_response() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let dir = std::env::temp_dir().join(format!("bo-llm-mock-{}", std::process::id()));
        tokio::fs::write(&dir, r#"{"fact_finding": "[]"}"#).await.unwrap();

        let gateway = Gateway::new(pool, models(), None, Some(dir.clone()), None);
        let response = gateway
            .call(LlmCall {
                request_id: "req-1",
                owner: "5551234567",
                user_id: None,
                family_id: None,
                step: "fact_finding",
                system_text: "extract facts",
                user_text: "my zip is 10001",
                temperature: 0.0,
                task_type: TaskType::Simple,
            })
            .await
            .unwrap();

        assert_eq!(response, "[]");
        tokio::fs::remove_file(&dir).await.ok();
    }

    #[tokio::test]
    async fn mock_mode_falls_back_to_default_for_unknown_step() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let dir = std::env::temp_dir().join(format!("bo-llm-mock-unknown-{}", std::process::id()));
        tokio::fs::write(&dir, r#"{"other_step": "hi"}"#).await.unwrap();

        let gateway = Gateway::new(pool, models(), None, Some(dir.clone()), None);
        let response = gateway
            .call(LlmCall {
                request_id: "req-1",
                owner: "5551234567",
                user_id: None,
                family_id: None,
                step: "create_response",
                system_text: "reply",
                user_text: "hello",
                temperature: 0.7,
                task_type: TaskType::Standard,
            })
            .await
            .unwrap();

        assert_eq!(response, DEFAULT_MOCK_RESPONSE);
        tokio::fs::remove_file(&dir).await.ok();
    }

    #[tokio::test]
    async fn mocked_call_is_recorded_to_the_audit_log() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let dir = std::env::temp_dir().join(format!("bo-llm-mock-audit-{}", std::process::id()));
        tokio::fs::write(&dir, r#"{"fact_finding": "[]"}"#).await.unwrap();

        let gateway = Gateway::new(pool.clone(), models(), None, Some(dir.clone()), None);
        gateway
            .call(LlmCall {
                request_id: "req-audit",
                owner: "5551234567",
                user_id: None,
                family_id: None,
                step: "fact_finding",
                system_text: "extract facts",
                user_text: "hello",
                temperature: 0.0,
                task_type: TaskType::Simple,
            })
            .await
            .unwrap();

        let trace = audit::trace(&pool, "req-audit").await.unwrap();
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].step, "fact_finding");
        tokio::fs::remove_file(&dir).await.ok();
    }

    #[tokio::test]
    async fn live_mode_without_api_key_is_unconfigured() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        let gateway = Gateway::new(pool, models(), None, None, None);
        let result = gateway
            .call(LlmCall {
                request_id: "req-1",
                owner: "5551234567",
                user_id: None,
                family_id: None,
                step: "create_response",
                system_text: "reply",
                user_text: "hello",
                temperature: 0.7,
                task_type: TaskType::Standard,
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Unconfigured)));
    }
}
