use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub context: Vec<i32>,
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub options: HashMap<String, Value>,
    pub stream: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub options: HashMap<String, Value>,
    pub stream: Option<bool>,
}

/// One record of a generation stream. Used by both generate (text in
/// `response`) and chat (text moved into `message`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerateResponse {
    pub model: String,
    pub created_at: Option<DateTime<Utc>>,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub name: String,
    #[serde(default)]
    pub insecure: bool,
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub name: String,
    #[serde(default)]
    pub insecure: bool,
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    #[serde(default)]
    pub modelfile: String,
    #[serde(default)]
    pub path: String,
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CopyRequest {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Deserialize)]
pub struct ShowRequest {
    pub name: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ShowResponse {
    pub license: String,
    pub modelfile: String,
    pub parameters: String,
    pub template: String,
    pub system: String,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub models: Vec<ModelResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelResponse {
    pub name: String,
    pub size: u64,
    pub digest: String,
    pub modified_at: DateTime<Utc>,
}

/// Progress record for pull, push and create streams.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
}

impl ProgressResponse {
    pub fn status(status: impl Into<String>) -> Self {
        ProgressResponse {
            status: status.into(),
            ..Default::default()
        }
    }
}

/// Callback shape shared by every long-running store operation.
pub type ProgressFn = dyn Fn(ProgressResponse) + Send + Sync;

/// Bearer token reply from a registry auth realm.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// What flows over every internal streaming channel: either a record to
/// forward or a terminal error line.
#[derive(Debug)]
pub enum StreamEvent<T> {
    Record(T),
    Error(String),
}
