use anyhow::{bail, Result};
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::api::{GenerateRequest, GenerateResponse, StreamEvent};
use crate::envconfig;
use crate::prompt::{PromptVars, Template};

use super::{error_json, model_error, run_generate, stream_response, AppState, GenerateOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    pub content: String,
}

/// The request's model field is ignored; `OLLAMA_OPENAI_MODEL` names the
/// backing model.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub messages: Vec<OpenAiMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: usize,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub system_fingerprint: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ModelData {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelData>,
}

/// Assembles a prompt from OpenAI-style messages. A message whose role is
/// not the expected next one in the `system → user → assistant` sequence
/// closes the current turn: the template is expanded and the assistant text
/// appended verbatim.
pub fn apply_template(model_template: &str, messages: &[OpenAiMessage]) -> Result<String> {
    let template = Template::parse(model_template)?;

    #[derive(Default)]
    struct Turn {
        system: String,
        prompt: String,
        assistant: String,
    }

    let flush = |turn: &Turn, out: &mut String| -> Result<()> {
        out.push_str(&template.execute(&PromptVars {
            first: false,
            system: turn.system.clone(),
            prompt: turn.prompt.clone(),
        })?);
        if !turn.assistant.is_empty() {
            out.push('\n');
            out.push_str(&turn.assistant);
        }
        Ok(())
    };

    let mut next_roles: Vec<&str> = vec![messages.first().map(|m| m.role.as_str()).unwrap_or("")];
    let mut turn = Turn::default();
    let mut result = String::new();

    for message in messages {
        if !next_roles.contains(&message.role.as_str()) {
            flush(&turn, &mut result)?;
            turn = Turn::default();
        }

        match message.role.as_str() {
            "system" => {
                turn.system = message.content.clone();
                next_roles = vec!["user", "assistant"];
            }
            "user" => {
                turn.prompt = message.content.clone();
                next_roles = vec!["assistant"];
            }
            "assistant" => {
                turn.assistant = message.content.clone();
                next_roles = vec![""];
            }
            other => bail!("unexpected role: {}", other),
        }
    }

    if !turn.system.is_empty() || !turn.prompt.is_empty() || !turn.assistant.is_empty() {
        flush(&turn, &mut result)?;
    }

    Ok(result)
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Response {
    let model_name = envconfig::openai_model();

    let model = match state.manager.get_model(&model_name) {
        Ok(model) => model,
        Err(err) => return model_error(&model_name, err),
    };

    let prompt = match apply_template(&model.template, &req.messages) {
        Ok(prompt) => prompt,
        Err(err) => return error_json(StatusCode::BAD_REQUEST, err.to_string()),
    };

    let generate_req = GenerateRequest {
        model: model_name.clone(),
        prompt,
        raw: true,
        stream: Some(req.stream),
        ..Default::default()
    };

    let rx = match run_generate(&state, generate_req).await {
        Ok(GenerateOutcome::Stream(rx)) => rx,
        Ok(GenerateOutcome::Warmup(_)) => {
            return Json(completion(
                new_completion_id(),
                "chat.completion",
                &model_name,
                Utc::now().timestamp(),
                Delta {
                    role: Some("assistant".to_string()),
                    content: Some(String::new()),
                },
                Some("stop".to_string()),
                Usage::default(),
            ))
            .into_response()
        }
        Err(response) => return response,
    };

    let id = new_completion_id();
    if !req.stream {
        return collect_completion(id, model_name, rx).await;
    }

    let (out_tx, out_rx) = mpsc::unbounded_channel::<StreamEvent<ChatCompletionResponse>>();
    tokio::spawn(transform_chunks(id, model_name, rx, out_tx));
    stream_response(UnboundedReceiverStream::new(out_rx)).await
}

async fn collect_completion(
    id: String,
    model_name: String,
    mut rx: mpsc::Receiver<StreamEvent<GenerateResponse>>,
) -> Response {
    let mut content = String::new();
    let mut last: Option<GenerateResponse> = None;

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Record(record) => {
                content.push_str(&record.response);
                if record.done {
                    last = Some(record);
                }
            }
            StreamEvent::Error(message) => {
                return error_json(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }

    let last = last.unwrap_or_default();
    let prompt_tokens = last.prompt_eval_count.unwrap_or(0);
    let completion_tokens = last.eval_count.unwrap_or(0);

    Json(completion(
        id,
        "chat.completion",
        &model_name,
        last.created_at.map(|t| t.timestamp()).unwrap_or_else(|| Utc::now().timestamp()),
        Delta {
            role: Some("assistant".to_string()),
            content: Some(content),
        },
        Some("stop".to_string()),
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    ))
    .into_response()
}

async fn transform_chunks(
    id: String,
    model_name: String,
    mut rx: mpsc::Receiver<StreamEvent<GenerateResponse>>,
    out: mpsc::UnboundedSender<StreamEvent<ChatCompletionResponse>>,
) {
    // an opening chunk announces the assistant role
    let _ = out.send(StreamEvent::Record(completion(
        id.clone(),
        "chat.completion.chunk",
        &model_name,
        Utc::now().timestamp(),
        Delta {
            role: Some("assistant".to_string()),
            content: Some(String::new()),
        },
        None,
        Usage::default(),
    )));

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Record(record) => {
                let finish = if record.done { Some("stop".to_string()) } else { None };
                let created = record
                    .created_at
                    .map(|t| t.timestamp())
                    .unwrap_or_else(|| Utc::now().timestamp());
                let _ = out.send(StreamEvent::Record(completion(
                    id.clone(),
                    "chat.completion.chunk",
                    &model_name,
                    created,
                    Delta {
                        role: None,
                        content: Some(record.response),
                    },
                    finish,
                    Usage::default(),
                )));
            }
            StreamEvent::Error(message) => {
                let _ = out.send(StreamEvent::Error(message));
                return;
            }
        }
    }
}

fn new_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

#[allow(clippy::too_many_arguments)]
fn completion(
    id: String,
    object: &str,
    model: &str,
    created: i64,
    delta: Delta,
    finish_reason: Option<String>,
    usage: Usage,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id,
        object: object.to_string(),
        created,
        model: model.to_string(),
        system_fingerprint: "fp_ollama".to_string(),
        choices: vec![Choice {
            index: 0,
            delta,
            finish_reason,
        }],
        usage,
    }
}

pub async fn list_models(State(state): State<AppState>) -> Response {
    match state.manager.list_models() {
        Ok(models) => {
            let data = models
                .into_iter()
                .map(|m| ModelData {
                    id: m.name,
                    object: "model".to_string(),
                    created: m.modified_at.timestamp(),
                    owned_by: "ollama".to_string(),
                })
                .collect();
            Json(ModelList {
                object: "list".to_string(),
                data,
            })
            .into_response()
        }
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}
