pub mod openai;

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete as axum_delete, get, head, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info};

use crate::api::{
    ChatRequest, CopyRequest, CreateRequest, DeleteRequest, EmbeddingRequest, EmbeddingResponse,
    GenerateRequest, GenerateResponse, ListResponse, Message, ProgressResponse, PullRequest,
    PushRequest, ShowRequest, StreamEvent,
};
use crate::llm;
use crate::models::{is_not_found, ModelManager};
use crate::options::InvalidOption;
use crate::prompt::{self, InvalidRole};
use crate::registry::{self, RegistryOptions};
use crate::session::{Predict, RunnerFactory, Scheduler, DEFAULT_SESSION_DURATION};
use crate::{builder, envconfig, parser};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ModelManager>,
    pub scheduler: Arc<Scheduler>,
    pub work_dir: PathBuf,
}

pub async fn serve() -> Result<()> {
    let manager = Arc::new(ModelManager::new(envconfig::models_dir())?);

    if !envconfig::noprune() {
        // clean up unused layers and manifests
        manager.prune_layers()?;
        ModelManager::prune_directory(&manager.manifests_dir())?;
        fs::create_dir_all(manager.manifests_dir())?;
    }

    let factory: RunnerFactory = Arc::new(|work_dir, model, opts| -> BoxFuture<'static, Result<Box<dyn llm::Llm>>> {
        Box::pin(async move {
            llm::new_llm(&work_dir, &model.model_path, &model.adapter_paths, &opts).await
        })
    });
    let scheduler = Arc::new(Scheduler::new(factory, DEFAULT_SESSION_DURATION));

    let work_dir = tempfile::Builder::new().prefix("ollama").tempdir()?;

    let state = AppState {
        manager,
        scheduler: scheduler.clone(),
        work_dir: work_dir.path().to_path_buf(),
    };

    let app = router(state);

    let addr = envconfig::host();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {} (version {})", addr, env!("CARGO_PKG_VERSION"));

    // ctrl+c stops any loaded backend before the process goes away
    let scratch = work_dir.path().to_path_buf();
    tokio::spawn(async move {
        shutdown_signal().await;
        scheduler.shutdown().await;
        let _ = fs::remove_dir_all(&scratch);
        std::process::exit(0);
    });

    axum::serve(listener, app).await?;
    drop(work_dir);
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/generate", post(generate))
        .route("/api/chat", post(chat))
        .route("/api/embeddings", post(embeddings))
        .route("/api/pull", post(pull_model))
        .route("/api/push", post(push_model))
        .route("/api/create", post(create_model))
        .route("/api/copy", post(copy_model))
        .route("/api/delete", axum_delete(delete_model))
        .route("/api/show", post(show_model))
        .route("/api/tags", get(list_models))
        .route("/api/blobs/:digest", head(head_blob).post(create_blob))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/models", get(openai::list_models))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    let configured = envconfig::origins();
    CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            let Ok(origin) = origin.to_str() else { return false };
            if configured.iter().any(|o| o == origin) {
                return true;
            }
            let rest = origin
                .strip_prefix("http://")
                .or_else(|| origin.strip_prefix("https://"))
                .unwrap_or(origin);
            let host = rest.split(':').next().unwrap_or(rest);
            matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0")
        }))
}

async fn root() -> &'static str {
    "Ollama is running"
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn model_error(name: &str, err: anyhow::Error) -> Response {
    if is_not_found(&err) {
        error_json(
            StatusCode::NOT_FOUND,
            format!("model '{}' not found, try pulling it first", name),
        )
    } else {
        error_json(StatusCode::BAD_REQUEST, err.to_string())
    }
}

fn load_error(err: anyhow::Error) -> Response {
    if err.downcast_ref::<InvalidOption>().is_some() {
        error_json(StatusCode::BAD_REQUEST, err.to_string())
    } else {
        error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

/// Serializes a stream of events as newline-delimited JSON. If the very
/// first event is already an error, no bytes have been written yet and it
/// becomes a plain 500; errors after that close the stream with a final
/// `{"error": ...}` line.
async fn stream_response<T, S>(mut events: S) -> Response
where
    T: Serialize + Send + 'static,
    S: Stream<Item = StreamEvent<T>> + Send + Unpin + 'static,
{
    let first = match events.next().await {
        Some(StreamEvent::Error(message)) => {
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
        Some(event) => Some(event),
        None => None,
    };

    let body = futures::stream::iter(first)
        .chain(events)
        .map(|event| {
            let line = match event {
                StreamEvent::Record(record) => serde_json::to_string(&record)?,
                StreamEvent::Error(message) => serde_json::to_string(&json!({ "error": message }))?,
            };
            Ok::<Bytes, serde_json::Error>(Bytes::from(line + "\n"))
        });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(body))
        .expect("valid streaming response")
}

/// Non-stream fallback for progress operations: wait for the terminal
/// record.
async fn wait_for_stream<S>(mut events: S) -> Response
where
    S: Stream<Item = StreamEvent<ProgressResponse>> + Send + Unpin,
{
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Record(progress) if progress.status == "success" => {
                return (StatusCode::OK, Json(progress)).into_response()
            }
            StreamEvent::Record(_) => {}
            StreamEvent::Error(message) => {
                return error_json(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
    error_json(StatusCode::INTERNAL_SERVER_ERROR, "unexpected end of progress response")
}

pub(crate) enum GenerateOutcome {
    Warmup(GenerateResponse),
    Stream(mpsc::Receiver<StreamEvent<GenerateResponse>>),
}

/// Shared generate pipeline: acquire the session, ensure the backend, and
/// start the prediction. Used by `/api/generate` and the OpenAI surface.
pub(crate) async fn run_generate(state: &AppState, req: GenerateRequest) -> Result<GenerateOutcome, Response> {
    let checkpoint_start = Instant::now();

    let mut guard = state.scheduler.lock().await;

    let model = state
        .manager
        .get_model(&req.model)
        .map_err(|err| model_error(&req.model, err))?;

    state
        .scheduler
        .load(&mut guard, &state.work_dir, &model, &req.options)
        .await
        .map_err(load_error)?;

    // an empty request just loads the model
    if req.prompt.is_empty() && req.template.is_empty() && req.system.is_empty() {
        return Ok(GenerateOutcome::Warmup(GenerateResponse {
            model: req.model.clone(),
            created_at: Some(Utc::now()),
            done: true,
            ..Default::default()
        }));
    }

    let checkpoint_loaded = Instant::now();

    let mut prompt = String::new();
    let mut send_context = false;
    if req.raw {
        prompt = req.prompt.clone();
    } else if !req.prompt.is_empty() {
        prompt = prompt::from_request_params(&mut guard, &model, &req)
            .await
            .map_err(|err| error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
        send_context = true;
    }

    let predict = Predict {
        model_name: model.name.clone(),
        prompt,
        format: req.format.clone(),
        send_context,
        checkpoint_start,
        checkpoint_loaded,
        transform: None,
    };

    Ok(GenerateOutcome::Stream(predict.spawn(state.scheduler.clone(), guard)))
}

async fn generate(State(state): State<AppState>, Json(req): Json<GenerateRequest>) -> Response {
    if req.model.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "model is required");
    }
    if !req.format.is_empty() && req.format != "json" {
        return error_json(StatusCode::BAD_REQUEST, "format must be json");
    }
    if req.raw && (!req.context.is_empty() || !req.system.is_empty() || !req.template.is_empty()) {
        return error_json(
            StatusCode::BAD_REQUEST,
            "raw mode does not support template, system, or context",
        );
    }

    let non_stream = req.stream == Some(false);
    match run_generate(&state, req).await {
        Err(response) => response,
        Ok(GenerateOutcome::Warmup(response)) => Json(response).into_response(),
        Ok(GenerateOutcome::Stream(rx)) => {
            if non_stream {
                collect_generate(ReceiverStream::new(rx)).await
            } else {
                stream_response(ReceiverStream::new(rx)).await
            }
        }
    }
}

async fn collect_generate<S>(mut events: S) -> Response
where
    S: Stream<Item = StreamEvent<GenerateResponse>> + Send + Unpin,
{
    let mut generated = String::new();
    let mut last = None;

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Record(record) => {
                generated.push_str(&record.response);
                if record.done {
                    last = Some(record);
                }
            }
            StreamEvent::Error(message) => {
                return error_json(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }

    match last {
        Some(mut record) => {
            record.response = generated;
            Json(record).into_response()
        }
        None => error_json(StatusCode::INTERNAL_SERVER_ERROR, "unexpected end of response stream"),
    }
}

async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    let checkpoint_start = Instant::now();

    if req.model.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "model is required");
    }
    if !req.format.is_empty() && req.format != "json" {
        return error_json(StatusCode::BAD_REQUEST, "format must be json");
    }

    let mut guard = state.scheduler.lock().await;

    let model = match state.manager.get_model(&req.model) {
        Ok(model) => model,
        Err(err) => return model_error(&req.model, err),
    };

    if let Err(err) = state
        .scheduler
        .load(&mut guard, &state.work_dir, &model, &req.options)
        .await
    {
        return load_error(err);
    }

    // an empty request just loads the model
    if req.messages.is_empty() {
        return Json(GenerateResponse {
            model: req.model.clone(),
            created_at: Some(Utc::now()),
            done: true,
            ..Default::default()
        })
        .into_response();
    }

    let checkpoint_loaded = Instant::now();

    let prompt = match prompt::from_messages(&model, &req.messages) {
        Ok(prompt) => prompt,
        Err(err) => {
            let status = if err.downcast_ref::<InvalidRole>().is_some() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            return error_json(status, err.to_string());
        }
    };

    let predict = Predict {
        model_name: model.name.clone(),
        prompt,
        format: req.format.clone(),
        send_context: false,
        checkpoint_start,
        checkpoint_loaded,
        // move each token into the message field; the raw response text is
        // not sent for chat
        transform: Some(Box::new(|record: &mut GenerateResponse| {
            if !record.done {
                let content = std::mem::take(&mut record.response);
                record.message = Some(Message {
                    role: "assistant".to_string(),
                    content,
                });
            }
        })),
    };

    let rx = predict.spawn(state.scheduler.clone(), guard);

    if req.stream == Some(false) {
        collect_chat(ReceiverStream::new(rx)).await
    } else {
        stream_response(ReceiverStream::new(rx)).await
    }
}

async fn collect_chat<S>(mut events: S) -> Response
where
    S: Stream<Item = StreamEvent<GenerateResponse>> + Send + Unpin,
{
    let mut generated = String::new();
    let mut last = None;

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Record(record) => {
                if let Some(message) = &record.message {
                    generated.push_str(&message.content);
                }
                if record.done {
                    last = Some(record);
                }
            }
            StreamEvent::Error(message) => {
                return error_json(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }

    match last {
        Some(mut record) => {
            record.response = String::new();
            record.message = Some(Message {
                role: "assistant".to_string(),
                content: generated,
            });
            Json(record).into_response()
        }
        None => error_json(StatusCode::INTERNAL_SERVER_ERROR, "unexpected end of response stream"),
    }
}

async fn embeddings(State(state): State<AppState>, Json(req): Json<EmbeddingRequest>) -> Response {
    if req.model.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "model is required");
    }

    let mut guard = state.scheduler.lock().await;

    let model = match state.manager.get_model(&req.model) {
        Ok(model) => model,
        Err(err) => return model_error(&req.model, err),
    };

    if let Err(err) = state
        .scheduler
        .load(&mut guard, &state.work_dir, &model, &req.options)
        .await
    {
        return load_error(err);
    }

    let embedding_only = guard
        .options
        .as_ref()
        .map(|o| o.runner.embedding_only)
        .unwrap_or(false);
    if !embedding_only {
        return error_json(StatusCode::BAD_REQUEST, "embedding option must be set to true");
    }

    let runner = match guard.runner.as_mut() {
        Some(runner) => runner,
        None => return error_json(StatusCode::INTERNAL_SERVER_ERROR, "no model loaded"),
    };

    match runner.embedding(&req.prompt).await {
        Ok(embedding) => {
            state.scheduler.touch(&mut guard);
            Json(EmbeddingResponse { embedding }).into_response()
        }
        Err(err) => {
            error!(%err, "embedding generation failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to generate embedding")
        }
    }
}

async fn pull_model(State(state): State<AppState>, Json(req): Json<PullRequest>) -> Response {
    if req.name.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "name is required");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let manager = state.manager.clone();
    let name = req.name.clone();
    let insecure = req.insecure;

    tokio::spawn(async move {
        let progress_tx = tx.clone();
        let progress = move |p: ProgressResponse| {
            let _ = progress_tx.send(StreamEvent::Record(p));
        };

        let mut reg_opts = RegistryOptions { insecure, ..Default::default() };
        if let Err(err) = registry::pull_model(&manager, &name, &mut reg_opts, &progress).await {
            let _ = tx.send(StreamEvent::Error(err.to_string()));
        }
    });

    if req.stream == Some(false) {
        wait_for_stream(UnboundedReceiverStream::new(rx)).await
    } else {
        stream_response(UnboundedReceiverStream::new(rx)).await
    }
}

async fn push_model(State(state): State<AppState>, Json(req): Json<PushRequest>) -> Response {
    if req.name.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "name is required");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let manager = state.manager.clone();
    let name = req.name.clone();
    let insecure = req.insecure;

    tokio::spawn(async move {
        let progress_tx = tx.clone();
        let progress = move |p: ProgressResponse| {
            let _ = progress_tx.send(StreamEvent::Record(p));
        };

        let mut reg_opts = RegistryOptions { insecure, ..Default::default() };
        if let Err(err) = registry::push_model(&manager, &name, &mut reg_opts, &progress).await {
            let _ = tx.send(StreamEvent::Error(err.to_string()));
        }
    });

    if req.stream == Some(false) {
        wait_for_stream(UnboundedReceiverStream::new(rx)).await
    } else {
        stream_response(UnboundedReceiverStream::new(rx)).await
    }
}

async fn create_model(State(state): State<AppState>, Json(req): Json<CreateRequest>) -> Response {
    if req.name.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "name is required");
    }
    if req.path.is_empty() && req.modelfile.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "path or modelfile are required");
    }

    let modelfile = if req.modelfile.is_empty() {
        match fs::read_to_string(&req.path) {
            Ok(content) => content,
            Err(err) => {
                return error_json(StatusCode::BAD_REQUEST, format!("error reading modelfile: {}", err))
            }
        }
    } else {
        req.modelfile.clone()
    };

    let commands = match parser::parse(std::io::Cursor::new(modelfile)) {
        Ok(commands) => commands,
        Err(err) => return error_json(StatusCode::BAD_REQUEST, err.to_string()),
    };

    let modelfile_dir = PathBuf::from(&req.path)
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let (tx, rx) = mpsc::unbounded_channel();
    let manager = state.manager.clone();
    let name = req.name.clone();

    tokio::spawn(async move {
        let progress_tx = tx.clone();
        let progress = move |p: ProgressResponse| {
            let _ = progress_tx.send(StreamEvent::Record(p));
        };

        if let Err(err) = builder::create_model(&manager, &name, &modelfile_dir, &commands, &progress).await {
            let _ = tx.send(StreamEvent::Error(err.to_string()));
        }
    });

    if req.stream == Some(false) {
        wait_for_stream(UnboundedReceiverStream::new(rx)).await
    } else {
        stream_response(UnboundedReceiverStream::new(rx)).await
    }
}

async fn delete_model(State(state): State<AppState>, Json(req): Json<DeleteRequest>) -> Response {
    if req.name.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "name is required");
    }

    if let Err(err) = state.manager.delete_model(&req.name) {
        if is_not_found(&err) {
            return error_json(StatusCode::NOT_FOUND, format!("model '{}' not found", req.name));
        }
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }

    if let Err(err) = ModelManager::prune_directory(&state.manager.manifests_dir()) {
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }
    let _ = fs::create_dir_all(state.manager.manifests_dir());

    Json(serde_json::Value::Null).into_response()
}

async fn copy_model(State(state): State<AppState>, Json(req): Json<CopyRequest>) -> Response {
    if req.source.is_empty() || req.destination.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "source and destination are required");
    }

    match state.manager.copy_model(&req.source, &req.destination) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) if is_not_found(&err) => {
            error_json(StatusCode::NOT_FOUND, format!("model '{}' not found", req.source))
        }
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn show_model(State(state): State<AppState>, Json(req): Json<ShowRequest>) -> Response {
    if req.name.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "name is required");
    }

    match state.manager.model_info(&req.name) {
        Ok(info) => Json(info).into_response(),
        Err(err) if is_not_found(&err) => {
            error_json(StatusCode::NOT_FOUND, format!("model '{}' not found", req.name))
        }
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn list_models(State(state): State<AppState>) -> Response {
    match state.manager.list_models() {
        Ok(models) => Json(ListResponse { models }).into_response(),
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn head_blob(State(state): State<AppState>, UrlPath(digest): UrlPath<String>) -> Response {
    if state.manager.blob_path(&digest).exists() {
        StatusCode::OK.into_response()
    } else {
        error_json(StatusCode::NOT_FOUND, format!("blob {:?} not found", digest))
    }
}

/// Direct blob upload: the body is hashed as it streams in and rejected when
/// the digest disagrees, leaving nothing behind.
async fn create_blob(
    State(state): State<AppState>,
    UrlPath(digest): UrlPath<String>,
    body: Body,
) -> Response {
    let blobs_dir = state.manager.blobs_dir();
    let mut temp = match tempfile::Builder::new()
        .prefix("sha256-")
        .suffix("-partial")
        .tempfile_in(&blobs_dir)
    {
        Ok(temp) => temp,
        Err(err) => return error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };

    let mut hasher = Sha256::new();
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
        hasher.update(&chunk);
        if let Err(err) = temp.as_file_mut().write_all(&chunk) {
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    }

    let actual = format!("sha256:{:x}", hasher.finalize());
    if actual != digest {
        // temp file is dropped, and with it the partial upload
        return error_json(StatusCode::BAD_REQUEST, "digest does not match body");
    }

    match temp.persist(state.manager.blob_path(&digest)) {
        Ok(_) => StatusCode::CREATED.into_response(),
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Llm, PredictChunk, PredictRequest};
    use crate::options::Options;
    use async_trait::async_trait;
    use axum::http::Request;
    use sha2::Digest as _;
    use tower::ServiceExt;

    struct EchoLlm {
        tokens: Vec<String>,
    }

    #[async_trait]
    impl Llm for EchoLlm {
        async fn ping(&mut self) -> Result<()> {
            Ok(())
        }
        async fn set_options(&mut self, _opts: &Options) -> Result<()> {
            Ok(())
        }
        async fn predict(&mut self, _req: PredictRequest, tx: mpsc::Sender<PredictChunk>) -> Result<()> {
            for token in &self.tokens {
                let _ = tx
                    .send(PredictChunk { content: token.clone(), ..Default::default() })
                    .await;
            }
            let _ = tx.send(PredictChunk { done: true, ..Default::default() }).await;
            Ok(())
        }
        async fn encode(&mut self, text: &str) -> Result<Vec<i32>> {
            Ok(text.bytes().map(i32::from).collect())
        }
        async fn decode(&mut self, _tokens: &[i32]) -> Result<String> {
            Ok(String::new())
        }
        async fn embedding(&mut self, _prompt: &str) -> Result<Vec<f64>> {
            Ok(vec![0.5; 2])
        }
        async fn close(&mut self) {}
    }

    fn echo_state(root: &std::path::Path, tokens: Vec<String>) -> AppState {
        let factory: RunnerFactory = Arc::new(move |_work_dir, _model, _opts| -> BoxFuture<'static, Result<Box<dyn Llm>>> {
            let tokens = tokens.clone();
            Box::pin(async move { Ok(Box::new(EchoLlm { tokens }) as Box<dyn Llm>) })
        });

        AppState {
            manager: Arc::new(ModelManager::new(root).unwrap()),
            scheduler: Arc::new(Scheduler::new(factory, DEFAULT_SESSION_DURATION)),
            work_dir: root.to_path_buf(),
        }
    }

    fn write_stub_model(manager: &ModelManager, name: &str) {
        use crate::layers::{Layer, MEDIA_TYPE_MODEL, MEDIA_TYPE_TEMPLATE};
        use crate::modelpath::ModelPath;
        use std::io::Cursor;

        let blobs = manager.blobs_dir();
        let mut weights = Layer::new(&blobs, Cursor::new(b"GGUFstub".to_vec()), MEDIA_TYPE_MODEL).unwrap();
        weights.commit(&blobs).unwrap();
        let mut template = Layer::new(&blobs, Cursor::new(b"{{ .Prompt }}".to_vec()), MEDIA_TYPE_TEMPLATE).unwrap();
        template.commit(&blobs).unwrap();

        let diff_ids = vec![weights.digest.clone(), template.digest.clone()];
        let config = crate::models::ConfigV2 {
            rootfs: crate::models::RootFs { kind: "layers".to_string(), diff_ids },
            ..Default::default()
        };
        let mut config_layer = Layer::new(
            &blobs,
            Cursor::new(serde_json::to_vec(&config).unwrap()),
            crate::layers::MEDIA_TYPE_IMAGE_CONFIG,
        )
        .unwrap();
        config_layer.commit(&blobs).unwrap();

        manager
            .write_manifest(&ModelPath::parse(name), config_layer, vec![weights, template])
            .unwrap();
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn blob_upload_rejects_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let state = echo_state(dir.path(), vec![]);
        let app = router(state.clone());

        let bogus = format!("sha256:{}", "a".repeat(64));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/blobs/{}", bogus))
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!state.manager.blob_path(&bogus).exists());

        // nothing is left behind in the blobs directory
        let leftovers: Vec<_> = fs::read_dir(state.manager.blobs_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn blob_upload_then_head() {
        let dir = tempfile::tempdir().unwrap();
        let state = echo_state(dir.path(), vec![]);

        let content = b"blob content";
        let digest = format!("sha256:{:x}", sha2::Sha256::digest(content));

        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/blobs/{}", digest))
                    .body(Body::from(content.to_vec()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .method("HEAD")
                    .uri(format!("/api/blobs/{}", digest))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn warmup_generate_returns_done() {
        let dir = tempfile::tempdir().unwrap();
        let state = echo_state(dir.path(), vec![]);
        write_stub_model(&state.manager, "m");

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/generate")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model":"m","prompt":""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["model"], "m");
        assert_eq!(value["done"], true);
        assert!(value["created_at"].is_string());
    }

    #[tokio::test]
    async fn chat_non_stream_accumulates_message() {
        let dir = tempfile::tempdir().unwrap();
        let state = echo_state(dir.path(), vec!["hel".to_string(), "lo".to_string()]);
        write_stub_model(&state.manager, "m");

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"model":"m","messages":[{"role":"user","content":"hi"}],"stream":false}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["message"]["role"], "assistant");
        assert_eq!(value["message"]["content"], "hello");
        assert_eq!(value["done"], true);
    }

    #[tokio::test]
    async fn generate_unknown_model_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = echo_state(dir.path(), vec![]);

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/generate")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model":"missing","prompt":"hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value = body_json(response).await;
        assert!(value["error"].as_str().unwrap().contains("try pulling it first"));
    }

    #[tokio::test]
    async fn raw_mode_validation() {
        let dir = tempfile::tempdir().unwrap();
        let state = echo_state(dir.path(), vec![]);

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/generate")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model":"m","prompt":"p","raw":true,"system":"s"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tags_lists_models() {
        let dir = tempfile::tempdir().unwrap();
        let state = echo_state(dir.path(), vec![]);
        write_stub_model(&state.manager, "listed");

        let response = router(state)
            .oneshot(Request::builder().uri("/api/tags").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["models"][0]["name"], "listed:latest");
        assert!(value["models"][0]["size"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn embeddings_require_embedding_only() {
        let dir = tempfile::tempdir().unwrap();
        let state = echo_state(dir.path(), vec![]);
        write_stub_model(&state.manager, "m");

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/embeddings")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model":"m","prompt":"embed this"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = body_json(response).await;
        assert_eq!(value["error"], "embedding option must be set to true");
    }

    #[tokio::test]
    async fn embeddings_with_option_set() {
        let dir = tempfile::tempdir().unwrap();
        let state = echo_state(dir.path(), vec![]);
        write_stub_model(&state.manager, "m");

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/embeddings")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"model":"m","prompt":"embed this","options":{"embedding_only":true}}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["embedding"].as_array().unwrap().len(), 2);
    }
}
