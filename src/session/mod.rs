use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::info;

use crate::api::{GenerateResponse, StreamEvent};
use crate::llm::{Llm, PredictChunk, PredictRequest};
use crate::models::Model;
use crate::options::Options;

pub const DEFAULT_SESSION_DURATION: Duration = Duration::from_secs(5 * 60);

/// Produces a backend for a model. Injected so tests can count spawns and
/// closes with a stub.
pub type RunnerFactory =
    Arc<dyn Fn(PathBuf, Model, Options) -> BoxFuture<'static, Result<Box<dyn Llm>>> + Send + Sync>;

/// The singleton slot. At most one backend is alive; `runner`, `model` and
/// `options` are all set or all cleared together.
#[derive(Default)]
pub struct Loaded {
    pub runner: Option<Box<dyn Llm>>,
    pub model: Option<Model>,
    pub options: Option<Options>,
    pub expire_at: Option<Instant>,
    timer_armed: bool,
}

/// Owns the loaded-backend slot and serializes every generate, chat and
/// embedding call through one mutex. Handlers hold the guard for the entire
/// request, including backend streaming.
pub struct Scheduler {
    slot: Arc<Mutex<Loaded>>,
    session_duration: Duration,
    factory: RunnerFactory,
}

impl Scheduler {
    pub fn new(factory: RunnerFactory, session_duration: Duration) -> Scheduler {
        Scheduler {
            slot: Arc::new(Mutex::new(Loaded::default())),
            session_duration,
            factory,
        }
    }

    pub fn session_duration(&self) -> Duration {
        self.session_duration
    }

    pub async fn lock(&self) -> OwnedMutexGuard<Loaded> {
        self.slot.clone().lock_owned().await
    }

    /// Ensures the right backend is loaded for `model`, reloading only when
    /// it must: a dead process, a different model path, a different adapter
    /// list, or changed runner options. Sampling-only changes are pushed to
    /// the live backend.
    pub async fn load(
        &self,
        loaded: &mut Loaded,
        work_dir: &Path,
        model: &Model,
        req_opts: &HashMap<String, Value>,
    ) -> Result<()> {
        let mut opts = Options::default();
        opts.from_map(&model.options)?;
        opts.from_map(req_opts)?;

        if let Some(runner) = loaded.runner.as_mut() {
            if runner.ping().await.is_err() {
                info!("loaded backend process not responding, closing now");
                if let Some(mut dead) = loaded.runner.take() {
                    dead.close().await;
                }
                loaded.model = None;
                loaded.options = None;
            }
        }

        let need_load = loaded.runner.is_none()
            || loaded
                .model
                .as_ref()
                .map(|m| m.model_path != model.model_path || m.adapter_paths != model.adapter_paths)
                .unwrap_or(true)
            || loaded
                .options
                .as_ref()
                .map(|o| o.runner != opts.runner)
                .unwrap_or(true);

        if need_load {
            if loaded.runner.is_some() {
                info!("changing loaded model");
                if let Some(mut old) = loaded.runner.take() {
                    old.close().await;
                }
                loaded.model = None;
                loaded.options = None;
            }

            let runner = (self.factory)(work_dir.to_path_buf(), model.clone(), opts.clone())
                .await
                .map_err(|err| annotate_load_error(err, &model.short_name))?;

            loaded.runner = Some(runner);
            loaded.model = Some(model.clone());
            loaded.options = Some(opts.clone());
        }

        if let Some(runner) = loaded.runner.as_mut() {
            runner.set_options(&opts).await?;
        }
        loaded.options = Some(opts);

        self.touch(loaded);
        Ok(())
    }

    /// Pushes the idle deadline out and arms the expiry task if it isn't
    /// already watching the slot.
    pub fn touch(&self, loaded: &mut Loaded) {
        loaded.expire_at = Some(Instant::now() + self.session_duration);

        if !loaded.timer_armed {
            loaded.timer_armed = true;
            tokio::spawn(expiry_loop(self.slot.clone()));
        }
    }

    /// Closes the loaded backend, if any. Used on shutdown signals.
    pub async fn shutdown(&self) {
        let mut loaded = self.slot.lock().await;
        if let Some(mut runner) = loaded.runner.take() {
            runner.close().await;
        }
        loaded.model = None;
        loaded.options = None;
        loaded.expire_at = None;
    }
}

fn annotate_load_error(err: anyhow::Error, short_name: &str) -> anyhow::Error {
    // older models predate the current backend; suggest a re-pull
    if err.to_string().contains("failed to load model") {
        anyhow!(
            "{}: this model may be incompatible with your version of Ollama. If you previously pulled this model, try updating it by running `ollama pull {}`",
            err,
            short_name
        )
    } else {
        err
    }
}

/// Sleeps until the slot's deadline, then re-checks it under the mutex: a
/// request that refreshed `expire_at` in the meantime wins and the loop goes
/// back to sleep.
async fn expiry_loop(slot: Arc<Mutex<Loaded>>) {
    loop {
        let deadline = {
            let mut loaded = slot.lock().await;
            if loaded.runner.is_none() {
                loaded.timer_armed = false;
                return;
            }
            match loaded.expire_at {
                Some(at) => at,
                None => {
                    loaded.timer_armed = false;
                    return;
                }
            }
        };

        tokio::time::sleep_until(deadline).await;

        let mut loaded = slot.lock().await;
        let expired = loaded.expire_at.map(|at| Instant::now() >= at).unwrap_or(true);
        if !expired {
            continue;
        }

        if let Some(mut runner) = loaded.runner.take() {
            info!("session idle deadline reached, closing backend");
            runner.close().await;
        }
        loaded.model = None;
        loaded.options = None;
        loaded.expire_at = None;
        loaded.timer_armed = false;
        return;
    }
}

/// One generation being driven through the loaded backend.
pub struct Predict {
    pub model_name: String,
    pub prompt: String,
    pub format: String,
    pub send_context: bool,
    pub checkpoint_start: Instant,
    pub checkpoint_loaded: Instant,
    /// Handler-specific rewrite of each outgoing record (chat moves the text
    /// into `message`).
    pub transform: Option<Box<dyn FnMut(&mut GenerateResponse) + Send>>,
}

impl Predict {
    /// Runs the generation on its own task, which holds the session guard
    /// until the backend finishes or the client goes away. Records arrive on
    /// the returned channel in generation order.
    pub fn spawn(
        self,
        scheduler: Arc<Scheduler>,
        guard: OwnedMutexGuard<Loaded>,
    ) -> mpsc::Receiver<StreamEvent<GenerateResponse>> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(self.run(scheduler, guard, tx));
        rx
    }

    async fn run(
        mut self,
        scheduler: Arc<Scheduler>,
        mut guard: OwnedMutexGuard<Loaded>,
        tx: mpsc::Sender<StreamEvent<GenerateResponse>>,
    ) {
        let mut runner = match guard.runner.take() {
            Some(r) => r,
            None => {
                let _ = tx.send(StreamEvent::Error("no model loaded".to_string())).await;
                return;
            }
        };

        let session_duration = scheduler.session_duration;
        let result = self.drive(&mut runner, &mut guard, &tx, session_duration).await;

        guard.runner = Some(runner);
        scheduler.touch(&mut guard);

        if let Err(err) = result {
            let _ = tx.send(StreamEvent::Error(err.to_string())).await;
        }
    }

    async fn drive(
        &mut self,
        runner: &mut Box<dyn Llm>,
        loaded: &mut Loaded,
        tx: &mpsc::Sender<StreamEvent<GenerateResponse>>,
        session_duration: Duration,
    ) -> Result<()> {
        let (ptx, mut prx) = mpsc::channel::<PredictChunk>(1);
        let mut generated = String::new();
        let mut final_chunk: Option<PredictChunk> = None;
        let mut client_gone = false;

        {
            let fut = runner.predict(
                PredictRequest {
                    prompt: self.prompt.clone(),
                    format: self.format.clone(),
                },
                ptx,
            );
            tokio::pin!(fut);
            let mut fut_res: Option<Result<()>> = None;

            loop {
                tokio::select! {
                    res = &mut fut, if fut_res.is_none() => {
                        fut_res = Some(res);
                    }
                    chunk = prx.recv() => match chunk {
                        Some(chunk) => {
                            generated.push_str(&chunk.content);
                            loaded.expire_at = Some(Instant::now() + session_duration);

                            if chunk.done {
                                final_chunk = Some(chunk);
                                continue;
                            }

                            if client_gone {
                                continue;
                            }

                            let mut record = GenerateResponse {
                                model: self.model_name.clone(),
                                created_at: Some(Utc::now()),
                                response: chunk.content,
                                done: false,
                                ..Default::default()
                            };
                            if let Some(transform) = self.transform.as_mut() {
                                transform(&mut record);
                            }

                            if tx.send(StreamEvent::Record(record)).await.is_err() {
                                // client disconnected mid-stream; closing our
                                // end makes the backend abort generation
                                client_gone = true;
                                prx.close();
                            }
                        }
                        None => break,
                    }
                }
            }

            match fut_res {
                Some(Err(err)) => return Err(err),
                _ => {}
            }
        }

        if client_gone {
            return Ok(());
        }

        let chunk = final_chunk.unwrap_or_default();
        let mut record = GenerateResponse {
            model: self.model_name.clone(),
            created_at: Some(Utc::now()),
            response: chunk.content,
            done: true,
            total_duration: Some(duration_nanos(self.checkpoint_start.elapsed())),
            load_duration: Some(duration_nanos(
                self.checkpoint_loaded.duration_since(self.checkpoint_start),
            )),
            prompt_eval_count: chunk.prompt_eval_count,
            prompt_eval_duration: chunk.prompt_eval_duration,
            eval_count: chunk.eval_count,
            eval_duration: chunk.eval_duration,
            ..Default::default()
        };

        if self.send_context {
            let text = format!("{}{}", self.prompt, generated);
            record.context = Some(runner.encode(&text).await?);
        }

        if let Some(transform) = self.transform.as_mut() {
            transform(&mut record);
        }

        loaded.expire_at = Some(Instant::now() + session_duration);
        let _ = tx.send(StreamEvent::Record(record)).await;
        Ok(())
    }
}

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubCounters {
        spawns: AtomicUsize,
        closes: AtomicUsize,
        in_predict: AtomicBool,
        reentered: AtomicBool,
    }

    struct StubLlm {
        counters: Arc<StubCounters>,
        tokens: Vec<String>,
        alive: bool,
    }

    #[async_trait]
    impl Llm for StubLlm {
        async fn ping(&mut self) -> Result<()> {
            if self.alive {
                Ok(())
            } else {
                anyhow::bail!("dead")
            }
        }

        async fn set_options(&mut self, _opts: &Options) -> Result<()> {
            Ok(())
        }

        async fn predict(&mut self, _req: PredictRequest, tx: mpsc::Sender<PredictChunk>) -> Result<()> {
            if self.counters.in_predict.swap(true, Ordering::SeqCst) {
                self.counters.reentered.store(true, Ordering::SeqCst);
            }

            for token in &self.tokens {
                tokio::task::yield_now().await;
                let _ = tx
                    .send(PredictChunk {
                        content: token.clone(),
                        ..Default::default()
                    })
                    .await;
            }
            let _ = tx
                .send(PredictChunk {
                    done: true,
                    eval_count: Some(self.tokens.len() as i64),
                    ..Default::default()
                })
                .await;

            self.counters.in_predict.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn encode(&mut self, text: &str) -> Result<Vec<i32>> {
            Ok(text.bytes().map(i32::from).collect())
        }

        async fn decode(&mut self, tokens: &[i32]) -> Result<String> {
            Ok(tokens.iter().map(|t| (*t as u8) as char).collect())
        }

        async fn embedding(&mut self, _prompt: &str) -> Result<Vec<f64>> {
            Ok(vec![0.0; 4])
        }

        async fn close(&mut self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stub_factory(counters: Arc<StubCounters>, tokens: Vec<String>) -> RunnerFactory {
        Arc::new(move |_work_dir, _model, _opts| -> BoxFuture<'static, Result<Box<dyn Llm>>> {
            counters.spawns.fetch_add(1, Ordering::SeqCst);
            let llm = StubLlm {
                counters: counters.clone(),
                tokens: tokens.clone(),
                alive: true,
            };
            Box::pin(async move { Ok(Box::new(llm) as Box<dyn Llm>) })
        })
    }

    fn test_model(adapters: &[&str]) -> Model {
        Model {
            name: "registry.ollama.ai/library/stub:latest".to_string(),
            short_name: "stub:latest".to_string(),
            model_path: "/tmp/stub.gguf".to_string(),
            adapter_paths: adapters.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn load_for(scheduler: &Scheduler, model: &Model) {
        let mut guard = scheduler.lock().await;
        scheduler
            .load(&mut guard, Path::new("/tmp"), model, &HashMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reload_only_when_adapters_change() {
        let counters = Arc::new(StubCounters::default());
        let scheduler = Scheduler::new(stub_factory(counters.clone(), vec![]), DEFAULT_SESSION_DURATION);

        load_for(&scheduler, &test_model(&[])).await;
        load_for(&scheduler, &test_model(&["/tmp/a.bin"])).await;
        load_for(&scheduler, &test_model(&["/tmp/a.bin"])).await;

        assert_eq!(counters.spawns.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sampling_only_change_skips_reload() {
        let counters = Arc::new(StubCounters::default());
        let scheduler = Scheduler::new(stub_factory(counters.clone(), vec![]), DEFAULT_SESSION_DURATION);

        let model = test_model(&[]);
        load_for(&scheduler, &model).await;

        let mut opts = HashMap::new();
        opts.insert("temperature".to_string(), Value::from(0.2));
        let mut guard = scheduler.lock().await;
        scheduler.load(&mut guard, Path::new("/tmp"), &model, &opts).await.unwrap();
        drop(guard);

        assert_eq!(counters.spawns.load(Ordering::SeqCst), 1);

        // a runner option forces the reload
        let mut opts = HashMap::new();
        opts.insert("num_ctx".to_string(), Value::from(8192));
        let mut guard = scheduler.lock().await;
        scheduler.load(&mut guard, Path::new("/tmp"), &model, &opts).await.unwrap();
        drop(guard);

        assert_eq!(counters.spawns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_expiry_closes_backend_once() {
        let counters = Arc::new(StubCounters::default());
        let scheduler = Scheduler::new(stub_factory(counters.clone(), vec![]), Duration::from_millis(100));

        load_for(&scheduler, &test_model(&[])).await;

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        let guard = scheduler.lock().await;
        assert!(guard.runner.is_none());
        assert!(guard.model.is_none());
        assert!(guard.options.is_none());
        assert!(guard.expire_at.is_none());
    }

    #[tokio::test]
    async fn request_refresh_beats_expiry_timer() {
        let counters = Arc::new(StubCounters::default());
        let scheduler = Arc::new(Scheduler::new(
            stub_factory(counters.clone(), vec![]),
            Duration::from_millis(150),
        ));

        load_for(&scheduler, &test_model(&[])).await;

        // keep touching before the deadline; the timer must keep yielding
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            let mut guard = scheduler.lock().await;
            scheduler.touch(&mut guard);
        }
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn predict_streams_in_order_and_finishes() {
        let counters = Arc::new(StubCounters::default());
        let scheduler = Arc::new(Scheduler::new(
            stub_factory(counters.clone(), vec!["hel".to_string(), "lo".to_string()]),
            DEFAULT_SESSION_DURATION,
        ));

        load_for(&scheduler, &test_model(&[])).await;

        let guard = scheduler.lock().await;
        let start = Instant::now();
        let predict = Predict {
            model_name: "stub:latest".to_string(),
            prompt: "hi".to_string(),
            format: String::new(),
            send_context: true,
            checkpoint_start: start,
            checkpoint_loaded: start,
            transform: None,
        };

        let mut rx = predict.spawn(scheduler.clone(), guard);

        let mut pieces = Vec::new();
        let mut last = None;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Record(r) => {
                    if r.done {
                        last = Some(r);
                    } else {
                        pieces.push(r.response);
                    }
                }
                StreamEvent::Error(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(pieces, vec!["hel".to_string(), "lo".to_string()]);
        let last = last.expect("done record");
        assert_eq!(last.eval_count, Some(2));
        assert!(last.total_duration.is_some());
        // context is prompt + generated re-encoded
        assert_eq!(last.context.as_ref().map(|c| c.len()), Some("hihello".len()));

        // the runner went back into the slot
        let guard = scheduler.lock().await;
        assert!(guard.runner.is_some());
    }

    #[tokio::test]
    async fn concurrent_generations_never_reenter_predict() {
        let counters = Arc::new(StubCounters::default());
        let scheduler = Arc::new(Scheduler::new(
            stub_factory(counters.clone(), vec!["x".to_string(), "y".to_string()]),
            DEFAULT_SESSION_DURATION,
        ));

        let model = test_model(&[]);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let scheduler = scheduler.clone();
            let model = model.clone();
            handles.push(tokio::spawn(async move {
                let mut guard = scheduler.lock().await;
                scheduler
                    .load(&mut guard, Path::new("/tmp"), &model, &HashMap::new())
                    .await
                    .unwrap();
                let start = Instant::now();
                let predict = Predict {
                    model_name: model.short_name.clone(),
                    prompt: "go".to_string(),
                    format: String::new(),
                    send_context: false,
                    checkpoint_start: start,
                    checkpoint_loaded: start,
                    transform: None,
                };
                let mut rx = predict.spawn(scheduler.clone(), guard);
                while rx.recv().await.is_some() {}
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(!counters.reentered.load(Ordering::SeqCst));
        assert_eq!(counters.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_backend_is_discarded_and_respawned() {
        let counters = Arc::new(StubCounters::default());
        let factory_counters = counters.clone();
        let factory: RunnerFactory = Arc::new(move |_work_dir, _model, _opts| -> BoxFuture<'static, Result<Box<dyn Llm>>> {
            let n = factory_counters.spawns.fetch_add(1, Ordering::SeqCst);
            let llm = StubLlm {
                counters: factory_counters.clone(),
                tokens: vec![],
                // first backend is born dead
                alive: n > 0,
            };
            Box::pin(async move { Ok(Box::new(llm) as Box<dyn Llm>) })
        });
        let scheduler = Scheduler::new(factory, DEFAULT_SESSION_DURATION);

        let model = test_model(&[]);
        load_for(&scheduler, &model).await;
        load_for(&scheduler, &model).await;

        // second load pinged the dead backend, closed it, spawned a fresh one
        assert_eq!(counters.spawns.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }
}
