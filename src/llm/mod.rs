use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::debug;

use crate::envconfig;
use crate::options::Options;

#[derive(Debug, Clone)]
pub struct PredictRequest {
    pub prompt: String,
    pub format: String,
}

/// One increment of backend output. `done` carries the final token counts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PredictChunk {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub done: bool,
    pub prompt_eval_count: Option<i64>,
    pub prompt_eval_duration: Option<i64>,
    pub eval_count: Option<i64>,
    pub eval_duration: Option<i64>,
}

/// The backend inference process, treated as an opaque LLM capability.
///
/// `predict` pushes chunks into `tx` (capacity 1, so the producer
/// backpressures on the consumer) and must abort generation promptly when the
/// receiver hangs up.
#[async_trait]
pub trait Llm: Send {
    async fn ping(&mut self) -> Result<()>;
    async fn set_options(&mut self, opts: &Options) -> Result<()>;
    async fn predict(&mut self, req: PredictRequest, tx: mpsc::Sender<PredictChunk>) -> Result<()>;
    async fn encode(&mut self, text: &str) -> Result<Vec<i32>>;
    async fn decode(&mut self, tokens: &[i32]) -> Result<String>;
    async fn embedding(&mut self, prompt: &str) -> Result<Vec<f64>>;
    async fn close(&mut self);
}

/// Spawns the configured backend binary for `model_path` and hands back the
/// trait object the session manager owns.
pub async fn new_llm(
    work_dir: &Path,
    model_path: &str,
    adapter_paths: &[String],
    opts: &Options,
) -> Result<Box<dyn Llm>> {
    let runner = SubprocessRunner::spawn(work_dir, model_path, adapter_paths, opts).await?;
    Ok(Box::new(runner))
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RunnerCommand<'a> {
    Load {
        model: &'a str,
        adapters: &'a [String],
        options: &'a Options,
    },
    Options { options: &'a Options },
    Ping,
    Predict { prompt: &'a str, format: &'a str },
    Cancel,
    Encode { text: &'a str },
    Decode { tokens: &'a [i32] },
    Embedding { prompt: &'a str },
    Shutdown,
}

#[derive(Debug, Default, Deserialize)]
struct RunnerReply {
    #[serde(default)]
    ok: bool,
    error: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    done: bool,
    tokens: Option<Vec<i32>>,
    text: Option<String>,
    embedding: Option<Vec<f64>>,
    prompt_eval_count: Option<i64>,
    prompt_eval_duration: Option<i64>,
    eval_count: Option<i64>,
    eval_duration: Option<i64>,
}

/// Child-process backend speaking newline-delimited JSON over stdio.
pub struct SubprocessRunner {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl SubprocessRunner {
    pub async fn spawn(
        work_dir: &Path,
        model_path: &str,
        adapter_paths: &[String],
        opts: &Options,
    ) -> Result<SubprocessRunner> {
        let bin = envconfig::runner_bin();
        debug!(%bin, model = model_path, "spawning backend runner");

        let mut child = Command::new(&bin)
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning backend runner {}", bin))?;

        let stdin = child.stdin.take().context("backend runner has no stdin")?;
        let stdout = child.stdout.take().context("backend runner has no stdout")?;

        let mut runner = SubprocessRunner {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };

        runner
            .send(&RunnerCommand::Load {
                model: model_path,
                adapters: adapter_paths,
                options: opts,
            })
            .await?;

        let reply = runner.recv().await?;
        if let Some(err) = reply.error {
            // the session manager turns "failed to load model" into a
            // compatibility hint for the client
            bail!("{}", err);
        }

        Ok(runner)
    }

    async fn send(&mut self, cmd: &RunnerCommand<'_>) -> Result<()> {
        let mut line = serde_json::to_string(cmd)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<RunnerReply> {
        match self.stdout.next_line().await? {
            Some(line) => Ok(serde_json::from_str(&line)
                .with_context(|| format!("malformed backend reply: {}", line))?),
            None => bail!("backend runner closed its output stream"),
        }
    }

    async fn round_trip(&mut self, cmd: RunnerCommand<'_>) -> Result<RunnerReply> {
        self.send(&cmd).await?;
        let reply = self.recv().await?;
        if let Some(err) = reply.error {
            bail!("{}", err);
        }
        Ok(reply)
    }
}

#[async_trait]
impl Llm for SubprocessRunner {
    async fn ping(&mut self) -> Result<()> {
        let reply = self.round_trip(RunnerCommand::Ping).await?;
        if !reply.ok {
            bail!("backend runner did not acknowledge ping");
        }
        Ok(())
    }

    async fn set_options(&mut self, opts: &Options) -> Result<()> {
        self.round_trip(RunnerCommand::Options { options: opts }).await?;
        Ok(())
    }

    async fn predict(&mut self, req: PredictRequest, tx: mpsc::Sender<PredictChunk>) -> Result<()> {
        self.send(&RunnerCommand::Predict {
            prompt: &req.prompt,
            format: &req.format,
        })
        .await?;

        let mut cancelled = false;
        loop {
            let reply = self.recv().await?;
            if let Some(err) = reply.error {
                bail!("{}", err);
            }

            let done = reply.done;
            if !cancelled {
                let chunk = PredictChunk {
                    content: reply.content,
                    done,
                    prompt_eval_count: reply.prompt_eval_count,
                    prompt_eval_duration: reply.prompt_eval_duration,
                    eval_count: reply.eval_count,
                    eval_duration: reply.eval_duration,
                };
                if tx.send(chunk).await.is_err() {
                    // consumer hung up; tell the backend to stop, then drain
                    // until it acknowledges with done
                    cancelled = true;
                    self.send(&RunnerCommand::Cancel).await?;
                }
            }

            if done {
                break;
            }
        }

        Ok(())
    }

    async fn encode(&mut self, text: &str) -> Result<Vec<i32>> {
        let reply = self.round_trip(RunnerCommand::Encode { text }).await?;
        reply.tokens.context("backend runner returned no tokens")
    }

    async fn decode(&mut self, tokens: &[i32]) -> Result<String> {
        let reply = self.round_trip(RunnerCommand::Decode { tokens }).await?;
        reply.text.context("backend runner returned no text")
    }

    async fn embedding(&mut self, prompt: &str) -> Result<Vec<f64>> {
        let reply = self.round_trip(RunnerCommand::Embedding { prompt }).await?;
        reply.embedding.context("backend runner returned no embedding")
    }

    async fn close(&mut self) {
        let _ = self.send(&RunnerCommand::Shutdown).await;
        let _ = self.child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_serialize_with_op_tags() {
        let cmd = RunnerCommand::Predict { prompt: "hi", format: "json" };
        let line = serde_json::to_string(&cmd).unwrap();
        assert_eq!(line, r#"{"op":"predict","prompt":"hi","format":"json"}"#);

        let cmd = RunnerCommand::Ping;
        assert_eq!(serde_json::to_string(&cmd).unwrap(), r#"{"op":"ping"}"#);
    }

    #[test]
    fn replies_tolerate_missing_fields() {
        let reply: RunnerReply = serde_json::from_str(r#"{"content":"tok"}"#).unwrap();
        assert_eq!(reply.content, "tok");
        assert!(!reply.done);
        assert!(reply.error.is_none());

        let reply: RunnerReply =
            serde_json::from_str(r#"{"done":true,"eval_count":7,"eval_duration":123}"#).unwrap();
        assert!(reply.done);
        assert_eq!(reply.eval_count, Some(7));
    }
}
