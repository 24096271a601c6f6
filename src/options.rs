use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
#[error("invalid option: {0}")]
pub struct InvalidOption(pub String);

/// Options that require a backend restart when they change. Everything else
/// can be pushed to a live backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerOptions {
    #[serde(rename = "numa")]
    pub use_numa: bool,
    pub num_ctx: i64,
    pub num_batch: i64,
    pub num_gqa: i64,
    pub num_gpu: i64,
    pub main_gpu: i64,
    pub low_vram: bool,
    pub f16_kv: bool,
    pub logits_all: bool,
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub embedding_only: bool,
    pub rope_frequency_base: f64,
    pub rope_frequency_scale: f64,
    pub num_thread: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    #[serde(flatten)]
    pub runner: RunnerOptions,

    pub num_keep: i64,
    pub seed: i64,
    pub num_predict: i64,
    pub top_k: i64,
    pub top_p: f64,
    pub tfs_z: f64,
    pub typical_p: f64,
    pub repeat_last_n: i64,
    pub temperature: f64,
    pub repeat_penalty: f64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
    pub mirostat: i64,
    pub mirostat_tau: f64,
    pub mirostat_eta: f64,
    pub penalize_newline: bool,
    pub stop: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            runner: RunnerOptions {
                use_numa: false,
                num_ctx: 2048,
                num_batch: 512,
                num_gqa: 1,
                num_gpu: -1,
                main_gpu: 0,
                low_vram: false,
                f16_kv: true,
                logits_all: false,
                vocab_only: false,
                use_mmap: true,
                use_mlock: false,
                embedding_only: false,
                rope_frequency_base: 10000.0,
                rope_frequency_scale: 1.0,
                num_thread: 0,
            },
            num_keep: -1,
            seed: -1,
            num_predict: 128,
            top_k: 40,
            top_p: 0.9,
            tfs_z: 1.0,
            typical_p: 1.0,
            repeat_last_n: 64,
            temperature: 0.8,
            repeat_penalty: 1.1,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_newline: true,
            stop: Vec::new(),
        }
    }
}

impl Options {
    /// Overlays the known keys of `map` onto self. Unknown keys are ignored;
    /// a value of the wrong shape is a client error.
    pub fn from_map(&mut self, map: &HashMap<String, Value>) -> Result<()> {
        if map.is_empty() {
            return Ok(());
        }

        let mut merged = serde_json::to_value(&*self)?;
        let obj = merged.as_object_mut().expect("options serialize to an object");

        for (key, value) in map {
            let kind = match option_kind(key) {
                Some(k) => k,
                None => continue,
            };
            if !kind.accepts(value) {
                bail!(InvalidOption(format!("{} expects a {}", key, kind.name())));
            }
            let mut value = value.clone();
            if kind == OptionKind::StringSlice {
                if let Value::String(s) = &value {
                    value = Value::Array(vec![Value::String(s.clone())]);
                }
            }
            obj.insert(key.clone(), value);
        }

        *self = serde_json::from_value(merged)
            .map_err(|e| InvalidOption(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Float,
    Int,
    Bool,
    String,
    StringSlice,
}

impl OptionKind {
    fn name(self) -> &'static str {
        match self {
            OptionKind::Float => "number",
            OptionKind::Int => "integer",
            OptionKind::Bool => "boolean",
            OptionKind::String => "string",
            OptionKind::StringSlice => "array of strings",
        }
    }

    fn accepts(self, v: &Value) -> bool {
        match self {
            OptionKind::Float => v.is_number(),
            OptionKind::Int => v.as_i64().is_some(),
            OptionKind::Bool => v.is_boolean(),
            OptionKind::String => v.is_string(),
            OptionKind::StringSlice => {
                v.as_array().map(|a| a.iter().all(Value::is_string)).unwrap_or(false)
                    || v.is_string()
            }
        }
    }
}

/// Every valid option key and its wire type. This table is the single source
/// of truth for parameter coercion.
pub const OPTION_SCHEMA: &[(&str, OptionKind)] = &[
    ("numa", OptionKind::Bool),
    ("num_ctx", OptionKind::Int),
    ("num_batch", OptionKind::Int),
    ("num_gqa", OptionKind::Int),
    ("num_gpu", OptionKind::Int),
    ("main_gpu", OptionKind::Int),
    ("low_vram", OptionKind::Bool),
    ("f16_kv", OptionKind::Bool),
    ("logits_all", OptionKind::Bool),
    ("vocab_only", OptionKind::Bool),
    ("use_mmap", OptionKind::Bool),
    ("use_mlock", OptionKind::Bool),
    ("embedding_only", OptionKind::Bool),
    ("rope_frequency_base", OptionKind::Float),
    ("rope_frequency_scale", OptionKind::Float),
    ("num_thread", OptionKind::Int),
    ("num_keep", OptionKind::Int),
    ("seed", OptionKind::Int),
    ("num_predict", OptionKind::Int),
    ("top_k", OptionKind::Int),
    ("top_p", OptionKind::Float),
    ("tfs_z", OptionKind::Float),
    ("typical_p", OptionKind::Float),
    ("repeat_last_n", OptionKind::Int),
    ("temperature", OptionKind::Float),
    ("repeat_penalty", OptionKind::Float),
    ("presence_penalty", OptionKind::Float),
    ("frequency_penalty", OptionKind::Float),
    ("mirostat", OptionKind::Int),
    ("mirostat_tau", OptionKind::Float),
    ("mirostat_eta", OptionKind::Float),
    ("penalize_newline", OptionKind::Bool),
    ("stop", OptionKind::StringSlice),
];

pub fn option_kind(key: &str) -> Option<OptionKind> {
    OPTION_SCHEMA.iter().find(|(k, _)| *k == key).map(|(_, kind)| *kind)
}

/// Coerces raw `PARAMETER key value` strings to their typed form for the
/// params layer. Repeated keys accumulate only for slice-typed options;
/// otherwise the first value wins. Unknown keys are dropped.
pub fn format_params(params: &HashMap<String, Vec<String>>) -> Result<Map<String, Value>> {
    let mut out = Map::new();

    for (key, vals) in params {
        let kind = match option_kind(key) {
            Some(k) => k,
            None => continue,
        };
        let first = vals.first().map(String::as_str).unwrap_or("");

        let value = match kind {
            OptionKind::Float => {
                let f: f64 = first.parse().map_err(|_| anyhow::anyhow!("invalid float value {:?}", vals))?;
                Value::from(f)
            }
            OptionKind::Int => {
                let n: i64 = first.parse().map_err(|_| anyhow::anyhow!("invalid int value {:?}", vals))?;
                Value::from(n)
            }
            OptionKind::Bool => {
                let b: bool = first.parse().map_err(|_| anyhow::anyhow!("invalid bool value {:?}", vals))?;
                Value::from(b)
            }
            OptionKind::String => Value::from(first.to_string()),
            OptionKind::StringSlice => Value::from(vals.clone()),
        };

        out.insert(key.clone(), value);
    }

    Ok(out)
}
