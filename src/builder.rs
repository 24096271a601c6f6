use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::info;

use crate::api::{ProgressFn, ProgressResponse};
use crate::gguf;
use crate::layers::{self, Layer, Layers};
use crate::modelpath::ModelPath;
use crate::models::{is_not_found, ConfigV2, ModelManager};
use crate::options::format_params;
use crate::registry::{self, RegistryOptions};
use crate::{envconfig, parser};

/// Builds a model from an ordered Modelfile command list: stages layers,
/// writes the config blob and manifest, then garbage-collects whatever the
/// build superseded.
pub async fn create_model(
    manager: &ModelManager,
    name: &str,
    modelfile_dir: &Path,
    commands: &[parser::Command],
    progress: &ProgressFn,
) -> Result<()> {
    let blobs_dir = manager.blobs_dir();

    let mut config = ConfigV2::default();
    let mut layers = Layers::new();
    let mut delete_map: HashSet<String> = HashSet::new();
    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    let mut from_params: Map<String, Value> = Map::new();

    for c in commands {
        info!("[{}] - {}", c.name, c.args);
        let mediatype = format!("application/vnd.ollama.image.{}", c.name);

        match c.name.as_str() {
            "model" => {
                let source = if let Some(digest) = c.args.strip_prefix('@') {
                    manager.blob_path(&format!("sha256:{}", digest.trim_start_matches("sha256:")))
                } else {
                    realpath(modelfile_dir, &c.args)
                };

                if source.is_file() {
                    progress(ProgressResponse::status("creating model layer"));

                    let probed = gguf::probe(&source)
                        .with_context(|| format!("reading model header {}", source.display()))?;
                    config.model_format = probed.model_format;
                    config.model_family = probed.model_family;
                    config.model_type = probed.model_type;
                    config.file_type = probed.file_type;

                    let bin = fs::File::open(&source)?;
                    layers.add(Layer::new(&blobs_dir, bin, layers::MEDIA_TYPE_MODEL)?);
                    continue;
                }

                // not a file on disk so it must be a model reference
                let mp = ModelPath::parse(&c.args);
                let manifest = match manager.get_manifest(&mp) {
                    Ok((manifest, _)) => manifest,
                    Err(err) if is_not_found(&err) => {
                        progress(ProgressResponse::status("pulling model"));
                        registry::pull_model(manager, &c.args, &mut RegistryOptions::default(), progress).await?;
                        manager.get_manifest(&mp)?.0
                    }
                    Err(err) => return Err(err),
                };

                progress(ProgressResponse::status("reading model metadata"));
                let from_config: ConfigV2 = {
                    let file = fs::File::open(manager.blob_path(&manifest.config.digest))?;
                    serde_json::from_reader(file)
                        .with_context(|| format!("parsing config blob of {}", c.args))?
                };
                config.model_format = from_config.model_format;
                config.model_family = from_config.model_family;
                config.model_type = from_config.model_type;
                config.file_type = from_config.file_type;

                for layer in &manifest.layers {
                    delete_map.insert(layer.digest.clone());

                    if layer.media_type == layers::MEDIA_TYPE_PARAMS {
                        let file = fs::File::open(manager.blob_path(&layer.digest))?;
                        from_params = serde_json::from_reader(file)
                            .with_context(|| format!("parsing params layer of {}", c.args))?;
                    }

                    layers.add(Layer::from_existing(
                        &blobs_dir,
                        &layer.digest,
                        &layer.media_type,
                        &mp.short_tagname(),
                    )?);
                }
                delete_map.insert(manifest.config.digest.clone());
            }
            "adapter" => {
                progress(ProgressResponse::status("creating adapter layer"));
                let path = realpath(modelfile_dir, &c.args);
                let bin = fs::File::open(&path)
                    .with_context(|| format!("opening adapter {}", path.display()))?;
                layers.add(Layer::new(&blobs_dir, bin, &mediatype)?);
            }
            "license" => {
                progress(ProgressResponse::status("creating license layer"));
                layers.add(Layer::new(&blobs_dir, Cursor::new(c.args.clone().into_bytes()), &mediatype)?);
            }
            "template" | "system" => {
                progress(ProgressResponse::status(format!("creating {} layer", c.name)));
                layers.replace(Layer::new(&blobs_dir, Cursor::new(c.args.clone().into_bytes()), &mediatype)?);
            }
            _ => {
                params.entry(c.name.clone()).or_default().push(c.args.clone());
            }
        }
    }

    if !params.is_empty() {
        progress(ProgressResponse::status("creating parameters layer"));

        let mut formatted = format_params(&params)?;
        // inherited params lose to ones set in this Modelfile
        for (k, v) in &from_params {
            formatted.entry(k.clone()).or_insert_with(|| v.clone());
        }

        if config.model_type == "65B" {
            if let Some(8) = formatted.get("num_gqa").and_then(Value::as_i64) {
                config.model_type = "70B".to_string();
            }
        }

        let bytes = serde_json::to_vec(&formatted)?;
        layers.replace(Layer::new(&blobs_dir, Cursor::new(bytes), layers::MEDIA_TYPE_PARAMS)?);
    }

    config.rootfs.diff_ids = layers.items().iter().map(|l| l.digest.clone()).collect();

    progress(ProgressResponse::status("creating config layer"));
    let config_bytes = serde_json::to_vec(&config)?;
    let mut config_layer = Layer::new(&blobs_dir, Cursor::new(config_bytes), layers::MEDIA_TYPE_IMAGE_CONFIG)?;
    delete_map.remove(&config_layer.digest);

    let mut layer_items = layers.into_items();
    for layer in layer_items.iter_mut().chain(std::iter::once(&mut config_layer)) {
        let committed = layer.commit(&blobs_dir)?;
        let status = if committed { "writing layer" } else { "using already created layer" };
        progress(ProgressResponse::status(format!("{} {}", status, layer.digest)));
        delete_map.remove(&layer.digest);
    }

    progress(ProgressResponse::status("writing manifest"));
    manager.write_manifest(&ModelPath::parse(name), config_layer, layer_items)?;

    if !envconfig::noprune() {
        manager.delete_unused_layers(None, &mut delete_map)?;
    }

    progress(ProgressResponse::status("success"));
    Ok(())
}

/// Resolves a Modelfile path argument: `~` expansion first, then relative to
/// the Modelfile's directory, then relative to the working directory.
fn realpath(modelfile_dir: &Path, from: &str) -> PathBuf {
    if from == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = from.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }

    let relative = modelfile_dir.join(from);
    if relative.exists() {
        return relative;
    }

    let path = PathBuf::from(from);
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir().map(|d| d.join(from)).unwrap_or(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;

    fn gguf_bytes() -> Vec<u8> {
        // magic "GGUF", version 2, no tensors, one metadata pair
        let mut out = Vec::new();
        out.extend_from_slice(&0x4655_4747u32.to_le_bytes());
        out.extend_from_slice(&2u32.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&1u64.to_le_bytes());
        let key = "general.architecture";
        out.extend_from_slice(&(key.len() as u64).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&8u32.to_le_bytes());
        let val = "llama";
        out.extend_from_slice(&(val.len() as u64).to_le_bytes());
        out.extend_from_slice(val.as_bytes());
        out
    }

    fn collect_progress() -> (Box<dyn Fn(ProgressResponse) + Send + Sync>, std::sync::Arc<Mutex<Vec<String>>>) {
        let statuses = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        (
            Box::new(move |p: ProgressResponse| sink.lock().push(p.status)),
            statuses,
        )
    }

    #[tokio::test]
    async fn create_from_weights_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(dir.path().join("store")).unwrap();

        let mf_dir = dir.path().join("mf");
        fs::create_dir_all(&mf_dir).unwrap();
        let weights = mf_dir.join("weights.gguf");
        fs::File::create(&weights).unwrap().write_all(&gguf_bytes()).unwrap();

        let commands = parser::parse(std::io::Cursor::new(
            "FROM weights.gguf\nTEMPLATE \"{{ .Prompt }}\"\nSYSTEM terse\nPARAMETER temperature 0.5\n",
        ))
        .unwrap();

        let (progress, statuses) = collect_progress();
        create_model(&manager, "built", &mf_dir, &commands, &*progress).await.unwrap();

        assert_eq!(statuses.lock().last().unwrap(), "success");

        // every manifest digest resolves to a verifiable blob
        let (manifest, _) = manager.get_manifest(&ModelPath::parse("built")).unwrap();
        for layer in manifest.layers.iter().chain(std::iter::once(&manifest.config)) {
            manager.verify_blob(&layer.digest).unwrap();
        }

        let model = manager.get_model("built").unwrap();
        assert_eq!(model.system, "terse");
        assert_eq!(model.options.get("temperature").and_then(Value::as_f64), Some(0.5));
    }

    #[tokio::test]
    async fn create_from_local_reference_inherits_layers() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(dir.path().join("store")).unwrap();
        let mf_dir = dir.path().join("mf");
        fs::create_dir_all(&mf_dir).unwrap();

        let weights = mf_dir.join("base.gguf");
        fs::File::create(&weights).unwrap().write_all(&gguf_bytes()).unwrap();

        let (progress, _) = collect_progress();
        let base = parser::parse(std::io::Cursor::new("FROM base.gguf\nPARAMETER num_ctx 4096\n")).unwrap();
        create_model(&manager, "base", &mf_dir, &base, &*progress).await.unwrap();

        let child = parser::parse(std::io::Cursor::new("FROM base\nSYSTEM new persona\nPARAMETER temperature 0.9\n")).unwrap();
        create_model(&manager, "child", &mf_dir, &child, &*progress).await.unwrap();

        let model = manager.get_model("child").unwrap();
        assert_eq!(model.system, "new persona");
        // params merged under: inherited num_ctx survives alongside the override
        assert_eq!(model.options.get("num_ctx").and_then(Value::as_i64), Some(4096));
        assert_eq!(model.options.get("temperature").and_then(Value::as_f64), Some(0.9));

        // provenance recorded on inherited layers
        let (manifest, _) = manager.get_manifest(&ModelPath::parse("child")).unwrap();
        assert!(manifest
            .layers
            .iter()
            .any(|l| l.from.as_deref() == Some("base:latest")));
    }

    #[tokio::test]
    async fn singleton_layers_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(dir.path().join("store")).unwrap();
        let mf_dir = dir.path().join("mf");
        fs::create_dir_all(&mf_dir).unwrap();
        let weights = mf_dir.join("w.gguf");
        fs::File::create(&weights).unwrap().write_all(&gguf_bytes()).unwrap();

        let commands = parser::parse(std::io::Cursor::new(
            "FROM w.gguf\nSYSTEM first\nSYSTEM second\n",
        ))
        .unwrap();
        let (progress, _) = collect_progress();
        create_model(&manager, "sys", &mf_dir, &commands, &*progress).await.unwrap();

        let model = manager.get_model("sys").unwrap();
        assert_eq!(model.system, "second");

        let (manifest, _) = manager.get_manifest(&ModelPath::parse("sys")).unwrap();
        let systems = manifest
            .layers
            .iter()
            .filter(|l| l.media_type == layers::MEDIA_TYPE_SYSTEM)
            .count();
        assert_eq!(systems, 1);
    }

    #[test]
    fn realpath_prefers_modelfile_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("adapter.bin"), b"x").unwrap();
        assert_eq!(realpath(dir.path(), "adapter.bin"), dir.path().join("adapter.bin"));
        assert!(realpath(dir.path(), "/etc/hosts").is_absolute());
    }
}
