use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::api::{ModelResponse, ShowResponse};
use crate::layers::{self, Layer};
use crate::modelpath::ModelPath;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestV2 {
    #[serde(rename = "schemaVersion")]
    pub schema_version: i32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: Layer,
    pub layers: Vec<Layer>,
}

impl ManifestV2 {
    pub fn total_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum::<u64>() + self.config.size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigV2 {
    pub model_format: String,
    pub model_family: String,
    pub model_type: String,
    pub file_type: String,
    pub rootfs: RootFs,
    // required by the image spec
    pub architecture: String,
    pub os: String,
}

impl Default for ConfigV2 {
    fn default() -> Self {
        ConfigV2 {
            model_format: String::new(),
            model_family: String::new(),
            model_type: String::new(),
            file_type: String::new(),
            rootfs: RootFs {
                kind: "layers".to_string(),
                diff_ids: Vec::new(),
            },
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

/// A model materialized from its manifest. Built on demand and never cached;
/// only the loaded backend is held between requests.
#[derive(Debug, Clone, Default)]
pub struct Model {
    pub name: String,
    pub short_name: String,
    pub model_path: String,
    pub original_model: String,
    pub adapter_paths: Vec<String>,
    pub template: String,
    pub system: String,
    pub license: Vec<String>,
    pub digest: String,
    pub options: HashMap<String, Value>,
}

/// Filesystem root of the content-addressed store:
/// `<root>/blobs/sha256-<hex>` and `<root>/manifests/<host>/<ns>/<repo>/<tag>`.
#[derive(Debug, Clone)]
pub struct ModelManager {
    root: PathBuf,
}

impl ModelManager {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs"))?;
        fs::create_dir_all(root.join("manifests"))?;
        Ok(ModelManager { root })
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn blob_path(&self, digest: &str) -> PathBuf {
        layers::blob_path(&self.blobs_dir(), digest)
    }

    pub fn manifest_path(&self, mp: &ModelPath) -> PathBuf {
        self.manifests_dir().join(mp.manifest_rel_path())
    }

    /// Reads a manifest and returns it with the hex digest of its bytes.
    pub fn get_manifest(&self, mp: &ModelPath) -> Result<(ManifestV2, String)> {
        let path = self.manifest_path(mp);
        let bytes = fs::read(&path)?;
        let digest = format!("{:x}", Sha256::digest(&bytes));
        let manifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing manifest {}", path.display()))?;
        Ok((manifest, digest))
    }

    pub fn write_manifest(&self, mp: &ModelPath, config: Layer, layers: Vec<Layer>) -> Result<()> {
        let manifest = ManifestV2 {
            schema_version: 2,
            media_type: layers::MEDIA_TYPE_MANIFEST.to_string(),
            config,
            layers,
        };

        let path = self.manifest_path(mp);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_vec(&manifest)?)?;
        Ok(())
    }

    pub fn write_manifest_raw(&self, mp: &ModelPath, manifest: &ManifestV2) -> Result<()> {
        let path = self.manifest_path(mp);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_vec(manifest)?)?;
        Ok(())
    }

    /// Materializes the in-memory view of a model from its manifest,
    /// dispatching each layer by media type.
    pub fn get_model(&self, name: &str) -> Result<Model> {
        let mp = ModelPath::parse(name);
        let (manifest, digest) = self.get_manifest(&mp)?;

        let mut model = Model {
            name: mp.full_tagname(),
            short_name: mp.short_tagname(),
            digest,
            template: "{{ .Prompt }}".to_string(),
            ..Default::default()
        };

        for layer in &manifest.layers {
            let filename = self.blob_path(&layer.digest);

            match layer.media_type.as_str() {
                layers::MEDIA_TYPE_MODEL => {
                    model.model_path = filename.to_string_lossy().into_owned();
                    model.original_model = layer.from.clone().unwrap_or_default();
                }
                layers::MEDIA_TYPE_EMBED => {
                    warn!("model contains embeddings, but embeddings in modelfiles have been deprecated and will be ignored");
                }
                layers::MEDIA_TYPE_ADAPTER => {
                    model.adapter_paths.push(filename.to_string_lossy().into_owned());
                }
                layers::MEDIA_TYPE_TEMPLATE | layers::MEDIA_TYPE_PROMPT => {
                    model.template = fs::read_to_string(&filename)?;
                }
                layers::MEDIA_TYPE_SYSTEM => {
                    model.system = fs::read_to_string(&filename)?;
                }
                layers::MEDIA_TYPE_PARAMS => {
                    let file = fs::File::open(&filename)?;
                    model.options = serde_json::from_reader(file)
                        .with_context(|| format!("parsing params layer {}", layer.digest))?;
                }
                layers::MEDIA_TYPE_LICENSE => {
                    model.license.push(fs::read_to_string(&filename)?);
                }
                _ => {}
            }
        }

        Ok(model)
    }

    /// Enumerates every manifest under the store as `(reference, path)`.
    fn walk_manifests(&self) -> Result<Vec<(ModelPath, PathBuf)>> {
        let mut found = Vec::new();
        let root = self.manifests_dir();
        let mut stack = vec![root.clone()];

        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }

                let rel = match path.strip_prefix(&root) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let parts: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                if parts.len() != 4 {
                    continue;
                }

                let tag = format!("{}/{}/{}:{}", parts[0], parts[1], parts[2], parts[3]);
                found.push((ModelPath::parse(&tag), path));
            }
        }

        Ok(found)
    }

    pub fn list_models(&self) -> Result<Vec<ModelResponse>> {
        let mut models = Vec::new();

        for (mp, path) in self.walk_manifests()? {
            let (manifest, digest) = match self.get_manifest(&mp) {
                Ok(m) => m,
                Err(_) => {
                    warn!(path = %path.display(), "skipping unreadable manifest");
                    continue;
                }
            };

            let modified_at = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            models.push(ModelResponse {
                name: mp.short_tagname(),
                size: manifest.total_size(),
                digest,
                modified_at,
            });
        }

        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    /// Copies only the manifest; blobs are content-addressed and shared.
    pub fn copy_model(&self, src: &str, dest: &str) -> Result<()> {
        let src_path = self.manifest_path(&ModelPath::parse(src));
        let dest_path = self.manifest_path(&ModelPath::parse(dest));

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = fs::read(&src_path)?;
        fs::write(&dest_path, bytes)?;
        Ok(())
    }

    pub fn delete_model(&self, name: &str) -> Result<()> {
        let mp = ModelPath::parse(name);
        let (manifest, _) = self.get_manifest(&mp)?;

        let mut delete_map: HashSet<String> = manifest.layers.iter().map(|l| l.digest.clone()).collect();
        delete_map.insert(manifest.config.digest.clone());

        self.delete_unused_layers(Some(&mp), &mut delete_map)?;

        fs::remove_file(self.manifest_path(&mp))?;
        Ok(())
    }

    /// Removes the blobs in `delete_map` that no surviving manifest
    /// references. `skip` excludes the manifest being deleted from the scan.
    pub fn delete_unused_layers(&self, skip: Option<&ModelPath>, delete_map: &mut HashSet<String>) -> Result<()> {
        for (mp, _) in self.walk_manifests()? {
            if let Some(skip) = skip {
                if skip.full_tagname() == mp.full_tagname() {
                    continue;
                }
            }

            let (manifest, _) = match self.get_manifest(&mp) {
                Ok(m) => m,
                Err(_) => continue,
            };

            for layer in &manifest.layers {
                delete_map.remove(&layer.digest);
            }
            delete_map.remove(&manifest.config.digest);
        }

        for digest in delete_map.iter() {
            let path = self.blob_path(digest);
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), %err, "couldn't remove unused blob");
            }
        }

        Ok(())
    }

    /// Sweeps the blobs directory, deleting every blob no manifest references
    /// and any staging file a crash left behind.
    pub fn prune_layers(&self) -> Result<()> {
        let mut delete_map = HashSet::new();

        for entry in fs::read_dir(self.blobs_dir())?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with("-partial") {
                let _ = fs::remove_file(entry.path());
                continue;
            }
            if let Some(digest) = layers::digest_from_file_name(&name) {
                delete_map.insert(digest);
            }
        }

        let total = delete_map.len();
        self.delete_unused_layers(None, &mut delete_map)?;
        tracing::info!(total, unreferenced = delete_map.len(), "pruned blob store");

        Ok(())
    }

    /// Recursively removes empty directories below `path`, without following
    /// symlinks.
    pub fn prune_directory(path: &Path) -> Result<()> {
        let info = fs::symlink_metadata(path)?;
        if !info.is_dir() {
            return Ok(());
        }

        for entry in fs::read_dir(path)?.flatten() {
            Self::prune_directory(&entry.path())?;
        }

        if fs::read_dir(path)?.next().is_none() {
            fs::remove_dir(path)?;
        }

        Ok(())
    }

    pub fn verify_blob(&self, digest: &str) -> Result<()> {
        layers::verify_blob(&self.blobs_dir(), digest)
    }

    /// Reconstructs show output: license, reconstructed Modelfile, formatted
    /// parameters, template and system text.
    pub fn model_info(&self, name: &str) -> Result<ShowResponse> {
        let model = self.get_model(name)?;

        let mut resp = ShowResponse {
            license: model.license.join("\n"),
            system: model.system.clone(),
            template: model.template.clone(),
            modelfile: show_modelfile(&model),
            parameters: String::new(),
        };

        let mut params = Vec::new();
        for (key, value) in &model.options {
            for v in flatten_param(value) {
                params.push(format!("{:<30} {}", key, v));
            }
        }
        params.sort();
        resp.parameters = params.join("\n");

        Ok(resp)
    }
}

fn flatten_param(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().flat_map(flatten_param).collect(),
        Value::String(s) => vec![s.clone()],
        Value::Bool(b) => vec![b.to_string()],
        Value::Number(n) => vec![n.to_string()],
        other => vec![other.to_string()],
    }
}

/// Renders a Modelfile equivalent to the model's manifest.
pub fn show_modelfile(model: &Model) -> String {
    let from = if model.original_model.is_empty() {
        model.model_path.as_str()
    } else {
        model.original_model.as_str()
    };

    let mut out = String::new();
    let _ = writeln!(out, "# Modelfile generated by \"ollama show\"");
    let _ = writeln!(out, "# To build a new Modelfile based on this one, replace the FROM line with:");
    let _ = writeln!(out, "# FROM {}", model.short_name);
    let _ = writeln!(out);
    let _ = writeln!(out, "FROM {}", from);
    let _ = writeln!(out, "TEMPLATE \"\"\"{}\"\"\"", model.template);

    if !model.system.is_empty() {
        let _ = writeln!(out, "SYSTEM \"\"\"{}\"\"\"", model.system);
    }

    for adapter in &model.adapter_paths {
        let _ = writeln!(out, "ADAPTER {}", adapter);
    }

    let mut keys: Vec<&String> = model.options.keys().collect();
    keys.sort();
    for key in keys {
        for v in flatten_param(&model.options[key]) {
            match &model.options[key] {
                Value::String(_) | Value::Array(_) => {
                    let _ = writeln!(out, "PARAMETER {} {:?}", key, v);
                }
                _ => {
                    let _ = writeln!(out, "PARAMETER {} {}", key, v);
                }
            }
        }
    }

    out
}

/// True when the error chain bottoms out in a missing file, the sentinel for
/// "model/blob not found".
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .map(|io| io.kind() == std::io::ErrorKind::NotFound)
            .unwrap_or(false)
    })
}
