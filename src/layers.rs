use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const MEDIA_TYPE_MODEL: &str = "application/vnd.ollama.image.model";
pub const MEDIA_TYPE_ADAPTER: &str = "application/vnd.ollama.image.adapter";
pub const MEDIA_TYPE_TEMPLATE: &str = "application/vnd.ollama.image.template";
pub const MEDIA_TYPE_PROMPT: &str = "application/vnd.ollama.image.prompt";
pub const MEDIA_TYPE_SYSTEM: &str = "application/vnd.ollama.image.system";
pub const MEDIA_TYPE_PARAMS: &str = "application/vnd.ollama.image.params";
pub const MEDIA_TYPE_LICENSE: &str = "application/vnd.ollama.image.license";
pub const MEDIA_TYPE_EMBED: &str = "application/vnd.ollama.image.embed";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// A manifest entry referencing one content-addressed blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    // set while the blob is staged but not yet committed
    #[serde(skip)]
    temp_file: Option<PathBuf>,
}

impl Layer {
    /// Stages a new blob from `r` under the blobs directory and returns its
    /// layer record. The content is written to a temp file and hashed as it
    /// streams; `commit` later renames it into place.
    pub fn new<R: Read>(blobs_dir: &Path, mut r: R, media_type: &str) -> Result<Layer> {
        fs::create_dir_all(blobs_dir)?;
        let mut temp = tempfile::Builder::new()
            .prefix("sha256-")
            .suffix("-partial")
            .tempfile_in(blobs_dir)?;

        let mut hasher = Sha256::new();
        let mut buf = [0u8; 32 * 1024];
        let mut size = 0u64;
        loop {
            let n = r.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            temp.write_all(&buf[..n])?;
            size += n as u64;
        }
        temp.flush()?;
        temp.as_file().sync_all()?;

        let digest = format!("sha256:{:x}", hasher.finalize());
        let (_, path) = temp.keep().context("keeping staged blob")?;

        Ok(Layer {
            media_type: media_type.to_string(),
            digest,
            size,
            from: None,
            temp_file: Some(path),
        })
    }

    /// Builds a layer record for a blob that already exists in the store,
    /// recording the reference it was inherited from.
    pub fn from_existing(blobs_dir: &Path, digest: &str, media_type: &str, from: &str) -> Result<Layer> {
        let path = blob_path(blobs_dir, digest);
        let size = fs::metadata(&path)
            .with_context(|| format!("layer blob {} missing", digest))?
            .len();

        Ok(Layer {
            media_type: media_type.to_string(),
            digest: digest.to_string(),
            size,
            from: Some(from.to_string()),
            temp_file: None,
        })
    }

    /// Moves the staged blob to its digest-named file. Returns false when an
    /// identical blob was already committed, in which case the staged copy is
    /// discarded.
    pub fn commit(&mut self, blobs_dir: &Path) -> Result<bool> {
        let temp = match self.temp_file.take() {
            Some(t) => t,
            None => return Ok(false),
        };

        let target = blob_path(blobs_dir, &self.digest);
        if target.exists() {
            fs::remove_file(&temp)?;
            return Ok(false);
        }

        fs::rename(&temp, &target)?;
        Ok(true)
    }
}

/// Ordered layer set under construction. `add` appends (deduplicating by
/// digest); `replace` enforces singleton media types such as template and
/// system.
#[derive(Debug, Default)]
pub struct Layers {
    items: Vec<Layer>,
}

impl Layers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, layer: Layer) {
        if self.items.iter().any(|l| l.digest == layer.digest) {
            return;
        }
        self.items.push(layer);
    }

    pub fn replace(&mut self, layer: Layer) {
        self.items.retain(|l| l.media_type != layer.media_type);
        self.items.push(layer);
    }

    pub fn items(&self) -> &[Layer] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Layer> {
        self.items
    }
}

/// On-disk location of a blob: the digest with the colon swapped for a
/// hyphen, so the same layout works where colons are illegal in file names.
pub fn blob_path(blobs_dir: &Path, digest: &str) -> PathBuf {
    blobs_dir.join(digest.replace(':', "-"))
}

/// Reverse of `blob_path` for directory walks.
pub fn digest_from_file_name(name: &str) -> Option<String> {
    if !name.starts_with("sha256-") || name.ends_with("-partial") {
        return None;
    }
    Some(name.replacen('-', ":", 1))
}

/// Streams `r` through SHA-256, returning the `sha256:<hex>` digest and the
/// number of bytes read.
pub fn sha256_digest<R: Read>(mut r: R) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let n = std::io::copy(&mut r, &mut hasher)?;
    Ok((format!("sha256:{:x}", hasher.finalize()), n))
}

/// Recomputes a blob's digest and compares it to its file name.
pub fn verify_blob(blobs_dir: &Path, digest: &str) -> Result<()> {
    let path = blob_path(blobs_dir, digest);
    let file = fs::File::open(&path)?;
    let (actual, _) = sha256_digest(file)?;
    if actual != digest {
        bail!(DigestMismatch {
            want: digest.to_string(),
            got: actual,
        });
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
#[error("digest mismatch, file must be downloaded again: want {want}, got {got}")]
pub struct DigestMismatch {
    pub want: String,
    pub got: String,
}
