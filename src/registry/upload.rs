use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LOCATION};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};

use crate::api::{ProgressFn, ProgressResponse};
use crate::layers::Layer;
use crate::modelpath::ModelPath;
use crate::models::{is_not_found, ModelManager};

use super::{blob_url, make_request_with_retry, RegistryOptions};

const UPLOAD_PART_SIZE: u64 = 32 * 1024 * 1024;

/// One completed slice of a chunked upload, persisted so an interrupted push
/// resumes instead of starting over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPart {
    pub offset: u64,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

fn parts_path(manager: &ModelManager, digest: &str) -> PathBuf {
    let path = manager.blob_path(digest);
    PathBuf::from(format!("{}.parts", path.display()))
}

fn read_parts(manager: &ModelManager, digest: &str) -> Vec<UploadPart> {
    fs::read(parts_path(manager, digest))
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

fn write_parts(manager: &ModelManager, digest: &str, parts: &[UploadPart]) -> Result<()> {
    fs::write(parts_path(manager, digest), serde_json::to_vec(parts)?)?;
    Ok(())
}

fn short_digest(digest: &str) -> &str {
    digest.get(7..19).unwrap_or(digest)
}

fn resolve_location(mp: &ModelPath, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!("{}{}", mp.base_url(), location)
    }
}

/// Uploads one blob: skipped entirely when the registry already has it,
/// otherwise pushed in resumable parts and finalized with the digest.
pub async fn upload_blob(
    client: &Client,
    manager: &ModelManager,
    mp: &ModelPath,
    layer: &Layer,
    reg_opts: &mut RegistryOptions,
    progress: &ProgressFn,
) -> Result<()> {
    let digest = &layer.digest;

    match make_request_with_retry(client, Method::HEAD, &blob_url(mp, digest), HeaderMap::new(), None, reg_opts).await
    {
        Ok(_) => {
            progress(ProgressResponse {
                status: "using existing layer".to_string(),
                digest: Some(digest.clone()),
                total: Some(layer.size),
                completed: Some(layer.size),
            });
            return Ok(());
        }
        Err(err) if is_not_found(&err) => {}
        Err(err) => return Err(err),
    }

    progress(ProgressResponse {
        status: "starting upload".to_string(),
        digest: Some(digest.clone()),
        total: Some(layer.size),
        completed: Some(0),
    });

    let start_url = format!("{}/v2/{}/blobs/uploads/", mp.base_url(), mp.namespace_repository());
    let resp = make_request_with_retry(client, Method::POST, &start_url, HeaderMap::new(), None, reg_opts).await?;
    let mut location = resp
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(|loc| resolve_location(mp, loc))
        .context("registry did not return an upload location")?;

    let blob_path = manager.blob_path(digest);
    let mut file = fs::File::open(&blob_path)
        .with_context(|| format!("opening blob {}", blob_path.display()))?;

    let mut parts = read_parts(manager, digest);
    let mut offset: u64 = parts.iter().map(|p| p.size).sum();

    while offset < layer.size {
        let part_size = UPLOAD_PART_SIZE.min(layer.size - offset);
        let mut chunk = vec![0u8; part_size as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut chunk)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        headers.insert(
            "Content-Range",
            HeaderValue::from_str(&format!("{}-{}", offset, offset + part_size - 1))
                .expect("valid content range"),
        );

        let resp =
            make_request_with_retry(client, Method::PATCH, &location, headers, Some(chunk), reg_opts).await?;

        if let Some(next) = resp.headers().get(LOCATION).and_then(|v| v.to_str().ok()) {
            location = resolve_location(mp, next);
        }
        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        parts.push(UploadPart { offset, size: part_size, etag });
        write_parts(manager, digest, &parts)?;

        offset += part_size;
        progress(ProgressResponse {
            status: format!("uploading {}", short_digest(digest)),
            digest: Some(digest.clone()),
            total: Some(layer.size),
            completed: Some(offset),
        });
    }

    let separator = if location.contains('?') { '&' } else { '?' };
    let finalize = format!("{}{}digest={}", location, separator, digest);

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    let resp = make_request_with_retry(client, Method::PUT, &finalize, headers, None, reg_opts).await?;
    if !resp.status().is_success() {
        bail!("finalizing upload of {} failed: {}", digest, resp.status());
    }

    let _ = fs::remove_file(parts_path(manager, digest));

    progress(ProgressResponse {
        status: format!("uploading {}", short_digest(digest)),
        digest: Some(digest.clone()),
        total: Some(layer.size),
        completed: Some(layer.size),
    });
    Ok(())
}
