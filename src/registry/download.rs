use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use reqwest::{Client, Method, StatusCode};

use crate::api::{ProgressFn, ProgressResponse};
use crate::layers::Layer;
use crate::modelpath::ModelPath;
use crate::models::ModelManager;

use super::{blob_url, make_request_with_retry, RegistryOptions};

fn short_digest(digest: &str) -> &str {
    digest.get(7..19).unwrap_or(digest)
}

fn partial_path(manager: &ModelManager, digest: &str) -> PathBuf {
    let path = manager.blob_path(digest);
    PathBuf::from(format!("{}-partial", path.display()))
}

/// Downloads one blob with HTTP ranges. Progress survives interruption: the
/// `-partial` file's length is the resume offset, so a retry continues where
/// the last attempt stopped.
pub async fn download_blob(
    client: &Client,
    manager: &ModelManager,
    mp: &ModelPath,
    layer: &Layer,
    reg_opts: &mut RegistryOptions,
    progress: &ProgressFn,
) -> Result<()> {
    let digest = &layer.digest;
    let target = manager.blob_path(digest);

    if target.exists() {
        progress(ProgressResponse {
            status: format!("downloading {}", short_digest(digest)),
            digest: Some(digest.clone()),
            total: Some(layer.size),
            completed: Some(layer.size),
        });
        return Ok(());
    }

    let partial = partial_path(manager, digest);
    let mut offset = fs::metadata(&partial).map(|m| m.len()).unwrap_or(0);

    let mut headers = HeaderMap::new();
    if offset > 0 {
        headers.insert(
            RANGE,
            HeaderValue::from_str(&format!("bytes={}-", offset)).expect("valid range header"),
        );
    }

    let resp = make_request_with_retry(client, Method::GET, &blob_url(mp, digest), headers, None, reg_opts)
        .await
        .with_context(|| format!("downloading {}", digest))?;

    // a server that ignored the range restarts the transfer
    let mut file = if offset > 0 && resp.status() != StatusCode::PARTIAL_CONTENT {
        offset = 0;
        OpenOptions::new().write(true).create(true).truncate(true).open(&partial)?
    } else {
        OpenOptions::new().append(true).create(true).open(&partial)?
    };

    let total = offset + resp.content_length().unwrap_or(layer.size.saturating_sub(offset));
    let mut completed = offset;

    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)?;
        completed += chunk.len() as u64;

        progress(ProgressResponse {
            status: format!("downloading {}", short_digest(digest)),
            digest: Some(digest.clone()),
            total: Some(total),
            completed: Some(completed),
        });
    }

    file.flush()?;
    file.sync_all()?;
    drop(file);

    fs::rename(&partial, &target)?;
    Ok(())
}
