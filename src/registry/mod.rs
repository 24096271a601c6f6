pub mod download;
pub mod upload;

use std::collections::HashSet;
use std::io::{Error as IoError, ErrorKind};

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Method, Response, StatusCode};
use tracing::warn;

use crate::api::{ProgressFn, ProgressResponse, TokenResponse};
use crate::layers::{self, DigestMismatch};
use crate::modelpath::ModelPath;
use crate::models::{is_not_found, ManifestV2, ModelManager};

#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    pub insecure: bool,
    pub username: String,
    pub password: String,
    pub token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("{status}: {body}")]
    Status { status: u16, body: String },
}

/// Parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Default, PartialEq)]
pub struct AuthRedirect {
    pub realm: String,
    pub service: String,
    pub scope: String,
}

pub fn parse_auth_redirect(header: &str) -> AuthRedirect {
    let header = header.trim_start_matches("Bearer ");
    AuthRedirect {
        realm: challenge_value(header, "realm"),
        service: challenge_value(header, "service"),
        scope: challenge_value(header, "scope"),
    }
}

// values are quoted and may contain commas, so a plain split won't do
fn challenge_value(header: &str, key: &str) -> String {
    let needle = format!("{}=\"", key);
    let start = match header.find(&needle) {
        Some(i) => i + needle.len(),
        None => return String::new(),
    };

    let rest = &header[start..];
    let mut end = 0;
    let bytes = rest.as_bytes();
    while end < bytes.len() {
        if bytes[end] == b'"' {
            // a quote not followed by a comma is part of the value
            if end + 1 < bytes.len() && bytes[end + 1] != b',' {
                end += 1;
                continue;
            }
            break;
        }
        end += 1;
    }
    rest[..end].to_string()
}

async fn get_auth_token(client: &Client, redirect: &AuthRedirect, reg_opts: &RegistryOptions) -> Result<String> {
    let url = format!(
        "{}?service={}&scope={}",
        redirect.realm, redirect.service, redirect.scope
    );

    let mut req = client.get(&url);
    if !reg_opts.username.is_empty() {
        req = req.basic_auth(&reg_opts.username, Some(&reg_opts.password));
    }

    let resp = req.send().await.context("requesting registry token")?;
    if !resp.status().is_success() {
        bail!(RegistryError::Status {
            status: resp.status().as_u16(),
            body: resp.text().await.unwrap_or_default(),
        });
    }

    let token: TokenResponse = resp.json().await?;
    Ok(token.token)
}

fn user_agent() -> String {
    format!(
        "ollama/{} ({} {}) Rust",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH,
        std::env::consts::OS
    )
}

fn apply_insecure(url: &str, reg_opts: &RegistryOptions) -> String {
    if reg_opts.insecure {
        if let Some(rest) = url.strip_prefix("https://") {
            return format!("http://{}", rest);
        }
    }
    url.to_string()
}

async fn make_request(
    client: &Client,
    method: Method,
    url: &str,
    headers: &HeaderMap,
    body: Option<Vec<u8>>,
    reg_opts: &RegistryOptions,
) -> Result<Response> {
    let url = apply_insecure(url, reg_opts);

    let mut req = client.request(method, &url).headers(headers.clone());

    if !reg_opts.token.is_empty() {
        req = req.header(AUTHORIZATION, format!("Bearer {}", reg_opts.token));
    } else if !reg_opts.username.is_empty() {
        req = req.basic_auth(&reg_opts.username, Some(&reg_opts.password));
    }

    req = req.header(USER_AGENT, user_agent());

    if let Some(body) = body {
        req = req.body(body);
    }

    Ok(req.send().await?)
}

/// Issues a registry request, transparently performing the one-shot bearer
/// token dance on 401. A second 401 is fatal; 404 becomes the not-exist
/// sentinel; any other error status carries its body.
pub async fn make_request_with_retry(
    client: &Client,
    method: Method,
    url: &str,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    reg_opts: &mut RegistryOptions,
) -> Result<Response> {
    let resp = make_request(client, method.clone(), url, &headers, body.clone(), reg_opts).await?;

    match resp.status() {
        StatusCode::UNAUTHORIZED => {
            let challenge = resp
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let redirect = parse_auth_redirect(&challenge);
            reg_opts.token = get_auth_token(client, &redirect, reg_opts).await?;

            let resp = make_request(client, method, url, &headers, body, reg_opts).await?;
            if resp.status() == StatusCode::UNAUTHORIZED {
                bail!(RegistryError::Unauthorized);
            }
            check_error_status(resp).await
        }
        StatusCode::NOT_FOUND => {
            bail!(IoError::new(ErrorKind::NotFound, format!("{} not found", url)))
        }
        _ => check_error_status(resp).await,
    }
}

async fn check_error_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.as_u16() >= 400 {
        if status == StatusCode::NOT_FOUND {
            bail!(IoError::new(ErrorKind::NotFound, "not found"));
        }
        let body = resp.text().await.unwrap_or_default();
        bail!(RegistryError::Status { status: status.as_u16(), body });
    }
    Ok(resp)
}

fn blob_url(mp: &ModelPath, digest: &str) -> String {
    format!("{}/v2/{}/blobs/{}", mp.base_url(), mp.namespace_repository(), digest)
}

fn manifest_url(mp: &ModelPath) -> String {
    format!("{}/v2/{}/manifests/{}", mp.base_url(), mp.namespace_repository(), mp.tag)
}

async fn pull_manifest(client: &Client, mp: &ModelPath, reg_opts: &mut RegistryOptions) -> Result<ManifestV2> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(layers::MEDIA_TYPE_MANIFEST));

    let resp = make_request_with_retry(client, Method::GET, &manifest_url(mp), headers, None, reg_opts).await?;
    Ok(resp.json().await?)
}

/// Replicates a model from the registry into the local store.
pub async fn pull_model(
    manager: &ModelManager,
    name: &str,
    reg_opts: &mut RegistryOptions,
    progress: &ProgressFn,
) -> Result<()> {
    let mp = ModelPath::parse(name);
    if mp.protocol_scheme == "http" && !reg_opts.insecure {
        bail!("insecure protocol http");
    }

    let client = Client::new();

    // blobs of the manifest being replaced are GC candidates
    let mut delete_map: HashSet<String> = HashSet::new();
    if !crate::envconfig::noprune() {
        match manager.get_manifest(&mp) {
            Ok((old, _)) => {
                for layer in &old.layers {
                    delete_map.insert(layer.digest.clone());
                }
                delete_map.insert(old.config.digest.clone());
            }
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err),
        }
    }

    progress(ProgressResponse::status("pulling manifest"));
    let manifest = pull_manifest(&client, &mp, reg_opts)
        .await
        .context("pull model manifest")?;

    let mut all_layers = manifest.layers.clone();
    all_layers.push(manifest.config.clone());

    for layer in &all_layers {
        download::download_blob(&client, manager, &mp, layer, reg_opts, progress).await?;
        delete_map.remove(&layer.digest);
    }

    progress(ProgressResponse::status("verifying sha256 digest"));
    for layer in &all_layers {
        if let Err(err) = manager.verify_blob(&layer.digest) {
            if err.downcast_ref::<DigestMismatch>().is_some() {
                let path = manager.blob_path(&layer.digest);
                if let Err(remove_err) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), %remove_err, "couldn't remove blob with digest mismatch");
                }
            }
            return Err(err);
        }
    }

    progress(ProgressResponse::status("writing manifest"));
    manager.write_manifest_raw(&mp, &manifest)?;

    if !crate::envconfig::noprune() {
        progress(ProgressResponse::status("removing any unused layers"));
        manager.delete_unused_layers(None, &mut delete_map)?;
    }

    progress(ProgressResponse::status("success"));
    Ok(())
}

/// Publishes a local model: every blob the registry is missing, then the
/// manifest.
pub async fn push_model(
    manager: &ModelManager,
    name: &str,
    reg_opts: &mut RegistryOptions,
    progress: &ProgressFn,
) -> Result<()> {
    let mp = ModelPath::parse(name);
    progress(ProgressResponse::status("retrieving manifest"));

    if mp.protocol_scheme == "http" && !reg_opts.insecure {
        bail!("insecure protocol http");
    }

    let (manifest, _) = manager.get_manifest(&mp).map_err(|err| {
        progress(ProgressResponse::status("couldn't retrieve manifest"));
        err
    })?;

    let client = Client::new();

    let mut all_layers = manifest.layers.clone();
    all_layers.push(manifest.config.clone());

    for layer in &all_layers {
        if let Err(err) = upload::upload_blob(&client, manager, &mp, layer, reg_opts, progress).await {
            if err.downcast_ref::<RegistryError>().map(|e| matches!(e, RegistryError::Unauthorized)).unwrap_or(false) {
                bail!(
                    "unable to push {}, make sure this namespace exists and you are authorized to push to it",
                    mp.namespace_repository()
                );
            }
            return Err(err);
        }
    }

    progress(ProgressResponse::status("pushing manifest"));
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(layers::MEDIA_TYPE_MANIFEST));

    let body = serde_json::to_vec(&manifest)?;
    make_request_with_retry(&client, Method::PUT, &manifest_url(&mp), headers, Some(body), reg_opts).await?;

    progress(ProgressResponse::status("success"));
    Ok(())
}
