use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Listen address, from `OLLAMA_HOST` (default 127.0.0.1:11434).
pub fn host() -> SocketAddr {
    let raw = env::var("OLLAMA_HOST").unwrap_or_else(|_| "127.0.0.1:11434".to_string());

    let raw = if raw.contains(':') { raw } else { format!("{}:11434", raw) };
    raw.parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 11434)))
}

/// Root of the model store, from `OLLAMA_MODELS` (default ~/.ollama/models).
pub fn models_dir() -> PathBuf {
    let mut path = env::var("OLLAMA_MODELS").unwrap_or_else(|_| "~/.ollama/models".to_string());

    if path.starts_with("~/") || path == "~" {
        if let Some(home) = dirs::home_dir() {
            path = path.replacen('~', &home.to_string_lossy(), 1);
        }
    }

    PathBuf::from(path)
}

/// When set, startup and post-operation garbage collection are skipped.
pub fn noprune() -> bool {
    env::var("OLLAMA_NOPRUNE").map(|v| !v.is_empty()).unwrap_or(false)
}

/// Extra allowed CORS origins, comma separated.
pub fn origins() -> Vec<String> {
    env::var("OLLAMA_ORIGINS")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Model backing the OpenAI-compatible surface.
pub fn openai_model() -> String {
    env::var("OLLAMA_OPENAI_MODEL")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "llama2".to_string())
}

/// Backend runner binary invoked as a child process.
pub fn runner_bin() -> String {
    env::var("OLLAMA_RUNNER")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "ollama-runner".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_parse_fallback() {
        let addr = host();
        assert_eq!(addr.port(), 11434);
    }

    #[test]
    fn origins_empty_without_env() {
        if env::var("OLLAMA_ORIGINS").is_err() {
            assert!(origins().is_empty());
        }
    }
}
