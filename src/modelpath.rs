use std::path::PathBuf;

pub const DEFAULT_REGISTRY: &str = "registry.ollama.ai";
pub const DEFAULT_NAMESPACE: &str = "library";
pub const DEFAULT_TAG: &str = "latest";
pub const DEFAULT_PROTOCOL_SCHEME: &str = "https";

/// Canonical form of a model reference: `[scheme://][host/][namespace/]repo[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPath {
    pub protocol_scheme: String,
    pub registry: String,
    pub namespace: String,
    pub repository: String,
    pub tag: String,
}

impl ModelPath {
    /// Parses a user-supplied reference, filling in defaults for any
    /// component that is missing. Parsing never fails; an empty name yields
    /// an empty repository, which downstream path lookups reject.
    pub fn parse(name: &str) -> Self {
        let mut mp = ModelPath {
            protocol_scheme: DEFAULT_PROTOCOL_SCHEME.to_string(),
            registry: DEFAULT_REGISTRY.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            repository: String::new(),
            tag: DEFAULT_TAG.to_string(),
        };

        let mut rest = name;
        if let Some((scheme, after)) = rest.split_once("://") {
            mp.protocol_scheme = scheme.to_string();
            rest = after;
        }

        let parts: Vec<&str> = rest.split('/').collect();
        match parts.len() {
            3 => {
                mp.registry = parts[0].to_string();
                mp.namespace = parts[1].to_string();
                mp.repository = parts[2].to_string();
            }
            2 => {
                mp.namespace = parts[0].to_string();
                mp.repository = parts[1].to_string();
            }
            1 => {
                mp.repository = parts[0].to_string();
            }
            _ => {
                mp.repository = rest.to_string();
            }
        }

        if let Some(idx) = mp.repository.find(':') {
            let tag = mp.repository[idx + 1..].to_string();
            mp.repository.truncate(idx);
            if !tag.is_empty() {
                mp.tag = tag;
            }
        }

        mp
    }

    pub fn namespace_repository(&self) -> String {
        format!("{}/{}", self.namespace, self.repository)
    }

    pub fn full_tagname(&self) -> String {
        format!("{}/{}/{}:{}", self.registry, self.namespace, self.repository, self.tag)
    }

    /// Shortest unambiguous name: default registry and namespace are elided.
    pub fn short_tagname(&self) -> String {
        if self.registry != DEFAULT_REGISTRY {
            return self.full_tagname();
        }

        if self.namespace != DEFAULT_NAMESPACE {
            return format!("{}/{}:{}", self.namespace, self.repository, self.tag);
        }

        format!("{}:{}", self.repository, self.tag)
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol_scheme, self.registry)
    }

    /// Path of this reference's manifest relative to the manifests root.
    pub fn manifest_rel_path(&self) -> PathBuf {
        PathBuf::from(&self.registry)
            .join(&self.namespace)
            .join(&self.repository)
            .join(&self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_repo_only() {
        let mp = ModelPath::parse("mistral");
        assert_eq!(mp.registry, DEFAULT_REGISTRY);
        assert_eq!(mp.namespace, "library");
        assert_eq!(mp.repository, "mistral");
        assert_eq!(mp.tag, "latest");
        assert_eq!(mp.protocol_scheme, "https");
    }

    #[test]
    fn parse_with_tag_and_namespace() {
        let mp = ModelPath::parse("jmorgan/mistral:7b-q4");
        assert_eq!(mp.namespace, "jmorgan");
        assert_eq!(mp.repository, "mistral");
        assert_eq!(mp.tag, "7b-q4");
        assert_eq!(mp.short_tagname(), "jmorgan/mistral:7b-q4");
    }

    #[test]
    fn parse_full_reference() {
        let mp = ModelPath::parse("http://localhost:5000/library/llama2:latest");
        assert_eq!(mp.protocol_scheme, "http");
        assert_eq!(mp.registry, "localhost:5000");
        assert_eq!(mp.full_tagname(), "localhost:5000/library/llama2:latest");
        // non-default registry keeps the full form
        assert_eq!(mp.short_tagname(), "localhost:5000/library/llama2:latest");
    }

    #[test]
    fn short_tagname_elides_defaults() {
        let mp = ModelPath::parse("registry.ollama.ai/library/llama2:13b");
        assert_eq!(mp.short_tagname(), "llama2:13b");
    }

    #[test]
    fn empty_trailing_tag_keeps_default() {
        let mp = ModelPath::parse("llama2:");
        assert_eq!(mp.tag, "latest");
    }

    #[test]
    fn equality_is_structural() {
        assert_eq!(ModelPath::parse("llama2"), ModelPath::parse("registry.ollama.ai/library/llama2:latest"));
    }

    #[test]
    fn manifest_rel_path_components() {
        let mp = ModelPath::parse("llama2:7b");
        assert_eq!(
            mp.manifest_rel_path(),
            PathBuf::from("registry.ollama.ai/library/llama2/7b")
        );
    }
}
