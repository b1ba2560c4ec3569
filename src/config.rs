use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default text embedding model (CLIP so text and image queries share a space)
const DEFAULT_TEXT_MODEL: &str = "clip-vit-b-32";
/// Default image embedding model
const DEFAULT_IMAGE_MODEL: &str = "clip-vit-b-32";
/// Default cross-encoder model
const DEFAULT_RERANK_MODEL: &str = "bge-reranker-base";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const DEFAULT_LISTEN: &str = "127.0.0.1:8078";
const DEFAULT_MAX_BODY_MB: usize = 10;

const DEFAULT_TOP_K: usize = 10;
const DEFAULT_MAX_TOP_K: usize = 100;
const DEFAULT_RERANK_FACTOR: usize = 4;
const DEFAULT_FILTER_FACTOR: usize = 3;
const DEFAULT_TEXT_WEIGHT: f32 = 0.5;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Maximum request body size in megabytes (image queries)
    #[serde(default = "default_max_body_mb")]
    pub max_body_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            max_body_mb: DEFAULT_MAX_BODY_MB,
        }
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_max_body_mb() -> usize {
    DEFAULT_MAX_BODY_MB
}

/// Optional remote embedding provider, tried before the local model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteEmbeddingConfig {
    /// Base URL of an OpenAI-compatible embeddings endpoint
    pub endpoint: String,

    /// Remote model name
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Vector dimension the remote model produces
    pub dimensions: usize,

    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_remote_max_retries")]
    pub max_retries: usize,
}

fn default_api_key_env() -> String {
    "VOGUE_EMBED_API_KEY".to_string()
}

fn default_remote_timeout_secs() -> u64 {
    30
}

fn default_remote_max_retries() -> usize {
    2
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Text model name (e.g., "clip-vit-b-32", "all-MiniLM-L6-v2")
    #[serde(default = "default_text_model")]
    pub text_model: String,

    /// Image model name, or empty to disable image queries
    #[serde(default = "default_image_model")]
    pub image_model: String,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Remote provider; when present and preferred it becomes the
    /// primary with the local model as fallback
    #[serde(default)]
    pub remote: Option<RemoteEmbeddingConfig>,

    #[serde(default)]
    pub prefer_remote: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            remote: None,
            prefer_remote: false,
        }
    }
}

fn default_text_model() -> String {
    DEFAULT_TEXT_MODEL.to_string()
}

fn default_image_model() -> String {
    DEFAULT_IMAGE_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Enable the cross-encoder stage for requests that ask for it
    #[serde(default)]
    pub enabled: bool,

    /// Cross-encoder model name
    #[serde(default = "default_rerank_model")]
    pub model: String,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: DEFAULT_RERANK_MODEL.to_string(),
        }
    }
}

fn default_rerank_model() -> String {
    DEFAULT_RERANK_MODEL.to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,

    /// Retrieval oversampling multiplier when reranking
    #[serde(default = "default_rerank_factor")]
    pub rerank_factor: usize,

    /// Retrieval oversampling multiplier when filters are active
    #[serde(default = "default_filter_factor")]
    pub filter_factor: usize,

    /// Text weight [0.0, 1.0] when combining text and image queries
    #[serde(default = "default_text_weight")]
    pub text_weight: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: DEFAULT_TOP_K,
            max_top_k: DEFAULT_MAX_TOP_K,
            rerank_factor: DEFAULT_RERANK_FACTOR,
            filter_factor: DEFAULT_FILTER_FACTOR,
            text_weight: DEFAULT_TEXT_WEIGHT,
        }
    }
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_max_top_k() -> usize {
    DEFAULT_MAX_TOP_K
}

fn default_rerank_factor() -> usize {
    DEFAULT_RERANK_FACTOR
}

fn default_filter_factor() -> usize {
    DEFAULT_FILTER_FACTOR
}

fn default_text_weight() -> f32 {
    DEFAULT_TEXT_WEIGHT
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub search: SearchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Config {
    fn validate(&mut self) {
        if self.embedding.text_model.trim().is_empty() {
            panic!("embedding.text_model must not be empty");
        }
        if self.embedding.download_timeout_secs == 0 {
            panic!("embedding.download_timeout_secs must be greater than 0");
        }
        if let Some(remote) = &self.embedding.remote {
            if remote.endpoint.trim().is_empty() {
                panic!("embedding.remote.endpoint must not be empty");
            }
            if remote.dimensions == 0 {
                panic!("embedding.remote.dimensions must be greater than 0");
            }
        }
        if self.embedding.prefer_remote && self.embedding.remote.is_none() {
            panic!("embedding.prefer_remote is set but embedding.remote is missing");
        }

        if self.search.default_top_k == 0 {
            panic!("search.default_top_k must be greater than 0");
        }
        if self.search.max_top_k < self.search.default_top_k {
            panic!(
                "search.max_top_k ({}) must be at least search.default_top_k ({})",
                self.search.max_top_k, self.search.default_top_k
            );
        }
        if self.search.rerank_factor == 0 || self.search.filter_factor == 0 {
            panic!("search oversampling factors must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.search.text_weight) {
            panic!(
                "search.text_weight must be between 0.0 and 1.0, got {}",
                self.search.text_weight
            );
        }

        if self.server.max_body_mb == 0 {
            panic!("server.max_body_mb must be greater than 0");
        }
        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            panic!("server.listen is not a valid socket address: {}", self.server.listen);
        }
    }

    pub fn load_with(base_path: &str) -> Self {
        let path = Path::new(base_path).join("config.yaml");

        // create new if does not exist
        if !path.exists() {
            std::fs::create_dir_all(base_path).expect("cannot create data directory");
            std::fs::write(&path, serde_yml::to_string(&Self::default()).unwrap())
                .expect("cannot write default config");
        }

        let config_str = std::fs::read_to_string(&path).expect("cannot read config file");
        let mut config: Self = serde_yml::from_str(&config_str).expect("config is malformed");

        config.base_path = base_path.to_string();

        config.validate();

        // resave in case config version needs an upgrade
        let serialized = serde_yml::to_string(&config).unwrap();
        if config_str != serialized {
            std::fs::write(&path, serialized).expect("cannot write config file");
        }

        config
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Directory model downloads are cached under.
    pub fn cache_dir(&self) -> PathBuf {
        PathBuf::from(&self.base_path)
    }

    /// Directory index generations are persisted under.
    pub fn index_dir(&self) -> PathBuf {
        PathBuf::from(&self.base_path).join("index")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let mut config = Config::default();
        config.validate();
    }

    #[test]
    #[should_panic(expected = "text_weight")]
    fn test_out_of_range_text_weight_panics() {
        let mut config = Config::default();
        config.search.text_weight = 1.5;
        config.validate();
    }

    #[test]
    #[should_panic(expected = "prefer_remote")]
    fn test_prefer_remote_without_remote_panics() {
        let mut config = Config::default();
        config.embedding.prefer_remote = true;
        config.validate();
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = std::env::temp_dir().join(format!("vogue-config-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let config = Config::load_with(dir.to_str().unwrap());
        assert!(dir.join("config.yaml").exists());
        assert_eq!(config.search.default_top_k, DEFAULT_TOP_K);
        assert_eq!(config.embedding.text_model, DEFAULT_TEXT_MODEL);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
