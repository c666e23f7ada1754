use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration shared by every pipeline process.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Broker connection settings.
    pub broker: BrokerSettings,
    /// Exchange, routing key, and queue names.
    pub topology: TopologySettings,
    /// Object storage (MinIO / S3) settings.
    pub storage: StorageSettings,
    /// External tool settings for the OCR stage.
    pub ocr: OcrSettings,
    /// Generative AI provider settings for the summarize stage.
    pub genai: GenAiSettings,
    /// Search engine settings for the index stage.
    pub search: SearchSettings,
    /// Base URL of the document metadata API updated by the result stage.
    pub dms_api_url: String,
    /// Optional upper bound for a single handler invocation.
    pub handler_timeout: Option<Duration>,
}

/// Connection parameters for the AMQP broker.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSettings {
    /// Full AMQP URI; takes precedence over the individual fields below.
    pub url: Option<String>,
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Login password.
    pub password: String,
    /// Virtual host.
    pub vhost: String,
    /// Fixed delay between connection attempts.
    pub retry_delay: Duration,
    /// Maximum connection attempts; `None` retries forever.
    pub max_connect_attempts: Option<u32>,
}

impl BrokerSettings {
    /// Build the AMQP URI, percent-encoding credentials and the virtual host.
    pub fn amqp_uri(&self) -> Result<String, ConfigError> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }

        let mut uri = reqwest::Url::parse(&format!("amqp://{}:{}", self.host, self.port))
            .map_err(|_| ConfigError::InvalidValue("RABBITMQ_HOST".into()))?;
        uri.set_username(&self.user)
            .map_err(|()| ConfigError::InvalidValue("RABBITMQ_USER".into()))?;
        uri.set_password(Some(&self.password))
            .map_err(|()| ConfigError::InvalidValue("RABBITMQ_PASSWORD".into()))?;
        let vhost = self.vhost.replace('%', "%25").replace('/', "%2f");
        Ok(format!("{}/{vhost}", uri.as_str().trim_end_matches('/')))
    }
}

/// Names of the exchange and queues wiring the stages together.
#[derive(Debug, Clone, Deserialize)]
pub struct TopologySettings {
    /// Durable topic exchange used for the upload-triggered publish.
    pub exchange: String,
    /// Routing key binding the OCR queue to the exchange.
    pub ocr_routing_key: String,
    /// Queue consumed by the OCR stage.
    pub ocr_queue: String,
    /// Queue consumed by the summarize stage.
    pub genai_queue: String,
    /// Queue consumed by the result-apply stage.
    pub genai_result_queue: String,
    /// Queue consumed by the index stage.
    pub search_queue: String,
}

/// Object storage endpoint and credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// S3-compatible endpoint URL.
    pub endpoint: String,
    /// Access key id.
    pub access_key: Option<String>,
    /// Secret access key.
    pub secret_key: Option<String>,
    /// Bucket holding uploaded documents.
    pub bucket: String,
    /// Signing region.
    pub region: String,
}

/// External tool configuration for OCR.
#[derive(Debug, Clone, Deserialize)]
pub struct OcrSettings {
    /// Recognition language passed to tesseract.
    pub language: String,
    /// Ghostscript executable.
    pub ghostscript_bin: String,
    /// Tesseract executable.
    pub tesseract_bin: String,
    /// Raster resolution for the rendered page.
    pub raster_dpi: u32,
}

/// Generative AI provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GenAiSettings {
    /// API credential; required only by the summarize stage.
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: String,
    /// API base URL.
    pub base_url: String,
}

impl GenAiSettings {
    /// The API key, or an error naming the missing variable.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVariable("GEMINI_API_KEY".into()))
    }
}

/// Search engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSettings {
    /// Elasticsearch base URL.
    pub url: String,
    /// Index receiving document text.
    pub index: String,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            broker: BrokerSettings {
                url: load_env_optional("RABBITMQ_URL"),
                host: load_env_or("RABBITMQ_HOST", "rabbit"),
                port: parse_env_or("RABBITMQ_PORT", 5672)?,
                user: load_env_or("RABBITMQ_USER", "dev"),
                password: load_env_or("RABBITMQ_PASSWORD", "dev"),
                vhost: load_env_or("RABBITMQ_VHOST", "/"),
                retry_delay: Duration::from_secs(parse_env_or("BROKER_RETRY_DELAY_SECS", 3)?),
                max_connect_attempts: parse_env_optional("BROKER_CONNECT_MAX_ATTEMPTS")?,
            },
            topology: TopologySettings {
                exchange: load_env_or("DMS_EXCHANGE", "dms.exchange"),
                ocr_routing_key: load_env_or("OCR_ROUTING_KEY", "ocr.new"),
                ocr_queue: load_env_or("OCR_QUEUE", "ocr-request"),
                genai_queue: load_env_or("GENAI_QUEUE", "genai-request"),
                genai_result_queue: load_env_or("GENAI_RESULT_QUEUE", "genai-result"),
                search_queue: load_env_or("SEARCH_QUEUE", "search-index"),
            },
            storage: StorageSettings {
                endpoint: load_env_or("MINIO_ENDPOINT", "http://minio:9000"),
                access_key: load_env_optional("MINIO_ACCESS_KEY"),
                secret_key: load_env_optional("MINIO_SECRET_KEY"),
                bucket: load_env_or("MINIO_BUCKET", "documents"),
                region: load_env_or("MINIO_REGION", "us-east-1"),
            },
            ocr: OcrSettings {
                language: load_env_or("OCR_LANGUAGE", "eng"),
                ghostscript_bin: load_env_or("GHOSTSCRIPT_BIN", "gs"),
                tesseract_bin: load_env_or("TESSERACT_BIN", "tesseract"),
                raster_dpi: parse_env_or("OCR_RASTER_DPI", 300)?,
            },
            genai: GenAiSettings {
                api_key: load_env_optional("GEMINI_API_KEY"),
                model: load_env_or("GEMINI_MODEL", "gemini-2.0-flash-lite-001"),
                base_url: load_env_or(
                    "GEMINI_BASE_URL",
                    "https://generativelanguage.googleapis.com",
                ),
            },
            search: SearchSettings {
                url: load_env_or("ELASTICSEARCH_URL", "http://elasticsearch:9200"),
                index: load_env_or("SEARCH_INDEX", "documents"),
            },
            dms_api_url: load_env_or("DMS_API_URL", "http://dms-api:8080"),
            handler_timeout: parse_env_optional::<u64>("HANDLER_TIMEOUT_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        })
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn load_env_or(key: &str, default: &str) -> String {
    load_env_optional(key).unwrap_or_else(|| default.to_string())
}

fn parse_env_optional<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

fn parse_env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    Ok(parse_env_optional(key)?.unwrap_or(default))
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        broker_host = %config.broker.host,
        exchange = %config.topology.exchange,
        bucket = %config.storage.bucket,
        search_index = %config.search.index,
        handler_timeout = ?config.handler_timeout,
        "Loaded configuration"
    );
    Ok(CONFIG.get_or_init(|| config))
}
