use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub application: ApplicationConfig,
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub fetcher: FetcherConfig,
    pub model: ModelConfig,
    pub queue: QueueConfig,
    pub registry: RegistryConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationConfig {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetcherConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    pub user_agent: String,
    #[serde(default = "default_max_image_bytes")]
    pub max_bytes: u64,
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_image_bytes() -> u64 {
    20 * 1024 * 1024
}

impl FetcherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    pub vision_encoder_file: String,
    pub text_embedding_file: String,
    pub decoder_file: String,
    pub tokenizer_file: String,
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    pub eos_token_id: u32,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default)]
    pub inference_timeout_secs: Option<u64>,
}

fn default_image_size() -> u32 {
    378
}

fn default_max_new_tokens() -> usize {
    32
}

// Each instance holds a full copy of the weights, so one is the safe default.
fn default_model_instances() -> usize {
    1
}

impl ModelConfig {
    pub fn get_vision_encoder_path(&self) -> PathBuf {
        self.model_dir.join(&self.vision_encoder_file)
    }

    pub fn get_text_embedding_path(&self) -> PathBuf {
        self.model_dir.join(&self.text_embedding_file)
    }

    pub fn get_decoder_path(&self) -> PathBuf {
        self.model_dir.join(&self.decoder_file)
    }

    pub fn get_tokenizer_path(&self) -> PathBuf {
        self.model_dir.join(&self.tokenizer_file)
    }

    pub fn inference_timeout(&self) -> Option<Duration> {
        self.inference_timeout_secs.map(Duration::from_secs)
    }
}

impl Validatable for ModelConfig {
    fn validate(&self) -> Result<(), String> {
        if self.num_instances == 0 {
            return Err("model.num_instances must be at least 1".to_string());
        }
        for path in [
            self.get_vision_encoder_path(),
            self.get_text_embedding_path(),
            self.get_decoder_path(),
            self.get_tokenizer_path(),
        ] {
            if !path.exists() {
                return Err(format!("Model file not found: {:?}", path));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default)]
    pub enabled: bool,
    pub bootstrap_servers: String,
    pub group_id: String,
    pub request_topic: String,
    pub result_topic: String,
    pub dead_letter_topic: String,
    pub source_service: String,
    pub result_type_id: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_publish_max_attempts")]
    pub publish_max_attempts: u32,
    #[serde(default = "default_publish_initial_backoff_ms")]
    pub publish_initial_backoff_ms: u64,
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_max_poll_interval_ms() -> u64 {
    300_000
}

fn default_max_batch_size() -> usize {
    5
}

fn default_publish_max_attempts() -> u32 {
    3
}

fn default_publish_initial_backoff_ms() -> u64 {
    200
}

impl Validatable for QueueConfig {
    fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_ms >= self.session_timeout_ms {
            return Err(format!(
                "queue.heartbeat_interval_ms ({}) must be lower than queue.session_timeout_ms ({})",
                self.heartbeat_interval_ms, self.session_timeout_ms
            ));
        }
        if self.publish_max_attempts == 0 {
            return Err("queue.publish_max_attempts must be at least 1".to_string());
        }
        if self.max_batch_size == 0 {
            return Err("queue.max_batch_size must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default)]
    pub enabled: bool,
    pub server_url: String,
    #[serde(default)]
    pub instance_host: Option<String>,
    pub public_ip_url: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Validatable for RegistryConfig {
    fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_secs == 0 {
            return Err("registry.heartbeat_interval_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Config {
    /// The slowest accepted batch must finish inside the consumer's poll
    /// interval, otherwise the broker evicts the consumer mid-analysis and
    /// redelivers the message to another member.
    fn validate_queue_budget(&self) -> Result<(), String> {
        let inference_secs = self.model.inference_timeout_secs.ok_or_else(|| {
            "model.inference_timeout_secs must be set when the queue is enabled".to_string()
        })?;
        let worst_case_ms = (self.queue.max_batch_size as u64)
            .saturating_mul(inference_secs.saturating_add(self.fetcher.timeout_secs))
            .saturating_mul(1000);

        if worst_case_ms >= self.queue.max_poll_interval_ms {
            return Err(format!(
                "queue.max_poll_interval_ms ({}) must exceed queue.max_batch_size x \
                 (model.inference_timeout_secs + fetcher.timeout_secs) = {} ms",
                self.queue.max_poll_interval_ms, worst_case_ms
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("no working directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config = config.try_deserialize::<Config>()?;

    let validations = [
        config.model.validate(),
        if config.queue.enabled {
            config
                .queue
                .validate()
                .and_then(|_| config.validate_queue_budget())
        } else {
            Ok(())
        },
        if config.registry.enabled {
            config.registry.validate()
        } else {
            Ok(())
        },
    ];
    for validation in validations {
        if let Err(e) = validation {
            tracing::error!("Configuration validation failed: {}", e);
            return Err(config::ConfigError::Message(e));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_config() -> QueueConfig {
        QueueConfig {
            enabled: true,
            bootstrap_servers: "localhost:9092".into(),
            group_id: "ai-service-group".into(),
            request_topic: "ai-verification-request".into(),
            result_topic: "ai-verification-result".into(),
            dead_letter_topic: "ai-verification-request-dlt".into(),
            source_service: "image-ai-service".into(),
            result_type_id: "AiVerificationCompletedEvent".into(),
            session_timeout_ms: default_session_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            max_batch_size: default_max_batch_size(),
            publish_max_attempts: default_publish_max_attempts(),
            publish_initial_backoff_ms: default_publish_initial_backoff_ms(),
        }
    }

    #[test]
    fn test_environment_parsing() {
        assert!(matches!(
            Environment::try_from("PRODUCTION".to_string()),
            Ok(Environment::Production)
        ));
        assert!(Environment::try_from("staging".to_string()).is_err());
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::try_from("Debug".to_string()).unwrap().as_str(), "debug");
        assert!(LogLevel::try_from("trace".to_string()).is_err());
    }

    #[test]
    fn test_missing_model_files_fail_validation() {
        let model = ModelConfig {
            model_dir: PathBuf::from("./does_not_exist"),
            vision_encoder_file: "vision_encoder.onnx".into(),
            text_embedding_file: "text_embedding.onnx".into(),
            decoder_file: "text_decoder.onnx".into(),
            tokenizer_file: "tokenizer.json".into(),
            image_size: default_image_size(),
            max_new_tokens: default_max_new_tokens(),
            eos_token_id: 50256,
            num_instances: 1,
            inference_timeout_secs: None,
        };

        let err = model.validate().unwrap_err();
        assert!(err.contains("vision_encoder.onnx"));
    }

    #[test]
    fn test_queue_defaults_are_valid() {
        assert!(queue_config().validate().is_ok());
    }

    #[test]
    fn test_heartbeat_must_be_below_session_timeout() {
        let mut queue = queue_config();
        queue.heartbeat_interval_ms = queue.session_timeout_ms;
        assert!(queue.validate().is_err());
    }

    fn config_with_queue(max_poll_interval_ms: u64, inference_timeout_secs: Option<u64>) -> Config {
        Config {
            application: ApplicationConfig {
                name: "IMAGE-AI-SERVICE".into(),
            },
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8000,
            },
            log_level: LogLevel::Info,
            fetcher: FetcherConfig {
                timeout_secs: 30,
                user_agent: "Mozilla/5.0".into(),
                max_bytes: default_max_image_bytes(),
            },
            model: ModelConfig {
                model_dir: PathBuf::from("./models"),
                vision_encoder_file: "vision_encoder.onnx".into(),
                text_embedding_file: "text_embedding.onnx".into(),
                decoder_file: "text_decoder.onnx".into(),
                tokenizer_file: "tokenizer.json".into(),
                image_size: default_image_size(),
                max_new_tokens: default_max_new_tokens(),
                eos_token_id: 50256,
                num_instances: 1,
                inference_timeout_secs,
            },
            queue: QueueConfig {
                max_poll_interval_ms,
                ..queue_config()
            },
            registry: registry_config(30),
        }
    }

    fn registry_config(heartbeat_interval_secs: u64) -> RegistryConfig {
        RegistryConfig {
            enabled: true,
            server_url: "http://localhost:8761/eureka".into(),
            instance_host: None,
            public_ip_url: "https://api.ipify.org".into(),
            heartbeat_interval_secs,
        }
    }

    #[test]
    fn test_batch_must_fit_in_poll_interval() {
        // 5 images x (240 s inference + 30 s fetch) = 1350 s
        assert!(config_with_queue(1_800_000, Some(240))
            .validate_queue_budget()
            .is_ok());

        let err = config_with_queue(300_000, Some(240))
            .validate_queue_budget()
            .unwrap_err();
        assert!(err.contains("1350000"));
    }

    #[test]
    fn test_queue_requires_inference_timeout() {
        assert!(config_with_queue(1_800_000, None)
            .validate_queue_budget()
            .is_err());
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let mut queue = queue_config();
        queue.max_batch_size = 0;
        assert!(queue.validate().is_err());
    }

    #[test]
    fn test_registry_heartbeat_must_be_positive() {
        assert!(registry_config(30).validate().is_ok());
        assert!(registry_config(0).validate().is_err());
    }
}
