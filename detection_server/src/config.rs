use frame_codec::DEFAULT_MAX_PAYLOAD_SIZE;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    pub detection: DetectionConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
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
pub struct ProtocolConfig {
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_payload_size: default_max_payload_size(),
        }
    }
}

fn default_max_payload_size() -> u64 {
    DEFAULT_MAX_PAYLOAD_SIZE
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeConfig {
    /// Upper bound for reading the request, detecting and writing the response.
    #[serde(default = "default_exchange_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_exchange_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_exchange_timeout_ms() -> u64 {
    60_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    Passthrough,
    Command,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    pub kind: DetectorKind,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub annotation: AnnotationConfig,
    pub command: Option<CommandConfig>,
}

// The detector is accelerator-bound, a single instance is the safe default.
fn default_workers() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    8
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("detection.workers must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("detection.queue_capacity must be at least 1".to_string());
        }
        if self.kind == DetectorKind::Command && self.command.is_none() {
            return Err("detection.kind is `command` but detection.command is missing".to_string());
        }
        if let Some(labels) = &self.annotation.labels {
            labels.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnnotationConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    pub labels: Option<LabelsConfig>,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            iou_threshold: default_iou_threshold(),
            labels: None,
        }
    }
}

fn default_min_confidence() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct LabelsConfig {
    pub labels_file: String,
    pub labels_dir: PathBuf,
}

pub trait Validatable {
    fn get_path(&self) -> PathBuf;

    fn validate(&self) -> Result<(), String> {
        if !self.get_path().exists() {
            return Err(format!("File not found: {:?}", self.get_path()));
        }
        Ok(())
    }
}

impl Validatable for LabelsConfig {
    fn get_path(&self) -> PathBuf {
        self.labels_dir.join(&self.labels_file)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommandConfig {
    pub program: String,
    /// `{input}` and `{output}` are replaced by the per-job image and label paths.
    #[serde(default)]
    pub args: Vec<String>,
    pub work_dir: PathBuf,
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
        .map_err(|e| config::ConfigError::Message(format!("No current directory: {}", e)))?;
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
            config::Environment::with_prefix("DS")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config = config.try_deserialize::<Config>()?;
    if let Err(e) = config.detection.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection_config(kind: DetectorKind) -> DetectionConfig {
        DetectionConfig {
            kind,
            workers: 1,
            queue_capacity: 4,
            annotation: AnnotationConfig::default(),
            command: None,
        }
    }

    #[test]
    fn test_command_detector_requires_command_section() {
        let config = detection_config(DetectorKind::Command);

        assert!(config.validate().is_err());
        assert!(detection_config(DetectorKind::Passthrough).validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = detection_config(DetectorKind::Passthrough);
        config.workers = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_labels_file_rejected() {
        let mut config = detection_config(DetectorKind::Passthrough);
        config.annotation.labels = Some(LabelsConfig {
            labels_file: "missing.txt".to_string(),
            labels_dir: PathBuf::from("./does_not_exist"),
        });

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_parsing() {
        assert!(matches!(
            LogLevel::try_from("DEBUG".to_string()),
            Ok(LogLevel::Debug)
        ));
        assert!(LogLevel::try_from("trace".to_string()).is_err());
    }
}
