use crate::error::MonitorError;
use crate::inference::Thresholds;
use crate::pipeline::InputLayout;
use crate::stability::StabilityPolicy;
use crate::watch::{WatchBackend, WatchOptions};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub monitor: MonitorConfig,
    pub inference: InferenceConfig,
    pub api: ApiConfig,
}

/// Everything one monitoring session needs
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub watch_path: PathBuf,
    pub output_path: PathBuf,
    pub generate_json: bool,
    pub thresholds: Thresholds,
    pub layout: InputLayout,
    pub watch: WatchOptions,
    pub stability: StabilityPolicy,
}

impl MonitorConfig {
    /// Defaults for everything except the two roots
    pub fn new(watch_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            watch_path: watch_path.into(),
            output_path: output_path.into(),
            generate_json: false,
            thresholds: Thresholds::default(),
            layout: InputLayout::default(),
            watch: WatchOptions::default(),
            stability: StabilityPolicy::default(),
        }
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        let t = &self.thresholds;
        for (name, value) in [
            ("CONFIDENCE", t.confidence),
            ("PIXEL_CONFIDENCE", t.pixel_confidence),
            ("IOU", t.iou),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MonitorError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if self.layout.extensions.is_empty() {
            return Err(MonitorError::Config("IMAGE_EXTENSIONS is empty".to_string()));
        }
        if self.stability.max_attempts == 0 {
            return Err(MonitorError::Config(
                "STABILITY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub model_path: Option<PathBuf>,
    pub labels: Vec<String>,
    pub input_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

/// `config.json` as written by earlier deployments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FileConfig {
    pub model_path: Option<String>,
    pub watch_path: Option<String>,
    pub output_path: Option<String>,
}

impl FileConfig {
    /// Missing file is not an error; a malformed one is.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let parsed = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file {}: {}", path.display(), e))?;
        Ok(Some(parsed))
    }
}

impl Config {
    /// Environment variables override `CONFIG_PATH` (default `./config.json`).
    pub fn load() -> Result<Self> {
        let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());
        let file = FileConfig::read(Path::new(&config_path))?;

        Self::from_sources(file.unwrap_or_default(), |key| env::var(key).ok())
    }

    pub fn from_sources<F>(file: FileConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // Paths
        let watch_path = non_empty("WATCH_PATH")
            .or(file.watch_path)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| MonitorError::Config("WATCH_PATH is not set".to_string()))?;

        let output_path = non_empty("OUTPUT_PATH")
            .or(file.output_path)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("Output"));

        // Thresholds
        let defaults = Thresholds::default();
        let thresholds = Thresholds {
            confidence: parse_or(&lookup, "CONFIDENCE", defaults.confidence),
            pixel_confidence: parse_or(&lookup, "PIXEL_CONFIDENCE", defaults.pixel_confidence),
            iou: parse_or(&lookup, "IOU", defaults.iou),
        };

        // Input layout
        let station_prefix = lookup("STATION_PREFIX").unwrap_or_else(|| "S".to_string());
        let extensions = match lookup("IMAGE_EXTENSIONS") {
            Some(list) => split_list(&list)
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_string())
                .collect(),
            None => InputLayout::default().extensions,
        };

        // Watching
        let backend = match lookup("WATCH_BACKEND").as_deref().map(str::trim) {
            None | Some("") | Some("native") => WatchBackend::Native,
            Some("poll") => WatchBackend::Poll,
            Some(other) => {
                return Err(MonitorError::Config(format!(
                    "WATCH_BACKEND must be 'native' or 'poll', got '{}'",
                    other
                ))
                .into())
            }
        };
        let watch = WatchOptions {
            debounce: Duration::from_millis(parse_or(&lookup, "WATCH_DEBOUNCE_MS", 1000)),
            backend,
            poll_interval: Duration::from_millis(parse_or(&lookup, "WATCH_POLL_MS", 2000)),
        };

        let stability = StabilityPolicy {
            poll_interval: Duration::from_millis(parse_or(&lookup, "STABILITY_POLL_MS", 100)),
            max_attempts: parse_or(&lookup, "STABILITY_MAX_ATTEMPTS", 80),
        };

        let monitor = MonitorConfig {
            watch_path,
            output_path,
            generate_json: parse_or(&lookup, "GENERATE_JSON", false),
            thresholds,
            layout: InputLayout {
                station_prefix,
                extensions,
            },
            watch,
            stability,
        };
        monitor.validate()?;

        // Model
        let inference = InferenceConfig {
            model_path: non_empty("MODEL_PATH").or(file.model_path).map(PathBuf::from),
            labels: lookup("MODEL_LABELS").map(|l| split_list(&l)).unwrap_or_default(),
            input_size: parse_or(&lookup, "MODEL_INPUT_SIZE", 640),
        };

        // Status API
        let api = ApiConfig {
            enabled: parse_or(&lookup, "API_ENABLED", true),
            host: lookup("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&lookup, "API_PORT", 8080),
        };

        Ok(Config {
            monitor,
            inference,
            api,
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
