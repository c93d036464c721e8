//! Layered configuration: optional TOML file overlaid by `FACEWATCH_*`
//! environment variables.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("face API endpoint not configured (set [api] endpoint or FACEWATCH_API_ENDPOINT)")]
    MissingEndpoint,
    #[error("face API key not configured (set [api] key or FACEWATCH_API_KEY)")]
    MissingKey,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Face API base URL, e.g. "https://uksouth.api.cognitive.microsoft.com".
    pub endpoint: String,
    pub key: String,
    /// Default match threshold; the monitor flag overrides it.
    pub confidence_threshold: f32,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            key: String::new(),
            confidence_threshold: 0.5,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub device: String,
    /// Frames discarded at session start for AGC/AE stabilization.
    pub warmup_frames: usize,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            warmup_frames: 4,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// Path to the SCRFD ONNX model file.
    pub model_path: PathBuf,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            model_path: data_dir().join("models/det_10g.onnx"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Persisted reference model record.
    pub model_file: PathBuf,
    /// Annotated preview frame written when --display is on.
    pub preview_file: PathBuf,
    /// Single-instance guard for the monitor command.
    pub pid_file: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let data = data_dir();
        Self {
            model_file: data.join("reference.json"),
            preview_file: data.join("preview.png"),
            pid_file: std::env::temp_dir().join("facewatch.pid"),
        }
    }
}

impl Settings {
    /// Load settings from `explicit` if given, else from the default
    /// config path when it exists, else defaults. Environment variables
    /// override the file either way.
    pub fn load(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let p = default_config_path();
                p.exists().then_some(p)
            }
        };

        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| SettingsError::Read {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| SettingsError::Parse { path, source })?
            }
            None => Settings::default(),
        };

        settings.apply_env();
        Ok(settings)
    }

    /// Overlay `FACEWATCH_*` environment variables.
    fn apply_env(&mut self) {
        env_string(&mut self.api.endpoint, "FACEWATCH_API_ENDPOINT");
        env_string(&mut self.api.key, "FACEWATCH_API_KEY");
        env_f32(&mut self.api.confidence_threshold, "FACEWATCH_CONFIDENCE_THRESHOLD");
        env_string(&mut self.camera.device, "FACEWATCH_CAMERA_DEVICE");
        env_usize(&mut self.camera.warmup_frames, "FACEWATCH_WARMUP_FRAMES");
        env_path(&mut self.detector.model_path, "FACEWATCH_DETECTOR_MODEL");
        env_path(&mut self.storage.model_file, "FACEWATCH_MODEL_FILE");
        env_path(&mut self.storage.preview_file, "FACEWATCH_PREVIEW_FILE");
        env_path(&mut self.storage.pid_file, "FACEWATCH_PID_FILE");
    }

    /// Both remote-API fields are mandatory for every command.
    pub fn require_api(&self) -> Result<(), SettingsError> {
        if self.api.endpoint.is_empty() {
            return Err(SettingsError::MissingEndpoint);
        }
        if self.api.key.is_empty() {
            return Err(SettingsError::MissingKey);
        }
        Ok(())
    }
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("facewatch/config.toml")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch")
}

fn env_string(target: &mut String, key: &str) {
    if let Ok(v) = std::env::var(key) {
        *target = v;
    }
}

fn env_path(target: &mut PathBuf, key: &str) {
    if let Ok(v) = std::env::var(key) {
        *target = PathBuf::from(v);
    }
}

fn env_f32(target: &mut f32, key: &str) {
    if let Some(v) = std::env::var(key).ok().and_then(|v| v.parse().ok()) {
        *target = v;
    }
}

fn env_usize(target: &mut usize, key: &str) {
    if let Some(v) = std::env::var(key).ok().and_then(|v| v.parse().ok()) {
        *target = v;
    }
}
