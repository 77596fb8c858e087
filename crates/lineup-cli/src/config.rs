use lineup_core::lbph::LbphParams;
use lineup_core::{DetectParams, PipelineConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    Env { key: &'static str, value: String },
}

/// Runtime configuration: defaults, then an optional TOML file, then
/// `LINEUP_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture resolution; the driver may pick the nearest it supports.
    pub camera_width: u32,
    pub camera_height: u32,
    /// OpenCV Haar cascade XML used to locate faces.
    pub cascade_path: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Face crops captured per enrollment.
    pub quota: usize,
    /// LBPH distances below this are accepted as a match.
    pub match_threshold: f64,
    pub scale_factor: f64,
    pub min_neighbors: u32,
    /// Smallest face side in pixels; 0 uses the cascade window.
    pub min_face_size: u32,
    pub tick_interval_ms: u64,
    /// Give up recognising after this many seconds; 0 waits until Ctrl-C.
    pub recognize_timeout_secs: u64,
    /// Flip camera frames horizontally, as a mirror would.
    pub mirror: bool,
    /// Write the latest annotated frame here during camera sessions.
    pub preview_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults(|key| std::env::var(key).ok())
    }
}

impl Config {
    /// Load from `file` (or `$LINEUP_CONFIG`), then apply environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(file, |key| std::env::var(key).ok())
    }

    fn load_with(
        file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file = file
            .map(Path::to_path_buf)
            .or_else(|| env("LINEUP_CONFIG").map(PathBuf::from));

        let mut config = match &file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Self::from_toml(&raw, &env).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            None => Self::defaults(&env),
        };
        config.apply_env(&env)?;
        Ok(config)
    }

    fn from_toml(raw: &str, env: impl Fn(&str) -> Option<String>) -> Result<Self, toml::de::Error> {
        // Fields missing from the file fall back to `Default`, which reads the
        // process environment; re-derive the env-dependent default explicitly.
        let defaults = Self::defaults(&env);
        let mut parsed: Self = toml::from_str(raw)?;
        let table: toml::Table = toml::from_str(raw)?;
        if !table.contains_key("db_path") {
            parsed.db_path = defaults.db_path;
        }
        Ok(parsed)
    }

    fn defaults(env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("lineup");

        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            cascade_path: PathBuf::from("haarcascade_frontalface_default.xml"),
            db_path: data_dir.join("lineup.db"),
            quota: lineup_core::enroll::DEFAULT_QUOTA,
            match_threshold: lineup_core::pipeline::DEFAULT_MATCH_THRESHOLD,
            scale_factor: 1.3,
            min_neighbors: 5,
            min_face_size: 0,
            tick_interval_ms: 100,
            recognize_timeout_secs: 0,
            mirror: true,
            preview_path: None,
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = env("LINEUP_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = env("LINEUP_CASCADE_PATH") {
            self.cascade_path = PathBuf::from(v);
        }
        if let Some(v) = env("LINEUP_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("LINEUP_PREVIEW_PATH") {
            self.preview_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        env_parse(&env, "LINEUP_CAMERA_WIDTH", &mut self.camera_width)?;
        env_parse(&env, "LINEUP_CAMERA_HEIGHT", &mut self.camera_height)?;
        env_parse(&env, "LINEUP_QUOTA", &mut self.quota)?;
        env_parse(&env, "LINEUP_MATCH_THRESHOLD", &mut self.match_threshold)?;
        env_parse(&env, "LINEUP_SCALE_FACTOR", &mut self.scale_factor)?;
        env_parse(&env, "LINEUP_MIN_NEIGHBORS", &mut self.min_neighbors)?;
        env_parse(&env, "LINEUP_MIN_FACE_SIZE", &mut self.min_face_size)?;
        env_parse(&env, "LINEUP_TICK_INTERVAL_MS", &mut self.tick_interval_ms)?;
        env_parse(&env, "LINEUP_RECOGNIZE_TIMEOUT_SECS", &mut self.recognize_timeout_secs)?;
        if let Some(v) = env("LINEUP_MIRROR") {
            self.mirror = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            match_threshold: self.match_threshold,
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            mirror: self.mirror,
            lbph: LbphParams::default(),
        }
    }

    pub fn detect_params(&self) -> DetectParams {
        DetectParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: (self.min_face_size > 0).then_some((self.min_face_size, self.min_face_size)),
        }
    }

    pub fn recognize_timeout(&self) -> Option<Duration> {
        (self.recognize_timeout_secs > 0).then(|| Duration::from_secs(self.recognize_timeout_secs))
    }
}

fn env_parse<T: std::str::FromStr>(
    env: impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = env(key) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { key, value })?;
    }
    Ok(())
}
