use rollcall_core::recognizer::{DEFAULT_ACCEPTANCE_THRESHOLD, DEFAULT_MATCH_TOLERANCE};
use rollcall_core::{EnrollMode, MatchPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Station configuration: defaults, then an optional TOML file named by
/// `ROLLCALL_CONFIG`, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the SCRFD and ArcFace ONNX files.
    pub model_dir: PathBuf,
    /// One image per enrolled identity; file stem is the label.
    pub gallery_dir: PathBuf,
    /// Append-only attendance CSV.
    pub attendance_path: PathBuf,
    /// Distance gates. The defaults are strict for ArcFace encodings; see
    /// [`DEFAULT_ACCEPTANCE_THRESHOLD`] for the cosine equivalent.
    pub policy: MatchPolicy,
    pub enroll_mode: EnrollMode,
    /// Delay between frame pulls during a session.
    pub tick: Duration,
    /// Frames discarded after opening the camera (auto exposure settling).
    pub warmup_frames: usize,
    /// Consecutive failed reads before a session gives up on the camera.
    pub max_read_failures: u32,
}

/// On-disk form; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    gallery_dir: Option<PathBuf>,
    attendance_path: Option<PathBuf>,
    acceptance_threshold: Option<f32>,
    match_tolerance: Option<f32>,
    enroll_mode: Option<EnrollMode>,
    tick_ms: Option<u64>,
    warmup_frames: Option<usize>,
    max_read_failures: Option<u32>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => read_file(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Ok(Self::from_sources(file, |key| std::env::var(key).ok()))
    }

    fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = env("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| default_data_dir(&env).join("models"));

        Self {
            camera_device: env("ROLLCALL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            model_dir,
            gallery_dir: env("ROLLCALL_GALLERY_DIR")
                .map(PathBuf::from)
                .or(file.gallery_dir)
                .unwrap_or_else(|| PathBuf::from("known_faces")),
            attendance_path: env("ROLLCALL_ATTENDANCE_PATH")
                .map(PathBuf::from)
                .or(file.attendance_path)
                .unwrap_or_else(|| PathBuf::from("attendance.csv")),
            policy: MatchPolicy {
                acceptance_threshold: parsed(&env, "ROLLCALL_ACCEPTANCE_THRESHOLD")
                    .or(file.acceptance_threshold)
                    .unwrap_or(DEFAULT_ACCEPTANCE_THRESHOLD),
                match_tolerance: parsed(&env, "ROLLCALL_MATCH_TOLERANCE")
                    .or(file.match_tolerance)
                    .unwrap_or(DEFAULT_MATCH_TOLERANCE),
            },
            enroll_mode: parsed(&env, "ROLLCALL_ENROLL_MODE")
                .or(file.enroll_mode)
                .unwrap_or_default(),
            tick: Duration::from_millis(
                parsed(&env, "ROLLCALL_TICK_MS").or(file.tick_ms).unwrap_or(10),
            ),
            warmup_frames: parsed(&env, "ROLLCALL_WARMUP_FRAMES")
                .or(file.warmup_frames)
                .unwrap_or(4),
            max_read_failures: parsed(&env, "ROLLCALL_MAX_READ_FAILURES")
                .or(file.max_read_failures)
                .unwrap_or(30)
                .max(1),
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Unparseable values are ignored with a warning.
fn parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}
