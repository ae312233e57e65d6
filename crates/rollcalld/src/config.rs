use anyhow::{bail, Context, Result};
use rollcall_core::{DetectionModel, DEFAULT_TOLERANCE};
use rollcall_extract::ExtractorConfig;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Session => f.write_str("session"),
            BusKind::System => f.write_str("system"),
        }
    }
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus: {other} (expected session or system)")),
        }
    }
}

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite gallery database.
    pub db_path: PathBuf,
    /// Euclidean distance tolerance for a positive match; lower is stricter.
    pub tolerance: f32,
    /// Detector used by the extractor (`hog` or `cnn`).
    pub detection_model: DetectionModel,
    /// Detector upsampling passes.
    pub upsample: u32,
    /// Face extractor executable.
    pub extractor_program: PathBuf,
    /// Extra arguments passed to the extractor before the generated ones.
    pub extractor_args: Vec<String>,
    /// Timeout in seconds for one extractor run.
    pub extract_timeout_secs: u64,
    /// Timeout in milliseconds for each store operation.
    pub store_timeout_ms: u64,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("gallery.db"),
            tolerance: DEFAULT_TOLERANCE,
            detection_model: DetectionModel::Hog,
            upsample: 1,
            extractor_program: PathBuf::from("rollcall-extract-faces"),
            extractor_args: Vec::new(),
            extract_timeout_secs: 30,
            store_timeout_ms: 5_000,
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load from `$ROLLCALL_CONFIG` (if set), apply environment overrides, validate.
    pub fn load() -> Result<Self> {
        let base = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        let config = base.with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&src).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(src: &str) -> Result<Self> {
        Ok(toml::from_str(src)?)
    }

    /// Apply `ROLLCALL_*` overrides read through `lookup`.
    /// Unparseable values are logged and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = parsed(&lookup, "ROLLCALL_TOLERANCE") {
            self.tolerance = v;
        }
        if let Some(v) = parsed(&lookup, "ROLLCALL_DETECTION_MODEL") {
            self.detection_model = v;
        }
        if let Some(v) = parsed(&lookup, "ROLLCALL_UPSAMPLE") {
            self.upsample = v;
        }
        if let Some(v) = lookup("ROLLCALL_EXTRACTOR") {
            self.extractor_program = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_EXTRACTOR_ARGS") {
            self.extractor_args = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = parsed(&lookup, "ROLLCALL_EXTRACT_TIMEOUT_SECS") {
            self.extract_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "ROLLCALL_STORE_TIMEOUT_MS") {
            self.store_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "ROLLCALL_BUS") {
            self.bus = v;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            bail!("tolerance must be a finite, non-negative distance (got {})", self.tolerance);
        }
        if self.store_timeout_ms == 0 {
            bail!("store_timeout_ms must be greater than zero");
        }
        if self.extract_timeout_secs == 0 {
            bail!("extract_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            program: self.extractor_program.clone(),
            args: self.extractor_args.clone(),
            model: self.detection_model,
            upsample: self.upsample,
            timeout: Duration::from_secs(self.extract_timeout_secs),
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment override");
            None
        }
    }
}

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}
