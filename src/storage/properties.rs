use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{
    Error, Result, COMPATIBLE_VERSION, DEFAULT_CACHE_SCALE, DEFAULT_CACHE_SIZE_SCALE,
    DEFAULT_LOG_SIZE_MB, DEFAULT_WRITE_DELAY_SECS, ENGINE_VERSION,
};
use crate::log::LogFormat;

/// Recovery state recorded in the properties file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModificationState {
    /// Files were closed cleanly; data and script agree.
    NotModified,
    /// The database is open or was not shut down; the log must be replayed.
    Modified,
    /// A checkpoint wrote `.new` files but may not have renamed them.
    ModifiedNew,
    /// No files exist yet.
    New,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheProperties {
    /// The cache holds `3 << scale` rows.
    pub scale: u32,
    /// Average row size is taken as `1 << size_scale` bytes.
    pub size_scale: u32,
}

impl Default for CacheProperties {
    fn default() -> Self {
        Self {
            scale: DEFAULT_CACHE_SCALE,
            size_scale: DEFAULT_CACHE_SIZE_SCALE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LogProperties {
    /// Log size that triggers a checkpoint, in MiB; 0 disables the trigger.
    pub size_mb: u32,
    pub format: LogFormat,
    /// Seconds between background syncs.
    pub write_delay_secs: u32,
}

impl Default for LogProperties {
    fn default() -> Self {
        Self {
            size_mb: DEFAULT_LOG_SIZE_MB,
            format: LogFormat::Text,
            write_delay_secs: DEFAULT_WRITE_DELAY_SECS,
        }
    }
}

/// Contents of the `.properties` file, stored as TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseProperties {
    #[serde(skip)]
    path: PathBuf,
    pub version: String,
    pub compatible_version: String,
    pub modified: ModificationState,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub cache: CacheProperties,
    #[serde(default)]
    pub log: LogProperties,
}

impl DatabaseProperties {
    /// Defaults for a database that has no files yet.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            version: ENGINE_VERSION.to_string(),
            compatible_version: COMPATIBLE_VERSION.to_string(),
            modified: ModificationState::New,
            read_only: false,
            cache: CacheProperties::default(),
            log: LogProperties::default(),
        }
    }

    /// Loads `path`, or returns defaults in state `New` if it does not exist.
    ///
    /// Fails with `IncompatibleVersion` when the files need a newer engine.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = match fs::read_to_string(path.as_ref()) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::new(path)),
            Err(e) => return Err(e.into()),
        };
        let mut props: DatabaseProperties = toml::from_str(&text)?;
        props.path = path.as_ref().to_path_buf();

        if parse_version(&props.compatible_version)? > parse_version(ENGINE_VERSION)? {
            return Err(Error::IncompatibleVersion {
                found: props.compatible_version.clone(),
                supported: ENGINE_VERSION.to_string(),
            });
        }
        Ok(props)
    }

    /// Writes the file through a temporary and a rename so readers never see
    /// a partial file.
    pub fn save(&mut self) -> Result<()> {
        self.version = ENGINE_VERSION.to_string();
        let text = toml::to_string_pretty(self)?;
        let tmp = self.path.with_extension("properties.tmp");
        fs::write(&tmp, text)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Records a new modification state and persists it immediately.
    pub fn set_state(&mut self, state: ModificationState) -> Result<()> {
        debug!(from = ?self.modified, to = ?state, "modification state");
        self.modified = state;
        self.save()
    }

    pub fn state(&self) -> ModificationState {
        self.modified
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// Parses `major.minor.patch`; missing parts count as zero.
fn parse_version(v: &str) -> Result<(u32, u32, u32)> {
    let mut parts = v.trim().split('.').map(|p| {
        p.parse::<u32>()
            .map_err(|_| Error::Properties(format!("malformed version {:?}", v)))
    });
    let major = parts.next().unwrap_or(Ok(0))?;
    let minor = parts.next().unwrap_or(Ok(0))?;
    let patch = parts.next().unwrap_or(Ok(0))?;
    Ok((major, minor, patch))
}
