//! Dev server configuration
//!
//! Values come from an optional `livebundle.toml` at the project root, then
//! CLI flags override individual fields.
//!
//! ```toml
//! entry_file = "index.js"
//! server_port = 8081
//! cache_dir = ".livebundle-cache"
//!
//! [ios]
//! js_target = "hermes"
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Config file name looked up at the project root
pub const CONFIG_FILE: &str = "livebundle.toml";

/// Default cache directory, relative to the project root
pub const DEFAULT_CACHE_DIR: &str = ".livebundle-cache";

/// Target device platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            other => Err(Error::UnsupportedPlatform(other.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Script engine the bundle is compiled for; part of every transform cache key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsTarget {
    #[default]
    Jsc,
    Hermes,
}

impl JsTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            JsTarget::Jsc => "jsc",
            JsTarget::Hermes => "hermes",
        }
    }
}

/// Per-platform overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub js_target: Option<JsTarget>,
}

/// Contents of `livebundle.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevConfig {
    pub entry_file: String,
    pub server_port: u16,
    pub cache_dir: PathBuf,
    /// Worker pool size for named transform stages (0 = derive from core count)
    pub pool_size: usize,
    /// Coalescing window for filesystem events, in milliseconds
    pub watch_debounce_ms: u64,
    /// How long a bundled client has to open its socket before its session
    /// is dropped, in milliseconds
    pub register_timeout_ms: u64,
    pub ios: PlatformConfig,
    pub android: PlatformConfig,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            entry_file: "index.js".to_string(),
            server_port: 8081,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            pool_size: 0,
            watch_debounce_ms: 50,
            register_timeout_ms: 60_000,
            ios: PlatformConfig::default(),
            android: PlatformConfig::default(),
        }
    }
}

impl DevConfig {
    /// Load `livebundle.toml` from `root`, falling back to defaults when absent
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("{}: {}", CONFIG_FILE, e)))
    }

    /// Script engine configured for a platform
    pub fn js_target(&self, platform: Platform) -> JsTarget {
        let overrides = match platform {
            Platform::Ios => &self.ios,
            Platform::Android => &self.android,
        };
        overrides.js_target.unwrap_or_default()
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    /// Effective worker pool size
    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size > 0 {
            return self.pool_size;
        }
        default_pool_size()
    }
}

/// A third of the available cores, at least one; the rest stay with the
/// bundler engine.
pub fn default_pool_size() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    ((cores as f64 / 3.0).round() as usize).max(1)
}

/// Everything a bundler needs for one (platform, entry) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleTarget {
    pub platform: Platform,
    pub entry_file: String,
    pub js_target: JsTarget,
}

impl BundleTarget {
    pub fn new(config: &DevConfig, platform: Platform) -> Self {
        Self {
            platform,
            entry_file: config.entry_file.clone(),
            js_target: config.js_target(platform),
        }
    }
}
