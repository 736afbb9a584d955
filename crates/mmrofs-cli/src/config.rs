//! Tool configuration.
//!
//! Loaded from `mmrofs.toml` in the working directory when present, with
//! environment variables taking priority. Everything here has a sane
//! default; the config file exists so an image path does not have to be
//! repeated on every invocation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use mmrofs_vfs::MountOptions;

pub const CONFIG_FILE: &str = "mmrofs.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Partition image operated on when `--image` is not given.
    pub image: Option<PathBuf>,
    pub mount: MountOptions,
}

impl Config {
    /// Resolution order: defaults → `mmrofs.toml` → environment.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Config::default();

        let path = Path::new(CONFIG_FILE);
        if path.exists() {
            debug!(path = %path.display(), "loading config");
            let contents = std::fs::read_to_string(path)?;
            config = toml::from_str(&contents)?;
        }

        if let Ok(image) = std::env::var("MMROFS_IMAGE") {
            config.image = Some(PathBuf::from(image));
        }
        Ok(config)
    }
}
