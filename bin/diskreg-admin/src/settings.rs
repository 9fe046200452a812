//! Admin settings
//!
//! Read from an optional config file (TOML, YAML or JSON by extension),
//! then overlaid with `DISKREG_` environment variables. Nested keys use a
//! double underscore, e.g. `DISKREG_STORAGE__MAX_DISKS_IN_PLACEMENT_GROUP`.

use config::{Config, ConfigError, Environment, File};
use diskreg_common::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings of the admin tool
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSettings {
    /// Path of the registry database file
    pub data_path: PathBuf,
    pub storage: StorageConfig,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("/var/lib/diskreg/registry.redb"),
            storage: StorageConfig::default(),
        }
    }
}

impl AdminSettings {
    /// Load settings from `path` (if any) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix("DISKREG")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let settings = AdminSettings::load(None).unwrap();
        assert_eq!(settings.storage.max_disks_in_placement_group, 5);
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "data_path = \"/tmp/registry.redb\"\n\n[storage]\nmax_disks_in_placement_group = 7"
        )
        .unwrap();

        let settings = AdminSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.data_path, PathBuf::from("/tmp/registry.redb"));
        assert_eq!(settings.storage.max_disks_in_placement_group, 7);
        assert_eq!(settings.storage.max_placement_partition_count, 5);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AdminSettings::load(Some(Path::new("/nonexistent/admin.toml"))).is_err());
    }
}
