//! Storage configuration: sizing and threshold parameters plus file locations.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};

/// Read-only view over the storage configuration consumed by chunk memory,
/// flakes, tables and the deduplication engine.
pub trait ReadonlyStorageConfig: Send + Sync {
    /// Number of chunk table slots added each time the chunk table grows.
    fn maximum_chunk_data_table_size(&self) -> u32;
    /// Size of the buffer used to move chunk content during defragmentation.
    fn defragmentation_transfer_buffer_size(&self) -> u32;
    /// Flakes up to this length are relocated into a single chunk by defragmentation.
    fn defragmentation_chunk_size_threshold(&self) -> u64;
    /// Amount of free space the data file keeps available after growing.
    fn preferred_available_storage_size(&self) -> u64;
    /// Relative growth of the data file per resize.
    fn data_file_increase_rate(&self) -> f64;
    /// Size of the all-zero buffer used to clear storage.
    fn clear_array_size(&self) -> u32;
    /// Smallest chunk handed out by chunk memory.
    fn minimum_chunk_size(&self) -> u64;
    /// Records added per growth step of a fixed-record data table.
    fn table_growth_batch(&self) -> u64;
    /// Path of the chunk table file.
    fn chunk_table_file_path(&self) -> &Path;
    /// Path of the chunk manager index configuration file.
    fn chunk_manager_index_configuration_file_path(&self) -> &Path;
    /// Path of the initialization file.
    fn initialization_file_path(&self) -> &Path;
    /// Path of the data file.
    fn data_file_path(&self) -> &Path;
    /// Path of the configuration file.
    fn configuration_file_path(&self) -> &Path;
}

/// Persisted storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Chunk table slots added per chunk table growth.
    pub maximum_chunk_data_table_size: u32,
    /// Defragmentation copy buffer size in bytes.
    pub defragmentation_transfer_buffer_size: u32,
    /// Relocation threshold for defragmentation in bytes.
    pub defragmentation_chunk_size_threshold: u64,
    /// Free space to keep available in the data file, in bytes.
    pub preferred_available_storage_size: u64,
    /// Relative growth of the data file per resize (0.1 = 10%).
    pub data_file_increase_rate: f64,
    /// Size of the clear buffer in bytes.
    pub clear_array_size: u32,
    /// Smallest chunk in bytes.
    pub minimum_chunk_size: u64,
    /// Records per data table growth batch.
    pub table_growth_batch: u64,
    /// Chunk table file.
    pub chunk_table_file_path: PathBuf,
    /// Chunk manager index configuration file.
    pub chunk_manager_index_configuration_file_path: PathBuf,
    /// Initialization file.
    pub initialization_file_path: PathBuf,
    /// Data file.
    pub data_file_path: PathBuf,
    /// Configuration file.
    pub configuration_file_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            maximum_chunk_data_table_size: 1000,
            defragmentation_transfer_buffer_size: 8192,
            defragmentation_chunk_size_threshold: 200_000,
            preferred_available_storage_size: 0,
            data_file_increase_rate: 0.1,
            clear_array_size: 8192,
            minimum_chunk_size: 4096,
            table_growth_batch: 100,
            chunk_table_file_path: PathBuf::from("flakestore.chunks"),
            chunk_manager_index_configuration_file_path: PathBuf::from("flakestore.index"),
            initialization_file_path: PathBuf::from("flakestore.init"),
            data_file_path: PathBuf::from("flakestore.data"),
            configuration_file_path: PathBuf::from("flakestore.toml"),
        }
    }
}

impl StorageConfig {
    /// Default configuration with every file placed inside `dir`.
    pub fn in_directory(dir: &Path) -> Self {
        let defaults = Self::default();
        Self {
            chunk_table_file_path: dir.join(&defaults.chunk_table_file_path),
            chunk_manager_index_configuration_file_path: dir
                .join(&defaults.chunk_manager_index_configuration_file_path),
            initialization_file_path: dir.join(&defaults.initialization_file_path),
            data_file_path: dir.join(&defaults.data_file_path),
            configuration_file_path: dir.join(&defaults.configuration_file_path),
            ..defaults
        }
    }

    /// Loads a configuration from a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> StorageResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StorageError::io(format!("reading {}", path.display()), e))?;
        let config: StorageConfig = match extension(path).as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| StorageError::SerializationError {
                reason: e.to_string(),
            })?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| StorageError::SerializationError {
                    reason: e.to_string(),
                })?
            }
            other => {
                return Err(StorageError::InvalidConfig {
                    name: "configuration_file_path",
                    reason: format!("unsupported extension '{}'", other),
                })
            }
        };
        config.validate()?;
        debug!(path = %path.display(), "loaded storage configuration");
        Ok(config)
    }

    /// Loads the configuration at `path`, writing the defaults there first if
    /// the file does not exist yet.
    pub fn load_or_create(path: &Path) -> StorageResult<Self> {
        if path.exists() {
            return Self::from_file(path);
        }
        let mut config = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => Self::in_directory(dir),
            _ => Self::default(),
        };
        config.configuration_file_path = path.to_path_buf();
        config.save(path)?;
        info!(path = %path.display(), "created default storage configuration");
        Ok(config)
    }

    /// Writes the configuration to `path` as TOML or JSON, chosen by extension.
    pub fn save(&self, path: &Path) -> StorageResult<()> {
        let contents = match extension(path).as_str() {
            "json" => serde_json::to_string_pretty(self).map_err(|e| {
                StorageError::SerializationError {
                    reason: e.to_string(),
                }
            })?,
            _ => toml::to_string_pretty(self).map_err(|e| StorageError::SerializationError {
                reason: e.to_string(),
            })?,
        };
        std::fs::write(path, contents)
            .map_err(|e| StorageError::io(format!("writing {}", path.display()), e))
    }

    /// Checks every value against its permitted bounds.
    pub fn validate(&self) -> StorageResult<()> {
        fn at_least_one(name: &'static str, value: u64) -> StorageResult<()> {
            if value < 1 {
                return Err(StorageError::InvalidConfig {
                    name,
                    reason: format!("must be at least 1, got {}", value),
                });
            }
            Ok(())
        }

        at_least_one(
            "maximum_chunk_data_table_size",
            self.maximum_chunk_data_table_size as u64,
        )?;
        at_least_one(
            "defragmentation_transfer_buffer_size",
            self.defragmentation_transfer_buffer_size as u64,
        )?;
        at_least_one(
            "defragmentation_chunk_size_threshold",
            self.defragmentation_chunk_size_threshold,
        )?;
        at_least_one("clear_array_size", self.clear_array_size as u64)?;
        at_least_one("minimum_chunk_size", self.minimum_chunk_size)?;
        at_least_one("table_growth_batch", self.table_growth_batch)?;
        if !self.data_file_increase_rate.is_finite() || self.data_file_increase_rate < 0.0 {
            return Err(StorageError::InvalidConfig {
                name: "data_file_increase_rate",
                reason: format!(
                    "must be a finite value >= 0, got {}",
                    self.data_file_increase_rate
                ),
            });
        }
        for (name, path) in [
            ("chunk_table_file_path", &self.chunk_table_file_path),
            ("data_file_path", &self.data_file_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(StorageError::InvalidConfig {
                    name,
                    reason: "path must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Creates every configured file that does not exist yet.
    /// Returns true if all of them were newly created.
    pub fn create_files(&self) -> StorageResult<bool> {
        let mut created_all = true;
        for path in [
            &self.chunk_manager_index_configuration_file_path,
            &self.chunk_table_file_path,
            &self.configuration_file_path,
            &self.data_file_path,
        ] {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => created_all = false,
                Err(e) => {
                    return Err(StorageError::io(format!("creating {}", path.display()), e))
                }
            }
        }
        Ok(created_all)
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase()
}

impl ReadonlyStorageConfig for StorageConfig {
    fn maximum_chunk_data_table_size(&self) -> u32 {
        self.maximum_chunk_data_table_size
    }

    fn defragmentation_transfer_buffer_size(&self) -> u32 {
        self.defragmentation_transfer_buffer_size
    }

    fn defragmentation_chunk_size_threshold(&self) -> u64 {
        self.defragmentation_chunk_size_threshold
    }

    fn preferred_available_storage_size(&self) -> u64 {
        self.preferred_available_storage_size
    }

    fn data_file_increase_rate(&self) -> f64 {
        self.data_file_increase_rate
    }

    fn clear_array_size(&self) -> u32 {
        self.clear_array_size
    }

    fn minimum_chunk_size(&self) -> u64 {
        self.minimum_chunk_size
    }

    fn table_growth_batch(&self) -> u64 {
        self.table_growth_batch
    }

    fn chunk_table_file_path(&self) -> &Path {
        &self.chunk_table_file_path
    }

    fn chunk_manager_index_configuration_file_path(&self) -> &Path {
        &self.chunk_manager_index_configuration_file_path
    }

    fn initialization_file_path(&self) -> &Path {
        &self.initialization_file_path
    }

    fn data_file_path(&self) -> &Path {
        &self.data_file_path
    }

    fn configuration_file_path(&self) -> &Path {
        &self.configuration_file_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = StorageConfig::default();
        assert_eq!(config.maximum_chunk_data_table_size, 1000);
        assert_eq!(config.defragmentation_transfer_buffer_size, 8192);
        assert_eq!(config.defragmentation_chunk_size_threshold, 200_000);
        assert_eq!(config.preferred_available_storage_size, 0);
        assert_eq!(config.data_file_increase_rate, 0.1);
        assert_eq!(config.clear_array_size, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
clear_array_size = 512
data_file_increase_rate = 0.5
data_file_path = "/srv/flakes.data"
"#
        )
        .unwrap();

        let config = StorageConfig::from_file(file.path()).unwrap();
        assert_eq!(config.clear_array_size, 512);
        assert_eq!(config.data_file_increase_rate, 0.5);
        assert_eq!(config.data_file_path, PathBuf::from("/srv/flakes.data"));
        assert_eq!(config.maximum_chunk_data_table_size, 1000);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"minimum_chunk_size": 1024, "table_growth_batch": 10}}"#).unwrap();

        let config = StorageConfig::from_file(file.path()).unwrap();
        assert_eq!(config.minimum_chunk_size, 1024);
        assert_eq!(config.table_growth_batch, 10);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".ini").unwrap();
        let err = StorageConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfig { .. }));
    }

    #[test]
    fn test_validate_rejects_out_of_bounds() {
        let config = StorageConfig {
            clear_array_size: 0,
            ..StorageConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StorageError::InvalidConfig {
                name: "clear_array_size",
                ..
            })
        ));

        let config = StorageConfig {
            data_file_increase_rate: -0.5,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());

        let config = StorageConfig {
            data_file_path: PathBuf::new(),
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        assert!(!path.exists());

        let created = StorageConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.data_file_path, dir.path().join("flakestore.data"));

        let loaded = StorageConfig::load_or_create(&path).unwrap();
        assert_eq!(created, loaded);
    }

    #[test]
    fn test_create_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::in_directory(dir.path());
        assert!(config.create_files().unwrap());
        assert!(config.data_file_path.exists());
        assert!(config.chunk_table_file_path.exists());
        assert!(!config.create_files().unwrap());
    }

    #[test]
    fn test_readonly_view() {
        let config = StorageConfig::default();
        let view: &dyn ReadonlyStorageConfig = &config;
        assert_eq!(view.clear_array_size(), 8192);
        assert_eq!(view.data_file_path(), Path::new("flakestore.data"));
    }
}
