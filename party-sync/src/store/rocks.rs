//! RocksDB-backed durable medium.
//!
//! One column family, `records`, holds every persisted record: the device
//! identity, the active party code, and one JSON list per namespace.
//! Values are LZ4 compressed with the uncompressed size prepended.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteOptions,
};
use std::path::PathBuf;
use uuid::Uuid;

use super::medium::{DurableMedium, StoreError};

/// Column family for all records.
const CF_RECORDS: &str = "records";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true, one write per mutation)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
    /// Write buffer size (default: 4MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("party_data"),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 16,
            write_buffer_size: 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB medium. Cheap point lookups, one put per write.
pub struct RocksMedium {
    /// RocksDB instance (single-threaded mode, writes serialized by the store)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    id: Uuid,
}

impl RocksMedium {
    /// Open the medium at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);

        let mut cf_opts = Options::default();
        cf_opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 compressed.
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.set_write_buffer_size(config.write_buffer_size);
        cf_opts.optimize_for_point_lookup(config.block_cache_size as u64);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_RECORDS, cf_opts)],
        )?;

        log::debug!("Opened record store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            id: Uuid::new_v4(),
        })
    }

    /// Get the configured path.
    pub fn path(&self) -> &std::path::Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db.flush_cf(cf)?;
        Ok(())
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db.cf_handle(CF_RECORDS).ok_or_else(|| {
            StoreError::DatabaseError(format!("Column family '{CF_RECORDS}' not found"))
        })
    }
}

impl DurableMedium for RocksMedium {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                let text = String::from_utf8(raw)
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let compressed = lz4_flex::compress_prepend_size(value.as_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(cf, key.as_bytes(), &compressed, &write_opts)?;
        Ok(())
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rocks_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let medium = RocksMedium::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        assert_eq!(medium.get("players:ABCD").unwrap(), None);
        medium.put("players:ABCD", "[]").unwrap();
        medium.put("players:ABCD", r#"[{"id":"x"}]"#).unwrap();
        assert_eq!(
            medium.get("players:ABCD").unwrap().as_deref(),
            Some(r#"[{"id":"x"}]"#)
        );
    }

    #[test]
    fn test_rocks_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let medium = RocksMedium::open(StoreConfig::for_testing(&path)).unwrap();
            medium.put("device_id", "\"abc\"").unwrap();
            medium.flush().unwrap();
        }
        let medium = RocksMedium::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(medium.get("device_id").unwrap().as_deref(), Some("\"abc\""));
        assert_eq!(medium.path(), path.as_path());
    }

    #[test]
    fn test_rocks_large_value_compresses() {
        let dir = tempfile::tempdir().unwrap();
        let medium = RocksMedium::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let value = "[".to_string() + &"{\"id\":\"r\"},".repeat(5000) + "{}]";
        medium.put("rolls:ABCD", &value).unwrap();
        assert_eq!(medium.get("rolls:ABCD").unwrap().unwrap(), value);
    }

    #[test]
    fn test_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("party_data"));
        assert!(config.sync_writes);
        let testing = StoreConfig::for_testing("/tmp/x");
        assert!(!testing.sync_writes);
    }
}
