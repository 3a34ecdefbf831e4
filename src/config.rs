use crate::error::CapstanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CipherMode {
    Cbc,
    Gcm,
}

impl std::fmt::Display for CipherMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherMode::Cbc => write!(f, "AES256-CBC"),
            CipherMode::Gcm => write!(f, "AES256-GCM"),
        }
    }
}

/// Runtime configuration for a capstan engine instance.
#[derive(Debug, Clone)]
pub struct CapstanConfig {
    /// Storage-core cache budget in megabytes.
    pub cache_size_mb: u64,
    /// Idle session TTL for the session sweeper. Zero closes aggressively.
    pub session_close_idle_time_secs: u64,
    /// Journal flusher period; 0 falls back to the 100ms default.
    pub journal_commit_interval_ms: u64,
    /// Checkpoint worker period.
    pub checkpoint_delay_secs: u64,
    pub journal_compressor: String,
    pub statistics_log_delay_secs: u64,
    /// Affects only how a legacy key-DB directory is migrated.
    pub directory_per_db: bool,
    pub enable_encryption: bool,
    pub cipher_mode: CipherMode,
    /// One-shot master key rotation trigger. Startup aborts with a
    /// rotation-finished status once the new key is in place.
    pub rotate_master_key: bool,
    /// When false the engine keeps no data history and only full
    /// checkpoints are taken.
    pub enable_majority_read_concern: bool,
    pub concurrent_read_transactions: usize,
    pub concurrent_write_transactions: usize,
    /// Extra options appended verbatim to the storage-core open config.
    pub extra_open_options: String,
    /// Extra per-table options appended to record-store create configs.
    pub record_store_options: String,
    /// Extra per-table options appended to index create configs.
    pub index_options: String,
}

impl Default for CapstanConfig {
    fn default() -> Self {
        Self {
            cache_size_mb: 1024,
            session_close_idle_time_secs: if cfg!(debug_assertions) { 5 } else { 300 },
            journal_commit_interval_ms: 100,
            checkpoint_delay_secs: 60,
            journal_compressor: "snappy".into(),
            statistics_log_delay_secs: 0,
            directory_per_db: false,
            enable_encryption: false,
            cipher_mode: CipherMode::Cbc,
            rotate_master_key: false,
            enable_majority_read_concern: true,
            concurrent_read_transactions: 128,
            concurrent_write_transactions: 128,
            extra_open_options: String::new(),
            record_store_options: String::new(),
            index_options: String::new(),
        }
    }
}

impl CapstanConfig {
    pub fn validate(&self) -> Result<(), CapstanError> {
        if self.journal_commit_interval_ms > 500 {
            return Err(CapstanError::InvalidConfig {
                message: format!(
                    "journal_commit_interval_ms must be <= 500, got {}",
                    self.journal_commit_interval_ms
                ),
            });
        }
        if self.checkpoint_delay_secs == 0 {
            return Err(CapstanError::InvalidConfig {
                message: "checkpoint_delay_secs must be > 0".into(),
            });
        }
        if self.concurrent_read_transactions == 0 || self.concurrent_write_transactions == 0 {
            return Err(CapstanError::InvalidConfig {
                message: "concurrent transaction limits must be > 0".into(),
            });
        }
        if self.rotate_master_key && !self.enable_encryption {
            return Err(CapstanError::InvalidConfig {
                message: "rotate_master_key requires enable_encryption".into(),
            });
        }
        Ok(())
    }

    pub fn encrypted(cipher_mode: CipherMode) -> Self {
        Self {
            enable_encryption: true,
            cipher_mode,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CapstanConfig, CipherMode};

    #[test]
    fn default_config_is_valid() {
        CapstanConfig::default().validate().expect("valid");
    }

    #[test]
    fn rejects_zero_ticket_capacity() {
        let cfg = CapstanConfig {
            concurrent_write_transactions: 0,
            ..CapstanConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_rotation_without_encryption() {
        let cfg = CapstanConfig {
            rotate_master_key: true,
            ..CapstanConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cipher_mode_renders_extension_names() {
        assert_eq!(CipherMode::Cbc.to_string(), "AES256-CBC");
        assert_eq!(CipherMode::Gcm.to_string(), "AES256-GCM");
    }
}
