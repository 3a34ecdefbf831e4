//! Opening the storage core: config assembly, compatibility-version
//! negotiation, metadata salvage bootstrap and the journal-to-nojournal
//! transition.

use crate::config::CapstanConfig;
use crate::core::{CoreCode, CoreConnection, CoreDriver, CoreError};
use crate::error::CapstanError;
use crate::repl::{FcvVersion, FcvView, ReplicationView};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const REPAIR_MSG: &str = "This version of the storage engine detected metadata corruption. \
     Restart with --repair to salvage the instance metadata.";

/// On-disk compatibility level the engine managed to open at. Determines
/// whether data files must be downgraded when the engine shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileVersion {
    Compat10,
    Compat11,
    Current,
}

impl FileVersion {
    pub fn require_min(self) -> &'static str {
        match self {
            FileVersion::Compat10 => "compatibility=(require_min=\"1.0.0\")",
            FileVersion::Compat11 => "compatibility=(require_min=\"1.1.0\")",
            FileVersion::Current => "compatibility=(require_min=\"1.2.0\")",
        }
    }

    /// Whether shutdown must rewrite data files to an older compatibility
    /// level. Read-only nodes never touch files; arbiters carry no FCV
    /// document and always downgrade; otherwise the FCV document and the
    /// replication state decide.
    pub fn should_downgrade(
        self,
        read_only: bool,
        repl: &dyn ReplicationView,
        fcv: &dyn FcvView,
        has_recovery_timestamp: bool,
    ) -> bool {
        if read_only {
            return false;
        }

        if repl.member_state().is_arbiter() {
            return true;
        }

        if !fcv.is_initialized() {
            // Trust the version we discovered on disk at startup and leave
            // the files the way we found them.
            return matches!(self, FileVersion::Compat10 | FileVersion::Compat11);
        }

        if fcv.version() != FcvVersion::FullyDowngraded {
            return false;
        }

        if repl.using_replsets() {
            // Startup replication recovery has already run; downgrading is
            // safe.
            return true;
        }

        if has_recovery_timestamp {
            // A recovery timestamp means replication recovery was required
            // but this standalone never ran it. Keep the current format.
            return false;
        }

        true
    }

    pub fn downgrade_config(self, fcv: &dyn FcvView) -> &'static str {
        if !fcv.is_initialized() {
            return match self {
                FileVersion::Compat10 => "compatibility=(release=1.0)",
                FileVersion::Compat11 => "compatibility=(release=1.1)",
                FileVersion::Current => unreachable!("current files never downgrade without FCV"),
            };
        }
        "compatibility=(release=1.1)"
    }
}

/// Result of a negotiated open.
#[derive(Debug)]
pub struct OpenedCore {
    pub conn: Arc<dyn CoreConnection>,
    pub file_version: FileVersion,
    /// Set when the instance metadata had to be salvaged to open at all.
    pub salvaged_metadata: bool,
}

/// Assembles the base open-config string from the engine tunables.
pub fn build_open_config(
    config: &CapstanConfig,
    read_only: bool,
    encryption_extension: Option<&str>,
    table_create_config: &str,
) -> String {
    let mut cfg = String::new();
    cfg.push_str("create,");
    cfg.push_str(&format!("cache_size={}M,", config.cache_size_mb));
    cfg.push_str("session_max=20000,");
    cfg.push_str("eviction=(threads_min=4,threads_max=4),");
    cfg.push_str("config_base=false,");
    cfg.push_str("statistics=(fast),");
    if !read_only {
        cfg.push_str(&format!(
            "log=(enabled=true,archive=true,path=journal,compressor={}),",
            config.journal_compressor
        ));
        cfg.push_str("file_manager=(close_idle_time=100000),");
        cfg.push_str(&format!(
            "statistics_log=(wait={}),",
            config.statistics_log_delay_secs
        ));
    }
    if let Some(ext) = encryption_extension {
        cfg.push_str(&format!("extensions=[{ext}],"));
    }
    cfg.push_str(table_create_config);
    cfg.push_str(&config.extra_open_options);
    if read_only {
        cfg.push_str(",readonly=true,");
    }
    cfg
}

/// Replays and removes a leftover journal when durability has been turned
/// off: open once with logging so the core recovers from the WAL, close,
/// delete the journal directory.
pub fn nojournal_transition(
    driver: &dyn CoreDriver,
    path: &Path,
    journal_config: &str,
) -> Result<(), CapstanError> {
    info!("detected journal files; running recovery from last checkpoint before disabling the journal");
    let conn = driver
        .open(path, journal_config)
        .map_err(|e| match e.code {
            CoreCode::Invalid => CapstanError::InvalidConfig {
                message: format!("journal transition open failed: {}", e.reason),
            },
            _ => CapstanError::Core(e),
        })?;
    conn.close("").map_err(CapstanError::Core)?;
    let journal_path = path.join("journal");
    std::fs::remove_dir_all(&journal_path).map_err(|e| {
        error!(path = %journal_path.display(), "error removing journal dir: {e}");
        CapstanError::Io(e)
    })?;
    Ok(())
}

/// Tries the open at each supported compatibility level, newest first, and
/// falls back to metadata salvage when permitted.
pub fn open_core(
    driver: &dyn CoreDriver,
    path: &Path,
    base_config: &str,
    in_repair_mode: bool,
) -> Result<OpenedCore, CapstanError> {
    let attempts = [
        FileVersion::Current,
        FileVersion::Compat11,
        FileVersion::Compat10,
    ];

    let mut last_err: Option<CoreError> = None;
    for version in attempts {
        let config = format!("{base_config},{}", version.require_min());
        match driver.open(path, &config) {
            Ok(conn) => {
                return Ok(OpenedCore {
                    conn,
                    file_version: version,
                    salvaged_metadata: false,
                })
            }
            Err(e) => last_err = Some(e),
        }
    }

    let err = last_err.expect("at least one open attempt");
    warn!("failed to open the storage core under any compatibility version");

    if err.code == CoreCode::Invalid {
        return Err(CapstanError::InvalidConfig {
            message: format!("storage core rejected the open config: {}", err.reason),
        });
    }

    if err.code == CoreCode::TrySalvage {
        warn!("storage core metadata corruption detected");
        if !in_repair_mode {
            error!("{REPAIR_MSG}");
            return Err(CapstanError::MetadataCorruption {
                reason: err.reason.clone(),
            });
        }
    } else if !in_repair_mode {
        return Err(CapstanError::Core(err));
    }

    // In repair mode any remaining failure is worth a salvage attempt.
    warn!("attempting to salvage the storage core metadata");
    let salvage_config = format!("{base_config},salvage=true");
    match driver.open(path, &salvage_config) {
        Ok(conn) => Ok(OpenedCore {
            conn,
            file_version: FileVersion::Current,
            salvaged_metadata: true,
        }),
        Err(e) => {
            error!("failed to salvage storage core metadata: {}", e.reason);
            Err(CapstanError::MetadataCorruption { reason: e.reason })
        }
    }
}
