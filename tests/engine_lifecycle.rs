//! End-to-end startup and shutdown scenarios against the reference core.

use capstan::core::memcore::MemCoreDriver;
use capstan::core::CoreCode;
use capstan::repl::EngineContext;
use capstan::{CapstanEngine, CapstanError, EngineParams, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn params_with_checkpoint_delay(secs: u64) -> EngineParams {
    let mut params = EngineParams::default();
    params.config.checkpoint_delay_secs = secs;
    params
}

#[test]
fn cold_start_takes_full_checkpoints_until_initial_data() {
    let dir = tempdir().expect("tempdir");
    let driver = Arc::new(MemCoreDriver::new());
    let engine = CapstanEngine::open(
        driver.clone(),
        dir.path(),
        params_with_checkpoint_delay(1),
    )
    .expect("open");

    assert_eq!(engine.recovery_timestamp().expect("supported"), None);
    assert!(dir.path().join("journal").is_dir());

    // Give the checkpointer a couple of ticks. With initial-data at the
    // sentinel, only full (untimestamped) checkpoints are taken, so the
    // core's recovery point stays null.
    std::thread::sleep(Duration::from_millis(2500));
    engine.clean_shutdown();

    let driver2 = Arc::new(MemCoreDriver::new());
    let engine2 =
        CapstanEngine::open(driver2, dir.path(), EngineParams::default()).expect("reopen");
    assert_eq!(engine2.recovery_timestamp().expect("supported"), None);
    engine2.clean_shutdown();
}

#[test]
fn steady_state_publishes_stable_checkpoints() {
    let dir = tempdir().expect("tempdir");
    let driver = Arc::new(MemCoreDriver::new());
    let engine = CapstanEngine::open(
        driver.clone(),
        dir.path(),
        params_with_checkpoint_delay(1),
    )
    .expect("open");

    engine.set_initial_data_timestamp(Timestamp(0x100));
    engine
        .set_stable_timestamp(Timestamp(0x100))
        .expect("set stable");

    // The first-stable trigger wakes the checkpointer immediately; poll
    // briefly for the published checkpoint timestamp.
    let mut published = None;
    for _ in 0..50 {
        let last = engine
            .last_stable_checkpoint_timestamp()
            .expect("supported");
        if last == Some(Timestamp(0x100)) {
            published = last;
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert_eq!(published, Some(Timestamp(0x100)));

    engine.clean_shutdown();
}

#[test]
fn nojournal_transition_removes_journal_dir() {
    let dir = tempdir().expect("tempdir");
    {
        let driver = Arc::new(MemCoreDriver::new());
        let engine = CapstanEngine::open(driver, dir.path(), EngineParams::default())
            .expect("durable open");
        engine.clean_shutdown();
    }
    assert!(dir.path().join("journal").is_dir());

    let driver = Arc::new(MemCoreDriver::new());
    let mut params = EngineParams::default();
    params.settings.durable = false;
    let engine = CapstanEngine::open(driver.clone(), dir.path(), params).expect("nojournal open");
    assert!(!dir.path().join("journal").exists());
    engine.clean_shutdown();

    // Two opens happened: the replay open and the real one.
    assert_eq!(driver.connections().len(), 2);
}

#[test]
fn metadata_salvage_requires_repair_mode() {
    let dir = tempdir().expect("tempdir");
    let driver = Arc::new(MemCoreDriver::new());
    driver.faults().set_open_error(CoreCode::TrySalvage);
    let err = CapstanEngine::open(driver.clone(), dir.path(), EngineParams::default())
        .expect_err("corruption is fatal without repair");
    assert!(matches!(err, CapstanError::MetadataCorruption { .. }));

    driver.faults().set_open_error(CoreCode::TrySalvage);
    let mut params = EngineParams::default();
    params.settings.repair = true;
    let engine = CapstanEngine::open(driver, dir.path(), params).expect("repair salvages");
    assert!(engine.was_modified_by_repair());
    engine.clean_shutdown();
}

#[test]
fn ephemeral_engine_runs_without_checkpointer() {
    let dir = tempdir().expect("tempdir");
    let driver = Arc::new(MemCoreDriver::new());
    let mut params = EngineParams::default();
    params.settings.ephemeral = true;
    let engine = CapstanEngine::open(driver, dir.path(), params).expect("open");
    assert!(!engine.supports_recover_to_stable_timestamp());
    assert!(engine.recovery_timestamp().is_err());
    engine.flush_all_files(true).expect("flush is a no-op");
    engine.clean_shutdown();
}

#[test]
fn context_default_is_standalone() {
    let dir = tempdir().expect("tempdir");
    let driver = Arc::new(MemCoreDriver::new());
    let mut params = EngineParams::default();
    params.context = EngineContext::standalone();
    let engine = CapstanEngine::open(driver, dir.path(), params).expect("open");
    engine.clean_shutdown();
}
