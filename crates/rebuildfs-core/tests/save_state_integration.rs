mod common;

use common::*;
use rebuildfs_core::{
    open_session, BlockDevice, Engine, RebuildConfig, RebuildError, SaveState, StateManager,
};
use std::path::Path;
use tempfile::TempDir;

fn write_image(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn scenario_state() -> SaveState {
    let engine = Engine::new(ImageBuilder::scenario().into_image(), RebuildConfig::default());
    engine.run(None).unwrap().state
}

#[test]
fn test_saved_bytes_are_stable() {
    let state = scenario_state();
    let bytes = state.save().unwrap();
    let loaded = SaveState::load(&bytes).unwrap();

    assert_eq!(loaded.save().unwrap(), bytes);
    assert_eq!(loaded.partitions[0].tree, state.partitions[0].tree);
    assert_eq!(loaded.partitions[0].records, state.partitions[0].records);
}

#[test]
fn test_rescan_with_prior_state_changes_nothing() {
    let engine = Engine::new(ImageBuilder::scenario().into_image(), RebuildConfig::default());
    let first = engine.run(None).unwrap().state;
    let second = engine.run(Some(first.clone())).unwrap().state;
    assert_eq!(second, first);

    let config = RebuildConfig::default();
    let mut merged = first.clone();
    merged.merge(first.clone(), &config, engine.warnings());
    assert_eq!(merged, first);
}

#[test]
fn test_resume_from_half_scanned_image() {
    let engine = Engine::new(ImageBuilder::scenario().into_image(), RebuildConfig::default());
    let full = engine.run(None).unwrap().state;

    // an interrupted scan that stopped in the middle of the record table
    let split = record_sector(18);
    let mut prior = SaveState::new(engine.fingerprint().unwrap());
    prior.scanned.insert(0, split);
    for (from, to) in [
        (&full.hits.boot, &mut prior.hits.boot),
        (&full.hits.file, &mut prior.hits.file),
        (&full.hits.indx, &mut prior.hits.indx),
    ] {
        to.extend(from.iter().copied().filter(|&sector| sector < split));
    }
    assert!(prior.hits.file.len() < full.hits.file.len());

    let resumed = engine.run(Some(prior)).unwrap();
    assert!(resumed.completed);
    assert_eq!(resumed.state.scanned, full.scanned);
    assert_eq!(resumed.state.hits, full.hits);
    assert_eq!(resumed.state.partitions, full.partitions);
}

#[test]
fn test_session_resume_and_fingerprint_check() {
    let dir = TempDir::new().unwrap();
    let bytes = ImageBuilder::scenario().into_bytes();
    let image = write_image(dir.path(), "disk.img", &bytes);
    let state_path = dir.path().join("disk.state.json");

    let engine = Engine::new(BlockDevice::open(&image).unwrap(), RebuildConfig::default());
    let first = open_session(&engine, Some(state_path.as_path()), false).unwrap();
    assert!(state_path.exists());
    assert_eq!(first.state.partitions.len(), 1);

    let resumed = open_session(&engine, Some(state_path.as_path()), false).unwrap();
    assert_eq!(resumed.state.partitions, first.state.partitions);
    assert_eq!(resumed.state.created_at, first.state.created_at);

    // same size, different last sector
    let mut changed = bytes.clone();
    let last = changed.len() - 1;
    changed[last] ^= 0xFF;
    let other = write_image(dir.path(), "other.img", &changed);
    let engine = Engine::new(BlockDevice::open(&other).unwrap(), RebuildConfig::default());

    let err = open_session(&engine, Some(state_path.as_path()), false).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RebuildError>(),
        Some(RebuildError::FingerprintMismatch(_))
    ));

    let forced = open_session(&engine, Some(state_path.as_path()), true).unwrap();
    assert_eq!(forced.state.partitions.len(), 1);
    let on_disk = StateManager::new(&state_path).read().unwrap();
    assert_eq!(on_disk.fingerprint, forced.state.fingerprint);
}

#[test]
fn test_state_from_newer_version_is_refused() {
    let dir = TempDir::new().unwrap();
    let manager = StateManager::new(dir.path().join("scan.json"));
    manager.write_atomic(&scenario_state()).unwrap();

    let mut value: serde_json::Value =
        serde_json::from_slice(&std::fs::read(manager.path()).unwrap()).unwrap();
    value["version"] = serde_json::json!(99);
    std::fs::write(manager.path(), serde_json::to_vec(&value).unwrap()).unwrap();

    assert!(matches!(
        manager.read(),
        Err(RebuildError::SaveStateVersionMismatch { .. })
    ));
}

#[test]
fn test_truncated_state_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let manager = StateManager::new(dir.path().join("scan.json"));
    manager.write_atomic(&scenario_state()).unwrap();

    let bytes = std::fs::read(manager.path()).unwrap();
    std::fs::write(manager.path(), &bytes[..bytes.len() / 2]).unwrap();
    assert!(matches!(manager.read(), Err(RebuildError::SaveStateCorrupt(_))));
}
