//! Durable, resumable snapshots of the training state.
//!
//! Layout under the checkpoint directory:
//! - `iter_XXXXXXXX/` one snapshot per saved iteration, holding whatever the
//!   trainer writes plus `manifest.json`. Saving a tag that is already on disk
//!   writes `iter_XXXXXXXX.N/` next to it and drops the old one afterwards.
//! - `latest.json` pointer to the newest complete snapshot
//!
//! A snapshot is written into `.staging-<name>/` and renamed into place before
//! the pointer moves, and nothing the pointer names is removed until the
//! pointer has moved away from it.

use std::{
    fs::{self, File},
    io::{self, Write},
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{
    config::RunConfig,
    error::{OrchestraError, Result},
    trainer::Trainer,
};

/// Current snapshot format version.
pub const CHECKPOINT_VERSION: u32 = 1;

const MANIFEST: &str = "manifest.json";
const LATEST: &str = "latest.json";
const SNAPSHOT_PREFIX: &str = "iter_";
const STAGING_PREFIX: &str = ".staging-";

/// Metadata written into every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub iteration: u64,
}

/// Content of `latest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub iteration: u64,
    pub snapshot: String,
}

/// Directory name of the snapshot taken after `iteration` completed steps.
pub fn snapshot_name(iteration: u64) -> String {
    format!("{SNAPSHOT_PREFIX}{iteration:08}")
}

/// Saves and restores snapshots in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    keep: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, keep: NonZeroUsize) -> Self {
        Self {
            dir: dir.into(),
            keep: keep.get(),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.checkpoint_dir(), config.keep_checkpoints)
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes a snapshot of `trainer` tagged with `iteration`.
    ///
    /// Failures come back as [`OrchestraError::Checkpoint`]; the previous
    /// snapshot and pointer stay intact.
    pub fn save<T: Trainer>(&self, trainer: &T, iteration: u64) -> Result<PathBuf> {
        let wrap = |source: io::Error| OrchestraError::Checkpoint { iteration, source };

        let name = self.unused_name(iteration);
        let staging = self.dir.join(format!("{STAGING_PREFIX}{name}"));
        let target = self.dir.join(&name);

        fs::create_dir_all(&self.dir).map_err(wrap)?;
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(wrap)?;
        }
        fs::create_dir_all(&staging).map_err(wrap)?;

        trainer
            .save(&staging, iteration)
            .map_err(|e| wrap(io::Error::other(e.to_string())))?;
        write_json_synced(
            &staging.join(MANIFEST),
            &Manifest {
                version: CHECKPOINT_VERSION,
                iteration,
            },
        )
        .map_err(wrap)?;

        fs::rename(&staging, &target).map_err(wrap)?;

        let pointer = self.dir.join(LATEST);
        let tmp = self.dir.join(format!("{LATEST}.tmp"));
        write_json_synced(
            &tmp,
            &LatestPointer {
                iteration,
                snapshot: name.clone(),
            },
        )
        .map_err(wrap)?;
        fs::rename(&tmp, &pointer).map_err(wrap)?;
        sync_dir(&self.dir);

        if let Err(e) = self.prune(iteration, &name) {
            warn!("could not prune old checkpoints in {}: {e}", self.dir.display());
        }

        info!(iteration = iteration; "saved checkpoint to {}", target.display());
        Ok(target)
    }

    /// Reads the pointer. `None` when no snapshot was ever completed.
    pub fn latest(&self) -> Result<Option<LatestPointer>> {
        let path = self.dir.join(LATEST);
        match read_json::<LatestPointer>(&path) {
            Ok(pointer) => Ok(Some(pointer)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OrchestraError::Resume(format!(
                "unreadable {}: {e}",
                path.display()
            ))),
        }
    }

    /// Restores the newest snapshot into `trainer` and returns its iteration,
    /// or 0 when there is nothing to resume from.
    pub fn resume<T: Trainer>(&self, trainer: &mut T, config: &RunConfig) -> Result<u64> {
        let Some(pointer) = self.latest()? else {
            info!("no checkpoint in {}, starting fresh", self.dir.display());
            return Ok(0);
        };

        if pointer.snapshot.is_empty()
            || pointer.snapshot.contains(['/', '\\'])
            || pointer.snapshot.starts_with('.')
        {
            return Err(OrchestraError::Resume(format!(
                "pointer names invalid snapshot {:?}",
                pointer.snapshot
            )));
        }

        let snapshot = self.dir.join(&pointer.snapshot);
        let manifest: Manifest = read_json(&snapshot.join(MANIFEST)).map_err(|e| {
            OrchestraError::Resume(format!(
                "snapshot {} has no usable manifest: {e}",
                snapshot.display()
            ))
        })?;

        if manifest.version > CHECKPOINT_VERSION {
            return Err(OrchestraError::Resume(format!(
                "snapshot version {} is newer than supported {CHECKPOINT_VERSION}",
                manifest.version
            )));
        }
        if manifest.iteration != pointer.iteration {
            return Err(OrchestraError::Resume(format!(
                "pointer says iteration {}, snapshot says {}",
                pointer.iteration, manifest.iteration
            )));
        }

        let restored = trainer.resume(&snapshot, config).map_err(|e| {
            OrchestraError::Resume(format!("trainer rejected {}: {e}", snapshot.display()))
        })?;
        if restored != manifest.iteration {
            return Err(OrchestraError::Resume(format!(
                "trainer restored iteration {restored}, snapshot is {}",
                manifest.iteration
            )));
        }

        info!(iteration = restored; "resumed from {}", snapshot.display());
        Ok(restored)
    }

    /// First free directory name for `iteration`: `iter_XXXXXXXX`, then
    /// `iter_XXXXXXXX.1`, `iter_XXXXXXXX.2`, ...
    fn unused_name(&self, iteration: u64) -> String {
        let base = snapshot_name(iteration);
        if !self.dir.join(&base).exists() {
            return base;
        }
        (1u32..)
            .map(|generation| format!("{base}.{generation}"))
            .find(|name| !self.dir.join(name).exists())
            .unwrap_or(base)
    }

    /// Deletes all but the newest `keep` snapshots, older copies of the
    /// `current` tag and stray staging dirs.
    fn prune(&self, iteration: u64, current: &str) -> io::Result<()> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if name.starts_with(STAGING_PREFIX) {
                debug!("removing stray staging dir {name}");
                fs::remove_dir_all(entry.path())?;
                continue;
            }
            if name == current {
                continue;
            }
            match parse_snapshot_name(&name) {
                Some(tag) if tag == iteration => {
                    debug!("removing superseded checkpoint {name}");
                    fs::remove_dir_all(entry.path())?;
                }
                Some(tag) => snapshots.push((tag, entry.path())),
                None => {}
            }
        }

        snapshots.sort_by(|a, b| b.0.cmp(&a.0));
        for (iteration, path) in snapshots.into_iter().skip(self.keep.saturating_sub(1)) {
            debug!("removing checkpoint {iteration}");
            fs::remove_dir_all(path)?;
        }

        Ok(())
    }
}

/// The iteration tag of a snapshot directory name, generation suffix ignored.
fn parse_snapshot_name(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(SNAPSHOT_PREFIX)?;
    let (tag, generation) = match rest.split_once('.') {
        Some((tag, generation)) => (tag, Some(generation)),
        None => (rest, None),
    };
    if let Some(generation) = generation {
        generation.parse::<u32>().ok()?;
    }
    tag.parse().ok()
}

fn write_json_synced<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut file = File::create(path)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    file.sync_all()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

// Best effort: not every platform can fsync a directory.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::orchestra::{
        topology::Device,
        trainer::{Image, Losses},
    };

    /// Persists one counter into `state.json`.
    #[derive(Debug, Default)]
    struct Counter {
        steps: u64,
        fail_save: bool,
    }

    impl Trainer for Counter {
        type Sample = ();
        type Batch = ();

        fn to_device(&mut self, _: Device) -> Result<()> {
            Ok(())
        }

        fn upload(&self, _: Vec<()>) -> Result<()> {
            Ok(())
        }

        fn discriminator_update(&mut self, _: &(), _: &(), _: &RunConfig) -> Result<()> {
            Ok(())
        }

        fn generator_update(&mut self, _: &(), _: &(), _: &RunConfig) -> Result<()> {
            self.steps += 1;
            Ok(())
        }

        fn sample(&mut self, _: &(), _: &()) -> Result<Vec<Image>> {
            Ok(Vec::new())
        }

        fn update_learning_rate(&mut self) {}

        fn losses(&mut self) -> Result<Losses> {
            Ok(Losses::new())
        }

        fn save(&self, dir: &Path, _: u64) -> Result<()> {
            if self.fail_save {
                return Err(OrchestraError::trainer("save", "disk full"));
            }
            fs::write(dir.join("state.json"), self.steps.to_string())?;
            Ok(())
        }

        fn resume(&mut self, dir: &Path, _: &RunConfig) -> Result<u64> {
            let text = fs::read_to_string(dir.join("state.json"))?;
            self.steps = text
                .trim()
                .parse()
                .map_err(|e| OrchestraError::trainer("resume", e))?;
            Ok(self.steps)
        }
    }

    fn manager(dir: &TempDir, keep: usize) -> CheckpointManager {
        CheckpointManager::new(dir.path().join("Saved_Models"), NonZeroUsize::new(keep).unwrap())
    }

    #[test]
    fn save_then_resume_restores_iteration() {
        let dir = TempDir::new().unwrap();
        let checkpoints = manager(&dir, 3);

        let path = checkpoints.save(&Counter { steps: 2, ..Default::default() }, 2).unwrap();
        assert_eq!(path, checkpoints.dir().join("iter_00000002"));
        assert!(path.join(MANIFEST).exists());

        let latest = checkpoints.latest().unwrap().unwrap();
        assert_eq!(latest.iteration, 2);
        assert_eq!(latest.snapshot, "iter_00000002");

        let mut fresh = Counter::default();
        let iteration = checkpoints.resume(&mut fresh, &RunConfig::default()).unwrap();
        assert_eq!(iteration, 2);
        assert_eq!(fresh.steps, 2);
    }

    #[test]
    fn missing_checkpoint_resumes_at_zero() {
        let dir = TempDir::new().unwrap();
        let checkpoints = manager(&dir, 1);

        assert!(checkpoints.latest().unwrap().is_none());
        assert_eq!(
            checkpoints.resume(&mut Counter::default(), &RunConfig::default()).unwrap(),
            0
        );
    }

    #[test]
    fn corrupt_pointer_is_a_resume_error() {
        let dir = TempDir::new().unwrap();
        let checkpoints = manager(&dir, 1);
        fs::create_dir_all(checkpoints.dir()).unwrap();
        fs::write(checkpoints.dir().join(LATEST), "{ not json").unwrap();

        let err = checkpoints
            .resume(&mut Counter::default(), &RunConfig::default())
            .unwrap_err();
        assert!(matches!(err, OrchestraError::Resume(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn mismatched_manifest_is_a_resume_error() {
        let dir = TempDir::new().unwrap();
        let checkpoints = manager(&dir, 2);
        checkpoints.save(&Counter { steps: 4, ..Default::default() }, 4).unwrap();

        write_json_synced(
            &checkpoints.dir().join(LATEST),
            &LatestPointer {
                iteration: 5,
                snapshot: snapshot_name(4),
            },
        )
        .unwrap();

        assert!(matches!(
            checkpoints.resume(&mut Counter::default(), &RunConfig::default()),
            Err(OrchestraError::Resume(_))
        ));
    }

    #[test]
    fn failed_save_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let checkpoints = manager(&dir, 2);
        checkpoints.save(&Counter { steps: 2, ..Default::default() }, 2).unwrap();

        let broken = Counter {
            steps: 4,
            fail_save: true,
        };
        let err = checkpoints.save(&broken, 4).unwrap_err();
        assert!(matches!(err, OrchestraError::Checkpoint { iteration: 4, .. }));
        assert!(!err.is_fatal());

        assert_eq!(checkpoints.latest().unwrap().unwrap().iteration, 2);
        assert!(!checkpoints.dir().join(snapshot_name(4)).exists());
    }

    #[test]
    fn old_snapshots_are_pruned() {
        let dir = TempDir::new().unwrap();
        let checkpoints = manager(&dir, 2);

        for iteration in [2, 4, 6] {
            checkpoints
                .save(&Counter { steps: iteration, ..Default::default() }, iteration)
                .unwrap();
        }

        let mut names: Vec<_> = fs::read_dir(checkpoints.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["iter_00000004", "iter_00000006", "latest.json"]);
    }

    #[test]
    fn resaving_a_tag_moves_the_pointer_before_dropping_the_old_copy() {
        let dir = TempDir::new().unwrap();
        let checkpoints = manager(&dir, 2);
        let first = checkpoints.save(&Counter { steps: 1, ..Default::default() }, 3).unwrap();
        let second = checkpoints.save(&Counter { steps: 3, ..Default::default() }, 3).unwrap();

        assert_ne!(first, second);
        assert_eq!(second, checkpoints.dir().join("iter_00000003.1"));
        assert!(!first.exists());
        assert_eq!(checkpoints.latest().unwrap().unwrap().snapshot, "iter_00000003.1");

        let mut fresh = Counter::default();
        assert_eq!(
            checkpoints.resume(&mut fresh, &RunConfig::default()).unwrap(),
            3
        );
        assert_eq!(fresh.steps, 3);

        // the base name is free again
        let third = checkpoints.save(&Counter { steps: 3, ..Default::default() }, 3).unwrap();
        assert_eq!(third, first);
        assert!(!second.exists());
    }

    #[test]
    fn interrupted_resave_leaves_the_pointed_snapshot_intact() {
        let dir = TempDir::new().unwrap();
        let checkpoints = manager(&dir, 2);
        checkpoints.save(&Counter { steps: 3, ..Default::default() }, 3).unwrap();

        let broken = Counter {
            steps: 3,
            fail_save: true,
        };
        assert!(checkpoints.save(&broken, 3).is_err());

        assert_eq!(checkpoints.latest().unwrap().unwrap().snapshot, "iter_00000003");
        let mut fresh = Counter::default();
        assert_eq!(
            checkpoints.resume(&mut fresh, &RunConfig::default()).unwrap(),
            3
        );
    }

    #[test]
    fn snapshot_names_parse_with_and_without_generation() {
        assert_eq!(parse_snapshot_name("iter_00000004"), Some(4));
        assert_eq!(parse_snapshot_name("iter_00000004.2"), Some(4));
        assert_eq!(parse_snapshot_name("iter_00000004.x"), None);
        assert_eq!(parse_snapshot_name("latest.json"), None);
    }
}
