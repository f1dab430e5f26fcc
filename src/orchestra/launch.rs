use std::{
    env, fs, io,
    path::Path,
    process::{Child, Command},
    thread,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::{runtime, signal};
use tokio_util::sync::CancellationToken;

use super::{
    config::RunConfig,
    dry_run::DryRunConfig,
    error::{OrchestraError, Result},
};

/// Environment variable carrying the local device index of a spawned rank.
pub const LOCAL_RANK_VAR: &str = "LOCAL_RANK";

/// A job description: the run itself plus the synthetic trainer's knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFile {
    #[serde(flatten)]
    pub run: RunConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
}

impl JobFile {
    /// Reads a job from JSON and overlays the process environment.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            OrchestraError::InvalidConfig(format!("cannot read '{}': {e}", path.display()))
        })?;
        let mut job: Self = serde_json::from_str(&content)
            .map_err(|e| OrchestraError::InvalidConfig(format!("invalid job file: {e}")))?;
        job.run.apply_env()?;
        Ok(job)
    }
}

/// Creates the image, checkpoint and loss directories of a run.
pub fn prepare_directories(config: &RunConfig) -> io::Result<()> {
    info!("creating directories in {}", config.output_dir.display());
    for dir in [config.image_dir(), config.checkpoint_dir(), config.loss_dir()] {
        fs::create_dir_all(&dir)?;
    }
    Ok(())
}

/// Whether this process should fan out into one child per local device.
pub fn should_spawn(config: &RunConfig) -> bool {
    config.devices_per_node > 1 && env::var_os(LOCAL_RANK_VAR).is_none()
}

/// Re-runs this executable once per local device and waits for all of them.
///
/// # Returns
/// Whether every child exited successfully.
pub fn spawn_local_ranks(config: &RunConfig) -> io::Result<bool> {
    let exe = env::current_exe()?;
    let args: Vec<_> = env::args_os().skip(1).collect();

    let children = (0..config.devices_per_node)
        .map(|device| -> io::Result<(i64, Child)> {
            let child = Command::new(&exe)
                .args(&args)
                .env(LOCAL_RANK_VAR, device.to_string())
                .spawn()?;
            info!("spawned local rank {device} as pid {}", child.id());
            Ok((device, child))
        })
        .collect::<io::Result<Vec<_>>>()?;

    let mut all_ok = true;
    for (device, mut child) in children {
        let status = child.wait()?;
        if !status.success() {
            warn!("local rank {device} exited with {status}");
            all_ok = false;
        }
    }

    Ok(all_ok)
}

/// A token cancelled on the first Ctrl-C.
///
/// The signal is awaited on a dedicated thread with its own runtime, so the
/// caller may stay synchronous.
pub fn stop_token() -> io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let rt = runtime::Builder::new_current_thread().enable_all().build()?;

    let cancel = token.clone();
    thread::Builder::new()
        .name("stop-signal".into())
        .spawn(move || {
            rt.block_on(async {
                match signal::ctrl_c().await {
                    Ok(()) => {
                        info!("stop requested, finishing current iteration");
                        cancel.cancel();
                    }
                    Err(e) => warn!("cannot listen for ctrl-c: {e}"),
                }
            })
        })?;

    Ok(token)
}
