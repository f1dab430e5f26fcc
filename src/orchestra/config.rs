use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    num::{NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use super::{
    error::{OrchestraError, Result},
    schedule::Cadence,
    topology::Topology,
};

/// Name of the only cross-process backend.
pub const TCP_BACKEND: &str = "tcp";

/// Immutable configuration of a training run, resolved once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub experiment_name: String,
    pub output_dir: PathBuf,
    pub images_subdir: String,
    pub images_subfolder: String,
    pub checkpoint_subdir: String,

    /// Target iteration count.
    pub max_iter: u64,
    pub log_interval: NonZeroU64,
    /// Falls back to `log_interval` when absent.
    pub image_interval: Option<NonZeroU64>,
    pub checkpoint_interval: NonZeroU64,
    pub keep_checkpoints: NonZeroUsize,
    pub save_on_exit: bool,

    pub display_size: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    pub resume: bool,
    pub use_cuda: bool,

    pub world_size: i64,
    pub node_rank: i64,
    pub devices_per_node: i64,
    pub local_device: i64,
    pub backend: String,
    pub master_addr: String,
    pub master_port: u16,
    pub rendezvous_timeout_secs: u64,
    pub collective_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            experiment_name: "munit".into(),
            output_dir: PathBuf::from("base_results_dir"),
            images_subdir: "Sampled_images".into(),
            images_subfolder: String::new(),
            checkpoint_subdir: "Saved_Models".into(),
            max_iter: 1_000_000,
            log_interval: NonZeroU64::new(10).unwrap_or(NonZeroU64::MIN),
            image_interval: None,
            checkpoint_interval: NonZeroU64::new(500).unwrap_or(NonZeroU64::MIN),
            keep_checkpoints: NonZeroUsize::MIN,
            save_on_exit: false,
            display_size: NonZeroUsize::new(16).unwrap_or(NonZeroUsize::MIN),
            batch_size: NonZeroUsize::MIN,
            resume: false,
            use_cuda: false,
            world_size: 1,
            node_rank: 0,
            devices_per_node: 1,
            local_device: 0,
            backend: TCP_BACKEND.into(),
            master_addr: "127.0.0.1".into(),
            master_port: 29500,
            rendezvous_timeout_secs: 300,
            collective_timeout_secs: 1800,
        }
    }
}

impl RunConfig {
    /// Loads a run configuration from a JSON file and validates it.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestraError::InvalidConfig(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    /// Parses and validates a run configuration from JSON text.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| OrchestraError::InvalidConfig(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Overlays the process environment (`WORLD_SIZE`, `NODE_RANK`, `LOCAL_RANK`, ...).
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| env::var(key).ok())
    }

    /// Overlays values provided by `lookup`, then re-validates.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WORLD_SIZE") {
            self.world_size = parse_var("WORLD_SIZE", &v)?;
        }
        if let Some(v) = lookup("NODE_RANK") {
            self.node_rank = parse_var("NODE_RANK", &v)?;
        }
        if let Some(v) = lookup("DEVICES_PER_NODE") {
            self.devices_per_node = parse_var("DEVICES_PER_NODE", &v)?;
        }
        if let Some(v) = lookup("LOCAL_RANK") {
            self.local_device = parse_var("LOCAL_RANK", &v)?;
        }
        if let Some(v) = lookup("BACKEND") {
            self.backend = v;
        }
        if let Some(v) = lookup("MASTER_ADDR") {
            self.master_addr = v;
        }
        if let Some(v) = lookup("MASTER_PORT") {
            self.master_port = parse_var("MASTER_PORT", &v)?;
        }

        self.validate()
    }

    /// Rejects configurations that cannot describe a run.
    ///
    /// # Errors
    /// Returns `InvalidConfig` on unknown backends, empty names or unusable timeouts.
    pub fn validate(&self) -> Result<()> {
        if self.backend != TCP_BACKEND {
            return Err(OrchestraError::InvalidConfig(format!(
                "unknown backend: {}",
                self.backend
            )));
        }
        if self.experiment_name.is_empty() {
            return Err(OrchestraError::InvalidConfig(
                "experiment_name must not be empty".into(),
            ));
        }
        if self.rendezvous_timeout_secs == 0 || self.collective_timeout_secs == 0 {
            return Err(OrchestraError::InvalidConfig(
                "timeouts must be at least one second".into(),
            ));
        }

        self.topology().map(|_| ())
    }

    /// Resolves this process's rank from the configured topology inputs.
    pub fn topology(&self) -> Result<Topology> {
        Topology::resolve(
            self.node_rank,
            self.devices_per_node,
            self.local_device,
            self.world_size,
        )
    }

    pub fn cadence(&self) -> Cadence {
        Cadence::new(
            self.log_interval,
            self.image_interval.unwrap_or(self.log_interval),
            self.checkpoint_interval,
        )
    }

    /// Resolves the rendezvous address ranks meet at.
    pub fn master_socket_addr(&self) -> Result<SocketAddr> {
        (self.master_addr.as_str(), self.master_port)
            .to_socket_addrs()
            .map_err(|e| {
                OrchestraError::InvalidConfig(format!(
                    "cannot resolve {}:{}: {e}",
                    self.master_addr, self.master_port
                ))
            })?
            .next()
            .ok_or_else(|| {
                OrchestraError::InvalidConfig(format!(
                    "{}:{} resolved to no address",
                    self.master_addr, self.master_port
                ))
            })
    }

    #[inline]
    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_secs(self.rendezvous_timeout_secs)
    }

    #[inline]
    pub fn collective_timeout(&self) -> Duration {
        Duration::from_secs(self.collective_timeout_secs)
    }

    /// `output_dir/experiment_name`.
    pub fn base_results_dir(&self) -> PathBuf {
        self.output_dir.join(&self.experiment_name)
    }

    pub fn image_dir(&self) -> PathBuf {
        self.base_results_dir()
            .join(&self.images_subdir)
            .join(&self.images_subfolder)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.base_results_dir().join(&self.checkpoint_subdir)
    }

    /// `output_dir/Loss/experiment_name`, where scalar metrics are written.
    pub fn loss_dir(&self) -> PathBuf {
        self.output_dir.join("Loss").join(&self.experiment_name)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| OrchestraError::InvalidConfig(format!("{key}={value}: {e}")))
}
