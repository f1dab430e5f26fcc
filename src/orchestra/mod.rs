pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod data;
pub mod dry_run;
pub mod error;
pub mod group;
pub mod launch;
pub mod reporter;
pub mod schedule;
pub mod topology;
pub mod trainer;

pub use checkpoint::CheckpointManager;
pub use config::RunConfig;
pub use controller::{Controller, ControllerBuilder, Outcome, Phase};
pub use error::{OrchestraError, Result};
pub use topology::{Device, Topology};
pub use trainer::{Image, Losses, Trainer, TrainerHandle};
