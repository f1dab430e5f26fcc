//! Orchestration of a two-domain adversarial training loop across one or
//! many ranks: topology, process group, cadence, checkpoints and reporting.
//! The model itself stays behind the [`Trainer`] capability.

pub mod orchestra;

pub use orchestra::{
    CheckpointManager, Controller, ControllerBuilder, Device, Image, Losses, OrchestraError,
    Outcome, Phase, Result, RunConfig, Topology, Trainer, TrainerHandle,
};
