use std::{num::NonZeroUsize, time::Instant};

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use super::{
    checkpoint::CheckpointManager,
    config::RunConfig,
    data::{display_batch, DataLoader, Dataset, ShardSpec},
    error::{OrchestraError, Result},
    group::{process_slot, Backend, GroupSlot, ProcessGroup},
    reporter::{Report, Reporter},
    topology::Topology,
    trainer::{Image, Trainer, TrainerHandle},
};

/// Lifecycle of one training run. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Initializing,
    Running,
    Stopping,
    Terminated,
}

/// How a run that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The target iteration count was reached.
    Completed { iterations: u64 },
    /// Stopped on request before the target.
    Interrupted { iterations: u64 },
}

impl Outcome {
    pub fn iterations(&self) -> u64 {
        match self {
            Outcome::Completed { iterations } | Outcome::Interrupted { iterations } => *iterations,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }
}

/// Assembles a [`Controller`], filling whatever is not given from the config.
pub struct ControllerBuilder<'a> {
    config: &'a RunConfig,
    slot: &'a GroupSlot,
    topology: Option<Topology>,
    backend: Option<Backend>,
    reporter: Option<Reporter>,
    checkpoints: Option<CheckpointManager>,
    cancel: Option<CancellationToken>,
}

impl<'a> ControllerBuilder<'a> {
    pub fn new(config: &'a RunConfig) -> Self {
        Self {
            config,
            slot: process_slot(),
            topology: None,
            backend: None,
            reporter: None,
            checkpoints: None,
            cancel: None,
        }
    }

    /// Uses `slot` instead of the process-wide one.
    pub fn slot(mut self, slot: &'a GroupSlot) -> Self {
        self.slot = slot;
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn checkpoints(mut self, checkpoints: CheckpointManager) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Token whose cancellation stops the loop between iterations.
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Builds a controller owning `trainer` and both domain datasets.
    ///
    /// # Errors
    /// Returns `InvalidConfig` when the config or topology is unusable.
    pub fn build<T, A, B>(self, trainer: T, a: A, b: B) -> Result<Controller<'a, T, A, B>>
    where
        T: Trainer,
        A: Dataset<Item = T::Sample>,
        B: Dataset<Item = T::Sample>,
    {
        let config = self.config;
        config.validate()?;

        let topology = match self.topology {
            Some(topology) => topology,
            None => config.topology()?,
        };
        let backend = match self.backend {
            Some(backend) => Some(backend),
            None if topology.is_distributed() => Some(Backend::from_config(config)?),
            None => None,
        };
        let reporter = match self.reporter {
            Some(reporter) => reporter,
            None => Reporter::from_config(config, &topology)?,
        };

        let world = NonZeroUsize::new(topology.world_size())
            .ok_or_else(|| OrchestraError::InvalidConfig("world size must be positive".into()))?;
        let shard = ShardSpec::new(topology.rank(), world);

        Ok(Controller {
            config,
            slot: self.slot,
            topology,
            backend,
            trainer: Some(trainer),
            handle: None,
            loader_a: DataLoader::new(a, shard, config.batch_size),
            loader_b: DataLoader::new(b, shard, config.batch_size),
            reporter,
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| CheckpointManager::from_config(config)),
            cancel: self.cancel.unwrap_or_else(CancellationToken::new),
            phase: Phase::Initializing,
            iteration: 0,
        })
    }
}

/// Drives one training run from process-group setup to teardown.
pub struct Controller<'a, T: Trainer, A, B> {
    config: &'a RunConfig,
    slot: &'a GroupSlot,
    topology: Topology,
    backend: Option<Backend>,
    trainer: Option<T>,
    handle: Option<TrainerHandle<T>>,
    loader_a: DataLoader<A>,
    loader_b: DataLoader<B>,
    reporter: Reporter,
    checkpoints: CheckpointManager,
    cancel: CancellationToken,
    phase: Phase,
    iteration: u64,
}

impl<'a, T, A, B> Controller<'a, T, A, B>
where
    T: Trainer,
    A: Dataset<Item = T::Sample>,
    B: Dataset<Item = T::Sample>,
{
    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Completed steps so far.
    #[inline]
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    #[inline]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn trainer(&self) -> Option<&T> {
        match (&self.trainer, &self.handle) {
            (Some(trainer), _) => Some(trainer),
            (None, Some(handle)) => Some(handle.inner()),
            (None, None) => None,
        }
    }

    pub fn into_trainer(self) -> Option<T> {
        self.trainer.or(self.handle.map(TrainerHandle::into_inner))
    }

    /// Runs the loop to its target, a stop request, or a fatal error.
    ///
    /// The process group, when one is needed, is torn down on every path
    /// out of this function.
    ///
    /// # Returns
    /// How the run ended.
    ///
    /// # Errors
    /// Any fatal [`OrchestraError`]. A failed checkpoint write is logged and
    /// training continues.
    pub fn run(&mut self) -> Result<Outcome> {
        let Some(trainer) = self.trainer.take() else {
            return Err(OrchestraError::InvalidConfig(
                "this controller already ran".into(),
            ));
        };

        let (rank, world_size) = (self.topology.rank(), self.topology.world_size());
        info!(rank = rank, world_size = world_size; "initializing training run");

        let group = match self.open_group() {
            Ok(group) => group,
            Err(e) => {
                error!("rank {rank} could not join its process group: {e}");
                self.trainer = Some(trainer);
                self.enter(Phase::Terminated);
                return Err(e);
            }
        };

        let mut handle = match &group {
            Some(group) => TrainerHandle::distributed(trainer, group.handle()),
            None => TrainerHandle::local(trainer),
        };
        let result = self.train(&mut handle);
        self.handle = Some(handle);

        if let Err(e) = &result {
            error!("rank {rank} stopped at iteration {}: {e}", self.iteration);
        }

        self.enter(Phase::Stopping);
        let teardown = match group {
            Some(group) => group.teardown(),
            None => Ok(()),
        };
        self.enter(Phase::Terminated);

        match (result, teardown) {
            (Ok(outcome), Ok(())) => {
                info!(rank = rank; "training finished: {outcome:?}");
                Ok(outcome)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                warn!("teardown after failure also failed: {teardown}");
                Err(e)
            }
        }
    }

    fn open_group(&self) -> Result<Option<ProcessGroup<'a>>> {
        if !self.topology.is_distributed() {
            return Ok(None);
        }

        let backend = self.backend.as_ref().ok_or_else(|| {
            OrchestraError::InvalidConfig("distributed run without a backend".into())
        })?;
        let slot: &'a GroupSlot = self.slot;
        slot.initialize(backend, self.topology.world_size(), self.topology.rank())
            .map(Some)
    }

    fn train(&mut self, trainer: &mut TrainerHandle<T>) -> Result<Outcome> {
        let config = self.config;

        trainer.to_device(self.topology.device(config.use_cuda))?;
        let display_a = trainer.upload(display_batch(self.loader_a.dataset(), config.display_size)?)?;
        let display_b = trainer.upload(display_batch(self.loader_b.dataset(), config.display_size)?)?;

        let start = if config.resume {
            self.checkpoints.resume(trainer, config)?
        } else {
            0
        };
        self.iteration = start;

        let target = config.max_iter;
        if start >= target {
            info!("already at iteration {start} of {target}, nothing to train");
            return Ok(Outcome::Completed { iterations: start });
        }

        trainer.set_training(true);
        self.enter(Phase::Running);

        let cadence = config.cadence();
        let mut iteration = start;
        let mut last_saved = None;
        let mut interrupted = false;

        'training: loop {
            let mut pairs = 0usize;

            for (a, b) in self.loader_a.batches().zip(self.loader_b.batches()) {
                // Collective: a stop requested on one rank stops every rank here.
                if trainer.any_rank(self.cancel.is_cancelled())? {
                    info!("stop requested after iteration {iteration}");
                    interrupted = true;
                    break 'training;
                }
                pairs += 1;

                let started = Instant::now();
                let a = trainer.upload(a)?;
                let b = trainer.upload(b)?;
                trainer.discriminator_update(&a, &b, config)?;
                trainer.generator_update(&a, &b, config)?;

                let due = cadence.due(iteration);
                iteration += 1;
                self.iteration = iteration;

                self.reporter.report(Report::Progress {
                    iteration,
                    target,
                    elapsed: started.elapsed(),
                })?;

                if due.log {
                    let losses = trainer.losses()?;
                    self.reporter.report(Report::Losses {
                        iteration,
                        losses: &losses,
                    })?;
                }

                if due.visualize {
                    self.reporter.report(Report::Images {
                        label: format!("train_{iteration:08}"),
                        produce: Box::new(|| {
                            sample_for_display(&mut *trainer, &display_a, &display_b)
                        }),
                    })?;
                }

                if due.checkpoint && self.save(trainer, iteration) {
                    last_saved = Some(iteration);
                }

                trainer.update_learning_rate();

                if iteration >= target {
                    break 'training;
                }
            }

            if pairs == 0 {
                return Err(OrchestraError::Data(format!(
                    "data producers yielded no batch pairs, iteration {iteration} of {target} is unreachable"
                )));
            }
            debug!("data pass finished after {pairs} batch pair(s)");
        }

        if config.save_on_exit && iteration > start && last_saved != Some(iteration) {
            self.save(trainer, iteration);
        }

        Ok(if interrupted {
            Outcome::Interrupted {
                iterations: iteration,
            }
        } else {
            Outcome::Completed {
                iterations: iteration,
            }
        })
    }

    /// Writes a checkpoint on the reporting rank. Returns whether one was written.
    fn save(&self, trainer: &TrainerHandle<T>, iteration: u64) -> bool {
        if !self.topology.is_reporting_rank() {
            return false;
        }

        match self.checkpoints.save(trainer, iteration) {
            Ok(_) => true,
            Err(e) => {
                warn!("{e}; training continues");
                false
            }
        }
    }

    fn enter(&mut self, phase: Phase) {
        if phase > self.phase {
            debug!("{:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }
}

fn sample_for_display<T: Trainer>(
    trainer: &mut T,
    a: &T::Batch,
    b: &T::Batch,
) -> Result<Vec<Image>> {
    trainer.set_training(false);
    let images = trainer.sample(a, b);
    trainer.set_training(true);
    images
}
