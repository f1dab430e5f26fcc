#![allow(dead_code)]

use std::{
    fs,
    num::{NonZeroU64, NonZeroUsize},
    path::Path,
    sync::{Arc, Mutex},
};

use distributed_gan_orchestration::{
    Device, Image, Losses, OrchestraError, Result, RunConfig, Trainer,
};
use tokio_util::sync::CancellationToken;

/// One call the loop made on the trainer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ToDevice(Device),
    Discriminator { a: Vec<usize>, b: Vec<usize> },
    Generator,
    Sample { training: bool },
    Losses,
    LearningRate,
    Resume(u64),
    Save(u64),
}

/// Trainer whose samples are ids and whose state is a step counter.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    pub events: Arc<Mutex<Vec<Event>>>,
    pub steps: u64,
    pub training: bool,
    pub loss: f32,
    /// Cancelled once this many generator updates have been applied.
    pub cancel_after: Option<(u64, CancellationToken)>,
}

impl Recording {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loss(loss: f32) -> Self {
        Self {
            loss,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    /// Iterations passed to `save`, in call order.
    pub fn saves(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Save(iteration) => Some(iteration),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Trainer for Recording {
    type Sample = usize;
    type Batch = Vec<usize>;

    fn to_device(&mut self, device: Device) -> Result<()> {
        self.push(Event::ToDevice(device));
        Ok(())
    }

    fn upload(&self, samples: Vec<usize>) -> Result<Vec<usize>> {
        Ok(samples)
    }

    fn discriminator_update(&mut self, a: &Vec<usize>, b: &Vec<usize>, _: &RunConfig) -> Result<()> {
        self.push(Event::Discriminator {
            a: a.clone(),
            b: b.clone(),
        });
        Ok(())
    }

    fn generator_update(&mut self, _: &Vec<usize>, _: &Vec<usize>, _: &RunConfig) -> Result<()> {
        self.steps += 1;
        self.push(Event::Generator);
        if let Some((after, token)) = &self.cancel_after {
            if self.steps >= *after {
                token.cancel();
            }
        }
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn sample(&mut self, a: &Vec<usize>, b: &Vec<usize>) -> Result<Vec<Image>> {
        self.push(Event::Sample {
            training: self.training,
        });
        a.iter()
            .chain(b)
            .map(|_| Image::new(1, 1, vec![0.0; 3]))
            .collect()
    }

    fn update_learning_rate(&mut self) {
        self.push(Event::LearningRate);
    }

    fn losses(&mut self) -> Result<Losses> {
        self.push(Event::Losses);
        Ok([("loss_gen_total", self.loss)].into_iter().collect())
    }

    fn save(&self, dir: &Path, iteration: u64) -> Result<()> {
        self.push(Event::Save(iteration));
        fs::write(dir.join("steps"), self.steps.to_string())?;
        Ok(())
    }

    fn resume(&mut self, dir: &Path, _: &RunConfig) -> Result<u64> {
        let text = fs::read_to_string(dir.join("steps"))?;
        self.steps = text
            .trim()
            .parse()
            .map_err(|e| OrchestraError::trainer("resume", e))?;
        self.push(Event::Resume(self.steps));
        Ok(self.steps)
    }
}

pub fn nz64(n: u64) -> NonZeroU64 {
    NonZeroU64::new(n).unwrap()
}

pub fn nz(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

/// A run writing under `out` with every interval set to `1` except checkpoints.
pub fn config(out: &Path, max_iter: u64, checkpoint_interval: u64) -> RunConfig {
    RunConfig {
        output_dir: out.to_path_buf(),
        max_iter,
        log_interval: nz64(1),
        checkpoint_interval: nz64(checkpoint_interval),
        keep_checkpoints: nz(5),
        display_size: nz(2),
        ..RunConfig::default()
    }
}

/// Sample ids `0..len`.
pub fn ids(len: usize) -> Vec<usize> {
    (0..len).collect()
}

/// Snapshot directory names present under the run's checkpoint directory.
pub fn snapshots(config: &RunConfig) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(config.checkpoint_dir())
        .map(|entries| {
            entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|n| n.starts_with("iter_"))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
