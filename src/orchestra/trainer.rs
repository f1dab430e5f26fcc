use std::path::Path;

use super::{
    config::RunConfig,
    error::{OrchestraError, Result},
    group::GroupHandle,
    topology::Device,
};

/// An RGB image with interleaved channels in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Image {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        if width == 0 || height == 0 || data.len() != width * height * 3 {
            return Err(OrchestraError::Data(format!(
                "image of {width}x{height} needs {} values, got {}",
                width * height * 3,
                data.len()
            )));
        }

        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// The `[r, g, b]` values at column `x` and row `y` (panics if out of bounds).
    pub fn pixel(&self, x: usize, y: usize) -> [f32; 3] {
        let at = (y * self.width + x) * 3;
        [self.data[at], self.data[at + 1], self.data[at + 2]]
    }
}

/// Named scalar losses of the latest update, in a stable order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Losses {
    entries: Vec<(String, f32)>,
}

impl Losses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: f32) {
        self.entries.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn values(&self) -> Vec<f32> {
        self.entries.iter().map(|(_, v)| *v).collect()
    }

    fn set_values(&mut self, values: &[f32]) {
        for ((_, v), new) in self.entries.iter_mut().zip(values) {
            *v = *new;
        }
    }
}

impl<S: Into<String>> FromIterator<(S, f32)> for Losses {
    fn from_iter<I: IntoIterator<Item = (S, f32)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(n, v)| (n.into(), v)).collect(),
        }
    }
}

/// Capabilities the loop drives on the model being trained.
///
/// The loop never looks inside a batch; it only moves them from the data
/// producers to the trainer.
pub trait Trainer {
    type Sample: Clone;
    type Batch;

    /// Places the parameters on `device`. Called once before any update.
    fn to_device(&mut self, device: Device) -> Result<()>;

    /// Moves a batch of raw samples to the trainer's device.
    fn upload(&self, samples: Vec<Self::Sample>) -> Result<Self::Batch>;

    fn discriminator_update(
        &mut self,
        a: &Self::Batch,
        b: &Self::Batch,
        config: &RunConfig,
    ) -> Result<()>;

    fn generator_update(
        &mut self,
        a: &Self::Batch,
        b: &Self::Batch,
        config: &RunConfig,
    ) -> Result<()>;

    /// Switches between training and evaluation behaviour.
    fn set_training(&mut self, _training: bool) {}

    /// Translated images for the display batches, laid out row by row.
    fn sample(&mut self, a: &Self::Batch, b: &Self::Batch) -> Result<Vec<Image>>;

    /// Advances the learning-rate schedule by one iteration.
    fn update_learning_rate(&mut self);

    fn losses(&mut self) -> Result<Losses>;

    /// Writes the full training state into `dir`, which already exists.
    fn save(&self, dir: &Path, iteration: u64) -> Result<()>;

    /// Restores the state written by `save` and returns its iteration.
    fn resume(&mut self, dir: &Path, config: &RunConfig) -> Result<u64>;

    /// Makes the trainable state identical on every rank of `group`, usually by
    /// averaging parameters with [`GroupHandle::all_reduce_mean`].
    ///
    /// Called by the distributed wrapper after each update, on every rank.
    /// Trainers without state to share may keep the default.
    fn synchronize(&mut self, _group: &GroupHandle) -> Result<()> {
        Ok(())
    }
}

/// A trainer, wrapped for the run's mode.
///
/// The distributed variant synchronizes the trainer state after each update,
/// keeps ranks in lockstep and averages reported losses across the group.
#[derive(Debug)]
pub enum TrainerHandle<T> {
    Local(T),
    Distributed { inner: T, group: GroupHandle },
}

impl<T> TrainerHandle<T> {
    pub fn local(trainer: T) -> Self {
        Self::Local(trainer)
    }

    pub fn distributed(trainer: T, group: GroupHandle) -> Self {
        Self::Distributed {
            inner: trainer,
            group,
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Self::Distributed { .. })
    }

    pub fn inner(&self) -> &T {
        match self {
            Self::Local(t) | Self::Distributed { inner: t, .. } => t,
        }
    }

    pub fn inner_mut(&mut self) -> &mut T {
        match self {
            Self::Local(t) | Self::Distributed { inner: t, .. } => t,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Local(t) | Self::Distributed { inner: t, .. } => t,
        }
    }

    /// Whether `flag` is raised on any rank.
    ///
    /// A collective in distributed mode: every rank must call it at the same
    /// point of the loop.
    pub fn any_rank(&self, flag: bool) -> Result<bool> {
        match self {
            Self::Local(_) => Ok(flag),
            Self::Distributed { group, .. } => {
                let mut votes = [if flag { 1.0 } else { 0.0 }];
                group.all_reduce_mean(&mut votes)?;
                Ok(votes[0] > 0.0)
            }
        }
    }
}

impl<T: Trainer> TrainerHandle<T> {
    fn sync(&mut self) -> Result<()> {
        match self {
            Self::Local(_) => Ok(()),
            Self::Distributed { inner, group } => {
                inner.synchronize(group)?;
                group.barrier()
            }
        }
    }
}

impl<T: Trainer> Trainer for TrainerHandle<T> {
    type Sample = T::Sample;
    type Batch = T::Batch;

    fn to_device(&mut self, device: Device) -> Result<()> {
        self.inner_mut().to_device(device)
    }

    fn upload(&self, samples: Vec<Self::Sample>) -> Result<Self::Batch> {
        self.inner().upload(samples)
    }

    fn discriminator_update(
        &mut self,
        a: &Self::Batch,
        b: &Self::Batch,
        config: &RunConfig,
    ) -> Result<()> {
        self.inner_mut().discriminator_update(a, b, config)?;
        self.sync()
    }

    fn generator_update(
        &mut self,
        a: &Self::Batch,
        b: &Self::Batch,
        config: &RunConfig,
    ) -> Result<()> {
        self.inner_mut().generator_update(a, b, config)?;
        self.sync()
    }

    fn set_training(&mut self, training: bool) {
        self.inner_mut().set_training(training)
    }

    fn sample(&mut self, a: &Self::Batch, b: &Self::Batch) -> Result<Vec<Image>> {
        self.inner_mut().sample(a, b)
    }

    fn update_learning_rate(&mut self) {
        self.inner_mut().update_learning_rate()
    }

    fn losses(&mut self) -> Result<Losses> {
        let mut losses = self.inner_mut().losses()?;
        if let Self::Distributed { group, .. } = self {
            let mut values = losses.values();
            group.all_reduce_mean(&mut values)?;
            losses.set_values(&values);
        }

        Ok(losses)
    }

    fn save(&self, dir: &Path, iteration: u64) -> Result<()> {
        self.inner().save(dir, iteration)
    }

    fn resume(&mut self, dir: &Path, config: &RunConfig) -> Result<u64> {
        self.inner_mut().resume(dir, config)
    }

    fn synchronize(&mut self, group: &GroupHandle) -> Result<()> {
        self.inner_mut().synchronize(group)
    }
}
