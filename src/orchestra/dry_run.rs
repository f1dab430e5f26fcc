//! A small deterministic trainer over synthetic images.
//!
//! It stands in for a real image-translation model so a job can exercise the
//! whole orchestration path (ranks, cadence, checkpoints, reporting) without
//! a GPU or a dataset on disk.

use std::{fs, path::Path};

use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{
    config::RunConfig,
    error::{OrchestraError, Result},
    group::GroupHandle,
    topology::Device,
    trainer::{Image, Losses, Trainer},
};

const STATE_FILE: &str = "dry_run.json";

/// Knobs of the synthetic job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DryRunConfig {
    pub samples_a: usize,
    pub samples_b: usize,
    /// Images are `image_side` x `image_side` RGB.
    pub image_side: usize,
    pub lr: f32,
    /// The learning rate is multiplied by `gamma` every `lr_step_size` iterations.
    pub lr_step_size: u64,
    pub gamma: f32,
    pub seed: u64,
}

impl Default for DryRunConfig {
    fn default() -> Self {
        Self {
            samples_a: 64,
            samples_b: 48,
            image_side: 8,
            lr: 1e-4,
            lr_step_size: 100_000,
            gamma: 0.5,
            seed: 7,
        }
    }
}

impl DryRunConfig {
    /// Values per image.
    pub fn sample_len(&self) -> usize {
        self.image_side * self.image_side * 3
    }

    /// The two synthetic domains. Domain B is domain A shifted and darkened.
    pub fn datasets(&self) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
        (
            synthetic_domain(self.samples_a, self.sample_len(), self.seed, 0.0),
            synthetic_domain(self.samples_b, self.sample_len(), self.seed + 1, -0.4),
        )
    }
}

/// `len` random images with values in `[-1, 1]`, centred around `shift`.
pub fn synthetic_domain(len: usize, sample_len: usize, seed: u64, shift: f32) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|_| {
            (0..sample_len)
                .map(|_| (shift + rng.random_range(-0.5..0.5f32)).clamp(-1.0, 1.0))
                .collect()
        })
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct State {
    iteration: u64,
    lr: f32,
    lr_steps: u64,
    critic: f32,
    translate: Vec<f32>,
}

/// Learns a per-pixel offset that maps domain A onto domain B.
#[derive(Debug, Clone)]
pub struct DryRunTrainer {
    config: DryRunConfig,
    device: Option<Device>,
    training: bool,
    translate: Vec<f32>,
    critic: f32,
    lr: f32,
    lr_steps: u64,
    updates: u64,
    loss_dis: f32,
    loss_gen: f32,
}

impl DryRunTrainer {
    pub fn new(config: DryRunConfig) -> Self {
        Self {
            translate: vec![0.0; config.sample_len()],
            lr: config.lr,
            config,
            device: None,
            training: false,
            critic: 0.0,
            lr_steps: 0,
            updates: 0,
            loss_dis: 0.0,
            loss_gen: 0.0,
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.lr
    }

    /// Generator updates applied so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    fn translated(&self, sample: &[f32]) -> Vec<f32> {
        sample
            .iter()
            .zip(&self.translate)
            .map(|(x, t)| (x + t).clamp(-1.0, 1.0))
            .collect()
    }

    fn image(&self, data: Vec<f32>) -> Result<Image> {
        Image::new(self.config.image_side, self.config.image_side, data)
    }
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f32
    }
}

impl Trainer for DryRunTrainer {
    type Sample = Vec<f32>;
    type Batch = Vec<Vec<f32>>;

    fn to_device(&mut self, device: Device) -> Result<()> {
        if let Device::Cuda(index) = device {
            return Err(OrchestraError::trainer(
                "to_device",
                format!("dry run has no cuda:{index}, set use_cuda to false"),
            ));
        }
        debug!("dry run trainer placed on {device}");
        self.device = Some(device);
        Ok(())
    }

    fn upload(&self, samples: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        let expected = self.config.sample_len();
        if let Some(bad) = samples.iter().find(|s| s.len() != expected) {
            return Err(OrchestraError::Data(format!(
                "sample has {} values, expected {expected}",
                bad.len()
            )));
        }
        Ok(samples)
    }

    fn discriminator_update(
        &mut self,
        a: &Vec<Vec<f32>>,
        b: &Vec<Vec<f32>>,
        _config: &RunConfig,
    ) -> Result<()> {
        let fake = mean(a.iter().map(|s| mean(self.translated(s).into_iter())));
        let real = mean(b.iter().map(|s| mean(s.iter().copied())));

        let error = self.critic - (real - fake);
        self.loss_dis = error * error;
        self.critic -= self.lr * 2.0 * error;
        Ok(())
    }

    fn generator_update(
        &mut self,
        a: &Vec<Vec<f32>>,
        b: &Vec<Vec<f32>>,
        _config: &RunConfig,
    ) -> Result<()> {
        let pairs = a.len().min(b.len()).max(1) as f32;
        let mut grad = vec![0.0f32; self.translate.len()];
        let mut loss = 0.0;

        for (x, y) in a.iter().zip(b) {
            for (p, g) in grad.iter_mut().enumerate() {
                let diff = x[p] + self.translate[p] - y[p];
                *g += 2.0 * diff / pairs;
                loss += diff * diff;
            }
        }

        for (t, g) in self.translate.iter_mut().zip(&grad) {
            *t -= self.lr * g;
        }
        self.loss_gen = loss / (pairs * self.translate.len().max(1) as f32);
        self.updates += 1;
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn sample(&mut self, a: &Vec<Vec<f32>>, b: &Vec<Vec<f32>>) -> Result<Vec<Image>> {
        let mut images = Vec::with_capacity(a.len() * 2 + b.len());
        for x in a {
            images.push(self.image(x.clone())?);
        }
        for x in a {
            images.push(self.image(self.translated(x))?);
        }
        for y in b {
            images.push(self.image(y.clone())?);
        }
        Ok(images)
    }

    fn update_learning_rate(&mut self) {
        self.lr_steps += 1;
        if self.config.lr_step_size > 0 && self.lr_steps % self.config.lr_step_size == 0 {
            self.lr *= self.config.gamma;
        }
    }

    fn losses(&mut self) -> Result<Losses> {
        Ok([
            ("loss_dis_total", self.loss_dis),
            ("loss_gen_total", self.loss_gen),
        ]
        .into_iter()
        .collect())
    }

    fn save(&self, dir: &Path, iteration: u64) -> Result<()> {
        let state = State {
            iteration,
            lr: self.lr,
            lr_steps: self.lr_steps,
            critic: self.critic,
            translate: self.translate.clone(),
        };
        let json = serde_json::to_vec(&state).map_err(|e| OrchestraError::trainer("save", e))?;
        fs::write(dir.join(STATE_FILE), json)?;
        Ok(())
    }

    fn resume(&mut self, dir: &Path, _config: &RunConfig) -> Result<u64> {
        let bytes = fs::read(dir.join(STATE_FILE))?;
        let state: State =
            serde_json::from_slice(&bytes).map_err(|e| OrchestraError::trainer("resume", e))?;
        if state.translate.len() != self.translate.len() {
            return Err(OrchestraError::trainer(
                "resume",
                format!(
                    "checkpoint holds {} parameters, model has {}",
                    state.translate.len(),
                    self.translate.len()
                ),
            ));
        }

        self.lr = state.lr;
        self.lr_steps = state.lr_steps;
        self.critic = state.critic;
        self.translate = state.translate;
        Ok(state.iteration)
    }

    fn synchronize(&mut self, group: &GroupHandle) -> Result<()> {
        let mut params = Vec::with_capacity(self.translate.len() + 1);
        params.push(self.critic);
        params.extend_from_slice(&self.translate);

        group.all_reduce_mean(&mut params)?;

        self.critic = params[0];
        self.translate.copy_from_slice(&params[1..]);
        Ok(())
    }
}
