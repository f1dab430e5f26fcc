use std::{env, process::ExitCode};

use anyhow::{bail, Context};
use log::{error, info};

use distributed_gan_orchestration::{
    orchestra::{
        dry_run::DryRunTrainer,
        launch::{self, JobFile},
    },
    ControllerBuilder, Outcome,
};

/// Exit status of a run stopped by Ctrl-C.
const INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<ExitCode> {
    let Some(path) = env::args().nth(1) else {
        bail!("usage: distributed-gan-orchestration <job.json>");
    };
    let job = JobFile::load(&path).with_context(|| format!("loading job '{path}'"))?;

    if launch::should_spawn(&job.run) {
        info!(
            "fanning out into {} local ranks",
            job.run.devices_per_node
        );
        let ok = launch::spawn_local_ranks(&job.run).context("spawning local ranks")?;
        return Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE });
    }

    let topology = job.run.topology()?;
    if topology.is_reporting_rank() {
        launch::prepare_directories(&job.run).context("creating output directories")?;
    }

    let (a, b) = job.dry_run.datasets();
    let trainer = DryRunTrainer::new(job.dry_run.clone());
    let mut controller = ControllerBuilder::new(&job.run)
        .topology(topology)
        .cancel(launch::stop_token()?)
        .build(trainer, a, b)?;

    let outcome = controller.run()?;
    Ok(match outcome {
        Outcome::Completed { .. } => ExitCode::SUCCESS,
        Outcome::Interrupted { .. } => ExitCode::from(INTERRUPTED),
    })
}
