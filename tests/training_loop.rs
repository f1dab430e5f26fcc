mod common;

use std::fs;

use common::{config, ids, nz, nz64, snapshots, Event, Recording};
use distributed_gan_orchestration::{
    orchestra::{checkpoint::CheckpointManager, reporter::JsonlScalarWriter},
    ControllerBuilder, Device, OrchestraError, Outcome, Phase,
};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

fn step(a: usize, b: usize, save: Option<u64>) -> Vec<Event> {
    let mut events = vec![
        Event::Discriminator {
            a: vec![a],
            b: vec![b],
        },
        Event::Generator,
        Event::Losses,
        Event::Sample { training: false },
    ];
    events.extend(save.map(Event::Save));
    events.push(Event::LearningRate);
    events
}

#[test]
fn three_iterations_save_once_and_report_every_step() {
    let out = TempDir::new().unwrap();
    let cfg = config(out.path(), 3, 2);
    let trainer = Recording::new();

    let mut controller = ControllerBuilder::new(&cfg)
        .build(trainer.clone(), ids(8), ids(8))
        .unwrap();
    let outcome = controller.run().unwrap();

    assert_eq!(outcome, Outcome::Completed { iterations: 3 });
    assert_eq!(controller.iteration(), 3);
    assert_eq!(controller.phase(), Phase::Terminated);
    assert_eq!(controller.trainer().unwrap().steps, 3);

    let mut expected = vec![Event::ToDevice(Device::Cpu)];
    expected.extend(step(0, 0, None));
    expected.extend(step(1, 1, Some(2)));
    expected.extend(step(2, 2, None));
    assert_eq!(trainer.events(), expected);

    assert_eq!(snapshots(&cfg), vec!["iter_00000002"]);
    let latest = CheckpointManager::from_config(&cfg).latest().unwrap().unwrap();
    assert_eq!(latest.iteration, 2);

    let scalars = fs::read_to_string(cfg.loss_dir().join(JsonlScalarWriter::FILE_NAME)).unwrap();
    assert_eq!(scalars.lines().count(), 3);
    for i in 1..=3 {
        assert!(cfg.image_dir().join(format!("train_{i:08}.ppm")).exists());
    }
}

#[test]
fn resume_continues_from_latest_checkpoint() {
    let out = TempDir::new().unwrap();
    let mut cfg = config(out.path(), 3, 2);
    ControllerBuilder::new(&cfg)
        .build(Recording::new(), ids(8), ids(8))
        .unwrap()
        .run()
        .unwrap();

    cfg.resume = true;
    let trainer = Recording::new();
    let mut controller = ControllerBuilder::new(&cfg)
        .build(trainer.clone(), ids(8), ids(8))
        .unwrap();

    assert_eq!(
        controller.run().unwrap(),
        Outcome::Completed { iterations: 3 }
    );
    assert!(trainer.events().contains(&Event::Resume(2)));
    assert_eq!(trainer.count(|e| *e == Event::Generator), 1);
    assert_eq!(controller.trainer().unwrap().steps, 3);
}

#[test]
fn save_on_exit_makes_resume_a_no_op() {
    let out = TempDir::new().unwrap();
    let mut cfg = config(out.path(), 3, 2);
    cfg.save_on_exit = true;
    let first = Recording::new();
    ControllerBuilder::new(&cfg)
        .build(first.clone(), ids(8), ids(8))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(first.saves(), vec![2, 3]);
    assert_eq!(snapshots(&cfg), vec!["iter_00000002", "iter_00000003"]);

    cfg.resume = true;
    let trainer = Recording::new();
    let outcome = ControllerBuilder::new(&cfg)
        .build(trainer.clone(), ids(8), ids(8))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(outcome, Outcome::Completed { iterations: 3 });
    assert_eq!(trainer.count(|e| *e == Event::Generator), 0);
}

#[test]
fn shorter_domain_bounds_each_pass() {
    let out = TempDir::new().unwrap();
    let cfg = config(out.path(), 4, 100);
    let trainer = Recording::new();

    ControllerBuilder::new(&cfg)
        .build(trainer.clone(), ids(5), ids(3))
        .unwrap()
        .run()
        .unwrap();

    let pairs: Vec<_> = trainer
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Discriminator { a, b } => Some((a[0], b[0])),
            _ => None,
        })
        .collect();
    assert_eq!(pairs, vec![(0, 0), (1, 1), (2, 2), (0, 0)]);
}

#[test]
fn updates_alternate_and_precede_the_schedule_step() {
    let out = TempDir::new().unwrap();
    let mut cfg = config(out.path(), 6, 100);
    cfg.log_interval = nz64(3);
    let trainer = Recording::new();

    ControllerBuilder::new(&cfg)
        .build(trainer.clone(), ids(8), ids(8))
        .unwrap()
        .run()
        .unwrap();

    let events: Vec<_> = trainer
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Discriminator { .. } | Event::Generator | Event::LearningRate))
        .collect();
    for chunk in events.chunks(3) {
        assert!(matches!(chunk[0], Event::Discriminator { .. }));
        assert_eq!(chunk[1], Event::Generator);
        assert_eq!(chunk[2], Event::LearningRate);
    }
    assert_eq!(events.len(), 18);
    assert_eq!(trainer.count(|e| *e == Event::Losses), 2);
}

#[test]
fn target_already_reached_runs_nothing() {
    let out = TempDir::new().unwrap();
    let cfg = config(out.path(), 0, 2);
    let trainer = Recording::new();

    let mut controller = ControllerBuilder::new(&cfg)
        .build(trainer.clone(), ids(4), ids(4))
        .unwrap();

    assert_eq!(
        controller.run().unwrap(),
        Outcome::Completed { iterations: 0 }
    );
    assert_eq!(trainer.count(|e| *e == Event::Generator), 0);
    assert!(snapshots(&cfg).is_empty());
}

#[test]
fn no_batch_pairs_is_a_data_error() {
    let out = TempDir::new().unwrap();
    let mut cfg = config(out.path(), 3, 2);
    cfg.batch_size = nz(2);
    cfg.display_size = nz(1);

    let mut controller = ControllerBuilder::new(&cfg)
        .build(Recording::new(), ids(4), ids(1))
        .unwrap();

    assert!(matches!(controller.run(), Err(OrchestraError::Data(_))));
    assert_eq!(controller.phase(), Phase::Terminated);
}

#[test]
fn display_batch_larger_than_domain_fails_before_training() {
    let out = TempDir::new().unwrap();
    let mut cfg = config(out.path(), 3, 2);
    cfg.display_size = nz(16);
    let trainer = Recording::new();

    let result = ControllerBuilder::new(&cfg)
        .build(trainer.clone(), ids(4), ids(4))
        .unwrap()
        .run();

    assert!(matches!(result, Err(OrchestraError::Data(_))));
    assert_eq!(trainer.count(|e| *e == Event::Generator), 0);
}

#[test]
fn failed_checkpoint_does_not_stop_training() {
    let out = TempDir::new().unwrap();
    let cfg = config(out.path(), 4, 2);
    let blocked = out.path().join("not-a-dir");
    fs::write(&blocked, "file").unwrap();

    let trainer = Recording::new();
    let outcome = ControllerBuilder::new(&cfg)
        .checkpoints(CheckpointManager::new(&blocked, nz(2)))
        .build(trainer.clone(), ids(8), ids(8))
        .unwrap()
        .run();

    assert_ok!(&outcome);
    assert_eq!(trainer.count(|e| *e == Event::Generator), 4);
}

#[test]
fn corrupt_checkpoint_pointer_is_fatal_on_resume() {
    let out = TempDir::new().unwrap();
    let mut cfg = config(out.path(), 3, 2);
    cfg.resume = true;
    fs::create_dir_all(cfg.checkpoint_dir()).unwrap();
    fs::write(cfg.checkpoint_dir().join("latest.json"), "][").unwrap();

    let trainer = Recording::new();
    let result = ControllerBuilder::new(&cfg)
        .build(trainer.clone(), ids(8), ids(8))
        .unwrap()
        .run();

    assert_err!(&result);
    assert!(matches!(result, Err(OrchestraError::Resume(_))));
    assert_eq!(trainer.count(|e| *e == Event::Generator), 0);
}

#[test]
fn resume_without_checkpoint_starts_fresh() {
    let out = TempDir::new().unwrap();
    let mut cfg = config(out.path(), 2, 100);
    cfg.resume = true;

    let outcome = ControllerBuilder::new(&cfg)
        .build(Recording::new(), ids(4), ids(4))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(outcome.iterations(), 2);
}

#[test]
fn cancellation_stops_between_iterations() {
    let out = TempDir::new().unwrap();
    let cfg = config(out.path(), 10, 100);
    let token = CancellationToken::new();
    let trainer = Recording {
        cancel_after: Some((2, token.clone())),
        ..Recording::new()
    };

    let mut controller = ControllerBuilder::new(&cfg)
        .cancel(token)
        .build(trainer.clone(), ids(16), ids(16))
        .unwrap();
    let outcome = controller.run().unwrap();

    assert_eq!(outcome, Outcome::Interrupted { iterations: 2 });
    assert!(!outcome.is_completed());
    assert_eq!(controller.phase(), Phase::Terminated);
    // the interrupted step still finished its schedule
    assert_eq!(trainer.count(|e| *e == Event::LearningRate), 2);
}

#[test]
fn controller_runs_once() {
    let out = TempDir::new().unwrap();
    let cfg = config(out.path(), 1, 100);
    let mut controller = ControllerBuilder::new(&cfg)
        .build(Recording::new(), ids(2), ids(2))
        .unwrap();

    assert_ok!(controller.run());
    assert!(matches!(
        controller.run(),
        Err(OrchestraError::InvalidConfig(_))
    ));
}
