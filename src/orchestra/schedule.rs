use std::num::NonZeroU64;

/// Returns true if the step with 0-based index `iteration` completes an `interval` window.
///
/// Depends only on the absolute iteration, so a resumed run fires on the same
/// steps as an uninterrupted one.
#[inline]
pub fn due(iteration: u64, interval: NonZeroU64) -> bool {
    (iteration + 1) % interval.get() == 0
}

/// The named periodic actions of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Log,
    Visualize,
    Checkpoint,
}

/// Which actions fire on a given step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Due {
    pub log: bool,
    pub visualize: bool,
    pub checkpoint: bool,
}

impl Due {
    #[inline]
    pub fn any(&self) -> bool {
        self.log || self.visualize || self.checkpoint
    }
}

/// Defines when to log, dump images and checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    pub log: NonZeroU64,
    pub visualize: NonZeroU64,
    pub checkpoint: NonZeroU64,
}

impl Cadence {
    pub fn new(log: NonZeroU64, visualize: NonZeroU64, checkpoint: NonZeroU64) -> Self {
        Self {
            log,
            visualize,
            checkpoint,
        }
    }

    #[inline]
    pub fn interval(&self, action: Action) -> NonZeroU64 {
        match action {
            Action::Log => self.log,
            Action::Visualize => self.visualize,
            Action::Checkpoint => self.checkpoint,
        }
    }

    #[inline]
    pub fn is_due(&self, iteration: u64, action: Action) -> bool {
        due(iteration, self.interval(action))
    }

    /// Evaluates every named interval for the step with 0-based index `iteration`.
    pub fn due(&self, iteration: u64) -> Due {
        Due {
            log: self.is_due(iteration, Action::Log),
            visualize: self.is_due(iteration, Action::Visualize),
            checkpoint: self.is_due(iteration, Action::Checkpoint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(n: u64) -> NonZeroU64 {
        NonZeroU64::new(n).unwrap()
    }

    #[test]
    fn fires_after_interval_completed_steps() {
        let k = nz(3);
        assert!(!due(0, k));
        assert!(!due(1, k));
        assert!(due(2, k));
        assert!(!due(3, k));
        assert!(!due(4, k));
        assert!(due(5, k));
    }

    #[test]
    fn matches_modulo_rule_for_many_intervals() {
        for interval in 1..=12 {
            let k = nz(interval);
            for it in 0..200 {
                assert_eq!(due(it, k), (it + 1) % interval == 0);
            }
            assert!(due(interval - 1, k));
            if interval >= 2 {
                assert!(!due(interval - 2, k));
            }
        }
    }

    #[test]
    fn interval_of_one_fires_every_step() {
        assert!((0..10).all(|it| due(it, nz(1))));
    }

    #[test]
    fn resumed_offset_fires_on_same_steps() {
        let cadence = Cadence::new(nz(10), nz(10), nz(500));
        let fresh: Vec<u64> = (0..2000).filter(|&it| cadence.due(it).checkpoint).collect();
        let resumed: Vec<u64> = (1000..2000).filter(|&it| cadence.due(it).checkpoint).collect();
        assert_eq!(&fresh[2..], &resumed[..]);
        assert_eq!(resumed, vec![1499, 1999]);
    }

    #[test]
    fn named_actions_are_independent() {
        let cadence = Cadence::new(nz(2), nz(4), nz(3));
        assert_eq!(
            cadence.due(1),
            Due {
                log: true,
                visualize: false,
                checkpoint: false
            }
        );
        assert_eq!(
            cadence.due(11),
            Due {
                log: true,
                visualize: true,
                checkpoint: true
            }
        );
        assert!(!cadence.due(4).any());
    }
}
