use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Barrier, Mutex, MutexGuard,
};

use log::warn;

use super::Collective;
use crate::orchestra::error::{OrchestraError, Result};

/// What a rank is doing when it enters the shared barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Barrier,
    Reduce(usize),
    Shutdown,
}

#[derive(Debug)]
struct HubInner {
    world_size: usize,
    barrier: Barrier,
    ops: Mutex<Vec<Option<Op>>>,
    sum: Mutex<Vec<f64>>,
    joined: Mutex<Vec<bool>>,
    /// Set once a rank has left; later collectives fail instead of waiting.
    departed: AtomicBool,
}

/// Meeting point for ranks that live as threads of one process.
///
/// Blocking waits have no timeout: a rank that never arrives hangs its siblings,
/// exactly like the cross-process backend would until its timeout fires.
#[derive(Debug, Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    pub fn new(world_size: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                world_size,
                barrier: Barrier::new(world_size),
                ops: Mutex::new(vec![None; world_size]),
                sum: Mutex::new(Vec::new()),
                joined: Mutex::new(vec![false; world_size]),
                departed: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.inner.world_size
    }

    /// Claims `rank` and blocks until every rank has joined.
    ///
    /// # Errors
    /// Returns `Rendezvous` if `rank` is out of range or already claimed.
    pub fn join(&self, rank: usize) -> Result<LocalCollective> {
        {
            let mut joined = lock(&self.inner.joined)?;
            match joined.get_mut(rank) {
                None => {
                    return Err(OrchestraError::Rendezvous(format!(
                        "rank {rank} does not fit in world_size {}",
                        self.world_size()
                    )))
                }
                Some(true) => {
                    return Err(OrchestraError::Rendezvous(format!(
                        "rank {rank} joined twice"
                    )))
                }
                Some(slot) => *slot = true,
            }
        }

        self.inner.barrier.wait();
        Ok(LocalCollective {
            hub: self.clone(),
            rank,
        })
    }
}

/// One rank's view of a [`LocalHub`].
#[derive(Debug)]
pub struct LocalCollective {
    hub: LocalHub,
    rank: usize,
}

impl LocalCollective {
    /// Meets every rank and checks they all entered the same operation.
    ///
    /// Both barrier phases run on every rank whatever the outcome, so a
    /// mismatch is reported everywhere without leaving a sibling waiting.
    fn enter(&self, op: Op) -> Result<()> {
        let inner = &self.hub.inner;
        if inner.departed.load(Ordering::SeqCst) {
            return Err(OrchestraError::Collective(format!(
                "rank {} called {op:?} after a sibling left the group",
                self.rank
            )));
        }

        lock(&inner.ops)?[self.rank] = Some(op);
        inner.barrier.wait();
        let agreed = lock(&inner.ops)?.iter().all(|o| *o == Some(op));
        if op == Op::Shutdown {
            inner.departed.store(true, Ordering::SeqCst);
        }
        inner.barrier.wait();

        if agreed {
            Ok(())
        } else {
            Err(OrchestraError::Collective(format!(
                "rank {} entered {op:?} while a sibling was in another operation",
                self.rank
            )))
        }
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.hub.world_size()
    }

    fn barrier(&mut self) -> Result<()> {
        self.enter(Op::Barrier)
    }

    fn all_reduce_mean(&mut self, values: &mut [f32]) -> Result<()> {
        self.enter(Op::Reduce(values.len()))?;

        let inner = &self.hub.inner;
        {
            let mut sum = lock(&inner.sum)?;
            if sum.is_empty() {
                sum.resize(values.len(), 0.0);
            }
            sum.iter_mut()
                .zip(values.iter())
                .for_each(|(s, &v)| *s += f64::from(v));
        }

        inner.barrier.wait();
        {
            let sum = lock(&inner.sum)?;
            values
                .iter_mut()
                .zip(sum.iter())
                .for_each(|(v, s)| *v = (s / inner.world_size as f64) as f32);
        }

        // No sibling gets past the next `enter` before the leader clears.
        if inner.barrier.wait().is_leader() {
            lock(&inner.sum)?.clear();
        }
        Ok(())
    }

    /// Leaves the group. A sibling caught in another operation gets a
    /// `Collective` error from it, never a completed barrier.
    fn shutdown(&mut self) -> Result<()> {
        if self.hub.inner.departed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.enter(Op::Shutdown) {
            warn!("rank {} left a group out of step: {e}", self.rank);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| OrchestraError::Collective("local hub lock poisoned".into()))
}
