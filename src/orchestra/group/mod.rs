//! Process-group lifecycle: one collective context per process, initialized at
//! most once and torn down exactly once on every exit path.

mod local;
mod tcp;
mod wire;

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use log::{error, info, warn};

pub use local::{LocalCollective, LocalHub};
pub use tcp::TcpCollective;

use super::{
    config::RunConfig,
    error::{OrchestraError, Result},
};

/// Blocking collective operations every rank must call in the same order.
pub trait Collective: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Returns once every rank has entered the barrier.
    fn barrier(&mut self) -> Result<()>;

    /// Replaces `values` with their element-wise mean over all ranks.
    fn all_reduce_mean(&mut self, values: &mut [f32]) -> Result<()>;

    /// Leaves the group. Blocks until the other ranks leave too.
    fn shutdown(&mut self) -> Result<()>;
}

/// How ranks reach each other.
#[derive(Debug, Clone)]
pub enum Backend {
    Tcp {
        master: SocketAddr,
        rendezvous_timeout: Duration,
        collective_timeout: Duration,
    },
    /// Ranks are threads of this process.
    Local(LocalHub),
}

impl Backend {
    /// The cross-process backend described by `config`.
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        Ok(Self::Tcp {
            master: config.master_socket_addr()?,
            rendezvous_timeout: config.rendezvous_timeout(),
            collective_timeout: config.collective_timeout(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Tcp { .. } => "tcp",
            Backend::Local(_) => "local",
        }
    }

    fn connect(&self, world_size: usize, rank: usize) -> Result<Box<dyn Collective>> {
        match self {
            Backend::Tcp {
                master,
                rendezvous_timeout,
                collective_timeout,
            } => Ok(Box::new(TcpCollective::connect(
                *master,
                world_size,
                rank,
                *rendezvous_timeout,
                *collective_timeout,
            )?)),
            Backend::Local(hub) => {
                if hub.world_size() != world_size {
                    return Err(OrchestraError::Rendezvous(format!(
                        "local hub has {} rank(s), run expects {world_size}",
                        hub.world_size()
                    )));
                }
                Ok(Box::new(hub.join(rank)?))
            }
        }
    }
}

/// Shared, closable access to the collective context.
///
/// Cloned into whatever issues collectives during the run; after teardown every
/// operation fails instead of touching a dead group.
#[derive(Clone)]
pub struct GroupHandle {
    inner: Arc<Mutex<Option<Box<dyn Collective>>>>,
    rank: usize,
    world_size: usize,
}

impl GroupHandle {
    fn new(collective: Box<dyn Collective>) -> Self {
        Self {
            rank: collective.rank(),
            world_size: collective.world_size(),
            inner: Arc::new(Mutex::new(Some(collective))),
        }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn barrier(&self) -> Result<()> {
        self.with(|c| c.barrier())
    }

    pub fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()> {
        self.with(|c| c.all_reduce_mean(values))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|g| g.is_none()).unwrap_or(true)
    }

    fn with<T>(&self, op: impl FnOnce(&mut dyn Collective) -> Result<T>) -> Result<T> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| OrchestraError::Collective("process group lock poisoned".into()))?;
        match guard.as_mut() {
            Some(collective) => op(collective.as_mut()),
            None => Err(OrchestraError::Collective(
                "process group was already torn down".into(),
            )),
        }
    }

    fn close(&self) -> Result<()> {
        let taken = match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match taken {
            Some(mut collective) => collective.shutdown(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupHandle")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

static PROCESS_SLOT: GroupSlot = GroupSlot::new();

/// The slot belonging to this OS process.
pub fn process_slot() -> &'static GroupSlot {
    &PROCESS_SLOT
}

const UNINITIALIZED: u8 = 0;
const ACTIVE: u8 = 1;
const RELEASED: u8 = 2;

/// The per-process record of whether a process group was ever initialized.
///
/// Binaries keep one in a `static`; ranks simulated as threads get one each.
#[derive(Debug)]
pub struct GroupSlot {
    state: AtomicU8,
}

impl GroupSlot {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ACTIVE
    }

    /// Establishes the collective context, blocking until every peer rendezvouses.
    ///
    /// # Errors
    /// * `InvalidConfig` when `world_size <= 1`, there is nothing to coordinate.
    /// * `AlreadyInitialized` when this slot was used before, even if torn down since.
    /// * `Rendezvous` when the peers cannot be reached. Not retried.
    pub fn initialize(
        &self,
        backend: &Backend,
        world_size: usize,
        rank: usize,
    ) -> Result<ProcessGroup<'_>> {
        if world_size <= 1 {
            return Err(OrchestraError::InvalidConfig(format!(
                "a process group needs world_size > 1, got {world_size}"
            )));
        }

        self.state
            .compare_exchange(UNINITIALIZED, ACTIVE, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| OrchestraError::AlreadyInitialized)?;

        info!(
            rank = rank,
            world_size = world_size;
            "initializing {} process group",
            backend.name()
        );

        match backend.connect(world_size, rank) {
            Ok(collective) => Ok(ProcessGroup {
                slot: self,
                handle: GroupHandle::new(collective),
                released: false,
            }),
            Err(e) => {
                self.state.store(RELEASED, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

impl Default for GroupSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// An initialized process group. Torn down exactly once, by `teardown` or on drop.
#[derive(Debug)]
pub struct ProcessGroup<'s> {
    slot: &'s GroupSlot,
    handle: GroupHandle,
    released: bool,
}

impl ProcessGroup<'_> {
    /// A handle for issuing collectives while the group lives.
    pub fn handle(&self) -> GroupHandle {
        self.handle.clone()
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.handle.rank()
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.handle.world_size()
    }

    /// Releases the collective context. Blocks until the other ranks reach teardown.
    pub fn teardown(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let ret = self.handle.close();
        self.slot.state.store(RELEASED, Ordering::SeqCst);
        info!(rank = self.handle.rank(); "process group torn down");
        ret
    }
}

impl Drop for ProcessGroup<'_> {
    fn drop(&mut self) {
        if !self.released {
            warn!("process group dropped without teardown, releasing it now");
            if let Err(e) = self.release() {
                error!("teardown on drop failed: {e}");
            }
        }
    }
}
