use std::fmt;

use super::error::{OrchestraError, Result};

/// The rank that owns logging, image dumps and checkpoint writes.
pub const REPORTING_RANK: usize = 0;

/// The compute device a process drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

/// This process's place in the run. Immutable once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    rank: usize,
    local_device: usize,
    world_size: usize,
}

impl Topology {
    /// Computes the global rank as `node_rank * devices_per_node + local_device`.
    ///
    /// # Args
    /// * `node_rank` - Index of this machine among all nodes.
    /// * `devices_per_node` - Processes launched on each node.
    /// * `local_device` - Index of this process's device on its node.
    /// * `world_size` - Total number of cooperating processes.
    ///
    /// # Errors
    /// Returns `InvalidConfig` on negative inputs, or if the resulting rank cannot
    /// exist within `world_size`.
    pub fn resolve(
        node_rank: i64,
        devices_per_node: i64,
        local_device: i64,
        world_size: i64,
    ) -> Result<Self> {
        let node_rank = non_negative("node_rank", node_rank)?;
        let devices_per_node = non_negative("devices_per_node", devices_per_node)?;
        let local_device = non_negative("local_device", local_device)?;
        let world_size = non_negative("world_size", world_size)?;

        if world_size == 0 {
            return Err(OrchestraError::InvalidConfig(
                "world_size must be at least 1".into(),
            ));
        }

        if devices_per_node == 0 || local_device >= devices_per_node {
            return Err(OrchestraError::InvalidConfig(format!(
                "local device {local_device} out of range for {devices_per_node} device(s) per node"
            )));
        }

        let rank = node_rank
            .checked_mul(devices_per_node)
            .and_then(|base| base.checked_add(local_device))
            .ok_or_else(|| OrchestraError::InvalidConfig("rank overflows usize".into()))?;

        if rank >= world_size {
            return Err(OrchestraError::InvalidConfig(format!(
                "rank {rank} does not fit in world_size {world_size}"
            )));
        }

        Ok(Self {
            rank,
            local_device,
            world_size,
        })
    }

    /// A single-process, single-device topology.
    pub fn single() -> Self {
        Self {
            rank: 0,
            local_device: 0,
            world_size: 1,
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

    #[inline]
    pub fn local_device(&self) -> usize {
        self.local_device
    }

    /// Distributed mode is active iff more than one process cooperates.
    #[inline]
    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// In non-distributed mode the single process is always the reporting rank.
    #[inline]
    pub fn is_reporting_rank(&self) -> bool {
        self.rank == REPORTING_RANK
    }

    pub fn device(&self, use_cuda: bool) -> Device {
        if use_cuda {
            Device::Cuda(self.local_device)
        } else {
            Device::Cpu
        }
    }
}

fn non_negative(name: &str, value: i64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| OrchestraError::InvalidConfig(format!("{name} must be >= 0, got {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_is_node_major() {
        let t = Topology::resolve(1, 4, 2, 8).unwrap();
        assert_eq!(t.rank(), 6);
        assert_eq!(t.local_device(), 2);
        assert!(t.is_distributed());
        assert!(!t.is_reporting_rank());
    }

    #[test]
    fn world_of_one_is_local_and_reports() {
        let t = Topology::resolve(0, 1, 0, 1).unwrap();
        assert_eq!(t, Topology::single());
        assert!(!t.is_distributed());
        assert!(t.is_reporting_rank());
    }

    #[test]
    fn negative_inputs_are_config_errors() {
        for (n, d, l, w) in [(-1, 1, 0, 1), (0, -1, 0, 1), (0, 1, -1, 1), (0, 1, 0, -2)] {
            let err = Topology::resolve(n, d, l, w).unwrap_err();
            assert!(matches!(err, OrchestraError::InvalidConfig(_)), "{err}");
        }
    }

    #[test]
    fn rank_outside_world_is_rejected() {
        assert!(Topology::resolve(1, 2, 0, 2).is_err());
        assert!(Topology::resolve(0, 2, 2, 4).is_err());
        assert!(Topology::resolve(0, 1, 0, 0).is_err());
    }

    #[test]
    fn device_follows_local_index() {
        let t = Topology::resolve(0, 2, 1, 2).unwrap();
        assert_eq!(t.device(true), Device::Cuda(1));
        assert_eq!(t.device(false), Device::Cpu);
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
    }
}
