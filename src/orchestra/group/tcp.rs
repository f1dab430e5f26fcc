use std::{net::SocketAddr, time::Duration};

use log::{debug, info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::{Builder, Runtime},
    time::{self, Instant},
};

use super::{
    wire::{self, Frame, Link},
    Collective,
};
use crate::orchestra::error::{OrchestraError, Result};

const CONNECT_RETRY: Duration = Duration::from_millis(500);

struct Peer {
    rank: usize,
    link: Link,
    left: bool,
}

enum Role {
    /// Rank 0 holds one link per peer and coordinates every collective.
    Root { peers: Vec<Peer> },
    Peer { link: Link },
}

/// Star-topology process group over TCP.
///
/// Rank 0 binds the master address; every other rank connects to it. Each
/// collective is a gather to rank 0 followed by a broadcast back. The group owns a
/// private single-threaded runtime and blocks the caller for every operation.
pub struct TcpCollective {
    runtime: Runtime,
    role: Role,
    rank: usize,
    world_size: usize,
    generation: u64,
    timeout: Duration,
}

impl TcpCollective {
    /// Meets every other rank at `master`.
    ///
    /// # Args
    /// * `master` - Address rank 0 listens on.
    /// * `world_size` - Total number of ranks expected.
    /// * `rank` - This process's rank.
    /// * `rendezvous_timeout` - How long to wait for the whole group to assemble.
    /// * `collective_timeout` - How long any later collective may block.
    ///
    /// # Errors
    /// Returns `Rendezvous` if the group does not assemble in time or a peer
    /// announces a different world size or a duplicate rank.
    pub fn connect(
        master: SocketAddr,
        world_size: usize,
        rank: usize,
        rendezvous_timeout: Duration,
        collective_timeout: Duration,
    ) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| OrchestraError::Rendezvous(format!("cannot start runtime: {e}")))?;

        let role = runtime.block_on(async {
            if rank == 0 {
                accept_peers(master, world_size, rendezvous_timeout).await
            } else {
                join_master(master, world_size, rank, rendezvous_timeout).await
            }
        })?;

        Ok(Self {
            runtime,
            role,
            rank,
            world_size,
            generation: 0,
            timeout: collective_timeout,
        })
    }
}

impl Collective for TcpCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&mut self) -> Result<()> {
        self.generation += 1;
        let generation = self.generation;
        let timeout = self.timeout;
        let Self { runtime, role, .. } = self;

        runtime.block_on(async move {
            match role {
                Role::Root { peers } => {
                    for peer in peers.iter_mut() {
                        match expect(peer, timeout, "arrive").await? {
                            Frame::Arrive { generation: g } if g == generation => {}
                            other => return Err(out_of_step(peer.rank, generation, &other)),
                        }
                    }
                    for peer in peers.iter_mut() {
                        wire::send(&mut peer.link, &Frame::Release { generation }).await?;
                    }
                    Ok(())
                }
                Role::Peer { link } => {
                    wire::send(link, &Frame::Arrive { generation }).await?;
                    match from_root(link, timeout, "release").await? {
                        Frame::Release { generation: g } if g == generation => Ok(()),
                        other => Err(out_of_step(0, generation, &other)),
                    }
                }
            }
        })
    }

    fn all_reduce_mean(&mut self, values: &mut [f32]) -> Result<()> {
        self.generation += 1;
        let generation = self.generation;
        let timeout = self.timeout;
        let world_size = self.world_size;
        let Self { runtime, role, .. } = self;

        runtime.block_on(async move {
            match role {
                Role::Root { peers } => {
                    let mut sum: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();

                    for peer in peers.iter_mut() {
                        match expect(peer, timeout, "reduce").await? {
                            Frame::Reduce {
                                generation: g,
                                values: theirs,
                            } if g == generation => {
                                if theirs.len() != sum.len() {
                                    return Err(OrchestraError::Collective(format!(
                                        "rank {} reduced {} value(s), expected {}",
                                        peer.rank,
                                        theirs.len(),
                                        sum.len()
                                    )));
                                }
                                sum.iter_mut()
                                    .zip(theirs)
                                    .for_each(|(s, v)| *s += f64::from(v));
                            }
                            other => return Err(out_of_step(peer.rank, generation, &other)),
                        }
                    }

                    let mean: Vec<f32> = sum.iter().map(|s| (s / world_size as f64) as f32).collect();
                    for peer in peers.iter_mut() {
                        let frame = Frame::Reduced {
                            generation,
                            values: mean.clone(),
                        };
                        wire::send(&mut peer.link, &frame).await?;
                    }
                    values.copy_from_slice(&mean);
                    Ok(())
                }
                Role::Peer { link } => {
                    let frame = Frame::Reduce {
                        generation,
                        values: values.to_vec(),
                    };
                    wire::send(link, &frame).await?;

                    match from_root(link, timeout, "reduced").await? {
                        Frame::Reduced {
                            generation: g,
                            values: mean,
                        } if g == generation && mean.len() == values.len() => {
                            values.copy_from_slice(&mean);
                            Ok(())
                        }
                        other => Err(out_of_step(0, generation, &other)),
                    }
                }
            }
        })
    }

    fn shutdown(&mut self) -> Result<()> {
        let timeout = self.timeout;
        let rank = self.rank;
        let Self { runtime, role, .. } = self;

        runtime.block_on(async move {
            match role {
                Role::Root { peers } => {
                    for peer in peers.iter_mut().filter(|p| !p.left) {
                        if let Err(e) = wire::send(&mut peer.link, &Frame::Shutdown).await {
                            debug!("rank {} already gone: {e}", peer.rank);
                        }
                    }

                    let mut stuck = Vec::new();
                    for peer in peers.iter_mut().filter(|p| !p.left) {
                        if drain_until_leave(peer, timeout).await.is_err() {
                            stuck.push(peer.rank);
                        }
                    }

                    if stuck.is_empty() {
                        Ok(())
                    } else {
                        Err(OrchestraError::Collective(format!(
                            "rank(s) {stuck:?} did not leave within {timeout:?}"
                        )))
                    }
                }
                Role::Peer { link } => {
                    if let Err(e) = wire::send(link, &Frame::Leave { rank }).await {
                        debug!("master already gone: {e}");
                        return Ok(());
                    }

                    let deadline = Instant::now() + timeout;
                    loop {
                        match time::timeout_at(deadline, wire::recv(link)).await {
                            Ok(Ok(Some(Frame::Shutdown))) | Ok(Ok(None)) | Ok(Err(_)) => {
                                return Ok(())
                            }
                            Ok(Ok(Some(stale))) => debug!("dropping {} during shutdown", stale.kind()),
                            Err(_) => {
                                return Err(OrchestraError::Collective(format!(
                                    "master did not acknowledge leave within {timeout:?}"
                                )))
                            }
                        }
                    }
                }
            }
        })
    }
}

async fn accept_peers(master: SocketAddr, world_size: usize, timeout: Duration) -> Result<Role> {
    let listener = TcpListener::bind(master)
        .await
        .map_err(|e| OrchestraError::Rendezvous(format!("cannot bind {master}: {e}")))?;
    info!("listening at {master}, waiting for {} peer(s)", world_size - 1);

    let gather = async {
        let mut slots: Vec<Option<Peer>> = (0..world_size).map(|_| None).collect();
        let mut joined = 0;

        while joined < world_size - 1 {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| OrchestraError::Rendezvous(format!("accept failed: {e}")))?;
            stream.set_nodelay(true)?;
            let mut link = wire::link(stream);

            let (rank, theirs) = match wire::recv(&mut link).await? {
                Some(Frame::Hello { rank, world_size }) => (rank, world_size),
                other => {
                    return Err(OrchestraError::Rendezvous(format!(
                        "expected hello from {addr}, got {other:?}"
                    )))
                }
            };

            if theirs != world_size {
                return Err(OrchestraError::Rendezvous(format!(
                    "rank {rank} at {addr} expects world_size {theirs}, master has {world_size}"
                )));
            }
            if rank == 0 || rank >= world_size {
                return Err(OrchestraError::Rendezvous(format!(
                    "peer at {addr} claims invalid rank {rank}"
                )));
            }
            if slots[rank].is_some() {
                return Err(OrchestraError::Rendezvous(format!(
                    "rank {rank} joined twice (second time from {addr})"
                )));
            }

            slots[rank] = Some(Peer {
                rank,
                link,
                left: false,
            });
            joined += 1;
            info!("rank {rank} joined from {addr} ({joined}/{})", world_size - 1);
        }

        Ok::<_, OrchestraError>(slots.into_iter().flatten().collect::<Vec<_>>())
    };

    let mut peers = time::timeout(timeout, gather).await.map_err(|_| {
        OrchestraError::Rendezvous(format!("group did not assemble within {timeout:?}"))
    })??;

    for peer in peers.iter_mut() {
        wire::send(&mut peer.link, &Frame::Welcome { world_size })
            .await
            .map_err(|e| OrchestraError::Rendezvous(e.to_string()))?;
    }

    Ok(Role::Root { peers })
}

async fn join_master(
    master: SocketAddr,
    world_size: usize,
    rank: usize,
    timeout: Duration,
) -> Result<Role> {
    let deadline = Instant::now() + timeout;

    let stream = loop {
        match TcpStream::connect(master).await {
            Ok(stream) => break stream,
            Err(e) if Instant::now() + CONNECT_RETRY < deadline => {
                debug!("master {master} not reachable yet: {e}");
                time::sleep(CONNECT_RETRY).await;
            }
            Err(e) => {
                return Err(OrchestraError::Rendezvous(format!(
                    "cannot reach master {master}: {e}"
                )))
            }
        }
    };
    stream.set_nodelay(true)?;

    let mut link = wire::link(stream);
    wire::send(&mut link, &Frame::Hello { rank, world_size })
        .await
        .map_err(|e| OrchestraError::Rendezvous(e.to_string()))?;

    match time::timeout_at(deadline, wire::recv(&mut link)).await {
        Ok(Ok(Some(Frame::Welcome { world_size: theirs }))) if theirs == world_size => {
            info!("rank {rank} joined master {master}");
            Ok(Role::Peer { link })
        }
        Ok(Ok(other)) => Err(OrchestraError::Rendezvous(format!(
            "unexpected reply from master: {other:?}"
        ))),
        Ok(Err(e)) => Err(OrchestraError::Rendezvous(e.to_string())),
        Err(_) => Err(OrchestraError::Rendezvous(format!(
            "master did not welcome rank {rank} within {timeout:?}"
        ))),
    }
}

/// Root side: the next frame from `peer`, treating a leave or a closed link as a failure.
async fn expect(peer: &mut Peer, timeout: Duration, what: &str) -> Result<Frame> {
    let frame = time::timeout(timeout, wire::recv(&mut peer.link))
        .await
        .map_err(|_| {
            OrchestraError::Collective(format!(
                "timed out after {timeout:?} waiting for {what} from rank {}",
                peer.rank
            ))
        })??;

    match frame {
        Some(Frame::Leave { .. }) | None => {
            peer.left = true;
            Err(OrchestraError::Collective(format!(
                "rank {} left the group while others wait for {what}",
                peer.rank
            )))
        }
        Some(frame) => Ok(frame),
    }
}

/// Peer side: the next frame from rank 0, treating a shutdown or a closed link as a failure.
async fn from_root(link: &mut Link, timeout: Duration, what: &str) -> Result<Frame> {
    let frame = time::timeout(timeout, wire::recv(link)).await.map_err(|_| {
        OrchestraError::Collective(format!("timed out after {timeout:?} waiting for {what}"))
    })??;

    match frame {
        Some(Frame::Shutdown) | None => Err(OrchestraError::Collective(format!(
            "group was shut down by rank 0 while waiting for {what}"
        ))),
        Some(frame) => Ok(frame),
    }
}

async fn drain_until_leave(peer: &mut Peer, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match time::timeout_at(deadline, wire::recv(&mut peer.link)).await {
            Ok(Ok(Some(Frame::Leave { .. }))) | Ok(Ok(None)) => {
                peer.left = true;
                return Ok(());
            }
            Ok(Ok(Some(stale))) => debug!("dropping {} from rank {}", stale.kind(), peer.rank),
            Ok(Err(e)) => {
                warn!("rank {} link broke during shutdown: {e}", peer.rank);
                peer.left = true;
                return Ok(());
            }
            Err(_) => {
                return Err(OrchestraError::Collective(format!(
                    "rank {} did not leave",
                    peer.rank
                )))
            }
        }
    }
}

fn out_of_step(rank: usize, generation: u64, got: &Frame) -> OrchestraError {
    OrchestraError::Collective(format!(
        "rank {rank} is out of step at collective #{generation}: got {}",
        got.kind()
    ))
}
