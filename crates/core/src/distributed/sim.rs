//! In-process simulated network.
//!
//! Participants are threads of one process sharing a [`SimNetwork`]. Each
//! ordered pair of ranks has a FIFO mailbox; a send posts the bytes, a receive
//! blocks until the matching message arrives. Inside a grouped round nothing
//! moves until the outermost `group_end`, which posts all sends before
//! serving any receive, the way a grouped NCCL round never deadlocks on
//! ordering within the round.
//!
//! Buffers must be host buffers (see [`crate::runtime::host::HostRuntime`]).
//! Every issued operation is appended to the backend's [`CallTrace`].

use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use candle_core::Tensor;

use super::error::{DistributedError, Result};
use super::transport::{CollectiveBackend, RendezvousId, Transport};
use crate::buffer::DeviceBuffer;
use crate::runtime::{CallTrace, Stream, TraceEvent};

/// How long a receive waits for its peer before failing.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);

const RENDEZVOUS_ID_BYTES: usize = 128;

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
}

impl Mailbox {
    fn post(&self, bytes: Vec<u8>) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(bytes);
        self.ready.notify_all();
    }

    fn take(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(bytes) = queue.pop_front() {
                return Some(bytes);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            queue = self
                .ready
                .wait_timeout(queue, remaining)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

struct SimGroup {
    world_size: usize,
    joined: Mutex<usize>,
    all_joined: Condvar,
    mailboxes: Vec<Mailbox>,
}

impl SimGroup {
    fn new(world_size: usize) -> Self {
        Self {
            world_size,
            joined: Mutex::new(0),
            all_joined: Condvar::new(),
            mailboxes: (0..world_size * world_size)
                .map(|_| Mailbox::default())
                .collect(),
        }
    }

    fn mailbox(&self, src: usize, dst: usize) -> &Mailbox {
        &self.mailboxes[src * self.world_size + dst]
    }

    /// Block until every participant has joined. Returns false on timeout.
    fn join(&self, timeout: Duration) -> bool {
        let mut joined = self.joined.lock().unwrap_or_else(|e| e.into_inner());
        *joined += 1;
        self.all_joined.notify_all();
        let (mut joined, result) = self
            .all_joined
            .wait_timeout_while(joined, timeout, |n| *n < self.world_size)
            .unwrap_or_else(|e| e.into_inner());
        if result.timed_out() && *joined < self.world_size {
            *joined -= 1;
            return false;
        }
        true
    }
}

/// Shared medium for simulated participants.
pub struct SimNetwork {
    groups: Mutex<HashMap<RendezvousId, Arc<SimGroup>>>,
    op_timeout: Duration,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_op_timeout(DEFAULT_OP_TIMEOUT)
    }

    /// Network whose receives fail after `op_timeout` without a message.
    pub fn with_op_timeout(op_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            groups: Mutex::new(HashMap::new()),
            op_timeout,
        })
    }

    fn group(&self, id: &RendezvousId, world_size: usize) -> Result<Arc<SimGroup>> {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let group = groups
            .entry(id.clone())
            .or_insert_with(|| Arc::new(SimGroup::new(world_size)));
        if group.world_size != world_size {
            return Err(DistributedError::Rendezvous(format!(
                "group already formed with world_size {}, joined with {world_size}",
                group.world_size
            )));
        }
        Ok(Arc::clone(group))
    }
}

/// [`CollectiveBackend`] over a [`SimNetwork`].
#[derive(Clone)]
pub struct SimBackend {
    network: Arc<SimNetwork>,
    trace: CallTrace,
}

impl SimBackend {
    pub fn new(network: Arc<SimNetwork>, trace: CallTrace) -> Self {
        Self { network, trace }
    }

    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }
}

impl CollectiveBackend for SimBackend {
    type Transport = SimTransport;

    fn name(&self) -> &'static str {
        "sim"
    }

    fn unique_id(&self) -> Result<RendezvousId> {
        Ok(RendezvousId(
            (0..RENDEZVOUS_ID_BYTES).map(|_| rand::random::<u8>()).collect(),
        ))
    }

    fn connect(
        &self,
        id: &RendezvousId,
        world_size: usize,
        rank: usize,
        device: usize,
        timeout: Duration,
    ) -> Result<SimTransport> {
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        let group = self.network.group(id, world_size)?;
        if !group.join(timeout) {
            tracing::warn!(rank, world_size, ?timeout, "simulated rendezvous timed out");
            return Err(DistributedError::RendezvousTimeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        tracing::debug!(rank, world_size, device, "simulated transport connected");
        Ok(SimTransport {
            group,
            rank,
            device,
            op_timeout: self.network.op_timeout,
            trace: self.trace.clone(),
            round: Mutex::new(PendingRound::default()),
        })
    }
}

enum PendingOp {
    Send {
        buffer: DeviceBuffer,
        bytes: Range<usize>,
        peer: usize,
    },
    Recv {
        buffer: DeviceBuffer,
        bytes: Range<usize>,
        peer: usize,
    },
}

#[derive(Default)]
struct PendingRound {
    depth: usize,
    ops: Vec<PendingOp>,
}

/// One participant of a simulated group.
pub struct SimTransport {
    group: Arc<SimGroup>,
    rank: usize,
    device: usize,
    op_timeout: Duration,
    trace: CallTrace,
    round: Mutex<PendingRound>,
}

impl SimTransport {
    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.group.world_size {
            return Err(DistributedError::InvalidRank {
                rank: peer,
                world_size: self.group.world_size,
            });
        }
        Ok(())
    }

    fn check_range(buffer: &DeviceBuffer, bytes: &Range<usize>) -> Result<()> {
        if bytes.start > bytes.end || bytes.end > buffer.nbytes() {
            return Err(DistributedError::Transport(format!(
                "byte range {bytes:?} outside a {}-byte buffer",
                buffer.nbytes()
            )));
        }
        Ok(())
    }

    fn post(&self, buffer: &DeviceBuffer, bytes: Range<usize>, peer: usize) -> Result<()> {
        let payload = buffer.with_host_bytes(|b| b[bytes].to_vec())?;
        self.group.mailbox(self.rank, peer).post(payload);
        Ok(())
    }

    fn take(&self, peer: usize) -> Result<Vec<u8>> {
        self.group
            .mailbox(peer, self.rank)
            .take(self.op_timeout)
            .ok_or_else(|| {
                DistributedError::Transport(format!(
                    "rank {} received nothing from rank {peer} within {:?}",
                    self.rank, self.op_timeout
                ))
            })
    }

    fn deliver(&self, buffer: &DeviceBuffer, bytes: Range<usize>, peer: usize) -> Result<()> {
        let payload = self.take(peer)?;
        if payload.len() != bytes.len() {
            return Err(DistributedError::Transport(format!(
                "rank {} expected {} bytes from rank {peer}, got {}",
                self.rank,
                bytes.len(),
                payload.len()
            )));
        }
        buffer.with_host_bytes_mut(|b| b[bytes].copy_from_slice(&payload))?;
        Ok(())
    }

    fn run(&self, op: PendingOp) -> Result<()> {
        match op {
            PendingOp::Send {
                buffer,
                bytes,
                peer,
            } => self.post(&buffer, bytes, peer),
            PendingOp::Recv {
                buffer,
                bytes,
                peer,
            } => self.deliver(&buffer, bytes, peer),
        }
    }

    /// Queue `op` inside an open round, or run it right away.
    fn issue(&self, op: PendingOp) -> Result<()> {
        let mut round = self.round.lock().unwrap_or_else(|e| e.into_inner());
        if round.depth > 0 {
            round.ops.push(op);
            return Ok(());
        }
        drop(round);
        self.run(op)
    }
}

impl Transport for SimTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn device(&self) -> usize {
        self.device
    }

    fn group_start(&self) -> Result<()> {
        self.round.lock().unwrap_or_else(|e| e.into_inner()).depth += 1;
        self.trace.push(TraceEvent::GroupStart);
        Ok(())
    }

    fn group_end(&self) -> Result<()> {
        let ops = {
            let mut round = self.round.lock().unwrap_or_else(|e| e.into_inner());
            if round.depth == 0 {
                return Err(DistributedError::Transport(
                    "group_end without a matching group_start".to_string(),
                ));
            }
            round.depth -= 1;
            if round.depth > 0 {
                Vec::new()
            } else {
                std::mem::take(&mut round.ops)
            }
        };
        self.trace.push(TraceEvent::GroupEnd);

        let (sends, recvs): (Vec<_>, Vec<_>) = ops
            .into_iter()
            .partition(|op| matches!(op, PendingOp::Send { .. }));
        for op in sends.into_iter().chain(recvs) {
            self.run(op)?;
        }
        Ok(())
    }

    fn send(
        &self,
        buffer: &DeviceBuffer,
        bytes: Range<usize>,
        peer: usize,
        stream: Stream,
    ) -> Result<()> {
        self.check_peer(peer)?;
        Self::check_range(buffer, &bytes)?;
        self.trace.push(TraceEvent::Send {
            peer,
            bytes: bytes.clone(),
            stream: stream.kind,
        });
        self.issue(PendingOp::Send {
            buffer: buffer.clone(),
            bytes,
            peer,
        })
    }

    fn recv(
        &self,
        buffer: &DeviceBuffer,
        bytes: Range<usize>,
        peer: usize,
        stream: Stream,
    ) -> Result<()> {
        self.check_peer(peer)?;
        Self::check_range(buffer, &bytes)?;
        self.trace.push(TraceEvent::Recv {
            peer,
            bytes: bytes.clone(),
            stream: stream.kind,
        });
        self.issue(PendingOp::Recv {
            buffer: buffer.clone(),
            bytes,
            peer,
        })
    }

    fn broadcast(&self, buffer: &DeviceBuffer, root: usize, _stream: Stream) -> Result<()> {
        self.check_peer(root)?;
        self.trace.push(TraceEvent::Broadcast { root });
        let whole = 0..buffer.nbytes();
        if self.rank == root {
            for peer in (0..self.group.world_size).filter(|&p| p != root) {
                self.post(buffer, whole.clone(), peer)?;
            }
            Ok(())
        } else {
            self.deliver(buffer, whole, root)
        }
    }

    fn all_reduce_sum(&self, buffer: &DeviceBuffer, _stream: Stream) -> Result<()> {
        self.trace.push(TraceEvent::AllReduce);
        let own = buffer.host_bytes()?;
        for peer in (0..self.group.world_size).filter(|&p| p != self.rank) {
            self.group.mailbox(self.rank, peer).post(own.clone());
        }

        // Rank order keeps floating-point sums identical on every participant.
        let mut sum: Option<Tensor> = None;
        for peer in 0..self.group.world_size {
            let bytes = if peer == self.rank {
                own.clone()
            } else {
                self.take(peer)?
            };
            let part = DeviceBuffer::host_from_bytes(
                self.device,
                buffer.dtype(),
                buffer.shape(),
                bytes,
            )?
            .to_tensor()?;
            sum = Some(match sum {
                Some(acc) => acc.add(&part)?,
                None => part,
            });
        }
        if let Some(sum) = sum {
            let reduced = DeviceBuffer::from_tensor(&sum, self.device)?.host_bytes()?;
            buffer.with_host_bytes_mut(|b| b.copy_from_slice(&reduced))?;
        }
        Ok(())
    }
}
