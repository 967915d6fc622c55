//! TCP transport linking one rank to the rendezvous hub, and the group
//! communicators built on top of it.

use std::collections::HashMap;
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::communicator::{DeviceCommunicator, ReduceOp};
use super::error::{DistributedError, Result};
use super::process_group::ProcessGroup;
use super::wire::{CollectiveKind, Frame};

const CONNECT_RETRIES: usize = 300;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One rank's connection to the hub.
///
/// Collectives are blocking and issued one at a time: the stream mutex is
/// held from request to response. Sequence numbers are tracked per group so
/// that every member tags its n-th collective on a group identically.
pub struct TcpTransport {
    rank: usize,
    world_size: usize,
    local_rank: usize,
    stream: Mutex<TcpStream>,
    sequences: Mutex<HashMap<Vec<usize>, u64>>,
    timeout: Duration,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Connect to the hub at `addr`, retrying while it comes up, and block
    /// until every rank has joined.
    pub fn connect(
        addr: &str,
        rank: usize,
        world_size: usize,
        local_rank: usize,
        timeout: Duration,
    ) -> Result<Self> {
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }

        let mut stream = connect_with_retry(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;

        Frame::Hello {
            rank: rank as u32,
            world_size: world_size as u32,
        }
        .write_to(&mut stream)?;

        match Frame::read_from(&mut stream).map_err(|e| map_io(e, timeout))? {
            Frame::Ready => {}
            Frame::Error { message } => return Err(DistributedError::Protocol(message)),
            other => {
                return Err(DistributedError::Protocol(format!(
                    "expected Ready from hub, got {other:?}"
                )))
            }
        }

        tracing::debug!(rank, world_size, addr, "joined rendezvous");

        Ok(Self {
            rank,
            world_size,
            local_rank,
            stream: Mutex::new(stream),
            sequences: Mutex::new(HashMap::new()),
            timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    /// Run one collective over `group` (global ranks, group order).
    pub fn collective(
        &self,
        group: &[usize],
        kind: CollectiveKind,
        payload: Vec<f32>,
    ) -> Result<Vec<f32>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DistributedError::Protocol(format!(
                "rank {} already left the session",
                self.rank
            )));
        }
        let seq = {
            let mut sequences = self
                .sequences
                .lock()
                .map_err(|_| DistributedError::Protocol("sequence table poisoned".to_string()))?;
            let next = sequences.entry(group.to_vec()).or_insert(0);
            let seq = *next;
            *next += 1;
            seq
        };

        let mut stream = self
            .stream
            .lock()
            .map_err(|_| DistributedError::Protocol("transport stream poisoned".to_string()))?;

        Frame::Request {
            seq,
            kind,
            group: group.iter().map(|&r| r as u32).collect(),
            payload,
        }
        .write_to(&mut *stream)?;

        match Frame::read_from(&mut *stream).map_err(|e| map_io(e, self.timeout))? {
            Frame::Response { payload } => Ok(payload),
            Frame::Error { message } => Err(DistributedError::CollectiveFailed(message)),
            other => Err(DistributedError::Protocol(format!(
                "expected Response for collective {seq}, got {other:?}"
            ))),
        }
    }

    /// Tell the hub this rank is done. Later collectives fail; calling it
    /// again is a no-op.
    pub fn leave(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| DistributedError::Protocol("transport stream poisoned".to_string()))?;
        Frame::Goodbye.write_to(&mut *stream)?;
        tracing::debug!(rank = self.rank, "left rendezvous");
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Err(e) = self.leave() {
            tracing::debug!(rank = self.rank, error = %e, "goodbye not delivered");
        }
    }
}

fn connect_with_retry(addr: &str) -> Result<TcpStream> {
    for attempt in 0..CONNECT_RETRIES {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt + 1 < CONNECT_RETRIES => {
                tracing::trace!(attempt, addr, error = %e, "retrying connection to rendezvous");
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
            Err(e) => {
                return Err(DistributedError::Protocol(format!(
                    "failed to connect to {addr} after {CONNECT_RETRIES} attempts: {e}"
                )))
            }
        }
    }
    Err(DistributedError::Protocol(format!(
        "failed to connect to {addr}"
    )))
}

fn map_io(e: io::Error, timeout: Duration) -> DistributedError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => DistributedError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        _ => DistributedError::Io(e),
    }
}

/// Communicator over a subset of global ranks sharing one transport.
///
/// Single-member groups never touch the network.
pub struct GroupCommunicator {
    transport: Arc<TcpTransport>,
    ranks: Vec<usize>,
    group_rank: usize,
}

impl GroupCommunicator {
    /// `ranks` are global ranks in group order and must contain this rank.
    pub fn new(transport: Arc<TcpTransport>, ranks: Vec<usize>) -> Result<Self> {
        let group_rank = ranks
            .iter()
            .position(|&r| r == transport.rank())
            .ok_or(DistributedError::InvalidRank {
                rank: transport.rank(),
                world_size: ranks.len(),
            })?;
        Ok(Self {
            transport,
            ranks,
            group_rank,
        })
    }
}

impl ProcessGroup for GroupCommunicator {
    fn rank(&self) -> usize {
        self.group_rank
    }

    fn world_size(&self) -> usize {
        self.ranks.len()
    }

    fn local_rank(&self) -> usize {
        self.transport.local_rank()
    }
}

impl DeviceCommunicator for GroupCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        self
    }

    fn all_reduce_host(&self, data: Vec<f32>, op: ReduceOp) -> Result<Vec<f32>> {
        if self.is_single() {
            return Ok(op.reduce(&[&data]));
        }
        self.transport
            .collective(&self.ranks, CollectiveKind::AllReduce(op), data)
    }

    fn all_to_all_host(&self, data: Vec<f32>) -> Result<Vec<f32>> {
        let n = self.ranks.len();
        if data.len() % n != 0 {
            return Err(DistributedError::ShapeMismatch {
                expected: vec![n * (data.len() / n + 1)],
                actual: vec![data.len()],
            });
        }
        if n == 1 {
            return Ok(data);
        }
        self.transport
            .collective(&self.ranks, CollectiveKind::AllToAll, data)
    }

    fn barrier(&self) -> Result<()> {
        if self.is_single() {
            return Ok(());
        }
        self.transport
            .collective(&self.ranks, CollectiveKind::Barrier, Vec::new())
            .map(|_| ())
    }
}
