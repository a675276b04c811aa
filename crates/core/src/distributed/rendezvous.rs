//! Process coordination and out-of-band rendezvous id exchange.
//!
//! # Environment Variables
//!
//! - `RANK`: Global rank of this process (0..WORLD_SIZE)
//! - `WORLD_SIZE`: Total number of processes
//! - `LOCAL_RANK`: Device ordinal on this node (default: `RANK`)
//! - `MASTER_ADDR` / `MASTER_PORT`: where rank 0 serves the id (read through
//!   [`RuntimeConfig`])
//!
//! Rank 0 generates the id and serves it over TCP to the other
//! `WORLD_SIZE - 1` ranks; everyone gives up after the rendezvous timeout.
//! The wire format is a little-endian `u32` length followed by the id bytes.
//!
//! # Usage
//!
//! ```ignore
//! let dist = DistributedConfig::from_env(&runtime_config);
//! let id = exchange_id(&backend, &dist)?;
//! context.init_global(&id, dist.world_size, dist.rank)?;
//! ```

use std::env;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use super::error::{DistributedError, Result};
use super::transport::{CollectiveBackend, RendezvousId};
use crate::config::RuntimeConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Largest id accepted from the wire.
const MAX_ID_BYTES: usize = 4096;

/// Distributed configuration from environment.
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Global rank of this process.
    pub rank: usize,
    /// Total number of processes.
    pub world_size: usize,
    /// Device ordinal on this node.
    pub local_rank: usize,
    pub master_addr: String,
    pub master_port: u16,
    /// Bound on the whole rendezvous, id exchange included.
    pub timeout: Duration,
}

impl DistributedConfig {
    /// Read `RANK`, `WORLD_SIZE` and `LOCAL_RANK` from the environment,
    /// falling back to single-process defaults.
    pub fn from_env(runtime: &RuntimeConfig) -> Self {
        Self::from_lookup(|key| env::var(key).ok(), runtime)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, runtime: &RuntimeConfig) -> Self {
        let read = |key: &str| lookup(key).and_then(|s| s.trim().parse::<usize>().ok());
        let rank = read("RANK").unwrap_or(0);
        let world_size = read("WORLD_SIZE").unwrap_or(1);
        let local_rank = read("LOCAL_RANK").unwrap_or(rank);
        Self {
            rank,
            world_size,
            local_rank,
            master_addr: runtime.master_addr(),
            master_port: runtime.master_port(),
            timeout: runtime.rendezvous_timeout(),
        }
    }

    /// Configuration for single GPU execution.
    pub fn single_gpu() -> Self {
        Self::from_lookup(|_| None, &RuntimeConfig::default())
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// CUDA device for this rank.
    pub fn cuda_device(&self) -> usize {
        self.local_rank
    }
}

/// Rank 0 creates a fresh id with `backend` and serves it; every other rank
/// fetches it from rank 0.
pub fn exchange_id<B: CollectiveBackend>(
    backend: &B,
    config: &DistributedConfig,
) -> Result<RendezvousId> {
    if config.rank >= config.world_size {
        return Err(DistributedError::InvalidRank {
            rank: config.rank,
            world_size: config.world_size,
        });
    }
    if config.rank == 0 {
        let id = backend.unique_id()?;
        serve_id(&id, config)?;
        Ok(id)
    } else {
        fetch_id(config)
    }
}

fn timed_out(config: &DistributedConfig) -> DistributedError {
    DistributedError::RendezvousTimeout {
        timeout_ms: config.timeout.as_millis() as u64,
    }
}

fn io_error(context: &str, e: std::io::Error) -> DistributedError {
    DistributedError::Rendezvous(format!("{context}: {e}"))
}

/// Send `id` to each of the other `world_size - 1` ranks.
pub fn serve_id(id: &RendezvousId, config: &DistributedConfig) -> Result<()> {
    let expected = config.world_size.saturating_sub(1);
    if expected == 0 {
        return Ok(());
    }
    let addr = format!("0.0.0.0:{}", config.master_port);
    let listener = TcpListener::bind(&addr).map_err(|e| io_error(&format!("bind {addr}"), e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| io_error("set_nonblocking", e))?;
    tracing::debug!(port = config.master_port, expected, "serving rendezvous id");

    let len = u32::try_from(id.len())
        .map_err(|_| DistributedError::Rendezvous("rendezvous id too large".to_string()))?;
    let deadline = Instant::now() + config.timeout;
    let mut served = 0;
    while served < expected {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                tracing::trace!(peer = %peer, "sending rendezvous id");
                stream
                    .set_nonblocking(false)
                    .map_err(|e| io_error("set_nonblocking", e))?;
                stream
                    .write_all(&len.to_le_bytes())
                    .and_then(|()| stream.write_all(id.as_bytes()))
                    .map_err(|e| io_error("send rendezvous id", e))?;
                served += 1;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    tracing::warn!(served, expected, "rendezvous id server timed out");
                    return Err(timed_out(config));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(io_error("accept", e)),
        }
    }
    tracing::debug!(served, "all ranks received the rendezvous id");
    Ok(())
}

/// Connect to rank 0, retrying until the timeout, and read the id.
pub fn fetch_id(config: &DistributedConfig) -> Result<RendezvousId> {
    let addr = format!("{}:{}", config.master_addr, config.master_port);
    let deadline = Instant::now() + config.timeout;
    let mut attempt = 0u32;
    let mut stream = loop {
        match TcpStream::connect(&addr) {
            Ok(stream) => break stream,
            Err(e) => {
                if Instant::now() >= deadline {
                    tracing::warn!(addr = %addr, attempts = attempt, error = %e, "rendezvous connect timed out");
                    return Err(timed_out(config));
                }
                tracing::trace!(attempt, addr = %addr, error = %e, "retrying connection to rank 0");
                attempt += 1;
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    };

    let remaining = deadline
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
        .ok_or_else(|| timed_out(config))?;
    stream
        .set_read_timeout(Some(remaining))
        .map_err(|e| io_error("set_read_timeout", e))?;

    let read_err = |e: std::io::Error| match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => timed_out(config),
        _ => io_error("receive rendezvous id", e),
    };
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).map_err(read_err)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_ID_BYTES {
        return Err(DistributedError::Rendezvous(format!(
            "rendezvous id of {len} bytes exceeds {MAX_ID_BYTES}"
        )));
    }
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).map_err(read_err)?;
    tracing::trace!(addr = %addr, bytes = len, "received rendezvous id");
    Ok(RendezvousId(bytes))
}
