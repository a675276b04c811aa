//! Collective communication for expert-parallel exchange.
//!
//! - [`Transport`] / [`CollectiveBackend`]: one participant's handle into a
//!   group, and the factory that forms groups from a rendezvous id
//! - [`Communicator`]: batched variable-size all-to-all and all-gather,
//!   broadcast and allreduce on top of a transport
//! - [`EventPool`]: per-split event slots handing buffers between the compute
//!   and communication streams
//!
//! # Backends
//!
//! - NCCL ([`nccl::NcclBackend`]) on the CUDA platform
//! - An in-process network ([`sim::SimBackend`]) that runs every participant
//!   as a thread and records each operation in a
//!   [`CallTrace`](crate::runtime::CallTrace)
//!
//! # Usage
//!
//! ```ignore
//! use expertlink_core::distributed::{exchange_id, DistributedConfig};
//!
//! let dist = DistributedConfig::from_env(&config);
//! let id = exchange_id(&backend, &dist)?;
//! let transport = backend.connect(&id, dist.world_size, dist.rank, dist.cuda_device(), dist.timeout)?;
//! ```

mod communicator;
mod error;
mod events;
pub mod nccl;
mod rendezvous;
pub mod sim;
mod transport;

pub use communicator::{Communicator, CommunicatorState};
pub use error::{DistributedError, Result};
pub use events::{EventPool, SlotState};
pub use nccl::{is_nccl_available, NcclBackend, NcclTransport};
pub use rendezvous::{exchange_id, fetch_id, serve_id, DistributedConfig};
pub use sim::{SimBackend, SimNetwork, SimTransport};
pub use transport::{CollectiveBackend, RendezvousId, Transport};

pub(crate) use transport::span;
