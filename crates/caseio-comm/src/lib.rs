//! caseio Comm - Rank-to-rank collectives
//!
//! This crate lets one rank perform I/O on behalf of all others:
//! - `Transport`: reliable ordered point-to-point messages (plus an
//!   in-process implementation for threads of one process)
//! - `CommunicationTree`: linear or fan-out relay schedules as a pure
//!   function of rank count, rank and root
//! - `Communicator`: broadcast, gather and agreement over that schedule
//!
//! # Example
//! ```
//! use caseio_comm::{Communicator, LocalTransport};
//! use caseio_common::{Rank, config::CommConfig};
//!
//! let mut ranks = LocalTransport::mesh(1);
//! let comm = Communicator::new(ranks.remove(0), &CommConfig::default());
//! let copy = comm.broadcast(Some("header".into()), Rank::MASTER).unwrap();
//! assert_eq!(copy, "header");
//! ```

pub mod collective;
pub mod frame;
pub mod transport;
pub mod tree;

pub use collective::Communicator;
pub use frame::{Collective, Frame, FrameKind};
pub use transport::{LocalTransport, Transport, TransportStats};
pub use tree::{CommunicationTree, Topology};
