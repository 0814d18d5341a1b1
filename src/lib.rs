//! Public interface to the Quoral core library, linked by the consensus
//! layer above it and by server executables.
//!
//! Quoral implements the quorum-lease layer of a replicated state-machine
//! system: a time-bounded distributed agreement on who may serve local
//! linearizable reads, the symmetric TCP peer mesh it runs over, and the
//! two gate values (`read_locally_until`, `write_in_quorum_until`) that the
//! consensus core queries before answering reads locally or committing
//! writes externally.

#[macro_use]
pub mod utils;

pub mod server;

pub use server::{Replica, ReplicaConfig, ReplicaId};
pub use utils::QuoralError;
