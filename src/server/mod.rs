//! Quoral's server-side functionality modules.

mod external;
mod leasing;
mod messages;
mod replica;
mod transport;

pub use external::{
    ClientId, ClientPropose, ClientProposeAndRead, ClientRead, ClientWriter,
};
pub use leasing::{AcceptedInst, Lease, LeaseEvent, LeaseInst};
pub use messages::{
    Beacon, BeaconReply, Command, CommandOp, Guard, GuardReply, Promise,
    PromiseReply, Propose, ProposeAndRead, ProposeReply, ProposeReplyTS, Read,
    WireMsg,
};
pub use replica::{Replica, ReplicaConfig, ReplicaId};

pub(crate) use external::ExternalApi;
pub(crate) use transport::TransportHub;
