//! Wire message shapes and their length-free binary codec.
//!
//! Every message on the peer mesh travels as a `(type: u8, payload)` record
//! where the payload is a dense little-endian encoding of fixed-shape
//! fields; there is no length prefix, so each message kind declares its
//! exact encoded size. The client-facing wire uses the same codec with its
//! own command type codes.

use crate::server::{AcceptedInst, LeaseInst, ReplicaId};
use crate::utils::QuoralError;

use bytes::{Buf, BufMut};

/// Peer-mesh message type codes 0 and 1 are reserved for beacons; all other
/// codes are assigned at RPC registration time.
pub(crate) const PEER_BEACON: u8 = 0;
pub(crate) const PEER_BEACON_REPLY: u8 = 1;
pub(crate) const FIRST_RPC_CODE: u8 = 2;

/// Client wire command type codes.
pub(crate) const CLIENT_PROPOSE: u8 = 0;
pub(crate) const CLIENT_READ: u8 = 1;
pub(crate) const CLIENT_PROPOSE_AND_READ: u8 = 2;

/// A fixed-shape message that can be marshalled onto / unmarshalled off of
/// a wire buffer. Registered RPC types implement this; the associated size
/// is what lets the stream stay length-free.
pub trait WireMsg: Sized + Send + 'static {
    /// Exact encoded payload size in bytes.
    const WIRE_SIZE: usize;

    /// Appends the encoded payload to `buf`.
    fn marshal<B: BufMut>(&self, buf: &mut B);

    /// Decodes one payload from the front of `buf`.
    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self, QuoralError>;
}

#[inline]
fn check_remaining(buf: &impl Buf, need: usize) -> Result<(), QuoralError> {
    if buf.remaining() < need {
        return Err(QuoralError(format!(
            "short payload: {} bytes < {} needed",
            buf.remaining(),
            need
        )));
    }
    Ok(())
}

#[inline]
fn put_replica_id(buf: &mut impl BufMut, id: ReplicaId) {
    buf.put_i32_le(id as i32);
}

#[inline]
fn get_replica_id(buf: &mut impl Buf) -> Result<ReplicaId, QuoralError> {
    let id = buf.get_i32_le();
    ReplicaId::try_from(id)
        .map_err(|_| QuoralError(format!("replica id {} out of range", id)))
}

/// Opens a window during which the receiver will accept the sender's
/// upcoming Promise without a fresh handshake.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Guard {
    pub replica_id: ReplicaId,
    pub timestamp_ns: i64,
    pub guard_duration_ns: i64,
}

impl WireMsg for Guard {
    const WIRE_SIZE: usize = 20;

    fn marshal<B: BufMut>(&self, buf: &mut B) {
        put_replica_id(buf, self.replica_id);
        buf.put_i64_le(self.timestamp_ns);
        buf.put_i64_le(self.guard_duration_ns);
    }

    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self, QuoralError> {
        check_remaining(buf, Self::WIRE_SIZE)?;
        Ok(Guard {
            replica_id: get_replica_id(buf)?,
            timestamp_ns: buf.get_i64_le(),
            guard_duration_ns: buf.get_i64_le(),
        })
    }
}

/// Acknowledges a Guard, echoing the initiator's timestamp.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GuardReply {
    pub replica_id: ReplicaId,
    pub timestamp_ns: i64,
}

impl WireMsg for GuardReply {
    const WIRE_SIZE: usize = 12;

    fn marshal<B: BufMut>(&self, buf: &mut B) {
        put_replica_id(buf, self.replica_id);
        buf.put_i64_le(self.timestamp_ns);
    }

    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self, QuoralError> {
        check_remaining(buf, Self::WIRE_SIZE)?;
        Ok(GuardReply {
            replica_id: get_replica_id(buf)?,
            timestamp_ns: buf.get_i64_le(),
        })
    }
}

/// The lease grant itself: until `duration_ns` from receipt, the sender
/// will not serve a local read that could contradict consensus up to
/// `latest_accepted_instance`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Promise {
    pub replica_id: ReplicaId,
    pub lease_instance: LeaseInst,
    pub timestamp_ns: i64,
    pub duration_ns: i64,
    pub latest_accepted_instance: AcceptedInst,
}

impl WireMsg for Promise {
    const WIRE_SIZE: usize = 28;

    fn marshal<B: BufMut>(&self, buf: &mut B) {
        put_replica_id(buf, self.replica_id);
        buf.put_i32_le(self.lease_instance);
        buf.put_i64_le(self.timestamp_ns);
        buf.put_i64_le(self.duration_ns);
        buf.put_i32_le(self.latest_accepted_instance);
    }

    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self, QuoralError> {
        check_remaining(buf, Self::WIRE_SIZE)?;
        Ok(Promise {
            replica_id: get_replica_id(buf)?,
            lease_instance: buf.get_i32_le(),
            timestamp_ns: buf.get_i64_le(),
            duration_ns: buf.get_i64_le(),
            latest_accepted_instance: buf.get_i32_le(),
        })
    }
}

/// Accepts a Promise (echoing the grantee's instance) or rejects it
/// (carrying a strictly higher instance).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PromiseReply {
    pub replica_id: ReplicaId,
    pub lease_instance: LeaseInst,
    pub timestamp_ns: i64,
}

impl WireMsg for PromiseReply {
    const WIRE_SIZE: usize = 16;

    fn marshal<B: BufMut>(&self, buf: &mut B) {
        put_replica_id(buf, self.replica_id);
        buf.put_i32_le(self.lease_instance);
        buf.put_i64_le(self.timestamp_ns);
    }

    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self, QuoralError> {
        check_remaining(buf, Self::WIRE_SIZE)?;
        Ok(PromiseReply {
            replica_id: get_replica_id(buf)?,
            lease_instance: buf.get_i32_le(),
            timestamp_ns: buf.get_i64_le(),
        })
    }
}

/// Round-trip probe carrying a cycle-counter reading.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Beacon {
    pub timestamp: u64,
}

impl WireMsg for Beacon {
    const WIRE_SIZE: usize = 8;

    fn marshal<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.timestamp);
    }

    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self, QuoralError> {
        check_remaining(buf, Self::WIRE_SIZE)?;
        Ok(Beacon {
            timestamp: buf.get_u64_le(),
        })
    }
}

/// Echo of a Beacon's timestamp.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BeaconReply {
    pub timestamp: u64,
}

impl WireMsg for BeaconReply {
    const WIRE_SIZE: usize = 8;

    fn marshal<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.timestamp);
    }

    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self, QuoralError> {
        check_remaining(buf, Self::WIRE_SIZE)?;
        Ok(BeaconReply {
            timestamp: buf.get_u64_le(),
        })
    }
}

/// State machine command opcode.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CommandOp {
    NoOp = 0,
    Put = 1,
    Get = 2,
}

/// State machine command in its dense wire shape. The key-value store that
/// interprets it lives above this crate.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Command {
    pub op: CommandOp,
    pub key: i64,
    pub value: i64,
}

impl WireMsg for Command {
    const WIRE_SIZE: usize = 17;

    fn marshal<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.op as u8);
        buf.put_i64_le(self.key);
        buf.put_i64_le(self.value);
    }

    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self, QuoralError> {
        check_remaining(buf, Self::WIRE_SIZE)?;
        let op = match buf.get_u8() {
            0 => CommandOp::NoOp,
            1 => CommandOp::Put,
            2 => CommandOp::Get,
            op => {
                return Err(QuoralError(format!("unknown command op {}", op)))
            }
        };
        Ok(Command {
            op,
            key: buf.get_i64_le(),
            value: buf.get_i64_le(),
        })
    }
}

/// Client proposal of a command to be replicated.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Propose {
    pub command_id: i32,
    pub command: Command,
}

impl WireMsg for Propose {
    const WIRE_SIZE: usize = 4 + Command::WIRE_SIZE;

    fn marshal<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.command_id);
        self.command.marshal(buf);
    }

    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self, QuoralError> {
        check_remaining(buf, Self::WIRE_SIZE)?;
        Ok(Propose {
            command_id: buf.get_i32_le(),
            command: Command::unmarshal(buf)?,
        })
    }
}

/// Client read of a single key.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Read {
    pub command_id: i32,
    pub key: i64,
}

impl WireMsg for Read {
    const WIRE_SIZE: usize = 12;

    fn marshal<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.command_id);
        buf.put_i64_le(self.key);
    }

    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self, QuoralError> {
        check_remaining(buf, Self::WIRE_SIZE)?;
        Ok(Read {
            command_id: buf.get_i32_le(),
            key: buf.get_i64_le(),
        })
    }
}

/// Client proposal bundled with a read of a (possibly different) key.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProposeAndRead {
    pub command_id: i32,
    pub command: Command,
    pub key: i64,
}

impl WireMsg for ProposeAndRead {
    const WIRE_SIZE: usize = 4 + Command::WIRE_SIZE + 8;

    fn marshal<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.command_id);
        self.command.marshal(buf);
        buf.put_i64_le(self.key);
    }

    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self, QuoralError> {
        check_remaining(buf, Self::WIRE_SIZE)?;
        Ok(ProposeAndRead {
            command_id: buf.get_i32_le(),
            command: Command::unmarshal(buf)?,
            key: buf.get_i64_le(),
        })
    }
}

/// Reply to a Propose. Written bare (no type byte) back on the client's
/// connection.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProposeReply {
    pub ok: bool,
    pub command_id: i32,
}

impl WireMsg for ProposeReply {
    const WIRE_SIZE: usize = 5;

    fn marshal<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.ok as u8);
        buf.put_i32_le(self.command_id);
    }

    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self, QuoralError> {
        check_remaining(buf, Self::WIRE_SIZE)?;
        Ok(ProposeReply {
            ok: buf.get_u8() != 0,
            command_id: buf.get_i32_le(),
        })
    }
}

/// Timestamped reply variant carrying the executed value.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProposeReplyTS {
    pub ok: bool,
    pub command_id: i32,
    pub value: i64,
    pub timestamp_ns: i64,
}

impl WireMsg for ProposeReplyTS {
    const WIRE_SIZE: usize = 21;

    fn marshal<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.ok as u8);
        buf.put_i32_le(self.command_id);
        buf.put_i64_le(self.value);
        buf.put_i64_le(self.timestamp_ns);
    }

    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self, QuoralError> {
        check_remaining(buf, Self::WIRE_SIZE)?;
        Ok(ProposeReplyTS {
            ok: buf.get_u8() != 0,
            command_id: buf.get_i32_le(),
            value: buf.get_i64_le(),
            timestamp_ns: buf.get_i64_le(),
        })
    }
}
