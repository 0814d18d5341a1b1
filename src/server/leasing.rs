//! Quorum lease state machine: per-replica bookkeeping for the Guard /
//! Promise / PromiseReply protocol, and the two gate values the consensus
//! layer queries.
//!
//! Naming convention: the lease *grantor* is a replica that forgoes serving
//! local reads (and delays write commits) while the lease holds; the
//! *grantee* is the replica that may serve local reads for the duration. A
//! replica is simultaneously grantee to some peers and grantor to others.
//!
//! All handlers here are pure state transitions that return the message(s)
//! to send, so that a single consensus task can own the `Lease` value and no
//! lease-internal locking is ever needed. The async wrappers that stamp the
//! clock and actually send live on `Replica`.

use crate::server::messages::{Guard, GuardReply, Promise, PromiseReply};
use crate::server::ReplicaId;
use crate::utils::PeerSet;

/// Monotonically increasing lease instance number; a higher instance at
/// either party voids all grants made under lower ones.
pub type LeaseInst = i32;

/// Consensus instance number reported by the layer above ("latest accepted"
/// by this replica); carried inside Promises, never interpreted here.
pub type AcceptedInst = i32;

/// Inbound lease protocol events drained by the consensus task.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LeaseEvent {
    Guard(Guard),
    GuardReply(GuardReply),
    Promise(Promise),
    PromiseReply(PromiseReply),
}

/// Per-replica quorum lease object. Created once at startup and mutated
/// only by the lease handlers below; leases are always reacquired from
/// scratch after a restart, so none of this state is persisted.
#[derive(Debug, Clone)]
pub struct Lease {
    /// My replica ID.
    me: ReplicaId,

    /// Total number of replicas in the cluster.
    population: u8,

    /// Nominal lease length in nanoseconds.
    duration_ns: i64,

    /// Guard window length in nanoseconds.
    guard_duration_ns: i64,

    /// The instance I am currently granting to others. Never decreases.
    promised_by_me_inst: LeaseInst,

    /// The highest instance anyone has granted to me. Never decreases.
    promised_to_me_inst: LeaseInst,

    /// Stamp of the last Guard/Promise round I initiated; replies carrying
    /// an older stamp are dropped as stale.
    latest_ts_sent: i64,

    /// Per peer: absolute time until which I will accept that peer's
    /// Promise without a fresh Guard round.
    guard_expires: Vec<i64>,

    /// Per peer: absolute time until which that peer has promised *me*
    /// read authority.
    latest_promises_received: Vec<i64>,

    /// Per peer: absolute time until which *I* believe that peer knows not
    /// to serve local reads.
    latest_replies_received: Vec<i64>,

    /// Per peer: when its last accepted PromiseReply arrived.
    last_reply_received: Vec<i64>,

    /// Horizon up to which this replica may answer reads without a round
    /// trip.
    read_locally_until: i64,

    /// Horizon past which a write may be committed externally.
    write_in_quorum_until: i64,

    /// Number of peers that rejected my current Promise instance.
    promise_rejects: u8,
}

impl Lease {
    /// Creates a fresh lease object with all horizons at zero (in the past).
    pub(crate) fn new(
        me: ReplicaId,
        population: u8,
        duration_ns: i64,
        guard_duration_ns: i64,
    ) -> Self {
        assert!(population >= 2 && me < population);
        Lease {
            me,
            population,
            duration_ns,
            guard_duration_ns,
            promised_by_me_inst: 0,
            promised_to_me_inst: 0,
            latest_ts_sent: 0,
            guard_expires: vec![0; population as usize],
            latest_promises_received: vec![0; population as usize],
            latest_replies_received: vec![0; population as usize],
            last_reply_received: vec![0; population as usize],
            read_locally_until: 0,
            write_in_quorum_until: 0,
            promise_rejects: 0,
        }
    }

    /// Horizon up to which this replica may answer reads locally.
    #[inline]
    pub fn read_locally_until(&self) -> i64 {
        self.read_locally_until
    }

    /// Horizon past which a write may be committed externally.
    #[inline]
    pub fn write_in_quorum_until(&self) -> i64 {
        self.write_in_quorum_until
    }

    /// The instance I am currently granting under.
    #[inline]
    pub fn promised_by_me_inst(&self) -> LeaseInst {
        self.promised_by_me_inst
    }

    /// The highest instance anyone has granted to me.
    #[inline]
    pub fn promised_to_me_inst(&self) -> LeaseInst {
        self.promised_to_me_inst
    }

    /// When the last accepted PromiseReply from `peer` arrived (0 if none).
    #[inline]
    pub fn last_reply_received(&self, peer: ReplicaId) -> i64 {
        self.last_reply_received[peer as usize]
    }

    /// Raises my grant instance (e.g., after learning a higher one from a
    /// rejection). Lower values are ignored; the instance never decreases.
    pub fn raise_instance(&mut self, inst: LeaseInst) {
        if inst > self.promised_by_me_inst {
            self.promised_by_me_inst = inst;
        }
    }

    /// Starts a fresh lease round as grantee: stamps `latest_ts_sent`,
    /// clears the reject counter, and returns the Guard to broadcast.
    pub(crate) fn establish(&mut self, now: i64) -> Guard {
        self.latest_ts_sent = now;
        self.promise_rejects = 0;
        Guard {
            replica_id: self.me,
            timestamp_ns: now,
            guard_duration_ns: self.guard_duration_ns,
        }
    }

    /// Renews the lease as grantee without a preceding Guard round,
    /// returning the Promise to broadcast to `alive` peers. Valid only
    /// while the previous round's promises have not expired at the
    /// grantors, which is exactly what their freshness check enforces.
    pub(crate) fn renew(
        &mut self,
        now: i64,
        alive: &PeerSet,
        latest_acc_inst: AcceptedInst,
    ) -> Promise {
        self.promise_rejects = 0;
        for peer in alive.ids() {
            if peer == self.me {
                continue;
            }
            self.latest_replies_received[peer as usize] += self.duration_ns;
        }
        self.latest_ts_sent = now;

        // extending the wait by one duration is sufficient: grantors must
        // receive the refresh before the previous lease expires, otherwise
        // they discount it
        self.write_in_quorum_until += self.duration_ns;

        Promise {
            replica_id: self.me,
            lease_instance: self.promised_by_me_inst,
            timestamp_ns: now,
            duration_ns: self.duration_ns,
            latest_accepted_instance: latest_acc_inst,
        }
    }

    /// Grantor side: a Guard opens the sender's window and is acknowledged
    /// unconditionally.
    pub(crate) fn handle_guard(&mut self, g: &Guard, now: i64) -> GuardReply {
        self.guard_expires[g.replica_id as usize] = now + g.guard_duration_ns;
        GuardReply {
            replica_id: self.me,
            timestamp_ns: g.timestamp_ns,
        }
    }

    /// Grantee side: a GuardReply triggers the Promise, unless it is stale.
    /// Also pessimistically lifts the write gate, since the grantor may
    /// hold the promise for up to a full guard-plus-lease window.
    pub(crate) fn handle_guard_reply(
        &mut self,
        gr: &GuardReply,
        now: i64,
        latest_acc_inst: AcceptedInst,
    ) -> Option<Promise> {
        if gr.timestamp_ns < self.latest_ts_sent {
            // old reply, must ignore
            return None;
        }

        let sender = gr.replica_id as usize;
        self.latest_replies_received[sender] =
            now + self.guard_duration_ns + self.duration_ns;
        if self.write_in_quorum_until < self.latest_replies_received[sender] {
            self.write_in_quorum_until = self.latest_replies_received[sender];
        }

        Some(Promise {
            replica_id: self.me,
            lease_instance: self.promised_by_me_inst,
            timestamp_ns: now,
            duration_ns: self.duration_ns,
            latest_accepted_instance: latest_acc_inst,
        })
    }

    /// Grantor side: records a Promise if it arrived in time, advancing the
    /// lease instance if needed, and recomputes the read horizon. Returns
    /// whether the grant was recorded, plus the PromiseReply to send (none
    /// when the promise is dropped outright).
    pub(crate) fn handle_promise(
        &mut self,
        p: &Promise,
        now: i64,
    ) -> (bool, Option<PromiseReply>) {
        let sender = p.replica_id as usize;

        // check that this promise was received on time: either an active
        // grant is being refreshed, or the sender's guard window is open
        if self.latest_promises_received[sender] < now
            && self.guard_expires[sender] < now
        {
            // TODO: send NACK as optimization
            return (false, None);
        }

        if p.lease_instance < self.promised_to_me_inst {
            // the sender must update its lease view
            return (
                false,
                Some(PromiseReply {
                    replica_id: self.me,
                    lease_instance: self.promised_to_me_inst,
                    timestamp_ns: p.timestamp_ns,
                }),
            );
        } else if p.lease_instance > self.promised_to_me_inst {
            self.promised_to_me_inst = p.lease_instance;
            for slot in self.latest_promises_received.iter_mut() {
                *slot = 0; // grants under the previous instance are void
            }
        }

        self.latest_promises_received[sender] = now + p.duration_ns;

        let reply = PromiseReply {
            replica_id: self.me,
            lease_instance: self.promised_to_me_inst,
            timestamp_ns: p.timestamp_ns,
        };

        self.recompute_read_horizon();

        (true, Some(reply))
    }

    /// Grantee side: consumes a PromiseReply. A reply carrying a higher
    /// instance is a rejection; once every replica's worth of rejections
    /// has been counted, no-one holds my lease anymore and the write gate
    /// drops to zero. Returns whether the reply was an acceptance.
    pub(crate) fn handle_promise_reply(
        &mut self,
        pr: &PromiseReply,
        now: i64,
    ) -> bool {
        if pr.timestamp_ns < self.latest_ts_sent {
            // old reply, ignore
            return false;
        }

        if pr.lease_instance > self.promised_by_me_inst {
            self.promise_rejects = self.promise_rejects.saturating_add(1);
            if self.promise_rejects == self.population {
                self.write_in_quorum_until = 0;
            }
            return false;
        }

        let sender = pr.replica_id as usize;
        let mut max = now;
        for i in 0..self.population as usize {
            if i == self.me as usize {
                continue;
            }
            if i == sender {
                self.latest_replies_received[i] = now + self.duration_ns;
            }
            if max < self.latest_replies_received[i] {
                max = self.latest_replies_received[i];
            }
        }
        self.write_in_quorum_until = max;

        self.last_reply_received[sender] = now;
        true
    }

    /// Recomputes `read_locally_until` from the received grants: copy into
    /// a scratch array, zero the self slot, sort ascending, and pick the
    /// entry at index `N - N/2` (integer division). The local replica
    /// counts toward the read quorum implicitly as the reader, which is why
    /// its slot is zeroed rather than excluded.
    fn recompute_read_horizon(&mut self) {
        let n = self.population as usize;
        let mut sorted = self.latest_promises_received.clone();
        sorted[self.me as usize] = 0;
        sorted.sort_unstable();
        self.read_locally_until = sorted[n - n / 2];
    }
}
