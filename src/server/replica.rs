//! Per-replica glue: construction of the functionality modules, the async
//! lease operation wrappers that stamp the clock and send, and the surface
//! the consensus layer above drives (inbound channels, gate values, beacon
//! probes, preferred peer ordering).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::server::external::{
    ClientId, ClientPropose, ClientProposeAndRead, ClientRead, ExternalApi,
};
use crate::server::leasing::{AcceptedInst, Lease, LeaseEvent, LeaseInst};
use crate::server::messages::{
    Beacon, Guard, GuardReply, Promise, PromiseReply, ProposeReply,
    ProposeReplyTS, WireMsg,
};
use crate::server::transport::TransportHub;
use crate::utils::{clock, PeerSet, QuoralError};

use serde::Deserialize;

use tokio::fs::File;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

/// Server replica ID type.
pub type ReplicaId = u8;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Nominal lease duration in millisecs.
    pub lease_duration_ms: u64,

    /// Guard window duration in millisecs.
    pub guard_duration_ms: u64,

    /// Interval between beacon probes to peers in millisecs.
    pub beacon_interval_ms: u64,

    /// Capacity of each inbound client request channel.
    pub chan_request_cap: usize,

    /// Capacity of the inbound beacon channel.
    pub chan_beacon_cap: usize,

    /// Directory under which the stable-store backing file is created.
    pub store_dir: String,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            lease_duration_ms: 50,
            guard_duration_ms: 10,
            beacon_interval_ms: 100,
            chan_request_cap: 500000,
            chan_beacon_cap: 500000,
            store_dir: "/tmp".into(),
        }
    }
}

impl ReplicaConfig {
    fn lease_duration_ns(&self) -> i64 {
        self.lease_duration_ms as i64 * 1_000_000
    }

    fn guard_duration_ns(&self) -> i64 {
        self.guard_duration_ms as i64 * 1_000_000
    }
}

/// A Quoral server replica: the quorum-lease core that the consensus layer
/// above owns and drives from a single task.
pub struct Replica {
    /// My replica ID.
    id: ReplicaId,

    /// Total number of replicas in the cluster.
    population: u8,

    /// Address of every replica's peer listener, indexed by replica ID.
    peer_addrs: Vec<SocketAddr>,

    config: ReplicaConfig,

    transport: TransportHub,
    external: ExternalApi,

    /// The quorum lease object, mutated only through the handlers below.
    lease: Lease,

    /// Peers in the preferred order of communication (self excluded).
    preferred_peer_order: Vec<ReplicaId>,

    /// Append-only stable store backing file. The lease core writes
    /// nothing to it; the consensus layer above may.
    stable_store: File,

    /// Receiver side of the inbound beacon channel.
    rx_beacon: mpsc::Receiver<(ReplicaId, Beacon)>,

    /// Receiver sides of the lease protocol channels.
    rx_guard: mpsc::UnboundedReceiver<(ReplicaId, Guard)>,
    rx_guard_reply: mpsc::UnboundedReceiver<(ReplicaId, GuardReply)>,
    rx_promise: mpsc::UnboundedReceiver<(ReplicaId, Promise)>,
    rx_promise_reply: mpsc::UnboundedReceiver<(ReplicaId, PromiseReply)>,

    /// Assigned RPC codes of the lease protocol messages.
    promise_rpc: u8,
    promise_reply_rpc: u8,
    guard_rpc: u8,
    guard_reply_rpc: u8,

    /// Flipping this to true stops all reader/acceptor/servant tasks at
    /// their next read.
    shutdown_tx: watch::Sender<bool>,
}

impl Replica {
    /// Creates a new replica and sets up its functionality modules: binds
    /// the peer and client listeners, creates the stable-store file (fatal
    /// on failure), and registers the lease protocol RPCs. Peer connections
    /// are established afterwards by `connect_to_peers()`.
    pub async fn new_and_setup(
        id: ReplicaId,
        peer_addrs: Vec<SocketAddr>,
        api_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, QuoralError> {
        let population = peer_addrs.len() as u8;
        if population < 2 {
            return logged_err!("invalid population {}", population);
        }
        if id >= population {
            return logged_err!("invalid replica id {} / {}", id, population);
        }
        let addrs_set: HashSet<&SocketAddr> = peer_addrs.iter().collect();
        if addrs_set.len() != peer_addrs.len() {
            return logged_err!("duplicate addr in peer addrs list");
        }

        let config = parsed_config!(config_str => ReplicaConfig;
                                    lease_duration_ms, guard_duration_ms,
                                    beacon_interval_ms, chan_request_cap,
                                    chan_beacon_cap, store_dir)?;
        if !(10..=10_000).contains(&config.lease_duration_ms) {
            return logged_err!(
                "invalid config.lease_duration_ms '{}'",
                config.lease_duration_ms
            );
        }
        if !(1..=10_000).contains(&config.guard_duration_ms) {
            return logged_err!(
                "invalid config.guard_duration_ms '{}'",
                config.guard_duration_ms
            );
        }
        if config.beacon_interval_ms == 0 {
            return logged_err!(
                "invalid config.beacon_interval_ms '{}'",
                config.beacon_interval_ms
            );
        }
        if config.chan_request_cap == 0 || config.chan_beacon_cap == 0 {
            return logged_err!("invalid zero channel capacity in config");
        }

        // stable-store creation failure is fatal at startup
        let store_path = stable_store_path(&config.store_dir, id);
        let stable_store = File::create(&store_path).await.map_err(|e| {
            QuoralError(format!(
                "creating stable store '{}': {}",
                store_path.display(),
                e
            ))
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx_beacon, rx_beacon) = mpsc::channel(config.chan_beacon_cap);

        let mut transport = TransportHub::new_and_setup(
            id,
            population,
            peer_addrs[id as usize],
            tx_beacon,
            shutdown_rx.clone(),
        )
        .await?;

        let (tx_promise, rx_promise) = mpsc::unbounded_channel();
        let promise_rpc = transport.register_rpc::<Promise>(tx_promise)?;
        let (tx_promise_reply, rx_promise_reply) = mpsc::unbounded_channel();
        let promise_reply_rpc =
            transport.register_rpc::<PromiseReply>(tx_promise_reply)?;
        let (tx_guard, rx_guard) = mpsc::unbounded_channel();
        let guard_rpc = transport.register_rpc::<Guard>(tx_guard)?;
        let (tx_guard_reply, rx_guard_reply) = mpsc::unbounded_channel();
        let guard_reply_rpc =
            transport.register_rpc::<GuardReply>(tx_guard_reply)?;

        let external = ExternalApi::new_and_setup(
            id,
            api_addr,
            config.chan_request_cap,
            shutdown_rx,
        )
        .await?;

        let lease = Lease::new(
            id,
            population,
            config.lease_duration_ns(),
            config.guard_duration_ns(),
        );

        // seed the preferred peer order as the ring walk starting after me
        let preferred_peer_order = (0..population - 1)
            .map(|i| ((id as u16 + 1 + i as u16) % population as u16) as u8)
            .collect();

        Ok(Replica {
            id,
            population,
            peer_addrs,
            config,
            transport,
            external,
            lease,
            preferred_peer_order,
            stable_store,
            rx_beacon,
            rx_guard,
            rx_guard_reply,
            rx_promise,
            rx_promise_reply,
            promise_rpc,
            promise_reply_rpc,
            guard_rpc,
            guard_reply_rpc,
            shutdown_tx,
        })
    }

    /// My replica ID.
    #[inline]
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Total number of replicas in the cluster.
    #[inline]
    pub fn population(&self) -> u8 {
        self.population
    }

    /// Establishes the full peer mesh. Returns once a connection with every
    /// peer is up.
    pub async fn connect_to_peers(&mut self) -> Result<(), QuoralError> {
        let addrs = self.peer_addrs.clone();
        self.transport.connect_to_peers(&addrs).await
    }

    /// Registers an additional message type (e.g., the consensus layer's
    /// own messages) with a typed inbound channel, returning its assigned
    /// code. Must be called before `connect_to_peers()`.
    pub fn register_rpc<M: WireMsg>(
        &mut self,
        tx: mpsc::UnboundedSender<(ReplicaId, M)>,
    ) -> Result<u8, QuoralError> {
        self.transport.register_rpc(tx)
    }

    /// Sends a registered message to a peer.
    pub async fn send_msg<M: WireMsg>(
        &self,
        code: u8,
        msg: &M,
        peer: ReplicaId,
    ) -> Result<(), QuoralError> {
        self.transport.send_msg(code, msg, peer).await
    }

    /// Broadcasts a registered message to all alive peers, or to `target`.
    pub async fn bcast_msg<M: WireMsg>(
        &self,
        code: u8,
        msg: &M,
        target: Option<&PeerSet>,
    ) -> Result<(), QuoralError> {
        self.transport.bcast_msg(code, msg, target).await
    }

    /// Read-only view of the lease bookkeeping.
    #[inline]
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Horizon up to which this replica may answer reads locally.
    #[inline]
    pub fn read_locally_until(&self) -> i64 {
        self.lease.read_locally_until()
    }

    /// Horizon past which a write may be committed externally.
    #[inline]
    pub fn write_in_quorum_until(&self) -> i64 {
        self.lease.write_in_quorum_until()
    }

    /// Raises the instance I grant leases under (e.g., after a rejection
    /// reported a higher one).
    pub fn raise_lease_instance(&mut self, inst: LeaseInst) {
        self.lease.raise_instance(inst);
    }

    /// Establishes (or re-establishes) my lease: broadcasts a fresh Guard
    /// round to all alive peers.
    pub async fn establish_lease(&mut self) -> Result<(), QuoralError> {
        let guard = self.lease.establish(clock::now_ns());
        pf_debug!("lease bcast Guard @ ts {}", guard.timestamp_ns);
        self.transport.bcast_msg(self.guard_rpc, &guard, None).await
    }

    /// Renews my lease without a preceding Guard round. Must be called
    /// before the previous promises expire at the grantors, or they will
    /// discount the refresh.
    pub async fn renew_lease(
        &mut self,
        latest_acc_inst: AcceptedInst,
    ) -> Result<(), QuoralError> {
        let alive = self.transport.alive_peers();
        let promise =
            self.lease.renew(clock::now_ns(), &alive, latest_acc_inst);
        pf_debug!("lease bcast renewal Promise @ ts {}", promise.timestamp_ns);
        self.transport
            .bcast_msg(self.promise_rpc, &promise, Some(&alive))
            .await
    }

    /// Waits for the next inbound lease protocol event.
    pub async fn next_lease_event(&mut self) -> Result<LeaseEvent, QuoralError> {
        let event = tokio::select! {
            m = self.rx_guard.recv() => {
                m.map(|(_, g)| LeaseEvent::Guard(g))
            },
            m = self.rx_guard_reply.recv() => {
                m.map(|(_, gr)| LeaseEvent::GuardReply(gr))
            },
            m = self.rx_promise.recv() => {
                m.map(|(_, p)| LeaseEvent::Promise(p))
            },
            m = self.rx_promise_reply.recv() => {
                m.map(|(_, pr)| LeaseEvent::PromiseReply(pr))
            },
        };
        event.ok_or_else(|| QuoralError::msg("lease channel closed"))
    }

    /// Runs the lease handler for one inbound event, sending whatever the
    /// protocol calls for. `latest_acc_inst` is carried inside any Promise
    /// this produces. Returns whether the event took effect (stale or
    /// out-of-window events are dropped and yield false). Send failures
    /// are absorbed into the peers' alive flags.
    pub async fn handle_lease_event(
        &mut self,
        event: LeaseEvent,
        latest_acc_inst: AcceptedInst,
    ) -> Result<bool, QuoralError> {
        match event {
            LeaseEvent::Guard(g) => {
                let reply = self.lease.handle_guard(&g, clock::now_ns());
                self.absorb_send(self.guard_reply_rpc, &reply, g.replica_id)
                    .await;
                Ok(true)
            }

            LeaseEvent::GuardReply(gr) => {
                match self.lease.handle_guard_reply(
                    &gr,
                    clock::now_ns(),
                    latest_acc_inst,
                ) {
                    Some(promise) => {
                        self.absorb_send(
                            self.promise_rpc,
                            &promise,
                            gr.replica_id,
                        )
                        .await;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }

            LeaseEvent::Promise(p) => {
                let (granted, reply) =
                    self.lease.handle_promise(&p, clock::now_ns());
                if let Some(reply) = reply {
                    self.absorb_send(
                        self.promise_reply_rpc,
                        &reply,
                        p.replica_id,
                    )
                    .await;
                }
                Ok(granted)
            }

            LeaseEvent::PromiseReply(pr) => {
                Ok(self.lease.handle_promise_reply(&pr, clock::now_ns()))
            }
        }
    }

    /// Sends absorbing any failure: a transient network error has already
    /// flipped the peer's alive flag, which is all the lease protocol needs.
    async fn absorb_send<M: WireMsg>(&self, code: u8, msg: &M, peer: ReplicaId) {
        if let Err(e) = self.transport.send_msg(code, msg, peer).await {
            pf_debug!("lease send -> {} absorbed: {}", peer, e);
        }
    }

    /// Waits for the next inbound beacon, to be answered by `reply_beacon`.
    pub async fn recv_beacon(
        &mut self,
    ) -> Result<(ReplicaId, Beacon), QuoralError> {
        self.rx_beacon
            .recv()
            .await
            .ok_or_else(|| QuoralError::msg("beacon channel closed"))
    }

    /// Echoes a received beacon back to its sender.
    pub async fn reply_beacon(
        &self,
        beacon: &Beacon,
        peer: ReplicaId,
    ) -> Result<(), QuoralError> {
        self.transport.reply_beacon(beacon, peer).await
    }

    /// Sends a beacon probe to a peer.
    pub async fn send_beacon(&self, peer: ReplicaId) -> Result<(), QuoralError> {
        self.transport.send_beacon(peer).await
    }

    /// Configured interval between beacon probes.
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.config.beacon_interval_ms)
    }

    /// Current EWMA of beacon round-trip cycles to a peer.
    pub fn ewma(&self, peer: ReplicaId) -> f64 {
        self.transport.ewma(peer)
    }

    /// True if the peer is connected and not marked dead.
    pub fn peer_alive(&self, peer: ReplicaId) -> bool {
        self.transport.peer_alive(peer)
    }

    /// Set of currently alive peers.
    pub fn alive_peers(&self) -> PeerSet {
        self.transport.alive_peers()
    }

    /// Peers in the current preferred order of communication.
    pub fn preferred_peer_order(&self) -> &[ReplicaId] {
        &self.preferred_peer_order
    }

    /// Reorders the preferred peer list so that members of `quorum` (self
    /// excluded) come first in their given order, followed by the remaining
    /// peers in their previous relative order.
    pub fn update_preferred_peer_order(&mut self, quorum: &[ReplicaId]) {
        let mut order = Vec::with_capacity(self.preferred_peer_order.len());
        for &peer in quorum {
            if peer != self.id && !order.contains(&peer) {
                order.push(peer);
            }
        }
        for &peer in &self.preferred_peer_order {
            if !order.contains(&peer) {
                order.push(peer);
            }
        }
        self.preferred_peer_order = order;
    }

    /// Waits for the next client proposal.
    pub async fn recv_propose(&mut self) -> Result<ClientPropose, QuoralError> {
        self.external.recv_propose().await
    }

    /// Waits for the next client read.
    pub async fn recv_read(&mut self) -> Result<ClientRead, QuoralError> {
        self.external.recv_read().await
    }

    /// Waits for the next client propose-and-read.
    pub async fn recv_propose_and_read(
        &mut self,
    ) -> Result<ClientProposeAndRead, QuoralError> {
        self.external.recv_propose_and_read().await
    }

    /// Waits for the next client-connect notification.
    pub async fn recv_client_conn(&mut self) -> Result<ClientId, QuoralError> {
        self.external.recv_client_conn().await
    }

    /// Number of client connections accepted so far.
    pub fn client_count(&self) -> usize {
        self.external.client_count()
    }

    /// Replies to a client proposal.
    pub async fn reply_propose(
        &self,
        reply: &ProposeReply,
        propose: &ClientPropose,
    ) -> Result<(), QuoralError> {
        ExternalApi::reply_propose(reply, propose).await
    }

    /// Replies to a client proposal with the timestamped variant.
    pub async fn reply_propose_ts(
        &self,
        reply: &ProposeReplyTS,
        propose: &ClientPropose,
    ) -> Result<(), QuoralError> {
        ExternalApi::reply_propose_ts(reply, propose).await
    }

    /// Mutable handle to the append-only stable store backing file.
    pub fn stable_store(&mut self) -> &mut File {
        &mut self.stable_store
    }

    /// Signals all reader, acceptor, and servant tasks to stop at their
    /// next read. In-flight sends complete or error naturally.
    pub fn shutdown(&mut self) -> Result<(), QuoralError> {
        self.shutdown_tx.send(true)?;
        Ok(())
    }
}

/// Path of a replica's stable-store backing file.
fn stable_store_path(store_dir: &str, id: ReplicaId) -> PathBuf {
    Path::new(store_dir).join(format!("stable-store-replica{}", id))
}

#[cfg(test)]
mod replica_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn test_config() -> String {
        // long windows so scheduling hiccups cannot expire anything mid-test
        "lease_duration_ms = 2000\n\
         guard_duration_ms = 2000\n\
         store_dir = '/tmp'"
            .into()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn preferred_order_update() -> Result<(), QuoralError> {
        let peer_addrs: Vec<SocketAddr> = (0..5)
            .map(|i| format!("127.0.0.1:{}", 31900 + i).parse().unwrap())
            .collect();
        let config = test_config();
        let mut replica = Replica::new_and_setup(
            0,
            peer_addrs,
            "127.0.0.1:31905".parse()?,
            Some(&config),
        )
        .await?;

        assert!(stable_store_path("/tmp", 0).exists());
        assert_eq!(replica.preferred_peer_order(), [1, 2, 3, 4]);

        replica.update_preferred_peer_order(&[0, 3, 1]);
        assert_eq!(replica.preferred_peer_order(), [3, 1, 2, 4]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn three_replica_establish() -> Result<(), QuoralError> {
        let peer_addrs: Vec<SocketAddr> = (0..3)
            .map(|i| format!("127.0.0.1:{}", 31910 + i).parse().unwrap())
            .collect();
        let barrier = Arc::new(Barrier::new(3));

        for id in [1u8, 2u8] {
            let peer_addrs = peer_addrs.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                let config = test_config();
                let mut replica = Replica::new_and_setup(
                    id,
                    peer_addrs,
                    format!("127.0.0.1:{}", 31930 + id as u16).parse()?,
                    Some(&config),
                )
                .await?;
                barrier.wait().await;
                replica.connect_to_peers().await?;
                barrier.wait().await;

                // grantor side: Guard from 0, then its Promise
                let event = replica.next_lease_event().await?;
                match &event {
                    LeaseEvent::Guard(g) => assert_eq!(g.replica_id, 0),
                    event => panic!("unexpected event {:?}", event),
                }
                assert!(replica.handle_lease_event(event, 0).await?);

                let event = replica.next_lease_event().await?;
                match &event {
                    LeaseEvent::Promise(p) => {
                        assert_eq!(p.replica_id, 0);
                        assert_eq!(p.lease_instance, 0);
                    }
                    event => panic!("unexpected event {:?}", event),
                }
                assert!(replica.handle_lease_event(event, 0).await?);

                // a single grantor's promise already yields a horizon that
                // the reader itself completes into a majority
                assert!(replica.read_locally_until() > clock::now_ns());
                assert_eq!(replica.lease().promised_to_me_inst(), 0);

                barrier.wait().await;
                Ok::<(), QuoralError>(())
            });
        }

        let config = test_config();
        let mut replica = Replica::new_and_setup(
            0,
            peer_addrs,
            "127.0.0.1:31930".parse()?,
            Some(&config),
        )
        .await?;
        barrier.wait().await;
        replica.connect_to_peers().await?;
        barrier.wait().await;

        let start = clock::now_ns();
        replica.establish_lease().await?;

        // expect a GuardReply and a PromiseReply from each grantor, in
        // whatever interleaving
        let mut guard_replies = 0;
        let mut promise_replies = 0;
        for _ in 0..4 {
            let event = replica.next_lease_event().await?;
            match &event {
                LeaseEvent::GuardReply(_) => guard_replies += 1,
                LeaseEvent::PromiseReply(pr) => {
                    assert_eq!(pr.lease_instance, 0);
                    promise_replies += 1;
                }
                event => panic!("unexpected event {:?}", event),
            }
            assert!(replica.handle_lease_event(event, 0).await?);
        }
        assert_eq!(guard_replies, 2);
        assert_eq!(promise_replies, 2);

        // both grantors have committed to hold back at least one full
        // lease duration from their reply times
        assert!(replica.write_in_quorum_until() >= start + 2_000_000_000);
        assert_eq!(replica.lease().promised_by_me_inst(), 0);
        assert!(replica.lease().last_reply_received(1) > 0);
        assert!(replica.lease().last_reply_received(2) > 0);

        barrier.wait().await;
        Ok(())
    }
}
