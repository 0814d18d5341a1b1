//! Server internal TCP transport: a symmetric peer mesh with typed RPC
//! multiplexing.
//!
//! Every pair of replicas shares exactly one TCP connection: at startup each
//! replica dials the peers with lower IDs (announcing its own ID as a `u32`
//! little-endian handshake) and accepts connections from peers with higher
//! IDs. One reader task per peer consumes the `(type: u8, payload)` record
//! stream and dispatches each record to the channel registered for its type
//! code; writes go through a per-peer mutex over a buffered writer and are
//! flushed per message.
//!
//! Failure semantics: a send error marks the peer not-alive (sticky; there
//! is no reconnect logic here) and returns the error to the caller. Inbound
//! read errors terminate that peer's reader task silently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::server::messages::{
    Beacon, BeaconReply, WireMsg, FIRST_RPC_CODE, PEER_BEACON,
    PEER_BEACON_REPLY,
};
use crate::server::ReplicaId;
use crate::utils::{clock, PeerSet, QuoralError};

use bytes::{BufMut, Bytes, BytesMut};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Monomorphized decoder: unmarshals one payload and posts it to the typed
/// channel registered for the code.
type DecodeFn =
    Box<dyn Fn(ReplicaId, Bytes) -> Result<(), QuoralError> + Send + Sync>;

struct RpcEntry {
    wire_size: usize,
    decode: DecodeFn,
}

/// Registry mapping 1-byte message type codes to typed inbound channels.
/// Codes 0 and 1 are reserved for Beacon/BeaconReply, which the reader
/// tasks handle directly.
struct RpcTable {
    next_code: u8,
    entries: HashMap<u8, RpcEntry>,
}

impl RpcTable {
    fn new() -> Self {
        RpcTable {
            next_code: FIRST_RPC_CODE,
            entries: HashMap::new(),
        }
    }

    fn register<M: WireMsg>(
        &mut self,
        tx: mpsc::UnboundedSender<(ReplicaId, M)>,
    ) -> Result<u8, QuoralError> {
        let code = self.next_code;
        if code == u8::MAX {
            return logged_err!("RPC code space exhausted");
        }
        self.next_code += 1;

        self.entries.insert(
            code,
            RpcEntry {
                wire_size: M::WIRE_SIZE,
                decode: Box::new(move |peer, mut payload| {
                    let msg = M::unmarshal(&mut payload)?;
                    tx.send((peer, msg))
                        .map_err(|_| QuoralError::msg("inbound channel closed"))
                }),
            },
        );
        Ok(code)
    }
}

/// Per-peer connection record. The mutex serializes all writes to this
/// peer, beacons included; `alive` flips false on the first send error and
/// stays false.
struct PeerConn {
    addr: SocketAddr,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    alive: AtomicBool,
}

/// Server internal TCP transport hub.
pub(crate) struct TransportHub {
    /// My replica ID.
    me: ReplicaId,

    /// Total number of replicas in the cluster.
    population: u8,

    /// TCP listener for inbound peer connections.
    listener: TcpListener,

    /// Frozen at `connect_to_peers()` time; shared with all reader tasks.
    rpc_table: Arc<RpcTable>,

    /// Peer connection records, indexed by replica ID (self slot unused).
    peers: Vec<Option<Arc<PeerConn>>>,

    /// Per-peer EWMA of beacon round-trip cycles, updated by reader tasks.
    ewmas: Arc<Vec<AtomicU64>>,

    /// Sender side of the inbound beacon channel.
    tx_beacon: mpsc::Sender<(ReplicaId, Beacon)>,

    /// Observed by all reader tasks; they stop at their next read when it
    /// flips true.
    shutdown: watch::Receiver<bool>,

    /// Join handles of the per-peer reader tasks.
    _reader_handles: Vec<JoinHandle<()>>,
}

impl TransportHub {
    /// Creates a new transport hub and binds its peer listener. Peer
    /// connections are established later by `connect_to_peers()`.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        population: u8,
        p2p_addr: SocketAddr,
        tx_beacon: mpsc::Sender<(ReplicaId, Beacon)>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, QuoralError> {
        if population < 2 || me >= population {
            return logged_err!(
                "invalid replica id {} / population {}",
                me,
                population
            );
        }

        let listener = TcpListener::bind(p2p_addr).await?;
        let ewmas = Arc::new(
            (0..population)
                .map(|_| AtomicU64::new(0f64.to_bits()))
                .collect::<Vec<_>>(),
        );

        Ok(TransportHub {
            me,
            population,
            listener,
            rpc_table: Arc::new(RpcTable::new()),
            peers: (0..population).map(|_| None).collect(),
            ewmas,
            tx_beacon,
            shutdown,
            _reader_handles: Vec::new(),
        })
    }

    /// Registers a message type with a typed inbound channel, returning the
    /// newly assigned 1-byte code. Must be called before `connect_to_peers()`;
    /// once reader tasks share the table it can no longer change.
    pub(crate) fn register_rpc<M: WireMsg>(
        &mut self,
        tx: mpsc::UnboundedSender<(ReplicaId, M)>,
    ) -> Result<u8, QuoralError> {
        match Arc::get_mut(&mut self.rpc_table) {
            Some(table) => table.register(tx),
            None => logged_err!("cannot register RPCs after peers connected"),
        }
    }

    /// Establishes the full peer mesh: dials every peer with a lower ID
    /// (announcing my ID) while accepting one connection from every peer
    /// with a higher ID. Returns once all `population - 1` connections are
    /// up and their reader tasks spawned.
    pub(crate) async fn connect_to_peers(
        &mut self,
        peer_addrs: &[SocketAddr],
    ) -> Result<(), QuoralError> {
        if peer_addrs.len() != self.population as usize {
            return logged_err!(
                "size of peer addrs {} != population {}",
                peer_addrs.len(),
                self.population
            );
        }

        let me = self.me;
        let accept_cnt = (self.population - me - 1) as usize;
        let listener = &self.listener;

        let accept_fut = async move {
            let mut conns = Vec::with_capacity(accept_cnt);
            while conns.len() < accept_cnt {
                let (mut stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let id = stream.read_u32_le().await?;
                let id = ReplicaId::try_from(id).map_err(|_| {
                    QuoralError(format!("invalid peer id {} handshaked", id))
                })?;
                conns.push((id, stream));
            }
            Ok::<_, QuoralError>(conns)
        };

        let dial_fut = async move {
            let mut conns = Vec::with_capacity(me as usize);
            for id in 0..me {
                let mut stream =
                    tcp_connect_with_retry(peer_addrs[id as usize], 30).await?;
                stream.set_nodelay(true)?;
                stream.write_u32_le(me as u32).await?;
                conns.push((id, stream));
            }
            Ok::<_, QuoralError>(conns)
        };

        let (accepted, dialed) = tokio::try_join!(accept_fut, dial_fut)?;
        for (id, stream) in accepted.into_iter().chain(dialed) {
            self.admit_peer(id, stream)?;
        }

        pf_info!(
            "replica {} connected to {} peers",
            self.me,
            self.population - 1
        );
        Ok(())
    }

    /// Records a newly established peer connection and spawns its reader
    /// task.
    fn admit_peer(
        &mut self,
        id: ReplicaId,
        stream: TcpStream,
    ) -> Result<(), QuoralError> {
        if id == self.me || id >= self.population {
            return logged_err!("invalid peer id {} to admit", id);
        }
        if self.peers[id as usize].is_some() {
            return logged_err!("duplicate connection with peer {}", id);
        }

        let addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        self.peers[id as usize] = Some(Arc::new(PeerConn {
            addr,
            writer: Mutex::new(BufWriter::new(write_half)),
            alive: AtomicBool::new(true),
        }));

        let mut reader = PeerReaderTask {
            peer: id,
            reader: BufReader::new(read_half),
            rpc_table: self.rpc_table.clone(),
            ewmas: self.ewmas.clone(),
            tx_beacon: self.tx_beacon.clone(),
            shutdown: self.shutdown.clone(),
        };
        self._reader_handles
            .push(tokio::spawn(async move { reader.run().await }));

        pf_debug!("peer {} '{}' connected", id, addr);
        Ok(())
    }

    /// Sends a message to a peer: the type code byte, then the marshalled
    /// payload, then a flush. Serialized per peer by the connection's write
    /// lock. A peer that was never connected is silently skipped; a peer
    /// marked not-alive, or a write failure (which marks it so), yields an
    /// error.
    pub(crate) async fn send_msg<M: WireMsg>(
        &self,
        code: u8,
        msg: &M,
        peer: ReplicaId,
    ) -> Result<(), QuoralError> {
        if peer == self.me || peer >= self.population {
            return logged_err!("invalid send target {}", peer);
        }
        let conn = match &self.peers[peer as usize] {
            Some(conn) => conn,
            None => return Ok(()),
        };
        if !conn.alive.load(Ordering::Acquire) {
            return Err(QuoralError(format!(
                "peer {} may not be alive",
                peer
            )));
        }

        let mut buf = BytesMut::with_capacity(1 + M::WIRE_SIZE);
        buf.put_u8(code);
        msg.marshal(&mut buf);

        let mut writer = conn.writer.lock().await;
        let res: Result<(), std::io::Error> = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = res {
            conn.alive.store(false, Ordering::Release);
            return logged_err!("send to peer {} '{}': {}", peer, conn.addr, e);
        }
        Ok(())
    }

    /// Broadcasts a message to all alive peers except self, or only to the
    /// members of `target` if given. Per-peer send failures are absorbed
    /// (the failing peer is already marked not-alive).
    pub(crate) async fn bcast_msg<M: WireMsg>(
        &self,
        code: u8,
        msg: &M,
        target: Option<&PeerSet>,
    ) -> Result<(), QuoralError> {
        for peer in 0..self.population {
            if peer == self.me {
                continue;
            }
            if let Some(target) = target {
                if !target.contains(peer) {
                    continue;
                }
            }
            if !self.peer_alive(peer) {
                continue;
            }
            if let Err(e) = self.send_msg(code, msg, peer).await {
                pf_debug!("bcast skipping peer {}: {}", peer, e);
            }
        }
        Ok(())
    }

    /// Sends a beacon probe stamped with the current cycle counter.
    pub(crate) async fn send_beacon(
        &self,
        peer: ReplicaId,
    ) -> Result<(), QuoralError> {
        let beacon = Beacon {
            timestamp: clock::cycles(),
        };
        self.send_msg(PEER_BEACON, &beacon, peer).await
    }

    /// Echoes a received beacon's timestamp back to its sender, through the
    /// same locked write path as every other message.
    pub(crate) async fn reply_beacon(
        &self,
        beacon: &Beacon,
        peer: ReplicaId,
    ) -> Result<(), QuoralError> {
        let reply = BeaconReply {
            timestamp: beacon.timestamp,
        };
        self.send_msg(PEER_BEACON_REPLY, &reply, peer).await
    }

    /// True if the peer is connected and not marked dead.
    pub(crate) fn peer_alive(&self, peer: ReplicaId) -> bool {
        self.peers
            .get(peer as usize)
            .and_then(|slot| slot.as_ref())
            .map(|conn| conn.alive.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Set of currently alive peers (self excluded).
    pub(crate) fn alive_peers(&self) -> PeerSet {
        let mut alive = PeerSet::empty(self.population);
        for peer in 0..self.population {
            if peer != self.me && self.peer_alive(peer) {
                alive.add(peer);
            }
        }
        alive
    }

    /// Current EWMA of beacon round-trip cycles to a peer.
    pub(crate) fn ewma(&self, peer: ReplicaId) -> f64 {
        f64::from_bits(self.ewmas[peer as usize].load(Ordering::Relaxed))
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides retrying logic,
/// for when the target replica has not bound its listener yet.
async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, QuoralError> {
    loop {
        match TcpStream::connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Per-peer reader task: consumes the framed record stream and dispatches
/// each record by its type code.
struct PeerReaderTask {
    peer: ReplicaId,
    reader: BufReader<OwnedReadHalf>,
    rpc_table: Arc<RpcTable>,
    ewmas: Arc<Vec<AtomicU64>>,
    tx_beacon: mpsc::Sender<(ReplicaId, Beacon)>,
    shutdown: watch::Receiver<bool>,
}

impl PeerReaderTask {
    /// Reads exactly one payload of known size off the stream.
    async fn read_payload(&mut self, size: usize) -> Result<Bytes, QuoralError> {
        let mut buf = vec![0u8; size];
        self.reader.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Handles one record given its already-read type code.
    async fn dispatch(&mut self, code: u8) -> Result<(), QuoralError> {
        match code {
            PEER_BEACON => {
                let mut payload = self.read_payload(Beacon::WIRE_SIZE).await?;
                let beacon = Beacon::unmarshal(&mut payload)?;
                // may block if the beacon channel is at capacity
                self.tx_beacon
                    .send((self.peer, beacon))
                    .await
                    .map_err(|_| QuoralError::msg("beacon channel closed"))?;
            }

            PEER_BEACON_REPLY => {
                let mut payload =
                    self.read_payload(BeaconReply::WIRE_SIZE).await?;
                let reply = BeaconReply::unmarshal(&mut payload)?;
                let sample =
                    clock::cycles().wrapping_sub(reply.timestamp) as f64;
                let slot = &self.ewmas[self.peer as usize];
                let prev = f64::from_bits(slot.load(Ordering::Relaxed));
                slot.store(
                    (0.99 * prev + 0.01 * sample).to_bits(),
                    Ordering::Relaxed,
                );
            }

            code => {
                let rpc_table = self.rpc_table.clone();
                match rpc_table.entries.get(&code) {
                    Some(entry) => {
                        let payload = self.read_payload(entry.wire_size).await?;
                        (entry.decode)(self.peer, payload)?;
                    }
                    None => {
                        pf_error!(
                            "received unknown message code {} <- {}",
                            code,
                            self.peer
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Reader task loop. Read errors terminate the task silently; the
    /// shutdown flag stops it at the next record boundary.
    async fn run(&mut self) {
        pf_debug!("reader task for peer {} spawned", self.peer);

        loop {
            let code = tokio::select! {
                _ = self.shutdown.changed() => break,
                code = self.reader.read_u8() => match code {
                    Ok(code) => code,
                    Err(_) => break,
                },
            };
            if let Err(e) = self.dispatch(code).await {
                pf_warn!(
                    "dropping record code {} <- {}: {}",
                    code,
                    self.peer,
                    e
                );
            }
        }

        pf_debug!("reader task for peer {} exited", self.peer);
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct TestMsg(u64);

    impl WireMsg for TestMsg {
        const WIRE_SIZE: usize = 8;

        fn marshal<B: BufMut>(&self, buf: &mut B) {
            buf.put_u64_le(self.0);
        }

        fn unmarshal<B: bytes::Buf>(buf: &mut B) -> Result<Self, QuoralError> {
            if buf.remaining() < 8 {
                return Err(QuoralError::msg("short test msg"));
            }
            Ok(TestMsg(buf.get_u64_le()))
        }
    }

    async fn test_hub(
        me: ReplicaId,
        population: u8,
        port: u16,
    ) -> Result<
        (
            TransportHub,
            mpsc::UnboundedReceiver<(ReplicaId, TestMsg)>,
            mpsc::Receiver<(ReplicaId, Beacon)>,
            u8,
            watch::Sender<bool>,
        ),
        QuoralError,
    > {
        let (tx_beacon, rx_beacon) = mpsc::channel(100);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut hub = TransportHub::new_and_setup(
            me,
            population,
            format!("127.0.0.1:{}", port).parse()?,
            tx_beacon,
            shutdown_rx,
        )
        .await?;
        let (tx_test, rx_test) = mpsc::unbounded_channel();
        let code = hub.register_rpc::<TestMsg>(tx_test)?;
        Ok((hub, rx_test, rx_beacon, code, shutdown_tx))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn mesh_send_recv() -> Result<(), QuoralError> {
        let addrs: Vec<SocketAddr> = vec![
            "127.0.0.1:31850".parse()?,
            "127.0.0.1:31851".parse()?,
            "127.0.0.1:31852".parse()?,
        ];
        let barrier = Arc::new(Barrier::new(3));

        for id in [1u8, 2u8] {
            let addrs = addrs.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                let (mut hub, mut rx, _rx_beacon, code, _sd) =
                    test_hub(id, 3, 31850 + id as u16).await?;
                barrier.wait().await;
                hub.connect_to_peers(&addrs).await?;
                // recv the broadcast from 0, then answer with my own id
                let (peer, msg) = rx.recv().await.unwrap();
                assert_eq!(peer, 0);
                assert_eq!(msg, TestMsg(7));
                hub.send_msg(code, &TestMsg(id as u64), 0).await?;
                // wait for the termination message
                let (peer, msg) = rx.recv().await.unwrap();
                assert_eq!(peer, 0);
                assert_eq!(msg, TestMsg(99));
                Ok::<(), QuoralError>(())
            });
        }

        let (mut hub, mut rx, _rx_beacon, code, _sd) =
            test_hub(0, 3, 31850).await?;
        barrier.wait().await;
        hub.connect_to_peers(&addrs).await?;
        assert!(hub.peer_alive(1) && hub.peer_alive(2));
        assert_eq!(hub.alive_peers(), PeerSet::of(3, [1, 2]));

        // broadcast to both peers, then hear back from each
        hub.bcast_msg(code, &TestMsg(7), None).await?;
        let mut heard = Vec::new();
        for _ in 0..2 {
            let (peer, msg) = rx.recv().await.unwrap();
            assert_eq!(msg, TestMsg(peer as u64));
            heard.push(peer);
        }
        heard.sort_unstable();
        assert_eq!(heard, vec![1, 2]);

        // terminate both peers
        hub.bcast_msg(code, &TestMsg(99), None).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn beacon_roundtrip_ewma() -> Result<(), QuoralError> {
        let addrs: Vec<SocketAddr> =
            vec!["127.0.0.1:31860".parse()?, "127.0.0.1:31861".parse()?];
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = barrier.clone();

        {
            let addrs = addrs.clone();
            tokio::spawn(async move {
                let (mut hub, _rx, mut rx_beacon, _code, _sd) =
                    test_hub(1, 2, 31861).await?;
                barrier1.wait().await;
                hub.connect_to_peers(&addrs).await?;
                // echo every beacon from 0
                let (peer, beacon) = rx_beacon.recv().await.unwrap();
                assert_eq!(peer, 0);
                hub.reply_beacon(&beacon, 0).await?;
                barrier1.wait().await;
                Ok::<(), QuoralError>(())
            });
        }

        let (mut hub, _rx, _rx_beacon, _code, _sd) =
            test_hub(0, 2, 31860).await?;
        barrier.wait().await;
        hub.connect_to_peers(&addrs).await?;
        assert_eq!(hub.ewma(1), 0.0);

        hub.send_beacon(1).await?;
        time::sleep(Duration::from_millis(100)).await;
        assert!(hub.ewma(1) > 0.0);
        barrier.wait().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_failure_marks_dead() -> Result<(), QuoralError> {
        let addrs: Vec<SocketAddr> =
            vec!["127.0.0.1:31870".parse()?, "127.0.0.1:31871".parse()?];
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = barrier.clone();

        {
            let addrs = addrs.clone();
            tokio::spawn(async move {
                let (mut hub, _rx, _rx_beacon, _code, sd) =
                    test_hub(1, 2, 31871).await?;
                barrier1.wait().await;
                hub.connect_to_peers(&addrs).await?;
                barrier1.wait().await;
                // shut down and drop all connection halves
                sd.send(true).map_err(QuoralError::msg)?;
                drop(hub);
                Ok::<(), QuoralError>(())
            });
        }

        let (mut hub, _rx, _rx_beacon, code, _sd) =
            test_hub(0, 2, 31870).await?;
        barrier.wait().await;
        hub.connect_to_peers(&addrs).await?;
        barrier.wait().await;

        // keep sending until the closed connection surfaces as an error
        let mut errored = false;
        for _ in 0..200 {
            if hub.send_msg(code, &TestMsg(0), 1).await.is_err() {
                errored = true;
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(errored);
        assert!(!hub.peer_alive(1));
        // marked dead is sticky: the next send fails immediately
        assert!(hub.send_msg(code, &TestMsg(0), 1).await.is_err());
        assert_eq!(hub.alive_peers(), PeerSet::empty(2));
        Ok(())
    }
}
