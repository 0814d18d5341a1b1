//! Server external client-facing API module.
//!
//! A client acceptor task admits TCP connections and spawns one servant
//! task per client. Servants decode the client wire (a command type byte
//! followed by a fixed-shape payload) and post the requests, bundled with
//! the connection's shared write handle, onto bounded inbound channels that
//! the consensus layer drains. Replies are written bare (no type byte) back
//! on the same connection, serialized by the per-connection mutex inside
//! the shared write handle.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::server::messages::{
    Propose, ProposeAndRead, ProposeReply, ProposeReplyTS, Read, WireMsg,
    CLIENT_PROPOSE, CLIENT_PROPOSE_AND_READ, CLIENT_READ,
};
use crate::server::ReplicaId;
use crate::utils::QuoralError;

use bytes::{Bytes, BytesMut};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// External client ID type, assigned in accept order.
pub type ClientId = u64;

/// Shared handle to one client connection's buffered write half. The mutex
/// is the per-connection reply lock: one reply is written and flushed at a
/// time, in whatever order the repliers acquire it.
pub type ClientWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// A client proposal, bundled with the handle for replying.
#[derive(Debug, Clone)]
pub struct ClientPropose {
    pub client: ClientId,
    pub msg: Propose,
    pub writer: ClientWriter,
}

/// A client read, bundled with the handle for replying.
#[derive(Debug, Clone)]
pub struct ClientRead {
    pub client: ClientId,
    pub msg: Read,
    pub writer: ClientWriter,
}

/// A client propose-and-read, bundled with the handle for replying.
#[derive(Debug, Clone)]
pub struct ClientProposeAndRead {
    pub client: ClientId,
    pub msg: ProposeAndRead,
    pub writer: ClientWriter,
}

/// The external client-facing API module.
pub(crate) struct ExternalApi {
    /// Receiver sides of the request channels.
    rx_propose: mpsc::Receiver<ClientPropose>,
    rx_read: mpsc::Receiver<ClientRead>,
    rx_propose_and_read: mpsc::Receiver<ClientProposeAndRead>,

    /// Receiver side of the client-connect notification channel.
    rx_client_conn: mpsc::UnboundedReceiver<ClientId>,

    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,

    /// Map from client ID -> servant task join handle, shared with the
    /// client acceptor task.
    client_servants: flashmap::ReadHandle<ClientId, JoinHandle<()>>,
}

impl ExternalApi {
    /// Creates a new external API module: binds the client listener and
    /// spawns the acceptor task. `chan_cap` bounds each request channel.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        api_addr: SocketAddr,
        chan_cap: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, QuoralError> {
        if chan_cap == 0 {
            return logged_err!("invalid request channel capacity 0");
        }

        let (tx_propose, rx_propose) = mpsc::channel(chan_cap);
        let (tx_read, rx_read) = mpsc::channel(chan_cap);
        let (tx_par, rx_propose_and_read) = mpsc::channel(chan_cap);
        let (tx_client_conn, rx_client_conn) = mpsc::unbounded_channel();

        let listener = TcpListener::bind(api_addr).await?;
        let (servants_write, servants_read) =
            flashmap::new::<ClientId, JoinHandle<()>>();

        let mut acceptor = ClientAcceptorTask {
            me,
            listener,
            next_client: 0,
            tx_propose,
            tx_read,
            tx_par,
            tx_client_conn,
            servants: servants_write,
            shutdown,
        };
        let client_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(ExternalApi {
            rx_propose,
            rx_read,
            rx_propose_and_read,
            rx_client_conn,
            _client_acceptor_handle: client_acceptor_handle,
            client_servants: servants_read,
        })
    }

    /// Waits for the next client proposal.
    pub(crate) async fn recv_propose(
        &mut self,
    ) -> Result<ClientPropose, QuoralError> {
        self.rx_propose
            .recv()
            .await
            .ok_or_else(|| QuoralError::msg("propose channel closed"))
    }

    /// Waits for the next client read.
    pub(crate) async fn recv_read(&mut self) -> Result<ClientRead, QuoralError> {
        self.rx_read
            .recv()
            .await
            .ok_or_else(|| QuoralError::msg("read channel closed"))
    }

    /// Waits for the next client propose-and-read.
    pub(crate) async fn recv_propose_and_read(
        &mut self,
    ) -> Result<ClientProposeAndRead, QuoralError> {
        self.rx_propose_and_read
            .recv()
            .await
            .ok_or_else(|| QuoralError::msg("propose-and-read channel closed"))
    }

    /// Waits for the next client-connect notification.
    pub(crate) async fn recv_client_conn(
        &mut self,
    ) -> Result<ClientId, QuoralError> {
        self.rx_client_conn
            .recv()
            .await
            .ok_or_else(|| QuoralError::msg("client-conn channel closed"))
    }

    /// Number of client connections accepted so far.
    pub(crate) fn client_count(&self) -> usize {
        self.client_servants.guard().len()
    }

    /// Writes a reply back on a client connection, holding its reply lock
    /// across the write and flush.
    pub(crate) async fn reply_client<M: WireMsg>(
        reply: &M,
        writer: &ClientWriter,
    ) -> Result<(), QuoralError> {
        let mut buf = BytesMut::with_capacity(M::WIRE_SIZE);
        reply.marshal(&mut buf);

        let mut w = writer.lock().await;
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }

    /// Replies to a Propose.
    pub(crate) async fn reply_propose(
        reply: &ProposeReply,
        propose: &ClientPropose,
    ) -> Result<(), QuoralError> {
        Self::reply_client(reply, &propose.writer).await
    }

    /// Replies to a Propose with the timestamped variant.
    pub(crate) async fn reply_propose_ts(
        reply: &ProposeReplyTS,
        propose: &ClientPropose,
    ) -> Result<(), QuoralError> {
        Self::reply_client(reply, &propose.writer).await
    }
}

/// Client acceptor task: admits connections, assigns client IDs, spawns
/// servant tasks.
struct ClientAcceptorTask {
    me: ReplicaId,
    listener: TcpListener,
    next_client: ClientId,

    tx_propose: mpsc::Sender<ClientPropose>,
    tx_read: mpsc::Sender<ClientRead>,
    tx_par: mpsc::Sender<ClientProposeAndRead>,
    tx_client_conn: mpsc::UnboundedSender<ClientId>,

    servants: flashmap::WriteHandle<ClientId, JoinHandle<()>>,
    shutdown: watch::Receiver<bool>,
}

impl ClientAcceptorTask {
    /// Accepts one client connection and spawns its servant task.
    fn accept_client(&mut self, stream: TcpStream) -> Result<(), QuoralError> {
        let client = self.next_client;
        self.next_client += 1;

        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let writer: ClientWriter =
            Arc::new(Mutex::new(BufWriter::new(write_half)));

        let mut servant = ClientServantTask {
            client,
            reader: BufReader::new(read_half),
            writer,
            tx_propose: self.tx_propose.clone(),
            tx_read: self.tx_read.clone(),
            tx_par: self.tx_par.clone(),
            shutdown: self.shutdown.clone(),
        };
        let handle = tokio::spawn(async move { servant.run().await });
        self.servants.guard().insert(client, handle);

        self.tx_client_conn
            .send(client)
            .map_err(|_| QuoralError::msg("client-conn channel closed"))?;
        pf_debug!("accepted client {}", client);
        Ok(())
    }

    /// Acceptor task loop.
    async fn run(&mut self) {
        pf_debug!("client_acceptor task spawned");

        let local_addr = self.listener.local_addr().unwrap();
        pf_info!("replica {} accepting clients on '{}'", self.me, local_addr);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            if let Err(e) = self.accept_client(stream) {
                                pf_error!("error accepting client: {}", e);
                            }
                        }
                        Err(e) => {
                            pf_warn!("error accepting client connection: {}", e);
                        }
                    }
                },
            }
        }

        pf_debug!("client_acceptor task exited");
    }
}

/// Per-client servant task: decodes the client's command stream and posts
/// requests inbound.
struct ClientServantTask {
    client: ClientId,
    reader: BufReader<OwnedReadHalf>,
    writer: ClientWriter,

    tx_propose: mpsc::Sender<ClientPropose>,
    tx_read: mpsc::Sender<ClientRead>,
    tx_par: mpsc::Sender<ClientProposeAndRead>,

    shutdown: watch::Receiver<bool>,
}

impl ClientServantTask {
    /// Reads exactly one payload of known size off the stream.
    async fn read_payload(&mut self, size: usize) -> Result<Bytes, QuoralError> {
        let mut buf = vec![0u8; size];
        self.reader.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Handles one client command given its already-read type code.
    async fn dispatch(&mut self, code: u8) -> Result<(), QuoralError> {
        match code {
            CLIENT_PROPOSE => {
                let mut payload = self.read_payload(Propose::WIRE_SIZE).await?;
                let msg = Propose::unmarshal(&mut payload)?;
                self.tx_propose
                    .send(ClientPropose {
                        client: self.client,
                        msg,
                        writer: self.writer.clone(),
                    })
                    .await
                    .map_err(|_| QuoralError::msg("propose channel closed"))?;
            }

            CLIENT_READ => {
                let mut payload = self.read_payload(Read::WIRE_SIZE).await?;
                let msg = Read::unmarshal(&mut payload)?;
                self.tx_read
                    .send(ClientRead {
                        client: self.client,
                        msg,
                        writer: self.writer.clone(),
                    })
                    .await
                    .map_err(|_| QuoralError::msg("read channel closed"))?;
            }

            CLIENT_PROPOSE_AND_READ => {
                let mut payload =
                    self.read_payload(ProposeAndRead::WIRE_SIZE).await?;
                let msg = ProposeAndRead::unmarshal(&mut payload)?;
                self.tx_par
                    .send(ClientProposeAndRead {
                        client: self.client,
                        msg,
                        writer: self.writer.clone(),
                    })
                    .await
                    .map_err(|_| {
                        QuoralError::msg("propose-and-read channel closed")
                    })?;
            }

            code => {
                pf_error!(
                    "received unknown command code {} from client {}",
                    code,
                    self.client
                );
            }
        }
        Ok(())
    }

    /// Servant task loop, shaped like the peer reader task's.
    async fn run(&mut self) {
        pf_debug!("servant task for client {} spawned", self.client);

        loop {
            let code = tokio::select! {
                _ = self.shutdown.changed() => break,
                code = self.reader.read_u8() => match code {
                    Ok(code) => code,
                    Err(_) => break, // client disconnected
                },
            };
            if let Err(e) = self.dispatch(code).await {
                pf_warn!(
                    "dropping command code {} from client {}: {}",
                    code,
                    self.client,
                    e
                );
            }
        }

        pf_debug!("servant task for client {} exited", self.client);
    }
}

#[cfg(test)]
mod external_tests {
    use super::*;
    use crate::server::messages::{Command, CommandOp};
    use bytes::BufMut;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_propose_reply() -> Result<(), QuoralError> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut api = ExternalApi::new_and_setup(
            0,
            "127.0.0.1:31880".parse()?,
            100,
            shutdown_rx,
        )
        .await?;

        // client side
        tokio::spawn(async move {
            let mut conn =
                TcpStream::connect("127.0.0.1:31880".parse::<SocketAddr>()?)
                    .await?;
            let propose = Propose {
                command_id: 7,
                command: Command {
                    op: CommandOp::Put,
                    key: 11,
                    value: 22,
                },
            };
            let mut buf = BytesMut::with_capacity(1 + Propose::WIRE_SIZE);
            buf.put_u8(CLIENT_PROPOSE);
            propose.marshal(&mut buf);
            conn.write_all(&buf).await?;

            let read = Read {
                command_id: 8,
                key: 11,
            };
            buf.clear();
            buf.put_u8(CLIENT_READ);
            read.marshal(&mut buf);
            conn.write_all(&buf).await?;

            // replies come back bare on the same connection
            let mut reply_buf = vec![0u8; ProposeReply::WIRE_SIZE];
            conn.read_exact(&mut reply_buf).await?;
            let mut bytes = Bytes::from(reply_buf);
            let reply = ProposeReply::unmarshal(&mut bytes)?;
            assert!(reply.ok);
            assert_eq!(reply.command_id, 7);
            Ok::<(), QuoralError>(())
        });

        // server side
        let client = api.recv_client_conn().await?;
        assert_eq!(client, 0);

        let propose = api.recv_propose().await?;
        assert_eq!(propose.client, 0);
        assert_eq!(propose.msg.command_id, 7);
        assert_eq!(propose.msg.command.op, CommandOp::Put);

        let read = api.recv_read().await?;
        assert_eq!(read.msg.key, 11);

        ExternalApi::reply_propose(
            &ProposeReply {
                ok: true,
                command_id: propose.msg.command_id,
            },
            &propose,
        )
        .await?;

        assert_eq!(api.client_count(), 1);
        Ok(())
    }
}
