//! Async connection driver.
//!
//! A [`Connection`] owns the socket and one [`ServerSession`]. It feeds
//! inbound frames to the session, writes what the session queues, and
//! applies [`SessionCommand`]s sent by the session logic through a
//! [`SessionHandle`]. Everything for one client runs on one task, in
//! receipt order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::codec::RdpFrameCodec;
use crate::config::ServerContext;
use crate::error::{RdpError, Result};
use crate::events::{DisconnectReason, SessionEventSink, UpdateKind, errinfo};
use crate::rdp::Redirection;
use crate::session::{ServerSession, SessionOutcome};

/// Bound of the command queue between the session logic and a connection.
pub const COMMAND_QUEUE_DEPTH: usize = 100;

// ── Transport ────────────────────────────────────────────────────

/// Anything a connection can run over: TCP, TLS, an in-memory duplex.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Wraps the raw transport in TLS once X.224 selected SSL or HYBRID.
///
/// Certificate handling lives entirely in the implementation.
#[async_trait]
pub trait TlsUpgrade: Send + Sync {
    async fn upgrade(&self, stream: BoxedStream) -> std::io::Result<BoxedStream>;
}

// ── Commands ─────────────────────────────────────────────────────

/// Requests from the session logic to a running connection.
#[derive(Debug)]
pub enum SessionCommand {
    /// A pre-built update payload. Dropped while output is suppressed.
    Update { kind: UpdateKind, payload: Bytes },
    ChannelData { channel_id: u16, data: Bytes },
    OpenDynamicChannel {
        name: String,
        reply: oneshot::Sender<Result<u32>>,
    },
    DynamicChannelData { chan_id: u32, data: Bytes },
    CloseDynamicChannel { chan_id: u32 },
    /// Deactivate-reactivate at a new desktop size.
    Reactivate { width: u16, height: u16 },
    Redirect(Box<Redirection>),
    /// End the session with an `ERRINFO_*` code.
    Disconnect { error_info: u32 },
}

pub type CommandSender = mpsc::Sender<SessionCommand>;

/// Cloneable handle the session logic keeps for one connection.
///
/// Every method fails with [`RdpError::ChannelClosed`] once the
/// connection has ended.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: CommandSender,
}

impl SessionHandle {
    pub async fn send(&self, command: SessionCommand) -> Result<()> {
        Ok(self.tx.send(command).await?)
    }

    pub async fn send_update(&self, kind: UpdateKind, payload: Bytes) -> Result<()> {
        self.send(SessionCommand::Update { kind, payload }).await
    }

    pub async fn send_channel_data(&self, channel_id: u16, data: Bytes) -> Result<()> {
        self.send(SessionCommand::ChannelData { channel_id, data }).await
    }

    /// Ask the client to open a dynamic channel; resolves to the
    /// channel id once the request is on the wire.
    pub async fn open_dynamic_channel(&self, name: impl Into<String>) -> Result<u32> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::OpenDynamicChannel {
            name: name.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| RdpError::ChannelClosed)?
    }

    pub async fn send_dynamic_channel_data(&self, chan_id: u32, data: Bytes) -> Result<()> {
        self.send(SessionCommand::DynamicChannelData { chan_id, data }).await
    }

    pub async fn close_dynamic_channel(&self, chan_id: u32) -> Result<()> {
        self.send(SessionCommand::CloseDynamicChannel { chan_id }).await
    }

    pub async fn reactivate(&self, width: u16, height: u16) -> Result<()> {
        self.send(SessionCommand::Reactivate { width, height }).await
    }

    pub async fn redirect(&self, redirection: Redirection) -> Result<()> {
        self.send(SessionCommand::Redirect(Box::new(redirection))).await
    }

    pub async fn disconnect(&self, error_info: u32) -> Result<()> {
        self.send(SessionCommand::Disconnect { error_info }).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ── Connection ───────────────────────────────────────────────────

pub struct Connection {
    stream: BoxedStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    session: ServerSession,
    commands: mpsc::Receiver<SessionCommand>,
    connect_timeout: Option<Duration>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Build a connection and the handle the session logic uses to drive
    /// it.
    pub fn new<S>(
        stream: S,
        peer: SocketAddr,
        ctx: Arc<ServerContext>,
        sink: Box<dyn SessionEventSink>,
    ) -> (Self, SessionHandle)
    where
        S: AsyncStream + 'static,
    {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let session = ServerSession::new(Arc::clone(&ctx), sink);
        let conn = Self {
            stream: Box::new(stream),
            peer,
            ctx,
            session,
            commands: rx,
            connect_timeout: None,
        };
        (conn, SessionHandle { tx })
    }

    /// Disconnect with `ERRINFO_LOGON_TIMEOUT` if the session is not
    /// active within `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Run until either side ends the session.
    pub async fn run(self) -> Result<DisconnectReason> {
        let span = info_span!("rdp", peer = %self.peer);
        self.drive().instrument(span).await
    }

    async fn drive(self) -> Result<DisconnectReason> {
        let Self {
            stream,
            ctx,
            mut session,
            mut commands,
            connect_timeout,
            ..
        } = self;
        let mut framed = Framed::new(stream, RdpFrameCodec::new());
        let deadline = connect_timeout.map(|t| Instant::now() + t);
        let mut commands_open = true;
        info!("connection accepted");

        loop {
            let pending_deadline = deadline.filter(|_| !session.phase().is_active());
            let step = tokio::select! {
                frame = framed.next() => Step::Frame(frame),
                command = commands.recv(), if commands_open => Step::Command(command),
                _ = sleep_until(pending_deadline), if pending_deadline.is_some() => Step::Timeout,
            };

            match step {
                Step::Frame(None) => {
                    info!(phase = %session.phase(), "client closed the transport");
                    session.transport_closed();
                    return Ok(DisconnectReason::ClientRequested);
                }
                Step::Frame(Some(Err(e))) => {
                    warn!(error = %e, "transport error");
                    session.transport_failed();
                    return Err(e);
                }
                Step::Frame(Some(Ok(frame))) => {
                    let outcome = session.process_frame(&frame)?;
                    flush(&mut framed, &mut session).await?;
                    match outcome {
                        SessionOutcome::Continue => {}
                        SessionOutcome::UpgradeTransport => {
                            framed = upgrade(framed, &ctx).await.inspect_err(|_| session.transport_failed())?;
                            session.transport_upgraded()?;
                        }
                        SessionOutcome::Disconnect(reason) => {
                            info!(?reason, "session ended");
                            return Ok(reason);
                        }
                    }
                }
                Step::Command(None) => {
                    debug!("command channel closed");
                    commands_open = false;
                }
                Step::Command(Some(command)) => {
                    apply(&mut session, command);
                    flush(&mut framed, &mut session).await?;
                    if let Some(reason) = session.disconnect_reason() {
                        info!(?reason, "session ended");
                        return Ok(reason);
                    }
                }
                Step::Timeout => {
                    warn!(phase = %session.phase(), "connection sequence timed out");
                    session.disconnect(errinfo::LOGON_TIMEOUT)?;
                    flush(&mut framed, &mut session).await?;
                    return Ok(DisconnectReason::Server {
                        error_info: errinfo::LOGON_TIMEOUT,
                    });
                }
            }
        }
    }
}

/// What woke the connection up.
enum Step {
    Frame(Option<Result<Bytes>>),
    Command(Option<SessionCommand>),
    Timeout,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn flush(framed: &mut Framed<BoxedStream, RdpFrameCodec>, session: &mut ServerSession) -> Result<()> {
    if !session.has_outbound() {
        return Ok(());
    }
    for frame in session.take_outbound() {
        framed.feed(frame).await?;
    }
    framed.flush().await
}

async fn upgrade(
    framed: Framed<BoxedStream, RdpFrameCodec>,
    ctx: &ServerContext,
) -> Result<Framed<BoxedStream, RdpFrameCodec>> {
    let tls = ctx
        .tls
        .as_ref()
        .ok_or(RdpError::NegotiationMismatch("TLS selected without a TLS provider"))?;
    let parts = framed.into_parts();
    if !parts.read_buf.is_empty() {
        return Err(RdpError::ProtocolViolation("data buffered before the TLS upgrade"));
    }
    let stream = tls.upgrade(parts.io).await?;
    info!("transport upgraded to TLS");
    Ok(Framed::new(stream, parts.codec))
}

/// Apply one command. Failures are the caller's mistake, not the
/// client's, so they are logged and the connection continues.
fn apply(session: &mut ServerSession, command: SessionCommand) {
    let result = match command {
        SessionCommand::Update { kind, payload } => session.send_update(kind, &payload).map(|_| ()),
        SessionCommand::ChannelData { channel_id, data } => session.send_channel_data(channel_id, &data),
        SessionCommand::OpenDynamicChannel { name, reply } => {
            let _ = reply.send(session.open_dynamic_channel(&name));
            Ok(())
        }
        SessionCommand::DynamicChannelData { chan_id, data } => session.send_dynamic_channel_data(chan_id, &data),
        SessionCommand::CloseDynamicChannel { chan_id } => session.close_dynamic_channel(chan_id),
        SessionCommand::Reactivate { width, height } => session.reactivate(width, height),
        SessionCommand::Redirect(redirection) => session.redirect(&redirection),
        SessionCommand::Disconnect { error_info } => session.disconnect(error_info),
    };
    if let Err(e) = result {
        warn!(error = %e, "session command failed");
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::config::{CryptLevel, SecurityLayer, ServerConfig};
    use crate::events::NullSink;
    use crate::session::tests::connection_request;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    fn context(layer: SecurityLayer) -> Arc<ServerContext> {
        let config = ServerConfig {
            security_layer: layer,
            crypt_level: CryptLevel::None,
            ..ServerConfig::default()
        };
        ServerContext::new(config).into_shared()
    }

    struct Passthrough;

    #[async_trait]
    impl TlsUpgrade for Passthrough {
        async fn upgrade(&self, stream: BoxedStream) -> std::io::Result<BoxedStream> {
            Ok(stream)
        }
    }

    #[tokio::test]
    async fn eof_ends_the_connection() {
        let (client, server) = tokio::io::duplex(4096);
        let (conn, _tx) = Connection::new(server, peer(), context(SecurityLayer::Negotiate), Box::new(NullSink));
        drop(client);
        assert_eq!(conn.run().await.unwrap(), DisconnectReason::ClientRequested);
    }

    #[tokio::test]
    async fn negotiation_failure_is_written_before_close() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (conn, _tx) = Connection::new(server, peer(), context(SecurityLayer::Tls), Box::new(NullSink));
        let task = tokio::spawn(conn.run());

        client.write_all(&connection_request(0)).await.unwrap();
        let mut confirm = [0u8; 19];
        client.read_exact(&mut confirm).await.unwrap();
        assert_eq!(confirm[11], 0x03);
        assert_eq!(task.await.unwrap().unwrap(), DisconnectReason::NegotiationFailed);
    }

    #[tokio::test]
    async fn tls_upgrade_hands_over_the_stream() {
        let ctx = ServerContext {
            tls: Some(Arc::new(Passthrough)),
            ..(*context(SecurityLayer::Tls)).clone()
        }
        .into_shared();
        let (mut client, server) = tokio::io::duplex(4096);
        let (conn, tx) = Connection::new(server, peer(), ctx, Box::new(NullSink));
        let task = tokio::spawn(conn.run());

        client.write_all(&connection_request(0x1)).await.unwrap();
        let mut confirm = [0u8; 19];
        client.read_exact(&mut confirm).await.unwrap();
        assert_eq!(confirm[11], 0x02);
        assert_eq!(confirm[15], 0x01);

        // Still framed after the upgrade: a server disconnect before MCS
        // is established writes nothing and closes.
        tx.disconnect(1).await.unwrap();
        assert_eq!(
            task.await.unwrap().unwrap(),
            DisconnectReason::Server { error_info: 1 }
        );
    }

    #[tokio::test]
    async fn negotiation_over_scripted_io() {
        // Connection Request for PROTOCOL_RDP, Connection Confirm selecting it.
        let cr = connection_request(0);
        let cc = [3, 0, 0, 19, 14, 0xD0, 0, 0, 0x12, 0x34, 0, 0x02, 0x01, 8, 0, 0, 0, 0, 0];
        let io = tokio_test::io::Builder::new().read(&cr).write(&cc).build();
        let (conn, handle) = Connection::new(io, peer(), context(SecurityLayer::Negotiate), Box::new(NullSink));
        assert_eq!(conn.run().await.unwrap(), DisconnectReason::ClientRequested);
        assert!(handle.is_closed());
        assert!(matches!(handle.disconnect(1).await, Err(RdpError::ChannelClosed)));
    }

    #[tokio::test]
    async fn connect_timeout_disconnects() {
        let (_client, server) = tokio::io::duplex(4096);
        let (conn, _tx) = Connection::new(server, peer(), context(SecurityLayer::Negotiate), Box::new(NullSink));
        let conn = conn.with_connect_timeout(Duration::from_millis(20));
        assert_eq!(
            conn.run().await.unwrap(),
            DisconnectReason::Server {
                error_info: errinfo::LOGON_TIMEOUT
            }
        );
    }
}
