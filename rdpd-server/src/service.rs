//! Listener service core logic.
//!
//! Accepts RDP clients, runs one [`Connection`] per socket and keeps a
//! handle per live session so shutdown can disconnect them
//! politely.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdpd_core::events::errinfo;
use rdpd_core::{
    ClientInfo, Connection, DisconnectReason, InputEvent, Rect, ServerContext, SessionEventSink, SessionHandle,
};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;

// ── LoggingSink ──────────────────────────────────────────────────

/// Session events surfaced as structured log lines. Stands in for the
/// window manager when the daemon runs on its own.
#[derive(Debug)]
pub struct LoggingSink {
    session_id: u64,
}

impl LoggingSink {
    pub fn new(session_id: u64) -> Self {
        Self { session_id }
    }
}

impl SessionEventSink for LoggingSink {
    fn on_logon(&mut self, info: &ClientInfo) {
        info!(
            session = self.session_id,
            user = %info.logon.username,
            domain = %info.logon.domain,
            build = info.client_build,
            "client logged on"
        );
    }

    fn on_session_ready(&mut self, info: &ClientInfo) {
        info!(
            session = self.session_id,
            width = info.width,
            height = info.height,
            bpp = info.bpp,
            monitors = info.monitors.len(),
            "session active"
        );
    }

    fn on_input(&mut self, event: InputEvent) {
        debug!(session = self.session_id, ?event, "input");
    }

    fn on_channel_data(&mut self, channel_id: u16, _flags: u32, data: &[u8], total_len: u32) {
        debug!(session = self.session_id, channel_id, len = data.len(), total_len, "channel message");
    }

    fn on_drdynvc_ready(&mut self) {
        debug!(session = self.session_id, "dynamic channels ready");
    }

    fn on_dynamic_channel_open(&mut self, name: &str, chan_id: u32, success: bool) {
        info!(session = self.session_id, name, chan_id, success, "dynamic channel open");
    }

    fn on_suppress_output(&mut self, suppress: bool, rect: Option<Rect>) {
        debug!(session = self.session_id, suppress, ?rect, "suppress output");
    }

    fn on_disconnect(&mut self, reason: DisconnectReason) {
        info!(session = self.session_id, ?reason, "session closed");
    }
}

// ── RdpService ───────────────────────────────────────────────────

type SessionTable = Arc<Mutex<HashMap<u64, SessionHandle>>>;

/// The top-level listener service.
pub struct RdpService {
    config: DaemonConfig,
    ctx: Arc<ServerContext>,
    running: Arc<AtomicBool>,
    sessions: SessionTable,
    next_id: AtomicU64,
}

impl RdpService {
    /// Create a service; fails when the key configuration is unusable.
    ///
    /// The service counts as running from here until stopped, so a stop
    /// issued before [`serve`](Self::serve) starts is not lost.
    pub fn new(config: DaemonConfig) -> Result<Self, rdpd_core::RdpError> {
        let ctx = config.to_context()?.into_shared();
        Ok(Self {
            config,
            ctx,
            running: Arc::new(AtomicBool::new(true)),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Bind the configured address and serve until stopped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        info!("RDP listener on {}", listener.local_addr()?);
        let permits = Arc::new(Semaphore::new(self.config.network.max_connections.max(1)));

        while self.running.load(Ordering::SeqCst) {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = Self::wait_for_stop(&self.running) => break,
            };
            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };
            let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                warn!(%peer, "connection limit reached; refusing client");
                continue;
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, "set_nodelay failed: {e}");
            }
            self.spawn_session(stream, peer, permit);
        }

        self.shutdown_sessions().await;
        self.running.store(false, Ordering::SeqCst);
        info!("RDP listener stopped");
        Ok(())
    }

    fn spawn_session(
        &self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (conn, commands) = Connection::new(stream, peer, Arc::clone(&self.ctx), Box::new(LoggingSink::new(id)));
        let conn = conn.with_connect_timeout(Duration::from_secs(self.config.network.connect_timeout_secs));
        if let Ok(mut table) = self.sessions.lock() {
            table.insert(id, commands);
        }

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            match conn.run().await {
                Ok(reason) => debug!(session = id, ?reason, "connection finished"),
                Err(e) => error!(session = id, "connection failed: {e}"),
            }
            if let Ok(mut table) = sessions.lock() {
                table.remove(&id);
            }
            drop(permit);
        });
    }

    /// Ask every live session to disconnect.
    async fn shutdown_sessions(&self) {
        let handles: Vec<(u64, SessionHandle)> = match self.sessions.lock() {
            Ok(table) => table.iter().map(|(id, h)| (*id, h.clone())).collect(),
            Err(_) => return,
        };
        for (id, handle) in handles {
            if let Err(e) = handle.disconnect(errinfo::RPC_INITIATED_DISCONNECT).await {
                debug!(session = id, "disconnect not delivered: {e}");
            }
        }
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of connections currently being served.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|t| t.len()).unwrap_or(0)
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Async helper: resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use rdpd_core::CryptLevel;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn plain_config() -> DaemonConfig {
        let mut cfg = DaemonConfig::default();
        cfg.rdp.crypt_level = CryptLevel::None;
        cfg
    }

    #[test]
    fn service_creates_with_plain_config() {
        let svc = RdpService::new(plain_config()).unwrap();
        assert!(svc.is_running());
        assert_eq!(svc.session_count(), 0);
    }

    #[test]
    fn service_refuses_encryption_without_keys() {
        assert!(RdpService::new(DaemonConfig::default()).is_err());
    }

    #[test]
    fn stop_handle_works() {
        let svc = RdpService::new(plain_config()).unwrap();
        let handle = svc.stop_handle();
        assert!(svc.is_running());
        handle.store(false, Ordering::SeqCst);
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn stop_before_serve_is_kept() {
        let svc = RdpService::new(plain_config()).unwrap();
        svc.stop_handle().store(false, Ordering::SeqCst);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), svc.serve(listener))
            .await
            .expect("serve ignored an earlier stop")
            .unwrap();
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn serves_a_negotiation() {
        let svc = Arc::new(RdpService::new(plain_config()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.serve(listener).await.map_err(|e| e.to_string()) }
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        // Connection Request offering standard RDP security only.
        client
            .write_all(&[3, 0, 0, 19, 14, 0xE0, 0, 0, 0, 0, 0, 1, 0, 8, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut confirm = [0u8; 19];
        client.read_exact(&mut confirm).await.unwrap();
        assert_eq!(confirm[5], 0xD0);
        assert_eq!(confirm[11], 0x02);

        svc.stop();
        server.await.unwrap().unwrap();
    }
}
