//! Persistent connection manager.
//!
//! Owns the connection state machine and the three concurrent paths on an
//! open connection: the writer loop (sole writer of the transport), the
//! heartbeat loop (enqueues pings and watches for unanswered ones), and the
//! reader task (decodes inbound frames and routes them). Reconnection is
//! single-flight with capped exponential backoff.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use wl_auth::SessionManager;
use wl_core::config::ConnectionConfig;
use wl_core::error::{WlError, WlResult};
use wl_wire::frame::{self, Frame, FrameTag};
use wl_wire::payload;
use wl_wire::registry::{CallbackCategory, CallbackRegistry};

use crate::transport::{OpenRequest, Transport, TransportEvent, TransportSink, TransportStream};

/// Poll interval for the writer loop when the queue is idle.
const WRITER_POLL: Duration = Duration::from_millis(250);

/// Check cadence of the heartbeat loop.
const HEARTBEAT_TICK: Duration = Duration::from_secs(1);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to connect.
    Disconnected,
    /// Opening the transport and handshaking.
    Connecting,
    /// Connected; loops are running.
    Connected,
    /// Connection lost, reconnect in progress.
    Reconnecting,
    /// Shutting down on request.
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persistent connection manager.
///
/// All state transitions happen here; loops and callers observe them through
/// the watch channel or the status callbacks.
pub struct ConnectionManager {
    config: ConnectionConfig,
    session: Arc<SessionManager>,
    registry: Arc<CallbackRegistry>,
    transport: Arc<dyn Transport>,

    state: Mutex<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    /// Serializes connect attempts so concurrent connects collapse into one.
    connect_lock: Mutex<()>,

    outbound: Mutex<VecDeque<Frame>>,
    outbound_notify: Notify,

    shutdown: AtomicBool,
    shutdown_notify: Notify,

    /// Single-flight token for the reconnect task.
    reconnecting: AtomicBool,
    /// Pings sent since the last pong.
    missed_pongs: AtomicU32,

    /// Write half of the open transport. Only the writer loop writes frames;
    /// disconnect takes it to close.
    sink: Mutex<Option<Box<dyn TransportSink>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a new manager. No connection is opened until [`connect`] or
    /// the first [`send`].
    ///
    /// [`connect`]: ConnectionManager::connect
    /// [`send`]: ConnectionManager::send
    pub fn new(
        config: ConnectionConfig,
        session: Arc<SessionManager>,
        registry: Arc<CallbackRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            session,
            registry,
            transport,
            state: Mutex::new(ConnectionState::Disconnected),
            state_tx,
            connect_lock: Mutex::new(()),
            outbound: Mutex::new(VecDeque::new()),
            outbound_notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            reconnecting: AtomicBool::new(false),
            missed_pongs: AtomicU32::new(0),
            sink: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// Subscribe to state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The callback registry routing inbound frames.
    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    async fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.lock().await;
        if *state != new_state {
            info!("connection state: {} -> {}", *state, new_state);
            *state = new_state;
            let _ = self.state_tx.send(new_state);
            self.registry.dispatch(
                CallbackCategory::Status,
                new_state.as_str(),
                serde_json::json!({ "state": new_state.as_str() }),
            );
        }
    }

    /// Open the connection.
    ///
    /// No-op when already connected. Ensures a valid session, opens the
    /// transport with a bounded number of attempts, and starts the writer,
    /// heartbeat, and reader paths. On exhaustion the state returns to
    /// Disconnected and a connection error is surfaced.
    pub async fn connect(self: &Arc<Self>) -> WlResult<()> {
        self.shutdown.store(false, Ordering::SeqCst);
        self.connect_inner().await
    }

    async fn connect_inner(self: &Arc<Self>) -> WlResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.state().await == ConnectionState::Connected {
            debug!("already connected");
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting).await;

        let attempts = self.config.max_retries.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = connect_retry_delay(attempt);
                warn!(
                    "connect attempt {}/{attempts} failed, retrying in {:.0?}",
                    attempt, delay
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = self.shutdown_notify.notified() => {
                        self.set_state(ConnectionState::Disconnected).await;
                        return Err(WlError::Connection("connect cancelled".into()));
                    }
                }
            }

            match self.connect_once().await {
                Ok(()) => return Ok(()),
                // Credential problems will not heal by retrying.
                Err(e @ (WlError::Authentication(_) | WlError::BadParam(_))) => {
                    self.set_state(ConnectionState::Disconnected).await;
                    return Err(e);
                }
                Err(e) => last_err = Some(e),
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
        Err(last_err
            .unwrap_or_else(|| WlError::Connection("connection attempts exhausted".into())))
    }

    /// One full connection attempt: session, transport, loops.
    async fn connect_once(self: &Arc<Self>) -> WlResult<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(WlError::Connection("connect cancelled".into()));
        }
        self.session.refresh_session().await?;
        let session = self
            .session
            .session()
            .await
            .ok_or_else(|| WlError::Authentication("login produced no session".into()))?;

        let server = self.session.chat_server().await;
        let request = OpenRequest {
            url: format!("wss://{server}/ws"),
            headers: vec![
                ("User-Agent".into(), self.config.user_agent.clone()),
                ("Origin".into(), format!("https://{server}")),
                ("X-Waveline-Session".into(), session.session_id.clone()),
                ("X-Waveline-Client".into(), self.session.client_id().to_string()),
            ],
        };

        let (sink, stream) = match timeout(
            self.config.connect_timeout(),
            self.transport.open(&request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(WlError::Timeout(format!(
                    "handshake with {server} timed out"
                )))
            }
        };

        // A disconnect may have raced the handshake; do not come up Connected
        // after shutdown was requested.
        if self.shutdown.load(Ordering::SeqCst) {
            let mut sink = sink;
            let _ = sink.close().await;
            return Err(WlError::Connection("connect cancelled".into()));
        }

        *self.sink.lock().await = Some(sink);
        self.missed_pongs.store(0, Ordering::SeqCst);

        // The init announcement goes out before anything already queued.
        self.outbound
            .lock()
            .await
            .push_front(payload::init(&session.session_id, self.session.client_id()));

        self.set_state(ConnectionState::Connected).await;

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(self.clone().writer_loop()));
        tasks.push(tokio::spawn(self.clone().heartbeat_loop()));
        tasks.push(tokio::spawn(self.clone().reader_loop(stream)));
        drop(tasks);

        self.outbound_notify.notify_one();
        info!("connected to {server}");
        Ok(())
    }

    /// Close the connection and stop all loops.
    ///
    /// Idempotent and bounded: loops are joined with a timeout and aborted
    /// if they overrun, then the transport is closed with the same bound.
    pub async fn disconnect(&self) {
        self.set_state(ConnectionState::Closing).await;
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();

        let join_bound = self.config.loop_join_timeout();
        let mut handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        if !handles.is_empty() {
            let joined = timeout(
                join_bound,
                futures_util::future::join_all(handles.iter_mut()),
            )
            .await;
            if joined.is_err() {
                warn!("loops did not stop within {join_bound:?}, aborting");
                for handle in &handles {
                    handle.abort();
                }
            }
        }

        if let Some(mut sink) = self.sink.lock().await.take() {
            if timeout(join_bound, sink.close()).await.is_err() {
                warn!("transport close timed out");
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Queue a frame for delivery.
    ///
    /// Connects first when disconnected. Returns as soon as the frame is
    /// queued; delivery order is FIFO and a failed write is retried at the
    /// head of the queue after reconnecting.
    pub async fn send(self: &Arc<Self>, frame: Frame) -> WlResult<()> {
        if self.state().await == ConnectionState::Disconnected {
            self.connect().await?;
        }
        self.outbound.lock().await.push_back(frame);
        self.outbound_notify.notify_one();
        Ok(())
    }

    /// Backoff delay before reconnect attempt `attempt` (0-based):
    /// `min(cap, base * 2^attempt)`, so the sequence is non-decreasing.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let base = self.config.reconnect_delay_secs;
        let cap = self.config.reconnect_max_delay_secs;
        let factor = 1u64 << attempt.min(16);
        Duration::from_secs(base.saturating_mul(factor).min(cap))
    }

    /// Kick off a reconnect unless one is already in flight.
    pub fn trigger_reconnect(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if !self.config.auto_reconnect {
            let mgr = self.clone();
            tokio::spawn(async move {
                mgr.teardown_loops().await;
                mgr.set_state(ConnectionState::Disconnected).await;
            });
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("reconnect already in flight");
            return;
        }

        let mgr = self.clone();
        tokio::spawn(async move {
            mgr.reconnect_loop().await;
            mgr.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        {
            let _guard = self.connect_lock.lock().await;
            self.set_state(ConnectionState::Reconnecting).await;
            self.teardown_loops().await;
        }

        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("reconnect cancelled by shutdown");
                return;
            }

            let delay = self.reconnect_delay(attempt);
            info!("reconnect attempt {} in {:.0?}", attempt + 1, delay);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown_notify.notified() => {
                    info!("reconnect cancelled by shutdown");
                    return;
                }
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            // Attempts hold the connect lock so a concurrent user connect
            // cannot open a second transport underneath this one.
            let result = {
                let _guard = self.connect_lock.lock().await;
                if self.state().await == ConnectionState::Connected {
                    debug!("connection restored by a concurrent connect");
                    return;
                }
                self.connect_once().await
            };

            match result {
                Ok(()) => {
                    info!("reconnected after {} attempt(s)", attempt + 1);
                    return;
                }
                Err(e @ (WlError::Authentication(_) | WlError::BadParam(_))) => {
                    error!("reconnect abandoned: {e}");
                    self.set_state(ConnectionState::Disconnected).await;
                    return;
                }
                Err(e) => {
                    warn!("reconnect attempt {} failed: {e}", attempt + 1);
                    self.set_state(ConnectionState::Reconnecting).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Abort the loops of the previous connection and drop its transport.
    async fn teardown_loops(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = timeout(self.config.loop_join_timeout(), sink.close()).await;
        }
    }

    /// Writer loop: the only path that writes the transport.
    async fn writer_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst)
                || self.state().await != ConnectionState::Connected
            {
                break;
            }

            let next = self.outbound.lock().await.pop_front();
            let Some(next_frame) = next else {
                tokio::select! {
                    _ = self.outbound_notify.notified() => {}
                    _ = self.shutdown_notify.notified() => {}
                    _ = sleep(WRITER_POLL) => {}
                }
                continue;
            };

            let bytes = match frame::encode(&next_frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("dropping unencodable frame: {e}");
                    continue;
                }
            };

            let result = {
                let mut sink = self.sink.lock().await;
                match sink.as_mut() {
                    Some(sink) => sink.send(bytes).await,
                    None => Err(WlError::Connection("transport not open".into())),
                }
            };

            if let Err(e) = result {
                warn!("write failed, requeueing frame: {e}");
                self.outbound.lock().await.push_front(next_frame);
                self.trigger_reconnect();
                break;
            }
        }
        debug!("writer loop ended");
    }

    /// Heartbeat loop: enqueues a ping each interval and declares the
    /// connection dead after too many unanswered ones.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut last_ping = Instant::now();
        loop {
            tokio::select! {
                _ = sleep(HEARTBEAT_TICK) => {}
                _ = self.shutdown_notify.notified() => break,
            }
            if self.shutdown.load(Ordering::SeqCst)
                || self.state().await != ConnectionState::Connected
            {
                break;
            }
            if last_ping.elapsed() < self.config.heartbeat_interval() {
                continue;
            }

            let outstanding = self.missed_pongs.fetch_add(1, Ordering::SeqCst) + 1;
            if outstanding > self.config.max_missed_pongs {
                warn!(
                    "{} pings unanswered, connection appears dead",
                    outstanding - 1
                );
                self.trigger_reconnect();
                break;
            }

            self.outbound.lock().await.push_back(payload::ping());
            self.outbound_notify.notify_one();
            last_ping = Instant::now();
        }
        debug!("heartbeat loop ended");
    }

    /// Reader task: decodes inbound frames and routes them.
    async fn reader_loop(self: Arc<Self>, mut stream: Box<dyn TransportStream>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown_notify.notified() => break,
                event = stream.next_event() => event,
            };

            match event {
                TransportEvent::Binary(bytes) => self.handle_frame(&bytes).await,
                TransportEvent::Text(text) => {
                    warn!("ignoring unexpected text frame ({} bytes)", text.len());
                }
                TransportEvent::Pong => {
                    self.missed_pongs.store(0, Ordering::SeqCst);
                }
                TransportEvent::Closed => {
                    info!("transport closed by peer");
                    self.on_transport_lost().await;
                    break;
                }
                TransportEvent::Error(e) => {
                    warn!("transport error: {e}");
                    self.on_transport_lost().await;
                    break;
                }
            }
        }
        debug!("reader ended");
    }

    async fn on_transport_lost(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if self.config.auto_reconnect {
            self.trigger_reconnect();
        } else {
            self.set_state(ConnectionState::Disconnected).await;
        }
    }

    /// Route one inbound frame: control frames inline, the rest through the
    /// callback registry.
    async fn handle_frame(self: &Arc<Self>, bytes: &[u8]) {
        let inbound = match frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("discarding undecodable frame: {e}");
                return;
            }
        };

        match &inbound.tag {
            FrameTag::Name(name) => match name.as_str() {
                "pong" => {
                    self.missed_pongs.store(0, Ordering::SeqCst);
                }
                "ping" => {
                    self.outbound.lock().await.push_back(payload::pong());
                    self.outbound_notify.notify_one();
                }
                "error" => {
                    let code = inbound
                        .data
                        .get("code")
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    if code == "session_expired" {
                        warn!("server reports expired session, logging in again");
                        self.session.invalidate().await;
                        self.trigger_reconnect();
                    } else {
                        self.registry
                            .dispatch(CallbackCategory::Event, "error", inbound.data);
                    }
                }
                other => {
                    self.registry
                        .dispatch(CallbackCategory::Event, other, inbound.data);
                }
            },
            FrameTag::Code(code) => {
                self.registry
                    .dispatch(CallbackCategory::Message, &code.to_string(), inbound.data);
            }
        }
    }
}

/// Delay before retrying initial-connect attempt `attempt` (1-based).
/// The exponent is clamped so large retry limits cannot overflow the shift.
fn connect_retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << (attempt - 1).min(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use wl_auth::api::{
        AuthBackend, CodeRequest, CodeResponse, LoginRequest, LoginResponse, LogoutRequest,
        RegisterRequest, RegisterResponse,
    };
    use wl_auth::credentials::{unix_now, CredentialStore, Credentials};

    struct OkBackend {
        logins: AtomicU32,
    }

    impl OkBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                logins: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl AuthBackend for OkBackend {
        async fn request_code(&self, _req: &CodeRequest) -> WlResult<CodeResponse> {
            Ok(CodeResponse {
                status: "ok".into(),
                reason: None,
            })
        }

        async fn register(&self, _req: &RegisterRequest) -> WlResult<RegisterResponse> {
            Ok(RegisterResponse {
                status: "ok".into(),
                reason: None,
                login: Some("tok".into()),
                ttl: Some(3600),
                chat_dns_domain: Some("chat.test".into()),
                edge_routing_info: None,
            })
        }

        async fn login(&self, _server: &str, _req: &LoginRequest) -> WlResult<LoginResponse> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            Ok(LoginResponse {
                status: "ok".into(),
                reason: None,
                param_name: None,
                session_id: Some("sess-1".into()),
                session_key: Some("key-1".into()),
                server_id: Some("chat.test".into()),
                ttl: Some(3600),
                refresh_token: None,
                refresh_ttl: None,
            })
        }

        async fn logout(&self, _server: &str, _req: &LogoutRequest) -> WlResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        manager: Arc<ConnectionManager>,
        transport: Arc<MemoryTransport>,
        backend: Arc<OkBackend>,
        _dir: tempfile::TempDir,
    }

    fn fixture_with(config: ConnectionConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CredentialStore::load(dir.path().join("creds.json")).unwrap();
        store
            .set(Credentials {
                identity: "15551234567".into(),
                login_token: "tok".into(),
                chat_domain: "chat.test".into(),
                edge_routing_info: String::new(),
                expiration: unix_now() + 3600,
            })
            .unwrap();

        let backend = OkBackend::new();
        let session = Arc::new(SessionManager::new(
            backend.clone(),
            store,
            "chat.test",
            "2.2410.0",
        ));
        let registry = Arc::new(CallbackRegistry::default());
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(config, session, registry, transport.clone());
        Fixture {
            manager,
            transport,
            backend,
            _dir: dir,
        }
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            loop_join_timeout_secs: 1,
            reconnect_delay_secs: 0,
            ..ConnectionConfig::default()
        }
    }

    fn fixture() -> Fixture {
        fixture_with(fast_config())
    }

    async fn settle() {
        sleep(Duration::from_millis(200)).await;
    }

    fn decoded_written(transport: &MemoryTransport) -> Vec<Frame> {
        transport
            .written_frames()
            .iter()
            .map(|bytes| frame::decode(bytes).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let f = fixture();
        f.manager.connect().await.unwrap();
        f.manager.connect().await.unwrap();
        assert_eq!(f.manager.state().await, ConnectionState::Connected);
        assert_eq!(f.transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_init_frame_sent_first() {
        let f = fixture();
        f.manager
            .send(payload::text("a@s.waveline.example", "queued early", None))
            .await
            .unwrap();
        settle().await;

        let frames = decoded_written(&f.transport);
        assert!(frames.len() >= 2);
        assert_eq!(frames[0].tag, FrameTag::init());
        assert_eq!(frames[0].data["session_id"], "sess-1");
        assert_eq!(frames[1].data["body"], "queued early");
    }

    #[tokio::test]
    async fn test_send_while_disconnected_connects_then_writes() {
        let f = fixture();
        assert_eq!(f.manager.state().await, ConnectionState::Disconnected);

        f.manager
            .send(payload::text("a@s.waveline.example", "hello", None))
            .await
            .unwrap();
        settle().await;

        assert_eq!(f.manager.state().await, ConnectionState::Connected);
        assert_eq!(f.transport.open_count(), 1);
        let frames = decoded_written(&f.transport);
        assert!(frames.iter().any(|fr| fr.data["body"] == "hello"));
    }

    #[tokio::test]
    async fn test_connect_retries_transient_open_failure() {
        let f = fixture();
        f.transport.fail_opens.store(1, Ordering::SeqCst);

        f.manager.connect().await.unwrap();
        assert_eq!(f.transport.open_count(), 2);
        assert_eq!(f.manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_exhaustion_surfaces_error() {
        let f = fixture_with(ConnectionConfig {
            max_retries: 2,
            ..fast_config()
        });
        f.transport.fail_opens.store(10, Ordering::SeqCst);

        let err = f.manager.connect().await.unwrap_err();
        assert!(matches!(err, WlError::Connection(_)));
        assert_eq!(f.transport.open_count(), 2);
        assert_eq!(f.manager.state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_reconnect_backoff_capped_and_non_decreasing() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _enter = rt.enter();
        let f = fixture_with(ConnectionConfig::default());

        let delays: Vec<Duration> = (0..10).map(|n| f.manager.reconnect_delay(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0], "backoff must be non-decreasing");
        }
        assert_eq!(delays[0], Duration::from_secs(5));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(30));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_single_flight_reconnect() {
        let f = fixture();
        f.manager.connect().await.unwrap();
        assert_eq!(f.transport.open_count(), 1);

        for _ in 0..5 {
            f.manager.trigger_reconnect();
        }
        settle().await;

        // One reconnect for five triggers.
        assert_eq!(f.transport.open_count(), 2);
        assert_eq!(f.manager.state().await, ConnectionState::Connected);

        // The single-flight token is released once the reconnect finishes.
        f.manager.trigger_reconnect();
        settle().await;
        assert_eq!(f.transport.open_count(), 3);
        assert_eq!(f.manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_racing_reconnect_opens_one_transport() {
        let f = fixture();
        f.manager.connect().await.unwrap();
        assert_eq!(f.transport.open_count(), 1);

        // Slow handshakes widen the race window.
        *f.transport.open_delay.lock().unwrap() = Some(Duration::from_millis(200));
        f.transport.inject(TransportEvent::Closed);
        sleep(Duration::from_millis(50)).await;

        // A user connect while the reconnect is mid-handshake must wait for
        // it rather than open a second transport.
        f.manager.connect().await.unwrap();
        settle().await;

        assert_eq!(f.transport.open_count(), 2);
        assert_eq!(f.manager.state().await, ConnectionState::Connected);
    }

    #[test]
    fn test_connect_retry_delay_clamps_exponent() {
        assert_eq!(connect_retry_delay(1), Duration::from_secs(1));
        assert_eq!(connect_retry_delay(4), Duration::from_secs(8));
        // The exponent saturates instead of overflowing the shift.
        assert_eq!(connect_retry_delay(80), Duration::from_secs(1 << 16));
        assert_eq!(connect_retry_delay(u32::MAX), Duration::from_secs(1 << 16));
    }

    #[tokio::test]
    async fn test_disconnect_is_bounded_and_idempotent() {
        let f = fixture();
        f.manager.connect().await.unwrap();

        let start = std::time::Instant::now();
        f.manager.disconnect().await;
        // Bound: two times the loop join timeout (1s here), plus slack.
        assert!(start.elapsed() < Duration::from_millis(2500));
        assert_eq!(f.manager.state().await, ConnectionState::Disconnected);

        f.manager.disconnect().await;
        assert_eq!(f.manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_closed_triggers_reconnect() {
        let f = fixture();
        f.manager.connect().await.unwrap();

        f.transport.inject(TransportEvent::Closed);
        settle().await;

        assert_eq!(f.transport.open_count(), 2);
        assert_eq!(f.manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_no_reconnect_when_auto_reconnect_off() {
        let f = fixture_with(ConnectionConfig {
            auto_reconnect: false,
            ..fast_config()
        });
        f.manager.connect().await.unwrap();

        f.transport.inject(TransportEvent::Closed);
        settle().await;

        assert_eq!(f.transport.open_count(), 1);
        assert_eq!(f.manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_write_failure_requeues_and_reconnects() {
        let f = fixture();
        f.manager.connect().await.unwrap();
        settle().await;

        f.transport.fail_writes.store(true, Ordering::SeqCst);
        f.manager
            .send(payload::text("a@s.waveline.example", "survives", None))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        f.transport.fail_writes.store(false, Ordering::SeqCst);
        settle().await;
        settle().await;

        assert!(f.transport.open_count() >= 2);
        let frames = decoded_written(&f.transport);
        let delivered: Vec<_> = frames
            .iter()
            .filter(|fr| fr.data["body"] == "survives")
            .collect();
        assert_eq!(delivered.len(), 1);
    }

    #[tokio::test]
    async fn test_inbound_pong_resets_miss_counter() {
        let f = fixture();
        f.manager.connect().await.unwrap();
        f.manager.missed_pongs.store(2, Ordering::SeqCst);

        f.transport.inject(TransportEvent::Binary(
            frame::encode(&payload::pong()).unwrap(),
        ));
        settle().await;

        assert_eq!(f.manager.missed_pongs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_server_ping_answered_with_pong() {
        let f = fixture();
        f.manager.connect().await.unwrap();

        f.transport.inject(TransportEvent::Binary(
            frame::encode(&payload::ping()).unwrap(),
        ));
        settle().await;

        let frames = decoded_written(&f.transport);
        assert!(frames.iter().any(|fr| fr.tag == FrameTag::pong()));
    }

    #[tokio::test]
    async fn test_missed_pongs_force_reconnect() {
        let f = fixture_with(ConnectionConfig {
            heartbeat_interval_secs: 1,
            max_missed_pongs: 1,
            ..fast_config()
        });
        f.manager.connect().await.unwrap();

        // Two unanswered heartbeat pings trip the threshold.
        sleep(Duration::from_secs(4)).await;
        assert!(f.transport.open_count() >= 2);
    }

    #[tokio::test]
    async fn test_inbound_message_dispatched_to_registry() {
        let f = fixture();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.manager
            .registry()
            .register(CallbackCategory::Message, Some("0"), move |event| {
                sink.lock()
                    .unwrap()
                    .push(event.payload["body"].as_str().unwrap_or("").to_string());
            });

        f.manager.connect().await.unwrap();
        f.transport.inject(TransportEvent::Binary(
            frame::encode(&payload::text("me@s.waveline.example", "incoming", None)).unwrap(),
        ));
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec!["incoming"]);
    }

    #[tokio::test]
    async fn test_session_expired_error_forces_relogin() {
        let f = fixture();
        f.manager.connect().await.unwrap();
        assert_eq!(f.backend.logins.load(Ordering::SeqCst), 1);

        f.transport.inject(TransportEvent::Binary(
            frame::encode(&Frame::new(
                FrameTag::error(),
                serde_json::json!({ "code": "session_expired" }),
            ))
            .unwrap(),
        ));
        settle().await;

        assert_eq!(f.backend.logins.load(Ordering::SeqCst), 2);
        assert_eq!(f.transport.open_count(), 2);
        assert_eq!(f.manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_state_watcher_sees_transitions() {
        let f = fixture();
        let mut rx = f.manager.state_receiver();

        f.manager.connect().await.unwrap();
        rx.changed().await.unwrap();
        // Connecting and Connected both go by; the latest is Connected.
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);

        f.manager.disconnect().await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Disconnected);
    }
}
