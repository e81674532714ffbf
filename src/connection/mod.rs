//! # Connection
//!
//! The central object of the engine. A `Connection` exclusively owns one
//! authenticated TCP transport and drives four cooperating tasks:
//!
//! - **send loop**: drains the bounded outbound queues onto the wire,
//!   holding data frames back while the peer is paused
//! - **receive loop**: turns bytes into frames, answers heartbeats,
//!   completes pending RPC calls, and feeds the inbound queue under
//!   watermark flow control
//! - **heartbeat task**: probes liveness and fails the connection at the
//!   heartbeat deadline
//! - **dispatch task**: hands inbound messages to the [`Router`] in
//!   on-wire order, emitting RESUME when the queue drains
//!
//! State is observable through a watch channel and mutated only through
//! the transition table in [`state`]. Close is graceful: the outbound
//! queue is drained, DISCONNECT is sent, and only then does the transport
//! shut down. Failure is abrupt: pending calls complete with
//! `ConnectionLost` and the tasks stop at their next suspension point.

pub mod health;
pub mod state;

use crate::config::{ClientConfig, ServerConfig};
use crate::core::codec::FrameCodec;
use crate::core::frame::{Frame, FrameType};
use crate::core::payload::{
    self, DisconnectPayload, ErrorPayload, HeartbeatPayload, MessagePayload, PeerInfo,
    RpcErrorPayload, RpcRequestPayload, RpcResponsePayload,
};
use crate::error::{constants, ConduitError, Result};
use crate::protocol::auth::{self, AuthSession};
use crate::protocol::router::Router;
use crate::protocol::rpc::{self, CallEnvelope, CallReply, PendingCalls};
use crate::transport::{self, FrameReader, FrameWriter};
use crate::utils::metrics::global_metrics;
use crate::utils::time::now_millis;
use health::HealthCounters;
use rmpv::Value;
use state::StateCell;

pub use health::ConnectionHealth;
pub use state::ConnectionState;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound of the control-frame queue; control traffic is tiny and must
/// never sit behind data
const CONTROL_QUEUE_SIZE: usize = 64;

/// Which side of the TCP handshake created this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ServerSide,
    ClientSide,
}

/// Per-connection tuning extracted from the role configs.
#[derive(Debug, Clone)]
pub(crate) struct LinkConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub send_timeout: Duration,
    pub rpc_timeout: Duration,
    pub send_queue_size: usize,
    pub receive_queue_size: usize,
    pub enable_compression: bool,
    pub enable_backpressure: bool,
    pub high_watermark: f64,
    pub low_watermark: f64,
}

impl From<&ServerConfig> for LinkConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            send_timeout: config.send_timeout,
            rpc_timeout: crate::utils::timeout::RPC_TIMEOUT,
            send_queue_size: config.send_queue_size,
            receive_queue_size: config.receive_queue_size,
            enable_compression: config.enable_compression,
            enable_backpressure: config.enable_backpressure,
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
        }
    }
}

impl From<&ClientConfig> for LinkConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            send_timeout: config.send_timeout,
            rpc_timeout: config.rpc_timeout,
            send_queue_size: config.send_queue_size,
            receive_queue_size: config.receive_queue_size,
            enable_compression: config.enable_compression,
            enable_backpressure: config.enable_backpressure,
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
        }
    }
}

/// Teardown directive observed by every loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    /// Drain the outbound queue, send DISCONNECT, then close
    Graceful,
    /// Stop at the next suspension point; the connection has failed
    Abort,
}

/// What the receive loop should do after a frame was handled.
enum FrameOutcome {
    Continue,
    Stop,
}

/// One authenticated, multiplexed TCP connection.
pub struct Connection {
    id: Uuid,
    role: Role,
    peer_addr: Option<SocketAddr>,
    state: StateCell,
    cfg: LinkConfig,
    session: AuthSession,
    data_tx: mpsc::Sender<Frame>,
    ctrl_tx: mpsc::Sender<Frame>,
    pending: Arc<PendingCalls>,
    remote_paused: AtomicBool,
    resume_notify: Notify,
    local_paused: AtomicBool,
    inbound_depth: AtomicUsize,
    disconnect_sent: AtomicBool,
    closed_locally: AtomicBool,
    health: HealthCounters,
    /// Epoch millis of the most recent pong (or connection start)
    last_pong_ms: AtomicU64,
    /// When the most recent unanswered ping left, for RTT measurement
    ping_sent_at: Mutex<Option<Instant>>,
    shutdown: watch::Sender<Option<Shutdown>>,
    done: watch::Sender<bool>,
    connected_at: Instant,
}

impl Connection {
    /// Client side: run DISCONNECTED -> CONNECTING -> AUTHENTICATING ->
    /// CONNECTED, then spawn the loops.
    pub(crate) async fn connect(config: &ClientConfig, router: Arc<Router>) -> Result<Arc<Self>> {
        let state = StateCell::new(ConnectionState::Disconnected);
        state.transition(ConnectionState::Connecting)?;

        let stream = match transport::connect(
            &config.server_host,
            config.server_port,
            config.ipv6,
            config.connect_timeout,
            config.buffer_size,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                state.try_transition(ConnectionState::Failed);
                return Err(e);
            }
        };

        state.transition(ConnectionState::Authenticating)?;
        let codec = FrameCodec::with_compression(config.enable_compression);
        let (mut writer, mut reader) = transport::split(stream, codec, config.send_timeout);

        let session = match auth::authenticate_client(&mut writer, &mut reader, config).await {
            Ok(session) => {
                global_metrics().auth_succeeded();
                session
            }
            Err(e) => {
                global_metrics().auth_rejected();
                state.try_transition(ConnectionState::Failed);
                let _ = writer.close().await;
                return Err(e);
            }
        };

        state.transition(ConnectionState::Connected)?;
        Ok(Self::spawn(
            state,
            Role::ClientSide,
            writer,
            reader,
            session,
            LinkConfig::from(config),
            router,
        ))
    }

    /// Server side: the accepted socket starts in AUTHENTICATING under the
    /// auth deadline, then reaches CONNECTED and spawns the loops.
    pub(crate) async fn accept(
        stream: TcpStream,
        config: &ServerConfig,
        router: Arc<Router>,
    ) -> Result<Arc<Self>> {
        let state = StateCell::new(ConnectionState::Authenticating);
        let codec = FrameCodec::with_compression(config.enable_compression);
        let (mut writer, mut reader) = transport::split(stream, codec, config.send_timeout);

        let expected_hash = auth::hash_password(&config.password);
        let server_info = PeerInfo {
            name: config.name.clone(),
            version: config.version.clone(),
        };
        let session = match auth::authenticate_server(
            &mut writer,
            &mut reader,
            &expected_hash,
            server_info,
            config.auth_timeout,
        )
        .await
        {
            Ok(session) => {
                global_metrics().auth_succeeded();
                session
            }
            Err(e) => {
                global_metrics().auth_rejected();
                state.try_transition(ConnectionState::Failed);
                let _ = writer.close().await;
                return Err(e);
            }
        };

        state.transition(ConnectionState::Connected)?;
        Ok(Self::spawn(
            state,
            Role::ServerSide,
            writer,
            reader,
            session,
            LinkConfig::from(config),
            router,
        ))
    }

    fn spawn(
        state: StateCell,
        role: Role,
        writer: FrameWriter,
        reader: FrameReader,
        session: AuthSession,
        cfg: LinkConfig,
        router: Arc<Router>,
    ) -> Arc<Self> {
        let (data_tx, data_rx) = mpsc::channel(cfg.send_queue_size);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CONTROL_QUEUE_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(cfg.receive_queue_size.max(1));
        let (shutdown, _) = watch::channel(None);
        let (done, _) = watch::channel(false);

        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            role,
            peer_addr: reader.peer_addr(),
            state,
            cfg,
            session,
            data_tx,
            ctrl_tx,
            pending: Arc::new(PendingCalls::new()),
            remote_paused: AtomicBool::new(false),
            resume_notify: Notify::new(),
            local_paused: AtomicBool::new(false),
            inbound_depth: AtomicUsize::new(0),
            disconnect_sent: AtomicBool::new(false),
            closed_locally: AtomicBool::new(false),
            health: HealthCounters::new(),
            last_pong_ms: AtomicU64::new(now_millis()),
            ping_sent_at: Mutex::new(None),
            shutdown,
            done,
            connected_at: Instant::now(),
        });

        global_metrics().connection_established();
        info!(id = %conn.id, role = ?role, peer = ?conn.peer_addr, "Connection established");

        let send_handle = tokio::spawn(Self::send_loop(conn.clone(), writer, data_rx, ctrl_rx));
        let recv_handle = tokio::spawn(Self::recv_loop(conn.clone(), reader, inbound_tx));
        let heartbeat_handle = tokio::spawn(Self::heartbeat_loop(conn.clone()));
        let dispatch_handle = tokio::spawn(Self::dispatch_loop(conn.clone(), router, inbound_rx));
        tokio::spawn(Self::finalize(
            conn.clone(),
            send_handle,
            recv_handle,
            heartbeat_handle,
            dispatch_handle,
        ));

        conn
    }

    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    /// Stable identifier assigned at accept/connect time.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state.get() == ConnectionState::Active
    }

    /// Session token issued during authentication.
    pub fn session_token(&self) -> &str {
        &self.session.session_token
    }

    /// The remote endpoint's announced identity.
    pub fn peer_info(&self) -> &PeerInfo {
        &self.session.peer
    }

    /// Time since the connection reached CONNECTED.
    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Traffic and liveness snapshot.
    pub fn health(&self) -> ConnectionHealth {
        self.health.snapshot()
    }

    /// Whether close() was invoked locally (as opposed to peer-initiated
    /// teardown or failure).
    pub fn closed_locally(&self) -> bool {
        self.closed_locally.load(Ordering::Acquire)
    }

    /// Send a free-form typed message.
    ///
    /// Requires the connection to be ACTIVE (or PAUSED); anything else is
    /// `NotConnected`.
    pub async fn send(&self, type_tag: impl Into<String>, data: Value) -> Result<()> {
        if !self.state.get().allows_traffic() {
            return Err(ConduitError::NotConnected);
        }
        let body = MessagePayload {
            type_tag: type_tag.into(),
            data,
        };
        let frame = Frame::new(FrameType::Message, 0, payload::encode(&body)?);
        self.enqueue_data(frame).await
    }

    /// Invoke a remote method, raising RPC errors.
    pub async fn call(
        &self,
        method: impl Into<String>,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        self.call_envelope(method, params, deadline)
            .await?
            .into_result()
    }

    /// Invoke a remote method, returning the uniform envelope so callers
    /// can inspect error codes without unwinding.
    pub async fn call_envelope(
        &self,
        method: impl Into<String>,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<CallEnvelope> {
        let state = self.state.get();
        // Discovery and early calls are legal from CONNECTED onward
        if !(state.allows_traffic() || state == ConnectionState::Connected) {
            return Err(ConduitError::NotConnected);
        }

        let correlation = self.pending.allocate();
        let rx = self.pending.register(correlation);
        let body = RpcRequestPayload {
            method: method.into(),
            params,
        };
        let frame = Frame::new(FrameType::RpcRequest, correlation, payload::encode(&body)?);

        global_metrics().rpc_call();
        if let Err(e) = self.enqueue_data(frame).await {
            self.pending.cancel(correlation);
            return Err(e);
        }

        let deadline = deadline.unwrap_or(self.cfg.rpc_timeout);
        let result = rpc::await_call(&self.pending, correlation, rx, deadline).await;
        if matches!(result, Err(ConduitError::RpcTimeout)) {
            global_metrics().rpc_timeout();
        }
        result
    }

    /// Gracefully close: drain the outbound queue, send DISCONNECT, close
    /// the transport, and wait for CLOSED.
    ///
    /// Closing an already-terminal connection is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.state.get().is_terminal() {
            return Ok(());
        }
        self.closed_locally.store(true, Ordering::Release);
        if let Err(e) = self.state.transition(ConnectionState::Closing) {
            // Lost a race against failure or peer-initiated teardown
            if self.state.get().is_terminal() {
                return Ok(());
            }
            return Err(e);
        }
        let _ = self.shutdown.send(Some(Shutdown::Graceful));
        self.closed().await;
        Ok(())
    }

    /// Resolve once the connection has fully torn down.
    pub async fn closed(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Wait for the first heartbeat exchange to flip the connection ACTIVE.
    pub async fn wait_active(&self, deadline: Duration) -> Result<()> {
        let state = tokio::time::timeout(
            deadline,
            self.state
                .wait_for(|s| s == ConnectionState::Active || s.is_terminal()),
        )
        .await
        .map_err(|_| ConduitError::Timeout)?;
        match state {
            ConnectionState::Active => Ok(()),
            _ => Err(ConduitError::NotConnected),
        }
    }

    /// Outstanding RPC calls.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    // ------------------------------------------------------------------
    // Crate-internal enqueue points
    // ------------------------------------------------------------------

    /// Queue a data frame, awaiting capacity. Submitters block here when
    /// the bounded queue is full, which is the backpressure contract.
    pub(crate) async fn enqueue_data(&self, frame: Frame) -> Result<()> {
        if self.state.get().is_terminal() || self.shutdown.borrow().is_some() {
            return Err(ConduitError::NotConnected);
        }
        self.data_tx
            .send(frame)
            .await
            .map_err(|_| ConduitError::NotConnected)
    }

    /// Queue a control frame; these bypass the pause gate.
    async fn enqueue_ctrl(&self, frame: Frame) -> Result<()> {
        self.ctrl_tx
            .send(frame)
            .await
            .map_err(|_| ConduitError::NotConnected)
    }

    // ------------------------------------------------------------------
    // Internal machinery
    // ------------------------------------------------------------------

    /// First liveness proof flips CONNECTED to ACTIVE.
    fn maybe_activate(&self) {
        if self.state.get() == ConnectionState::Connected
            && self.state.try_transition(ConnectionState::Active)
        {
            debug!(id = %self.id, "Connection active");
        }
    }

    /// Fail the connection: terminal FAILED, pending calls lost, loops told
    /// to stop. Safe to call from any task, any number of times.
    fn fail(&self, error: &ConduitError) {
        if self.state.try_transition(ConnectionState::Failed) {
            warn!(id = %self.id, error = %error, "Connection failed");
            if error.is_fatal() {
                global_metrics().protocol_error();
            }
        }
        self.pending.fail_all();
        let _ = self.shutdown.send(Some(Shutdown::Abort));
    }

    fn high_mark(&self) -> usize {
        let mark =
            (self.cfg.receive_queue_size as f64 * self.cfg.high_watermark).ceil() as usize;
        mark.max(1)
    }

    fn low_mark(&self) -> usize {
        (self.cfg.receive_queue_size as f64 * self.cfg.low_watermark).floor() as usize
    }

    async fn send_loop(
        conn: Arc<Self>,
        mut writer: FrameWriter,
        mut data_rx: mpsc::Receiver<Frame>,
        mut ctrl_rx: mpsc::Receiver<Frame>,
    ) {
        let mut shutdown_rx = conn.shutdown.subscribe();
        loop {
            let directive = *shutdown_rx.borrow();
            match directive {
                Some(Shutdown::Abort) => break,
                Some(Shutdown::Graceful) => {
                    Self::drain_and_disconnect(&conn, &mut writer, &mut data_rx, &mut ctrl_rx)
                        .await;
                    break;
                }
                None => {}
            }

            tokio::select! { biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                maybe = ctrl_rx.recv() => match maybe {
                    Some(frame) => {
                        if Self::write_frame(&conn, &mut writer, frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = conn.resume_notify.notified() => {}
                maybe = data_rx.recv(), if !conn.remote_paused.load(Ordering::Acquire) => match maybe {
                    Some(frame) => {
                        if Self::write_frame(&conn, &mut writer, frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = writer.close().await;
    }

    /// Graceful teardown: flush control frames, drain every queued data
    /// frame, then say goodbye exactly once.
    async fn drain_and_disconnect(
        conn: &Arc<Self>,
        writer: &mut FrameWriter,
        data_rx: &mut mpsc::Receiver<Frame>,
        ctrl_rx: &mut mpsc::Receiver<Frame>,
    ) {
        while let Ok(frame) = ctrl_rx.try_recv() {
            if Self::write_frame(conn, writer, frame).await.is_err() {
                return;
            }
        }
        while let Ok(frame) = data_rx.try_recv() {
            if Self::write_frame(conn, writer, frame).await.is_err() {
                return;
            }
        }
        if !conn.disconnect_sent.swap(true, Ordering::AcqRel) {
            let body = DisconnectPayload::default();
            if let Ok(bytes) = payload::encode(&body) {
                let frame = Frame::new(FrameType::Disconnect, 0, bytes);
                let _ = writer.send(frame).await;
            }
        }
    }

    async fn write_frame(conn: &Arc<Self>, writer: &mut FrameWriter, frame: Frame) -> Result<()> {
        if frame.frame_type == FrameType::Disconnect {
            conn.disconnect_sent.store(true, Ordering::Release);
        }
        let payload_len = frame.payload.len() as u64;
        match writer.send(frame).await {
            Ok(()) => {
                conn.health.record_sent(payload_len);
                global_metrics().frame_sent(payload_len);
                Ok(())
            }
            Err(e) => {
                conn.fail(&e);
                Err(e)
            }
        }
    }

    async fn recv_loop(conn: Arc<Self>, mut reader: FrameReader, inbound_tx: mpsc::Sender<Frame>) {
        let mut shutdown_rx = conn.shutdown.subscribe();
        let high_mark = conn.high_mark();
        loop {
            tokio::select! { biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || shutdown_rx.borrow().is_some() {
                        break;
                    }
                }
                result = reader.next() => match result {
                    Ok(frame) => match conn.handle_frame(frame, &inbound_tx, high_mark).await {
                        Ok(FrameOutcome::Continue) => {}
                        Ok(FrameOutcome::Stop) => break,
                        Err(e) => {
                            conn.fail(&e);
                            break;
                        }
                    },
                    Err(e) => {
                        let tearing_down = conn.state.get() == ConnectionState::Closing
                            || shutdown_rx.borrow().is_some();
                        if !tearing_down {
                            conn.fail(&e);
                        }
                        break;
                    }
                },
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        inbound_tx: &mpsc::Sender<Frame>,
        high_mark: usize,
    ) -> Result<FrameOutcome> {
        self.health.record_received(frame.payload.len() as u64);
        global_metrics().frame_received(frame.payload.len() as u64);

        match frame.frame_type {
            FrameType::HeartbeatPing => {
                self.health.record_heartbeat();
                let pong = Frame::new(
                    FrameType::HeartbeatPong,
                    frame.correlation,
                    frame.payload.clone(),
                );
                let _ = self.enqueue_ctrl(pong).await;
                self.maybe_activate();
            }
            FrameType::HeartbeatPong => {
                self.last_pong_ms.store(now_millis(), Ordering::Release);
                self.health.record_heartbeat();
                let sent_at = self.ping_sent_at.lock().ok().and_then(|mut slot| slot.take());
                if let Some(at) = sent_at {
                    self.health
                        .record_rtt(at.elapsed().max(Duration::from_micros(1)));
                }
                self.maybe_activate();
            }
            FrameType::Pause => {
                debug!(id = %self.id, "Peer paused");
                self.remote_paused.store(true, Ordering::Release);
            }
            FrameType::Resume => {
                debug!(id = %self.id, "Peer resumed");
                self.remote_paused.store(false, Ordering::Release);
                self.resume_notify.notify_waiters();
            }
            FrameType::RpcResponse => match payload::decode::<RpcResponsePayload>(&frame.payload) {
                Ok(body) => {
                    if !self
                        .pending
                        .complete(frame.correlation, CallReply::Response(body.result))
                    {
                        debug!(
                            id = %self.id,
                            correlation = frame.correlation,
                            "Dropping RPC response with unknown correlation"
                        );
                    }
                }
                Err(e) => warn!(id = %self.id, error = %e, "Malformed RPC response dropped"),
            },
            FrameType::RpcError => match payload::decode::<RpcErrorPayload>(&frame.payload) {
                Ok(body) => {
                    if !self
                        .pending
                        .complete(frame.correlation, CallReply::Error(body))
                    {
                        debug!(
                            id = %self.id,
                            correlation = frame.correlation,
                            "Dropping RPC error with unknown correlation"
                        );
                    }
                }
                Err(e) => warn!(id = %self.id, error = %e, "Malformed RPC error dropped"),
            },
            FrameType::Message | FrameType::RpcRequest => {
                let state = self.state.get();
                if !(state.allows_traffic() || state == ConnectionState::Connected) {
                    debug!(id = %self.id, state = %state, "Dropping traffic outside steady state");
                    return Ok(FrameOutcome::Continue);
                }

                if self.cfg.enable_backpressure {
                    let projected = self.inbound_depth.load(Ordering::Acquire) + 1;
                    if projected >= high_mark && !self.local_paused.swap(true, Ordering::AcqRel) {
                        let pause = Frame::new(FrameType::Pause, 0, Vec::new());
                        let _ = self.enqueue_ctrl(pause).await;
                        global_metrics().pause_sent();
                        let _ = self.state.try_transition(ConnectionState::Paused);
                        debug!(id = %self.id, depth = projected, "Inbound high watermark; paused peer");
                    }
                }

                self.inbound_depth.fetch_add(1, Ordering::AcqRel);
                if inbound_tx.send(frame).await.is_err() {
                    self.inbound_depth.fetch_sub(1, Ordering::AcqRel);
                }
            }
            FrameType::AuthRequest | FrameType::AuthSuccess | FrameType::AuthFailure => {
                return Err(ConduitError::Custom(
                    "AUTH frame after authentication completed".to_string(),
                ));
            }
            FrameType::Disconnect => {
                let reason = payload::decode::<DisconnectPayload>(&frame.payload)
                    .ok()
                    .and_then(|body| body.reason);
                info!(id = %self.id, reason = ?reason, "Peer disconnected");
                self.state.try_transition(ConnectionState::Closing);
                let _ = self.shutdown.send(Some(Shutdown::Graceful));
                return Ok(FrameOutcome::Stop);
            }
            FrameType::Error => {
                if let Ok(body) = payload::decode::<ErrorPayload>(&frame.payload) {
                    warn!(id = %self.id, message = %body.message, code = ?body.code, "Peer reported error");
                }
            }
        }
        Ok(FrameOutcome::Continue)
    }

    async fn heartbeat_loop(conn: Arc<Self>) {
        let mut shutdown_rx = conn.shutdown.subscribe();
        let mut ticker = tokio::time::interval(conn.cfg.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || shutdown_rx.borrow().is_some() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let state = conn.state.get();
            if state.is_terminal() {
                break;
            }
            if !state.heartbeats() {
                continue;
            }

            let silence = now_millis().saturating_sub(conn.last_pong_ms.load(Ordering::Acquire));
            if silence > conn.cfg.heartbeat_timeout.as_millis() as u64 {
                global_metrics().heartbeat_failure();
                conn.fail(&ConduitError::Custom(
                    constants::ERR_HEARTBEAT_TIMEOUT.to_string(),
                ));
                break;
            }

            let correlation = conn.pending.allocate();
            let body = HeartbeatPayload {
                nonce: Some(correlation),
            };
            let Ok(bytes) = payload::encode(&body) else {
                continue;
            };
            if let Ok(mut slot) = conn.ping_sent_at.lock() {
                slot.get_or_insert_with(Instant::now);
            }
            let ping = Frame::new(FrameType::HeartbeatPing, correlation, bytes);
            if conn.ctrl_tx.send(ping).await.is_err() {
                break;
            }
        }
    }

    async fn dispatch_loop(
        conn: Arc<Self>,
        router: Arc<Router>,
        mut inbound_rx: mpsc::Receiver<Frame>,
    ) {
        let low_mark = conn.low_mark();
        while let Some(frame) = inbound_rx.recv().await {
            let depth = conn
                .inbound_depth
                .fetch_sub(1, Ordering::AcqRel)
                .saturating_sub(1);

            if conn.cfg.enable_backpressure
                && depth < low_mark
                && conn.local_paused.swap(false, Ordering::AcqRel)
            {
                let resume = Frame::new(FrameType::Resume, 0, Vec::new());
                if conn.enqueue_ctrl(resume).await.is_ok() {
                    global_metrics().resume_sent();
                    // Only PAUSED unwinds to ACTIVE here; a connection still
                    // in CONNECTED keeps waiting on its first heartbeat
                    if conn.state.get() == ConnectionState::Paused {
                        conn.state.try_transition(ConnectionState::Active);
                    }
                    debug!(id = %conn.id, depth, "Inbound low watermark; resumed peer");
                } else {
                    conn.local_paused.store(true, Ordering::Release);
                }
            }

            // Sequential dispatch keeps per-tag delivery in on-wire order;
            // handlers themselves run here, concurrent with the other loops.
            router.dispatch(conn.clone(), frame).await;
        }
    }

    async fn finalize(
        conn: Arc<Self>,
        send_handle: JoinHandle<()>,
        recv_handle: JoinHandle<()>,
        heartbeat_handle: JoinHandle<()>,
        mut dispatch_handle: JoinHandle<()>,
    ) {
        let _ = send_handle.await;
        recv_handle.abort();
        heartbeat_handle.abort();
        // The receive loop is gone, so the inbound channel is closed; give
        // the dispatcher the grace period to drain what was already queued
        if tokio::time::timeout(crate::utils::timeout::SHUTDOWN_TIMEOUT, &mut dispatch_handle)
            .await
            .is_err()
        {
            dispatch_handle.abort();
        }

        conn.state.try_transition(ConnectionState::Closed);
        if !conn.state.get().is_terminal() {
            // A loop exited outside the normal paths; make the end state honest
            conn.state.try_transition(ConnectionState::Failed);
        }
        conn.pending.fail_all();
        global_metrics().connection_closed();
        let _ = conn.done.send(true);
        debug!(id = %conn.id, state = %conn.state.get(), "Connection finished");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state.get())
            .field("peer", &self.peer_addr)
            .finish()
    }
}
