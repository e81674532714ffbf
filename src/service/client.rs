//! Client facade: connect, reconnect supervision, and call/send sugar.
//!
//! The supervisor watches the live connection; when it ends without a
//! local `disconnect()`, a fresh connection attempt is scheduled under
//! exponential backoff. Pending RPC calls never transfer between
//! attempts; they fail with `ConnectionLost` when their connection dies.

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionHealth, ConnectionState};
use crate::error::{ConduitError, Result};
use crate::protocol::router::{MethodSchema, Router};
use crate::protocol::rpc::CallEnvelope;
use futures::future::BoxFuture;
use rmpv::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type ClientHook = Arc<dyn Fn(Arc<Client>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct ClientHooks {
    connect: Mutex<Vec<ClientHook>>,
    disconnect: Mutex<Vec<ClientHook>>,
    reconnect: Mutex<Vec<ClientHook>>,
}

/// TCP client with optional automatic reconnection.
pub struct Client {
    config: ClientConfig,
    router: Arc<Router>,
    conn: RwLock<Option<Arc<Connection>>>,
    hooks: ClientHooks,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
}

impl Client {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            router: Arc::new(Router::new()),
            conn: RwLock::new(None),
            hooks: ClientHooks::default(),
            supervisor: Mutex::new(None),
            stopping: AtomicBool::new(false),
        })
    }

    /// The dispatch table for messages and RPC methods the *server* may
    /// invoke on this client; the stream is fully bidirectional.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Register a handler for a message type tag.
    pub fn on<F, Fut>(&self, type_tag: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Arc<Connection>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        self.router.register_message(type_tag, handler)
    }

    /// Register an RPC method callable by the server.
    pub fn rpc<F, Fut>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: MethodSchema,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Arc<Connection>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.router.register_rpc(name, description, schema, handler)
    }

    pub fn on_connect<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Client>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Ok(mut hooks) = self.hooks.connect.lock() {
            hooks.push(Arc::new(move |client| Box::pin(hook(client))));
        }
    }

    pub fn on_disconnect<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Client>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Ok(mut hooks) = self.hooks.disconnect.lock() {
            hooks.push(Arc::new(move |client| Box::pin(hook(client))));
        }
    }

    pub fn on_reconnect<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Client>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Ok(mut hooks) = self.hooks.reconnect.lock() {
            hooks.push(Arc::new(move |client| Box::pin(hook(client))));
        }
    }

    /// Connect, authenticate, and wait for the connection to become
    /// ACTIVE. Spawns the reconnect supervisor when enabled.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let problems = self.config.validate();
        if !problems.is_empty() {
            return Err(ConduitError::ConfigError(format!(
                "Invalid client configuration: {}",
                problems.join("; ")
            )));
        }
        if self.current().is_some() {
            return Err(ConduitError::Custom("Client already connected".to_string()));
        }
        self.stopping.store(false, Ordering::Release);

        let conn = Self::attempt(&self.config, self.router.clone()).await?;
        self.store(Some(conn.clone()));
        self.fire_hooks(&self.hooks.connect).await;

        let supervisor = tokio::spawn(Self::supervise(self.clone(), conn));
        if let Ok(mut slot) = self.supervisor.lock() {
            if let Some(old) = slot.replace(supervisor) {
                old.abort();
            }
        }
        Ok(())
    }

    /// One full connection attempt: TCP, auth, first heartbeat exchange.
    async fn attempt(config: &ClientConfig, router: Arc<Router>) -> Result<Arc<Connection>> {
        let conn = Connection::connect(config, router).await?;
        let activation_deadline = config.connect_timeout + config.heartbeat_interval;
        conn.wait_active(activation_deadline).await?;
        Ok(conn)
    }

    async fn supervise(client: Arc<Self>, mut conn: Arc<Connection>) {
        loop {
            conn.closed().await;
            client.store(None);
            client.fire_hooks(&client.hooks.disconnect).await;

            let local = conn.closed_locally();
            if local
                || client.stopping.load(Ordering::Acquire)
                || !client.config.reconnect_enabled
            {
                break;
            }

            info!(state = %conn.state(), "Connection lost; reconnect supervisor engaged");
            match Self::reconnect_with_backoff(&client).await {
                Some(new_conn) => {
                    client.store(Some(new_conn.clone()));
                    client.fire_hooks(&client.hooks.reconnect).await;
                    conn = new_conn;
                }
                None => {
                    warn!("Reconnect attempts exhausted; giving up");
                    break;
                }
            }
        }
    }

    /// Fresh attempts under `min(max_delay, initial * multiplier^n)`;
    /// `reconnect_attempts == 0` retries forever.
    async fn reconnect_with_backoff(client: &Arc<Self>) -> Option<Arc<Connection>> {
        let config = &client.config;
        let mut attempt: u32 = 0;
        loop {
            if config.reconnect_attempts != 0 && attempt >= config.reconnect_attempts {
                return None;
            }

            let delay = backoff_delay(
                config.reconnect_delay,
                config.reconnect_delay_multiplier,
                config.reconnect_delay_max,
                attempt,
            );
            debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::time::sleep(delay).await;
            attempt += 1;

            if client.stopping.load(Ordering::Acquire) {
                return None;
            }

            match Self::attempt(config, client.router.clone()).await {
                Ok(conn) => {
                    info!(attempt, "Reconnected");
                    return Some(conn);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }
    }

    /// Gracefully close the current connection and stop the supervisor.
    pub async fn disconnect(&self) -> Result<()> {
        self.stopping.store(true, Ordering::Release);
        let conn = self.take();
        let supervisor = self.supervisor.lock().ok().and_then(|mut slot| slot.take());
        if let Some(conn) = conn {
            conn.close().await?;
        }
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
        Ok(())
    }

    /// Send a free-form typed message to the server.
    pub async fn send(&self, type_tag: impl Into<String>, data: Value) -> Result<()> {
        self.require_conn()?.send(type_tag, data).await
    }

    /// Invoke a server method, raising RPC errors.
    pub async fn call(
        &self,
        method: impl Into<String>,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        self.require_conn()?.call(method, params, deadline).await
    }

    /// Invoke a server method, returning the uniform envelope.
    pub async fn call_envelope(
        &self,
        method: impl Into<String>,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<CallEnvelope> {
        self.require_conn()?
            .call_envelope(method, params, deadline)
            .await
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.current()
    }

    pub fn is_connected(&self) -> bool {
        self.current()
            .map(|conn| conn.state().allows_traffic())
            .unwrap_or(false)
    }

    pub fn state(&self) -> ConnectionState {
        self.current()
            .map(|conn| conn.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Health snapshot of the live connection.
    pub fn health(&self) -> Option<ConnectionHealth> {
        self.current().map(|conn| conn.health())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn require_conn(&self) -> Result<Arc<Connection>> {
        self.current().ok_or(ConduitError::NotConnected)
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.conn.read().ok().and_then(|slot| slot.clone())
    }

    fn store(&self, conn: Option<Arc<Connection>>) {
        if let Ok(mut slot) = self.conn.write() {
            *slot = conn;
        }
    }

    fn take(&self) -> Option<Arc<Connection>> {
        self.conn.write().ok().and_then(|mut slot| slot.take())
    }

    async fn fire_hooks(self: &Arc<Self>, hooks: &Mutex<Vec<ClientHook>>) {
        let snapshot: Vec<ClientHook> = match hooks.lock() {
            Ok(hooks) => hooks.clone(),
            Err(_) => return,
        };
        for hook in snapshot {
            hook(self.clone()).await;
        }
    }
}

/// `min(max_delay, initial * multiplier^attempt)`
fn backoff_delay(initial: Duration, multiplier: f64, max_delay: Duration, attempt: u32) -> Duration {
    let scaled = initial.as_secs_f64() * multiplier.powi(attempt as i32);
    Duration::from_secs_f64(scaled.min(max_delay.as_secs_f64()))
}
