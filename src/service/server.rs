//! Accept supervisor and per-connection lifecycle for the server role.
//!
//! Binds a TCP4/TCP6 listener, guards each accepted socket with the
//! authentication deadline, pools connections once they reach ACTIVE, and
//! fires lifecycle hooks in registration order. Broadcast iterates a pool
//! snapshot; per-connection failures are isolated from the rest.

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{ConduitError, Result};
use crate::protocol::router::{MethodSchema, Router};
use crate::utils::timeout::SHUTDOWN_TIMEOUT;
use dashmap::DashMap;
use futures::future::BoxFuture;
use rmpv::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

type ServerHook = Arc<dyn Fn(Arc<Server>) -> BoxFuture<'static, ()> + Send + Sync>;
type ConnectionHook = Arc<dyn Fn(Arc<Connection>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct ServerHooks {
    startup: Mutex<Vec<ServerHook>>,
    shutdown: Mutex<Vec<ServerHook>>,
    client_connect: Mutex<Vec<ConnectionHook>>,
    client_disconnect: Mutex<Vec<ConnectionHook>>,
}

/// TCP server: accept loop, connection pool, broadcast, lifecycle hooks.
pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
    pool: DashMap<Uuid, Arc<Connection>>,
    hooks: ServerHooks,
    shutdown: tokio::sync::watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    started_at: Mutex<Option<Instant>>,
    running: AtomicBool,
    departed_bytes_sent: AtomicU64,
    departed_bytes_received: AtomicU64,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Arc::new(Self {
            config,
            router: Arc::new(Router::new()),
            pool: DashMap::new(),
            hooks: ServerHooks::default(),
            shutdown,
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
            started_at: Mutex::new(None),
            running: AtomicBool::new(false),
            departed_bytes_sent: AtomicU64::new(0),
            departed_bytes_received: AtomicU64::new(0),
        })
    }

    /// The shared dispatch table, for registration beyond the sugar below.
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

    /// Register an RPC method with its parameter schema.
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

    pub fn on_startup<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Server>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Ok(mut hooks) = self.hooks.startup.lock() {
            hooks.push(Arc::new(move |server| Box::pin(hook(server))));
        }
    }

    pub fn on_shutdown<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Server>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Ok(mut hooks) = self.hooks.shutdown.lock() {
            hooks.push(Arc::new(move |server| Box::pin(hook(server))));
        }
    }

    pub fn on_client_connect<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Ok(mut hooks) = self.hooks.client_connect.lock() {
            hooks.push(Arc::new(move |conn| Box::pin(hook(conn))));
        }
    }

    pub fn on_client_disconnect<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Ok(mut hooks) = self.hooks.client_disconnect.lock() {
            hooks.push(Arc::new(move |conn| Box::pin(hook(conn))));
        }
    }

    /// Bind the listener and start accepting connections.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let problems = self.config.validate();
        if !problems.is_empty() {
            return Err(ConduitError::ConfigError(format!(
                "Invalid server configuration: {}",
                problems.join("; ")
            )));
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ConduitError::Custom("Server already running".to_string()));
        }

        // "0.0.0.0" means "any" in both families
        let host = if self.config.ipv6 && self.config.host == "0.0.0.0" {
            "::"
        } else {
            self.config.host.as_str()
        };
        let listener = crate::transport::bind(
            host,
            self.config.port,
            self.config.ipv6,
            self.config.buffer_size,
        )
        .await?;

        let addr = listener.local_addr()?;
        if let Ok(mut slot) = self.local_addr.lock() {
            *slot = Some(addr);
        }
        if let Ok(mut slot) = self.started_at.lock() {
            *slot = Some(Instant::now());
        }
        info!(address = %addr, name = %self.config.name, "Server listening");

        let task = tokio::spawn(Self::accept_loop(self.clone(), listener));
        if let Ok(mut slot) = self.accept_task.lock() {
            *slot = Some(task);
        }

        self.fire_server_hooks(&self.hooks.startup).await;
        Ok(())
    }

    /// Stop accepting, close every pooled connection, fire shutdown hooks.
    pub async fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.config.name, "Server stopping");
        let _ = self.shutdown.send(true);

        let task = self.accept_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }

        let connections: Vec<Arc<Connection>> =
            self.pool.iter().map(|entry| entry.value().clone()).collect();
        for conn in connections {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, conn.close()).await;
        }

        self.fire_server_hooks(&self.hooks.shutdown).await;
        info!(name = %self.config.name, "Server stopped");
    }

    async fn accept_loop(server: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = server.shutdown.subscribe();
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if server.pool.len() >= server.config.max_connections {
                            warn!(peer = %addr, "Connection limit reached; refusing socket");
                            drop(stream);
                            continue;
                        }
                        let server = server.clone();
                        tokio::spawn(async move {
                            server.handle_socket(stream, addr).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                    }
                },
            }
        }
    }

    async fn handle_socket(self: Arc<Self>, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let conn = match Connection::accept(stream, &self.config, self.router.clone()).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %addr, error = %e, "Handshake failed");
                return;
            }
        };

        // Pool membership begins at ACTIVE; a connection that never gets
        // there fails itself at the heartbeat deadline
        let activation_deadline = self.config.heartbeat_timeout + self.config.heartbeat_interval;
        if conn.wait_active(activation_deadline).await.is_err() {
            warn!(id = %conn.id(), peer = %addr, "Connection never became active");
            conn.closed().await;
            return;
        }

        self.pool.insert(conn.id(), conn.clone());
        self.fire_connection_hooks(&self.hooks.client_connect, conn.clone())
            .await;

        conn.closed().await;

        self.pool.remove(&conn.id());
        let health = conn.health();
        self.departed_bytes_sent
            .fetch_add(health.bytes_sent, Ordering::Relaxed);
        self.departed_bytes_received
            .fetch_add(health.bytes_received, Ordering::Relaxed);
        self.fire_connection_hooks(&self.hooks.client_disconnect, conn)
            .await;
    }

    async fn fire_server_hooks(self: &Arc<Self>, hooks: &Mutex<Vec<ServerHook>>) {
        let snapshot: Vec<ServerHook> = match hooks.lock() {
            Ok(hooks) => hooks.clone(),
            Err(_) => return,
        };
        for hook in snapshot {
            hook(self.clone()).await;
        }
    }

    async fn fire_connection_hooks(
        &self,
        hooks: &Mutex<Vec<ConnectionHook>>,
        conn: Arc<Connection>,
    ) {
        let snapshot: Vec<ConnectionHook> = match hooks.lock() {
            Ok(hooks) => hooks.clone(),
            Err(_) => return,
        };
        for hook in snapshot {
            hook(conn.clone()).await;
        }
    }

    /// Send a typed message to every active connection, optionally
    /// filtered. Returns the number of successful sends.
    pub async fn broadcast(
        &self,
        type_tag: &str,
        data: Value,
        include: Option<&[Uuid]>,
        exclude: Option<&[Uuid]>,
    ) -> usize {
        let snapshot: Vec<Arc<Connection>> =
            self.pool.iter().map(|entry| entry.value().clone()).collect();

        let mut delivered = 0usize;
        for conn in snapshot {
            let id = conn.id();
            if let Some(include) = include {
                if !include.contains(&id) {
                    continue;
                }
            }
            if let Some(exclude) = exclude {
                if exclude.contains(&id) {
                    continue;
                }
            }
            match conn.send(type_tag, data.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(id = %id, error = %e, "Broadcast send failed");
                }
            }
        }
        delivered
    }

    /// Number of pooled (active) connections.
    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }

    /// Snapshot of the pooled connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.pool.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Look up a pooled connection by id.
    pub fn connection(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.pool.get(&id).map(|entry| entry.value().clone())
    }

    /// Address actually bound, once started. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|slot| *slot)
    }

    /// Seconds-resolution uptime since start().
    pub fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .ok()
            .and_then(|slot| *slot)
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Payload bytes sent across all connections, past and present.
    pub fn total_bytes_sent(&self) -> u64 {
        let live: u64 = self
            .pool
            .iter()
            .map(|entry| entry.value().health().bytes_sent)
            .sum();
        self.departed_bytes_sent.load(Ordering::Relaxed) + live
    }

    /// Payload bytes received across all connections, past and present.
    pub fn total_bytes_received(&self) -> u64 {
        let live: u64 = self
            .pool
            .iter()
            .map(|entry| entry.value().health().bytes_received)
            .sum();
        self.departed_bytes_received.load(Ordering::Relaxed) + live
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
