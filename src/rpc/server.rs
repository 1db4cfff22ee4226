use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::method::RpcMethod;
use crate::wire::{self, RequestFrame, ResponseFrame, Unpacker};

/// Type-erased handler stored in the dispatch table. `None` marks an argument
/// blob that failed to decode; the connection carrying it is dropped.
type HandlerFn =
    Arc<dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = Option<Vec<u8>>> + Send>> + Send + Sync>;

type AcceptCallback = Arc<dyn Fn(ServerConnection) + Send + Sync>;

/// RPC server over a TCP listen socket.
///
/// Methods are registered under string names before `start`. Accepted
/// connections are either handed to the application through the accept
/// callback (which then owns them; dropping a connection closes it) or
/// retained internally until shutdown.
pub struct RpcServer {
    local_addr: SocketAddr,
    handlers: Arc<DashMap<String, HandlerFn>>,
    listener: Mutex<Option<TcpListener>>,
    accept_cb: Mutex<Option<AcceptCallback>>,
    connections: Mutex<Vec<ServerConnection>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Binds the listen socket. Port 0 asks the OS for an ephemeral port; the
    /// actual port is available through [`RpcServer::port`].
    pub async fn bind(host: &str, port: u16) -> Result<Arc<Self>> {
        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("failed to bind RPC listener on {}:{}", host, port))?;
        let local_addr = listener.local_addr()?;
        Ok(Arc::new(Self {
            local_addr,
            handlers: Arc::new(DashMap::new()),
            listener: Mutex::new(Some(listener)),
            accept_cb: Mutex::new(None),
            connections: Mutex::new(Vec::new()),
            accept_task: Mutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Registers a typed method under `name`.
    ///
    /// Registering two methods with the same name is a programmer error and
    /// panics.
    pub fn register<Args, Ret, F>(&self, name: &str, f: F)
    where
        Args: DeserializeOwned + Send + 'static,
        Ret: Serialize + Send + 'static,
        F: RpcMethod<Args, Ret>,
    {
        let f = Arc::new(f);
        let method = name.to_string();
        let handler: HandlerFn = Arc::new(move |blob: Vec<u8>| {
            let f = f.clone();
            let method = method.clone();
            Box::pin(async move {
                let Some(args) = wire::decode::<Args>(&blob) else {
                    tracing::warn!("failed to decode arguments for method {}", method);
                    return None;
                };
                let ret = f.invoke(args).await;
                Some(wire::encode_value(&ret))
            })
        });
        let replaced = self.handlers.insert(name.to_string(), handler);
        assert!(
            replaced.is_none(),
            "RPC method {:?} registered twice",
            name
        );
        tracing::debug!("registered RPC method {}", name);
    }

    /// Installs a callback invoked with every newly accepted connection. The
    /// callback takes ownership; the server no longer retains such
    /// connections, and dropping one closes it.
    pub fn set_accept_callback(&self, f: impl Fn(ServerConnection) + Send + Sync + 'static) {
        *self.accept_cb.lock().unwrap() = Some(Arc::new(f));
        self.connections.lock().unwrap().clear();
    }

    /// Starts accepting connections. Must be called exactly once.
    pub fn start(self: &Arc<Self>) {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .expect("RpcServer::start called twice");
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let Some(server) = weak.upgrade() else {
                    break;
                };
                tracing::debug!("accepted RPC connection from {}", peer);
                let conn = ServerConnection::new(stream, peer, server.handlers.clone());
                let cb = server.accept_cb.lock().unwrap().clone();
                match cb {
                    Some(cb) => cb(conn),
                    None => {
                        conn.start();
                        let mut connections = server.connections.lock().unwrap();
                        connections.retain(|c| !c.is_closed());
                        connections.push(conn);
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap() = Some(task);
    }

    /// Stops accepting and closes every retained connection.
    pub fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        self.connections.lock().unwrap().clear();
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One accepted connection. Processing begins at `start`; dropping the handle
/// closes the socket and stops both connection tasks.
pub struct ServerConnection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    peer: SocketAddr,
    handlers: Arc<DashMap<String, HandlerFn>>,
    stream: Mutex<Option<TcpStream>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    write_task: Mutex<Option<JoinHandle<()>>>,
    disconnect_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    closed: AtomicBool,
}

impl ServerConnection {
    fn new(stream: TcpStream, peer: SocketAddr, handlers: Arc<DashMap<String, HandlerFn>>) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                peer,
                handlers,
                stream: Mutex::new(Some(stream)),
                outbound: Mutex::new(None),
                read_task: Mutex::new(None),
                write_task: Mutex::new(None),
                disconnect_cb: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Begins processing traffic on this connection.
    pub fn start(&self) {
        let Some(stream) = self.inner.stream.lock().unwrap().take() else {
            return;
        };
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.outbound.lock().unwrap() = Some(tx.clone());

        let weak = Arc::downgrade(&self.inner);
        *self.inner.read_task.lock().unwrap() =
            Some(tokio::spawn(read_loop(weak, read_half, tx)));
        *self.inner.write_task.lock().unwrap() = Some(tokio::spawn(write_loop(rx, write_half)));
    }

    /// Registers a callback fired exactly once when the connection goes away,
    /// whether closed locally or by the peer.
    pub fn set_disconnect_callback(&self, f: impl FnOnce() + Send + 'static) {
        *self.inner.disconnect_cb.lock().unwrap() = Some(Box::new(f));
    }

    pub fn disconnect(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl ConnInner {
    /// Tears the connection down and fires the disconnect callback once.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stream.lock().unwrap().take();
        self.outbound.lock().unwrap().take();
        if let Some(task) = self.read_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.write_task.lock().unwrap().take() {
            task.abort();
        }
        tracing::debug!("connection from {} closed", self.peer);
        if let Some(cb) = self.disconnect_cb.lock().unwrap().take() {
            cb();
        }
    }
}

/// Decodes inbound requests and dispatches each to its own task. Handlers
/// never run inline here; a slow handler must not stall the byte stream.
async fn read_loop(
    conn: Weak<ConnInner>,
    mut read_half: OwnedReadHalf,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
) {
    let mut unpacker = Unpacker::new();
    let mut buf = vec![0u8; 64 * 1024];
    'read: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        unpacker.feed(&buf[..n]);
        loop {
            let body = match unpacker.next_frame() {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("dropping connection: {}", e);
                    break 'read;
                }
            };
            let Some(req) = wire::decode::<RequestFrame>(&body) else {
                tracing::warn!("corrupt request envelope; dropping connection");
                break 'read;
            };
            let Some(handler) = conn
                .upgrade()
                .and_then(|c| c.handlers.get(&req.method).map(|h| h.value().clone()))
            else {
                tracing::warn!("unknown RPC method {:?}; disconnecting", req.method);
                break 'read;
            };
            let outbound = outbound.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                match handler(req.args).await {
                    Some(result) => {
                        let frame = wire::encode_frame(&ResponseFrame { id: req.id, result });
                        let _ = outbound.send(frame);
                    }
                    None => {
                        // Argument decode failure: protocol-level corruption.
                        if let Some(conn) = conn.upgrade() {
                            conn.close();
                        }
                    }
                }
            });
        }
    }
    drop(read_half);
    if let Some(conn) = conn.upgrade() {
        conn.close();
    }
}

async fn write_loop(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, mut write_half: OwnedWriteHalf) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
