use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::wire::{self, RequestFrame, ResponseFrame, Unpacker};

/// Client side of an RPC connection.
///
/// `call` enqueues the request immediately (request ids are allocated in
/// enqueue order, so they are monotonic on the wire) and returns a future for
/// the typed result. When the connection is lost, every outstanding call
/// resolves exactly once with the default value of its declared return type,
/// and calls issued afterwards resolve the same way without touching the
/// socket.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    peer: String,
    sender: Mutex<SendState>,
    pending: Mutex<Pending>,
    parked_read_half: Mutex<Option<OwnedReadHalf>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    write_task: Mutex<Option<JoinHandle<()>>>,
    disconnect_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    last_activity: Mutex<Instant>,
}

/// Outbound queue. Allocating the id and enqueueing the frame happen under
/// one lock, which is what keeps ids monotonic in wire order. `Closed` after
/// disconnect.
enum SendState {
    Open {
        next_req_id: u64,
        queue: mpsc::UnboundedSender<Vec<u8>>,
    },
    Closed,
}

/// Pending-call map. `Closed` poisons the map after disconnect so that late
/// registrations fail fast instead of waiting forever.
enum Pending {
    Open(HashMap<u64, oneshot::Sender<Vec<u8>>>),
    Closed,
}

impl RpcClient {
    /// Establishes the outbound TCP connection. `start` must be called before
    /// any response can be delivered, giving the caller a chance to install
    /// callbacks first.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("failed to connect to {}:{}", host, port))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (queue, outbound) = mpsc::unbounded_channel();
        let write_task = tokio::spawn(write_loop(outbound, write_half));
        Ok(Self {
            inner: Arc::new(ClientInner {
                peer: format!("{}:{}", host, port),
                sender: Mutex::new(SendState::Open {
                    next_req_id: 0,
                    queue,
                }),
                pending: Mutex::new(Pending::Open(HashMap::new())),
                parked_read_half: Mutex::new(Some(read_half)),
                read_task: Mutex::new(None),
                write_task: Mutex::new(Some(write_task)),
                disconnect_cb: Mutex::new(None),
                last_activity: Mutex::new(Instant::now()),
            }),
        })
    }

    /// Begins processing inbound responses.
    pub fn start(&self) {
        let Some(read_half) = self.inner.parked_read_half.lock().unwrap().take() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        *self.inner.read_task.lock().unwrap() = Some(tokio::spawn(read_loop(weak, read_half)));
    }

    /// Registers a callback fired exactly once when the connection is lost or
    /// explicitly disconnected.
    pub fn set_disconnect_callback(&self, f: impl FnOnce() + Send + 'static) {
        *self.inner.disconnect_cb.lock().unwrap() = Some(Box::new(f));
    }

    /// Allocates an id, parks the resolver, and enqueues the frame. `None`
    /// when the connection is already gone.
    fn send_request<Args: Serialize>(
        &self,
        method: &str,
        args: Args,
    ) -> Option<oneshot::Receiver<Vec<u8>>> {
        let args = wire::encode_value(&args);
        let (tx, rx) = oneshot::channel();
        // Id allocation and enqueue happen under one lock hold, which is what
        // makes request ids monotonic on the wire.
        let mut sender = self.inner.sender.lock().unwrap();
        let SendState::Open { next_req_id, queue } = &mut *sender else {
            return None;
        };
        let id = *next_req_id;
        {
            let mut pending = self.inner.pending.lock().unwrap();
            match &mut *pending {
                Pending::Open(map) => {
                    map.insert(id, tx);
                }
                Pending::Closed => return None,
            }
        }
        let frame = wire::encode_frame(&RequestFrame {
            id,
            method: method.to_string(),
            args,
        });
        if queue.send(frame).is_err() {
            if let Pending::Open(map) = &mut *self.inner.pending.lock().unwrap() {
                map.remove(&id);
            }
            return None;
        }
        *next_req_id += 1;
        drop(sender);
        *self.inner.last_activity.lock().unwrap() = Instant::now();
        Some(rx)
    }

    /// Issues a call. Arguments travel as one encoded tuple; a zero-argument
    /// call passes `()`, a single-argument call `(arg,)`. The request is
    /// written even if the returned future is never awaited.
    pub fn call<Ret, Args>(&self, method: &str, args: Args) -> impl Future<Output = Ret> + Send
    where
        Ret: DeserializeOwned + Default + Send,
        Args: Serialize,
    {
        let rx = self.send_request(method, args);
        let method = method.to_string();
        let peer = self.inner.peer.clone();
        async move {
            let Some(rx) = rx else {
                return Ret::default();
            };
            match rx.await {
                Ok(blob) => match wire::decode::<Ret>(&blob) {
                    Some(value) => value,
                    None => {
                        tracing::warn!("failed to decode result of {} from {}", method, peer);
                        Ret::default()
                    }
                },
                Err(_) => Ret::default(),
            }
        }
    }

    /// Fire-and-forget call: the request is sent, the response discarded.
    pub fn notify<Args: Serialize>(&self, method: &str, args: Args) {
        drop(self.send_request(method, args));
    }

    /// Closes the connection, failing all outstanding calls with their
    /// failure sentinels.
    pub async fn disconnect(&self) {
        if let Some(task) = self.inner.read_task.lock().unwrap().take() {
            task.abort();
        }
        self.inner.on_disconnect();
    }

    /// Instant of the last outbound request or inbound response on this
    /// connection. Used by the housekeeping expiry check.
    pub fn last_activity(&self) -> Instant {
        *self.inner.last_activity.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.pending.lock().unwrap(), Pending::Open(_))
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }
}

impl ClientInner {
    /// Fails every outstanding call, poisons both maps, and fires the user
    /// disconnect callback. Idempotent.
    fn on_disconnect(&self) {
        // Dropping the queue sender stops the writer task once it drains.
        *self.sender.lock().unwrap() = SendState::Closed;
        if let Some(task) = self.write_task.lock().unwrap().take() {
            task.abort();
        }
        let dropped = {
            let mut pending = self.pending.lock().unwrap();
            match std::mem::replace(&mut *pending, Pending::Closed) {
                Pending::Open(map) => map.len(),
                Pending::Closed => return,
            }
        };
        if dropped > 0 {
            tracing::warn!(
                "connection to {} lost; failing {} outstanding call(s)",
                self.peer,
                dropped
            );
        }
        let cb = self.disconnect_cb.lock().unwrap().take();
        if let Some(cb) = cb {
            cb();
        }
    }
}

/// Matches inbound responses to pending calls by request id.
async fn read_loop(client: Weak<ClientInner>, mut read_half: OwnedReadHalf) {
    let mut unpacker = Unpacker::new();
    let mut buf = vec![0u8; 64 * 1024];
    'read: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let Some(inner) = client.upgrade() else {
            return;
        };
        *inner.last_activity.lock().unwrap() = Instant::now();
        unpacker.feed(&buf[..n]);
        loop {
            let body = match unpacker.next_frame() {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("dropping connection to {}: {}", inner.peer, e);
                    break 'read;
                }
            };
            let Some(resp) = wire::decode::<ResponseFrame>(&body) else {
                tracing::warn!("corrupt response envelope from {}", inner.peer);
                break 'read;
            };
            let resolver = match &mut *inner.pending.lock().unwrap() {
                Pending::Open(map) => map.remove(&resp.id),
                Pending::Closed => None,
            };
            match resolver {
                // A send failure means the caller dropped its future; the
                // response is simply discarded.
                Some(tx) => {
                    let _ = tx.send(resp.result);
                }
                None => {
                    tracing::warn!("response for unknown request id {}", resp.id);
                }
            }
        }
    }
    drop(read_half);
    if let Some(inner) = client.upgrade() {
        inner.on_disconnect();
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
