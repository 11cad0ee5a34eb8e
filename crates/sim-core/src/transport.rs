//! Loopback TCP wiring between the driver and a simulated server.
//!
//! One connection carries many concurrent calls. Each request is a line with
//! a call id; the server answers each id once, in completion order:
//!
//! ```text
//! -> 17
//! <- 17 ok 20013452      (admitted, latency in nanoseconds)
//! <- 17 drop             (rejected)
//! <- 17 fault            (simulation fault)
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SimError};
use crate::server::{CallOutcome, CallTarget, SimulatedServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok(Duration),
    Drop,
    Fault,
}

pub fn encode_reply(id: u64, reply: Reply) -> String {
    match reply {
        Reply::Ok(latency) => format!("{id} ok {}\n", latency.as_nanos()),
        Reply::Drop => format!("{id} drop\n"),
        Reply::Fault => format!("{id} fault\n"),
    }
}

pub fn parse_reply(line: &str) -> Result<(u64, Reply)> {
    let malformed = || SimError::Transport(format!("malformed reply: {line:?}"));
    let mut parts = line.split_whitespace();
    let id = parts
        .next()
        .and_then(|id| id.parse::<u64>().ok())
        .ok_or_else(malformed)?;
    let reply = match (parts.next(), parts.next()) {
        (Some("ok"), Some(nanos)) => {
            Reply::Ok(Duration::from_nanos(nanos.parse().map_err(|_| malformed())?))
        }
        (Some("drop"), None) => Reply::Drop,
        (Some("fault"), None) => Reply::Fault,
        _ => return Err(malformed()),
    };
    if parts.next().is_some() {
        return Err(malformed());
    }
    Ok((id, reply))
}

/// A simulated server listening on loopback.
pub struct ServerHandle {
    addr: SocketAddr,
    accept: JoinHandle<()>,
}

impl ServerHandle {
    /// Bind `127.0.0.1:port` (0 picks an ephemeral port) and start serving.
    pub async fn bind(server: Arc<SimulatedServer>, port: u16) -> Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SimError::Bind { addr, source })?;
        let addr = listener.local_addr()?;
        info!(%addr, capacity = server.capacity(), "simulated server listening");

        let accept = tokio::spawn(accept_loop(listener, server));
        Ok(Self { addr, accept })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections. Established connections keep serving
    /// until the peer disconnects.
    pub fn shutdown(self) {
        self.accept.abort();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn accept_loop(listener: TcpListener, server: Arc<SimulatedServer>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, server).await {
                        warn!(%peer, error = %e, "connection closed with error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, server: Arc<SimulatedServer>) -> Result<()> {
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    let (replies, outbound) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_lines(write, outbound));

    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let Ok(id) = line.trim().parse::<u64>() else {
            warn!(line = %line, "ignoring malformed request");
            continue;
        };
        let server = server.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            let reply = match server.handle().await {
                Ok(CallOutcome::Admitted(latency)) => Reply::Ok(latency),
                Ok(CallOutcome::Rejected) => Reply::Drop,
                Err(e) => {
                    warn!(id, error = %e, "simulated call faulted");
                    Reply::Fault
                }
            };
            let _ = replies.send(encode_reply(id, reply));
        });
    }

    // The writer exits once every in-flight call has replied.
    drop(replies);
    writer.await?;
    Ok(())
}

async fn write_lines(mut write: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = outbound.recv().await {
        if let Err(e) = write.write_all(line.as_bytes()).await {
            debug!(error = %e, "peer went away");
            break;
        }
    }
}

type Pending = Mutex<HashMap<u64, oneshot::Sender<Result<CallOutcome>>>>;

struct Shared {
    pending: Pending,
    closed: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<CallOutcome>>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Client side of the loopback transport.
pub struct RemoteTarget {
    addr: SocketAddr,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl RemoteTarget {
    pub async fn connect(port: u16) -> Result<Self> {
        Self::connect_addr(SocketAddr::from(([127, 0, 0, 1], port))).await
    }

    pub async fn connect_addr(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| SimError::Connect { addr, source })?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let (outbound, rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(write_lines(write, rx)),
            tokio::spawn(read_replies(read, shared.clone())),
        ];
        info!(%addr, "connected to simulated server");

        Ok(Self {
            addr,
            next_id: AtomicU64::new(0),
            outbound,
            shared,
            tasks,
        })
    }

    async fn send(&self) -> Result<CallOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);

        // The reader sets `closed` before draining, so either it sees this
        // entry or we see the flag.
        if self.shared.closed.load(Ordering::SeqCst)
            || self.outbound.send(format!("{id}\n")).is_err()
        {
            self.shared.pending().remove(&id);
            return Err(SimError::Transport(format!(
                "connection to {} is closed",
                self.addr
            )));
        }

        rx.await.map_err(|_| {
            SimError::Simulation(format!("connection to {} lost mid-call", self.addr))
        })?
    }
}

async fn read_replies(read: OwnedReadHalf, shared: Arc<Shared>) {
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_reply(&line) {
                Ok((id, reply)) => {
                    let outcome = match reply {
                        Reply::Ok(latency) => Ok(CallOutcome::Admitted(latency)),
                        Reply::Drop => Ok(CallOutcome::Rejected),
                        Reply::Fault => {
                            Err(SimError::Simulation("server reported a fault".into()))
                        }
                    };
                    let waiter = shared.pending().remove(&id);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(outcome);
                    }
                }
                Err(e) => warn!(error = %e, "skipping reply"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "reply stream failed");
                break;
            }
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    let abandoned = std::mem::take(&mut *shared.pending());
    if !abandoned.is_empty() {
        warn!(count = abandoned.len(), "connection closed with calls in flight");
    }
}

impl CallTarget for RemoteTarget {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn call<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<CallOutcome>> + Send + 'a>> {
        Box::pin(self.send())
    }
}

impl Drop for RemoteTarget {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
