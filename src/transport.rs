use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::packet::{decode_sync, encode_sync, SyncMessage};

/// Request/response channel to the time authority.
#[async_trait]
pub trait Transport: Send + Sync {
  /// Sends a probe stamped with the local time `t1_ms` and resolves with the
  /// authority's time `s1`. There is no built-in timeout.
  async fn send_probe(&self, t1_ms: i64) -> Result<i64>;
}

/// Pushes from the authority that are not probe replies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServerEvent {
  Schedule { time_ms: i64 },
  Volume { level: f32 },
}

/// Outstanding probes keyed by their echoed `t1`.
#[derive(Debug, Default)]
pub struct PendingProbes {
  waiting: Mutex<HashMap<i64, oneshot::Sender<i64>>>,
}

impl PendingProbes {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, t1_ms: i64) -> oneshot::Receiver<i64> {
    let (tx, rx) = oneshot::channel();
    self.lock().insert(t1_ms, tx);
    rx
  }

  /// Delivers a reply. Replies for unknown or abandoned probes are dropped.
  pub fn resolve(&self, t1_ms: i64, s1_ms: i64) -> bool {
    match self.lock().remove(&t1_ms) {
      Some(tx) => tx.send(s1_ms).is_ok(),
      None => false,
    }
  }

  pub fn forget(&self, t1_ms: i64) {
    self.lock().remove(&t1_ms);
  }

  /// Fails every outstanding probe.
  pub fn close_all(&self) {
    self.lock().clear();
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, oneshot::Sender<i64>>> {
    self.waiting.lock().unwrap_or_else(|e| e.into_inner())
  }
}

struct ForgetOnDrop<'a> {
  pending: &'a PendingProbes,
  t1_ms: i64,
}

impl Drop for ForgetOnDrop<'_> {
  fn drop(&mut self) {
    self.pending.forget(self.t1_ms);
  }
}

/// Routes one inbound control message. Returns the event to surface, if any.
pub fn dispatch(pending: &PendingProbes, msg: SyncMessage) -> Option<ServerEvent> {
  match msg {
    SyncMessage::SyncResponse { t1_ms, s1_ms } => {
      if !pending.resolve(t1_ms, s1_ms) {
        debug!(t1_ms, "reply for unknown probe");
      }
      None
    }
    SyncMessage::Schedule { time_ms } => Some(ServerEvent::Schedule { time_ms }),
    SyncMessage::Volume { level } => Some(ServerEvent::Volume { level }),
    SyncMessage::SyncRequest { .. } => None,
  }
}

/// UDP client side of the sync protocol.
pub struct UdpTransport {
  socket: Arc<UdpSocket>,
  pending: Arc<PendingProbes>,
  reader: JoinHandle<()>,
}

impl UdpTransport {
  /// Connects to the authority and starts the inbound reader. Schedule and
  /// volume pushes are delivered on the returned channel.
  pub async fn connect(
    server: impl ToSocketAddrs,
  ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>)> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server).await?;
    let socket = Arc::new(socket);
    let pending = Arc::new(PendingProbes::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let reader = tokio::spawn(read_loop(socket.clone(), pending.clone(), events_tx));
    Ok((Self { socket, pending, reader }, events_rx))
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.socket.local_addr()?)
  }
}

impl Drop for UdpTransport {
  fn drop(&mut self) {
    self.reader.abort();
    self.pending.close_all();
  }
}

async fn read_loop(
  socket: Arc<UdpSocket>,
  pending: Arc<PendingProbes>,
  events: mpsc::UnboundedSender<ServerEvent>,
) {
  let mut buf = [0u8; 512];
  loop {
    let n = match socket.recv(&mut buf).await {
      Ok(n) => n,
      Err(e) => {
        warn!("transport receive failed: {e}");
        break;
      }
    };
    match decode_sync(&buf[..n]) {
      Ok(msg) => {
        if let Some(event) = dispatch(&pending, msg) {
          // receiver gone just means nobody listens for pushes
          let _ = events.send(event);
        }
      }
      Err(e) => debug!("dropping datagram: {e}"),
    }
  }
  pending.close_all();
}

#[async_trait]
impl Transport for UdpTransport {
  async fn send_probe(&self, t1_ms: i64) -> Result<i64> {
    let reply = self.pending.register(t1_ms);
    let _forget = ForgetOnDrop { pending: &self.pending, t1_ms };
    let pkt = encode_sync(&SyncMessage::SyncRequest { t1_ms });
    self.socket.send(&pkt).await?;
    reply
      .await
      .map_err(|_| Error::Transport("transport closed before probe reply".into()))
  }
}
