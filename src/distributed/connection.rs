//! Worker side of the coordination protocol: one multiplexed connection per leader.

use crate::distributed::frame::{
    write_frames, FrameReader, LeaderMessage, ProtocolError, StreamId, WorkerMessage,
    DEFAULT_MAX_FRAME_LEN, HANDSHAKE_STREAM, PROTOCOL_VERSION,
};
use crate::error::RouterError;
use crate::retry::{ReconnectOptions, RetryPolicy};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Time the leader gets to answer `HELLO`.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Streams = Arc<Mutex<HashMap<StreamId, mpsc::UnboundedSender<LeaderMessage>>>>;
/// One leader's connection. Connecting holds only this leader's slot.
type Slot = Arc<tokio::sync::Mutex<Option<Arc<LeaderConnection>>>>;

/// Live connection to one leader, shared by every channel opened on it.
pub struct LeaderConnection {
    addr: SocketAddr,
    out: mpsc::UnboundedSender<String>,
    streams: Streams,
    next_stream: AtomicU64,
    closed: CancellationToken,
}

impl fmt::Debug for LeaderConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderConnection")
            .field("addr", &self.addr)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl LeaderConnection {
    /// Connect and handshake.
    pub async fn connect(addr: SocketAddr, max_frame_len: usize) -> Result<Arc<Self>, RouterError> {
        let unavailable = |reason: String| RouterError::LeaderUnavailable { addr, reason };
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| unavailable("connect timed out".into()))?
            .map_err(|e| unavailable(e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!(leader = %addr, error = %e, "could not disable nagle");
        }
        let (read, write) = stream.into_split();
        let mut reader = FrameReader::new(read, max_frame_len);
        let (out, frames) = mpsc::unbounded_channel();
        tokio::spawn(write_frames(write, frames));

        let hello = WorkerMessage::Hello { version: PROTOCOL_VERSION };
        out.send(hello.encode(HANDSHAKE_STREAM)).map_err(|_| unavailable("writer closed".into()))?;
        let line = tokio::time::timeout(CONNECT_TIMEOUT, reader.next_line())
            .await
            .map_err(|_| unavailable("handshake timed out".into()))?
            .map_err(|e| unavailable(e.to_string()))?
            .ok_or_else(|| unavailable("closed during handshake".into()))?;
        match LeaderMessage::decode(&line)? {
            (_, LeaderMessage::Hello { version }) if version == PROTOCOL_VERSION => {}
            (_, LeaderMessage::Hello { version }) => {
                return Err(ProtocolError::UnsupportedVersion { expected: PROTOCOL_VERSION, got: version }
                    .into());
            }
            (_, LeaderMessage::Error { message }) => {
                return Err(ProtocolError::Unexpected { expected: "HELLO", got: message }.into());
            }
            (_, other) => {
                return Err(ProtocolError::Unexpected { expected: "HELLO", got: other.tag().into() }
                    .into());
            }
        }

        let conn = Arc::new(Self {
            addr,
            out,
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_stream: AtomicU64::new(HANDSHAKE_STREAM + 1),
            closed: CancellationToken::new(),
        });
        tokio::spawn(demux(reader, conn.streams.clone(), conn.closed.clone(), addr));
        Ok(conn)
    }

    /// Leader address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// True once the connection has dropped or been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the connection; every open channel fails with
    /// [`RouterError::LeaderUnavailable`].
    pub fn close(&self) {
        self.closed.cancel();
    }

    fn unavailable(&self, reason: &str) -> RouterError {
        RouterError::LeaderUnavailable { addr: self.addr, reason: reason.to_string() }
    }

    fn send(&self, stream: StreamId, message: &WorkerMessage) -> Result<(), RouterError> {
        trace!(leader = %self.addr, stream, tag = message.tag(), "frame");
        self.out.send(message.encode(stream)).map_err(|_| self.unavailable("writer closed"))
    }

    /// Open a stream with `first`. `finish`, if any, is sent when the channel is dropped.
    pub fn open(
        self: &Arc<Self>,
        first: WorkerMessage,
        finish: Option<WorkerMessage>,
    ) -> Result<Channel, RouterError> {
        if self.is_closed() {
            return Err(self.unavailable("connection closed"));
        }
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let (tx, inbound) = mpsc::unbounded_channel();
        lock(&self.streams).insert(id, tx);
        // the reader may have cleared the table between the check and the insert
        if self.is_closed() {
            lock(&self.streams).remove(&id);
            return Err(self.unavailable("connection closed"));
        }
        let channel = Channel { conn: self.clone(), id, inbound, finish };
        self.send(id, &first)?;
        Ok(channel)
    }

    /// Send `message` on a fresh stream and wait for the single reply.
    pub async fn request(self: &Arc<Self>, message: WorkerMessage) -> Result<LeaderMessage, RouterError> {
        let mut channel = self.open(message, None)?;
        channel.recv().await
    }
}

impl Drop for LeaderConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn demux(
    mut reader: FrameReader<OwnedReadHalf>,
    streams: Streams,
    closed: CancellationToken,
    addr: SocketAddr,
) {
    loop {
        let line = tokio::select! {
            _ = closed.cancelled() => break,
            line = reader.next_line() => line,
        };
        match line {
            Ok(Some(line)) => match LeaderMessage::decode(&line) {
                Ok((stream, message)) => {
                    trace!(leader = %addr, stream, tag = message.tag(), "reply");
                    let target = lock(&streams).get(&stream).cloned();
                    match target {
                        Some(tx) => {
                            let _ = tx.send(message);
                        }
                        None => trace!(leader = %addr, stream, "reply for a closed stream"),
                    }
                }
                Err(e) => warn!(leader = %addr, error = %e, "undecodable frame from leader"),
            },
            Ok(None) => {
                info!(leader = %addr, "leader closed the connection");
                break;
            }
            Err(e) => {
                warn!(leader = %addr, error = %e, "leader connection failed");
                break;
            }
        }
    }
    closed.cancel();
    lock(&streams).clear();
}

/// One stream on a [`LeaderConnection`].
#[derive(Debug)]
pub struct Channel {
    conn: Arc<LeaderConnection>,
    id: StreamId,
    inbound: mpsc::UnboundedReceiver<LeaderMessage>,
    finish: Option<WorkerMessage>,
}

impl Channel {
    /// Stream id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Connection the channel runs on.
    pub fn connection(&self) -> &Arc<LeaderConnection> {
        &self.conn
    }

    /// Next reply. `ERROR` frames become [`ProtocolError::Rejected`].
    pub async fn recv(&mut self) -> Result<LeaderMessage, RouterError> {
        match self.inbound.recv().await {
            Some(LeaderMessage::Error { message }) => {
                // the leader already tore the channel down
                self.finish = None;
                Err(ProtocolError::Rejected(message).into())
            }
            Some(message) => Ok(message),
            None => Err(self.conn.unavailable("connection lost")),
        }
    }

    /// Wait for exactly `expected`.
    pub async fn expect(&mut self, expected: LeaderMessage) -> Result<(), RouterError> {
        let message = self.recv().await?;
        if message != expected {
            return Err(ProtocolError::Unexpected { expected: expected.tag(), got: message.tag().into() }
                .into());
        }
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        lock(&self.conn.streams).remove(&self.id);
        if let Some(finish) = self.finish.take() {
            if !self.conn.is_closed() {
                let _ = self.conn.send(self.id, &finish);
            }
        }
    }
}

/// Connections to every leader this worker talks to, reconnecting on demand.
#[derive(Debug, Clone)]
pub struct LeaderPool {
    slots: Arc<Mutex<HashMap<SocketAddr, Slot>>>,
    reconnect: ReconnectOptions,
    max_frame_len: usize,
}

impl LeaderPool {
    /// Pool reconnecting on `reconnect`'s schedule.
    pub fn new(reconnect: ReconnectOptions) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            reconnect,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Refuse replies longer than `len` bytes.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    fn slot(&self, addr: SocketAddr) -> Slot {
        lock(&self.slots).entry(addr).or_default().clone()
    }

    /// Live connection to `addr`, connecting if there is none.
    ///
    /// Concurrent callers for the same leader share one connection attempt; other leaders are
    /// not held up by it.
    pub async fn get(&self, addr: SocketAddr) -> Result<Arc<LeaderConnection>, RouterError> {
        let slot = self.slot(addr);
        let mut current = slot.lock().await;
        if let Some(conn) = current.as_ref().filter(|c| !c.is_closed()) {
            return Ok(conn.clone());
        }
        let conn = LeaderConnection::connect(addr, self.max_frame_len).await?;
        info!(leader = %addr, "connected to leader");
        *current = Some(conn.clone());
        Ok(conn)
    }

    /// Close `conn` and forget it, unless it was already replaced.
    pub async fn evict(&self, conn: &Arc<LeaderConnection>) {
        conn.close();
        let slot = self.slot(conn.addr());
        let mut current = slot.lock().await;
        if current.as_ref().map_or(false, |c| Arc::ptr_eq(c, conn)) {
            *current = None;
            debug!(leader = %conn.addr(), "evicted leader connection");
        }
    }

    /// Run `operation` against `addr`'s leader, reconnecting while the leader is unavailable.
    ///
    /// A channel torn down by the leader also forces a fresh connection.
    pub async fn with_leader<T, F, Fut>(&self, addr: SocketAddr, operation: F) -> Result<T, RouterError>
    where
        F: Fn(Arc<LeaderConnection>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, RouterError>> + Send,
        T: Send,
    {
        let policy = RetryPolicy::reconnect(&self.reconnect).on_retry(move |attempt, delay, error| {
            info!(leader = %addr, attempt, ?delay, error = %error, "reconnecting to leader");
        });
        let operation = &operation;
        policy
            .execute(|| async move {
                let conn = self.get(addr).await?;
                let result = operation(conn.clone()).await;
                if matches!(&result, Err(e) if e.is_leader_unavailable()) {
                    self.evict(&conn).await;
                }
                result
            })
            .await
    }
}

impl Default for LeaderPool {
    fn default() -> Self {
        Self::new(ReconnectOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketKey;
    use crate::distributed::leader::{LeaderConfig, LeaderServer};
    use crate::request::RequestId;
    use crate::InstantSleeper;

    async fn leader() -> SocketAddr {
        let server = LeaderServer::bind(LeaderConfig::new("127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    #[tokio::test]
    async fn dropping_a_channel_sends_its_finish_frame() {
        let addr = leader().await;
        let conn = LeaderConnection::connect(addr, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let bucket = BucketKey::from("/webhooks/{webhook.id}:5");
        let (first, second) = (RequestId::new(), RequestId::new());

        let done = |request| Some(WorkerMessage::Done { bucket: bucket.clone(), request });
        let mut a = conn
            .open(WorkerMessage::Request { bucket: bucket.clone(), request: first }, done(first))
            .unwrap();
        a.expect(LeaderMessage::Ready).await.unwrap();

        let mut b = conn
            .open(WorkerMessage::Request { bucket: bucket.clone(), request: second }, done(second))
            .unwrap();
        drop(a);
        b.expect(LeaderMessage::Ready).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_leader_gives_up_after_max_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let options = ReconnectOptions::new(Duration::from_millis(1), Duration::from_millis(2))
            .unwrap()
            .with_max_retries(2)
            .with_sleeper(InstantSleeper);
        let pool = LeaderPool::new(options);
        let err = pool
            .with_leader(addr, |conn| async move { conn.request(WorkerMessage::QueryGlobal).await })
            .await
            .unwrap_err();
        assert!(err.is_leader_unavailable(), "{err}");
    }

    #[tokio::test]
    async fn stalled_leader_does_not_block_other_leaders() {
        // accepts but never answers HELLO, so connecting hangs until the handshake timeout
        let stalled = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stalled_addr = stalled.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = stalled.accept().await {
                held.push(stream);
            }
        });
        let live = leader().await;
        let pool = LeaderPool::default();

        let connecting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get(stalled_addr).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let conn = tokio::time::timeout(Duration::from_secs(2), pool.get(live))
            .await
            .expect("live leader waited on the stalled one")
            .unwrap();
        assert_eq!(conn.addr(), live);
        assert!(!connecting.is_finished());
        connecting.abort();
    }

    #[tokio::test]
    async fn pool_reuses_live_connections() {
        let addr = leader().await;
        let pool = LeaderPool::default();
        let a = pool.get(addr).await.unwrap();
        let b = pool.get(addr).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        pool.evict(&a).await;
        let c = pool.get(addr).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(a.is_closed());
    }
}
