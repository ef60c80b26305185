//! Coordination leader.
//!
//! The leader owns every bucket queue and the global limiter for a fleet of workers. Each
//! worker holds one TCP connection; within it, every `REQUEST` or `ACQUIRE` opens a channel
//! served by its own task, so a slow bucket never holds up frames for another.
//!
//! Channel handlers are picked from the opening frame. A router channel only accepts `DONE`,
//! a limiter channel only accepts `RELEASE`; anything else tears the channel down with an
//! `ERROR` frame and releases whatever it held.

use crate::bucket::BucketKey;
use crate::clock::{compensate_lag, nanos, Clock, SystemClock};
use crate::distributed::frame::{
    peek_stream, write_frames, FrameReader, LeaderMessage, ProtocolError, StreamId, WorkerMessage,
    DEFAULT_MAX_FRAME_LEN, HANDSHAKE_STREAM, PROTOCOL_VERSION,
};
use crate::error::RouterError;
use crate::limiter::Cooldown;
use crate::queue::{QueueState, RequestQueue};
use crate::request::RequestId;
use crate::sleeper::{Sleeper, TokioSleeper};
use dashmap::DashMap;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Address a leader binds to unless told otherwise.
pub const DEFAULT_LEADER_ADDR: SocketAddr =
    SocketAddr::V4(std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 7878));
/// Smallest frame limit accepted; anything lower could not carry a bucket key.
pub const MIN_FRAME_LEN: usize = 256;
/// Time a worker gets to send `HELLO`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Leader server configuration.
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    bind: SocketAddr,
    max_frame_len: usize,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl LeaderConfig {
    /// Listen on `bind`.
    pub fn new(bind: SocketAddr) -> Self {
        Self { bind, ..Self::default() }
    }

    /// Refuse frames longer than `len` bytes (at least [`MIN_FRAME_LEN`]).
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len.max(MIN_FRAME_LEN);
        self
    }

    /// Sleep through `sleeper` for bucket delays and cooldowns.
    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Timestamp replies with `clock`.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Address to listen on.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
    }

    /// Frame size limit.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_LEADER_ADDR,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Debug)]
struct LeaderState {
    buckets: DashMap<BucketKey, Arc<RequestQueue>>,
    global: RequestQueue,
    cooldown: Cooldown,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl LeaderState {
    fn queue(&self, key: &BucketKey) -> Arc<RequestQueue> {
        if let Some(queue) = self.buckets.get(key) {
            return queue.clone();
        }
        self.buckets
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(bucket = %key, "creating bucket queue");
                Arc::new(RequestQueue::new(key.clone(), self.sleeper.clone()))
            })
            .clone()
    }
}

/// Cloneable view of a running leader.
#[derive(Debug, Clone)]
pub struct LeaderHandle {
    state: Arc<LeaderState>,
    shutdown: CancellationToken,
}

impl LeaderHandle {
    /// State of `key`'s queue, if any worker has used it.
    pub fn bucket_state(&self, key: &BucketKey) -> Option<QueueState> {
        self.state.buckets.get(key).map(|q| q.state())
    }

    /// State of the global slot queue.
    pub fn global_state(&self) -> QueueState {
        self.state.global.state()
    }

    /// Global cooldown left.
    pub fn global_remaining(&self) -> Duration {
        self.state.cooldown.remaining()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// TCP server owning all rate-limit state for its workers.
#[derive(Debug)]
pub struct LeaderServer {
    listener: TcpListener,
    state: Arc<LeaderState>,
    shutdown: CancellationToken,
    max_frame_len: usize,
}

impl LeaderServer {
    /// Bind the listener. Must be called inside a tokio runtime.
    pub async fn bind(config: LeaderConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let state = LeaderState {
            buckets: DashMap::new(),
            global: RequestQueue::new(BucketKey::global(), config.sleeper.clone()),
            cooldown: Cooldown::new(),
            sleeper: config.sleeper,
            clock: config.clock,
        };
        Ok(Self {
            listener,
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
            max_frame_len: config.max_frame_len,
        })
    }

    /// Address actually bound, useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Handle for inspecting state and shutting down once `run` owns the server.
    pub fn handle(&self) -> LeaderHandle {
        LeaderHandle { state: self.state.clone(), shutdown: self.shutdown.clone() }
    }

    /// Accept workers until shut down.
    pub async fn run(self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "leader listening");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("leader shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "worker connected");
                        let state = self.state.clone();
                        let shutdown = self.shutdown.child_token();
                        let max_frame_len = self.max_frame_len;
                        tokio::spawn(async move {
                            serve_worker(state, stream, peer, max_frame_len, shutdown).await;
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                }
            }
        }
        Ok(())
    }
}

async fn serve_worker(
    state: Arc<LeaderState>,
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_len: usize,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        trace!(%peer, error = %e, "could not disable nagle");
    }
    let (read, write) = stream.into_split();
    let mut reader = FrameReader::new(read, max_frame_len);
    let (out, frames) = mpsc::unbounded_channel();
    tokio::spawn(write_frames(write, frames));

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut reader)).await {
        Ok(Ok(())) => {
            let hello = LeaderMessage::Hello { version: PROTOCOL_VERSION };
            let _ = out.send(hello.encode(HANDSHAKE_STREAM));
        }
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "handshake failed");
            let _ = out.send(LeaderMessage::Error { message: e.to_string() }.encode(HANDSHAKE_STREAM));
            return;
        }
        Err(_) => {
            warn!(%peer, "handshake timed out");
            return;
        }
    }

    let mut conn = WorkerConnection { state, peer, out, channels: HashMap::new() };
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = reader.next_line() => line,
        };
        match line {
            Ok(Some(line)) => match WorkerMessage::decode(&line) {
                Ok((stream, message)) => {
                    trace!(%peer, stream, tag = message.tag(), "frame");
                    conn.handle(stream, message);
                }
                Err(e) => {
                    warn!(%peer, error = %e, "undecodable frame");
                    if let Some(stream) = peek_stream(&line) {
                        conn.violation(stream, e.to_string());
                    }
                }
            },
            Ok(None) => {
                debug!(%peer, "worker disconnected");
                break;
            }
            Err(ProtocolError::NotUtf8) => warn!(%peer, "frame is not valid utf-8"),
            Err(e) => {
                warn!(%peer, error = %e, "closing worker connection");
                break;
            }
        }
    }
    debug!(%peer, open_channels = conn.channels.len(), "releasing worker channels");
}

async fn handshake<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<(), ProtocolError> {
    let line = reader
        .next_line()
        .await?
        .ok_or_else(|| ProtocolError::Io("closed before handshake".into()))?;
    match WorkerMessage::decode(&line)? {
        (_, WorkerMessage::Hello { version }) if version == PROTOCOL_VERSION => Ok(()),
        (_, WorkerMessage::Hello { version }) => {
            Err(ProtocolError::UnsupportedVersion { expected: PROTOCOL_VERSION, got: version })
        }
        (_, other) => Err(ProtocolError::Unexpected { expected: "HELLO", got: other.tag().into() }),
    }
}

/// Open channel on a worker connection. Dropping the sender ends the channel's task.
#[derive(Debug)]
enum ChannelHandle {
    Router(oneshot::Sender<()>),
    Limiter(oneshot::Sender<()>),
}

impl ChannelHandle {
    fn mode(&self) -> &'static str {
        match self {
            ChannelHandle::Router(_) => "router",
            ChannelHandle::Limiter(_) => "global limiter",
        }
    }
}

struct WorkerConnection {
    state: Arc<LeaderState>,
    peer: SocketAddr,
    out: mpsc::UnboundedSender<String>,
    channels: HashMap<StreamId, ChannelHandle>,
}

impl WorkerConnection {
    fn send(&self, stream: StreamId, message: LeaderMessage) {
        trace!(peer = %self.peer, stream, tag = message.tag(), "reply");
        let _ = self.out.send(message.encode(stream));
    }

    fn violation(&mut self, stream: StreamId, reason: String) {
        warn!(peer = %self.peer, stream, %reason, "protocol violation");
        self.channels.remove(&stream);
        self.send(stream, LeaderMessage::Error { message: reason });
    }

    fn handle(&mut self, stream: StreamId, message: WorkerMessage) {
        if let Some(open) = self.channels.get(&stream) {
            let allowed = matches!(
                (open, &message),
                (ChannelHandle::Router(_), WorkerMessage::Done { .. })
                    | (ChannelHandle::Limiter(_), WorkerMessage::Release { .. })
            );
            if !allowed {
                let reason = format!("{} on a {} channel", message.tag(), open.mode());
                return self.violation(stream, reason);
            }
        }
        match message {
            WorkerMessage::Hello { .. } => self.violation(stream, "duplicate HELLO".into()),
            WorkerMessage::Request { bucket, request } => {
                let (finish, finished) = oneshot::channel();
                self.channels.insert(stream, ChannelHandle::Router(finish));
                let queue = self.state.queue(&bucket);
                tokio::spawn(router_channel(queue, stream, request, self.out.clone(), finished));
            }
            WorkerMessage::Acquire { request } => {
                let (finish, finished) = oneshot::channel();
                self.channels.insert(stream, ChannelHandle::Limiter(finish));
                let state = self.state.clone();
                tokio::spawn(limiter_channel(state, stream, request, self.out.clone(), finished));
            }
            WorkerMessage::Done { .. } | WorkerMessage::Release { .. } => {
                match self.channels.remove(&stream) {
                    Some(ChannelHandle::Router(finish)) | Some(ChannelHandle::Limiter(finish)) => {
                        let _ = finish.send(());
                    }
                    None => trace!(peer = %self.peer, stream, "finish for a closed channel"),
                }
            }
            WorkerMessage::Limit { bucket, delay } => {
                debug!(bucket = %bucket, ?delay, "bucket limited");
                self.state.queue(&bucket).set_sleep_time(delay);
                self.send(stream, LeaderMessage::Ok { at: self.state.clock.now_nanos() });
            }
            WorkerMessage::LimitGlobal { delay, sent_at } => {
                let now = self.state.clock.now_nanos();
                let delay = Duration::from_nanos(compensate_lag(nanos(delay), sent_at, now));
                debug!(?delay, "globally limited");
                self.state.cooldown.extend(delay);
                self.send(stream, LeaderMessage::Ok { at: now });
            }
            WorkerMessage::QueryGlobal => {
                let remaining = self.state.cooldown.remaining();
                let at = self.state.clock.now_nanos();
                self.send(stream, LeaderMessage::QueryGlobal { remaining, at });
            }
        }
    }
}

async fn router_channel(
    queue: Arc<RequestQueue>,
    stream: StreamId,
    request: RequestId,
    out: mpsc::UnboundedSender<String>,
    mut finished: oneshot::Receiver<()>,
) {
    let admitted = tokio::select! {
        admitted = queue.admit() => admitted,
        _ = &mut finished => {
            trace!(bucket = %queue.key(), %request, "abandoned before admission");
            return;
        }
    };
    let permit = match admitted {
        Ok(permit) => permit,
        Err(e) => return reject(&out, stream, e),
    };
    debug!(bucket = %queue.key(), %request, "admitted");
    if out.send(LeaderMessage::Ready.encode(stream)).is_err() {
        return;
    }
    // Err: the connection went away, which completes the request as well.
    let _ = finished.await;
    permit.complete();
}

async fn limiter_channel(
    state: Arc<LeaderState>,
    stream: StreamId,
    request: RequestId,
    out: mpsc::UnboundedSender<String>,
    mut finished: oneshot::Receiver<()>,
) {
    let acquire = async {
        let permit = state.global.admit().await?;
        state.cooldown.wait(state.sleeper.as_ref()).await;
        Ok::<_, RouterError>(permit)
    };
    let acquired = tokio::select! {
        acquired = acquire => acquired,
        _ = &mut finished => {
            trace!(%request, "abandoned before permit");
            return;
        }
    };
    let permit = match acquired {
        Ok(permit) => permit,
        Err(e) => return reject(&out, stream, e),
    };
    debug!(%request, "global permit granted");
    if out.send(LeaderMessage::Permit.encode(stream)).is_err() {
        return;
    }
    let _ = finished.await;
    permit.complete();
}

fn reject(out: &mpsc::UnboundedSender<String>, stream: StreamId, error: RouterError) {
    warn!(stream, error = %error, "channel failed");
    let _ = out.send(LeaderMessage::Error { message: error.to_string() }.encode(stream));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::tcp::OwnedReadHalf;

    async fn leader() -> (SocketAddr, LeaderHandle) {
        let config = LeaderConfig::new("127.0.0.1:0".parse().unwrap());
        let server = LeaderServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        tokio::spawn(server.run());
        (addr, handle)
    }

    struct RawWorker {
        reader: FrameReader<OwnedReadHalf>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    }

    impl RawWorker {
        async fn connect(addr: SocketAddr, version: u32) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, writer) = stream.into_split();
            let mut worker = Self { reader: FrameReader::new(read, 1024), writer };
            worker.send_line(&WorkerMessage::Hello { version }.encode(HANDSHAKE_STREAM)).await;
            worker
        }

        async fn send_line(&mut self, line: &str) {
            self.writer.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        }

        async fn send(&mut self, stream: StreamId, message: WorkerMessage) {
            self.send_line(&message.encode(stream)).await;
        }

        async fn recv(&mut self) -> (StreamId, LeaderMessage) {
            let line = self.reader.next_line().await.unwrap().unwrap();
            LeaderMessage::decode(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn handshake_then_request_and_done() {
        let (addr, handle) = leader().await;
        let mut worker = RawWorker::connect(addr, PROTOCOL_VERSION).await;
        assert_eq!(worker.recv().await, (0, LeaderMessage::Hello { version: PROTOCOL_VERSION }));

        let bucket = BucketKey::from("/channels/{channel.id}:1");
        let request = RequestId::new();
        worker.send(1, WorkerMessage::Request { bucket: bucket.clone(), request }).await;
        assert_eq!(worker.recv().await, (1, LeaderMessage::Ready));
        assert_eq!(handle.bucket_state(&bucket), Some(QueueState::Dispatching));

        worker.send(1, WorkerMessage::Done { bucket: bucket.clone(), request }).await;
        worker.send(2, WorkerMessage::Request { bucket: bucket.clone(), request }).await;
        assert_eq!(worker.recv().await, (2, LeaderMessage::Ready));
    }

    #[tokio::test]
    async fn version_mismatch_is_refused() {
        let (addr, _handle) = leader().await;
        let mut worker = RawWorker::connect(addr, PROTOCOL_VERSION + 1).await;
        let (stream, reply) = worker.recv().await;
        assert_eq!(stream, HANDSHAKE_STREAM);
        assert!(matches!(reply, LeaderMessage::Error { message } if message.contains("version")));
        assert_eq!(worker.reader.next_line().await, Ok(None));
    }

    #[tokio::test]
    async fn global_limit_is_acknowledged_and_queryable() {
        let (addr, handle) = leader().await;
        let mut worker = RawWorker::connect(addr, PROTOCOL_VERSION).await;
        worker.recv().await;

        let sent_at = SystemClock.now_nanos();
        worker.send(3, WorkerMessage::LimitGlobal { delay: Duration::from_secs(30), sent_at }).await;
        assert!(matches!(worker.recv().await, (3, LeaderMessage::Ok { .. })));
        assert!(handle.global_remaining() > Duration::from_secs(25));

        worker.send(4, WorkerMessage::QueryGlobal).await;
        match worker.recv().await {
            (4, LeaderMessage::QueryGlobal { remaining, .. }) => {
                assert!(remaining > Duration::from_secs(25))
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn mixing_modes_tears_the_channel_down() {
        let (addr, handle) = leader().await;
        let mut worker = RawWorker::connect(addr, PROTOCOL_VERSION).await;
        worker.recv().await;

        let bucket = BucketKey::from("/guilds/{guild.id}:9");
        let request = RequestId::new();
        worker.send(1, WorkerMessage::Request { bucket: bucket.clone(), request }).await;
        assert_eq!(worker.recv().await, (1, LeaderMessage::Ready));

        worker.send(1, WorkerMessage::Acquire { request }).await;
        let (stream, reply) = worker.recv().await;
        assert_eq!(stream, 1);
        assert!(matches!(reply, LeaderMessage::Error { message } if message.contains("ACQUIRE")));

        // the bucket permit was released with the channel
        worker.send(2, WorkerMessage::Request { bucket: bucket.clone(), request }).await;
        assert_eq!(worker.recv().await, (2, LeaderMessage::Ready));
        handle.shutdown();
    }

    #[tokio::test]
    async fn garbage_is_reported_on_its_stream() {
        let (addr, _handle) = leader().await;
        let mut worker = RawWorker::connect(addr, PROTOCOL_VERSION).await;
        worker.recv().await;
        worker.send_line("7:FLY:away").await;
        assert!(matches!(worker.recv().await, (7, LeaderMessage::Error { .. })));

        // the connection survives
        worker.send(8, WorkerMessage::QueryGlobal).await;
        assert!(matches!(worker.recv().await, (8, LeaderMessage::QueryGlobal { .. })));
    }
}
