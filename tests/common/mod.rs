#![allow(dead_code)]

use async_trait::async_trait;
use bucketgate::distributed::{LeaderConfig, LeaderHandle, LeaderServer};
use bucketgate::{BucketKey, HttpExchange, Request, Response, RouterError};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Opt-in log output: `RUST_LOG=bucketgate=trace cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One canned answer.
#[derive(Debug, Clone)]
pub struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    latency: Duration,
    transport_error: bool,
}

impl Reply {
    pub fn status(code: u16) -> Self {
        Self {
            status: StatusCode::from_u16(code).unwrap(),
            headers: HeaderMap::new(),
            latency: Duration::ZERO,
            transport_error: false,
        }
    }

    pub fn ok() -> Self {
        Self::status(200)
    }

    /// Connection failure instead of a response.
    pub fn transport_error() -> Self {
        Self { transport_error: true, ..Self::ok() }
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.insert(HeaderName::from_static(name), HeaderValue::from_str(value).unwrap());
        self
    }

    /// `remaining: 0` with the given reset window.
    pub fn exhausted(self, reset_after: Duration) -> Self {
        self.header("x-ratelimit-remaining", "0")
            .header("x-ratelimit-reset-after", &reset_after.as_secs_f64().to_string())
    }

    pub fn after(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// A recorded exchange.
#[derive(Debug, Clone)]
pub struct Call {
    pub path: String,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Reply>,
    by_path: HashMap<String, VecDeque<Reply>>,
    calls: Vec<Call>,
    in_flight: HashMap<String, usize>,
    overlaps: usize,
}

/// Exchange answering from a script; unscripted calls get `200 OK`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExchange {
    script: Arc<Mutex<Script>>,
}

impl ScriptedExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next call with `reply`.
    pub fn push(&self, reply: Reply) -> &Self {
        self.script.lock().unwrap().replies.push_back(reply);
        self
    }

    /// Answer the next call on `path` with `reply`, ahead of the shared script.
    pub fn push_for(&self, path: &str, reply: Reply) -> &Self {
        self.script.lock().unwrap().by_path.entry(path.to_string()).or_default().push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.path == path).collect()
    }

    /// Times two calls on the same bucket were in flight together.
    pub fn overlaps(&self) -> usize {
        self.script.lock().unwrap().overlaps
    }
}

#[async_trait]
impl HttpExchange for ScriptedExchange {
    async fn execute(&self, request: &Request) -> Result<Response, RouterError> {
        let path = request.path().to_string();
        let bucket = BucketKey::of(request).to_string();
        let started = Instant::now();
        let reply = {
            let mut script = self.script.lock().unwrap();
            let running = script.in_flight.entry(bucket.clone()).or_default();
            *running += 1;
            if *running > 1 {
                script.overlaps += 1;
            }
            let scripted = script.by_path.get_mut(&path).and_then(|q| q.pop_front());
            scripted.or_else(|| script.replies.pop_front()).unwrap_or_else(Reply::ok)
        };
        tokio::time::sleep(reply.latency).await;
        {
            let mut script = self.script.lock().unwrap();
            if let Some(running) = script.in_flight.get_mut(&bucket) {
                *running -= 1;
            }
            script.calls.push(Call { path, started, finished: Instant::now() });
        }
        if reply.transport_error {
            return Err(RouterError::Transport("connection reset".into()));
        }
        Ok(Response::new(reply.status, reply.headers, ""))
    }
}

/// Leader on an ephemeral port, running in the background.
pub async fn spawn_leader() -> (SocketAddr, LeaderHandle) {
    spawn_leader_with(LeaderConfig::new("127.0.0.1:0".parse().unwrap())).await
}

pub async fn spawn_leader_with(config: LeaderConfig) -> (SocketAddr, LeaderHandle) {
    let server = LeaderServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    tokio::spawn(server.run());
    (addr, handle)
}

/// Let spawned tasks run without advancing paused time.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
