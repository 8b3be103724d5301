//! RESP front end: accept loop, per-connection command loop, push ingestion.
//!
//! Push values are decoded, normalized, filtered by topic admission and enqueued in argument
//! order. A full queue stops the push at the first rejected value.

use crate::config::Config;
use crate::event::{RawEvent, normalize};
use crate::metrics;
use crate::queue::{QueueError, RecordQueue};
use crate::resp::{self, ProtocolError, Reply};
use crate::stats::Counters;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Push values above this size are dropped without a trace.
pub const MAX_PAYLOAD_BYTES: usize = 1_000_000;
/// Push values above this size are logged at warn.
pub const WARN_PAYLOAD_BYTES: usize = 500_000;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// What happened to one push value that did not hit backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumed {
    Queued,
    /// Dropped before queueing; carries the metric reason.
    Dropped(&'static str),
}

/// Why a connection ended.
#[derive(Debug)]
enum CloseCause {
    ClientEof,
    Quit,
    Protocol(ProtocolError),
    Shutdown,
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseCause::ClientEof => write!(f, "client closed"),
            CloseCause::Quit => write!(f, "quit"),
            CloseCause::Protocol(e) => write!(f, "{}", e),
            CloseCause::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// State shared by every connection task: config, queue, counters, connection tracking.
pub struct ServerContext {
    config: Arc<Config>,
    queue: Arc<dyn RecordQueue>,
    counters: Arc<Counters>,
    connections: AtomicI64,
    per_origin: Mutex<HashMap<IpAddr, usize>>,
}

impl ServerContext {
    pub fn new(config: Arc<Config>, queue: Arc<dyn RecordQueue>, counters: Arc<Counters>) -> Self {
        Self {
            config,
            queue,
            counters,
            connections: AtomicI64::new(0),
            per_origin: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &Arc<dyn RecordQueue> {
        &self.queue
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Open connections across all origins.
    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::Acquire)
    }

    fn connection_opened(&self, ip: IpAddr) -> (i64, usize) {
        let total = self.connections.fetch_add(1, Ordering::AcqRel) + 1;
        let from_origin = match self.per_origin.lock() {
            Ok(mut m) => {
                let n = m.entry(ip).or_insert(0);
                *n += 1;
                *n
            }
            Err(_) => 0,
        };
        metrics::set_connections(total);
        (total, from_origin)
    }

    fn connection_closed(&self, ip: IpAddr) -> (i64, usize) {
        let total = self.connections.fetch_sub(1, Ordering::AcqRel) - 1;
        let from_origin = match self.per_origin.lock() {
            Ok(mut m) => {
                let left = m.get(&ip).copied().unwrap_or(0).saturating_sub(1);
                if left == 0 {
                    m.remove(&ip);
                } else {
                    m.insert(ip, left);
                }
                left
            }
            Err(_) => 0,
        };
        metrics::set_connections(total);
        (total, from_origin)
    }

    /// Decode, normalize, filter and enqueue one push value.
    ///
    /// Malformed or filtered values are dropped (`Ok(Consumed::Dropped)`); only queue errors
    /// are returned, so the caller can report backpressure.
    pub async fn consume_raw_event(&self, raw: &[u8]) -> Result<Consumed, QueueError> {
        metrics::record_received(1);
        if raw.len() > MAX_PAYLOAD_BYTES {
            metrics::record_dropped("oversized", 1);
            return Ok(Consumed::Dropped("oversized"));
        }
        if raw.len() > WARN_PAYLOAD_BYTES {
            tracing::warn!(raw_length = raw.len(), "raw message larger than 500k");
        }
        tracing::debug!(raw_length = raw.len(), "raw message");

        let event = match RawEvent::from_json(raw) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, event = %String::from_utf8_lossy(raw), "failed to decode event");
                metrics::record_dropped("bad_envelope", 1);
                return Ok(Consumed::Dropped("bad_envelope"));
            }
        };
        let record = match normalize(&event) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, message = %event.message, source = %event.source, "failed to normalize event");
                metrics::record_dropped(e.reason(), 1);
                return Ok(Consumed::Dropped(e.reason()));
            }
        };
        if let Err(reason) = self.config.admission(&record.topic, &record.keyword) {
            tracing::debug!(topic = %record.topic, reason, "record not admitted");
            metrics::record_dropped(reason, 1);
            return Ok(Consumed::Dropped(reason));
        }
        match self.queue.put(record).await {
            Ok(()) => {
                metrics::set_queue_depth(self.queue.depth());
                Ok(Consumed::Queued)
            }
            Err(e) => {
                metrics::record_dropped("queue_full", 1);
                Err(e)
            }
        }
    }

    /// Run one command. Returns the reply and whether the connection should close after it.
    pub async fn execute(&self, args: &[Bytes], peer: SocketAddr) -> (Reply, bool) {
        let Some(name) = args.first() else {
            return (Reply::Error("ERR bad command".to_string()), false);
        };
        let command = String::from_utf8_lossy(name).to_ascii_lowercase();
        tracing::debug!(addr = %peer, cmd = %command, args = args.len() - 1, "new command");

        match command.as_str() {
            "ping" => (Reply::Simple("PONG".to_string()), false),
            "quit" => (Reply::ok(), true),
            "info" => {
                let banner = if self.config.multi {
                    "redis_version:2.4"
                } else {
                    "redis_version:2.3"
                };
                (Reply::Simple(banner.to_string()), false)
            }
            "rpush" | "lpush" => {
                if args.len() < 3 {
                    return (
                        Reply::Error(format!(
                            "ERR wrong number of arguments for '{}' command",
                            command
                        )),
                        false,
                    );
                }
                (self.push(&args[2..], peer).await, false)
            }
            "llen" => (Reply::Integer(depth_reply(self.queue.depth())), false),
            _ => {
                tracing::warn!(addr = %peer, cmd = %command, "unknown command");
                (
                    Reply::Error(format!("ERR unknown command '{}'", command)),
                    false,
                )
            }
        }
    }

    async fn push(&self, values: &[Bytes], peer: SocketAddr) -> Reply {
        for (accepted, raw) in values.iter().enumerate() {
            if let Err(e) = self.consume_raw_event(raw).await {
                tracing::warn!(
                    addr = %peer,
                    accepted,
                    rejected = values.len() - accepted,
                    error = %e,
                    "push rejected"
                );
                return match e {
                    QueueError::Full => Reply::Error("ERR queue full".to_string()),
                    other => Reply::Error(format!("ERR {}", other)),
                };
            }
        }
        Reply::Integer(depth_reply(self.queue.depth()))
    }
}

fn depth_reply(depth: u64) -> i64 {
    i64::try_from(depth).unwrap_or(i64::MAX)
}

/// Accept connections until `cancel` fires, then wait for connection tasks to finish
/// their current command.
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>, cancel: CancellationToken) {
    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&ctx);
                        let cancel = cancel.clone();
                        tracker.spawn(async move {
                            handle_connection(ctx, stream, peer, cancel).await;
                        });
                    }
                    Err(e) => {
                        // transient (e.g. EMFILE); keep accepting
                        tracing::warn!(error = %e, "accept error");
                    }
                }
            }
        }
    }
    tracker.close();
    tracker.wait().await;
    tracing::info!("RESP listener stopped");
}

async fn handle_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let (conns, conns_origin) = ctx.connection_opened(peer.ip());
    tracing::info!(addr = %peer, conns, conns_origin, "connection established");

    let result = command_loop(&ctx, stream, peer, &cancel).await;

    let (conns, conns_origin) = ctx.connection_closed(peer.ip());
    match result {
        Ok(cause) => {
            tracing::info!(addr = %peer, conns, conns_origin, cause = %cause, "connection closed")
        }
        Err(e) => {
            tracing::info!(addr = %peer, conns, conns_origin, error = %e, "connection closed")
        }
    }
}

async fn command_loop(
    ctx: &ServerContext,
    mut stream: TcpStream,
    peer: SocketAddr,
    cancel: &CancellationToken,
) -> std::io::Result<CloseCause> {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut out = BytesMut::new();
    loop {
        // pipelined commands: run all complete frames, answer in one write
        let mut close = None;
        loop {
            match resp::parse_command(&mut buf) {
                Ok(Some(args)) => {
                    if args.is_empty() {
                        continue;
                    }
                    let (reply, quit) = ctx.execute(&args, peer).await;
                    reply.encode(&mut out);
                    if quit {
                        close = Some(CloseCause::Quit);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    Reply::Error(format!("ERR {}", e)).encode(&mut out);
                    close = Some(CloseCause::Protocol(e));
                    break;
                }
            }
        }
        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }
        if let Some(cause) = close {
            let _ = stream.shutdown().await;
            return Ok(cause);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(CloseCause::Shutdown),
            n = stream.read_buf(&mut buf) => {
                if n? == 0 {
                    return Ok(CloseCause::ClientEof);
                }
            }
        }
    }
}
