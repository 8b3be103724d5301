//! Record buffer between the RESP front end and the bulk dispatcher.
//!
//! Implementations: bounded in-memory channel (best-effort) and SQLite (durable, at-least-once).
//!
//! **Single-consumer assumption:** exactly one dispatcher drains a queue. The SQLite queue
//! re-reads the oldest rows until they are committed, so two consumers would deliver twice.

use crate::config::{QueueBackend, QueueConfig};
use crate::record::Record;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

/// File name of the durable queue inside `queue.dir`.
pub const QUEUE_DB_FILE: &str = "queue.db";

/// Why a record was not accepted.
#[derive(Debug)]
pub enum QueueError {
    /// Bound reached; the caller reports backpressure.
    Full,
    Closed,
    Storage(anyhow::Error),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Full => write!(f, "queue full"),
            QueueError::Closed => write!(f, "queue closed"),
            QueueError::Storage(e) => write!(f, "queue storage: {}", e),
        }
    }
}

impl std::error::Error for QueueError {}

/// Records handed to the dispatcher. Durable batches remember the last row they cover.
#[derive(Debug, Default)]
pub struct Batch {
    pub records: Vec<Record>,
    last_id: Option<i64>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            last_id: None,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True when committing would acknowledge stored rows, even if none decoded.
    pub fn holds_rows(&self) -> bool {
        self.last_id.is_some()
    }
}

/// FIFO record queue. Must be Send + Sync; shared between connection tasks and the dispatcher.
#[async_trait]
pub trait RecordQueue: Send + Sync {
    /// Enqueue one record. Never blocks on a full queue; returns `QueueError::Full` instead.
    async fn put(&self, record: Record) -> Result<(), QueueError>;

    /// Records currently buffered (not yet committed for the durable queue).
    fn depth(&self) -> u64;

    /// Wait until `max` records are available or `wait` elapsed; return up to `max` oldest records.
    async fn next_batch(&self, max: usize, wait: Duration) -> anyhow::Result<Batch>;

    /// Acknowledge a delivered (or deliberately dropped) batch.
    async fn commit(&self, batch: Batch) -> anyhow::Result<()>;

    fn is_durable(&self) -> bool;

    /// Stop accepting records. Buffered records stay readable.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Open the queue selected by `queue.backend`.
pub fn open(config: &QueueConfig) -> anyhow::Result<Arc<dyn RecordQueue>> {
    match config.backend {
        QueueBackend::Memory => Ok(Arc::new(MemoryQueue::new(config.capacity))),
        QueueBackend::Durable => {
            std::fs::create_dir_all(&config.dir)
                .map_err(|e| anyhow::anyhow!("create queue dir {:?}: {}", config.dir, e))?;
            let q = SqliteQueue::open(&config.dir.join(QUEUE_DB_FILE), config.max_depth)?;
            Ok(Arc::new(q))
        }
    }
}

/// Bounded in-memory queue. Records leave the queue when drained; a failed delivery loses them.
pub struct MemoryQueue {
    tx: mpsc::Sender<Record>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Record>>,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RecordQueue for MemoryQueue {
    async fn put(&self, record: Record) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        self.tx.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    fn depth(&self) -> u64 {
        (self.tx.max_capacity() - self.tx.capacity()) as u64
    }

    async fn next_batch(&self, max: usize, wait: Duration) -> anyhow::Result<Batch> {
        let deadline = Instant::now() + wait;
        let mut rx = self.rx.lock().await;
        let mut records = Vec::with_capacity(max.min(self.tx.max_capacity()));
        while records.len() < max {
            let remaining = max - records.len();
            // the inner future is polled before the deadline, so a zero wait still drains
            match tokio::time::timeout_at(deadline, rx.recv_many(&mut records, remaining)).await
            {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        Ok(Batch::new(records))
    }

    async fn commit(&self, _batch: Batch) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// SQLite-backed FIFO. Table: (id, body) with body = record JSON.
/// Uses spawn_blocking so rusqlite's sync API doesn't block the async runtime.
pub struct SqliteQueue {
    conn: Arc<Mutex<rusqlite::Connection>>,
    depth: Arc<AtomicU64>,
    max_depth: Option<u64>,
    ready: Notify,
    closed: AtomicBool,
}

impl SqliteQueue {
    /// Open or create DB at path; creates the queue table if missing and counts the backlog.
    pub fn open(path: &Path, max_depth: Option<u64>) -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| anyhow::anyhow!("open sqlite {:?}: {}", path, e))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| anyhow::anyhow!("enable wal: {}", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| anyhow::anyhow!("set synchronous: {}", e))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS xlogd_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                body TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| anyhow::anyhow!("init sqlite: {}", e))?;
        let backlog: i64 = conn
            .query_row("SELECT COUNT(*) FROM xlogd_queue", [], |row| row.get(0))
            .map_err(|e| anyhow::anyhow!("count queue: {}", e))?;
        if backlog > 0 {
            tracing::info!(backlog, path = %path.display(), "durable queue has pending records");
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            depth: Arc::new(AtomicU64::new(backlog as u64)),
            max_depth,
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    async fn read_oldest(&self, max: usize) -> anyhow::Result<Batch> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let c = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("queue lock poisoned"))?;
            let mut stmt = c.prepare("SELECT id, body FROM xlogd_queue ORDER BY id LIMIT ?1")?;
            let rows = stmt.query_map([max as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut batch = Batch::default();
            for row in rows {
                let (id, body) = row?;
                batch.last_id = Some(id);
                match serde_json::from_str::<Record>(&body) {
                    Ok(r) => batch.records.push(r),
                    Err(e) => tracing::warn!(id, error = %e, "skipping undecodable queue row"),
                }
            }
            Ok::<_, anyhow::Error>(batch)
        })
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking: {}", e))?
    }
}

#[async_trait]
impl RecordQueue for SqliteQueue {
    async fn put(&self, record: Record) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let body = serde_json::to_string(&record).map_err(|e| QueueError::Storage(e.into()))?;
        // reserve the slot before inserting so concurrent puts cannot overshoot the bound
        let max = self.max_depth.unwrap_or(u64::MAX);
        self.depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| (d < max).then_some(d + 1))
            .map_err(|_| QueueError::Full)?;
        let conn = self.conn.clone();
        let inserted = tokio::task::spawn_blocking(move || {
            let c = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("queue lock poisoned"))?;
            c.execute("INSERT INTO xlogd_queue (body) VALUES (?1)", [&body])?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking: {}", e))
        .and_then(|r| r);
        if let Err(e) = inserted {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(QueueError::Storage(e));
        }
        self.ready.notify_one();
        Ok(())
    }

    fn depth(&self) -> u64 {
        self.depth.load(Ordering::Acquire)
    }

    async fn next_batch(&self, max: usize, wait: Duration) -> anyhow::Result<Batch> {
        let deadline = Instant::now() + wait;
        while self.depth() < max as u64 && Instant::now() < deadline {
            let _ = tokio::time::timeout_at(deadline, self.ready.notified()).await;
        }
        if self.depth() == 0 {
            return Ok(Batch::default());
        }
        self.read_oldest(max).await
    }

    async fn commit(&self, batch: Batch) -> anyhow::Result<()> {
        let Some(last_id) = batch.last_id else {
            return Ok(());
        };
        let conn = self.conn.clone();
        let deleted = tokio::task::spawn_blocking(move || {
            let c = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("queue lock poisoned"))?;
            let n = c.execute("DELETE FROM xlogd_queue WHERE id <= ?1", [last_id])?;
            Ok::<_, anyhow::Error>(n)
        })
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking: {}", e))??;
        // saturating: a concurrent open of the same file is unsupported but must not wrap
        let _ = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_sub(deleted as u64))
            });
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::Release);
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let c = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("queue lock poisoned"))?;
            c.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking: {}", e))?
    }
}
