use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bson::Document;
use runnel_oplog::{CancelToken, Topology};
use runnel_query::parse_filter;
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::merge::MergeCoordinator;
use crate::rewrite::{CompiledFilter, compile};
use crate::shard_cursor::StartPoint;
use crate::stream::{Batch, ChangeStream, StreamItem, StreamStatus};
use crate::token::ResumeToken;
use crate::watch::{StartPosition, StreamOptions, Target, WatchScope};

pub type CursorId = u64;

struct CursorEntry {
    stream: Mutex<ChangeStream>,
    cancel: CancelToken,
    last_used: Mutex<Instant>,
}

struct ManagerInner {
    topology: Arc<dyn Topology>,
    config: StreamConfig,
    cursors: Mutex<HashMap<CursorId, Arc<CursorEntry>>>,
    next_id: AtomicU64,
}

/// Owns every open change stream and hands out cursor ids for them.
///
/// Each cursor is served by one caller at a time; a second concurrent call
/// fails with [`StreamError::CursorInUse`] instead of queueing. Cursors idle
/// for longer than `cursor_idle_timeout_ms` are closed by a background
/// thread.
pub struct CursorManager {
    inner: Arc<ManagerInner>,
    reaper: Option<ReaperHandle>,
}

impl CursorManager {
    pub fn new(topology: Arc<dyn Topology>, config: StreamConfig) -> Result<Self, StreamError> {
        config.validate()?;
        let inner = Arc::new(ManagerInner {
            topology,
            config,
            cursors: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        let reaper = spawn_reaper(Arc::clone(&inner));
        Ok(Self { inner, reaper })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn topology(&self) -> Arc<dyn Topology> {
        Arc::clone(&self.inner.topology)
    }

    // ── Open ────────────────────────────────────────────────────

    pub fn open_stream(&self, options: StreamOptions) -> Result<CursorId, StreamError> {
        self.validate(&options)?;
        let filter = self.compile(&options)?;
        let start = self.resolve_start(&options.start)?;
        let merge = MergeCoordinator::open(
            Arc::clone(&self.inner.topology),
            &options,
            Arc::new(filter),
            start,
            &self.inner.config,
        )?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(CursorEntry {
            stream: Mutex::new(ChangeStream::new(merge)),
            cancel: CancelToken::new(),
            last_used: Mutex::new(Instant::now()),
        });
        self.inner.cursors.lock().unwrap().insert(id, entry);
        debug!(cursor = id, scope = ?options.scope, "change stream opened");
        Ok(id)
    }

    /// The compiled form of a stream's filter, without opening it.
    pub fn explain(&self, options: &StreamOptions) -> Result<Document, StreamError> {
        self.validate(options)?;
        Ok(self.compile(options)?.explain())
    }

    fn compile(&self, options: &StreamOptions) -> Result<CompiledFilter, StreamError> {
        let expr = parse_filter(&options.filter)?;
        Ok(compile(
            &expr,
            &options.scope,
            options.collation.as_ref(),
            self.inner.config.pushdown_enabled,
        ))
    }

    fn validate(&self, options: &StreamOptions) -> Result<(), StreamError> {
        match &options.scope {
            WatchScope::Collection(ns) if ns.coll.is_none() => {
                return Err(StreamError::InvalidOptions(format!("{ns} is not a collection")));
            }
            WatchScope::Collection(ns) if ns.is_internal() => {
                return Err(StreamError::InvalidOptions(format!("cannot watch internal namespace {ns}")));
            }
            WatchScope::Database(db) if ["admin", "config", "local"].contains(&db.as_str()) => {
                return Err(StreamError::InvalidOptions(format!("cannot watch internal database {db}")));
            }
            _ => {}
        }
        if options.allow_topology_events && !options.scope.is_cluster() {
            return Err(StreamError::InvalidOptions(
                "topology events are only available to cluster-wide streams".into(),
            ));
        }
        if let Target::Shard(shard) = &options.target {
            if self.inner.topology.source(shard).is_err() {
                return Err(StreamError::InvalidOptions(format!("unknown shard {shard}")));
            }
        }
        Ok(())
    }

    fn resolve_start(&self, start: &StartPosition) -> Result<StartPoint, StreamError> {
        Ok(match start {
            StartPosition::Now => StartPoint::after(self.inner.topology.cluster_time()),
            StartPosition::AtClusterTime(ts) => StartPoint::after(ts.prev()),
            StartPosition::ResumeAfter(token) if token.from_invalidate => {
                return Err(StreamError::Invalidated(
                    "cannot resume after an invalidate; use start after instead".into(),
                ));
            }
            StartPosition::ResumeAfter(token) | StartPosition::StartAfter(token) => start_after_token(token),
        })
    }

    // ── Read ────────────────────────────────────────────────────

    pub fn get_next(&self, id: CursorId, max_wait: Option<Duration>) -> Result<StreamItem, StreamError> {
        let max_wait = max_wait.unwrap_or_else(|| self.inner.config.default_max_wait());
        self.with_stream(id, |stream, cancel| {
            let item = stream.get_next(max_wait, cancel)?;
            let finished = matches!(item, StreamItem::Invalidated(_));
            Ok((item, finished))
        })
    }

    pub fn get_more(&self, id: CursorId, batch_size: Option<usize>, max_wait: Option<Duration>) -> Result<Batch, StreamError> {
        let batch_size = batch_size.unwrap_or(self.inner.config.max_batch_size);
        let max_wait = max_wait.unwrap_or_else(|| self.inner.config.default_max_wait());
        self.with_stream(id, |stream, cancel| {
            let batch = stream.get_more(batch_size, max_wait, cancel)?;
            let finished = batch.invalidated;
            Ok((batch, finished))
        })
    }

    pub fn status(&self, id: CursorId) -> Result<StreamStatus, StreamError> {
        let entry = self.lookup(id)?;
        let stream = entry.stream.try_lock().map_err(|_| StreamError::CursorInUse(id))?;
        Ok(stream.status())
    }

    /// Run `f` with exclusive access to the cursor's stream. The cursor is
    /// removed when `f` reports the stream finished or fails with an error
    /// the cursor cannot survive.
    fn with_stream<T>(
        &self,
        id: CursorId,
        f: impl FnOnce(&mut ChangeStream, &CancelToken) -> Result<(T, bool), StreamError>,
    ) -> Result<T, StreamError> {
        let entry = self.lookup(id)?;
        let mut stream = entry.stream.try_lock().map_err(|_| StreamError::CursorInUse(id))?;
        entry.cancel.reset();
        *entry.last_used.lock().unwrap() = Instant::now();

        let result = f(&mut stream, &entry.cancel);
        *entry.last_used.lock().unwrap() = Instant::now();
        match result {
            Ok((value, finished)) => {
                if finished {
                    debug!(cursor = id, "change stream invalidated");
                    self.inner.remove(id);
                }
                Ok(value)
            }
            Err(err) => {
                if !err.keeps_cursor() {
                    debug!(cursor = id, error = %err, "change stream failed");
                    self.inner.remove(id);
                }
                Err(err)
            }
        }
    }

    fn lookup(&self, id: CursorId) -> Result<Arc<CursorEntry>, StreamError> {
        self.inner
            .cursors
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StreamError::CursorNotFound(id))
    }

    // ── Close ───────────────────────────────────────────────────

    pub fn close_stream(&self, id: CursorId) -> Result<(), StreamError> {
        let entry = self.inner.remove(id).ok_or(StreamError::CursorNotFound(id))?;
        entry.cancel.kill();
        debug!(cursor = id, "change stream closed");
        Ok(())
    }

    /// Destroy a cursor, waking any call blocked on it.
    pub fn kill_cursor(&self, id: CursorId) -> Result<(), StreamError> {
        let entry = self.inner.remove(id).ok_or(StreamError::CursorNotFound(id))?;
        entry.cancel.kill();
        warn!(cursor = id, "cursor killed");
        Ok(())
    }

    /// Wake a blocked call on the cursor without destroying it. The call
    /// fails with `Interrupted`; the next call resumes where it left off.
    pub fn interrupt_cursor(&self, id: CursorId) -> Result<(), StreamError> {
        self.lookup(id)?.cancel.interrupt();
        Ok(())
    }

    pub fn cursor_count(&self) -> usize {
        self.inner.cursors.lock().unwrap().len()
    }

    /// Close cursors idle past the configured timeout. Returns how many were
    /// closed.
    pub fn reap_idle(&self) -> usize {
        self.inner.reap_idle()
    }

    /// Kill every open cursor, waking any blocked callers.
    pub fn kill_all(&self) -> usize {
        let cursors: Vec<_> = self.inner.cursors.lock().unwrap().drain().collect();
        for (_, entry) in &cursors {
            entry.cancel.kill();
        }
        cursors.len()
    }

    pub fn shutdown(&mut self) {
        if let Some(mut reaper) = self.reaper.take() {
            reaper.stop();
        }
        self.kill_all();
    }
}

impl Drop for CursorManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ManagerInner {
    fn remove(&self, id: CursorId) -> Option<Arc<CursorEntry>> {
        self.cursors.lock().unwrap().remove(&id)
    }

    fn reap_idle(&self) -> usize {
        let timeout = self.config.cursor_idle_timeout();
        let mut cursors = self.cursors.lock().unwrap();
        let idle: Vec<CursorId> = cursors
            .iter()
            .filter(|(_, entry)| {
                // A cursor with a call in flight is not idle.
                entry.stream.try_lock().is_ok() && entry.last_used.lock().unwrap().elapsed() >= timeout
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &idle {
            if let Some(entry) = cursors.remove(id) {
                entry.cancel.kill();
                warn!(cursor = id, timeout_ms = self.config.cursor_idle_timeout_ms, "reaped idle cursor");
            }
        }
        idle.len()
    }
}

fn start_after_token(token: &ResumeToken) -> StartPoint {
    if token.frontier {
        StartPoint::after(token.cluster_time)
    } else {
        StartPoint {
            after: token.cluster_time.prev(),
            skip_through: Some(token.clone()),
        }
    }
}

// ── Idle cursor reaper ──────────────────────────────────────────

struct ReaperHandle {
    shutdown: Arc<AtomicBool>,
    notify: Arc<(Mutex<()>, Condvar)>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ReaperHandle {
    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.1.notify_one();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Returns `None` when `reaper_interval_ms` is zero (no reaping).
fn spawn_reaper(inner: Arc<ManagerInner>) -> Option<ReaperHandle> {
    if inner.config.reaper_interval_ms == 0 {
        return None;
    }
    let shutdown = Arc::new(AtomicBool::new(false));
    let notify = Arc::new((Mutex::new(()), Condvar::new()));
    let reaper_flag = Arc::clone(&shutdown);
    let reaper_notify = Arc::clone(&notify);
    let interval = inner.config.reaper_interval();
    let handle = thread::spawn(move || {
        loop {
            let (lock, cvar) = &*reaper_notify;
            let guard = lock.lock().unwrap();
            let _ = cvar.wait_timeout(guard, interval).unwrap();
            if reaper_flag.load(Ordering::Relaxed) {
                break;
            }
            inner.reap_idle();
        }
    });
    Some(ReaperHandle {
        shutdown,
        notify,
        handle: Some(handle),
    })
}
