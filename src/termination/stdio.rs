//! Tracks completion of the three stdio streams of one child.
//!
//! Streams complete in any order and duplicate signals are ignored. The
//! all-closed callbacks fire exactly once. An optional timeout reports the
//! pending streams without preventing later completion.

use crate::events::StdioStream;
use crate::timer::TimerHandle;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// Snapshot of stream completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StdioMonitorStatus {
    pub completed: BTreeSet<StdioStream>,
    pub pending: BTreeSet<StdioStream>,
    pub is_complete: bool,
}

impl StdioMonitorStatus {
    fn from_completed(completed: &BTreeSet<StdioStream>) -> Self {
        let pending = StdioStream::ALL
            .iter()
            .copied()
            .filter(|s| !completed.contains(s))
            .collect::<BTreeSet<_>>();
        Self {
            completed: completed.clone(),
            is_complete: pending.is_empty(),
            pending,
        }
    }
}

pub type StatusCallback = Arc<dyn Fn(&StdioMonitorStatus) + Send + Sync>;
pub type StreamCallback = Arc<dyn Fn(StdioStream) + Send + Sync>;
pub type StreamErrorCallback = Arc<dyn Fn(StdioStream, &str) + Send + Sync>;

#[derive(Default)]
struct StdioInner {
    completed: BTreeSet<StdioStream>,
    errors: Vec<(StdioStream, String)>,
    all_closed_fired: bool,
    destroyed: bool,
    on_all_closed: Vec<StatusCallback>,
    on_stream_ended: Vec<StreamCallback>,
    on_error: Vec<StreamErrorCallback>,
    on_timeout: Vec<StatusCallback>,
    timer: Option<TimerHandle>,
}

/// Shared stdio completion tracker; clones observe the same state.
#[derive(Clone, Default)]
pub struct StdioMonitor {
    inner: Arc<Mutex<StdioInner>>,
}

/// Non-owning reference to a [`StdioMonitor`].
#[derive(Clone)]
pub struct WeakStdioMonitor {
    inner: Weak<Mutex<StdioInner>>,
}

impl WeakStdioMonitor {
    pub fn upgrade(&self) -> Option<StdioMonitor> {
        self.inner.upgrade().map(|inner| StdioMonitor { inner })
    }
}

impl StdioMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StdioInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn downgrade(&self) -> WeakStdioMonitor {
        WeakStdioMonitor {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn on_all_streams_closed(&self, callback: impl Fn(&StdioMonitorStatus) + Send + Sync + 'static) {
        self.lock().on_all_closed.push(Arc::new(callback));
    }

    pub fn on_stream_ended(&self, callback: impl Fn(StdioStream) + Send + Sync + 'static) {
        self.lock().on_stream_ended.push(Arc::new(callback));
    }

    pub fn on_error(&self, callback: impl Fn(StdioStream, &str) + Send + Sync + 'static) {
        self.lock().on_error.push(Arc::new(callback));
    }

    pub fn on_timeout(&self, callback: impl Fn(&StdioMonitorStatus) + Send + Sync + 'static) {
        self.lock().on_timeout.push(Arc::new(callback));
    }

    /// Record end/finish of a stream. Returns false for a duplicate.
    pub fn mark_ended(&self, stream: StdioStream) -> bool {
        let (ended, all_closed, status) = {
            let mut inner = self.lock();
            if inner.destroyed || !inner.completed.insert(stream) {
                return false;
            }
            let status = StdioMonitorStatus::from_completed(&inner.completed);
            let all_closed = if status.is_complete && !inner.all_closed_fired {
                inner.all_closed_fired = true;
                inner.timer = None;
                inner.on_all_closed.clone()
            } else {
                Vec::new()
            };
            (inner.on_stream_ended.clone(), all_closed, status)
        };

        tracing::trace!("Stdio stream {} ended", stream);
        for callback in &ended {
            callback(stream);
        }
        if status.is_complete {
            tracing::debug!("All stdio streams closed");
        }
        for callback in &all_closed {
            callback(&status);
        }
        true
    }

    /// Record a pipe error. Does not complete the stream.
    pub fn record_error(&self, stream: StdioStream, message: &str) {
        let callbacks = {
            let mut inner = self.lock();
            if inner.destroyed {
                return;
            }
            inner.errors.push((stream, message.to_string()));
            inner.on_error.clone()
        };
        tracing::warn!("Stdio stream {} error: {}", stream, message);
        for callback in &callbacks {
            callback(stream, message);
        }
    }

    /// Report pending streams if not complete after `timeout`.
    ///
    /// Replaces any earlier timeout. A no-op once complete.
    pub fn start_timeout(&self, timeout: Duration) {
        let weak = self.downgrade();
        let mut inner = self.lock();
        if inner.destroyed || inner.all_closed_fired {
            return;
        }
        inner.timer = Some(TimerHandle::after(timeout, async move {
            if let Some(monitor) = weak.upgrade() {
                monitor.fire_timeout();
            }
        }));
    }

    fn fire_timeout(&self) {
        let (callbacks, status) = {
            let inner = self.lock();
            if inner.destroyed || inner.all_closed_fired {
                return;
            }
            (
                inner.on_timeout.clone(),
                StdioMonitorStatus::from_completed(&inner.completed),
            )
        };
        tracing::warn!("Stdio streams still pending: {:?}", status.pending);
        for callback in &callbacks {
            callback(&status);
        }
    }

    pub fn status(&self) -> StdioMonitorStatus {
        StdioMonitorStatus::from_completed(&self.lock().completed)
    }

    pub fn is_complete(&self) -> bool {
        self.lock().completed.len() == StdioStream::ALL.len()
    }

    pub fn errors(&self) -> Vec<(StdioStream, String)> {
        self.lock().errors.clone()
    }

    /// Remove every callback and cancel the timeout.
    pub fn destroy(&self) {
        let mut inner = self.lock();
        inner.destroyed = true;
        inner.timer = None;
        inner.on_all_closed.clear();
        inner.on_stream_ended.clear();
        inner.on_error.clear();
        inner.on_timeout.clear();
    }
}
