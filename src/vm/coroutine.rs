// Luno Coroutines
// Cooperative threads, each with its own saved execution state

use crate::vm::closure::Closure;
use crate::vm::ExecState;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    /// Not yet started, or parked at a yield.
    Suspended,
    /// The thread currently executing.
    Running,
    /// Alive but waiting on a coroutine it resumed.
    Normal,
    Dead,
}

impl CoStatus {
    pub fn name(self) -> &'static str {
        match self {
            CoStatus::Suspended => "suspended",
            CoStatus::Running => "running",
            CoStatus::Normal => "normal",
            CoStatus::Dead => "dead",
        }
    }
}

/// A coroutine: its body closure plus, while suspended, the frozen
/// execution state it will continue from.
pub struct Coroutine {
    pub body: Arc<Closure>,
    inner: Mutex<CoInner>,
}

struct CoInner {
    status: CoStatus,
    started: bool,
    /// Present exactly while the coroutine is suspended or normal.
    exec: Option<ExecState>,
}

impl Coroutine {
    pub fn new(body: Arc<Closure>) -> Arc<Self> {
        Arc::new(Self {
            body,
            inner: Mutex::new(CoInner {
                status: CoStatus::Suspended,
                started: false,
                exec: None,
            }),
        })
    }

    pub fn status(&self) -> CoStatus {
        self.inner.lock().status
    }

    pub fn set_status(&self, status: CoStatus) {
        self.inner.lock().status = status;
    }

    pub fn has_started(&self) -> bool {
        self.inner.lock().started
    }

    pub fn mark_started(&self) {
        self.inner.lock().started = true;
    }

    /// Take the frozen state for resumption; the coroutine must be
    /// suspended with state parked.
    pub fn take_exec(&self) -> Option<ExecState> {
        self.inner.lock().exec.take()
    }

    /// Park the state back at a yield.
    pub fn park_exec(&self, exec: ExecState) {
        self.inner.lock().exec = Some(exec);
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<coroutine {} ({})>", self.body.proto.name, self.status().name())
    }
}
