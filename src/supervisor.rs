//! Driver lifecycle: start/restart bookkeeping and the session epoch.

use crate::clock::Clock;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Upper bound of the restart backoff.
pub const RESTART_DELAY_MAX_MS: u64 = 600_000;
const BACKOFF_MAX_SHIFT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriverState {
    Idle,
    Starting,
    WaitHandshake,
    Running,
    RadioUp,
    /// Gave up after too many restarts or a fatal error.
    Stopped,
}

impl DriverState {
    pub fn name(self) -> &'static str {
        match self {
            DriverState::Idle => "Idle",
            DriverState::Starting => "Starting",
            DriverState::WaitHandshake => "WaitHandshake",
            DriverState::Running => "Running",
            DriverState::RadioUp => "RadioUp",
            DriverState::Stopped => "Stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStats {
    pub state: DriverState,
    pub restart_count: u32,
    pub restarts_requested: u64,
    pub epoch: u64,
    pub error: bool,
}

struct Inner {
    state: DriverState,
    restart_count: u32,
    restart_at: Option<u64>,
    restarts_requested: u64,
    error: bool,
}

pub struct Supervisor {
    inner: Mutex<Inner>,
    epoch: AtomicU64,
    clock: Arc<dyn Clock>,
    restart_ms: u64,
    restart_max: u32,
}

impl Supervisor {
    pub fn new(restart_ms: u64, restart_max: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: DriverState::Idle,
                restart_count: 0,
                restart_at: None,
                restarts_requested: 0,
                error: false,
            }),
            epoch: AtomicU64::new(0),
            clock,
            restart_ms,
            restart_max,
        }
    }

    pub fn state(&self) -> DriverState {
        self.inner.lock().state
    }

    pub fn is_radio_up(&self) -> bool {
        self.state() == DriverState::RadioUp
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Whether work started in `epoch` still belongs to the live session.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    pub fn stats(&self) -> SupervisorStats {
        let inner = self.inner.lock();
        SupervisorStats {
            state: inner.state,
            restart_count: inner.restart_count,
            restarts_requested: inner.restarts_requested,
            epoch: self.epoch(),
            error: inner.error,
        }
    }

    fn change_state(inner: &mut Inner, state: DriverState) {
        if inner.state != state {
            info!("Driver state changed {} -> {}", inner.state.name(), state.name());
            inner.state = state;
        }
    }

    /// Account for a start attempt. Returns false once restarts are
    /// exhausted or a fatal error was seen.
    pub fn begin_start(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.restart_at = None;
        if inner.state == DriverState::Stopped {
            return false;
        }
        if inner.error || inner.restart_count >= self.restart_max {
            error!(
                "Restart index reached maximum value {}. Giving up",
                self.restart_max
            );
            inner.error = true;
            Self::change_state(&mut inner, DriverState::Stopped);
            return false;
        }
        inner.restart_count += 1;
        Self::change_state(&mut inner, DriverState::Starting);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Starting session epoch {} attempt {}", epoch, inner.restart_count);
        Self::change_state(&mut inner, DriverState::WaitHandshake);
        true
    }

    /// The peer handshake arrived. Returns false when not expected.
    pub fn handshake_done(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == DriverState::WaitHandshake {
            Self::change_state(&mut inner, DriverState::Running);
            return true;
        }
        warn!("Handshake done in {} state", inner.state.name());
        false
    }

    /// Radio reported ready. Returns false outside Running.
    pub fn radio_ready(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == DriverState::Running {
            Self::change_state(&mut inner, DriverState::RadioUp);
            inner.restart_count = 0;
            return true;
        }
        warn!("Radio ready in {} state", inner.state.name());
        false
    }

    /// Back to Idle after a stop. A pending restart is kept.
    pub fn set_idle(&self) {
        let mut inner = self.inner.lock();
        if inner.state != DriverState::Stopped {
            Self::change_state(&mut inner, DriverState::Idle);
        }
    }

    /// Fatal error: no more restarts.
    pub fn set_fatal(&self) {
        let mut inner = self.inner.lock();
        inner.error = true;
        inner.restart_at = None;
        Self::change_state(&mut inner, DriverState::Stopped);
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == DriverState::Stopped
    }

    /// Delay before restart attempt `count`: doubles with each failed
    /// attempt, at most eight times the base delay.
    pub fn backoff_ms(&self, count: u32) -> u64 {
        let shift = count.saturating_sub(1).min(BACKOFF_MAX_SHIFT);
        (self.restart_ms << shift).min(RESTART_DELAY_MAX_MS)
    }

    /// Schedule a start. Returns the delay used, `None` when restarts are
    /// disabled.
    pub fn request_restart(&self, delay_ms: Option<u64>) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.error || inner.state == DriverState::Stopped {
            return None;
        }
        let delay = delay_ms.unwrap_or_else(|| self.backoff_ms(inner.restart_count));
        inner.restarts_requested += 1;
        inner.restart_at = Some(self.clock.now_ms() + delay);
        info!("Restart scheduled in {}ms", delay);
        Some(delay)
    }

    /// Whether a scheduled restart is due at `now`.
    pub fn restart_due(&self, now: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.restart_at {
            Some(at) if at <= now => {
                inner.restart_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn restart_pending(&self) -> bool {
        self.inner.lock().restart_at.is_some()
    }
}
