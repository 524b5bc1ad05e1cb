use std::{
    fmt,
    sync::{
        Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// Which readiness predicate a wait blocks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitConnectedMode {
    /// Do not wait at all
    NoWait,
    Master,
    Slave,
    MasterOrSlave,
    MasterAndSlave,
}

impl WaitConnectedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitConnectedMode::NoWait => "no_wait",
            WaitConnectedMode::Master => "master",
            WaitConnectedMode::Slave => "slave",
            WaitConnectedMode::MasterOrSlave => "master_or_slave",
            WaitConnectedMode::MasterAndSlave => "master_and_slave",
        }
    }
}

impl fmt::Display for WaitConnectedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a one-shot readiness wait.
#[derive(Debug, Clone, Copy)]
pub struct RedisWaitConnected {
    pub mode: WaitConnectedMode,
    /// Return an error on expiry instead of proceeding degraded
    pub fail_on_timeout: bool,
    pub timeout: Duration,
}

impl Default for RedisWaitConnected {
    fn default() -> Self {
        Self {
            mode: WaitConnectedMode::Master,
            fail_on_timeout: false,
            timeout: Duration::from_secs(11),
        }
    }
}

/// Per-shard readiness gate with deadline-bounded waits.
///
/// The flags are flipped first and the mutex is taken (empty critical
/// section) before notifying; waiters re-check the predicate under the
/// lock. Either half alone would admit a lost wakeup between the flag load
/// and the wait.
#[derive(Default)]
pub struct ConnectedStatus {
    master_ready: AtomicBool,
    slave_ready: AtomicBool,
    mutex: Mutex<()>,
    cv: Condvar,
}

impl ConnectedStatus {
    pub fn set_master_ready(&self) {
        if !self.master_ready.swap(true, Ordering::SeqCst) {
            drop(self.mutex.lock().unwrap());
            self.cv.notify_all();
        }
    }

    pub fn set_slave_ready(&self) {
        if !self.slave_ready.swap(true, Ordering::SeqCst) {
            drop(self.mutex.lock().unwrap());
            self.cv.notify_all();
        }
    }

    pub fn master_ready(&self) -> bool {
        self.master_ready.load(Ordering::SeqCst)
    }

    pub fn slave_ready(&self) -> bool {
        self.slave_ready.load(Ordering::SeqCst)
    }

    /// Blocks the calling thread until the predicate for `mode` holds or
    /// `deadline` expires. Returns whether the predicate held.
    pub fn wait_ready(&self, deadline: Instant, mode: WaitConnectedMode) -> bool {
        match mode {
            WaitConnectedMode::NoWait => true,
            WaitConnectedMode::Master => self.wait(deadline, |s| s.master_ready()),
            WaitConnectedMode::Slave => self.wait(deadline, |s| s.slave_ready()),
            WaitConnectedMode::MasterOrSlave => {
                self.wait(deadline, |s| s.master_ready() || s.slave_ready())
            }
            WaitConnectedMode::MasterAndSlave => {
                self.wait(deadline, |s| s.master_ready() && s.slave_ready())
            }
        }
    }

    fn wait(&self, deadline: Instant, pred: impl Fn(&Self) -> bool) -> bool {
        let mut guard = self.mutex.lock().unwrap();
        loop {
            if pred(self) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return pred(self);
            }
            let (next_guard, timeout) = self.cv.wait_timeout(guard, deadline - now).unwrap();
            guard = next_guard;
            if timeout.timed_out() {
                return pred(self);
            }
        }
    }
}
