//! Deterministic state-machine runtime
//!
//! Every worker is a single-threaded loop over states. A state is an id,
//! a human-readable description and an action that receives the worker's
//! mutable context and returns the next state. Equality is by id only.
//!
//! Id conventions: 1xx initialization, 2xx steady state, 3xx acquisition,
//! 4xx restart, 8xx shutdown, 9xx errors. Every fatal error state leads
//! into the shutdown chain so the process always terminates cleanly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use tracing::{debug, info};

/// One state of a worker machine over context `S`
pub struct State<S> {
    pub id: u32,
    pub description: &'static str,
    pub action: fn(&mut S) -> State<S>,
}

impl<S> Clone for State<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for State<S> {}

impl<S> PartialEq for State<S> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<S> Eq for State<S> {}

impl<S> std::fmt::Debug for State<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "State({}, {})", self.id, self.description)
    }
}

impl<S> std::fmt::Display for State<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description)
    }
}

/// Register `SIGINT`/`SIGTERM`/`SIGHUP` onto a process-global terminate
/// flag. The driver reads and clears the flag once per tick.
pub fn register_terminate_flag() -> std::io::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM, SIGHUP] {
        signal_hook::flag::register(signal, Arc::clone(&flag))?;
    }
    Ok(flag)
}

/// Drive a worker machine until it reaches `stop`.
///
/// Each tick: the terminate flag is read and cleared, forcing
/// `shutdown_entry` so the shutdown path runs to completion; then the
/// current action runs and the loop sleeps for `base_period`.
pub fn run<S>(
    initial: State<S>,
    shutdown_entry: State<S>,
    stop: State<S>,
    context: &mut S,
    terminate: &AtomicBool,
    base_period: Duration,
) {
    let mut current = initial;

    loop {
        if terminate.swap(false, Ordering::Relaxed) {
            info!(state = %current, "terminate requested, entering shutdown chain");
            current = shutdown_entry;
        }

        if current == stop {
            break;
        }

        debug!(id = current.id, state = %current, "state step");
        current = (current.action)(context);

        thread::sleep(base_period);
    }
}
