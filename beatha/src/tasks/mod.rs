//! Background loops.
//!
//! Every loop runs on its own named OS thread and checks the shared
//! shutdown flag at least once per [`SHUTDOWN_SLICE`]:
//!
//! - [`hotplug`]: serial device arrival and removal
//! - [`buttons`]: debounced dump and pair buttons
//! - [`animation`]: idle breathing on the LED strip
//! - [`supervise`]: one per bridge, see [`crate::proxy`]

pub mod animation;
pub mod buttons;
pub mod hotplug;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;

use crate::error::Result;
use crate::proxy::ProxySupervisor;
use crate::session::Session;

/// Longest uninterrupted sleep of any loop.
pub const SHUTDOWN_SLICE: Duration = Duration::from_millis(50);

/// Sleep for `duration` unless `shutdown` is raised first.
///
/// Returns `false` when woken by shutdown.
pub fn sleep_unless(shutdown: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SHUTDOWN_SLICE.min(deadline - now));
    }
}

/// Spawn a named thread.
pub fn spawn_named<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(f)?;
    debug!("Started thread '{name}'");
    Ok(handle)
}

/// Reconcile one bridge every `interval` until shutdown.
pub fn supervise(supervisor: &ProxySupervisor, session: &Session, interval: Duration, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        supervisor.reconcile(session);
        if !sleep_unless(shutdown, interval) {
            break;
        }
    }
    debug!("{} supervisor stopped", supervisor.kind());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sleep_unless_completes() {
        let flag = AtomicBool::new(false);
        let start = Instant::now();
        assert!(sleep_unless(&flag, Duration::from_millis(120)));
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn test_sleep_unless_wakes_on_shutdown() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&flag);
        let handle = spawn_named("test-shutdown", move || {
            thread::sleep(Duration::from_millis(100));
            setter.store(true, Ordering::SeqCst);
        })
        .unwrap();

        let start = Instant::now();
        assert!(!sleep_unless(&flag, Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }
}
