//! TCP and Bluetooth serial bridges.
//!
//! A bridge is an external process holding the serial device open, so it
//! must never run while a workflow talks to the device. Each
//! [`ProxySupervisor`] is polled by its own loop and converges the child
//! process towards the desired state:
//!
//! | mode | connected | port | enabled | bridge   |
//! |------|-----------|------|---------|----------|
//! | IDLE | yes       | yes  | yes     | running  |
//! | any other combination              || stopped  |
//!
//! The child slot is locked for the whole reconcile and for [`ProxySupervisor::stop`],
//! and the session is read after taking the lock. Once a workflow has left
//! IDLE and called `stop`, no later reconcile can start the bridge again.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};

use crate::process::{ChildProcess, Spawner, stop_process};
use crate::session::Session;

/// Which bridge a supervisor manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeKind {
    /// `socat` TCP listener.
    Tcp,
    /// `rfcomm` + `socat` Bluetooth SPP bridge.
    Bluetooth,
}

impl fmt::Display for BridgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Bluetooth => write!(f, "Bluetooth"),
        }
    }
}

/// Default TCP bridge command line.
pub fn default_tcp_command() -> Vec<String> {
    to_argv(&[
        "socat",
        "TCP-LISTEN:{tcp_port},fork,reuseaddr",
        "FILE:{port},b{baud},raw,echo=0",
    ])
}

/// Default Bluetooth bridge command line.
pub fn default_bluetooth_command() -> Vec<String> {
    to_argv(&[
        "rfcomm",
        "watch",
        "/dev/rfcomm0",
        "1",
        "socat",
        "/dev/rfcomm0,raw,echo=0",
        "FILE:{port},b{baud},raw,echo=0",
    ])
}

fn to_argv(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

/// Substitute `{port}`, `{baud}` and `{tcp_port}` in every argument.
pub fn render_command(template: &[String], port: &str, baud: u32, tcp_port: u16) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{port}", port)
                .replace("{baud}", &baud.to_string())
                .replace("{tcp_port}", &tcp_port.to_string())
        })
        .collect()
}

/// Static bridge settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSpec {
    /// Which bridge.
    pub kind: BridgeKind,
    /// Whether the bridge may run at all.
    pub enabled: bool,
    /// Command line template.
    pub command: Vec<String>,
    /// Value of `{tcp_port}`.
    pub tcp_port: u16,
    /// Grace period between SIGTERM and SIGKILL.
    pub grace: Duration,
}

/// Keeps one bridge process in line with the session state.
pub struct ProxySupervisor {
    spec: BridgeSpec,
    spawner: Arc<dyn Spawner>,
    child: Mutex<Option<Box<dyn ChildProcess>>>,
    running: AtomicBool,
}

impl fmt::Debug for ProxySupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySupervisor")
            .field("spec", &self.spec)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ProxySupervisor {
    /// Create a supervisor with no process.
    pub fn new(spec: BridgeSpec, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            spec,
            spawner,
            child: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Bridge kind.
    pub fn kind(&self) -> BridgeKind {
        self.spec.kind
    }

    /// Whether a bridge process was running at the last check.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn slot(&self) -> MutexGuard<'_, Option<Box<dyn ChildProcess>>> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// One supervision step: reap, then start or stop as required.
    pub fn reconcile(&self, session: &Session) {
        let mut slot = self.slot();

        if slot.as_mut().is_some_and(|c| !c.is_alive()) {
            warn!("{} bridge exited unexpectedly", self.spec.kind);
            *slot = None;
        }

        let port = session.serial_port();
        let wanted = self.spec.enabled && session.is_idle() && session.is_connected() && port.is_some();

        match (wanted, slot.is_some(), port) {
            (true, false, Some(port)) => {
                let argv = render_command(
                    &self.spec.command,
                    &port,
                    session.baud_rate(),
                    self.spec.tcp_port,
                );
                match self.spawner.spawn(&argv) {
                    Ok(child) => {
                        info!("{} bridge started on {port} (pid {})", self.spec.kind, child.id());
                        *slot = Some(child);
                    },
                    Err(e) => warn!("Failed to start {} bridge: {e}", self.spec.kind),
                }
            },
            (false, true, _) => {
                debug!("{} bridge no longer allowed, stopping", self.spec.kind);
                stop_process(&mut slot, self.spec.grace);
            },
            _ => {},
        }

        self.running
            .store(slot.is_some(), Ordering::SeqCst);
    }

    /// Stop the bridge now. Returns whether one was running.
    pub fn stop(&self) -> bool {
        let mut slot = self.slot();
        let stopped = stop_process(&mut slot, self.spec.grace);
        self.running.store(false, Ordering::SeqCst);
        if stopped {
            info!("{} bridge stopped", self.spec.kind);
        }
        stopped
    }
}
