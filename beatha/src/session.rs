//! Session state shared by the loops and workflows.
//!
//! The mode is the only field with a real invariant: at most one workflow
//! (dump or pairing) runs at a time. Entering a workflow mode is a
//! check-and-set under one mutex and hands out a [`ModeGuard`]. Dropping the
//! guard, on success, error or unwinding panic alike, puts the session back
//! to [`Mode::Idle`] and releases the LEDs to the idle animation.
//!
//! Every other field is written last-writer-wins through its own short lock
//! or atomic.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use log::debug;

use crate::comm_log::CommLog;
use crate::dumps::DumpEntry;
use crate::error::{Error, Result};
use crate::protocol::firmware::FirmwareInfo;

/// Operating mode of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum Mode {
    /// Bridges may run, idle animation shown.
    #[default]
    Idle,
    /// Extraction in progress.
    Dumping,
    /// Bluetooth pairing window open.
    Pairing,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Dumping => write!(f, "DUMPING"),
            Self::Pairing => write!(f, "PAIRING"),
        }
    }
}

/// Shared session state.
#[derive(Debug)]
pub struct Session {
    mode: Mutex<Mode>,
    serial_port: RwLock<Option<String>>,
    baud_rate: AtomicU32,
    connected: AtomicBool,
    firmware_info: RwLock<Option<FirmwareInfo>>,
    latest_dump: RwLock<Option<DumpEntry>>,
    status_hold: AtomicBool,
    comm_log: CommLog,
}

impl Session {
    /// Create an idle, disconnected session.
    pub fn new(serial_port: Option<String>, baud_rate: u32) -> Self {
        Self {
            mode: Mutex::new(Mode::Idle),
            serial_port: RwLock::new(serial_port),
            baud_rate: AtomicU32::new(baud_rate),
            connected: AtomicBool::new(false),
            firmware_info: RwLock::new(None),
            latest_dump: RwLock::new(None),
            status_hold: AtomicBool::new(false),
            comm_log: CommLog::new(),
        }
    }

    fn lock_mode(&self) -> MutexGuard<'_, Mode> {
        self.mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        *self.lock_mode()
    }

    /// Whether the session is idle.
    pub fn is_idle(&self) -> bool {
        self.mode() == Mode::Idle
    }

    /// Atomically move from [`Mode::Idle`] into `mode`.
    ///
    /// Fails with [`Error::Busy`] carrying the active mode when the session
    /// is not idle. The returned guard restores idle when dropped.
    pub fn try_enter(self: &Arc<Self>, mode: Mode) -> Result<ModeGuard> {
        if mode == Mode::Idle {
            return Err(Error::Unsupported("IDLE is not a workflow mode".to_string()));
        }

        let mut current = self.lock_mode();
        if *current != Mode::Idle {
            return Err(Error::Busy(*current));
        }
        *current = mode;
        drop(current);

        debug!("Session IDLE -> {mode}");
        Ok(ModeGuard {
            session: Arc::clone(self),
            mode,
        })
    }

    /// Selected serial device path.
    pub fn serial_port(&self) -> Option<String> {
        self.serial_port
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Select a serial device path.
    pub fn set_serial_port(&self, port: Option<String>) {
        *self
            .serial_port
            .write()
            .unwrap_or_else(PoisonError::into_inner) = port;
    }

    /// Baud rate used for probes and bridges.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::Relaxed)
    }

    /// Change the baud rate.
    pub fn set_baud_rate(&self, baud_rate: u32) {
        self.baud_rate
            .store(baud_rate, Ordering::Relaxed);
    }

    /// Whether the selected device is present.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Adopt `port` as the connected device.
    ///
    /// Firmware info of any previous device is cleared.
    pub fn connect(&self, port: impl Into<String>, baud_rate: Option<u32>) {
        let port = port.into();
        debug!("Session connected to {port}");
        self.set_serial_port(Some(port));
        if let Some(baud) = baud_rate {
            self.set_baud_rate(baud);
        }
        self.set_firmware_info(None);
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Forget the connected device and its firmware info.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("Session disconnected");
        }
        self.set_serial_port(None);
        self.set_firmware_info(None);
    }

    /// Firmware identified on the connected device.
    pub fn firmware_info(&self) -> Option<FirmwareInfo> {
        self.firmware_info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store or clear the firmware info.
    pub fn set_firmware_info(&self, info: Option<FirmwareInfo>) {
        *self
            .firmware_info
            .write()
            .unwrap_or_else(PoisonError::into_inner) = info;
    }

    /// Metadata of the most recently written artifact.
    pub fn latest_dump(&self) -> Option<DumpEntry> {
        self.latest_dump
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the most recently written artifact.
    pub fn set_latest_dump(&self, entry: DumpEntry) {
        *self
            .latest_dump
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(entry);
    }

    /// Whether a workflow currently owns the LEDs.
    pub fn is_status_held(&self) -> bool {
        self.status_hold.load(Ordering::SeqCst)
    }

    /// Suppress or release the idle animation.
    pub fn set_status_hold(&self, hold: bool) {
        self.status_hold.store(hold, Ordering::SeqCst);
    }

    /// Communication log of the last serial conversation.
    pub fn comm_log(&self) -> &CommLog {
        &self.comm_log
    }
}

/// Proof that the session is in a workflow mode.
///
/// Dropping the guard returns the session to [`Mode::Idle`].
#[derive(Debug)]
#[must_use = "the session returns to IDLE as soon as the guard is dropped"]
pub struct ModeGuard {
    session: Arc<Session>,
    mode: Mode,
}

impl ModeGuard {
    /// Mode held by this guard.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Session the guard belongs to.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        *self.session.lock_mode() = Mode::Idle;
        self.session.set_status_hold(false);
        debug!("Session {} -> IDLE", self.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    use crate::protocol::firmware::FirmwareKind;

    fn session() -> Arc<Session> {
        Arc::new(Session::new(Some("/dev/ttyACM0".to_string()), 115_200))
    }

    #[test]
    fn test_enter_and_release() {
        let s = session();
        let guard = s.try_enter(Mode::Dumping).unwrap();
        assert_eq!(s.mode(), Mode::Dumping);
        assert_eq!(guard.mode(), Mode::Dumping);

        match s.try_enter(Mode::Pairing) {
            Err(Error::Busy(Mode::Dumping)) => {},
            other => panic!("expected Busy(DUMPING), got {other:?}"),
        }

        s.set_status_hold(true);
        drop(guard);
        assert!(s.is_idle());
        assert!(!s.is_status_held());
    }

    #[test]
    fn test_idle_is_not_enterable() {
        assert!(session().try_enter(Mode::Idle).is_err());
    }

    #[test]
    fn test_concurrent_enter_admits_one() {
        let s = session();
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let s = Arc::clone(&s);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mode = if i % 2 == 0 { Mode::Dumping } else { Mode::Pairing };
                    s.try_enter(mode)
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(Error::is_rejection));

        drop(results);
        assert!(s.is_idle());
    }

    #[test]
    fn test_panic_unwinding_restores_idle() {
        let s = session();
        let worker = Arc::clone(&s);
        let outcome = thread::spawn(move || {
            let _guard = worker.try_enter(Mode::Dumping).unwrap();
            worker.set_status_hold(true);
            panic!("workflow failed");
        })
        .join();

        assert!(outcome.is_err());
        assert!(s.is_idle());
        assert!(!s.is_status_held());
    }

    #[test]
    fn test_connect_and_disconnect_clear_firmware() {
        let s = session();
        let info = FirmwareInfo {
            kind: FirmwareKind::Betaflight,
            version: Some("4.4.0".to_string()),
            target: None,
            raw: String::new(),
        };

        s.connect("/dev/ttyACM1", Some(57_600));
        s.set_firmware_info(Some(info.clone()));
        assert!(s.is_connected());
        assert_eq!(s.baud_rate(), 57_600);
        assert_eq!(s.firmware_info(), Some(info.clone()));

        s.connect("/dev/ttyACM1", None);
        assert!(s.firmware_info().is_none());
        assert_eq!(s.baud_rate(), 57_600);

        s.set_firmware_info(Some(info));
        s.disconnect();
        assert!(!s.is_connected());
        assert!(s.serial_port().is_none());
        assert!(s.firmware_info().is_none());
    }
}
