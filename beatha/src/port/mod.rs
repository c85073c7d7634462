//! Serial port abstraction.
//!
//! The session manager never talks to `serialport` directly. It goes through
//! three small traits so every component above this layer can be exercised
//! with in-memory ports:
//!
//! - [`Port`]: an open byte stream with a read timeout.
//! - [`PortOpener`]: opens a [`Port`] for a path and baud rate.
//! - [`PortEnumerator`]: lists the serial devices currently present.
//!
//! ```text
//! +------------------+   +------------------+   +------------------+
//! |  CLI transport   |   |   Port scorer    |   | Hotplug monitor  |
//! +--------+---------+   +--------+---------+   +--------+---------+
//!          |                      |                      |
//!          v                      v                      v
//! +--------+---------+   +--------+----------------------+---------+
//! |   PortOpener     |   |            PortEnumerator               |
//! +--------+---------+   +--------+--------------------------------+
//!          |                      |
//!          v                      v
//! +--------+----------------------+---------+
//! |        native (serialport crate)        |
//! +-----------------------------------------+
//! ```
//!
//! An opened port is owned by value. Dropping it closes the device, so a
//! handle can never outlive the probe or extraction that opened it.

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Default baud rate of flight-controller CLIs over USB VCP.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout for a single `read` call.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_millis(100),
        }
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information as reported by the operating system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product/description string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Create a port entry with only a device path.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// An open serial byte stream.
pub trait Port: Read + Write + Send {
    /// Set the timeout of a single read call.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current read timeout.
    fn timeout(&self) -> Duration;

    /// Get the baud rate the port was opened with.
    fn baud_rate(&self) -> u32;

    /// Discard everything waiting in the input buffer.
    fn clear_input(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Opens serial ports.
pub trait PortOpener: Send + Sync {
    /// Open the port described by `config`.
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>>;
}

/// Lists available serial ports.
pub trait PortEnumerator: Send + Sync {
    /// List all serial ports currently present, in enumeration order.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;

    /// Whether a device with this path is currently present.
    fn is_present(&self, name: &str) -> bool {
        self.list_ports()
            .map(|ports| ports.iter().any(|p| p.name == name))
            .unwrap_or(false)
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator, NativePortOpener};

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory ports for unit tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// Scripted input: each chunk becomes readable `delay` after the port
    /// was opened.
    ///
    /// Replies are queued the moment the matching command line is written.
    #[derive(Clone, Default)]
    pub struct Script {
        pub chunks: Vec<(Duration, Vec<u8>)>,
        pub replies: Vec<(String, Vec<u8>)>,
    }

    impl Script {
        pub fn reply(mut self, command: &str, data: &[u8]) -> Self {
            self.replies.push((command.to_string(), data.to_vec()));
            self
        }

        pub fn chunk(mut self, at: Duration, data: &[u8]) -> Self {
            self.chunks.push((at, data.to_vec()));
            self
        }
    }

    pub struct MockPort {
        opened: Instant,
        pending: VecDeque<(Duration, Vec<u8>)>,
        replies: Vec<(String, Vec<u8>)>,
        line: Vec<u8>,
        ready: VecDeque<u8>,
        pub written: Arc<Mutex<Vec<u8>>>,
        timeout: Duration,
    }

    impl MockPort {
        pub fn new(script: Script) -> Self {
            Self {
                opened: Instant::now(),
                pending: script.chunks.into_iter().collect(),
                replies: script.replies,
                line: Vec::new(),
                ready: VecDeque::new(),
                written: Arc::new(Mutex::new(Vec::new())),
                timeout: Duration::from_millis(10),
            }
        }

        fn release_due(&mut self) {
            let elapsed = self.opened.elapsed();
            while self
                .pending
                .front()
                .is_some_and(|(at, _)| *at <= elapsed)
            {
                if let Some((_, data)) = self.pending.pop_front() {
                    self.ready.extend(data);
                }
            }
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.release_due();
            if self.ready.is_empty() {
                std::thread::sleep(self.timeout);
                self.release_due();
            }
            if self.ready.is_empty() {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.ready.len());
            for (slot, byte) in buf.iter_mut().zip(self.ready.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written
                .lock()
                .map_err(|_| std::io::Error::other("poisoned"))?
                .extend_from_slice(buf);
            for &byte in buf {
                if byte == b'\n' {
                    let line = String::from_utf8_lossy(&self.line).trim().to_string();
                    self.line.clear();
                    if let Some((_, reply)) = self.replies.iter().find(|(cmd, _)| *cmd == line) {
                        self.ready.extend(reply.iter().copied());
                    }
                } else {
                    self.line.push(byte);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Opener handing out a fresh [`MockPort`] per call.
    #[derive(Default)]
    pub struct MockOpener {
        pub script: Script,
        pub opens: std::sync::atomic::AtomicUsize,
        pub fail: bool,
    }

    impl MockOpener {
        pub fn new(script: Script) -> Self {
            Self {
                script,
                ..Self::default()
            }
        }

        pub fn open_count(&self) -> usize {
            self.opens.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl PortOpener for MockOpener {
        fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
            self.opens
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.fail {
                return Err(crate::error::Error::PortOpen {
                    port: config.port_name.clone(),
                    reason: "No such file or directory".to_string(),
                });
            }
            Ok(Box::new(MockPort::new(self.script.clone())))
        }
    }

    impl Port for MockPort {
        fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
            self.timeout = timeout.min(Duration::from_millis(10));
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn baud_rate(&self) -> u32 {
            DEFAULT_BAUD
        }

        fn clear_input(&mut self) -> Result<()> {
            self.release_due();
            self.ready.clear();
            Ok(())
        }

        fn name(&self) -> &str {
            "/dev/mock0"
        }
    }
}
