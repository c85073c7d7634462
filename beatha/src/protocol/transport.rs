//! Line-oriented request/response helper over a serial byte stream.
//!
//! Flight-controller CLIs have no framing and no end-of-response marker. The
//! transport therefore works with two bounded strategies:
//!
//! - [`CliTransport::probe`]: send one command and collect lines until a
//!   terminator keyword shows up or the timeout elapses.
//! - [`CliTransport::read_until_silence`]: stream everything the device
//!   prints and declare completion once it has been quiet for a while.
//!
//! Bytes that are not valid UTF-8 never fail a read. They are replaced with
//! `U+FFFD` and reported through the `binary` flag, which is how MAVLink
//! devices are told apart from text CLIs.

use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::comm_log::CommLog;
use crate::error::Result;
use crate::port::Port;

/// Sequence that wakes Betaflight/INAV into CLI mode.
pub const WAKE_SEQUENCE: &[u8] = b"#\r\n";

/// Pause between the wake sequence and clearing the input buffer.
pub const WAKE_SETTLE: Duration = Duration::from_millis(100);

/// Upper bound for a single blocking read.
const READ_SLICE: Duration = Duration::from_millis(50);

/// Result of a [`CliTransport::probe`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResponse {
    /// Complete and trailing partial lines, line terminators stripped.
    pub lines: Vec<String>,
    /// Whether any byte was received.
    pub received: bool,
    /// Whether non-UTF-8 bytes were observed.
    pub binary: bool,
    /// Whether a terminator keyword ended the probe early.
    pub terminated: bool,
}

impl ProbeResponse {
    /// All lines joined with `\n`.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Why a silence-bounded read finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The device stayed quiet for the silence window.
    Silence,
    /// The hard timeout was reached.
    Timeout,
}

/// Result of a [`CliTransport::read_until_silence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SilenceRead {
    /// Everything received, lines joined with `\n`.
    pub text: String,
    /// Number of raw bytes received.
    pub bytes: usize,
    /// Whether non-UTF-8 bytes were observed.
    pub binary: bool,
    /// How the read finished.
    pub completion: Completion,
    /// Total time spent reading.
    pub elapsed: Duration,
}

/// Timing policy of a silence-bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SilencePolicy {
    /// Hard ceiling for the whole read.
    pub timeout: Duration,
    /// Quiet period that ends the read once `min_bytes` arrived.
    pub silence: Duration,
    /// Bytes required before `silence` applies.
    pub min_bytes: usize,
    /// Quiet period that ends the read while fewer than `min_bytes` arrived.
    pub start_grace: Duration,
}

impl Default for SilencePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            silence: Duration::from_secs(2),
            min_bytes: 100,
            start_grace: Duration::from_secs(10),
        }
    }
}

impl SilencePolicy {
    fn window(&self, bytes: usize) -> Duration {
        if bytes >= self.min_bytes {
            self.silence
        } else {
            self.start_grace.max(self.silence)
        }
    }
}

/// Accumulates raw bytes and splits them into decoded lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
    binary: bool,
}

impl LineBuffer {
    fn extend(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Remove and decode every complete line.
    fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(self.decode(&raw[..pos]));
        }
        lines
    }

    /// Decode whatever is left without a line terminator.
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        let line = self.decode(&raw);
        (!line.is_empty()).then_some(line)
    }

    fn decode(&mut self, raw: &[u8]) -> String {
        let mut buf = raw.to_vec();
        let (text, invalid) = drain_utf8_lossy(&mut buf);
        if invalid || !buf.is_empty() {
            self.binary = true;
        }
        clean_line(&text)
    }
}

/// Drain a byte buffer into text, replacing invalid sequences with `U+FFFD`.
///
/// Returns the decoded text and whether any invalid sequence was replaced.
/// An incomplete UTF-8 suffix is left in `buffer`.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> (String, bool) {
    let mut output = String::new();
    let mut invalid = false;

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                    output.push_str(valid);
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        invalid = true;
                        output.push('\u{FFFD}');
                        let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        buffer.drain(..valid_up_to);
                        break;
                    },
                }
            },
        }
    }

    (output, invalid)
}

/// Strip `\r` and other control characters, keeping tabs.
pub fn clean_line(text: &str) -> String {
    text.chars()
        .filter(|&ch| ch == '\t' || !ch.is_control())
        .collect()
}

/// Whether `line` contains any of `keywords`, case-insensitively.
fn contains_any(line: &str, keywords: &[&str]) -> bool {
    let lower = line.to_lowercase();
    keywords
        .iter()
        .any(|kw| lower.contains(&kw.to_lowercase()))
}

/// Request/response helper bound to one open port and the session log.
pub struct CliTransport<'a> {
    port: &'a mut dyn Port,
    log: &'a CommLog,
}

impl<'a> CliTransport<'a> {
    /// Wrap an open port.
    pub fn new(port: &'a mut dyn Port, log: &'a CommLog) -> Self {
        Self { port, log }
    }

    /// Name of the underlying port.
    pub fn port_name(&self) -> &str {
        self.port.name()
    }

    /// Send one command line (`\r\n` appended) without reading.
    pub fn send_command(&mut self, command: &str) -> Result<()> {
        trace!("TX {command:?}");
        self.port
            .write_all_bytes(format!("{command}\r\n").as_bytes())?;
        self.log.tx(command);
        Ok(())
    }

    /// Wake the CLI, send `command` and collect the response.
    ///
    /// Stops early at the first line containing one of `terminators`
    /// (case-insensitive), otherwise after `timeout`.
    pub fn probe(
        &mut self,
        command: &str,
        terminators: &[&str],
        timeout: Duration,
    ) -> Result<ProbeResponse> {
        self.port.write_all_bytes(WAKE_SEQUENCE)?;
        self.log.tx("#");
        thread::sleep(WAKE_SETTLE);
        self.port.clear_input()?;
        self.send_command(command)?;

        let deadline = Instant::now() + timeout;
        let mut buffer = LineBuffer::default();
        let mut response = ProbeResponse::default();
        let mut chunk = [0u8; 256];

        while !response.terminated {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.port
                .set_timeout(READ_SLICE.min(deadline - now))?;

            match self.port.read(&mut chunk) {
                Ok(0) => {},
                Ok(n) => {
                    trace!("RX {n} bytes");
                    response.received = true;
                    buffer.extend(&chunk[..n]);
                },
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
                Err(e) => return Err(e.into()),
            }

            for line in buffer.drain_lines() {
                if contains_any(&line, terminators) {
                    response.terminated = true;
                }
                self.push_line(&mut response.lines, line);
            }
        }

        if let Some(line) = buffer.finish() {
            self.push_line(&mut response.lines, line);
        }
        response.binary = buffer.binary;

        debug!(
            "Probe {command:?}: {} lines, received={}, binary={}, terminated={}",
            response.lines.len(),
            response.received,
            response.binary,
            response.terminated
        );
        Ok(response)
    }

    /// Stream everything the device prints until it falls silent.
    pub fn read_until_silence(&mut self, policy: &SilencePolicy) -> Result<SilenceRead> {
        let start = Instant::now();
        let mut last_rx = start;
        let mut bytes = 0usize;
        let mut buffer = LineBuffer::default();
        let mut lines = Vec::new();
        let mut chunk = [0u8; 1024];

        let completion = loop {
            if start.elapsed() >= policy.timeout {
                break Completion::Timeout;
            }
            if last_rx.elapsed() >= policy.window(bytes) {
                break Completion::Silence;
            }
            self.port.set_timeout(READ_SLICE)?;

            match self.port.read(&mut chunk) {
                Ok(0) => {},
                Ok(n) => {
                    bytes += n;
                    last_rx = Instant::now();
                    buffer.extend(&chunk[..n]);
                    for line in buffer.drain_lines() {
                        self.push_line(&mut lines, line);
                    }
                },
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
                Err(e) => return Err(e.into()),
            }
        };

        if let Some(line) = buffer.finish() {
            self.push_line(&mut lines, line);
        }

        let read = SilenceRead {
            text: lines.join("\n"),
            bytes,
            binary: buffer.binary,
            completion,
            elapsed: start.elapsed(),
        };
        debug!(
            "Streaming read finished by {:?} after {:?} ({} bytes)",
            read.completion, read.elapsed, read.bytes
        );
        Ok(read)
    }

    /// Collect raw bytes for `window` without any line handling.
    pub fn read_raw(&mut self, window: Duration, max_bytes: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + window;
        let mut data = Vec::new();
        let mut chunk = [0u8; 512];

        while data.len() < max_bytes {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.port
                .set_timeout(READ_SLICE.min(deadline - now))?;
            match self.port.read(&mut chunk) {
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
                Err(e) => return Err(e.into()),
            }
        }

        data.truncate(max_bytes);
        self.log
            .info(format!("captured {} raw bytes", data.len()));
        Ok(data)
    }

    fn push_line(&self, lines: &mut Vec<String>, line: String) {
        if !line.is_empty() {
            self.log.rx(line.clone());
        }
        lines.push(line);
    }
}
