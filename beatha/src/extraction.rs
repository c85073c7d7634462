//! Configuration dump extraction.
//!
//! One attempt, start to finish, on a port nobody else holds:
//!
//! 1. open the port and probe `version`
//! 2. no signature: write a diagnostic report instead of a dump
//! 3. ArduPilot: record the probe and listen for a MAVLink heartbeat
//! 4. text CLI: read the craft name, send `status`, `resource` and
//!    `dump all`, then stream until the device falls silent
//! 5. close the port, persist, optionally upload
//!
//! The LEDs follow the attempt step by step: LED0 connecting, LED1 reading,
//! LED2 saving, LED3 result. Mode handling and bridge shutdown belong to the
//! caller; this module never retries.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Local;
use log::{debug, info, warn};

use crate::dumps::{
    DumpEntry, DumpStore, UNKNOWN_DEVICE_DIR, artifact_dir_name, diagnostic_file_name,
    dump_file_name,
};
use crate::error::{Error, Result};
use crate::hardware::{Hardware, Rgb};
use crate::port::{PortOpener, SerialConfig};
use crate::process::CommandRunner;
use crate::protocol::firmware::{
    self, FirmwareInfo, FirmwareKind, Identification, VERSION_COMMAND, VERSION_TERMINATORS,
};
use crate::protocol::mavlink::{self, Heartbeat};
use crate::protocol::transport::{CliTransport, Completion, ProbeResponse};
use crate::session::Session;
use crate::settings::Timing;

/// Commands sent to a text CLI, in order.
pub const EXTRACTION_COMMANDS: &[&str] = &["status", "resource", "dump all"];

/// LED showing the connection step.
pub const LED_CONNECT: usize = 0;
/// LED showing the read step.
pub const LED_READ: usize = 1;
/// LED showing the save step.
pub const LED_SAVE: usize = 2;
/// LED showing the final result.
pub const LED_RESULT: usize = 3;

const CHECKLIST: &[&str] = &[
    "Wrong baud rate (Betaflight/INAV use 115200 over USB)",
    "Flight controller not in CLI/MSP mode (another tool may hold the port)",
    "Unsupported firmware",
    "Flight controller not powered (some boards need a battery for the MCU)",
];

/// Hands a finished artifact to cloud storage.
pub trait Uploader: Send + Sync {
    /// Upload one file.
    fn upload(&self, file: &Path) -> Result<()>;
}

/// Uploads with `rclone copy <file> <remote>`.
pub struct RcloneUploader {
    runner: Arc<dyn CommandRunner>,
    remote: String,
    timeout: Duration,
}

impl RcloneUploader {
    /// Create an uploader for `remote` (e.g. `gdrive:BF_Dumps`).
    pub fn new(runner: Arc<dyn CommandRunner>, remote: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            remote: remote.into(),
            timeout,
        }
    }
}

impl Uploader for RcloneUploader {
    fn upload(&self, file: &Path) -> Result<()> {
        let argv = vec![
            "rclone".to_string(),
            "copy".to_string(),
            file.to_string_lossy().into_owned(),
            self.remote.clone(),
        ];
        let output = self.runner.run(&argv, self.timeout)?;
        if output.success() {
            info!("Uploaded {} to {}", file.display(), self.remote);
            Ok(())
        } else if output.timed_out {
            Err(Error::Process(format!("rclone timed out after {:?}", self.timeout)))
        } else {
            Err(Error::Process(format!(
                "rclone exited with {:?}: {}",
                output.code, output.stderr
            )))
        }
    }
}

/// Cloud sync result of an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    /// No remote configured.
    Skipped,
    /// Uploaded.
    Uploaded,
    /// Upload failed; the local artifact is unaffected.
    Failed(String),
}

/// Result of a finished attempt.
#[derive(Debug, Clone)]
pub struct ExtractionReport {
    /// Classification of the version probe.
    pub identification: Identification,
    /// Craft name, if the CLI reported one.
    pub board_name: Option<String>,
    /// MAVLink heartbeat of ArduPilot-class devices.
    pub heartbeat: Option<Heartbeat>,
    /// How the streaming read ended, for text CLIs.
    pub completion: Option<Completion>,
    /// Written artifact.
    pub artifact: DumpEntry,
    /// Cloud sync result.
    pub upload: UploadStatus,
}

impl ExtractionReport {
    /// Whether the artifact is a diagnostic report rather than a dump.
    pub fn is_diagnostic(&self) -> bool {
        !self.identification.is_recognized()
    }

    /// Whether the attempt produced a dump.
    pub fn is_success(&self) -> bool {
        !self.is_diagnostic()
    }
}

/// Everything one extraction attempt needs.
pub struct Extractor<'a> {
    /// Session receiving firmware info, comm log and latest dump.
    pub session: &'a Session,
    /// Progress LEDs.
    pub hardware: &'a Hardware,
    /// Opens the serial device.
    pub opener: &'a dyn PortOpener,
    /// Artifact storage.
    pub store: &'a DumpStore,
    /// Cloud sync, if configured.
    pub uploader: Option<&'a dyn Uploader>,
    /// Timeouts.
    pub timing: &'a Timing,
}

/// What was read from the device before the port is closed.
struct Capture {
    identification: Identification,
    probe: ProbeResponse,
    board_name: Option<String>,
    heartbeat: Option<Heartbeat>,
    completion: Option<Completion>,
    body: String,
}

impl Extractor<'_> {
    /// Run one attempt against `port` at `baud`.
    ///
    /// A device that answers with something unrecognisable (or not at all)
    /// still completes with a diagnostic artifact. Errors mean nothing
    /// could be persisted.
    pub fn run(&self, port: &str, baud: u32) -> Result<ExtractionReport> {
        let log = self.session.comm_log();
        log.clear();
        log.info(format!("extraction started on {port} @ {baud}"));

        self.hardware.off();
        self.hardware.set_led(LED_CONNECT, Rgb::ORANGE);
        if !self.timing.port_settle.is_zero() {
            thread::sleep(self.timing.port_settle);
        }

        let capture = match self.capture(port, baud) {
            Ok(capture) => capture,
            Err(e) => {
                log.error(e.to_string());
                self.hardware.set_led(LED_RESULT, Rgb::RED);
                return Err(e);
            },
        };

        self.hardware.set_led(LED_SAVE, Rgb::YELLOW);
        let now = Local::now();
        let artifact = if capture.identification.is_recognized() {
            let kind = capture.identification.kind().unwrap_or(FirmwareKind::Unknown);
            let info = capture.identification.to_info(&capture.probe.text());
            let name = capture
                .board_name
                .clone()
                .unwrap_or_else(|| kind.to_string());
            let version = info.as_ref().and_then(|i| i.version.clone());
            let dir = artifact_dir_name(&name, version.as_deref());
            let contents = self.dump_contents(port, baud, &capture, info.as_ref());
            self.session.set_firmware_info(info);
            self.store
                .write_artifact(&dir, &dump_file_name(&now), &contents)?
        } else {
            let contents = self.diagnostic_contents(port, baud, &capture);
            self.store
                .write_artifact(UNKNOWN_DEVICE_DIR, &diagnostic_file_name(&now), &contents)?
        };
        log.info(format!("saved {}", artifact.path));
        self.session.set_latest_dump(artifact.clone());

        let upload = if capture.identification.is_recognized() {
            self.upload(&artifact)
        } else {
            UploadStatus::Skipped
        };

        let ok = capture.identification.is_recognized() && !matches!(upload, UploadStatus::Failed(_));
        self.hardware
            .set_led(LED_RESULT, if ok { Rgb::GREEN } else { Rgb::RED });

        Ok(ExtractionReport {
            identification: capture.identification,
            board_name: capture.board_name,
            heartbeat: capture.heartbeat,
            completion: capture.completion,
            artifact,
            upload,
        })
    }

    /// Talk to the device. The port is closed when this returns.
    fn capture(&self, port: &str, baud: u32) -> Result<Capture> {
        let log = self.session.comm_log();
        let mut serial = self.opener.open(&SerialConfig::new(port, baud))?;
        let mut transport = CliTransport::new(serial.as_mut(), log);

        let probe = transport.probe(VERSION_COMMAND, VERSION_TERMINATORS, self.timing.probe_timeout)?;
        let identification = firmware::classify(&probe);
        info!("Identified {port} as {:?}", identification.kind());
        self.hardware.set_led(LED_READ, Rgb::ORANGE);

        let mut capture = Capture {
            identification,
            probe,
            board_name: None,
            heartbeat: None,
            completion: None,
            body: String::new(),
        };

        match capture.identification.kind() {
            Some(FirmwareKind::ArduPilot) => {
                capture.heartbeat = mavlink::sniff_heartbeat(&mut transport, self.timing.heartbeat_window)?;
                log.info("full extraction is not supported for MAVLink devices");
                capture.body = capture.probe.text();
            },
            Some(kind) if kind.has_text_cli() => {
                capture.board_name = firmware::board_name(&mut transport, self.timing.name_timeout)?;
                for command in EXTRACTION_COMMANDS {
                    transport.send_command(command)?;
                    thread::sleep(self.timing.inter_command_delay);
                }
                let read = transport.read_until_silence(&self.timing.silence)?;
                if read.bytes == 0 {
                    return Err(Error::NoResponse(read.elapsed.as_millis() as u64));
                }
                if read.completion == Completion::Timeout {
                    warn!("Dump did not finish within {:?}, keeping partial output", self.timing.silence.timeout);
                }
                capture.completion = Some(read.completion);
                capture.body = read.text;
            },
            _ => {},
        }

        debug!("Closing {port}");
        Ok(capture)
    }

    fn upload(&self, artifact: &DumpEntry) -> UploadStatus {
        let Some(uploader) = self.uploader else {
            return UploadStatus::Skipped;
        };
        let path = self.store.root().join(&artifact.path);
        match uploader.upload(&path) {
            Ok(()) => {
                self.session.comm_log().info("cloud sync done");
                UploadStatus::Uploaded
            },
            Err(e) => {
                warn!("Cloud sync failed: {e}");
                self.session
                    .comm_log()
                    .error(format!("cloud sync failed: {e}"));
                UploadStatus::Failed(e.to_string())
            },
        }
    }

    fn dump_contents(&self, port: &str, baud: u32, capture: &Capture, info: Option<&FirmwareInfo>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Beatha dump");
        let _ = writeln!(out, "# Date: {}", Local::now().to_rfc3339());
        let _ = writeln!(out, "# Port: {port} @ {baud}");
        if let Some(info) = info {
            let _ = writeln!(
                out,
                "# Firmware: {} {} ({})",
                info.kind,
                info.version.as_deref().unwrap_or("?"),
                info.target.as_deref().unwrap_or("?")
            );
        }
        if let Some(name) = &capture.board_name {
            let _ = writeln!(out, "# Board name: {name}");
        }
        if let Some(completion) = capture.completion {
            let _ = writeln!(out, "# Completion: {completion:?}");
        }
        if capture.identification.kind() == Some(FirmwareKind::ArduPilot) {
            match &capture.heartbeat {
                Some(hb) => {
                    let _ = writeln!(out, "# {hb}");
                },
                None => {
                    let _ = writeln!(out, "# No MAVLink heartbeat within {:?}", self.timing.heartbeat_window);
                },
            }
            let _ = writeln!(out, "# Full configuration extraction is not supported for MAVLink devices.");
        }
        out.push('\n');
        out.push_str(&capture.body);
        out.push('\n');
        out
    }

    fn diagnostic_contents(&self, port: &str, baud: u32, capture: &Capture) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Beatha diagnostic report");
        let _ = writeln!(out, "Date: {}", Local::now().to_rfc3339());
        let _ = writeln!(out, "Port: {port}");
        let _ = writeln!(out, "Baud: {baud}");
        let result = match capture.identification {
            Identification::NoResponse => "no response",
            _ => "unrecognised response",
        };
        let _ = writeln!(out, "Result: {result}");
        let _ = writeln!(out, "Binary data observed: {}", if capture.probe.binary { "yes" } else { "no" });

        let _ = writeln!(out, "\n--- Raw response ---");
        if capture.probe.lines.is_empty() {
            let _ = writeln!(out, "(nothing received)");
        } else {
            let _ = writeln!(out, "{}", capture.probe.text());
        }

        let _ = writeln!(out, "\n--- Checklist ---");
        for item in CHECKLIST {
            let _ = writeln!(out, "- {item}");
        }

        let _ = writeln!(out, "\n--- Communication log ---");
        for entry in self.session.comm_log().snapshot() {
            let _ = writeln!(out, "{entry}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{HardwareConfig, emulated};
    use crate::port::mock::{MockOpener, Script};
    use crate::process::mock::MockRunner;
    use crate::protocol::transport::SilencePolicy;

    fn timing() -> Timing {
        Timing {
            probe_timeout: Duration::from_millis(300),
            name_timeout: Duration::from_millis(300),
            heartbeat_window: Duration::from_millis(800),
            silence: SilencePolicy {
                timeout: Duration::from_secs(5),
                silence: Duration::from_millis(150),
                min_bytes: 10,
                start_grace: Duration::from_millis(400),
            },
            inter_command_delay: Duration::from_millis(10),
            port_settle: Duration::ZERO,
            ..Timing::default()
        }
    }

    struct Fixture {
        session: Session,
        hardware: Hardware,
        handles: emulated::EmulatedHandles,
        store: DumpStore,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (hardware, handles) = emulated::build(&HardwareConfig::default());
        Fixture {
            session: Session::new(Some("/dev/mock0".to_string()), 115_200),
            hardware,
            handles,
            store: DumpStore::new(dir.path()),
            _dir: dir,
        }
    }

    fn extractor<'a>(
        f: &'a Fixture,
        opener: &'a MockOpener,
        uploader: Option<&'a dyn Uploader>,
        timing: &'a Timing,
    ) -> Extractor<'a> {
        Extractor {
            session: &f.session,
            hardware: &f.hardware,
            opener,
            store: &f.store,
            uploader,
            timing,
        }
    }

    fn betaflight_script() -> Script {
        let mut dump = String::from("# dump all\r\n# version\r\n");
        for i in 0..20 {
            dump.push_str(&format!("set setting_{i} = {i}\r\n"));
        }
        Script::default()
            .reply(
                "version",
                b"# Betaflight / STM32F405 (S405) 4.4.0 Jan  1 2023 / 12:00:00 (abc) MSP API: 1.45\r\n",
            )
            .reply("get name", b"name = Shredder\r\n")
            .reply("dump all", dump.as_bytes())
    }

    #[test]
    fn test_betaflight_dump() {
        let f = fixture();
        let opener = MockOpener::new(betaflight_script());
        let timing = timing();
        let report = extractor(&f, &opener, None, &timing)
            .run("/dev/mock0", 115_200)
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.board_name.as_deref(), Some("Shredder"));
        assert_eq!(report.completion, Some(Completion::Silence));
        assert_eq!(report.upload, UploadStatus::Skipped);
        assert!(report.artifact.path.starts_with("Shredder_4.4.0/dump_"));

        let contents = f.store.read(&report.artifact.path).unwrap();
        assert!(contents.contains("# Firmware: Betaflight 4.4.0 (STM32F405)"));
        assert!(contents.contains("set setting_19 = 19"));

        let info = f.session.firmware_info().unwrap();
        assert_eq!(info.kind, FirmwareKind::Betaflight);
        assert_eq!(f.session.latest_dump(), Some(report.artifact));
        assert_eq!(opener.open_count(), 1);
        assert_eq!(
            f.handles.frame(),
            vec![Rgb::ORANGE, Rgb::ORANGE, Rgb::YELLOW, Rgb::GREEN]
        );
    }

    #[test]
    fn test_unrecognised_device_writes_diagnostic() {
        let f = fixture();
        let opener = MockOpener::new(Script::default().reply("version", b"lorem ipsum dolor\r\n"));
        let timing = timing();
        let report = extractor(&f, &opener, None, &timing)
            .run("/dev/mock0", 115_200)
            .unwrap();

        assert!(report.is_diagnostic());
        assert!(report.artifact.path.starts_with("Unknown_Device_unknown/diagnostic_"));
        let contents = f.store.read(&report.artifact.path).unwrap();
        assert!(contents.contains("lorem ipsum dolor"));
        assert!(contents.contains("Wrong baud rate"));
        assert!(contents.contains("Result: unrecognised response"));
        assert!(f.session.firmware_info().is_none());
        assert_eq!(f.handles.frame()[LED_RESULT], Rgb::RED);
    }

    #[test]
    fn test_silent_device_writes_diagnostic() {
        let f = fixture();
        let opener = MockOpener::new(Script::default());
        let timing = timing();
        let report = extractor(&f, &opener, None, &timing)
            .run("/dev/mock0", 115_200)
            .unwrap();

        assert_eq!(report.identification, Identification::NoResponse);
        let contents = f.store.read(&report.artifact.path).unwrap();
        assert!(contents.contains("Result: no response"));
        assert!(contents.contains("(nothing received)"));
    }

    #[test]
    fn test_ardupilot_heartbeat_recorded() {
        let f = fixture();
        let heartbeat = crate::protocol::mavlink::tests::heartbeat_v2(2, 3);
        let script = Script::default()
            .reply("version", &[0xFE, 0xFF, 0x00, b'\n'])
            .chunk(Duration::from_millis(550), &heartbeat)
            .chunk(Duration::from_millis(700), &heartbeat);
        let opener = MockOpener::new(script);
        let timing = timing();
        let report = extractor(&f, &opener, None, &timing)
            .run("/dev/mock0", 115_200)
            .unwrap();

        assert_eq!(report.identification.kind(), Some(FirmwareKind::ArduPilot));
        assert_eq!(report.heartbeat.map(|hb| hb.autopilot), Some(3));
        assert!(report.artifact.path.starts_with("ArduPilot_unknown/dump_"));
        let contents = f.store.read(&report.artifact.path).unwrap();
        assert!(contents.contains("not supported for MAVLink devices"));
    }

    #[test]
    fn test_upload_failure_keeps_artifact() {
        struct Failing;
        impl Uploader for Failing {
            fn upload(&self, _file: &Path) -> Result<()> {
                Err(Error::Process("remote unreachable".to_string()))
            }
        }

        let f = fixture();
        let opener = MockOpener::new(betaflight_script());
        let timing = timing();
        let report = extractor(&f, &opener, Some(&Failing), &timing)
            .run("/dev/mock0", 115_200)
            .unwrap();

        assert!(matches!(report.upload, UploadStatus::Failed(_)));
        assert!(f.store.read(&report.artifact.path).is_ok());
        assert_eq!(f.handles.frame()[LED_RESULT], Rgb::RED);
    }

    #[test]
    fn test_open_failure_is_error() {
        let f = fixture();
        let opener = MockOpener {
            fail: true,
            ..MockOpener::default()
        };
        let timing = timing();
        let result = extractor(&f, &opener, None, &timing).run("/dev/ttyACM9", 115_200);

        assert!(matches!(result, Err(Error::PortOpen { .. })));
        assert!(f.store.list().unwrap().is_empty());
        assert!(f
            .session
            .comm_log()
            .snapshot()
            .iter()
            .any(|e| e.direction == crate::comm_log::Direction::Error));
    }

    #[test]
    fn test_rclone_uploader_command_line() {
        let runner = Arc::new(MockRunner::default());
        let uploader = RcloneUploader::new(runner.clone(), "gdrive:BF_Dumps", Duration::from_secs(60));
        uploader
            .upload(Path::new("/home/pi/dumps/a/dump.txt"))
            .unwrap();
        assert_eq!(
            runner.calls.lock().unwrap()[0],
            ["rclone", "copy", "/home/pi/dumps/a/dump.txt", "gdrive:BF_Dumps"]
        );

        let failing = Arc::new(MockRunner {
            exit_code: 5,
            ..MockRunner::default()
        });
        let uploader = RcloneUploader::new(failing, "gdrive:x", Duration::from_secs(1));
        assert!(matches!(
            uploader.upload(Path::new("/tmp/x.txt")),
            Err(Error::Process(_))
        ));
    }
}
