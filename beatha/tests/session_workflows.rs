//! End-to-end workflows against scripted devices.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use beatha::hardware::emulated;
use beatha::protocol::SilencePolicy;
use beatha::{
    Backends, ChildProcess, CommandOutput, CommandRunner, DumpKind, Error, Manager, Mode, Port,
    PortEnumerator, PortInfo, PortOpener, Result, SerialConfig, Settings, Spawner,
};
use tempfile::TempDir;

/// Answers command lines from a fixed table.
struct Responder {
    replies: Vec<(&'static str, Vec<u8>)>,
    line: Vec<u8>,
    ready: VecDeque<u8>,
    timeout: Duration,
}

impl Read for Responder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.ready.is_empty() {
            thread::sleep(self.timeout.min(Duration::from_millis(10)));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.ready.len());
        for (slot, byte) in buf.iter_mut().zip(self.ready.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for Responder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
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

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for Responder {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        115_200
    }

    fn clear_input(&mut self) -> Result<()> {
        self.ready.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "/dev/ttyACM0"
    }
}

struct ResponderOpener {
    replies: Vec<(&'static str, Vec<u8>)>,
    opens: AtomicUsize,
}

impl ResponderOpener {
    fn new(replies: Vec<(&'static str, Vec<u8>)>) -> Self {
        Self {
            replies,
            opens: AtomicUsize::new(0),
        }
    }
}

impl PortOpener for ResponderOpener {
    fn open(&self, _config: &SerialConfig) -> Result<Box<dyn Port>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Responder {
            replies: self.replies.clone(),
            line: Vec::new(),
            ready: VecDeque::new(),
            timeout: Duration::from_millis(10),
        }))
    }
}

struct OnePort;

impl PortEnumerator for OnePort {
    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(vec![PortInfo::new("/dev/ttyACM0")])
    }
}

struct DeadChild;

impl ChildProcess for DeadChild {
    fn id(&self) -> u32 {
        1
    }

    fn is_alive(&mut self) -> bool {
        false
    }

    fn terminate(&mut self) -> Result<()> {
        Ok(())
    }

    fn wait_timeout(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    fn kill(&mut self) -> Result<()> {
        Ok(())
    }
}

struct NoBridges;

impl Spawner for NoBridges {
    fn spawn(&self, _argv: &[String]) -> Result<Box<dyn ChildProcess>> {
        Ok(Box::new(DeadChild))
    }
}

/// Records every command; those whose arguments contain `fail_on` exit 1.
#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<Vec<String>>>,
    fail_on: Option<&'static str>,
}

impl RecordingRunner {
    fn failing_on(word: &'static str) -> Self {
        Self {
            fail_on: Some(word),
            ..Self::default()
        }
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, argv: &[String], _timeout: Duration) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(argv.to_vec());
        let failed = self
            .fail_on
            .is_some_and(|word| argv.iter().any(|arg| arg == word));
        Ok(CommandOutput {
            code: Some(i32::from(failed)),
            timed_out: false,
            stderr: String::new(),
        })
    }
}

struct Device {
    manager: Arc<Manager>,
    opener: Arc<ResponderOpener>,
    runner: Arc<RecordingRunner>,
    _dir: TempDir,
}

fn device(replies: Vec<(&'static str, Vec<u8>)>) -> Device {
    device_with_runner(replies, RecordingRunner::default())
}

fn device_with_runner(replies: Vec<(&'static str, Vec<u8>)>, runner: RecordingRunner) -> Device {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings {
        dump_dir: dir.path().to_path_buf(),
        ..Settings::emulated()
    };
    settings.timing.port_settle = Duration::ZERO;
    settings.timing.probe_timeout = Duration::from_millis(500);
    settings.timing.name_timeout = Duration::from_millis(300);
    settings.timing.status_hold = Duration::from_millis(100);
    settings.timing.pairing_window = Duration::from_millis(300);
    settings.timing.silence = SilencePolicy {
        timeout: Duration::from_secs(5),
        silence: Duration::from_millis(200),
        min_bytes: 10,
        start_grace: Duration::from_millis(500),
    };

    let (hardware, _handles) = emulated::build(&settings.hardware);
    let opener = Arc::new(ResponderOpener::new(replies));
    let runner = Arc::new(runner);
    let backends = Backends {
        opener: opener.clone(),
        enumerator: Arc::new(OnePort),
        spawner: Arc::new(NoBridges),
        runner: runner.clone(),
    };
    Device {
        manager: Manager::new(settings, hardware, backends),
        opener,
        runner,
        _dir: dir,
    }
}

fn wait_idle(manager: &Manager) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while manager.status().mode != Mode::Idle {
        assert!(Instant::now() < deadline, "workflow did not return to IDLE");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn double_trigger_runs_one_extraction() {
    let mut dump = b"# dump all\r\n".to_vec();
    for i in 0..50 {
        dump.extend_from_slice(format!("set motor_pwm_rate_{i} = 480\r\n").as_bytes());
    }
    let dev = device(vec![
        ("version", b"# Betaflight / STM32F7X2 (S7X2) 4.5.1 Oct  1 2024 / 10:00:00 (77d01ba) MSP API: 1.46\r\n".to_vec()),
        ("get name", b"name = Cinelog35\r\n".to_vec()),
        ("dump all", dump),
    ]);

    dev.manager.trigger_dump().unwrap();
    let second = dev.manager.trigger_dump();
    assert!(matches!(second, Err(Error::Busy(Mode::Dumping))));

    wait_idle(&dev.manager);
    assert_eq!(dev.opener.opens.load(Ordering::SeqCst), 1);

    let dumps = dev.manager.list_dumps().unwrap();
    assert_eq!(dumps.len(), 1);
    assert_eq!(dumps[0].device, "Cinelog35_4.5.1");
    assert_eq!(dumps[0].kind, DumpKind::Dump);

    let contents = dev.manager.read_dump(&dumps[0].path).unwrap();
    assert!(contents.contains("set motor_pwm_rate_49 = 480"));

    let status = dev.manager.status();
    assert_eq!(status.latest_dump.as_ref(), Some(&dumps[0]));
    assert_eq!(status.firmware_info.unwrap().version.as_deref(), Some("4.5.1"));
    dev.manager.shutdown();
}

#[test]
fn garbage_device_leaves_diagnostic_and_returns_to_idle() {
    let dev = device(vec![("version", b"~~ lorem ipsum 0x42 ~~\r\n".to_vec())]);

    dev.manager.trigger_dump().unwrap();
    wait_idle(&dev.manager);

    let dumps = dev.manager.list_dumps().unwrap();
    assert_eq!(dumps.len(), 1);
    assert_eq!(dumps[0].device, "Unknown_Device_unknown");
    assert_eq!(dumps[0].kind, DumpKind::Diagnostic);
    assert!(dumps[0].file_name.starts_with("diagnostic_"));

    let report = dev.manager.read_dump(&dumps[0].path).unwrap();
    assert!(report.contains("lorem ipsum"));
    assert!(report.contains("Checklist"));
    assert!(dev.manager.status().firmware_info.is_none());
    assert!(!dev.manager.comm_log().is_empty());
    dev.manager.shutdown();
}

#[test]
fn pairing_runs_sequence_and_returns_to_idle() {
    let dev = device(Vec::new());

    dev.manager.trigger_pair().unwrap();
    assert!(matches!(dev.manager.trigger_dump(), Err(Error::Busy(Mode::Pairing))));
    wait_idle(&dev.manager);

    let calls = dev.runner.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 5);
    assert!(calls.iter().all(|argv| argv[0] == "bluetoothctl"));
    assert_eq!(dev.opener.opens.load(Ordering::SeqCst), 0);
    dev.manager.shutdown();
}

fn assert_pairing_window_held(runner: RecordingRunner) {
    let dev = device_with_runner(Vec::new(), runner);
    let window = dev.manager.settings().timing.pairing_window;

    let start = Instant::now();
    dev.manager.trigger_pair().unwrap();
    wait_idle(&dev.manager);

    assert!(start.elapsed() >= window, "pairing window cut short");
    assert_eq!(dev.runner.calls.lock().unwrap().len(), 5);
    assert_eq!(dev.manager.status().mode, Mode::Idle);
    dev.manager.trigger_dump().unwrap();
    wait_idle(&dev.manager);
    dev.manager.shutdown();
}

#[test]
fn pairing_survives_one_failing_command() {
    assert_pairing_window_held(RecordingRunner::failing_on("discoverable"));
}

#[test]
fn pairing_holds_window_when_every_command_fails() {
    assert_pairing_window_held(RecordingRunner::failing_on("bluetoothctl"));
}

#[test]
fn dump_paths_cannot_escape_the_root() {
    let dev = device(Vec::new());
    assert!(matches!(
        dev.manager.read_dump("../../etc/passwd"),
        Err(Error::PathOutsideDumpRoot(_))
    ));
}
