//! The session manager.
//!
//! [`Manager`] is the one context object of a running device. It owns the
//! session, the settings, the peripherals, the I/O backends and both bridge
//! supervisors, and it is handed to every background loop. There is no
//! global state.
//!
//! Workflows (dump, pairing) only start through an IDLE transition on the
//! session. The transition is checked synchronously, so a rejected trigger
//! returns an error immediately while an accepted one runs on its own
//! worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use log::{debug, error, info, warn};

use crate::comm_log::CommLogEntry;
use crate::device::{self, PortCandidate};
use crate::dumps::{DumpEntry, DumpStore};
use crate::error::{Error, Result};
use crate::extraction::{ExtractionReport, Extractor, RcloneUploader, UploadStatus, Uploader};
use crate::hardware::{BeepPattern, Button, Hardware, StatusCue};
use crate::pairing::{PairingReport, PairingWorkflow};
use crate::port::{PortEnumerator, PortOpener, SerialConfig};
use crate::process::{CommandRunner, Spawner};
use crate::protocol::firmware::{self, FirmwareInfo, Identification};
use crate::protocol::transport::CliTransport;
use crate::proxy::{BridgeKind, BridgeSpec, ProxySupervisor};
use crate::session::{Mode, ModeGuard, Session};
use crate::settings::Settings;
use crate::tasks::hotplug::{HotplugEvent, PollingHotplug};
use crate::tasks::{self, animation, buttons, hotplug, sleep_unless};

/// I/O backends of a manager.
#[derive(Clone)]
pub struct Backends {
    /// Opens serial devices.
    pub opener: Arc<dyn PortOpener>,
    /// Lists serial devices.
    pub enumerator: Arc<dyn PortEnumerator>,
    /// Starts bridge processes.
    pub spawner: Arc<dyn Spawner>,
    /// Runs pairing and upload commands.
    pub runner: Arc<dyn CommandRunner>,
}

impl Backends {
    /// Real serial ports and system processes.
    #[cfg(feature = "native")]
    pub fn native() -> Self {
        use crate::port::{NativePortEnumerator, NativePortOpener};
        use crate::process::{SystemRunner, SystemSpawner};

        Self {
            opener: Arc::new(NativePortOpener),
            enumerator: Arc::new(NativePortEnumerator),
            spawner: Arc::new(SystemSpawner),
            runner: Arc::new(SystemRunner),
        }
    }
}

/// Snapshot of the manager state.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Status {
    /// Current mode.
    pub mode: Mode,
    /// Whether the selected device is present.
    pub connected: bool,
    /// Whether emulated hardware is in use.
    pub emulated: bool,
    /// Selected serial device.
    pub port: Option<String>,
    /// Serial baud rate.
    pub baud: u32,
    /// Last identification result.
    pub firmware_info: Option<FirmwareInfo>,
    /// Most recently written artifact.
    pub latest_dump: Option<DumpEntry>,
    /// Whether the TCP bridge is running.
    pub tcp_bridge_running: bool,
    /// Whether the Bluetooth bridge is running.
    pub bt_bridge_running: bool,
}

/// Device session manager.
pub struct Manager {
    settings: Settings,
    session: Arc<Session>,
    hardware: Arc<Hardware>,
    backends: Backends,
    store: DumpStore,
    tcp: Arc<ProxySupervisor>,
    bluetooth: Arc<ProxySupervisor>,
    shutdown: Arc<AtomicBool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Build a manager and select the initial serial device.
    ///
    /// The configured port is adopted if present, otherwise the best scored
    /// candidate. Nothing runs until [`Manager::start`].
    pub fn new(settings: Settings, hardware: Hardware, backends: Backends) -> Arc<Self> {
        let session = Arc::new(Session::new(
            Some(settings.serial_port.clone()),
            settings.baud_rate,
        ));

        let bridge = &settings.bridge;
        let grace = settings.timing.process_grace;
        let tcp = ProxySupervisor::new(
            BridgeSpec {
                kind: BridgeKind::Tcp,
                enabled: bridge.tcp_enabled,
                command: bridge.tcp_command.clone(),
                tcp_port: bridge.tcp_port,
                grace,
            },
            Arc::clone(&backends.spawner),
        );
        let bluetooth = ProxySupervisor::new(
            BridgeSpec {
                kind: BridgeKind::Bluetooth,
                enabled: bridge.bt_enabled,
                command: bridge.bt_command.clone(),
                tcp_port: bridge.tcp_port,
                grace,
            },
            Arc::clone(&backends.spawner),
        );

        let manager = Self {
            store: DumpStore::new(settings.dump_dir.clone()),
            settings,
            session,
            hardware: Arc::new(hardware),
            backends,
            tcp: Arc::new(tcp),
            bluetooth: Arc::new(bluetooth),
            shutdown: Arc::new(AtomicBool::new(false)),
            loops: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        };
        manager.select_initial_port();
        Arc::new(manager)
    }

    /// Build a manager on real serial ports and processes.
    ///
    /// Peripherals are emulated when `settings.emulated` is set.
    #[cfg(feature = "native")]
    pub fn native(settings: Settings) -> Result<Arc<Self>> {
        let hardware = if settings.emulated {
            crate::hardware::emulated::build(&settings.hardware).0
        } else {
            crate::hardware::live::build(&settings.hardware)?
        };
        Ok(Self::new(settings, hardware, Backends::native()))
    }

    fn select_initial_port(&self) {
        let configured = &self.settings.serial_port;
        if self.backends.enumerator.is_present(configured) {
            info!("Using configured serial port {configured}");
            self.session.connect(configured.clone(), None);
        } else if let Some(candidate) = device::best_candidate(self.backends.enumerator.as_ref()) {
            info!(
                "Configured port {configured} not found, using {} (score {})",
                candidate.path, candidate.score
            );
            self.session.connect(candidate.path, None);
        } else {
            info!("No flight controller found, waiting for one to be attached");
        }
    }

    /// Session state.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Settings the manager was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Peripherals.
    pub fn hardware(&self) -> &Arc<Hardware> {
        &self.hardware
    }

    /// Start the background loops and play the startup tune.
    ///
    /// Hotplug monitoring is skipped with emulated hardware. Calling this
    /// twice has no effect.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let timing = self.settings.timing;
        let mut handles = Vec::new();

        if self.hardware.is_emulated() {
            info!("Emulated hardware, hotplug monitor disabled");
        } else {
            let manager = Arc::clone(self);
            handles.push(tasks::spawn_named("beatha-hotplug", move || {
                let source = PollingHotplug::new(Arc::clone(&manager.backends.enumerator));
                hotplug::run(source, timing.hotplug_interval, &manager.shutdown, |event| {
                    manager.handle_hotplug(event);
                });
            })?);
        }

        let manager = Arc::clone(self);
        handles.push(tasks::spawn_named("beatha-buttons", move || {
            buttons::run(
                &manager.hardware,
                timing.button_poll,
                timing.button_settle,
                &manager.shutdown,
                |button| manager.on_button(button),
            );
        })?);

        let manager = Arc::clone(self);
        handles.push(tasks::spawn_named("beatha-animation", move || {
            manager.hardware.beep(BeepPattern::Startup);
            animation::run(&manager.session, &manager.hardware, &manager.shutdown);
        })?);

        for (name, supervisor) in [("beatha-tcp-bridge", &self.tcp), ("beatha-bt-bridge", &self.bluetooth)] {
            let supervisor = Arc::clone(supervisor);
            let session = Arc::clone(&self.session);
            let shutdown = Arc::clone(&self.shutdown);
            handles.push(tasks::spawn_named(name, move || {
                tasks::supervise(&supervisor, &session, timing.bridge_poll, &shutdown);
            })?);
        }

        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        info!("Session manager started");
        Ok(())
    }

    /// Stop every loop and workflow, both bridges and the LEDs.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down");

        let loops: Vec<_> = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in loops.into_iter().chain(workers) {
            let name = handle
                .thread()
                .name()
                .unwrap_or("worker")
                .to_string();
            if handle.join().is_err() {
                error!("Thread '{name}' panicked");
            }
        }

        self.stop_bridges();
        self.hardware.off();
        info!("Session manager stopped");
    }

    /// Whether [`Manager::shutdown`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Current state.
    pub fn status(&self) -> Status {
        Status {
            mode: self.session.mode(),
            connected: self.session.is_connected(),
            emulated: self.hardware.is_emulated(),
            port: self.session.serial_port(),
            baud: self.session.baud_rate(),
            firmware_info: self.session.firmware_info(),
            latest_dump: self.session.latest_dump(),
            tcp_bridge_running: self.tcp.is_running(),
            bt_bridge_running: self.bluetooth.is_running(),
        }
    }

    fn on_button(self: &Arc<Self>, button: Button) {
        let result = match button {
            Button::Dump => self.trigger_dump(),
            Button::Pair => self.trigger_pair(),
        };
        if let Err(e) = result {
            info!("{button} button ignored: {e}");
        }
    }

    /// Start an extraction on a worker thread.
    ///
    /// Rejected with [`Error::Busy`] or [`Error::NotConnected`] (and the
    /// error beep) before any state changes.
    pub fn trigger_dump(self: &Arc<Self>) -> Result<()> {
        let (guard, port, baud) = self.enter_serial_workflow()?;
        let manager = Arc::clone(self);
        self.spawn_worker("beatha-dump", move || {
            manager.session.set_status_hold(true);
            match manager.extract(&port, baud) {
                Ok(report) => debug!("Dump worker finished: {}", report.artifact.path),
                Err(e) => warn!("Dump worker finished without an artifact: {e}"),
            }
            manager.hold_status();
            drop(guard);
        })
    }

    /// Run an extraction on the calling thread.
    ///
    /// Same guard and cues as [`Manager::trigger_dump`], without the
    /// status hold.
    pub fn dump_now(self: &Arc<Self>) -> Result<ExtractionReport> {
        let (guard, port, baud) = self.enter_serial_workflow()?;
        self.session.set_status_hold(true);
        let result = self.extract(&port, baud);
        drop(guard);
        result
    }

    /// Open the pairing window on a worker thread.
    pub fn trigger_pair(self: &Arc<Self>) -> Result<()> {
        let guard = self.enter(Mode::Pairing)?;
        let manager = Arc::clone(self);
        self.spawn_worker("beatha-pair", move || {
            manager.session.set_status_hold(true);
            manager.pair();
            drop(guard);
        })
    }

    /// Probe the firmware banner without extracting.
    ///
    /// Guarded like a dump; a recognised firmware is stored in the session.
    pub fn identify(self: &Arc<Self>) -> Result<Identification> {
        let (_guard, port, baud) = self.enter_serial_workflow()?;
        self.stop_bridges();
        let mut serial = self.open(&port, baud)?;
        let mut transport = CliTransport::new(serial.as_mut(), self.session.comm_log());
        let (identification, response) = firmware::identify(&mut transport, self.settings.timing.probe_timeout)?;
        if identification.is_recognized() {
            self.session
                .set_firmware_info(identification.to_info(&response.text()));
        }
        Ok(identification)
    }

    /// Ask the CLI for the craft name without extracting.
    pub fn board_name(self: &Arc<Self>) -> Result<Option<String>> {
        let (_guard, port, baud) = self.enter_serial_workflow()?;
        self.stop_bridges();
        let mut serial = self.open(&port, baud)?;
        let mut transport = CliTransport::new(serial.as_mut(), self.session.comm_log());
        firmware::board_name(&mut transport, self.settings.timing.name_timeout)
    }

    /// Stored artifacts, newest first.
    pub fn list_dumps(&self) -> Result<Vec<DumpEntry>> {
        self.store.list()
    }

    /// Contents of one artifact, addressed relative to the dump root.
    pub fn read_dump(&self, path: &str) -> Result<String> {
        self.store.read(path)
    }

    /// Flight-controller candidates, best first.
    pub fn list_serial_ports(&self) -> Vec<PortCandidate> {
        device::detect_flight_controllers(self.backends.enumerator.as_ref())
    }

    /// Every serial device with its score, including those scoring zero.
    pub fn all_serial_ports(&self) -> Result<Vec<PortCandidate>> {
        Ok(device::score_ports(&self.backends.enumerator.list_ports()?))
    }

    /// Select `port` (and optionally a new baud rate).
    ///
    /// Only allowed while idle. Bridges restart on the new device at their
    /// next poll.
    pub fn connect_serial(&self, port: &str, baud: Option<u32>) -> Result<()> {
        let mode = self.session.mode();
        if mode != Mode::Idle {
            return Err(Error::Busy(mode));
        }
        if !self.hardware.is_emulated() && !self.backends.enumerator.is_present(port) {
            return Err(Error::PortOpen {
                port: port.to_string(),
                reason: "device not present".to_string(),
            });
        }
        self.stop_bridges();
        self.session.connect(port, baud);
        info!("Connected to {port} @ {}", self.session.baud_rate());
        Ok(())
    }

    /// Forget the selected device and stop both bridges.
    pub fn disconnect_serial(&self) {
        self.stop_bridges();
        self.session.disconnect();
        info!("Disconnected");
    }

    /// Communication log of the last serial conversation.
    pub fn comm_log(&self) -> Vec<CommLogEntry> {
        self.session.comm_log().snapshot()
    }

    /// React to a serial device appearing or disappearing.
    pub fn handle_hotplug(&self, event: HotplugEvent) {
        match event {
            HotplugEvent::Added(info) => {
                let score = device::score_port(&info).score;
                let adopt = if self.session.is_connected() {
                    score > self.active_score()
                } else {
                    true
                };
                if adopt {
                    info!("Serial device attached: {} (score {score})", info.name);
                    if self.session.is_idle() {
                        self.stop_bridges();
                    }
                    self.session.connect(info.name, None);
                    self.hardware.beep(BeepPattern::Short);
                } else {
                    debug!("Ignoring {}, keeping {:?}", info.name, self.session.serial_port());
                }
            },
            HotplugEvent::Removed(name) => {
                if self.session.serial_port().as_deref() != Some(name.as_str()) {
                    debug!("Inactive serial device removed: {name}");
                    return;
                }
                warn!("Active serial device removed: {name}");
                self.session.disconnect();
                self.stop_bridges();
                let fallback = self
                    .list_serial_ports()
                    .into_iter()
                    .find(|c| c.path != name);
                match fallback {
                    Some(candidate) => {
                        info!("Falling back to {} (score {})", candidate.path, candidate.score);
                        self.session.connect(candidate.path, None);
                    },
                    None => info!("No flight controller left"),
                }
            },
        }
    }

    fn active_score(&self) -> u32 {
        let Some(port) = self.session.serial_port() else {
            return 0;
        };
        self.backends
            .enumerator
            .list_ports()
            .unwrap_or_default()
            .iter()
            .find(|p| p.name == port)
            .map_or(0, |p| device::score_port(p).score)
    }

    /// Enter `mode`, beeping on rejection.
    fn enter(&self, mode: Mode) -> Result<ModeGuard> {
        self.session
            .try_enter(mode)
            .inspect_err(|e| self.reject(e))
    }

    /// Enter DUMPING with a usable serial device.
    fn enter_serial_workflow(&self) -> Result<(ModeGuard, String, u32)> {
        let port = match self.session.serial_port() {
            Some(port) if self.session.is_connected() || self.hardware.is_emulated() => port,
            None if self.hardware.is_emulated() => self.settings.serial_port.clone(),
            _ => {
                let e = Error::NotConnected;
                self.reject(&e);
                return Err(e);
            },
        };
        let guard = self.enter(Mode::Dumping)?;
        Ok((guard, port, self.session.baud_rate()))
    }

    fn reject(&self, e: &Error) {
        warn!("Request rejected: {e}");
        let hardware = Arc::clone(&self.hardware);
        if let Err(spawn_err) = self.spawn_worker("beatha-reject", move || hardware.beep(BeepPattern::Error)) {
            warn!("Error beep unavailable: {spawn_err}");
        }
    }

    fn spawn_worker<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tasks::spawn_named(name, f)?;
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
        Ok(())
    }

    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn crate::port::Port>> {
        self.backends
            .opener
            .open(&SerialConfig::new(port, baud))
    }

    fn stop_bridges(&self) {
        self.tcp.stop();
        self.bluetooth.stop();
    }

    fn hold_status(&self) {
        sleep_unless(&self.shutdown, self.settings.timing.status_hold);
    }

    /// The extraction workflow body. Runs while DUMPING.
    fn extract(&self, port: &str, baud: u32) -> Result<ExtractionReport> {
        info!("Dump started on {port} @ {baud}");
        self.stop_bridges();

        let uploader = self.settings.cloud_remote.as_ref().map(|remote| {
            RcloneUploader::new(
                Arc::clone(&self.backends.runner),
                remote.clone(),
                self.settings.timing.upload_timeout,
            )
        });
        let extractor = Extractor {
            session: &self.session,
            hardware: &self.hardware,
            opener: self.backends.opener.as_ref(),
            store: &self.store,
            uploader: uploader.as_ref().map(|u| u as &dyn Uploader),
            timing: &self.settings.timing,
        };

        match extractor.run(port, baud) {
            Ok(report) => {
                if report.is_diagnostic() {
                    warn!("Device not identified, diagnostic saved to {}", report.artifact.path);
                    self.hardware.beep(BeepPattern::Error);
                } else if let UploadStatus::Failed(reason) = &report.upload {
                    warn!("Dump saved to {}, upload failed: {reason}", report.artifact.path);
                    self.hardware.beep(BeepPattern::Error);
                } else {
                    info!("Dump saved to {}", report.artifact.path);
                    self.hardware.beep(BeepPattern::Success);
                }
                Ok(report)
            },
            Err(e) => {
                error!("Dump failed: {e}");
                self.hardware.cue(StatusCue::Error);
                Err(e)
            },
        }
    }

    /// The pairing workflow body. Runs while PAIRING.
    fn pair(&self) -> PairingReport {
        info!("Pairing started");
        self.stop_bridges();
        let report = PairingWorkflow {
            runner: self.backends.runner.as_ref(),
            hardware: &self.hardware,
            commands: &self.settings.pairing_commands,
            command_timeout: self.settings.timing.pairing_command_timeout,
            window: self.settings.timing.pairing_window,
            shutdown: &self.shutdown,
        }
        .run();
        if !report.failed.is_empty() {
            warn!("Pairing commands failed: {}", report.failed.join(", "));
        }
        report
    }
}
