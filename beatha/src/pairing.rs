//! Bluetooth pairing window.
//!
//! Runs the configured `bluetoothctl` sequence, then blinks the strip purple
//! for the pairing window. Every command is best-effort: a failing step is
//! logged and the sequence continues. The window is held regardless; when no
//! command succeeded the error beep sounds before it opens.

use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::hardware::{BeepPattern, Hardware, Rgb};
use crate::process::CommandRunner;
use crate::tasks::sleep_unless;

/// Blink half-period of the pairing animation.
pub const BLINK_INTERVAL: Duration = Duration::from_millis(250);

/// Outcome of one pairing window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingReport {
    /// Commands that exited with status 0.
    pub succeeded: usize,
    /// Commands that failed, timed out or could not be started.
    pub failed: Vec<String>,
    /// Whether the window ran to its end (not cut short by shutdown).
    pub completed: bool,
}

impl PairingReport {
    /// Whether the adapter was made pairable.
    pub fn is_success(&self) -> bool {
        self.succeeded > 0 || self.failed.is_empty()
    }
}

/// One pairing run.
pub struct PairingWorkflow<'a> {
    /// Executes the command sequence.
    pub runner: &'a dyn CommandRunner,
    /// Strip and buzzer.
    pub hardware: &'a Hardware,
    /// Command lines, in order.
    pub commands: &'a [Vec<String>],
    /// Per-command limit.
    pub command_timeout: Duration,
    /// How long the adapter stays discoverable.
    pub window: Duration,
    /// Set when the manager shuts down.
    pub shutdown: &'a AtomicBool,
}

impl PairingWorkflow<'_> {
    /// Run the sequence and hold the pairing window open.
    pub fn run(&self) -> PairingReport {
        let mut report = PairingReport::default();

        for argv in self.commands {
            let line = argv.join(" ");
            match self.runner.run(argv, self.command_timeout) {
                Ok(output) if output.success() => report.succeeded += 1,
                Ok(output) => {
                    warn!("'{line}' failed (exit {:?}): {}", output.code, output.stderr.trim());
                    report.failed.push(line);
                },
                Err(e) => {
                    warn!("'{line}' could not run: {e}");
                    report.failed.push(line);
                },
            }
        }

        if !report.is_success() {
            warn!("No pairing command succeeded, holding the window anyway");
            self.hardware.beep(BeepPattern::Error);
        }

        info!("Pairing window open for {:?}", self.window);
        report.completed = self.blink();
        self.hardware.off();
        info!("Pairing window closed");
        report
    }

    /// Blink purple until the window ends. Returns `false` on shutdown.
    fn blink(&self) -> bool {
        let deadline = Instant::now() + self.window;
        let mut lit = false;
        while Instant::now() < deadline {
            lit = !lit;
            self.hardware
                .fill(if lit { Rgb::PURPLE } else { Rgb::OFF });
            let step = BLINK_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
            if !sleep_unless(self.shutdown, step) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{HardwareConfig, emulated};
    use crate::process::mock::MockRunner;
    use crate::settings::default_pairing_commands;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_sequence_then_window() {
        let (hardware, handles) = emulated::build(&HardwareConfig::default());
        let runner = MockRunner::default();
        let commands = default_pairing_commands();
        let shutdown = AtomicBool::new(false);

        let start = Instant::now();
        let report = PairingWorkflow {
            runner: &runner,
            hardware: &hardware,
            commands: &commands,
            command_timeout: Duration::from_secs(5),
            window: Duration::from_millis(600),
            shutdown: &shutdown,
        }
        .run();

        assert!(start.elapsed() >= Duration::from_millis(600));
        assert_eq!(report.succeeded, 5);
        assert!(report.completed);
        assert_eq!(runner.calls.lock().unwrap()[1], ["bluetoothctl", "discoverable", "on"]);
        assert_eq!(handles.frame(), vec![Rgb::OFF; 4]);
    }

    #[test]
    fn test_all_commands_failing_still_holds_window() {
        let (hardware, handles) = emulated::build(&HardwareConfig::default());
        let runner = MockRunner {
            exit_code: 1,
            ..MockRunner::default()
        };
        let commands = default_pairing_commands();
        let shutdown = AtomicBool::new(false);

        let start = Instant::now();
        let report = PairingWorkflow {
            runner: &runner,
            hardware: &hardware,
            commands: &commands,
            command_timeout: Duration::from_secs(5),
            window: Duration::from_secs(2),
            shutdown: &shutdown,
        }
        .run();

        assert!(!report.is_success());
        assert_eq!(report.failed.len(), 5);
        assert!(report.completed);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(handles.beep_count(), BeepPattern::Error.steps().len());
        assert_eq!(handles.frame(), vec![Rgb::OFF; 4]);
    }

    #[test]
    fn test_partial_failure_is_not_fatal() {
        let (hardware, _handles) = emulated::build(&HardwareConfig::default());
        let runner = MockRunner::default();
        let mut commands = default_pairing_commands();
        commands.insert(1, vec!["definitely-missing-tool".to_string()]);
        *runner.failing.lock().unwrap() = vec!["definitely-missing-tool".to_string()];
        let shutdown = AtomicBool::new(false);

        let start = Instant::now();
        let report = PairingWorkflow {
            runner: &runner,
            hardware: &hardware,
            commands: &commands,
            command_timeout: Duration::from_secs(5),
            window: Duration::from_millis(600),
            shutdown: &shutdown,
        }
        .run();

        assert_eq!(runner.calls.lock().unwrap().len(), 6);
        assert_eq!(report.succeeded, 5);
        assert_eq!(report.failed, vec!["definitely-missing-tool".to_string()]);
        assert!(report.is_success());
        assert!(report.completed);
        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    #[test]
    fn test_shutdown_cuts_window_short() {
        let (hardware, _handles) = emulated::build(&HardwareConfig::default());
        let runner = MockRunner::default();
        let shutdown = AtomicBool::new(true);

        let start = Instant::now();
        let report = PairingWorkflow {
            runner: &runner,
            hardware: &hardware,
            commands: &[],
            command_timeout: Duration::from_secs(5),
            window: Duration::from_secs(30),
            shutdown: &shutdown,
        }
        .run();

        assert!(!report.completed);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(shutdown.load(Ordering::SeqCst));
    }
}
