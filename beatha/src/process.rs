//! External process control.
//!
//! Bridges (`socat`, `rfcomm`), pairing (`bluetoothctl`) and cloud sync
//! (`rclone`) are opaque external programs. The core only needs to start
//! them, check liveness, stop them and run short commands with a deadline;
//! [`Spawner`] and [`CommandRunner`] are the seams tests replace.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running child process.
pub trait ChildProcess: Send {
    /// OS process id.
    fn id(&self) -> u32;

    /// Whether the process is still running. Reaps it if it exited.
    fn is_alive(&mut self) -> bool;

    /// Ask the process to exit (SIGTERM on Unix).
    fn terminate(&mut self) -> Result<()>;

    /// Wait up to `timeout` for exit. Returns whether the process exited.
    fn wait_timeout(&mut self, timeout: Duration) -> Result<bool>;

    /// Kill the process and reap it.
    fn kill(&mut self) -> Result<()>;
}

/// Starts long-running child processes.
pub trait Spawner: Send + Sync {
    /// Spawn `argv[0]` with the remaining arguments.
    fn spawn(&self, argv: &[String]) -> Result<Box<dyn ChildProcess>>;
}

/// Outcome of a short command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal or by the timeout.
    pub code: Option<i32>,
    /// Whether the deadline killed the command.
    pub timed_out: bool,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.timed_out
    }
}

/// Runs short commands to completion.
pub trait CommandRunner: Send + Sync {
    /// Run `argv` and wait at most `timeout`.
    fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// [`ChildProcess`] backed by [`std::process::Child`].
#[derive(Debug)]
pub struct SystemChild {
    child: Child,
    program: String,
}

impl ChildProcess for SystemChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("{} (pid {}) exited: {status}", self.program, self.child.id());
                false
            },
            Err(e) => {
                warn!("Failed to poll {}: {e}", self.program);
                false
            },
        }
    }

    #[cfg(unix)]
    #[allow(unsafe_code)]
    fn terminate(&mut self) -> Result<()> {
        let pid = self.child.id();
        let raw = libc::pid_t::try_from(pid)
            .map_err(|_| Error::Process(format!("pid {pid} out of range")))?;
        // SAFETY: kill(2) only delivers a signal; `raw` is our own child, not yet reaped.
        let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::Process(format!(
                "SIGTERM to {} (pid {pid}) failed: {}",
                self.program,
                std::io::Error::last_os_error()
            )))
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        self.child.kill()?;
        Ok(())
    }

    fn wait_timeout(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.child.try_wait()?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn kill(&mut self) -> Result<()> {
        // Killing an already reaped child reports InvalidInput; that is fine.
        if let Err(e) = self.child.kill() {
            trace!("kill {}: {e}", self.program);
        }
        self.child.wait()?;
        Ok(())
    }
}

/// Spawns real OS processes with null stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpawner;

fn split_argv(argv: &[String]) -> Result<(&String, &[String])> {
    argv.split_first()
        .ok_or_else(|| Error::Process("empty command line".to_string()))
}

impl Spawner for SystemSpawner {
    fn spawn(&self, argv: &[String]) -> Result<Box<dyn ChildProcess>> {
        let (program, args) = split_argv(argv)?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Process(format!("failed to start {program}: {e}")))?;
        debug!("Started {} (pid {})", argv.join(" "), child.id());
        Ok(Box::new(SystemChild {
            child,
            program: program.clone(),
        }))
    }
}

/// Runs real OS commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput> {
        let (program, args) = split_argv(argv)?;
        trace!("Running {}", argv.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Process(format!("failed to run {program}: {e}")))?;

        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if Instant::now() >= deadline {
                timed_out = true;
                let _ = child.kill();
                child.wait()?;
                break None;
            }
            thread::sleep(POLL_INTERVAL);
        };

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }

        Ok(CommandOutput {
            code: status.and_then(|s| s.code()),
            timed_out,
            stderr: stderr.trim().to_string(),
        })
    }
}

/// Stop the process in `slot`: terminate, wait up to `grace`, then kill.
///
/// The slot is always empty afterwards, whatever the process did. Returns
/// whether there was a process to stop.
pub fn stop_process(slot: &mut Option<Box<dyn ChildProcess>>, grace: Duration) -> bool {
    let Some(mut child) = slot.take() else {
        return false;
    };
    let pid = child.id();

    if !child.is_alive() {
        debug!("Process {pid} already exited");
        return true;
    }

    if let Err(e) = child.terminate() {
        warn!("Failed to terminate process {pid}: {e}");
    }

    match child.wait_timeout(grace) {
        Ok(true) => debug!("Process {pid} stopped"),
        Ok(false) => {
            warn!("Process {pid} ignored SIGTERM for {grace:?}, killing");
            if let Err(e) = child.kill() {
                warn!("Failed to kill process {pid}: {e}");
            }
        },
        Err(e) => {
            warn!("Waiting for process {pid} failed: {e}, killing");
            if let Err(e) = child.kill() {
                warn!("Failed to kill process {pid}: {e}");
            }
        },
    }
    true
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable processes for unit tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Observable state of one mock process.
    #[derive(Debug, Default)]
    pub struct ProcState {
        pub alive: AtomicBool,
        pub ignore_term: AtomicBool,
        pub terminated: AtomicBool,
        pub killed: AtomicBool,
    }

    pub struct MockChild {
        pub pid: u32,
        pub state: Arc<ProcState>,
    }

    impl ChildProcess for MockChild {
        fn id(&self) -> u32 {
            self.pid
        }

        fn is_alive(&mut self) -> bool {
            self.state.alive.load(Ordering::SeqCst)
        }

        fn terminate(&mut self) -> Result<()> {
            self.state.terminated.store(true, Ordering::SeqCst);
            if !self.state.ignore_term.load(Ordering::SeqCst) {
                self.state.alive.store(false, Ordering::SeqCst);
            }
            Ok(())
        }

        fn wait_timeout(&mut self, timeout: Duration) -> Result<bool> {
            if self.state.alive.load(Ordering::SeqCst) {
                thread::sleep(timeout);
            }
            Ok(!self.state.alive.load(Ordering::SeqCst))
        }

        fn kill(&mut self) -> Result<()> {
            self.state.killed.store(true, Ordering::SeqCst);
            self.state.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    pub fn child(ignore_term: bool) -> (Box<dyn ChildProcess>, Arc<ProcState>) {
        let state = Arc::new(ProcState::default());
        state.alive.store(true, Ordering::SeqCst);
        state
            .ignore_term
            .store(ignore_term, Ordering::SeqCst);
        let child = MockChild {
            pid: 4242,
            state: Arc::clone(&state),
        };
        (Box::new(child), state)
    }

    /// Spawner recording every command line it was asked to start.
    #[derive(Default)]
    pub struct MockSpawner {
        pub spawned: Mutex<Vec<Vec<String>>>,
        pub children: Mutex<Vec<Arc<ProcState>>>,
        pub fail: AtomicBool,
        next_pid: AtomicU32,
    }

    impl MockSpawner {
        pub fn spawn_count(&self) -> usize {
            self.spawned.lock().unwrap().len()
        }

        pub fn last(&self) -> Option<Arc<ProcState>> {
            self.children.lock().unwrap().last().cloned()
        }
    }

    impl Spawner for MockSpawner {
        fn spawn(&self, argv: &[String]) -> Result<Box<dyn ChildProcess>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Process("spawn refused".to_string()));
            }
            self.spawned.lock().unwrap().push(argv.to_vec());
            let state = Arc::new(ProcState::default());
            state.alive.store(true, Ordering::SeqCst);
            self.children
                .lock()
                .unwrap()
                .push(Arc::clone(&state));
            Ok(Box::new(MockChild {
                pid: 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
                state,
            }))
        }
    }

    /// Runner recording commands, answering with a fixed exit code.
    ///
    /// Programs listed in `failing` cannot be started.
    #[derive(Default)]
    pub struct MockRunner {
        pub calls: Mutex<Vec<Vec<String>>>,
        pub exit_code: i32,
        pub runs: AtomicUsize,
        pub failing: Mutex<Vec<String>>,
    }

    impl CommandRunner for MockRunner {
        fn run(&self, argv: &[String], _timeout: Duration) -> Result<CommandOutput> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(argv.to_vec());
            if argv
                .first()
                .is_some_and(|program| self.failing.lock().unwrap().contains(program))
            {
                return Err(Error::Process(format!("{} not found", argv[0])));
            }
            Ok(CommandOutput {
                code: Some(self.exit_code),
                timed_out: false,
                stderr: String::new(),
            })
        }
    }
}
