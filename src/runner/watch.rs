/// Cancellation and timeout supervision for running scripts
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ExecutionError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between SIGTERM and SIGKILL
#[cfg(unix)]
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Shared flag that aborts every in-progress and future step when tripped
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a supervised process was stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Cancelled,
    TimedOut(Duration),
}

impl Interruption {
    pub fn into_error(self, step: &str) -> ExecutionError {
        match self {
            Self::Cancelled => ExecutionError::Cancelled {
                step: step.to_string(),
            },
            Self::TimedOut(timeout) => ExecutionError::TimedOut {
                step: step.to_string(),
                timeout,
            },
        }
    }
}

/// Per-run supervision: a cancellation token and an optional timeout
#[derive(Debug, Clone)]
pub struct Watchdog {
    cancel: CancelToken,
    timeout: Option<Duration>,
}

impl Watchdog {
    pub fn new(cancel: CancelToken, timeout: Option<Duration>) -> Self {
        Self { cancel, timeout }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Wait for a child, stopping it on cancellation or timeout.
    ///
    /// Returns the exit code, or the interruption that stopped the child.
    pub fn wait(&self, child: &mut Child) -> std::io::Result<Result<i32, Interruption>> {
        let start = Instant::now();

        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Ok(exit_code(status)));
            }

            let interruption = if self.cancel.is_cancelled() {
                Some(Interruption::Cancelled)
            } else {
                self.timeout
                    .filter(|timeout| start.elapsed() >= *timeout)
                    .map(Interruption::TimedOut)
            };

            if let Some(interruption) = interruption {
                terminate(child)?;
                return Ok(Err(interruption));
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}

/// Ask the child to stop, then kill it if it ignores the request
#[cfg(unix)]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    if kill(pid, Signal::SIGTERM).is_ok() {
        let start = Instant::now();
        while start.elapsed() < TERMINATE_GRACE {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    child.kill()?;
    child.wait()?; // Reap zombie
    Ok(())
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    child.kill()?;
    child.wait()?;
    Ok(())
}
