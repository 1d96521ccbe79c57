//! Child processes with a hard deadline.
//!
//! The child is owned by a guard that kills and reaps it on every exit path, so a misbehaving
//! OS utility can never outlive the call that started it.

use std::io::{self, BufRead as _, BufReader, Read as _};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct BoundedOutput {
    /// `None` when the deadline elapsed and the child was killed.
    pub status: Option<ExitStatus>,
    /// Everything read from stdout (partial when killed).
    pub stdout: Vec<u8>,
}

impl BoundedOutput {
    pub fn timed_out(&self) -> bool {
        self.status.is_none()
    }
}

struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Ok(None) = self.0.try_wait() {
            if let Err(error) = self.0.kill() {
                debug!(%error, pid = self.0.id(), "Couldn't kill child process");
            }
        }

        // Reap to avoid leaving a zombie behind.
        let _ = self.0.wait();
    }
}

/// Runs `command`, draining its output, and kills it once `timeout` has elapsed.
///
/// stdout is collected, stderr lines are traced.
pub fn run_bounded(mut command: Command, timeout: Duration) -> io::Result<BoundedOutput> {
    let program = command.get_program().to_string_lossy().into_owned();

    command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = ChildGuard(command.spawn()?);

    debug!(%program, pid = child.0.id(), ?timeout, "Spawned child process");

    let stdout_rx = child.0.stdout.take().map(|mut stdout| {
        let (tx, rx) = mpsc::channel();
        let program = program.clone();

        thread::spawn(move || {
            let mut buf = Vec::new();
            if let Err(error) = stdout.read_to_end(&mut buf) {
                trace!(%program, %error, "Failed to read stdout");
            }
            let _ = tx.send(buf);
        });

        rx
    });

    if let Some(stderr) = child.0.stderr.take() {
        let program = program.clone();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                trace!(%program, "{line}");
            }
        });
    }

    // `None` when the timeout is too large to be represented: no deadline.
    let deadline = Instant::now().checked_add(timeout);

    let status = loop {
        if let Some(status) = child.0.try_wait()? {
            break Some(status);
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break None;
        }

        thread::sleep(POLL_INTERVAL);
    };

    let stdout = match status {
        // A grandchild holding the inherited pipe keeps it open past the exit of the child.
        Some(_) => match (stdout_rx, deadline) {
            (None, _) => Vec::new(),
            (Some(rx), None) => rx.recv().unwrap_or_default(),
            (Some(rx), Some(deadline)) => {
                match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(stdout) => stdout,
                    Err(_) => {
                        debug!(%program, "Deadline elapsed while draining stdout");
                        Vec::new()
                    }
                }
            }
        },
        None => {
            debug!(%program, "Deadline elapsed, killing child process");
            // The reader thread ends by itself once the pipe closes.
            drop(child);
            Vec::new()
        }
    };

    Ok(BoundedOutput { status, stdout })
}
