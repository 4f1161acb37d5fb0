use std::{
    io::Read,
    process::{Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{trace, warn};

use crate::errors::ProcessError;

static POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What an external tool printed, decoded leniently, with how it exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    fn new(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            success: status.success(),
            status: status.to_string(),
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }

    /// Both streams, for diagnostics
    #[must_use]
    pub fn output(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

#[must_use]
pub fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

/// Runs `command` to completion, capturing both output streams.
///
/// With a `timeout` the child is polled and killed once the deadline passes.
///
/// ## Errors
///
/// Fails if the program can't be spawned, waited on, or runs past `timeout`.
/// A non-zero exit is not an error, check `Captured::success`.
pub fn run(command: &mut Command, timeout: Option<Duration>) -> Result<Captured, ProcessError> {
    let program = program_name(command);
    trace!("running {command:?}");

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

    let Some(timeout) = timeout else {
        let output = child
            .wait_with_output()
            .map_err(|source| ProcessError::Wait { program, source })?;
        return Ok(Captured::new(output.status, &output.stdout, &output.stderr));
    };

    // Pipes are drained on the side so a chatty child never blocks on a full pipe
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let deadline = Instant::now() + timeout;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                if let Err(err) = child.kill() {
                    warn!("couldn't kill {program}: {err}");
                }
                let _ = child.wait();
                return Err(ProcessError::TimedOut {
                    program,
                    after: timeout,
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => return Err(ProcessError::Wait { program, source }),
        }
    };

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();

    Ok(Captured::new(status, &stdout, &stderr))
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}
