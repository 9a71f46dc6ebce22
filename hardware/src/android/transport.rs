//! Device-automation transport.
//!
//! [`DeviceTransport`] is the narrow set of ADB primitives the camera
//! controller composes everything from: device enumeration, shell commands,
//! raw `exec-out` capture and file pull. [`AdbTransport`] runs the `adb`
//! executable with a hard timeout per call.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::{DeviceError, DeviceResult};

/// Poll interval while waiting for an `adb` child to exit.
const CHILD_POLL: Duration = Duration::from_millis(20);

/// Timeout for `adb devices` and `adb version`.
const ENUMERATE_TIMEOUT: Duration = Duration::from_secs(15);

/// Captured result of one transport command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout as trimmed text, invalid UTF-8 replaced.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Primitive operations on an attached device.
pub trait DeviceTransport: Send + Sync {
    /// Serials of attached devices that are ready (`device` state).
    fn devices(&self) -> DeviceResult<Vec<String>>;

    /// Run a shell command on `serial`.
    ///
    /// A non-zero exit is reported through [`CommandOutput::status`]; only
    /// transport failures and timeouts are errors.
    fn shell(&self, serial: &str, args: &[&str], timeout: Duration) -> DeviceResult<CommandOutput>;

    /// Binary stdout of a command run without a terminal (`adb exec-out`).
    fn exec_out(&self, serial: &str, args: &[&str], timeout: Duration) -> DeviceResult<Vec<u8>>;

    /// Copy the device file `remote` to `local`.
    fn pull(&self, serial: &str, remote: &str, local: &Path, timeout: Duration) -> DeviceResult<()>;
}

/// Parse `adb devices` output into ready serials.
pub fn parse_devices(listing: &str) -> Vec<String> {
    listing
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// [`DeviceTransport`] backed by the `adb` command-line tool.
#[derive(Debug, Clone)]
pub struct AdbTransport {
    program: PathBuf,
}

impl Default for AdbTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl AdbTransport {
    /// Use `adb` from `PATH`.
    pub fn new() -> Self {
        Self::with_program("adb")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// `adb version`, confirming the tool is installed and runs.
    pub fn version(&self) -> DeviceResult<String> {
        let out = self.run(&["version"], ENUMERATE_TIMEOUT)?;
        let text = out.stdout_text();
        Self::require_success("adb version", out)?;
        Ok(text.lines().next().unwrap_or_default().to_string())
    }

    fn require_success(command: &str, out: CommandOutput) -> DeviceResult<CommandOutput> {
        if out.success() {
            Ok(out)
        } else {
            Err(DeviceError::CommandFailed {
                command: command.to_string(),
                status: out.status,
                stderr: out.stderr,
            })
        }
    }

    /// Spawn `adb args...` and wait at most `timeout` for it to exit.
    fn run(&self, args: &[&str], timeout: Duration) -> DeviceResult<CommandOutput> {
        let command = format!("{} {}", self.program.display(), args.join(" "));
        trace!("exec: {command}");

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain both pipes concurrently so a large screencap cannot block the child
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                if let Err(e) = child.kill() {
                    debug!("Failed to kill timed out adb child: {e}");
                }
                let _ = child.wait();
                return Err(DeviceError::Timeout { command, timeout });
            }
            thread::sleep(CHILD_POLL);
        };

        let stdout = join_reader(stdout)?;
        let stderr = String::from_utf8_lossy(&join_reader(stderr)?).trim().to_string();
        trace!(
            "exit {:?}: {} bytes stdout, stderr {stderr:?}",
            status.code(),
            stdout.len()
        );

        Ok(CommandOutput {
            status: status.code(),
            stdout,
            stderr,
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn join_reader(reader: Option<JoinHandle<io::Result<Vec<u8>>>>) -> io::Result<Vec<u8>> {
    match reader {
        Some(handle) => handle
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("pipe reader panicked"))),
        None => Ok(Vec::new()),
    }
}

impl DeviceTransport for AdbTransport {
    fn devices(&self) -> DeviceResult<Vec<String>> {
        let out = Self::require_success("adb devices", self.run(&["devices"], ENUMERATE_TIMEOUT)?)?;
        Ok(parse_devices(&out.stdout_text()))
    }

    fn shell(&self, serial: &str, args: &[&str], timeout: Duration) -> DeviceResult<CommandOutput> {
        let mut full = vec!["-s", serial, "shell"];
        full.extend_from_slice(args);
        self.run(&full, timeout)
    }

    fn exec_out(&self, serial: &str, args: &[&str], timeout: Duration) -> DeviceResult<Vec<u8>> {
        let mut full = vec!["-s", serial, "exec-out"];
        full.extend_from_slice(args);
        let out = Self::require_success(&full.join(" "), self.run(&full, timeout)?)?;

        let mut data = out.stdout;
        // Windows adb builds may prepend a line ending to binary output
        if cfg!(windows) {
            let skip = if data.starts_with(b"\r\n") {
                2
            } else if data.starts_with(b"\n") {
                1
            } else {
                0
            };
            data.drain(..skip);
        }
        Ok(data)
    }

    fn pull(&self, serial: &str, remote: &str, local: &Path, timeout: Duration) -> DeviceResult<()> {
        let local = local.to_string_lossy();
        let args = ["-s", serial, "pull", remote, &*local];
        Self::require_success(&args.join(" "), self.run(&args, timeout)?)?;
        Ok(())
    }
}
