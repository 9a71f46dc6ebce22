//! Stateful GRBL driver.
//!
//! [`GrblController`] owns the serial link and keeps a model of the machine:
//! connection state, tool position and its source, pen state and travel
//! bounds. All methods take `&self`; an internal mutex serializes access so
//! only one command is ever in flight on the link.
//!
//! # Connection lifecycle
//!
//! ```text
//! Disconnected --connect--> Connecting --handshake ok--> Connected
//!      ^                        |                           |
//!      +----handshake failed----+                 I/O error or repeated
//!      |                                          timeouts
//!      +------------disconnect--------------- Faulted <----+
//!                                               |
//!                        soft_reset / connect --+--> Connecting
//! ```
//!
//! # Position sources
//!
//! Position normally follows the work coordinates reported by the
//! controller. After [`update_position_from_camera`](GrblController::update_position_from_camera)
//! the camera-derived position wins and status reports are only remembered,
//! until [`disable_camera_override`](GrblController::disable_camera_override).

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::link::{LinkFactory, SerialLink, SerialPortFactory};
use super::program::{dry_run, DryRunReport, Program, TravelBounds};
use super::protocol::{parse_line, MachineStatus, Response};
use super::{GrblError, GrblResult};

/// Pause between the best-effort stop commands sent on disconnect.
const DISCONNECT_GAP: Duration = Duration::from_millis(100);

/// How long to keep reading for the `ok`/`error` that may trail an alarm.
const ALARM_ACK_GRACE: Duration = Duration::from_millis(250);

fn default_port() -> String {
    if cfg!(windows) {
        "COM3".to_string()
    } else {
        "/dev/ttyUSB0".to_string()
    }
}

/// Driver settings. Durations are stored in milliseconds for readable JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrblConfig {
    pub port: String,
    pub baud: u32,
    /// Distance covered by one `move_relative_step` unit, in mm.
    pub step_size_mm: f64,
    /// Absolute Z for pen down.
    pub pen_down_z: f64,
    /// Absolute Z for pen up.
    pub pen_up_z: f64,
    pub bounds: TravelBounds,
    pub command_timeout_ms: u64,
    /// Wait after opening the port while the board reboots.
    pub wake_delay_ms: u64,
    /// Wait after the wake newlines before flushing their echo.
    pub wake_settle_ms: u64,
    pub handshake_attempts: u32,
    /// Timeouts in a row that fault the connection.
    pub max_consecutive_timeouts: u32,
    /// Pause between streamed program lines.
    pub line_delay_ms: u64,
    pub reset_timeout_ms: u64,
}

impl Default for GrblConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: 115_200,
            step_size_mm: 1.0,
            pen_down_z: -2.0,
            pen_up_z: 0.0,
            bounds: TravelBounds::default(),
            command_timeout_ms: 5_000,
            wake_delay_ms: 2_000,
            wake_settle_ms: 500,
            handshake_attempts: 3,
            max_consecutive_timeouts: 3,
            line_delay_ms: 50,
            reset_timeout_ms: 5_000,
        }
    }
}

impl GrblConfig {
    /// Settings with every delay removed, for simulated controllers.
    pub fn without_delays() -> Self {
        Self {
            command_timeout_ms: 200,
            wake_delay_ms: 0,
            wake_settle_ms: 0,
            line_delay_ms: 0,
            reset_timeout_ms: 200,
            ..Self::default()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    fn wake_delay(&self) -> Duration {
        Duration::from_millis(self.wake_delay_ms)
    }

    fn wake_settle(&self) -> Duration {
        Duration::from_millis(self.wake_settle_ms)
    }

    fn line_delay(&self) -> Duration {
        Duration::from_millis(self.line_delay_ms)
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum PositionSource {
    /// Work coordinates reported by the controller.
    Reported,
    /// Set from the vision system; takes priority over reports.
    CameraOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum PenState {
    Up,
    Down,
}

/// The controller's belief about the tool position, in work millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MachinePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub source: PositionSource,
}

impl MachinePosition {
    fn reported(p: [f64; 3]) -> Self {
        Self {
            x: p[0],
            y: p[1],
            z: p[2],
            source: PositionSource::Reported,
        }
    }
}

/// How a command exchange ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Ok,
    /// Written without waiting for a reply.
    Sent,
    Error { code: Option<u32>, message: String },
    Alarm { code: Option<u32>, message: String },
    Timeout,
}

/// Everything received for one command, terminal token included.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub outcome: CommandOutcome,
    pub responses: Vec<Response>,
}

impl CommandReply {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, CommandOutcome::Ok | CommandOutcome::Sent)
    }

    fn into_result(self, command: &str) -> GrblResult<Self> {
        match &self.outcome {
            CommandOutcome::Ok | CommandOutcome::Sent => Ok(self),
            CommandOutcome::Error { code, message } => Err(GrblError::Protocol {
                code: *code,
                message: message.clone(),
            }),
            CommandOutcome::Alarm { code, message } => Err(GrblError::Alarm {
                code: *code,
                message: message.clone(),
            }),
            CommandOutcome::Timeout => Err(GrblError::Timeout {
                command: command.to_string(),
            }),
        }
    }

    fn describe(&self) -> String {
        match &self.outcome {
            CommandOutcome::Ok => "ok".to_string(),
            CommandOutcome::Sent => "sent".to_string(),
            CommandOutcome::Error { code, message } => match code {
                Some(c) => format!("error:{c} ({message})"),
                None => format!("error ({message})"),
            },
            CommandOutcome::Alarm { code, message } => match code {
                Some(c) => format!("ALARM:{c} ({message})"),
                None => format!("ALARM ({message})"),
            },
            CommandOutcome::Timeout => "timeout".to_string(),
        }
    }
}

/// Result of a streamed program.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramReport {
    pub lines_sent: usize,
    pub dry_run: DryRunReport,
}

/// Write one command and collect replies up to the terminal token.
fn transact(
    link: &mut dyn SerialLink,
    command: &str,
    wait: bool,
    timeout: Duration,
) -> io::Result<CommandReply> {
    trace!("GRBL send: {command:?}");
    link.clear_input()?;
    link.write_all(format!("{command}\n").as_bytes())?;

    if !wait {
        return Ok(CommandReply {
            outcome: CommandOutcome::Sent,
            responses: Vec::new(),
        });
    }
    read_reply(link, timeout)
}

/// Collect replies up to `ok` or `error`.
///
/// An alarm decides the outcome, but GRBL can still acknowledge the line
/// afterwards, so reading continues for up to [`ALARM_ACK_GRACE`] to consume
/// that acknowledgement.
fn read_reply(link: &mut dyn SerialLink, timeout: Duration) -> io::Result<CommandReply> {
    let mut deadline = Instant::now() + timeout;
    let mut responses = Vec::new();
    let mut alarm = None;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let line = if remaining.is_zero() {
            None
        } else {
            link.read_line(remaining)?
        };
        let Some(line) = line else {
            return Ok(CommandReply {
                outcome: alarm.unwrap_or(CommandOutcome::Timeout),
                responses,
            });
        };
        if line.trim().is_empty() {
            continue;
        }
        trace!("GRBL recv: {line:?}");

        let response = parse_line(&line);
        let ack = match &response {
            Response::Ok => Some(CommandOutcome::Ok),
            Response::Error { code, message } => Some(CommandOutcome::Error {
                code: *code,
                message: message.clone(),
            }),
            Response::Alarm { code, message } => {
                if alarm.is_none() {
                    alarm = Some(CommandOutcome::Alarm {
                        code: *code,
                        message: message.clone(),
                    });
                    deadline = deadline.min(Instant::now() + ALARM_ACK_GRACE);
                }
                None
            }
            _ => None,
        };
        responses.push(response);
        if let Some(ack) = ack {
            return Ok(CommandReply {
                outcome: alarm.unwrap_or(ack),
                responses,
            });
        }
    }
}

struct Inner {
    config: GrblConfig,
    link: Option<Box<dyn SerialLink>>,
    state: ConnectionState,
    status_message: String,
    position: MachinePosition,
    /// Last work position reported by the controller, even while overridden.
    reported: Option<[f64; 3]>,
    /// Last work coordinate offset seen in a status report.
    wco: Option<[f64; 3]>,
    machine_status: Option<MachineStatus>,
    pen: PenState,
    consecutive_timeouts: u32,
    /// Commands written without waiting whose `ok`/`error` is still owed.
    unacked: usize,
}

impl Inner {
    fn require_connected(&self) -> GrblResult<()> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            _ => Err(GrblError::NotConnected),
        }
    }

    fn fault(&mut self, reason: &str) {
        warn!("GRBL connection faulted: {reason}");
        self.state = ConnectionState::Faulted;
        self.status_message = format!("Faulted: {reason}");
    }

    /// Drop the link after an I/O failure.
    fn io_fault(&mut self, e: io::Error) -> GrblError {
        self.link = None;
        self.fault(&e.to_string());
        GrblError::Io(e)
    }

    fn ingest(&mut self, response: &Response) {
        match response {
            Response::Status(report) => {
                if report.wco.is_some() {
                    self.wco = report.wco;
                }
                if report.status.is_some() {
                    self.machine_status = report.status;
                }
                let Some(p) = report.work_position(self.wco) else {
                    return;
                };
                self.reported = Some(p);
                if self.position.source == PositionSource::CameraOverride {
                    trace!("Ignoring reported position {p:?} while camera override is active");
                } else {
                    self.position = MachinePosition::reported(p);
                }
            }
            Response::Alarm { code, message } => {
                warn!("GRBL alarm {code:?}: {message}");
                self.machine_status = Some(MachineStatus::Alarm);
            }
            Response::Feedback(msg) => debug!("GRBL feedback: {msg}"),
            _ => {}
        }
    }

    /// Read the replies still owed for commands sent without waiting.
    ///
    /// Returns `false` if one of them never arrived.
    fn drain_unacked(&mut self, link: &mut dyn SerialLink) -> io::Result<bool> {
        let timeout = self.config.command_timeout();
        while self.unacked > 0 {
            let reply = read_reply(link, timeout)?;
            for response in &reply.responses {
                self.ingest(response);
            }
            if reply.outcome == CommandOutcome::Timeout {
                self.unacked = 0;
                return Ok(false);
            }
            debug!("Late reply to an unacknowledged command: {}", reply.describe());
            self.unacked -= 1;
        }
        Ok(true)
    }

    /// One exchange on the link, with fault and timeout accounting.
    ///
    /// Replies owed to earlier unacknowledged commands are read first, so
    /// they are never taken for this command's reply. If one of them times
    /// out, `command` is not written and the exchange ends in a timeout.
    fn exchange(&mut self, command: &str, wait: bool, timeout: Duration) -> GrblResult<CommandReply> {
        let mut link = self.link.take().ok_or(GrblError::NotConnected)?;

        let drained = match self.drain_unacked(link.as_mut()) {
            Ok(drained) => drained,
            Err(e) => return Err(self.io_fault(e)),
        };
        let reply = if drained {
            match transact(link.as_mut(), command, wait, timeout) {
                Ok(reply) => reply,
                Err(e) => return Err(self.io_fault(e)),
            }
        } else {
            warn!("An earlier command was never acknowledged; {command:?} not sent");
            CommandReply {
                outcome: CommandOutcome::Timeout,
                responses: Vec::new(),
            }
        };
        self.link = Some(link);
        if reply.outcome == CommandOutcome::Sent {
            self.unacked += 1;
        }

        for response in &reply.responses {
            self.ingest(response);
        }

        match reply.outcome {
            CommandOutcome::Timeout => {
                self.consecutive_timeouts += 1;
                warn!(
                    "Timeout waiting for {command:?} ({} in a row)",
                    self.consecutive_timeouts
                );
                if self.consecutive_timeouts >= self.config.max_consecutive_timeouts {
                    let n = self.consecutive_timeouts;
                    self.fault(&format!("{n} consecutive timeouts"));
                }
            }
            CommandOutcome::Sent => {}
            _ => self.consecutive_timeouts = 0,
        }

        Ok(reply)
    }

    /// Send a command on a connected link and require success.
    fn command(&mut self, command: &str) -> GrblResult<CommandReply> {
        self.require_connected()?;
        let timeout = self.config.command_timeout();
        self.exchange(command, true, timeout)?.into_result(command)
    }

    fn query_position(&mut self) -> GrblResult<MachinePosition> {
        let reply = self.command("?")?;
        if !reply
            .responses
            .iter()
            .any(|r| matches!(r, Response::Status(_)))
        {
            debug!("Status query acknowledged without a position report");
        }
        Ok(self.position)
    }

    /// Millimetres, absolute positioning, then a position query.
    fn configure(&mut self) -> GrblResult<()> {
        self.command("G21")?;
        self.command("G90")?;
        self.query_position()?;
        Ok(())
    }
}

/// Driver for a GRBL motion controller.
///
/// # Example
///
/// ```no_run
/// use hardware::grbl::{GrblConfig, GrblController};
///
/// let grbl = GrblController::new(GrblConfig::default());
/// grbl.connect("/dev/ttyUSB0", 115200)?;
///
/// grbl.set_step_size(5.0)?;
/// let pos = grbl.move_relative_step(1.0, 0.0, false)?;
/// println!("now at X={:.3} Y={:.3}", pos.x, pos.y);
/// # Ok::<(), hardware::grbl::GrblError>(())
/// ```
pub struct GrblController {
    factory: Arc<dyn LinkFactory>,
    inner: Mutex<Inner>,
}

impl GrblController {
    /// Create a disconnected controller that opens real serial ports.
    pub fn new(config: GrblConfig) -> Self {
        Self::with_factory(config, Arc::new(SerialPortFactory))
    }

    /// Create a disconnected controller that opens links through `factory`.
    pub fn with_factory(config: GrblConfig, factory: Arc<dyn LinkFactory>) -> Self {
        Self {
            factory,
            inner: Mutex::new(Inner {
                config,
                link: None,
                state: ConnectionState::Disconnected,
                status_message: "Not connected".to_string(),
                position: MachinePosition::reported([0.0; 3]),
                reported: None,
                wco: None,
                machine_status: None,
                pen: PenState::Up,
                consecutive_timeouts: 0,
                unacked: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Connection ====================

    /// Serial ports present on this machine.
    pub fn list_available_ports() -> GrblResult<Vec<String>> {
        super::link::list_available_ports()
    }

    /// Open `port`, wake the controller and confirm it answers a status query.
    ///
    /// After the handshake the controller is switched to millimetres and
    /// absolute positioning and its position is queried. Connecting while
    /// already connected is a no-op.
    ///
    /// # Errors
    ///
    /// - [`GrblError::ConnectionFailed`] if the port cannot be opened
    /// - [`GrblError::Handshake`] if no status query is acknowledged within
    ///   the configured number of attempts
    /// - any command error from the units and mode setup
    ///
    /// The port is released and the controller left `Disconnected` in every
    /// case.
    pub fn connect(&self, port: &str, baud: u32) -> GrblResult<()> {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Connected {
            debug!("Already connected");
            return Ok(());
        }

        inner.link = None;
        inner.unacked = 0;
        inner.state = ConnectionState::Connecting;
        inner.status_message = format!("Connecting to {port}");
        debug!("Connecting to {port} at {baud} baud");

        if let Err(e) = self.open_and_handshake(&mut inner, port, baud) {
            inner.link = None;
            inner.state = ConnectionState::Disconnected;
            inner.status_message = format!("Connection failed: {e}");
            warn!("Connection to {port} failed: {e}");
            return Err(e);
        }

        // Lock held throughout: Connected is only visible once setup succeeds
        inner.state = ConnectionState::Connected;
        inner.consecutive_timeouts = 0;
        if let Err(e) = inner.configure() {
            inner.link = None;
            inner.state = ConnectionState::Disconnected;
            inner.status_message = format!("Connection failed: {e}");
            warn!("Setting up {port} failed: {e}");
            return Err(e);
        }

        inner.config.port = port.to_string();
        inner.config.baud = baud;
        inner.status_message = format!("Connected to {port} at {baud} baud");
        info!("{}", inner.status_message);
        Ok(())
    }

    fn open_and_handshake(&self, inner: &mut Inner, port: &str, baud: u32) -> GrblResult<()> {
        let mut link = self.factory.open(port, baud)?;

        thread::sleep(inner.config.wake_delay());
        link.clear_input()?;
        link.write_all(b"\r\n\r\n")?;
        thread::sleep(inner.config.wake_settle());
        link.clear_input()?;

        let timeout = inner.config.command_timeout();
        let attempts = inner.config.handshake_attempts.max(1);
        for attempt in 1..=attempts {
            let reply = transact(link.as_mut(), "?", true, timeout)?;
            if reply.outcome == CommandOutcome::Ok {
                for response in &reply.responses {
                    inner.ingest(response);
                }
                inner.link = Some(link);
                return Ok(());
            }
            warn!(
                "Handshake attempt {attempt}/{attempts} ended with {}",
                reply.describe()
            );
            link.clear_input()?;
        }

        Err(GrblError::Handshake(format!(
            "status query not acknowledged after {attempts} attempts"
        )))
    }

    /// Feed-hold, pen off and unlock (best effort), then release the port.
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        if let Some(mut link) = inner.link.take() {
            for command in ["!", "M5", "$X"] {
                if let Err(e) = link.write_all(format!("{command}\n").as_bytes()) {
                    debug!("Stop sequence interrupted at {command:?}: {e}");
                    break;
                }
                thread::sleep(DISCONNECT_GAP);
            }
        }
        inner.unacked = 0;
        inner.state = ConnectionState::Disconnected;
        inner.status_message = "Not connected".to_string();
        info!("Disconnected");
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Connection state with a human-readable description.
    pub fn connection_status(&self) -> (ConnectionState, String) {
        let inner = self.lock();
        (inner.state, inner.status_message.clone())
    }

    /// Reset the controller with Ctrl-X and wait for its startup banner.
    ///
    /// Works from `Connected` or `Faulted` as long as the port is still open.
    /// Units and positioning mode are re-applied afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`GrblError::ResetFailed`] and leaves the controller `Faulted`
    /// if no banner arrives within the reset timeout. A failed mode setup
    /// also leaves it `Faulted`, with the port open for another reset.
    pub fn soft_reset(&self) -> GrblResult<()> {
        let mut inner = self.lock();
        let mut link = inner.link.take().ok_or(GrblError::NotConnected)?;
        inner.state = ConnectionState::Connecting;
        inner.status_message = "Resetting".to_string();
        info!("Sending soft reset");

        let timeout = inner.config.reset_timeout();
        match wait_for_banner(link.as_mut(), timeout) {
            Ok(Some(banner)) => {
                inner.link = Some(link);
                inner.state = ConnectionState::Connected;
                inner.consecutive_timeouts = 0;
                // The reset flushed GRBL's input, nothing owed any more
                inner.unacked = 0;
                inner.wco = None;
                inner.status_message = format!("Connected ({banner})");
                info!("Controller restarted: {banner}");
                if let Err(e) = inner.configure() {
                    if inner.link.is_some() {
                        inner.fault(&format!("setup after reset failed: {e}"));
                    }
                    return Err(e);
                }
                Ok(())
            }
            Ok(None) => {
                inner.link = Some(link);
                inner.fault("no banner after soft reset");
                Err(GrblError::ResetFailed(format!(
                    "no banner within {} ms",
                    timeout.as_millis()
                )))
            }
            Err(e) => Err(inner.io_fault(e)),
        }
    }

    // ==================== Commands ====================

    /// Send a raw command line.
    ///
    /// With `wait_for_ack` the call blocks until `ok`, `error`, an alarm, or
    /// `timeout`, and the outcome is reported in the reply rather than as an
    /// error. Status reports seen on the way update the position.
    ///
    /// Without it the reply is left owed and read before the next command is
    /// written.
    ///
    /// # Errors
    ///
    /// Only [`GrblError::NotConnected`] and I/O failures are errors.
    pub fn send_command(
        &self,
        command: &str,
        wait_for_ack: bool,
        timeout: Duration,
    ) -> GrblResult<CommandReply> {
        let mut inner = self.lock();
        inner.require_connected()?;
        inner.exchange(command, wait_for_ack, timeout)
    }

    /// Unlock (`$X`), which also re-energizes the steppers.
    pub fn enable_motors(&self) -> GrblResult<()> {
        self.lock().command("$X").map(|_| ())
    }

    /// Put the controller to sleep (`$SLP`), releasing the steppers.
    pub fn disable_motors(&self) -> GrblResult<()> {
        self.lock().command("$SLP").map(|_| ())
    }

    /// The `$$` settings dump.
    pub fn settings(&self) -> GrblResult<BTreeMap<u32, String>> {
        let reply = self.lock().command("$$")?;
        Ok(reply
            .responses
            .into_iter()
            .filter_map(|r| match r {
                Response::Setting { key, value } => Some((key, value)),
                _ => None,
            })
            .collect())
    }

    // ==================== Position ====================

    /// Position as currently believed, without talking to the controller.
    pub fn current_position(&self) -> MachinePosition {
        self.lock().position
    }

    /// Last position reported by the controller, even while overridden.
    pub fn reported_position(&self) -> Option<[f64; 3]> {
        self.lock().reported
    }

    /// Ask the controller for a status report.
    pub fn query_position(&self) -> GrblResult<MachinePosition> {
        self.lock().query_position()
    }

    pub fn machine_status(&self) -> Option<MachineStatus> {
        self.lock().machine_status
    }

    /// Take the position from the vision system until the override is disabled.
    pub fn update_position_from_camera(&self, x: f64, y: f64, z: Option<f64>) {
        let mut inner = self.lock();
        let z = z.unwrap_or(inner.position.z);
        inner.position = MachinePosition {
            x,
            y,
            z,
            source: PositionSource::CameraOverride,
        };
        debug!("Camera position override: X={x:.3} Y={y:.3} Z={z:.3}");
    }

    /// Return to reported positions and re-query the controller.
    ///
    /// If the controller cannot be queried the last report is used.
    pub fn disable_camera_override(&self) -> MachinePosition {
        let mut inner = self.lock();
        inner.position.source = PositionSource::Reported;

        if inner.state == ConnectionState::Connected {
            match inner.query_position() {
                Ok(position) => return position,
                Err(e) => warn!("Position query after override failed: {e}"),
            }
        }
        if let Some(p) = inner.reported {
            inner.position = MachinePosition::reported(p);
        }
        inner.position
    }

    /// Redefine the current position (`G92`) without moving.
    pub fn set_origin(&self, x: f64, y: f64, z: Option<f64>) -> GrblResult<()> {
        let mut command = format!("G92 X{x:.3} Y{y:.3}");
        if let Some(z) = z {
            command.push_str(&format!(" Z{z:.3}"));
        }

        let mut inner = self.lock();
        inner.command(&command)?;
        inner.position.x = x;
        inner.position.y = y;
        if let Some(z) = z {
            inner.position.z = z;
        }
        // The controller reports a fresh offset after G92
        inner.wco = None;
        info!("Origin set: X={x:.3} Y={y:.3} Z={:.3}", inner.position.z);
        Ok(())
    }

    // ==================== Bounds and motion ====================

    pub fn travel_bounds(&self) -> TravelBounds {
        self.lock().config.bounds
    }

    /// Replace the travel bounds.
    ///
    /// # Errors
    ///
    /// Returns [`GrblError::InvalidBounds`] if the bounds are malformed or
    /// would exclude the current position; the old bounds stay in force.
    pub fn set_travel_bounds(&self, bounds: TravelBounds) -> GrblResult<()> {
        let bounds = TravelBounds::new(bounds.min_x, bounds.max_x, bounds.min_y, bounds.max_y)?;
        let mut inner = self.lock();
        let (x, y) = (inner.position.x, inner.position.y);
        if !bounds.contains(x, y) {
            return Err(GrblError::InvalidBounds(format!(
                "current position ({x:.3}, {y:.3}) lies outside {bounds}"
            )));
        }
        inner.config.bounds = bounds;
        info!("Travel bounds set to {bounds}");
        Ok(())
    }

    pub fn step_size(&self) -> f64 {
        self.lock().config.step_size_mm
    }

    pub fn set_step_size(&self, mm: f64) -> GrblResult<()> {
        if !(mm.is_finite() && mm > 0.0) {
            return Err(GrblError::InvalidParameter(format!(
                "step size must be positive, got {mm}"
            )));
        }
        self.lock().config.step_size_mm = mm;
        Ok(())
    }

    /// Move by `(dx, dy)` steps with an absolute rapid.
    ///
    /// The target is checked against the travel bounds first; unless `force`
    /// is set, an out-of-bounds target is rejected without touching the link.
    pub fn move_relative_step(&self, dx: f64, dy: f64, force: bool) -> GrblResult<MachinePosition> {
        let mut inner = self.lock();
        let step = inner.config.step_size_mm;
        let x = inner.position.x + dx * step;
        let y = inner.position.y + dy * step;

        let bounds = inner.config.bounds;
        if !bounds.contains(x, y) {
            if !force {
                return Err(GrblError::OutOfBounds { x, y, bounds });
            }
            warn!("Forcing move to ({x:.3}, {y:.3}) outside {bounds}");
        }

        inner.command(&format!("G90 G0 X{x:.3} Y{y:.3}"))?;
        inner.position.x = x;
        inner.position.y = y;
        Ok(inner.position)
    }

    // ==================== Pen ====================

    pub fn pen_state(&self) -> PenState {
        self.lock().pen
    }

    /// `(down, up)` Z set-points.
    pub fn pen_z_values(&self) -> (f64, f64) {
        let inner = self.lock();
        (inner.config.pen_down_z, inner.config.pen_up_z)
    }

    pub fn set_pen_z_values(&self, down: f64, up: f64) -> GrblResult<()> {
        if !(down.is_finite() && up.is_finite()) {
            return Err(GrblError::InvalidParameter(format!(
                "pen Z values must be finite, got down={down} up={up}"
            )));
        }
        let mut inner = self.lock();
        inner.config.pen_down_z = down;
        inner.config.pen_up_z = up;
        Ok(())
    }

    pub fn pen_down(&self) -> GrblResult<()> {
        self.move_pen(PenState::Down)
    }

    pub fn pen_up(&self) -> GrblResult<()> {
        self.move_pen(PenState::Up)
    }

    fn move_pen(&self, pen: PenState) -> GrblResult<()> {
        let mut inner = self.lock();
        let z = match pen {
            PenState::Down => inner.config.pen_down_z,
            PenState::Up => inner.config.pen_up_z,
        };
        inner.command(&format!("G90 G0 Z{z:.3}"))?;
        inner.position.z = z;
        inner.pen = pen;
        debug!("Pen {pen} (Z={z:.3})");
        Ok(())
    }

    // ==================== Programs ====================

    /// Dry-run `program` against the travel bounds, then stream it line by line.
    ///
    /// Nothing is sent unless the whole dry run passes. The dry run starts in
    /// absolute mode, so `G90` is sent ahead of the first line to match it
    /// whatever mode an earlier command left behind. Streaming stops at the
    /// first line that is not acknowledged. The position is re-queried after
    /// the last line.
    ///
    /// # Errors
    ///
    /// - [`GrblError::ProgramRejected`] from the dry run
    /// - [`GrblError::ProgramLineFailed`] with the failing line and response
    pub fn execute_program(&self, program: &Program) -> GrblResult<ProgramReport> {
        let mut inner = self.lock();
        let start = [inner.position.x, inner.position.y];
        let dry_run = dry_run(program, start, &inner.config.bounds)?;
        inner.command("G90")?;

        let timeout = inner.config.command_timeout();
        let delay = inner.config.line_delay();
        let total = program.lines().len();
        let mut lines_sent = 0;

        for (index, line) in program.executable_lines() {
            trace!("Program line {}/{total}: {line}", index + 1);
            let reply = inner.exchange(&line, true, timeout)?;
            if reply.outcome != CommandOutcome::Ok {
                let response = reply.describe();
                warn!("Program aborted at line {}: {response}", index + 1);
                return Err(GrblError::ProgramLineFailed {
                    index,
                    line,
                    response,
                });
            }
            lines_sent += 1;
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }

        info!("Program complete: {lines_sent} lines sent");
        inner.query_position()?;
        Ok(ProgramReport {
            lines_sent,
            dry_run,
        })
    }

    /// [`execute_program`](Self::execute_program) for program text.
    pub fn execute_gcode(&self, text: &str) -> GrblResult<ProgramReport> {
        self.execute_program(&Program::from_text(text))
    }
}

/// Write Ctrl-X and read until the startup banner, returning it.
fn wait_for_banner(link: &mut dyn SerialLink, timeout: Duration) -> io::Result<Option<String>> {
    link.write_all(&[0x18])?;
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        match link.read_line(remaining)? {
            Some(line) => {
                if let Response::Banner(banner) = parse_line(&line) {
                    return Ok(Some(banner));
                }
                trace!("Skipping {line:?} while waiting for banner");
            }
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grbl::SimulatedGrbl;
    use approx::assert_relative_eq;

    fn connected(sim: &SimulatedGrbl) -> GrblController {
        let grbl = GrblController::with_factory(GrblConfig::without_delays(), Arc::new(sim.clone()));
        grbl.connect("sim", 115_200).unwrap();
        grbl
    }

    #[test]
    fn test_connect_configures_and_queries() {
        let sim = SimulatedGrbl::new();
        sim.set_position([1.0, 2.0, 3.0]);
        let grbl = connected(&sim);

        assert_eq!(grbl.connection_state(), ConnectionState::Connected);
        let pos = grbl.current_position();
        assert_eq!((pos.x, pos.y, pos.z), (1.0, 2.0, 3.0));
        assert_eq!(pos.source, PositionSource::Reported);

        let lines = sim.received_lines();
        let g21 = lines.iter().position(|l| l == "G21").unwrap();
        let g90 = lines.iter().position(|l| l == "G90").unwrap();
        assert!(g21 < g90);
        assert_eq!(lines.last().map(String::as_str), Some("?"));
    }

    #[test]
    fn test_connect_twice_is_noop() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        let before = sim.bytes_received();
        grbl.connect("sim", 115_200).unwrap();
        assert_eq!(sim.bytes_received(), before);
    }

    #[test]
    fn test_handshake_retries_after_lost_replies() {
        let sim = SimulatedGrbl::new();
        sim.drop_replies(2);
        let grbl = connected(&sim);
        assert!(grbl.is_connected());
    }

    #[test]
    fn test_handshake_failure_leaves_disconnected() {
        let sim = SimulatedGrbl::new();
        sim.set_unresponsive(true);
        let grbl = GrblController::with_factory(GrblConfig::without_delays(), Arc::new(sim.clone()));

        let err = grbl.connect("sim", 115_200).unwrap_err();
        assert!(matches!(err, GrblError::Handshake(_)));
        let (state, message) = grbl.connection_status();
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(message.contains("failed"));
    }

    #[test]
    fn test_commands_require_connection() {
        let grbl = GrblController::with_factory(
            GrblConfig::without_delays(),
            Arc::new(SimulatedGrbl::new()),
        );
        assert!(matches!(grbl.pen_down(), Err(GrblError::NotConnected)));
        assert!(matches!(
            grbl.send_command("G0 X1", true, Duration::from_millis(10)),
            Err(GrblError::NotConnected)
        ));
        assert_eq!(grbl.pen_state(), PenState::Up);
    }

    #[test]
    fn test_send_command_reports_protocol_error() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        sim.fail_commands_containing("G38", 20);

        let reply = grbl
            .send_command("G38.2 Z-10", true, Duration::from_millis(100))
            .unwrap();
        assert_eq!(
            reply.outcome,
            CommandOutcome::Error {
                code: Some(20),
                message: crate::grbl::protocol::error_message(20).to_string()
            }
        );
        assert!(grbl.is_connected());
    }

    /// A link replaying fixed lines, then silence.
    struct ScriptedLink(std::collections::VecDeque<String>);

    impl SerialLink for ScriptedLink {
        fn write_all(&mut self, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
            let line = self.0.pop_front();
            if line.is_none() {
                thread::sleep(timeout);
            }
            Ok(line)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_alarm_reply_takes_trailing_ack() {
        let mut link = ScriptedLink(["ALARM:2", "ok", "ok"].map(String::from).into());

        let reply = read_reply(&mut link, Duration::from_secs(1)).unwrap();

        assert!(matches!(reply.outcome, CommandOutcome::Alarm { code: Some(2), .. }));
        assert_eq!(reply.responses.last(), Some(&Response::Ok));
        assert_eq!(link.0.len(), 1);
    }

    #[test]
    fn test_alarm_without_ack_ends_after_grace() {
        let mut link = ScriptedLink(["ALARM:1"].map(String::from).into());
        let started = Instant::now();

        let reply = read_reply(&mut link, Duration::from_secs(10)).unwrap();

        assert!(matches!(reply.outcome, CommandOutcome::Alarm { code: Some(1), .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_alarm_is_reported_and_recorded() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        sim.alarm_on_commands_containing("X900", 2);

        let reply = grbl
            .send_command("G0 X900", true, Duration::from_millis(100))
            .unwrap();
        assert!(matches!(reply.outcome, CommandOutcome::Alarm { code: Some(2), .. }));
        assert_eq!(grbl.machine_status(), Some(MachineStatus::Alarm));
        assert!(grbl.is_connected());
    }

    #[test]
    fn test_late_reply_is_read_before_next_command() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        sim.set_reply_delay(Duration::from_millis(20));

        let sent = grbl
            .send_command("G4 P0", false, Duration::from_millis(5))
            .unwrap();
        assert_eq!(sent.outcome, CommandOutcome::Sent);

        sim.fail_commands_containing("$SLP", 9);
        assert!(matches!(
            grbl.disable_motors(),
            Err(GrblError::Protocol { code: Some(9), .. })
        ));
        grbl.enable_motors().unwrap();
    }

    #[test]
    fn test_missing_late_reply_holds_back_next_command() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        sim.set_unresponsive(true);
        grbl.send_command("G4 P0", false, Duration::from_millis(5))
            .unwrap();
        sim.set_unresponsive(false);

        let reply = grbl
            .send_command("G0 X1", true, Duration::from_millis(100))
            .unwrap();
        assert_eq!(reply.outcome, CommandOutcome::Timeout);
        assert!(!sim.received_lines().contains(&"G0 X1".to_string()));

        // Nothing is owed any more
        let reply = grbl
            .send_command("G0 X1", true, Duration::from_millis(100))
            .unwrap();
        assert_eq!(reply.outcome, CommandOutcome::Ok);
    }

    #[test]
    fn test_failed_setup_leaves_disconnected() {
        let sim = SimulatedGrbl::new();
        sim.fail_commands_containing("G21", 20);
        let grbl = GrblController::with_factory(GrblConfig::without_delays(), Arc::new(sim.clone()));

        assert!(matches!(
            grbl.connect("sim", 115_200),
            Err(GrblError::Protocol { code: Some(20), .. })
        ));
        let (state, message) = grbl.connection_status();
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(message.contains("failed"));

        // A retry goes through the whole sequence again
        assert!(grbl.connect("sim", 115_200).is_err());
        assert_eq!(sim.opens(), 2);
        let g21 = sim.received_lines().iter().filter(|l| *l == "G21").count();
        assert_eq!(g21, 2);
    }

    #[test]
    fn test_repeated_timeouts_fault_connection() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        sim.set_unresponsive(true);

        for _ in 0..2 {
            let reply = grbl
                .send_command("G4 P0", true, Duration::from_millis(5))
                .unwrap();
            assert_eq!(reply.outcome, CommandOutcome::Timeout);
        }
        assert!(grbl.is_connected());

        grbl.send_command("G4 P0", true, Duration::from_millis(5))
            .unwrap();
        assert_eq!(grbl.connection_state(), ConnectionState::Faulted);
        assert!(matches!(grbl.pen_up(), Err(GrblError::NotConnected)));
    }

    #[test]
    fn test_io_error_faults_and_drops_link() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        sim.set_io_failure(true);

        assert!(matches!(grbl.query_position(), Err(GrblError::Io(_))));
        assert_eq!(grbl.connection_state(), ConnectionState::Faulted);
        // Port is gone, so a reset cannot recover
        assert!(matches!(grbl.soft_reset(), Err(GrblError::NotConnected)));

        sim.set_io_failure(false);
        grbl.connect("sim", 115_200).unwrap();
        assert!(grbl.is_connected());
    }

    #[test]
    fn test_move_within_bounds() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        grbl.set_step_size(2.5).unwrap();

        let pos = grbl.move_relative_step(1.0, -2.0, false).unwrap();
        assert_relative_eq!(pos.x, 2.5);
        assert_relative_eq!(pos.y, -5.0);
        assert_eq!(sim.received_lines().last().unwrap(), "G90 G0 X2.500 Y-5.000");
        assert_relative_eq!(sim.position()[0], 2.5);
    }

    #[test]
    fn test_forced_move_ignores_bounds() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        let pos = grbl.move_relative_step(50.0, 0.0, true).unwrap();
        assert_relative_eq!(pos.x, 50.0);
    }

    #[test]
    fn test_step_size_validation() {
        let grbl = GrblController::new(GrblConfig::default());
        assert_eq!(grbl.step_size(), 1.0);
        assert!(grbl.set_step_size(0.0).is_err());
        assert!(grbl.set_step_size(f64::INFINITY).is_err());
        assert_eq!(grbl.step_size(), 1.0);
    }

    #[test]
    fn test_pen_moves_update_state() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        grbl.set_pen_z_values(-5.0, 1.0).unwrap();
        assert_eq!(grbl.pen_z_values(), (-5.0, 1.0));

        grbl.pen_down().unwrap();
        assert_eq!(grbl.pen_state(), PenState::Down);
        assert_relative_eq!(grbl.current_position().z, -5.0);
        assert_eq!(sim.received_lines().last().unwrap(), "G90 G0 Z-5.000");

        sim.fail_commands_containing("Z1.000", 9);
        assert!(matches!(grbl.pen_up(), Err(GrblError::Protocol { code: Some(9), .. })));
        assert_eq!(grbl.pen_state(), PenState::Down);
    }

    #[test]
    fn test_set_origin() {
        let sim = SimulatedGrbl::new();
        sim.set_position([7.0, 8.0, 0.0]);
        let grbl = connected(&sim);

        grbl.set_origin(0.0, 0.0, Some(0.0)).unwrap();
        let pos = grbl.current_position();
        assert_eq!((pos.x, pos.y, pos.z), (0.0, 0.0, 0.0));

        // The controller agrees once it reports its new offset
        let queried = grbl.query_position().unwrap();
        assert_relative_eq!(queried.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(queried.y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_camera_override_suppresses_reports() {
        let sim = SimulatedGrbl::new();
        sim.set_position([1.0, 1.0, 0.0]);
        let grbl = connected(&sim);

        grbl.update_position_from_camera(4.0, 5.0, None);
        let pos = grbl.query_position().unwrap();
        assert_eq!((pos.x, pos.y), (4.0, 5.0));
        assert_eq!(pos.source, PositionSource::CameraOverride);
        assert_eq!(grbl.reported_position(), Some([1.0, 1.0, 0.0]));

        let pos = grbl.disable_camera_override();
        assert_eq!((pos.x, pos.y), (1.0, 1.0));
        assert_eq!(pos.source, PositionSource::Reported);
    }

    #[test]
    fn test_disable_override_offline_uses_last_report() {
        let sim = SimulatedGrbl::new();
        sim.set_position([3.0, 3.0, 0.0]);
        let grbl = connected(&sim);
        grbl.disconnect();

        grbl.update_position_from_camera(9.0, 9.0, Some(1.0));
        let pos = grbl.disable_camera_override();
        assert_eq!((pos.x, pos.y, pos.z), (3.0, 3.0, 0.0));
    }

    #[test]
    fn test_settings_dump() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        let settings = grbl.settings().unwrap();
        assert_eq!(settings.get(&110).map(String::as_str), Some("500.000"));
        assert!(settings.len() > 5);
    }

    #[test]
    fn test_motor_commands() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        grbl.disable_motors().unwrap();
        assert_eq!(sim.received_lines().last().unwrap(), "$SLP");
        grbl.enable_motors().unwrap();
        assert_eq!(sim.received_lines().last().unwrap(), "$X");
    }

    #[test]
    fn test_soft_reset_reapplies_modes() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        let before = sim.received_lines().len();

        grbl.soft_reset().unwrap();
        assert!(grbl.is_connected());
        let after = sim.received_lines();
        assert_eq!(&after[before..], ["G21", "G90", "?"]);
        assert_eq!(sim.resets(), 1);
    }

    #[test]
    fn test_soft_reset_without_banner_faults() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        sim.set_banner_on_reset(false);

        assert!(matches!(grbl.soft_reset(), Err(GrblError::ResetFailed(_))));
        assert_eq!(grbl.connection_state(), ConnectionState::Faulted);

        sim.set_banner_on_reset(true);
        grbl.soft_reset().unwrap();
        assert!(grbl.is_connected());
    }

    #[test]
    fn test_program_streams_and_resyncs() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        grbl.set_travel_bounds(TravelBounds::new(0.0, 200.0, 0.0, 150.0).unwrap())
            .unwrap();

        let report = grbl
            .execute_gcode("G90 ; absolute\n(square)\nG0 X10 Y10\nG1 X50 Y10 F300\nG1 X50 Y50\n")
            .unwrap();
        assert_eq!(report.lines_sent, 4);
        assert_eq!(report.dry_run.checked_moves, 3);

        let pos = grbl.current_position();
        assert_eq!((pos.x, pos.y), (50.0, 50.0));
        assert!(sim.received_lines().contains(&"G90".to_string()));
    }

    #[test]
    fn test_program_starts_in_absolute_mode() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        grbl.send_command("G91", true, Duration::from_millis(100))
            .unwrap();

        grbl.execute_program(&Program::from_lines(["G0 X8 Y5"]))
            .unwrap();

        assert_eq!(sim.position(), [8.0, 5.0, 0.0]);
        let lines = sim.received_lines();
        assert_eq!(&lines[lines.len() - 3..], ["G90", "G0 X8 Y5", "?"]);
    }

    #[test]
    fn test_program_aborts_at_failing_line() {
        let sim = SimulatedGrbl::new();
        let grbl = connected(&sim);
        sim.fail_commands_containing("X5 ", 33);

        let err = grbl
            .execute_program(&Program::from_lines(["G0 X1 Y1", "G0 X5 Y5", "G0 X2 Y2"]))
            .unwrap_err();
        match err {
            GrblError::ProgramLineFailed {
                index,
                line,
                response,
            } => {
                assert_eq!(index, 1);
                assert_eq!(line, "G0 X5 Y5");
                assert!(response.starts_with("error:33"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!sim.received_lines().contains(&"G0 X2 Y2".to_string()));
    }
}
