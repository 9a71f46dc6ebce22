//! In-memory GRBL controller.
//!
//! [`SimulatedGrbl`] interprets the subset of GRBL the driver uses and answers
//! the way a GRBL 1.1 board does. Handles are cheap clones sharing one
//! machine, so a test can keep one handle for inspection while the
//! controller owns a link opened from another.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use super::link::{LinkFactory, SerialLink};
use super::program::parse_words;
use super::protocol::MachineStatus;
use super::GrblError;

const BANNER: &str = "Grbl 1.1h ['$' for help]";

fn default_settings() -> BTreeMap<u32, String> {
    [
        (0, "10"),
        (1, "25"),
        (13, "0"),
        (20, "0"),
        (22, "0"),
        (100, "80.000"),
        (101, "80.000"),
        (102, "400.000"),
        (110, "500.000"),
        (111, "500.000"),
        (112, "250.000"),
        (130, "200.000"),
        (131, "150.000"),
        (132, "10.000"),
    ]
    .into_iter()
    .map(|(k, v)| (k, v.to_string()))
    .collect()
}

struct SimState {
    mpos: [f64; 3],
    wco: [f64; 3],
    absolute: bool,
    status: MachineStatus,
    settings: BTreeMap<u32, String>,
    line_buf: String,
    /// Replies with the instant they become readable.
    output: VecDeque<(Instant, String)>,
    received: Vec<u8>,
    lines: Vec<String>,
    resets: usize,
    opens: usize,
    // Fault injection
    unresponsive: bool,
    banner_on_reset: bool,
    drop_replies: usize,
    reply_delay: Duration,
    failures: Vec<(String, u32)>,
    alarms: Vec<(String, u32)>,
    io_failure: bool,
    refuse_open: bool,
}

impl SimState {
    fn new() -> Self {
        Self {
            mpos: [0.0; 3],
            wco: [0.0; 3],
            absolute: true,
            status: MachineStatus::Idle,
            settings: default_settings(),
            line_buf: String::new(),
            output: VecDeque::new(),
            received: Vec::new(),
            lines: Vec::new(),
            resets: 0,
            opens: 0,
            unresponsive: false,
            banner_on_reset: true,
            drop_replies: 0,
            reply_delay: Duration::ZERO,
            failures: Vec::new(),
            alarms: Vec::new(),
            io_failure: false,
            refuse_open: false,
        }
    }

    fn work_position(&self) -> [f64; 3] {
        [
            self.mpos[0] - self.wco[0],
            self.mpos[1] - self.wco[1],
            self.mpos[2] - self.wco[2],
        ]
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.received.extend_from_slice(bytes);
        for &b in bytes {
            match b {
                0x18 => self.soft_reset(),
                b'\n' => {
                    let line = std::mem::take(&mut self.line_buf);
                    self.handle_line(line.trim());
                }
                b'\r' => {}
                _ => self.line_buf.push(b as char),
            }
        }
    }

    fn reply(&mut self, line: impl Into<String>) {
        if !self.unresponsive {
            let ready = Instant::now() + self.reply_delay;
            self.output.push_back((ready, line.into()));
        }
    }

    fn soft_reset(&mut self) {
        self.resets += 1;
        self.line_buf.clear();
        self.absolute = true;
        self.status = MachineStatus::Idle;
        if self.banner_on_reset {
            self.reply("");
            self.reply(BANNER);
        }
    }

    fn status_line(&self) -> String {
        let [x, y, z] = self.mpos;
        let [wx, wy, wz] = self.wco;
        format!(
            "<{}|MPos:{x:.3},{y:.3},{z:.3}|FS:0,0|WCO:{wx:.3},{wy:.3},{wz:.3}>",
            self.status
        )
    }

    fn handle_line(&mut self, line: &str) {
        trace!("sim recv: {line:?}");
        if !line.is_empty() {
            self.lines.push(line.to_string());
            if self.drop_replies > 0 {
                self.drop_replies -= 1;
                return;
            }
        }

        if let Some(&(_, code)) = self.failures.iter().find(|(p, _)| line.contains(p.as_str())) {
            self.reply(format!("error:{code}"));
            return;
        }
        if let Some(&(_, code)) = self.alarms.iter().find(|(p, _)| line.contains(p.as_str())) {
            self.status = MachineStatus::Alarm;
            self.reply(format!("ALARM:{code}"));
            self.reply("ok");
            return;
        }

        match line {
            "" => {}
            "?" => {
                let status = self.status_line();
                self.reply(status);
            }
            "!" => self.status = MachineStatus::Hold,
            "$$" => {
                let dump: Vec<String> = self
                    .settings
                    .iter()
                    .map(|(k, v)| format!("${k}={v}"))
                    .collect();
                for line in dump {
                    self.reply(line);
                }
            }
            "$X" => {
                self.status = MachineStatus::Idle;
                self.reply("[MSG:Caution: Unlocked]");
            }
            "$SLP" => {
                self.status = MachineStatus::Sleep;
                self.reply("[MSG:Sleeping]");
            }
            _ if line.starts_with('$') => {
                let parsed = line[1..]
                    .split_once('=')
                    .and_then(|(k, v)| Some((k.parse::<u32>().ok()?, v.to_string())));
                match parsed {
                    Some((key, value)) => {
                        self.settings.insert(key, value);
                    }
                    None => {
                        self.reply("error:3");
                        return;
                    }
                }
            }
            _ => self.execute_gcode(line),
        }
        self.reply("ok");
    }

    fn execute_gcode(&mut self, line: &str) {
        let words = parse_words(line);
        let mut set_offset = false;
        for &(letter, value) in &words {
            if letter == 'G' {
                match (value * 10.0).round() as i64 {
                    900 => self.absolute = true,
                    910 => self.absolute = false,
                    920 => set_offset = true,
                    _ => {}
                }
            }
        }

        for (axis, letter) in ['X', 'Y', 'Z'].into_iter().enumerate() {
            let Some(&(_, value)) = words.iter().find(|(l, _)| *l == letter) else {
                continue;
            };
            if set_offset {
                self.wco[axis] = self.mpos[axis] - value;
            } else if self.absolute {
                self.mpos[axis] = value + self.wco[axis];
            } else {
                self.mpos[axis] += value;
            }
        }
    }
}

/// Simulated GRBL board.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use hardware::grbl::{GrblConfig, GrblController, SimulatedGrbl};
///
/// let sim = SimulatedGrbl::new();
/// let grbl = GrblController::with_factory(GrblConfig::without_delays(), Arc::new(sim.clone()));
/// grbl.connect("sim", 115200).unwrap();
/// grbl.move_relative_step(2.0, 3.0, false).unwrap();
/// assert_eq!(sim.position(), [2.0, 3.0, 0.0]);
/// ```
#[derive(Clone)]
pub struct SimulatedGrbl {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedGrbl {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGrbl {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A link to this machine.
    pub fn link(&self) -> SimulatedLink {
        SimulatedLink {
            state: self.state.clone(),
        }
    }

    /// Place the machine at `mpos` with a zero work offset.
    pub fn set_position(&self, mpos: [f64; 3]) {
        let mut state = self.lock();
        state.mpos = mpos;
        state.wco = [0.0; 3];
    }

    /// Current work position.
    pub fn position(&self) -> [f64; 3] {
        self.lock().work_position()
    }

    /// Every byte written to the machine so far.
    pub fn received(&self) -> Vec<u8> {
        self.lock().received.clone()
    }

    pub fn bytes_received(&self) -> usize {
        self.lock().received.len()
    }

    /// Non-empty command lines, in order of arrival.
    pub fn received_lines(&self) -> Vec<String> {
        self.lock().lines.clone()
    }

    /// Soft resets seen.
    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    /// Links opened through the [`LinkFactory`] impl.
    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    /// Stop answering anything.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.lock().unresponsive = unresponsive;
    }

    /// Swallow the replies to the next `n` non-empty lines.
    pub fn drop_replies(&self, n: usize) {
        self.lock().drop_replies = n;
    }

    pub fn set_banner_on_reset(&self, enabled: bool) {
        self.lock().banner_on_reset = enabled;
    }

    /// Hold every reply back for `delay` after the line that caused it.
    pub fn set_reply_delay(&self, delay: Duration) {
        self.lock().reply_delay = delay;
    }

    /// Answer `error:<code>` to any line containing `pattern`.
    pub fn fail_commands_containing(&self, pattern: &str, code: u32) {
        self.lock().failures.push((pattern.to_string(), code));
    }

    /// Raise `ALARM:<code>` for any line containing `pattern`, then
    /// acknowledge the line with `ok`.
    pub fn alarm_on_commands_containing(&self, pattern: &str, code: u32) {
        self.lock().alarms.push((pattern.to_string(), code));
    }

    /// Make reads and writes on open links fail.
    pub fn set_io_failure(&self, failing: bool) {
        self.lock().io_failure = failing;
    }

    /// Make [`LinkFactory::open`] fail.
    pub fn set_refuse_open(&self, refuse: bool) {
        self.lock().refuse_open = refuse;
    }
}

impl LinkFactory for SimulatedGrbl {
    fn open(&self, port: &str, _baud: u32) -> Result<Box<dyn SerialLink>, GrblError> {
        let mut state = self.lock();
        if state.refuse_open {
            return Err(GrblError::ConnectionFailed(format!(
                "Failed to open {port}: simulated port unavailable"
            )));
        }
        state.opens += 1;
        state.output.clear();
        drop(state);
        Ok(Box::new(self.link()))
    }
}

/// [`SerialLink`] into a [`SimulatedGrbl`]. Reads only wait for delayed replies.
pub struct SimulatedLink {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedLink {
    fn lock(&self) -> io::Result<MutexGuard<'_, SimState>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.io_failure {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated link failure",
            ));
        }
        Ok(state)
    }
}

impl SerialLink for SimulatedLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.lock()?.receive(bytes);
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        let ready = match self.lock()?.output.front() {
            Some(&(ready, _)) => ready,
            None => return Ok(None),
        };
        let wait = ready.saturating_duration_since(Instant::now());
        if wait > timeout {
            thread::sleep(timeout);
            return Ok(None);
        }
        thread::sleep(wait);
        Ok(self.lock()?.output.pop_front().map(|(_, line)| line))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let now = Instant::now();
        self.lock()?.output.retain(|(ready, _)| *ready > now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grbl::protocol::{parse_line, Response};

    fn drain(link: &mut SimulatedLink) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = link.read_line(Duration::ZERO).unwrap() {
            out.push(line);
        }
        out
    }

    #[test]
    fn test_status_query() {
        let sim = SimulatedGrbl::new();
        sim.set_position([1.0, 2.0, -0.5]);
        let mut link = sim.link();
        link.write_all(b"?\n").unwrap();

        let out = drain(&mut link);
        assert_eq!(out.len(), 2);
        match parse_line(&out[0]) {
            Response::Status(report) => {
                assert_eq!(report.work_position(None), Some([1.0, 2.0, -0.5]));
                assert_eq!(report.status, Some(MachineStatus::Idle));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(out[1], "ok");
    }

    #[test]
    fn test_relative_and_offset_moves() {
        let sim = SimulatedGrbl::new();
        let mut link = sim.link();
        link.write_all(b"G91\nG0 X1 Y1\nG0 X1\nG90\nG92 X0 Y0\nG0 X3\n").unwrap();
        assert_eq!(drain(&mut link), vec!["ok"; 6]);
        assert_eq!(sim.position(), [3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_soft_reset_banner() {
        let sim = SimulatedGrbl::new();
        let mut link = sim.link();
        link.write_all(&[0x18]).unwrap();
        let out = drain(&mut link);
        assert!(matches!(parse_line(out.last().unwrap()), Response::Banner(_)));
        assert_eq!(sim.resets(), 1);
    }

    #[test]
    fn test_setting_write_and_dump() {
        let sim = SimulatedGrbl::new();
        let mut link = sim.link();
        link.write_all(b"$110=800\n$$\n").unwrap();
        let out = drain(&mut link);
        assert!(out.contains(&"$110=800".to_string()));
        assert_eq!(out.last().map(String::as_str), Some("ok"));
    }

    #[test]
    fn test_delayed_reply_survives_clear() {
        let sim = SimulatedGrbl::new();
        sim.set_reply_delay(Duration::from_millis(20));
        let mut link = sim.link();
        link.write_all(b"G4 P0\n").unwrap();

        link.clear_input().unwrap();
        assert_eq!(link.read_line(Duration::ZERO).unwrap(), None);
        assert_eq!(
            link.read_line(Duration::from_millis(500)).unwrap().as_deref(),
            Some("ok")
        );
    }

    #[test]
    fn test_alarm_then_ack() {
        let sim = SimulatedGrbl::new();
        sim.alarm_on_commands_containing("X900", 2);
        let mut link = sim.link();
        link.write_all(b"G0 X900\n").unwrap();
        assert_eq!(drain(&mut link), vec!["ALARM:2", "ok"]);
        assert_eq!(sim.position(), [0.0; 3]);
    }

    #[test]
    fn test_refuse_open() {
        let sim = SimulatedGrbl::new();
        sim.set_refuse_open(true);
        assert!(matches!(
            sim.open("sim", 115_200),
            Err(GrblError::ConnectionFailed(_))
        ));
        assert_eq!(sim.opens(), 0);
    }
}
