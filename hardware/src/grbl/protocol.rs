//! GRBL response line parsing.
//!
//! GRBL answers every line it receives with exactly one terminal token,
//! `ok` or `error:<code>`. Status reports, setting dumps, feedback messages
//! and alarms may be interleaved before the terminal token.
//!
//! ```text
//! <Idle|MPos:10.000,20.000,-1.000|FS:0,0|WCO:0.000,0.000,0.000>   (v1.1)
//! <Idle,MPos:10.000,20.000,-1.000,WPos:10.000,20.000,-1.000>      (v0.9)
//! $110=500.000
//! [MSG:Caution: Unlocked]
//! ALARM:1
//! Grbl 1.1h ['$' for help]
//! ok
//! error:20
//! ```

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Machine state field of a status report.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::EnumString, strum::Display,
)]
pub enum MachineStatus {
    Idle,
    Run,
    Hold,
    Jog,
    Alarm,
    Door,
    Check,
    Home,
    Sleep,
}

/// A parsed `<...>` status report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    /// `None` if the state field is not one GRBL documents.
    pub status: Option<MachineStatus>,
    /// Machine position.
    pub mpos: Option<[f64; 3]>,
    /// Work position, reported instead of `mpos` on some configurations.
    pub wpos: Option<[f64; 3]>,
    /// Work coordinate offset, sent periodically by GRBL 1.1.
    pub wco: Option<[f64; 3]>,
}

impl StatusReport {
    /// Work position, using `fallback_wco` when the report itself carries none.
    pub fn work_position(&self, fallback_wco: Option<[f64; 3]>) -> Option<[f64; 3]> {
        if let Some(wpos) = self.wpos {
            return Some(wpos);
        }
        let mpos = self.mpos?;
        match self.wco.or(fallback_wco) {
            Some(wco) => Some([mpos[0] - wco[0], mpos[1] - wco[1], mpos[2] - wco[2]]),
            None => Some(mpos),
        }
    }
}

/// One line received from the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    Error { code: Option<u32>, message: String },
    Alarm { code: Option<u32>, message: String },
    Status(StatusReport),
    /// Startup banner, e.g. `Grbl 1.1h ['$' for help]`.
    Banner(String),
    /// `$n=value` line from a `$$` dump.
    Setting { key: u32, value: String },
    /// Bracketed feedback such as `[MSG:...]` or `[GC:...]`.
    Feedback(String),
    Other(String),
}

impl Response {
    /// Whether this line ends the exchange for the command in flight.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Response::Ok | Response::Error { .. } | Response::Alarm { .. }
        )
    }
}

/// Parse one response line. Surrounding whitespace is ignored.
pub fn parse_line(line: &str) -> Response {
    let line = line.trim();

    if line.eq_ignore_ascii_case("ok") {
        return Response::Ok;
    }

    if let Some(rest) = strip_prefix_ignore_case(line, "error") {
        let code = rest.strip_prefix(':').and_then(|c| c.trim().parse().ok());
        let message = match code {
            Some(c) => error_message(c).to_string(),
            None => rest.trim_start_matches(':').trim().to_string(),
        };
        return Response::Error { code, message };
    }

    if let Some(rest) = strip_prefix_ignore_case(line, "alarm") {
        let code = rest.strip_prefix(':').and_then(|c| c.trim().parse().ok());
        let message = match code {
            Some(c) => alarm_message(c).to_string(),
            None => rest.trim_start_matches(':').trim().to_string(),
        };
        return Response::Alarm { code, message };
    }

    if line.starts_with('<') && line.ends_with('>') {
        if let Some(report) = parse_status(&line[1..line.len() - 1]) {
            return Response::Status(report);
        }
    }

    if line.starts_with("Grbl ") {
        return Response::Banner(line.to_string());
    }

    if let Some(setting) = line.strip_prefix('$') {
        if let Some((key, value)) = setting.split_once('=') {
            if let Ok(key) = key.parse() {
                return Response::Setting {
                    key,
                    value: value.to_string(),
                };
            }
        }
    }

    if line.starts_with('[') && line.ends_with(']') {
        return Response::Feedback(line[1..line.len() - 1].to_string());
    }

    Response::Other(line.to_string())
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

/// Parse the inside of `<...>`, accepting both v1.1 (`|`) and v0.9 (`,`) layouts.
fn parse_status(body: &str) -> Option<StatusReport> {
    let mut report = StatusReport {
        status: None,
        mpos: None,
        wpos: None,
        wco: None,
    };

    let (state, fields) = match body.find(['|', ',']) {
        Some(i) => (&body[..i], &body[i + 1..]),
        None => (body, ""),
    };
    // Substates such as `Hold:0` or `Door:1`
    let state = state.split(':').next().unwrap_or(state);
    report.status = MachineStatus::from_str(state).ok();

    if body.contains('|') {
        for field in fields.split('|') {
            let Some((name, value)) = field.split_once(':') else {
                continue;
            };
            match name {
                "MPos" => report.mpos = parse_triple(value),
                "WPos" => report.wpos = parse_triple(value),
                "WCO" => report.wco = parse_triple(value),
                _ => {}
            }
        }
    } else {
        // v0.9: `MPos:x,y,z,WPos:x,y,z,...`
        for (name, slot) in [("MPos:", &mut report.mpos), ("WPos:", &mut report.wpos)] {
            if let Some(start) = fields.find(name) {
                let values: Vec<&str> = fields[start + name.len()..].split(',').take(3).collect();
                *slot = parse_triple(&values.join(","));
            }
        }
    }

    if report.mpos.is_none() && report.wpos.is_none() && report.status.is_none() {
        return None;
    }
    Some(report)
}

fn parse_triple(value: &str) -> Option<[f64; 3]> {
    let mut it = value.split(',').map(|v| v.trim().parse::<f64>());
    let x = it.next()?.ok()?;
    let y = it.next()?.ok()?;
    let z = it.next()?.ok()?;
    Some([x, y, z])
}

/// Human-readable description of a GRBL 1.1 `error:` code.
pub fn error_message(code: u32) -> &'static str {
    match code {
        1 => "G-code words consist of a letter and a value. Letter was not found",
        2 => "Numeric value format is not valid or missing an expected value",
        3 => "Grbl '$' system command was not recognized or supported",
        4 => "Negative value received for an expected positive value",
        5 => "Homing cycle is not enabled via settings",
        6 => "Minimum step pulse time must be greater than 3usec",
        7 => "EEPROM read failed. Reset and restored to default values",
        8 => "Grbl '$' command cannot be used unless Grbl is IDLE",
        9 => "G-code locked out during alarm or jog state",
        10 => "Soft limits cannot be enabled without homing also enabled",
        11 => "Max characters per line exceeded",
        12 => "Grbl '$' setting value exceeds the maximum step rate supported",
        13 => "Safety door detected as opened and door state initiated",
        14 => "Build info or startup line exceeded EEPROM line length limit",
        15 => "Jog target exceeds machine travel",
        16 => "Jog command with no '=' or contains prohibited g-code",
        17 => "Laser mode requires PWM output",
        20 => "Unsupported or invalid g-code command found in block",
        21 => "More than one g-code command from same modal group found in block",
        22 => "Feed rate has not yet been set or is undefined",
        23 => "G-code command in block requires an integer value",
        24 => "Two G-code commands that both require the use of the XYZ axis words",
        25 => "A G-code word was repeated in the block",
        26 => "A G-code command requires XYZ axis words in the block, but none were detected",
        27 => "N line number value is not within the valid range of 1 - 9,999,999",
        28 => "A G-code command was sent, but is missing some required P or L value words",
        29 => "Grbl supports six work coordinate systems G54-G59",
        30 => "The G53 G-code command requires either a G0 seek or G1 feed motion mode",
        31 => "There are unused axis words in the block and G80 motion mode cancel is active",
        32 => "A G2 or G3 arc was commanded but there are no XYZ axis words in the selected plane",
        33 => "The motion command has an invalid target",
        34 => "Arc radius value is invalid",
        35 => "A G2 or G3 arc in offset mode has no IJK words in the selected plane",
        36 => "There are unused, leftover G-code words that aren't used by any command",
        37 => "The G43.1 dynamic tool length offset is not assigned to the configured axis",
        38 => "Tool number greater than max supported value",
        _ => "Unknown error",
    }
}

/// Human-readable description of a GRBL 1.1 `ALARM:` code.
pub fn alarm_message(code: u32) -> &'static str {
    match code {
        1 => "Hard limit triggered",
        2 => "Soft limit: motion target exceeds machine travel",
        3 => "Reset while in motion, position lost",
        4 => "Probe fail: probe not in expected initial state",
        5 => "Probe fail: probe did not contact the workpiece",
        6 => "Homing fail: reset during active homing cycle",
        7 => "Homing fail: safety door opened during homing",
        8 => "Homing fail: pull-off did not clear limit switch",
        9 => "Homing fail: could not find limit switch",
        _ => "Unknown alarm",
    }
}
