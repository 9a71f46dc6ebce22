//! GRBL motion controller driver.
//!
//! GRBL is a line-based G-code interpreter running on the plotter's motion
//! board. Every line sent gets exactly one `ok` or `error:<code>` back, so
//! the link carries a single request in flight at a time.
//!
//! - [`protocol`] - response line parser
//! - [`link`] - serial transport and port enumeration
//! - [`program`] - G-code programs and the bounds dry run
//! - [`controller`] - [`GrblController`], the stateful driver
//! - [`sim`] - [`SimulatedGrbl`], an in-memory controller for tests and demos
//!
//! # Example
//!
//! ```no_run
//! use hardware::grbl::{GrblConfig, GrblController, Program, TravelBounds};
//!
//! let grbl = GrblController::new(GrblConfig::default());
//! grbl.connect("/dev/ttyUSB0", 115200)?;
//!
//! grbl.set_travel_bounds(TravelBounds::new(0.0, 200.0, 0.0, 150.0)?)?;
//! grbl.pen_up()?;
//! grbl.execute_program(&Program::from_text("G90\nG0 X10 Y10\nG1 X50 Y10 F300"))?;
//! grbl.disconnect();
//! # Ok::<(), hardware::grbl::GrblError>(())
//! ```

pub mod controller;
pub mod link;
pub mod program;
pub mod protocol;
pub mod sim;

use thiserror::Error;

pub use controller::{
    CommandOutcome, CommandReply, ConnectionState, GrblConfig, GrblController, MachinePosition,
    PenState, PositionSource, ProgramReport,
};
pub use link::{list_available_ports, LinkFactory, SerialLink, SerialPortFactory};
pub use program::{dry_run, DryRunReport, Program, TravelBounds};
pub use protocol::{parse_line, MachineStatus, Response, StatusReport};
pub use sim::SimulatedGrbl;

/// Errors raised by the GRBL driver.
#[derive(Error, Debug)]
pub enum GrblError {
    /// Serial read/write failure. Faults the connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not connected")]
    NotConnected,

    /// The port could not be opened or enumerated.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The port opened but the controller never acknowledged a status query.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The controller answered `error:<code>`.
    #[error("Controller error {code:?}: {message}")]
    Protocol { code: Option<u32>, message: String },

    /// The controller raised `ALARM:<code>`.
    #[error("Alarm {code:?}: {message}")]
    Alarm { code: Option<u32>, message: String },

    /// No terminal token arrived in time.
    #[error("Timeout waiting for response to {command:?}")]
    Timeout { command: String },

    /// A move target lies outside the travel bounds.
    #[error("Target ({x:.3}, {y:.3}) outside travel bounds {bounds}")]
    OutOfBounds {
        x: f64,
        y: f64,
        bounds: TravelBounds,
    },

    /// Requested bounds are malformed or exclude the current position.
    #[error("Invalid travel bounds: {0}")]
    InvalidBounds(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The dry run found a line that would leave the travel bounds.
    #[error("Program line {} ({line:?}) reaches ({x:.3}, {y:.3}) outside travel bounds", .index + 1)]
    ProgramRejected {
        index: usize,
        line: String,
        x: f64,
        y: f64,
    },

    /// A streamed program line was not acknowledged.
    #[error("Program line {} ({line:?}) failed: {response}", .index + 1)]
    ProgramLineFailed {
        index: usize,
        line: String,
        response: String,
    },

    /// The startup banner did not appear after a soft reset.
    #[error("Soft reset failed: {0}")]
    ResetFailed(String),
}

/// Result type for GRBL operations.
pub type GrblResult<T> = Result<T, GrblError>;
