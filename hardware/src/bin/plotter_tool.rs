//! Command-line control of the camera-guided pen plotter.
//!
//! Subcommands:
//! - `ports`: List serial ports
//! - `status`: Connect and report position and machine state
//! - `move`: Step the tool in X/Y
//! - `pen`: Raise or lower the pen
//! - `origin`: Redefine the current position
//! - `bounds`: Show or set travel bounds
//! - `run`: Dry-run and stream a G-code file
//! - `settings`: Dump controller settings
//! - `reset`: Soft-reset the controller
//! - `motors`: Unlock or release the steppers
//! - `capture`: Take a photo with the tethered phone
//! - `locate`: Calibrate from an image and locate the tool marker
//! - `markers`: Render printable fiducials
//! - `repl`: Interactive raw G-code prompt

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hardware::android::{CameraDeviceController, ScriptedTransport};
use hardware::config::RigConfig;
use hardware::grbl::{
    CommandOutcome, GrblController, Program, Response, SimulatedGrbl, TravelBounds,
};
use shared::config_storage::ConfigStorage;
use shared::frame::{frame_from_bytes, frame_to_gray};
use shared::{CalibrationEngine, MarkerDictionary};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Camera-guided pen plotter control tool
#[derive(Parser, Debug)]
#[command(name = "plotter_tool")]
#[command(about = "Control the GRBL pen plotter and its phone camera")]
#[command(version)]
struct Args {
    /// Serial port (overrides the stored config)
    #[arg(long, global = true)]
    port: Option<String>,

    /// Baud rate (overrides the stored config)
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Config directory (default ~/.plotter_config)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Use in-memory controller and phone instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum PenAction {
    Up,
    Down,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum MotorAction {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available serial ports
    Ports,

    /// Connect and print connection state, position and machine status
    Status,

    /// Move by a number of steps in X and Y
    Move {
        /// Steps in X
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        dx: f64,

        /// Steps in Y
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        dy: f64,

        /// Step size in mm (default from config)
        #[arg(long)]
        step: Option<f64>,

        /// Move even if the target is outside the travel bounds
        #[arg(long)]
        force: bool,
    },

    /// Raise or lower the pen
    Pen {
        #[arg(value_enum)]
        action: PenAction,
    },

    /// Redefine the current position without moving
    Origin {
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        x: f64,

        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        y: f64,

        #[arg(long, allow_hyphen_values = true)]
        z: Option<f64>,
    },

    /// Show travel bounds, or set them when all four limits are given
    Bounds {
        #[arg(long, allow_hyphen_values = true)]
        min_x: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        max_x: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        min_y: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        max_y: Option<f64>,

        /// Store the new bounds in the config
        #[arg(long)]
        save: bool,
    },

    /// Check a G-code file against the travel bounds and stream it
    Run {
        file: PathBuf,

        /// Only run the bounds check
        #[arg(long)]
        dry_run: bool,
    },

    /// Dump the controller's $$ settings
    Settings,

    /// Soft-reset the controller
    Reset,

    /// Unlock ($X) or release ($SLP) the steppers
    Motors {
        #[arg(value_enum)]
        action: MotorAction,
    },

    /// Take a photo with the phone camera
    Capture {
        /// Write the photo here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Wake and unlock the screen first
        #[arg(long)]
        unlock: bool,
    },

    /// Calibrate from an image and report the tool marker position
    Locate {
        image: PathBuf,

        /// Feed the position to the controller as a camera override
        #[arg(long)]
        update_position: bool,

        /// Store the fitted homography
        #[arg(long)]
        save: bool,
    },

    /// Render printable marker images
    Markers {
        out_dir: PathBuf,

        /// Marker ids (default: reference and tool markers from the config)
        #[arg(long, value_delimiter = ',')]
        ids: Vec<u32>,

        /// Pixels per marker cell
        #[arg(long, default_value = "40")]
        cell_px: usize,
    },

    /// Interactive raw command prompt
    Repl,
}

/// Stored configuration with command-line overrides applied.
struct Rig {
    storage: ConfigStorage,
    rig: RigConfig,
    simulate: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let storage = match &args.config_dir {
        Some(dir) => ConfigStorage::with_path(dir.clone()),
        None => ConfigStorage::new().context("Cannot locate config directory")?,
    };
    let mut rig = RigConfig::load(&storage)
        .with_context(|| format!("Failed to load config from {}", storage.root_path().display()))?;
    if let Some(port) = &args.port {
        rig.grbl.port = port.clone();
    }
    if let Some(baud) = args.baud {
        rig.grbl.baud = baud;
    }
    let ctx = Rig {
        storage,
        rig,
        simulate: args.simulate,
    };

    match args.command {
        Command::Ports => cmd_ports(),
        Command::Status => cmd_status(&ctx),
        Command::Move {
            dx,
            dy,
            step,
            force,
        } => cmd_move(&ctx, dx, dy, step, force),
        Command::Pen { action } => cmd_pen(&ctx, action),
        Command::Origin { x, y, z } => cmd_origin(&ctx, x, y, z),
        Command::Bounds {
            min_x,
            max_x,
            min_y,
            max_y,
            save,
        } => cmd_bounds(ctx, [min_x, max_x, min_y, max_y], save),
        Command::Run { file, dry_run } => cmd_run(&ctx, &file, dry_run),
        Command::Settings => cmd_settings(&ctx),
        Command::Reset => cmd_reset(&ctx),
        Command::Motors { action } => cmd_motors(&ctx, action),
        Command::Capture { output, unlock } => cmd_capture(&ctx, output.as_deref(), unlock),
        Command::Locate {
            image,
            update_position,
            save,
        } => cmd_locate(&ctx, &image, update_position, save),
        Command::Markers {
            out_dir,
            ids,
            cell_px,
        } => cmd_markers(&ctx, &out_dir, ids, cell_px),
        Command::Repl => cmd_repl(&ctx),
    }
}

/// Build and connect a controller, real or simulated.
fn connect(ctx: &Rig) -> Result<GrblController> {
    let config = ctx.rig.grbl.clone();
    let (port, baud) = (config.port.clone(), config.baud);

    let grbl = if ctx.simulate {
        let mut config = config;
        config.wake_delay_ms = 0;
        config.wake_settle_ms = 0;
        GrblController::with_factory(config, Arc::new(SimulatedGrbl::new()))
    } else {
        GrblController::new(config)
    };

    info!("Connecting to {port} at {baud} baud...");
    grbl.connect(&port, baud)
        .with_context(|| format!("Failed to connect to {port}"))?;
    Ok(grbl)
}

fn print_position(grbl: &GrblController) {
    let pos = grbl.current_position();
    println!(
        "Position: X={:.3} Y={:.3} Z={:.3} ({})",
        pos.x, pos.y, pos.z, pos.source
    );
}

// ==================== Controller Commands ====================

fn cmd_ports() -> Result<()> {
    let ports = GrblController::list_available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn cmd_status(ctx: &Rig) -> Result<()> {
    let grbl = connect(ctx)?;
    let (state, message) = grbl.connection_status();
    println!("Connection: {state} ({message})");
    grbl.query_position()?;
    print_position(&grbl);
    match grbl.machine_status() {
        Some(status) => println!("Machine: {status}"),
        None => println!("Machine: unknown"),
    }
    println!("Pen: {}", grbl.pen_state());
    println!("Bounds: {}", grbl.travel_bounds());
    grbl.disconnect();
    Ok(())
}

fn cmd_move(ctx: &Rig, dx: f64, dy: f64, step: Option<f64>, force: bool) -> Result<()> {
    let grbl = connect(ctx)?;
    if let Some(step) = step {
        grbl.set_step_size(step)?;
    }
    if force {
        warn!("Bounds check disabled for this move");
    }
    grbl.move_relative_step(dx, dy, force)?;
    print_position(&grbl);
    grbl.disconnect();
    Ok(())
}

fn cmd_pen(ctx: &Rig, action: PenAction) -> Result<()> {
    let grbl = connect(ctx)?;
    match action {
        PenAction::Up => grbl.pen_up()?,
        PenAction::Down => grbl.pen_down()?,
    }
    println!("Pen {}", grbl.pen_state());
    grbl.disconnect();
    Ok(())
}

fn cmd_origin(ctx: &Rig, x: f64, y: f64, z: Option<f64>) -> Result<()> {
    let grbl = connect(ctx)?;
    grbl.set_origin(x, y, z)?;
    print_position(&grbl);
    grbl.disconnect();
    Ok(())
}

fn cmd_bounds(ctx: Rig, limits: [Option<f64>; 4], save: bool) -> Result<()> {
    let [min_x, max_x, min_y, max_y] = limits;
    let (Some(min_x), Some(max_x), Some(min_y), Some(max_y)) = (min_x, max_x, min_y, max_y) else {
        if limits.iter().any(Option::is_some) {
            bail!("Give all of --min-x, --max-x, --min-y and --max-y to set bounds");
        }
        println!("Bounds: {}", ctx.rig.grbl.bounds);
        return Ok(());
    };

    let bounds = TravelBounds::new(min_x, max_x, min_y, max_y)?;
    let grbl = connect(&ctx)?;
    grbl.set_travel_bounds(bounds)?;
    println!("Bounds: {}", grbl.travel_bounds());
    grbl.disconnect();

    if save {
        let mut rig = ctx.rig;
        rig.grbl.bounds = bounds;
        rig.save(&ctx.storage)?;
    }
    Ok(())
}

fn cmd_run(ctx: &Rig, file: &Path, dry_run: bool) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let program = Program::from_text(&text);

    if dry_run {
        let report = hardware::grbl::dry_run(&program, [0.0, 0.0], &ctx.rig.grbl.bounds)?;
        println!(
            "Dry run passed: {} moves checked, {} lines not simulated, ends at ({:.3}, {:.3})",
            report.checked_moves,
            report.unchecked_lines.len(),
            report.end[0],
            report.end[1]
        );
        return Ok(());
    }

    let grbl = connect(ctx)?;
    let report = grbl.execute_program(&program)?;
    println!("Sent {} lines", report.lines_sent);
    if !report.dry_run.unchecked_lines.is_empty() {
        println!(
            "Warning: {} lines were not bounds-checked",
            report.dry_run.unchecked_lines.len()
        );
    }
    print_position(&grbl);
    grbl.disconnect();
    Ok(())
}

fn cmd_settings(ctx: &Rig) -> Result<()> {
    let grbl = connect(ctx)?;
    for (key, value) in grbl.settings()? {
        println!("${key}={value}");
    }
    grbl.disconnect();
    Ok(())
}

fn cmd_reset(ctx: &Rig) -> Result<()> {
    let grbl = connect(ctx)?;
    grbl.soft_reset()?;
    let (state, message) = grbl.connection_status();
    println!("Connection: {state} ({message})");
    grbl.disconnect();
    Ok(())
}

fn cmd_motors(ctx: &Rig, action: MotorAction) -> Result<()> {
    let grbl = connect(ctx)?;
    match action {
        MotorAction::On => grbl.enable_motors()?,
        MotorAction::Off => grbl.disable_motors()?,
    }
    println!("Motors {action:?}");
    grbl.disconnect();
    Ok(())
}

// ==================== Camera Commands ====================

fn camera(ctx: &Rig) -> CameraDeviceController {
    if ctx.simulate {
        let mut config = ctx.rig.camera.clone();
        config.launch_settle_ms = 0;
        config.shutter_settle_ms = 0;
        config.swipe_settle_ms = 0;
        CameraDeviceController::with_transport(config, Arc::new(ScriptedTransport::new()))
    } else {
        CameraDeviceController::new(ctx.rig.camera.clone())
    }
}

fn cmd_capture(ctx: &Rig, output: Option<&Path>, unlock: bool) -> Result<()> {
    let camera = camera(ctx);
    let device = camera.connect_device()?;
    info!("Using device {device}");

    if unlock {
        camera.wake_and_unlock(None)?;
    }

    let id = camera.capture()?;
    let Some(photo) = camera.photo(&id) else {
        bail!("Photo {id} missing from history");
    };
    println!(
        "Captured {id}: {} bytes from {}",
        photo.len(),
        photo.metadata.device_path
    );

    if let Some(path) = output {
        std::fs::write(path, &photo.bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}

// ==================== Calibration Commands ====================

fn cmd_locate(ctx: &Rig, image: &Path, update_position: bool, save: bool) -> Result<()> {
    let bytes = std::fs::read(image).with_context(|| format!("Failed to read {}", image.display()))?;
    let frame = frame_from_bytes(&bytes)?;
    let engine = CalibrationEngine::new(ctx.rig.calibration.clone())?;

    let markers = engine.detect_markers(&frame);
    println!("Detected {} markers", markers.len());
    for (id, marker) in &markers {
        println!(
            "  #{id}: center ({:.1}, {:.1}) px",
            marker.center_px[0], marker.center_px[1]
        );
    }

    match engine.try_update_calibration(&frame) {
        Ok(calibration) => {
            let rms = calibration.rms_error_px.unwrap_or(f64::NAN);
            println!("Calibration valid (RMS {rms:.3} px)");
        }
        Err(e) => {
            let Some(stored) = ctx.storage.get_homography().transpose()? else {
                bail!("Calibration failed: {e}");
            };
            warn!("Calibration failed ({e}), using homography saved at {}", stored.saved_at);
            engine.restore_homography(&stored)?;
        }
    }

    if save {
        if let Some(stored) = engine.stored_homography() {
            let path = ctx.storage.save_homography(&stored)?;
            println!("Saved homography to {}", path.display());
        }
    }

    let Some([x, y]) = engine.tool_marker_world_position(&frame) else {
        bail!(
            "Tool marker #{} not found",
            ctx.rig.calibration.tool_marker_id
        );
    };
    println!("Tool at X={x:.3} Y={y:.3} mm");

    if update_position {
        let grbl = connect(ctx)?;
        grbl.update_position_from_camera(x, y, None);
        print_position(&grbl);
        grbl.disconnect();
    }
    Ok(())
}

fn cmd_markers(ctx: &Rig, out_dir: &Path, ids: Vec<u32>, cell_px: usize) -> Result<()> {
    let ids = if ids.is_empty() {
        let cal = &ctx.rig.calibration;
        vec![
            cal.references[0].id,
            cal.references[1].id,
            cal.tool_marker_id,
        ]
    } else {
        ids
    };

    std::fs::create_dir_all(out_dir)?;
    let dictionary = MarkerDictionary::standard();
    for id in ids {
        let Some(marker) = dictionary.render(id, cell_px, 1) else {
            bail!("Marker id {id} not in dictionary (0..{})", dictionary.len());
        };
        let path = out_dir.join(format!("marker_{id}.png"));
        frame_to_gray(&marker)
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

// ==================== REPL ====================

fn cmd_repl(ctx: &Rig) -> Result<()> {
    let grbl = connect(ctx)?;
    let timeout = ctx.rig.grbl.command_timeout();

    println!("GRBL REPL - Enter G-code or $ commands, 'quit' to exit");
    println!("Examples: ?, $$, G0 X10 Y10, G92 X0 Y0");
    println!();

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break; // EOF
        }

        let cmd = input.trim();
        if cmd.is_empty() {
            continue;
        }

        if cmd.eq_ignore_ascii_case("quit") || cmd.eq_ignore_ascii_case("exit") {
            println!("Bye!");
            break;
        }

        match grbl.send_command(cmd, true, timeout) {
            Ok(reply) => {
                for response in &reply.responses {
                    match response {
                        Response::Ok => {}
                        Response::Status(_) => print_position(&grbl),
                        other => println!("{other:?}"),
                    }
                }
                match reply.outcome {
                    CommandOutcome::Ok => println!("ok"),
                    CommandOutcome::Timeout => println!("Timeout"),
                    _ => {}
                }
            }
            Err(e) => {
                println!("Error: {e}");
                if !grbl.is_connected() {
                    break;
                }
            }
        }
    }

    grbl.disconnect();
    Ok(())
}
