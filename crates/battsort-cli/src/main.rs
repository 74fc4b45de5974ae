//! battsort CLI — offline tools and a simulated run of the work cell.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use battsort::agent::{TrayLayout, TokenTap};
use battsort::motion::MotionController;
use battsort::pixelmap::FrameUndistorter;
use battsort::{
    ArmRole, CalibrationProfile, CalibrationSession, CellConfig, CheckerboardSpec, ConfigStore,
    SimulatedController, SmoothedDetection, WorkCell,
};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "battsort")]
#[command(about = "Camera-guided two-arm sorting cell: configuration, calibration and simulation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a cell configuration.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },

    /// Print tray slot positions as JSON.
    Tray {
        #[arg(long)]
        config: PathBuf,
    },

    /// Solve camera intrinsics from stored checkerboard corners.
    Calibrate(CalibrateArgs),

    /// Undistort one image with a calibration archive.
    Undistort(UndistortArgs),

    /// Run the handoff protocol against simulated arms.
    Simulate {
        #[arg(long)]
        config: PathBuf,

        /// Number of objects to pass through the cell.
        #[arg(long, default_value = "1")]
        cycles: u32,

        /// Give up after this many seconds.
        #[arg(long, default_value = "60")]
        timeout_s: u64,
    },
}

#[derive(Debug, Clone, Args)]
struct CalibrateArgs {
    /// JSON file with `image_size` and a list of per-view corner arrays.
    #[arg(long)]
    views: PathBuf,

    /// Output `.npz` archive.
    #[arg(long)]
    out: PathBuf,

    /// Inner corners per row.
    #[arg(long, default_value = "9")]
    cols: usize,

    /// Inner corners per column.
    #[arg(long, default_value = "6")]
    rows: usize,

    /// Square edge in millimeters.
    #[arg(long, default_value = "19.0")]
    square: f64,
}

#[derive(Debug, Clone, Args)]
struct UndistortArgs {
    #[arg(long)]
    calib: PathBuf,

    #[arg(long)]
    image: PathBuf,

    #[arg(long)]
    out: PathBuf,

    /// 0 keeps only valid pixels, 1 keeps the whole source image.
    #[arg(long, default_value = "0.0")]
    alpha: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ViewsFile {
    image_size: [u32; 2],
    views: Vec<Vec<[f64; 2]>>,
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { config } => run_check_config(&config),
        Commands::Tray { config } => run_tray(&config),
        Commands::Calibrate(args) => run_calibrate(&args),
        Commands::Undistort(args) => run_undistort(&args),
        Commands::Simulate {
            config,
            cycles,
            timeout_s,
        } => run_simulate(&config, cycles, Duration::from_secs(timeout_s)),
    }
}

// ── check-config ──────────────────────────────────────────────────────

fn run_check_config(path: &Path) -> CliResult<()> {
    let cfg = CellConfig::from_json_file(path)?;
    let v = &cfg.vision;
    println!("{} is valid ({})", path.display(), cfg.schema);
    println!("  calibration:    {}", v.calibration_path.display());
    println!(
        "  fence:          x ({}, {})  y ({}, {}) mm",
        v.fence.min_x_mm, v.fence.max_x_mm, v.fence.min_y_mm, v.fence.max_y_mm
    );
    println!(
        "  markers:        {:?} on a {}x{} mm tray, {} mm",
        v.markers.accepted_ids,
        v.markers.tray_length_mm,
        v.markers.tray_width_mm,
        v.markers.marker_size_mm
    );
    println!(
        "  vision:         confidence {}, guard {} px, window {}",
        v.confidence, v.guard_px, v.smoothing_window
    );
    for role in [ArmRole::A, ArmRole::B] {
        let arm = cfg.arm(role);
        println!(
            "  arm {role}:          {} tool DO{} at {} mm/s",
            arm.address, arm.tool_channel, arm.speed_mm_s
        );
    }
    println!("  tray:           {} x {}", cfg.tray.rows, cfg.tray.cols);
    Ok(())
}

// ── tray ──────────────────────────────────────────────────────────────

fn run_tray(path: &Path) -> CliResult<()> {
    let cfg = CellConfig::from_json_file(path)?;
    let layout = TrayLayout::new(cfg.tray.clone());
    let slots: Vec<serde_json::Value> = (0..layout.rows())
        .flat_map(|row| (0..layout.cols()).map(move |col| (row, col)))
        .map(|(row, col)| {
            let [x, y] = layout.slot_xy(row, col);
            serde_json::json!({ "row": row, "col": col, "x_mm": x, "y_mm": y })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&slots)?);
    Ok(())
}

// ── calibrate ─────────────────────────────────────────────────────────

fn run_calibrate(args: &CalibrateArgs) -> CliResult<()> {
    let data = std::fs::read_to_string(&args.views).map_err(|e| -> CliError {
        format!("Failed to read {}: {}", args.views.display(), e).into()
    })?;
    let file: ViewsFile = serde_json::from_str(&data)?;
    let board = CheckerboardSpec {
        cols: args.cols,
        rows: args.rows,
        square_mm: args.square,
    };

    let mut session = CalibrationSession::new(board, file.image_size);
    for (i, corners) in file.views.into_iter().enumerate() {
        match session.add_view(corners) {
            Ok(n) => tracing::info!("view {i} accepted ({n} total)"),
            Err(e) => tracing::warn!("view {i} skipped: {e}"),
        }
    }

    let report = session.solve()?;
    let k = report.profile.camera.intrinsics;
    tracing::info!(
        "Calibrated from {} views: fx={:.2} fy={:.2} cx={:.2} cy={:.2}, rms={:.3}px",
        report.n_views,
        k.fx,
        k.fy,
        k.cx,
        k.cy,
        report.rms_px
    );
    report.profile.save(&args.out)?;
    tracing::info!("Calibration written to {}", args.out.display());
    Ok(())
}

// ── undistort ─────────────────────────────────────────────────────────

fn run_undistort(args: &UndistortArgs) -> CliResult<()> {
    let img = image::open(&args.image).map_err(|e| -> CliError {
        format!("Failed to open image {}: {}", args.image.display(), e).into()
    })?;
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let profile = CalibrationProfile::load(&args.calib)?.with_image_size([w, h]);
    let mut undistorter = FrameUndistorter::new(profile, args.alpha);
    let out = undistorter.undistort(&rgb);
    out.save(&args.out)?;
    tracing::info!("Undistorted {}x{} image written to {}", w, h, args.out.display());
    Ok(())
}

// ── simulate ──────────────────────────────────────────────────────────

fn run_simulate(path: &Path, cycles: u32, timeout: Duration) -> CliResult<()> {
    let store = Arc::new(ConfigStore::load(path)?);
    let cfg = store.snapshot();
    let controllers: [Box<dyn MotionController>; 2] = [
        Box::new(SimulatedController::new(cfg.arm_a.address.clone())),
        Box::new(SimulatedController::new(cfg.arm_b.address.clone())),
    ];
    let (tap, tokens): (TokenTap, _) = crossbeam::channel::unbounded();
    let mut cell = WorkCell::launch(Arc::clone(&store), controllers, Some(tap))?;
    let captures = [cell.capture_flag(ArmRole::A), cell.capture_flag(ArmRole::B)];
    cell.start()?;

    let fence = cfg.vision.fence;
    let scripted = SmoothedDetection {
        x_mm: (fence.min_x_mm + fence.max_x_mm) / 2.0,
        y_mm: (fence.min_y_mm + fence.max_y_mm) / 2.0,
        theta_deg: 30.0,
        class_id: 0,
    };

    let deadline = Instant::now() + timeout;
    let mut claimed = 0u32;
    let mut finished = 0u32;
    while finished < cycles {
        if Instant::now() > deadline {
            cell.stop();
            return Err(format!("simulation timed out after {finished}/{cycles} cycles").into());
        }
        if claimed == finished && cell.slot().is_empty() {
            let det = SmoothedDetection {
                class_id: claimed % cfg.tray.rows,
                ..scripted
            };
            tracing::info!("scripted claim: {:?}", cell.slot().try_claim(&det, &fence));
            claimed += 1;
        }
        // stand-in camera: every capture is taken at once
        for flag in &captures {
            if flag.is_requested() {
                flag.acknowledge();
            }
        }
        for (role, token) in tokens.try_iter() {
            println!("{role} -> {}: {token}", role.peer());
        }
        finished = cell
            .status(ArmRole::B)
            .map_or(finished, |s| u32::try_from(s.cycles).unwrap_or(u32::MAX));
        std::thread::sleep(Duration::from_millis(5));
    }

    let report = cell.stop();
    for (role, token) in tokens.try_iter() {
        println!("{role} -> {}: {token}", role.peer());
    }
    for role in [ArmRole::A, ArmRole::B] {
        if let Some(status) = cell.status(role) {
            println!("{}", serde_json::to_string(&status)?);
        }
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
