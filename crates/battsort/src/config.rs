//! Typed work-cell configuration.
//!
//! The file is JSON with a versioned schema (`battsort.config.v1`). It is
//! validated once at load time; components receive an immutable snapshot and
//! pick up changes only through an explicit reload.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::ArmRole;
use crate::homography::RansacConfig;
use crate::mailbox::WorkspaceFence;
use crate::markers::MarkerGeometry;

pub const CONFIG_SCHEMA_V1: &str = "battsort.config.v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config is not valid JSON for this schema: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported config schema '{found}' (expected '{}')", CONFIG_SCHEMA_V1)]
    Schema { found: String },
    #[error("invalid config:\n  {}", .problems.join("\n  "))]
    Invalid { problems: Vec<String> },
}

fn default_alpha() -> f64 {
    0.0
}
fn default_confidence() -> f32 {
    0.5
}
fn default_guard_px() -> u32 {
    10
}
fn default_window() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VisionConfig {
    /// `.npz` archive with `K` and `D`.
    pub calibration_path: PathBuf,
    /// Free scaling of the undistorted view; 0 keeps only valid pixels.
    #[serde(default = "default_alpha")]
    pub undistort_alpha: f64,
    /// Detector confidence threshold.
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// Border band in pixels where mask outlines are rejected.
    #[serde(default = "default_guard_px")]
    pub guard_px: u32,
    /// Frames per smoothing batch.
    #[serde(default = "default_window")]
    pub smoothing_window: usize,
    /// World point used to pick one object per frame.
    #[serde(default)]
    pub reference_point_mm: [f64; 2],
    #[serde(default)]
    pub markers: MarkerGeometry,
    pub fence: WorkspaceFence,
    #[serde(default)]
    pub ransac: RansacConfig,
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_dir")]
    pub output_dir: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            output_dir: default_snapshot_dir(),
        }
    }
}

fn default_pick_lift() -> f64 {
    25.0
}
fn default_transfer_approach() -> f64 {
    40.0
}
fn default_release_settle_ms() -> u64 {
    100
}

/// One arm, in the human-entry convention: positions in mm, angles in
/// degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArmConfig {
    /// Controller IPv4 address.
    pub address: String,
    /// Digital output driving the vacuum tool.
    pub tool_channel: u32,
    pub speed_mm_s: f64,
    pub accel_mm_s2: f64,
    pub joint_speed_deg_s: f64,
    pub joint_accel_deg_s2: f64,
    pub home_joints_deg: [f64; 6],
    /// Pick reference; x/y are replaced by the claimed coordinate.
    pub tcp_default_pose: [f64; 6],
    /// Inspection pose in front of the snapshot camera.
    pub tcp_end_pose: [f64; 6],
    pub tcp_transfer_pose: [f64; 6],
    pub tool_offset: [f64; 6],
    pub user_frame: [f64; 6],
    #[serde(default = "default_pick_lift")]
    pub pick_lift_mm: f64,
    #[serde(default = "default_transfer_approach")]
    pub transfer_approach_mm: f64,
    /// Pause after releasing suction before moving away.
    #[serde(default = "default_release_settle_ms")]
    pub release_settle_ms: u64,
}

fn default_rows() -> u32 {
    2
}
fn default_cols() -> u32 {
    5
}
fn default_approach_z() -> f64 {
    35.0
}
fn default_drop_z() -> f64 {
    27.0
}
fn default_retract_z() -> f64 {
    70.0
}
fn default_deposit_accel() -> f64 {
    700.0
}

/// Output tray grid, in the arm-B user frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrayConfig {
    #[serde(default = "default_rows")]
    pub rows: u32,
    #[serde(default = "default_cols")]
    pub cols: u32,
    pub start_mm: [f64; 2],
    #[serde(default)]
    pub start_offset_mm: [f64; 2],
    pub cell_size_mm: [f64; 2],
    #[serde(default)]
    pub spacing_mm: [f64; 2],
    #[serde(default = "default_approach_z")]
    pub approach_z_mm: f64,
    #[serde(default = "default_drop_z")]
    pub drop_z_mm: f64,
    #[serde(default = "default_retract_z")]
    pub retract_z_mm: f64,
    #[serde(default = "default_deposit_accel")]
    pub deposit_accel_mm_s2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CellConfig {
    pub schema: String,
    pub vision: VisionConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    pub arm_a: ArmConfig,
    pub arm_b: ArmConfig,
    pub tray: TrayConfig,
}

impl CellConfig {
    pub fn from_json_str(data: &str) -> Result<Self, ConfigError> {
        let cfg: CellConfig = serde_json::from_str(data)?;
        if cfg.schema != CONFIG_SCHEMA_V1 {
            return Err(ConfigError::Schema { found: cfg.schema });
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&data)
    }

    pub fn arm(&self, role: ArmRole) -> &ArmConfig {
        match role {
            ArmRole::A => &self.arm_a,
            ArmRole::B => &self.arm_b,
        }
    }

    /// Shape and range checks. Every problem is reported, not just the
    /// first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let v = &self.vision;
        if !(0.0..=1.0).contains(&v.confidence) {
            problems.push(format!("vision.confidence must be in [0, 1], got {}", v.confidence));
        }
        if !v.undistort_alpha.is_finite() || !(0.0..=1.0).contains(&v.undistort_alpha) {
            problems.push("vision.undistort_alpha must be in [0, 1]".to_string());
        }
        if v.smoothing_window == 0 {
            problems.push("vision.smoothing_window must be >= 1".to_string());
        }
        if v.reference_point_mm.iter().any(|c| !c.is_finite()) {
            problems.push("vision.reference_point_mm must be finite".to_string());
        }
        if let Err(e) = v.markers.validate() {
            problems.push(format!("vision.markers: {e}"));
        }
        if let Err(e) = v.fence.validate() {
            problems.push(format!("vision.fence: {e}"));
        }
        let threshold = v.ransac.inlier_threshold;
        if !threshold.is_finite() || threshold <= 0.0 || v.ransac.max_iters == 0 {
            problems.push("vision.ransac needs max_iters >= 1 and a positive threshold".to_string());
        }

        for (name, arm) in [("arm_a", &self.arm_a), ("arm_b", &self.arm_b)] {
            validate_arm(name, arm, &mut problems);
        }

        let t = &self.tray;
        if t.rows == 0 || t.cols == 0 {
            problems.push("tray grid needs at least one row and one column".to_string());
        }
        let tray_numbers = [
            t.start_mm[0],
            t.start_mm[1],
            t.start_offset_mm[0],
            t.start_offset_mm[1],
            t.spacing_mm[0],
            t.spacing_mm[1],
            t.approach_z_mm,
            t.drop_z_mm,
            t.retract_z_mm,
        ];
        if tray_numbers.iter().any(|x| !x.is_finite()) {
            problems.push("tray values must be finite".to_string());
        }
        if t.cell_size_mm.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            problems.push("tray.cell_size_mm must be > 0".to_string());
        }
        if !t.deposit_accel_mm_s2.is_finite() || t.deposit_accel_mm_s2 < 0.0 {
            problems.push("tray.deposit_accel_mm_s2 must be >= 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }
}

fn validate_arm(name: &str, arm: &ArmConfig, problems: &mut Vec<String>) {
    if arm.address.parse::<Ipv4Addr>().is_err() {
        problems.push(format!("{name}.address '{}' is not a dotted IPv4 address", arm.address));
    }
    for (field, value) in [
        ("speed_mm_s", arm.speed_mm_s),
        ("accel_mm_s2", arm.accel_mm_s2),
        ("joint_speed_deg_s", arm.joint_speed_deg_s),
        ("joint_accel_deg_s2", arm.joint_accel_deg_s2),
        ("pick_lift_mm", arm.pick_lift_mm),
        ("transfer_approach_mm", arm.transfer_approach_mm),
    ] {
        if !value.is_finite() || value < 0.0 {
            problems.push(format!("{name}.{field} must be a non-negative number, got {value}"));
        }
    }
    for (field, pose) in [
        ("home_joints_deg", &arm.home_joints_deg),
        ("tcp_default_pose", &arm.tcp_default_pose),
        ("tcp_end_pose", &arm.tcp_end_pose),
        ("tcp_transfer_pose", &arm.tcp_transfer_pose),
        ("tool_offset", &arm.tool_offset),
        ("user_frame", &arm.user_frame),
    ] {
        if pose.iter().any(|x| !x.is_finite()) {
            problems.push(format!("{name}.{field} must be six finite numbers"));
        }
    }
}

/// Current configuration snapshot, swapped wholesale on reload.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<CellConfig>>,
}

impl ConfigStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let cfg = CellConfig::from_json_file(&path)?;
        tracing::info!("loaded config {}", path.display());
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(cfg)),
        })
    }

    /// In-memory store; `reload` keeps this snapshot.
    pub fn from_config(cfg: CellConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            path: None,
            current: RwLock::new(Arc::new(cfg)),
        })
    }

    pub fn snapshot(&self) -> Arc<CellConfig> {
        Arc::clone(&self.current.read())
    }

    /// Re-read and validate the file. On failure the previous snapshot stays
    /// in effect.
    pub fn reload(&self) -> Result<Arc<CellConfig>, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(self.snapshot());
        };
        let cfg = Arc::new(CellConfig::from_json_file(path)?);
        *self.current.write() = Arc::clone(&cfg);
        tracing::info!("reloaded config {}", path.display());
        Ok(cfg)
    }

    /// Replace the snapshot directly (operator edits applied in memory).
    pub fn replace(&self, cfg: CellConfig) -> Result<Arc<CellConfig>, ConfigError> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);
        *self.current.write() = Arc::clone(&cfg);
        Ok(cfg)
    }
}
