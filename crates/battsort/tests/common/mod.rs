#![allow(dead_code)]

use battsort::CellConfig;

pub const CELL_JSON: &str = r#"{
    "schema": "battsort.config.v1",
    "vision": {
        "calibration_path": "calib/cam_pos.npz",
        "confidence": 0.5,
        "guard_px": 8,
        "smoothing_window": 3,
        "fence": { "min_x_mm": 0.0, "max_x_mm": 300.0, "min_y_mm": 0.0, "max_y_mm": 200.0 }
    },
    "arm_a": {
        "address": "10.0.0.10",
        "tool_channel": 3,
        "speed_mm_s": 200.0,
        "accel_mm_s2": 100.0,
        "joint_speed_deg_s": 60.0,
        "joint_accel_deg_s2": 30.0,
        "home_joints_deg": [0, 90, -90, 90, -90, 0],
        "tcp_default_pose": [0, 0, 40, 180, 0, 0],
        "tcp_end_pose": [350, 0, 200, 180, 0, 0],
        "tcp_transfer_pose": [400, 150, 250, 180, 0, 90],
        "tool_offset": [0, 0, 60, 0, 0, 0],
        "user_frame": [0, 0, 0, 0, 0, 0],
        "release_settle_ms": 5
    },
    "arm_b": {
        "address": "10.0.0.11",
        "tool_channel": 4,
        "speed_mm_s": 200.0,
        "accel_mm_s2": 100.0,
        "joint_speed_deg_s": 60.0,
        "joint_accel_deg_s2": 30.0,
        "home_joints_deg": [0, 90, -90, 90, -90, 0],
        "tcp_default_pose": [0, 0, 40, 180, 0, 0],
        "tcp_end_pose": [300, 0, 220, 180, 0, 0],
        "tcp_transfer_pose": [380, -150, 250, 180, 0, -90],
        "tool_offset": [0, 0, 60, 0, 0, 0],
        "user_frame": [0, 0, 0, 0, 0, 0]
    },
    "tray": {
        "rows": 2,
        "cols": 3,
        "start_mm": [100.0, 50.0],
        "cell_size_mm": [20.0, 70.0],
        "spacing_mm": [2.0, 4.0]
    }
}"#;

pub fn cell_config() -> CellConfig {
    CellConfig::from_json_str(CELL_JSON).unwrap()
}
