//! Configuration loading for the teach client

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// URScript (secondary interface) port
pub const UR_SCRIPT_PORT: u16 = 30002;
/// RTDE port
pub const UR_RTDE_PORT: u16 = 30004;
/// Robotiq URCap socket, only reachable on the controller loopback
pub const ROBOTIQ_PORT: u16 = 63352;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub robot: RobotConfig,
    pub telemetry: TelemetryConfig,
    pub motion: MotionConfig,
    pub gripper: GripperConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RobotConfig {
    pub host: String,
    pub script_port: u16,
    pub rtde_port: u16,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Path to the UR-style XML recipe descriptor
    pub recipe_file: String,
    pub recipe: String,
    pub frequency_hz: f64,
    pub pose_field: String,
    pub status_field: String,
    pub disconnected_backoff_ms: u64,
    pub tick_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MotionConfig {
    pub acceleration: f64,
    pub velocity: f64,
    pub settle_s: f64,
    pub program_name: String,
    pub end_freedrive_on_record: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GripperConfig {
    pub host: String,
    pub port: u16,
    pub socket_name: String,
    pub force: i32,
    pub speed: i32,
    pub open_position: i32,
    pub close_position: i32,
    pub min_position: i32,
    pub max_position: i32,
    pub tolerance: i32,
    pub timeout_s: f64,
    pub poll_s: f64,
    /// Close timeout used inside compiled routines; `None` falls back to `timeout_s`
    pub routine_close_timeout_s: Option<f64>,
    pub activate_on_start: bool,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.20".to_string(),
            script_port: UR_SCRIPT_PORT,
            rtde_port: UR_RTDE_PORT,
            connect_timeout_ms: 2000,
            write_timeout_ms: 2000,
            read_timeout_ms: 1000,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            recipe_file: "config/control_loop_configuration.xml".to_string(),
            recipe: "state".to_string(),
            frequency_hz: 125.0,
            pose_field: "actual_TCP_pose".to_string(),
            status_field: "robot_status_bits".to_string(),
            disconnected_backoff_ms: 200,
            tick_ms: 10,
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            acceleration: 0.6,
            velocity: 0.6,
            settle_s: 0.05,
            program_name: "taught_routine".to_string(),
            end_freedrive_on_record: true,
        }
    }
}

impl Default for GripperConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: ROBOTIQ_PORT,
            socket_name: "1".to_string(),
            force: 200,
            speed: 150,
            open_position: 10,
            close_position: 245,
            min_position: 10,
            max_position: 245,
            tolerance: 5,
            timeout_s: 12.0,
            poll_s: 0.02,
            routine_close_timeout_s: Some(0.5),
            activate_on_start: true,
        }
    }
}

impl Config {
    pub fn load_from_path(config_path: impl AsRef<Path>) -> Result<Self> {
        let path = config_path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the controller or the device would misinterpret
    pub fn validate(&self) -> Result<()> {
        if self.robot.host.trim().is_empty() {
            return Err(Error::Config("robot.host must not be empty".to_string()));
        }
        if !(self.telemetry.frequency_hz > 0.0 && self.telemetry.frequency_hz <= 500.0) {
            return Err(Error::Config(format!(
                "telemetry.frequency_hz must be in (0, 500], got {}",
                self.telemetry.frequency_hz
            )));
        }
        if !is_identifier(&self.motion.program_name) {
            return Err(Error::Config(format!(
                "motion.program_name '{}' is not a valid URScript identifier",
                self.motion.program_name
            )));
        }
        let g = &self.gripper;
        if g.min_position > g.max_position {
            return Err(Error::Config(format!(
                "gripper.min_position {} exceeds gripper.max_position {}",
                g.min_position, g.max_position
            )));
        }
        let mut durations = vec![
            ("motion.acceleration", self.motion.acceleration),
            ("motion.velocity", self.motion.velocity),
            ("motion.settle_s", self.motion.settle_s),
            ("gripper.timeout_s", g.timeout_s),
            ("gripper.poll_s", g.poll_s),
        ];
        if let Some(close) = g.routine_close_timeout_s {
            durations.push(("gripper.routine_close_timeout_s", close));
        }
        for (name, value) in durations {
            // NaN fails the comparison, so it lands here too
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::Config(format!("{} must be finite and positive, got {}", name, value)));
            }
        }
        Ok(())
    }
}

impl RobotConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl TelemetryConfig {
    pub fn disconnected_backoff(&self) -> Duration {
        Duration::from_millis(self.disconnected_backoff_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl GripperConfig {
    /// Clamp a requested target into the device range
    pub fn clamp(&self, position: i32) -> i32 {
        position.clamp(self.min_position, self.max_position)
    }

    pub fn routine_close_timeout(&self) -> f64 {
        self.routine_close_timeout_s.unwrap_or(self.timeout_s)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = Config::load_from_str("robot:\n  host: 10.0.0.7\n").unwrap();
        assert_eq!(config.robot.host, "10.0.0.7");
        assert_eq!(config.robot.script_port, 30002);
        assert_eq!(config.robot.rtde_port, 30004);
        assert_eq!(config.telemetry.frequency_hz, 125.0);
        assert_eq!(config.gripper.close_position, 245);
        assert_eq!(config.motion.settle_s, 0.05);
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "motion:\n  acceleration: 0.3\n  velocity: 0.25").unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.motion.acceleration, 0.3);
        assert_eq!(config.motion.velocity, 0.25);
        assert_eq!(config.motion.program_name, "taught_routine");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::load_from_path("/nonexistent/urteach.yaml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_bad_program_name() {
        let err = Config::load_from_str("motion:\n  program_name: \"2 bad\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_non_finite_and_negative_motion() {
        let err = Config::load_from_str("motion:\n  settle_s: .nan\n  velocity: -1.0\ngripper:\n  poll_s: .nan\n")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::load_from_str("motion:\n  velocity: -1.0\n").unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("motion.velocity")));

        let err = Config::load_from_str("gripper:\n  poll_s: .nan\n").unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("gripper.poll_s")));

        let err = Config::load_from_str("gripper:\n  routine_close_timeout_s: .inf\n").unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("routine_close_timeout_s")));

        assert!(Config::load_from_str("gripper:\n  routine_close_timeout_s: null\n").is_ok());
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default_config.yaml");
        let config = Config::load_from_path(path).unwrap();
        let defaults = Config::default();
        assert_eq!(config.robot.host, defaults.robot.host);
        assert_eq!(config.telemetry.recipe_file, defaults.telemetry.recipe_file);
        assert_eq!(config.gripper.routine_close_timeout_s, Some(0.5));
        assert_eq!(config.motion.program_name, defaults.motion.program_name);
    }

    #[test]
    fn test_gripper_clamp() {
        let gripper = GripperConfig::default();
        assert_eq!(gripper.clamp(0), 10);
        assert_eq!(gripper.clamp(128), 128);
        assert_eq!(gripper.clamp(300), 245);
    }
}
