//! Robotiq gripper protocol, driven from the host
//!
//! The same request/ack/poll machine that [`crate::urscript::GripperScript`]
//! embeds in routines, run here against a [`GripperPort`]. [`RobotiqSocket`]
//! talks to the URCap variable server over TCP; tests drive a simulated
//! device.

use crate::config::GripperConfig;
use crate::urscript::{
    ACK_LEN, ACTIVATION_FORCE, ACTIVATION_POSITION, ACTIVATION_SPEED, PULSE_OFF_S, PULSE_ON_S,
    RELAXED_TOLERANCE_MARGIN, TARGET_SETTLE_S,
};
use crate::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registers exposed by the URCap variable server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GripperVar {
    /// Activation request
    Act,
    /// Go-to (motion enable)
    Gto,
    Force,
    Speed,
    /// Requested / actual position
    Pos,
    /// Fault status, 0 when healthy
    Flt,
    /// Object detection status
    Obj,
}

impl GripperVar {
    pub fn name(self) -> &'static str {
        match self {
            GripperVar::Act => "ACT",
            GripperVar::Gto => "GTO",
            GripperVar::Force => "FOR",
            GripperVar::Speed => "SPE",
            GripperVar::Pos => "POS",
            GripperVar::Flt => "FLT",
            GripperVar::Obj => "OBJ",
        }
    }
}

impl fmt::Display for GripperVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Variable-level access to a gripper.
///
/// `set_var` returns only after the device acknowledged the write.
pub trait GripperPort {
    fn set_var(&mut self, var: GripperVar, value: i32) -> Result<()>;
    fn get_var(&mut self, var: GripperVar) -> Result<i32>;
}

/// Source of the fixed protocol delays
pub trait Pause {
    fn pause(&mut self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Result of a hybrid move-and-classify, with the codes routines return
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Fault = -1,
    NotReached = 0,
    Type1 = 1,
    Type2 = 2,
    StableNoObject = 3,
}

impl Classification {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Classification::Fault),
            0 => Some(Classification::NotReached),
            1 => Some(Classification::Type1),
            2 => Some(Classification::Type2),
            3 => Some(Classification::StableNoObject),
            _ => None,
        }
    }
}

/// How a position wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached,
    /// Fault flag seen; the wait stopped at once
    Faulted,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GripperPhase {
    Idle,
    Activating,
    Ready,
    Moving,
    Classified(Classification),
    NotReached,
    Faulted,
}

pub struct GripperDriver<P: GripperPort, C: Pause = ThreadPause> {
    port: P,
    clock: C,
    config: GripperConfig,
    phase: GripperPhase,
}

impl<P: GripperPort> GripperDriver<P, ThreadPause> {
    pub fn new(port: P, config: GripperConfig) -> Self {
        Self::with_pause(port, config, ThreadPause)
    }
}

impl<P: GripperPort, C: Pause> GripperDriver<P, C> {
    pub fn with_pause(port: P, config: GripperConfig, clock: C) -> Self {
        Self { port, clock, config, phase: GripperPhase::Idle }
    }

    pub fn phase(&self) -> GripperPhase {
        self.phase
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    fn sleep_s(&mut self, seconds: f64) {
        self.clock.pause(Duration::from_secs_f64(seconds));
    }

    /// Reset, activate, then load working force/speed.
    ///
    /// FOR/SPE/GTO are written twice: the activation values first, the
    /// configured ones after. The device ignores them until ACT has settled.
    pub fn activate(&mut self) -> Result<()> {
        self.phase = GripperPhase::Activating;
        let result = self.run_activation();
        self.phase = match &result {
            Ok(()) => GripperPhase::Ready,
            Err(_) => GripperPhase::Idle,
        };
        if result.is_ok() {
            info!("Gripper activated");
        }
        result
    }

    fn run_activation(&mut self) -> Result<()> {
        self.sleep_s(0.2);
        self.port.set_var(GripperVar::Act, 0)?;
        self.port.set_var(GripperVar::Gto, 0)?;
        self.sleep_s(0.1);
        self.port.set_var(GripperVar::Act, 1)?;
        self.sleep_s(0.5);
        self.port.set_var(GripperVar::Force, ACTIVATION_FORCE)?;
        self.port.set_var(GripperVar::Speed, ACTIVATION_SPEED)?;
        self.port.set_var(GripperVar::Gto, 1)?;
        self.port.set_var(GripperVar::Force, self.config.force)?;
        self.port.set_var(GripperVar::Speed, self.config.speed)?;
        self.port.set_var(GripperVar::Gto, 1)?;
        self.port.set_var(GripperVar::Pos, ACTIVATION_POSITION)?;
        self.sleep_s(TARGET_SETTLE_S);
        self.port.set_var(GripperVar::Gto, 1)?;
        self.sleep_s(PULSE_ON_S);
        Ok(())
    }

    fn distance_to(&mut self, goal: i32) -> Result<i32> {
        Ok((self.port.get_var(GripperVar::Pos)? - goal).abs())
    }

    /// Poll FLT then POS every `poll_s` until within tolerance or `timeout_s`
    pub fn wait_pos_reached(&mut self, goal: i32) -> Result<WaitOutcome> {
        let goal = self.config.clamp(goal);
        let tolerance = self.config.tolerance;
        let timeout = Duration::from_secs_f64(self.config.timeout_s);
        let poll = Duration::from_secs_f64(self.config.poll_s);

        let mut waited = Duration::ZERO;
        while waited < timeout {
            if self.port.get_var(GripperVar::Flt)? != 0 {
                return Ok(WaitOutcome::Faulted);
            }
            if self.distance_to(goal)? <= tolerance {
                return Ok(WaitOutcome::Reached);
            }
            self.clock.pause(poll);
            waited += poll;
        }

        if self.port.get_var(GripperVar::Flt)? != 0 {
            return Ok(WaitOutcome::Faulted);
        }
        if self.distance_to(goal)? <= tolerance + RELAXED_TOLERANCE_MARGIN {
            debug!("Gripper reached {} on the relaxed check", goal);
            return Ok(WaitOutcome::Reached);
        }
        Ok(WaitOutcome::TimedOut)
    }

    /// Pulse GTO around the new target, then wait for the position
    pub fn move_to_pos_and_wait(&mut self, target: i32) -> Result<WaitOutcome> {
        match self.phase {
            GripperPhase::Idle | GripperPhase::Activating => {
                return Err(Error::Device("Gripper is not activated".to_string()));
            }
            GripperPhase::Faulted => {
                return Err(Error::Device("Gripper faulted; activate it again".to_string()));
            }
            _ => {}
        }

        let target = self.config.clamp(target);
        self.phase = GripperPhase::Moving;
        self.port.set_var(GripperVar::Gto, 0)?;
        self.sleep_s(PULSE_OFF_S);
        self.port.set_var(GripperVar::Pos, target)?;
        self.sleep_s(TARGET_SETTLE_S);
        self.port.set_var(GripperVar::Gto, 1)?;
        self.sleep_s(PULSE_ON_S);
        self.wait_pos_reached(target)
    }

    /// Move, then map fault / position / object detection to a [`Classification`].
    ///
    /// A fault seen during the wait or after it wins over every other outcome.
    pub fn move_and_classify(&mut self, target: i32) -> Result<Classification> {
        let outcome = self.move_to_pos_and_wait(target)?;
        let fault = self.port.get_var(GripperVar::Flt)?;

        let classification = if outcome == WaitOutcome::Faulted || fault != 0 {
            Classification::Fault
        } else if outcome == WaitOutcome::TimedOut {
            Classification::NotReached
        } else {
            match self.port.get_var(GripperVar::Obj)? {
                1 => Classification::Type1,
                2 => Classification::Type2,
                _ => Classification::StableNoObject,
            }
        };

        self.phase = match classification {
            Classification::Fault => GripperPhase::Faulted,
            Classification::NotReached => GripperPhase::NotReached,
            other => GripperPhase::Classified(other),
        };
        match classification {
            Classification::Fault => warn!("Gripper fault (FLT={}) moving to {}", fault, target),
            other => debug!("Gripper move to {} classified as {:?}", target, other),
        }
        Ok(classification)
    }

    pub fn open(&mut self) -> Result<Classification> {
        self.move_and_classify(self.config.open_position)
    }

    pub fn close(&mut self) -> Result<Classification> {
        self.move_and_classify(self.config.close_position)
    }
}

/// Line protocol of the Robotiq URCap variable server.
///
/// `SET <VAR> <value>` is answered with `ack`, `GET <VAR>` with
/// `<VAR> <value>`.
pub struct RobotiqSocket {
    endpoint: String,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl RobotiqSocket {
    pub fn connect(host: &str, port: u16, connect_timeout: Duration, io_timeout: Duration) -> Result<Self> {
        let endpoint = format!("{}:{}", host, port);
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::transport(&endpoint, e))?
            .next()
            .ok_or_else(|| Error::Config(format!("Cannot resolve gripper address {}", endpoint)))?;

        let stream = TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(|e| Error::transport(&endpoint, e))?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;
        stream.set_nodelay(true)?;

        let writer = stream.try_clone()?;
        info!("Connected to gripper at {}", endpoint);
        Ok(Self { endpoint, reader: BufReader::new(stream), writer })
    }

    fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .map_err(|e| Error::transport(&self.endpoint, e))
    }
}

impl GripperPort for RobotiqSocket {
    fn set_var(&mut self, var: GripperVar, value: i32) -> Result<()> {
        self.send_line(&format!("SET {} {}", var, value))?;

        let mut ack = [0u8; ACK_LEN];
        self.reader
            .read_exact(&mut ack)
            .map_err(|e| Error::transport(&self.endpoint, e))?;
        if &ack != b"ack" {
            return Err(Error::Device(format!(
                "Expected ack for SET {}, got {:?}",
                var,
                String::from_utf8_lossy(&ack)
            )));
        }
        Ok(())
    }

    fn get_var(&mut self, var: GripperVar) -> Result<i32> {
        self.send_line(&format!("GET {}", var))?;

        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(|e| Error::transport(&self.endpoint, e))?;
        if read == 0 {
            return Err(Error::transport(
                &self.endpoint,
                std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            ));
        }

        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next().map(str::parse::<i32>)) {
            (Some(name), Some(Ok(value))) if name == var.name() => Ok(value),
            _ => Err(Error::Device(format!("Unexpected reply to GET {}: {:?}", var, line.trim_end()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Gripper that travels `step` units per POS read once GTO is set
    #[derive(Default)]
    struct SimGripper {
        pos: i32,
        target: i32,
        gto: i32,
        step: i32,
        /// Position the fingers cannot pass
        stall_at: Option<i32>,
        /// FLT value reported once motion starts
        fault: i32,
        obj: i32,
        writes: Vec<(GripperVar, i32)>,
        pos_reads: usize,
    }

    impl SimGripper {
        fn new(step: i32) -> Self {
            Self { pos: 10, target: 10, step, obj: 3, ..Self::default() }
        }
    }

    impl GripperPort for SimGripper {
        fn set_var(&mut self, var: GripperVar, value: i32) -> Result<()> {
            self.writes.push((var, value));
            match var {
                GripperVar::Gto => self.gto = value,
                GripperVar::Pos => self.target = value,
                _ => {}
            }
            Ok(())
        }

        fn get_var(&mut self, var: GripperVar) -> Result<i32> {
            Ok(match var {
                GripperVar::Flt if self.gto == 1 => self.fault,
                GripperVar::Flt => 0,
                GripperVar::Obj => self.obj,
                GripperVar::Pos => {
                    self.pos_reads += 1;
                    if self.gto == 1 {
                        let delta = (self.target - self.pos).clamp(-self.step, self.step);
                        self.pos += delta;
                        if let Some(limit) = self.stall_at {
                            self.pos = self.pos.min(limit);
                        }
                    }
                    self.pos
                }
                other => return Err(Error::Device(format!("{} is write-only", other))),
            })
        }
    }

    #[derive(Clone, Default)]
    struct RecordingPause(Rc<RefCell<Vec<Duration>>>);

    impl RecordingPause {
        fn millis(&self) -> Vec<u64> {
            self.0.borrow().iter().map(|d| (d.as_secs_f64() * 1000.0).round() as u64).collect()
        }

        fn polls(&self) -> usize {
            self.millis().iter().filter(|ms| **ms == 20).count()
        }
    }

    impl Pause for RecordingPause {
        fn pause(&mut self, duration: Duration) {
            self.0.borrow_mut().push(duration);
        }
    }

    fn ready(device: SimGripper, config: GripperConfig) -> (GripperDriver<SimGripper, RecordingPause>, RecordingPause) {
        let clock = RecordingPause::default();
        let mut driver = GripperDriver::with_pause(device, config, clock.clone());
        driver.activate().unwrap();
        clock.0.borrow_mut().clear();
        (driver, clock)
    }

    #[test]
    fn test_reaches_target_within_expected_polls() {
        let (mut driver, clock) = ready(SimGripper::new(50), GripperConfig::default());

        assert_eq!(driver.close().unwrap(), Classification::StableNoObject);
        // 10 -> 60 -> 110 -> 160 -> 210 -> 245: fifth read is in tolerance
        assert_eq!(driver.port().pos_reads, 5);
        assert_eq!(clock.polls(), 4);
        assert_eq!(driver.phase(), GripperPhase::Classified(Classification::StableNoObject));
    }

    #[test]
    fn test_persistent_fault_returns_immediately() {
        let mut device = SimGripper::new(50);
        device.fault = 7;
        let (mut driver, clock) = ready(device, GripperConfig::default());

        assert_eq!(driver.close().unwrap(), Classification::Fault);
        assert_eq!(clock.polls(), 0);
        assert_eq!(driver.port().pos_reads, 0);
        assert_eq!(driver.phase(), GripperPhase::Faulted);
        assert!(matches!(driver.open(), Err(Error::Device(_))));
    }

    #[test]
    fn test_relaxed_check_after_timeout() {
        let config = GripperConfig { timeout_s: 0.1, ..GripperConfig::default() };

        let mut device = SimGripper::new(100);
        device.stall_at = Some(238);
        let (mut driver, clock) = ready(device, config.clone());
        assert_eq!(driver.wait_pos_reached(245).unwrap(), WaitOutcome::TimedOut);

        // 238 is 7 from 245: only the relaxed check accepts it
        assert_eq!(driver.close().unwrap(), Classification::StableNoObject);
        assert_eq!(clock.polls(), 10);

        let mut device = SimGripper::new(100);
        device.stall_at = Some(237);
        let (mut driver, _) = ready(device, config);
        assert_eq!(driver.close().unwrap(), Classification::NotReached);
        assert_eq!(driver.phase(), GripperPhase::NotReached);
    }

    #[test]
    fn test_object_detection_mapping() {
        let mut device = SimGripper::new(300);
        device.obj = 2;
        let (mut driver, _) = ready(device, GripperConfig::default());
        assert_eq!(driver.close().unwrap(), Classification::Type2);

        driver.port.obj = 1;
        assert_eq!(driver.open().unwrap(), Classification::Type1);
        assert_eq!(Classification::from_code(-1), Some(Classification::Fault));
        assert_eq!(Classification::Type2.code(), 2);
        assert_eq!(Classification::from_code(4), None);
    }

    #[test]
    fn test_move_pulse_clamps_target() {
        let (mut driver, clock) = ready(SimGripper::new(300), GripperConfig::default());
        driver.move_and_classify(300).unwrap();

        assert_eq!(
            driver.port().writes[11..],
            [(GripperVar::Gto, 0), (GripperVar::Pos, 245), (GripperVar::Gto, 1)]
        );
        assert_eq!(clock.millis()[..3], [30, 30, 60]);
    }

    #[test]
    fn test_activation_order_and_idle_guard() {
        let mut driver = GripperDriver::with_pause(
            SimGripper::new(50),
            GripperConfig::default(),
            RecordingPause::default(),
        );
        assert_eq!(driver.phase(), GripperPhase::Idle);
        assert!(matches!(driver.open(), Err(Error::Device(_))));

        driver.activate().unwrap();
        assert_eq!(driver.phase(), GripperPhase::Ready);
        let vars: Vec<(&str, i32)> = driver.port().writes.iter().map(|(v, x)| (v.name(), *x)).collect();
        assert_eq!(
            vars,
            vec![
                ("ACT", 0),
                ("GTO", 0),
                ("ACT", 1),
                ("FOR", 128),
                ("SPE", 200),
                ("GTO", 1),
                ("FOR", 200),
                ("SPE", 150),
                ("GTO", 1),
                ("POS", 5),
                ("GTO", 1),
            ]
        );
    }

    #[test]
    fn test_socket_reads_ack_before_next_command() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut seen = Vec::new();
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                let request = line.trim_end().to_string();
                line.clear();
                if request.starts_with("SET ") {
                    writer.write_all(b"ack").unwrap();
                } else if request == "GET POS" {
                    writer.write_all(b"POS 244\n").unwrap();
                } else {
                    writer.write_all(b"ERR\n").unwrap();
                }
                seen.push(request);
            }
            seen
        });

        let mut socket =
            RobotiqSocket::connect("127.0.0.1", port, Duration::from_secs(2), Duration::from_secs(2)).unwrap();
        socket.set_var(GripperVar::Gto, 1).unwrap();
        socket.set_var(GripperVar::Pos, 245).unwrap();
        assert_eq!(socket.get_var(GripperVar::Pos).unwrap(), 244);
        assert!(matches!(socket.get_var(GripperVar::Obj), Err(Error::Device(_))));
        drop(socket);

        assert_eq!(server.join().unwrap(), vec!["SET GTO 1", "SET POS 245", "GET POS", "GET OBJ"]);
    }
}
