//! Published robot state
//!
//! One background reader owns the only writer handle for the state slot.
//! Every cycle it replaces the whole [`StateSnapshot`] at once, so readers
//! see either the previous frame or the newest one, never a mix.

use crate::config::TelemetryConfig;
use crate::rtde::TelemetrySession;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// One decoded telemetry cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StateFrame {
    /// TCP pose [x, y, z, rx, ry, rz] in meters and radians
    pub tcp_pose: [f64; 6],
    pub status_bits: u32,
}

impl StateFrame {
    pub fn from_fields(
        data: &HashMap<String, Vec<f64>>,
        pose_field: &str,
        status_field: &str,
    ) -> Result<Self> {
        let pose = data
            .get(pose_field)
            .ok_or_else(|| Error::Decode(format!("Frame is missing '{}'", pose_field)))?;
        let tcp_pose: [f64; 6] = pose.as_slice().try_into().map_err(|_| {
            Error::Decode(format!("'{}' has {} values, expected 6", pose_field, pose.len()))
        })?;

        let status = data
            .get(status_field)
            .and_then(|v| v.first())
            .copied()
            .ok_or_else(|| Error::Decode(format!("Frame is missing '{}'", status_field)))?;
        if !(0.0..=u32::MAX as f64).contains(&status) || status.fract() != 0.0 {
            return Err(Error::Decode(format!("'{}' is not a 32-bit status word: {}", status_field, status)));
        }

        Ok(Self { tcp_pose, status_bits: status as u32 })
    }
}

/// Freedrive indicator derived from the robot status bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freedrive {
    #[default]
    Unknown,
    Off,
    On,
}

impl Freedrive {
    /// Map a status word to an indicator.
    ///
    /// Only 1/3 and 5/7 are known; anything else yields `None` and the
    /// caller keeps whatever it showed before.
    pub fn classify(status_bits: u32) -> Option<Freedrive> {
        match status_bits {
            1 | 3 => Some(Freedrive::Off),
            5 | 7 => Some(Freedrive::On),
            _ => None,
        }
    }

    pub fn next(self, status_bits: u32) -> Freedrive {
        Self::classify(status_bits).unwrap_or(self)
    }

    pub fn label(self) -> &'static str {
        match self {
            Freedrive::Unknown => "Cobot normal",
            Freedrive::Off => "Freedrive off",
            Freedrive::On => "Freedrive on",
        }
    }
}

/// What readers of the state slot get
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub frame: Option<StateFrame>,
    pub freedrive: Freedrive,
    /// Frames published since the cache was created
    pub cycle: u64,
    pub received_at: Option<DateTime<Utc>>,
    /// Which `attach` call produced `frame`; 0 before any link
    pub attachment: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub telemetry: LinkStatus,
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn connected() -> Self {
        Self { telemetry: LinkStatus::Connected, last_error: None }
    }

    pub fn disconnected(last_error: Option<String>) -> Self {
        Self { telemetry: LinkStatus::Disconnected, last_error }
    }

    pub fn is_connected(&self) -> bool {
        self.telemetry == LinkStatus::Connected
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::disconnected(None)
    }
}

/// Blocking producer of state frames, one per control cycle
pub trait FrameSource: Send {
    fn receive(&mut self) -> Result<StateFrame>;

    /// Tear the link down; called once when the source is replaced or dropped
    fn close(self: Box<Self>) {}
}

impl FrameSource for TelemetrySession {
    fn receive(&mut self) -> Result<StateFrame> {
        TelemetrySession::receive(self)
    }

    fn close(self: Box<Self>) {
        self.disconnect();
    }
}

/// Reader loop pacing
#[derive(Debug, Clone, Copy)]
pub struct ReaderTiming {
    /// Pause after every iteration
    pub tick: Duration,
    /// Pause while no link is attached
    pub backoff: Duration,
}

impl ReaderTiming {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self { tick: config.tick(), backoff: config.disconnected_backoff() }
    }
}

enum LinkControl {
    Attach(Box<dyn FrameSource>, u64),
    Detach,
}

/// Single-writer, multi-reader robot state slot fed by a background reader
pub struct StateCache {
    state_receiver: watch::Receiver<StateSnapshot>,
    connection: Arc<watch::Sender<ConnectionState>>,
    control: mpsc::Sender<LinkControl>,
    attachments: AtomicU64,
    shutdown_signal: Arc<AtomicBool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl StateCache {
    /// Start the reader loop with no link attached
    pub fn spawn(timing: ReaderTiming) -> Self {
        let (state_sender, state_receiver) = watch::channel(StateSnapshot::default());
        let connection = Arc::new(watch::Sender::new(ConnectionState::default()));
        let (control, control_receiver) = mpsc::channel();
        let shutdown_signal = Arc::new(AtomicBool::new(false));

        let reader = ReaderLoop {
            link: None,
            attachment: 0,
            control: control_receiver,
            state: state_sender,
            connection: Arc::clone(&connection),
            shutdown_signal: Arc::clone(&shutdown_signal),
            timing,
        };
        let task_handle = tokio::task::spawn_blocking(move || reader.run());

        Self {
            state_receiver,
            connection,
            control,
            attachments: AtomicU64::new(0),
            shutdown_signal,
            task_handle: Some(task_handle),
        }
    }

    /// Hand a freshly negotiated link to the reader, replacing any current one.
    ///
    /// Frames from earlier links stop being visible right away; `latest_frame`
    /// is `None` until the new link publishes.
    pub fn attach(&self, source: Box<dyn FrameSource>) -> Result<()> {
        let attachment = self.attachments.fetch_add(1, Ordering::SeqCst) + 1;
        self.connection.send_replace(ConnectionState::connected());
        self.control
            .send(LinkControl::Attach(source, attachment))
            .map_err(|_| Error::Config("State reader has stopped".to_string()))
    }

    pub fn detach(&self) -> Result<()> {
        self.connection.send_replace(ConnectionState::disconnected(None));
        self.control
            .send(LinkControl::Detach)
            .map_err(|_| Error::Config("State reader has stopped".to_string()))
    }

    /// Drop any link and publish `Disconnected` carrying `message`
    pub fn fail(&self, message: impl Into<String>) -> Result<()> {
        self.connection.send_replace(ConnectionState::disconnected(Some(message.into())));
        self.control
            .send(LinkControl::Detach)
            .map_err(|_| Error::Config("State reader has stopped".to_string()))
    }

    /// Latest published snapshot (non-blocking)
    pub fn latest(&self) -> StateSnapshot {
        let mut snapshot = self.state_receiver.borrow().clone();
        if !self.is_current(&snapshot) {
            snapshot.frame = None;
            snapshot.received_at = None;
        }
        snapshot
    }

    pub fn latest_frame(&self) -> Option<StateFrame> {
        let snapshot = self.state_receiver.borrow();
        snapshot.frame.filter(|_| self.is_current(&snapshot))
    }

    fn is_current(&self, snapshot: &StateSnapshot) -> bool {
        snapshot.attachment == self.attachments.load(Ordering::SeqCst)
    }

    pub fn freedrive(&self) -> Freedrive {
        self.state_receiver.borrow().freedrive
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection.borrow().clone()
    }

    /// Receiver that can await the next published snapshot
    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.state_receiver.clone()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Stop the reader and wait for it to release the link
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown_signal.store(true, Ordering::Relaxed);
        if let Some(handle) = self.task_handle.take() {
            handle.await?;
        }
        Ok(())
    }
}

impl Drop for StateCache {
    fn drop(&mut self) {
        self.shutdown_signal.store(true, Ordering::Relaxed);
    }
}

struct ReaderLoop {
    link: Option<Box<dyn FrameSource>>,
    attachment: u64,
    control: mpsc::Receiver<LinkControl>,
    state: watch::Sender<StateSnapshot>,
    connection: Arc<watch::Sender<ConnectionState>>,
    shutdown_signal: Arc<AtomicBool>,
    timing: ReaderTiming,
}

impl ReaderLoop {
    fn run(mut self) {
        info!("State reader started");
        let mut freedrive = Freedrive::Unknown;
        let mut cycle = 0u64;

        while !self.shutdown_signal.load(Ordering::Relaxed) {
            if !self.apply_control() {
                break;
            }

            let Some(link) = self.link.as_mut() else {
                std::thread::sleep(self.timing.backoff);
                continue;
            };

            match link.receive() {
                Ok(frame) => {
                    cycle += 1;
                    freedrive = freedrive.next(frame.status_bits);
                    self.state.send_replace(StateSnapshot {
                        frame: Some(frame),
                        freedrive,
                        cycle,
                        received_at: Some(Utc::now()),
                        attachment: self.attachment,
                    });
                }
                Err(e) if e.is_transient() => {
                    debug!("No telemetry frame this tick: {}", e);
                }
                Err(e) => {
                    warn!("Telemetry link lost: {}", e);
                    if let Some(link) = self.link.take() {
                        link.close();
                    }
                    self.connection.send_replace(ConnectionState::disconnected(Some(e.to_string())));
                }
            }

            std::thread::sleep(self.timing.tick);
        }

        if let Some(link) = self.link.take() {
            link.close();
        }
        info!("State reader stopped");
    }

    /// Drain pending attach/detach requests; false once the owner is gone
    fn apply_control(&mut self) -> bool {
        loop {
            match self.control.try_recv() {
                Ok(LinkControl::Attach(source, attachment)) => {
                    if let Some(old) = self.link.replace(source) {
                        old.close();
                    }
                    self.attachment = attachment;
                    self.state.send_modify(|snapshot| {
                        snapshot.frame = None;
                        snapshot.received_at = None;
                        snapshot.attachment = attachment;
                    });
                    self.connection.send_replace(ConnectionState::connected());
                    info!("Telemetry link attached");
                }
                Ok(LinkControl::Detach) => {
                    if let Some(old) = self.link.take() {
                        old.close();
                        info!("Telemetry link detached");
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }
}
