//! Teach session
//!
//! Owns everything one operator works with: the script channel, the state
//! cache and its reader, the recorded sequence and the gripper flag. Any
//! front end drives the robot through these operations and renders what
//! they return.

use crate::command::CommandChannel;
use crate::compiler::ScriptCompiler;
use crate::config::Config;
use crate::recipe::{RecipeFile, RecipeSource};
use crate::rtde::{LinkSettings, TelemetrySession};
use crate::sequence::{GripperAction, GripperState, Instruction, InstructionSequence, Pose};
use crate::state::{ConnectionState, FrameSource, Freedrive, ReaderTiming, StateCache, StateSnapshot};
use crate::urscript::{self, GripperScript};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Serializable view of a session for status displays
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub robot: String,
    pub connection: ConnectionState,
    pub freedrive: Freedrive,
    pub freedrive_label: &'static str,
    pub gripper: GripperState,
    pub gripper_label: &'static str,
    pub steps: usize,
    pub snapshot: StateSnapshot,
}

pub struct TeachSession {
    config: Config,
    recipes: Arc<dyn RecipeSource>,
    commands: CommandChannel,
    gripper: GripperScript,
    compiler: ScriptCompiler,
    cache: StateCache,
    sequence: InstructionSequence,
    gripper_state: GripperState,
}

impl TeachSession {
    /// Start a session with its state reader; must run inside a tokio runtime
    pub fn new(config: Config, recipes: Arc<dyn RecipeSource>) -> Self {
        let gripper = GripperScript::new(config.gripper.clone());
        let compiler = ScriptCompiler::new(config.motion.clone(), gripper.clone());
        let commands = CommandChannel::from_config(&config.robot);
        let cache = StateCache::spawn(ReaderTiming::from_config(&config.telemetry));

        Self {
            config,
            recipes,
            commands,
            gripper,
            compiler,
            cache,
            sequence: InstructionSequence::new(),
            gripper_state: GripperState::default(),
        }
    }

    /// Start a session reading recipes from the configured descriptor file
    pub fn from_config(config: Config) -> Result<Self> {
        let recipes = RecipeFile::load(&config.telemetry.recipe_file)?;
        Ok(Self::new(config, Arc::new(recipes)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Negotiate a fresh RTDE session and hand it to the reader.
    ///
    /// A failure leaves the link `Disconnected` with the error recorded.
    pub async fn connect_telemetry(&self) -> Result<()> {
        let settings = LinkSettings::from_config(&self.config);
        let recipes = Arc::clone(&self.recipes);

        let connected =
            tokio::task::spawn_blocking(move || TelemetrySession::connect(&settings, recipes.as_ref())).await?;
        match connected {
            Ok(session) => self.attach_source(Box::new(session)),
            Err(e) => {
                warn!("Telemetry connect failed: {}", e);
                self.cache.fail(e.to_string())?;
                Err(e)
            }
        }
    }

    /// Feed the reader from an already-open source
    pub fn attach_source(&self, source: Box<dyn FrameSource>) -> Result<()> {
        self.cache.attach(source)
    }

    pub fn disconnect_telemetry(&self) -> Result<()> {
        info!("Disconnecting telemetry");
        self.cache.detach()
    }

    pub async fn send_raw(&self, script: &str) -> Result<()> {
        self.commands.send(script).await
    }

    /// Append the current TCP pose.
    ///
    /// Needs a connected link and at least one frame. Freedrive is ended
    /// first when configured; failing to end it does not stop the record.
    pub async fn record_pose(&mut self) -> Result<Pose> {
        if !self.cache.connection().is_connected() {
            return Err(Error::NotConnected);
        }

        if self.config.motion.end_freedrive_on_record {
            if let Err(e) = self.commands.send(&urscript::end_freedrive()).await {
                warn!("Could not end freedrive before recording: {}", e);
            }
        }

        let frame = self.cache.latest_frame().ok_or(Error::NoFrame)?;
        let pose = Pose::from(frame.tcp_pose);
        self.sequence.record_pose(pose);
        info!("Recorded pose {} (step {})", pose, self.sequence.len());
        Ok(pose)
    }

    /// Append a gripper step implied by the current gripper state
    pub fn record_gripper_action(&mut self) -> Instruction {
        let step = *self.sequence.record_gripper_action(self.gripper_state);
        if let Instruction::GripperStep { action } = step {
            self.gripper_state = GripperState::after(action);
        }
        info!("Recorded {}", step.transcript_line());
        step
    }

    pub fn remove_last(&mut self) -> Option<Instruction> {
        self.sequence.remove_last()
    }

    pub fn clear_all(&mut self) {
        self.sequence.clear();
    }

    pub fn sequence(&self) -> &InstructionSequence {
        &self.sequence
    }

    pub fn compile_script(&self) -> Result<String> {
        self.compiler.compile(&self.sequence)
    }

    /// Compile the recorded routine and send it; returns the payload sent
    pub async fn compile_and_execute(&self) -> Result<String> {
        let script = self.compile_script()?;
        self.commands.send(&script).await?;
        info!(
            "Sent '{}' with {} steps to {}",
            self.compiler.program_name(),
            self.sequence.len(),
            self.commands.endpoint()
        );
        Ok(script)
    }

    pub fn current_freedrive_indicator(&self) -> Freedrive {
        self.cache.freedrive()
    }

    pub fn current_gripper_label(&self) -> &'static str {
        self.gripper_state.label()
    }

    pub fn gripper_state(&self) -> GripperState {
        self.gripper_state
    }

    pub fn transcript_lines(&self) -> Vec<String> {
        self.sequence.transcript_lines()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.cache.connection()
    }

    pub fn latest_snapshot(&self) -> StateSnapshot {
        self.cache.latest()
    }

    pub fn state_cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn status(&self) -> SessionStatus {
        let freedrive = self.current_freedrive_indicator();
        SessionStatus {
            robot: self.config.robot.host.clone(),
            connection: self.connection_state(),
            freedrive,
            freedrive_label: freedrive.label(),
            gripper: self.gripper_state,
            gripper_label: self.current_gripper_label(),
            steps: self.sequence.len(),
            snapshot: self.latest_snapshot(),
        }
    }

    pub async fn enable_freedrive(&self) -> Result<()> {
        self.commands.send(&urscript::enable_freedrive()).await
    }

    pub async fn end_freedrive(&self) -> Result<()> {
        self.commands.send(&urscript::end_freedrive()).await
    }

    pub async fn align_tool_z(&self) -> Result<()> {
        self.commands.send(&urscript::align_tool_z()).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.commands.send(&urscript::stop()).await
    }

    pub async fn activate_gripper(&self) -> Result<()> {
        self.commands.send(&self.gripper.activation_program()).await?;
        info!("Gripper activation sent");
        Ok(())
    }

    pub async fn open_gripper(&mut self) -> Result<()> {
        self.move_gripper(GripperAction::Open).await
    }

    pub async fn close_gripper(&mut self) -> Result<()> {
        self.move_gripper(GripperAction::Close).await
    }

    /// The label only changes once the program was handed to the robot
    async fn move_gripper(&mut self, action: GripperAction) -> Result<()> {
        let program = match action {
            GripperAction::Open => self.gripper.open_program(),
            GripperAction::Close => self.gripper.close_program(),
        };
        self.commands.send(&program).await?;
        self.gripper_state = GripperState::after(action);
        Ok(())
    }

    /// Stop the reader and release the telemetry link
    pub async fn shutdown(self) -> Result<()> {
        self.cache.shutdown().await
    }
}
