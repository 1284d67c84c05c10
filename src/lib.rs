//! urteach - teach-by-demonstration client for Universal Robots
//!
//! Streams robot state over RTDE, records TCP poses and gripper actions
//! while the operator moves the arm in freedrive, and replays the recorded
//! routine as a single URScript program on the secondary interface.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use urteach::{Config, TeachSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_from_path("config/default_config.yaml")?;
//!     let mut session = TeachSession::from_config(config)?;
//!
//!     session.connect_telemetry().await?;
//!     session.enable_freedrive().await?;
//!     // ... operator moves the arm ...
//!     session.record_pose().await?;
//!     session.record_gripper_action();
//!
//!     for line in session.transcript_lines() {
//!         println!("{}", line);
//!     }
//!     session.compile_and_execute().await?;
//!     session.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **TeachSession**: owned session object exposing every operator action
//! - **StateCache**: background RTDE reader publishing the latest frame
//! - **TelemetrySession**: negotiated RTDE stream, one frame per cycle
//! - **CommandChannel**: fire-and-forget URScript sender
//! - **InstructionSequence**: recorded poses and gripper steps
//! - **ScriptCompiler**: sequence to URScript routine
//! - **GripperScript** / **GripperDriver**: Robotiq request/ack/poll protocol,
//!   as embedded script and as a host-side state machine

pub mod command;
pub mod compiler;
pub mod config;
pub mod error;
pub mod gripper;
pub mod recipe;
pub mod rtde;
pub mod sequence;
pub mod session;
pub mod state;
pub mod urscript;

pub use command::CommandChannel;
pub use compiler::ScriptCompiler;
pub use config::{Config, GripperConfig, MotionConfig, RobotConfig, TelemetryConfig};
pub use error::{Error, Result};
pub use gripper::{Classification, GripperDriver, GripperPhase, GripperPort, RobotiqSocket};
pub use recipe::{Recipe, RecipeFile, RecipeSource};
pub use rtde::{LinkSettings, RTDEClient, TelemetrySession};
pub use sequence::{GripperAction, GripperState, Instruction, InstructionSequence, Pose};
pub use session::{SessionStatus, TeachSession};
pub use state::{ConnectionState, FrameSource, Freedrive, LinkStatus, StateCache, StateFrame, StateSnapshot};
pub use urscript::GripperScript;
