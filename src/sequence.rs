//! Recorded routine: poses and gripper actions in the order they were taught

use serde::Serialize;
use std::fmt;

/// TCP pose [x, y, z, rx, ry, rz] in meters and radians
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Pose([f64; 6]);

impl Pose {
    pub fn new(values: [f64; 6]) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f64; 6] {
        &self.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl From<[f64; 6]> for Pose {
    fn from(values: [f64; 6]) -> Self {
        Self(values)
    }
}

/// Round to `1 / scale`, ties to even; never yields `-0.0`
fn round_to(value: f64, scale: f64) -> f64 {
    (value * scale).round_ties_even() / scale + 0.0
}

/// Position in millimetres (0.1 mm), rotation in radians (0.001 rad)
impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y, z, rx, ry, rz] = self.0;
        write!(
            f,
            "[{:?}, {:?}, {:?}, {:?}, {:?}, {:?}]",
            round_to(x * 1000.0, 10.0),
            round_to(y * 1000.0, 10.0),
            round_to(z * 1000.0, 10.0),
            round_to(rx, 1000.0),
            round_to(ry, 1000.0),
            round_to(rz, 1000.0),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GripperAction {
    Open,
    Close,
}

impl GripperAction {
    pub fn verb(self) -> &'static str {
        match self {
            GripperAction::Open => "Open",
            GripperAction::Close => "Close",
        }
    }
}

/// Last commanded gripper state, as the operator sees it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GripperState {
    #[default]
    Open,
    Closed,
}

impl GripperState {
    pub fn label(self) -> &'static str {
        match self {
            GripperState::Open => "Open",
            GripperState::Closed => "Closed",
        }
    }

    /// Action a recorded gripper step implies while in this state
    pub fn implied_action(self) -> GripperAction {
        match self {
            GripperState::Open => GripperAction::Open,
            GripperState::Closed => GripperAction::Close,
        }
    }

    pub fn after(action: GripperAction) -> Self {
        match action {
            GripperAction::Open => GripperState::Open,
            GripperAction::Close => GripperState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instruction {
    PoseStep { pose: Pose },
    GripperStep { action: GripperAction },
}

impl Instruction {
    /// Operator-facing line for this step
    pub fn transcript_line(&self) -> String {
        match self {
            Instruction::PoseStep { pose } => format!(". -> {}", pose),
            Instruction::GripperStep { action } => format!(". -> {} gripper", action.verb()),
        }
    }
}

/// Ordered, in-memory log of recorded steps
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstructionSequence {
    steps: Vec<Instruction>,
}

impl InstructionSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pose(&mut self, pose: Pose) -> &Instruction {
        self.push(Instruction::PoseStep { pose })
    }

    /// Record the action implied by `state` at this moment
    pub fn record_gripper_action(&mut self, state: GripperState) -> &Instruction {
        self.push(Instruction::GripperStep { action: state.implied_action() })
    }

    fn push(&mut self, step: Instruction) -> &Instruction {
        self.steps.push(step);
        &self.steps[self.steps.len() - 1]
    }

    /// Drop the final step; no-op when empty
    pub fn remove_last(&mut self) -> Option<Instruction> {
        self.steps.pop()
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Instruction] {
        &self.steps
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.steps.iter()
    }

    /// Projection of the steps for display; never read back
    pub fn transcript_lines(&self) -> Vec<String> {
        self.steps.iter().map(Instruction::transcript_line).collect()
    }
}
