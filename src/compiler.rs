//! Compiles a recorded sequence into one URScript routine

use crate::config::MotionConfig;
use crate::sequence::{GripperAction, Instruction, InstructionSequence, Pose};
use crate::urscript::{fmt_f64, GripperScript, ScriptWriter};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ScriptCompiler {
    motion: MotionConfig,
    gripper: GripperScript,
}

impl ScriptCompiler {
    pub fn new(motion: MotionConfig, gripper: GripperScript) -> Self {
        Self { motion, gripper }
    }

    pub fn program_name(&self) -> &str {
        &self.motion.program_name
    }

    /// Build the full payload: gripper preamble, one block per step, `end`
    /// and the invocation of the routine.
    pub fn compile(&self, sequence: &InstructionSequence) -> Result<String> {
        if sequence.is_empty() {
            return Err(Error::EmptySequence);
        }
        for (index, step) in sequence.iter().enumerate() {
            if let Instruction::PoseStep { pose } = step {
                if !pose.is_finite() {
                    return Err(Error::NonFinitePose { index });
                }
            }
        }

        let mut script = self.gripper.routine_preamble(&self.motion.program_name);
        for step in sequence.iter() {
            match step {
                Instruction::PoseStep { pose } => self.emit_move(&mut script, pose),
                Instruction::GripperStep { action } => self.emit_gripper(&mut script, *action),
            }
            script.line(format!("sleep({})", fmt_f64(self.motion.settle_s)));
        }
        script.close();
        script.line(format!("{}()", self.motion.program_name));

        Ok(script.finish())
    }

    fn emit_move(&self, script: &mut ScriptWriter, pose: &Pose) {
        let coords: Vec<String> = pose.values().iter().copied().map(fmt_f64).collect();
        script.line(format!(
            "movej(p[{}], a={}, v={})",
            coords.join(", "),
            fmt_f64(self.motion.acceleration),
            fmt_f64(self.motion.velocity)
        ));
    }

    fn emit_gripper(&self, script: &mut ScriptWriter, action: GripperAction) {
        match action {
            GripperAction::Open => script.line("rq_open_and_classify()"),
            GripperAction::Close => script.line("rq_close_and_classify()"),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GripperConfig;
    use crate::sequence::GripperState;

    fn compiler() -> ScriptCompiler {
        ScriptCompiler::new(MotionConfig::default(), GripperScript::new(GripperConfig::default()))
    }

    fn p(z: f64) -> Pose {
        Pose::new([0.1, 0.2, z, 0.0, 0.0, 1.57])
    }

    fn trimmed(text: &str) -> Vec<&str> {
        text.lines().map(str::trim).collect()
    }

    fn move_count(text: &str) -> usize {
        text.lines().filter(|l| l.trim_start().starts_with("movej(")).count()
    }

    #[test]
    fn test_empty_sequence_is_rejected() {
        let err = compiler().compile(&InstructionSequence::new()).unwrap_err();
        assert!(matches!(err, Error::EmptySequence));
    }

    #[test]
    fn test_non_finite_pose_is_rejected() {
        let mut sequence = InstructionSequence::new();
        sequence.record_pose(p(0.3));
        sequence.record_pose(Pose::new([f64::NAN, 0.0, 0.0, 0.0, 0.0, 0.0]));
        let err = compiler().compile(&sequence).unwrap_err();
        assert!(matches!(err, Error::NonFinitePose { index: 1 }));
    }

    #[test]
    fn test_moves_in_recorded_order() {
        let mut sequence = InstructionSequence::new();
        for z in [0.3, 0.4, 0.5] {
            sequence.record_pose(p(z));
        }

        let text = compiler().compile(&sequence).unwrap();
        assert_eq!(move_count(&text), 3);
        let moves: Vec<&str> = trimmed(&text).into_iter().filter(|l| l.starts_with("movej(")).collect();
        assert_eq!(moves[0], "movej(p[0.1, 0.2, 0.3, 0.0, 0.0, 1.57], a=0.6, v=0.6)");
        assert_eq!(moves[1], "movej(p[0.1, 0.2, 0.4, 0.0, 0.0, 1.57], a=0.6, v=0.6)");
        assert_eq!(moves[2], "movej(p[0.1, 0.2, 0.5, 0.0, 0.0, 1.57], a=0.6, v=0.6)");

        sequence.remove_last();
        let text = compiler().compile(&sequence).unwrap();
        assert_eq!(move_count(&text), 2);
    }

    #[test]
    fn test_gripper_block_between_moves() {
        let mut sequence = InstructionSequence::new();
        sequence.record_pose(p(0.3));
        sequence.record_gripper_action(GripperState::Open);
        sequence.record_pose(p(0.5));

        let text = compiler().compile(&sequence).unwrap();
        let lines = trimmed(&text);
        let first = lines.iter().position(|l| l.starts_with("movej(")).unwrap();
        let grip = lines.iter().position(|l| *l == "rq_open_and_classify()").unwrap();
        let second = lines.iter().rposition(|l| l.starts_with("movej(")).unwrap();

        assert!(first < grip && grip < second);
        for at in [first, grip, second] {
            assert_eq!(lines[at + 1], "sleep(0.05)");
        }
        assert_eq!(grip, first + 2);
        assert_eq!(second, grip + 2);
    }

    #[test]
    fn test_example_routine_layout() {
        let mut sequence = InstructionSequence::new();
        sequence.record_pose(p(0.3));
        sequence.record_gripper_action(GripperState::Open);
        sequence.record_pose(p(0.5));

        let text = compiler().compile(&sequence).unwrap();
        assert!(text.starts_with("def taught_routine():\n"));
        assert!(text.ends_with(
            "    movej(p[0.1, 0.2, 0.5, 0.0, 0.0, 1.57], a=0.6, v=0.6)\n    sleep(0.05)\nend\ntaught_routine()"
        ));

        // Steps come after the helper definitions, at routine depth
        let helpers = text.find("def rq_close_and_classify(").unwrap();
        let first_move = text.find("    movej(p[0.1, 0.2, 0.3").unwrap();
        assert!(helpers < first_move);
        assert!(text.contains("\n    rq_open_and_classify()\n    sleep(0.05)\n"));
    }

    #[test]
    fn test_close_step_and_motion_overrides() {
        let motion = MotionConfig {
            acceleration: 1.2,
            velocity: 0.25,
            settle_s: 0.1,
            program_name: "pick".to_string(),
            ..MotionConfig::default()
        };
        let compiler = ScriptCompiler::new(motion, GripperScript::new(GripperConfig::default()));

        let mut sequence = InstructionSequence::new();
        sequence.record_gripper_action(GripperState::Closed);
        sequence.record_pose(p(0.3));

        let text = compiler.compile(&sequence).unwrap();
        assert!(text.contains("\n    rq_close_and_classify()\n    sleep(0.1)\n"));
        assert!(text.contains("movej(p[0.1, 0.2, 0.3, 0.0, 0.0, 1.57], a=1.2, v=0.25)"));
        assert!(text.ends_with("end\npick()"));
        assert_eq!(compiler.compile(&sequence).unwrap(), text);
    }
}
