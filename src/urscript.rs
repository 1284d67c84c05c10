//! URScript program builders
//!
//! Every program sent over the script channel is produced here. The gripper
//! helpers (set/ack, position wait, hybrid classify) are generated from
//! [`GripperConfig`] so the activation, open, close and routine programs
//! all carry the same protocol.

use crate::config::GripperConfig;

/// Delay after dropping GTO before writing the new target
pub const PULSE_OFF_S: f64 = 0.03;
/// Delay after writing POS before raising GTO
pub const TARGET_SETTLE_S: f64 = 0.03;
/// Delay after raising GTO before polling starts
pub const PULSE_ON_S: f64 = 0.06;
/// Extra tolerance granted to the single check made after a wait times out
pub const RELAXED_TOLERANCE_MARGIN: i32 = 2;
/// Bytes in a set_var acknowledgment ("ack")
pub const ACK_LEN: usize = 3;

/// Force/speed/target written during activation, before the working values
pub const ACTIVATION_FORCE: i32 = 128;
pub const ACTIVATION_SPEED: i32 = 200;
pub const ACTIVATION_POSITION: i32 = 5;

pub const ALIGN_ACCELERATION: f64 = 0.2;
pub const ALIGN_VELOCITY: f64 = 0.05;
/// Freedrive stays on for an hour unless ended earlier
pub const FREEDRIVE_HOLD_S: f64 = 3600.0;
pub const STOP_DECELERATION: f64 = 1.0;

/// Format a float so URScript always sees a real literal
pub fn fmt_f64(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// Line buffer with URScript block indentation
#[derive(Debug, Default)]
pub struct ScriptWriter {
    lines: Vec<String>,
    depth: usize,
}

impl ScriptWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&mut self, text: impl AsRef<str>) -> &mut Self {
        self.lines.push(format!("{}{}", "    ".repeat(self.depth), text.as_ref()));
        self
    }

    /// Open a block (`def`, `if`, `while`); the header line is written at the current depth
    pub fn open(&mut self, header: impl AsRef<str>) -> &mut Self {
        self.line(header);
        self.depth += 1;
        self
    }

    /// Close the innermost block with `end`
    pub fn close(&mut self) -> &mut Self {
        self.depth = self.depth.saturating_sub(1);
        self.line("end")
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn finish(self) -> String {
        self.lines.join("\n")
    }
}

/// Wrap `body` as `def name(): ... end` followed by its invocation
pub fn program(name: &str, body: impl FnOnce(&mut ScriptWriter)) -> String {
    let mut script = ScriptWriter::new();
    script.open(format!("def {}():", name));
    body(&mut script);
    script.close();
    script.line(format!("{}()", name));
    script.finish()
}

pub fn enable_freedrive() -> String {
    program("freedrive", |s| {
        s.line("freedrive_mode()");
        s.line(format!("sleep({})", fmt_f64(FREEDRIVE_HOLD_S)));
    })
}

pub fn end_freedrive() -> String {
    program("end_free", |s| {
        s.line("end_freedrive_mode()");
    })
}

/// Keep the tool position and yaw, zero roll and pitch
pub fn align_tool_z() -> String {
    program("align_z", |s| {
        s.line("end_freedrive_mode()");
        s.line("pose = get_actual_tcp_pose()");
        s.line("new_pose = p[pose[0], pose[1], pose[2], 0, 0, pose[5]]");
        s.line(format!(
            "movel(new_pose, a={}, v={})",
            fmt_f64(ALIGN_ACCELERATION),
            fmt_f64(ALIGN_VELOCITY)
        ));
    })
}

pub fn stop() -> String {
    format!("stopl({})", fmt_f64(STOP_DECELERATION))
}

/// Generator for the gripper side of every program
#[derive(Debug, Clone)]
pub struct GripperScript {
    config: GripperConfig,
}

impl GripperScript {
    pub fn new(config: GripperConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GripperConfig {
        &self.config
    }

    fn socket_literal(&self) -> String {
        format!("\"{}\"", self.config.socket_name)
    }

    fn open_socket(&self, s: &mut ScriptWriter) {
        s.line(format!("SOCK = {}", self.socket_literal()));
        s.line(format!(
            "socket_open(\"{}\", {}, SOCK)",
            self.config.host, self.config.port
        ));
    }

    /// `rq_set_var`: every write is followed by consuming its ack
    fn define_set_var(&self, s: &mut ScriptWriter) {
        s.open("def rq_set_var(var, value, socket=SOCK):");
        s.line("socket_set_var(var, value, socket)");
        s.line(format!("socket_read_byte_list({}, socket)", ACK_LEN));
        s.close();
    }

    fn clamp_into(&self, s: &mut ScriptWriter, var: &str, source: &str) {
        s.line(format!("{} = {}", var, source));
        s.open(format!("if {} < {}:", var, self.config.min_position));
        s.line(format!("{} = {}", var, self.config.min_position));
        s.close();
        s.open(format!("if {} > {}:", var, self.config.max_position));
        s.line(format!("{} = {}", var, self.config.max_position));
        s.close();
    }

    fn abs_distance(s: &mut ScriptWriter, var: &str, pos: &str, goal: &str) {
        s.line(format!("{} = {} - {}", var, pos, goal));
        s.open(format!("if {} < 0:", var));
        s.line(format!("{} = -{}", var, var));
        s.close();
    }

    fn define_wait_pos_reached(&self, s: &mut ScriptWriter) {
        let c = &self.config;
        s.open(format!(
            "def rq_wait_pos_reached(goal, tol={}, max_s={}, poll={}, socket=SOCK):",
            c.tolerance,
            fmt_f64(c.timeout_s),
            fmt_f64(c.poll_s)
        ));
        self.clamp_into(s, "g", "goal");
        s.line("t = 0.0");
        s.open("while t < max_s:");
        s.line("flt = socket_get_var(\"FLT\", socket)");
        s.open("if flt != 0:");
        s.line("return False");
        s.close();
        s.line("pos = socket_get_var(\"POS\", socket)");
        Self::abs_distance(s, "d", "pos", "g");
        s.open("if d <= tol:");
        s.line("return True");
        s.close();
        s.line("sleep(poll)");
        s.line("t = t + poll");
        s.close();
        s.open("if socket_get_var(\"FLT\", socket) == 0:");
        s.line("pos2 = socket_get_var(\"POS\", socket)");
        Self::abs_distance(s, "d2", "pos2", "g");
        s.line(format!("return (d2 <= tol + {})", RELAXED_TOLERANCE_MARGIN));
        s.close();
        s.line("return False");
        s.close();
    }

    fn define_move_to_pos_and_wait(&self, s: &mut ScriptWriter) {
        let c = &self.config;
        s.open(format!(
            "def rq_move_to_pos_and_wait(target, tol={}, max_s={}, socket=SOCK):",
            c.tolerance,
            fmt_f64(c.timeout_s)
        ));
        self.clamp_into(s, "p", "target");
        s.line("rq_set_var(\"GTO\", 0, socket)");
        s.line(format!("sleep({})", fmt_f64(PULSE_OFF_S)));
        s.line("rq_set_var(\"POS\", p, socket)");
        s.line(format!("sleep({})", fmt_f64(TARGET_SETTLE_S)));
        s.line("rq_set_var(\"GTO\", 1, socket)");
        s.line(format!("sleep({})", fmt_f64(PULSE_ON_S)));
        s.line(format!(
            "return rq_wait_pos_reached(p, tol, max_s, {}, socket)",
            fmt_f64(c.poll_s)
        ));
        s.close();
    }

    /// Returns -1 fault, 0 not reached, 1/2 object type, 3 reached without object
    fn define_move_and_classify(&self, s: &mut ScriptWriter) {
        let c = &self.config;
        s.open(format!(
            "def rq_move_and_classify(target, tol={}, max_s={}, socket=SOCK):",
            c.tolerance,
            fmt_f64(c.timeout_s)
        ));
        s.line("okpos = rq_move_to_pos_and_wait(target, tol, max_s, socket)");
        s.line("flt = socket_get_var(\"FLT\", socket)");
        s.open("if flt != 0:");
        s.line("return -1");
        s.close();
        s.open("if not okpos:");
        s.line("return 0");
        s.close();
        s.line("obj = socket_get_var(\"OBJ\", socket)");
        s.open("if obj == 1:");
        s.line("return 1");
        s.close();
        s.open("if obj == 2:");
        s.line("return 2");
        s.close();
        s.line("return 3");
        s.close();
    }

    fn define_shortcuts(&self, s: &mut ScriptWriter, close_timeout_s: f64) {
        let c = &self.config;
        s.open(format!(
            "def rq_open_and_classify(max_s={}, tol={}, socket=SOCK):",
            fmt_f64(c.timeout_s),
            c.tolerance
        ));
        s.line(format!("return rq_move_and_classify({}, tol, max_s, socket)", c.open_position));
        s.close();
        s.open(format!(
            "def rq_close_and_classify(max_s={}, tol={}, socket=SOCK):",
            fmt_f64(close_timeout_s),
            c.tolerance
        ));
        s.line(format!("return rq_move_and_classify({}, tol, max_s, socket)", c.close_position));
        s.close();
    }

    /// Socket, helpers and working force/speed, written inside an open `def`
    pub fn write_helpers(&self, s: &mut ScriptWriter, close_timeout_s: f64) {
        self.open_socket(s);
        self.define_set_var(s);
        s.line(format!("rq_set_var(\"FOR\", {}, SOCK)", self.config.force));
        s.line(format!("rq_set_var(\"SPE\", {}, SOCK)", self.config.speed));
        s.line("rq_set_var(\"GTO\", 1, SOCK)");
        self.define_wait_pos_reached(s);
        self.define_move_to_pos_and_wait(s);
        self.define_move_and_classify(s);
        self.define_shortcuts(s, close_timeout_s);
    }

    /// Reset and activation, in the order the device honours it
    pub fn activation_program(&self) -> String {
        let c = &self.config;
        program("activate_gripper", |s| {
            self.open_socket(s);
            s.line("sleep(0.2)");
            self.define_set_var(s);
            s.line("rq_set_var(\"ACT\", 0, SOCK)");
            s.line("rq_set_var(\"GTO\", 0, SOCK)");
            s.line("sleep(0.1)");
            s.line("rq_set_var(\"ACT\", 1, SOCK)");
            s.line("sleep(0.5)");
            s.line(format!("rq_set_var(\"FOR\", {}, SOCK)", ACTIVATION_FORCE));
            s.line(format!("rq_set_var(\"SPE\", {}, SOCK)", ACTIVATION_SPEED));
            s.line("rq_set_var(\"GTO\", 1, SOCK)");
            s.line(format!("rq_set_var(\"FOR\", {}, SOCK)", c.force));
            s.line(format!("rq_set_var(\"SPE\", {}, SOCK)", c.speed));
            s.line("rq_set_var(\"GTO\", 1, SOCK)");
            s.line(format!("rq_set_var(\"POS\", {}, SOCK)", ACTIVATION_POSITION));
            s.line(format!("sleep({})", fmt_f64(TARGET_SETTLE_S)));
            s.line("rq_set_var(\"GTO\", 1, SOCK)");
            s.line(format!("sleep({})", fmt_f64(PULSE_ON_S)));
        })
    }

    pub fn open_program(&self) -> String {
        program("open_gripper", |s| {
            self.write_helpers(s, self.config.timeout_s);
            s.line("rq_open_and_classify()");
        })
    }

    pub fn close_program(&self) -> String {
        program("close_gripper", |s| {
            self.write_helpers(s, self.config.timeout_s);
            s.line("rq_close_and_classify()");
        })
    }

    /// Opening of a routine program: `def name():` plus helpers, left open
    pub fn routine_preamble(&self, name: &str) -> ScriptWriter {
        let mut script = ScriptWriter::new();
        script.open(format!("def {}():", name));
        self.write_helpers(&mut script, self.config.routine_close_timeout());
        script
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> GripperScript {
        GripperScript::new(GripperConfig::default())
    }

    fn block_balance(text: &str) -> i32 {
        text.lines()
            .map(str::trim)
            .map(|l| {
                if l.starts_with("def ") || l.starts_with("if ") || l.starts_with("while ") {
                    1
                } else if l == "end" {
                    -1
                } else {
                    0
                }
            })
            .sum()
    }

    #[test]
    fn test_fmt_f64_always_has_decimal_point() {
        assert_eq!(fmt_f64(12.0), "12.0");
        assert_eq!(fmt_f64(0.0), "0.0");
        assert_eq!(fmt_f64(0.05), "0.05");
        assert_eq!(fmt_f64(-1.57), "-1.57");
    }

    #[test]
    fn test_writer_indents_blocks() {
        let text = program("demo", |s| {
            s.open("if x < 1:");
            s.line("x = 1");
            s.close();
        });
        assert_eq!(text, "def demo():\n    if x < 1:\n        x = 1\n    end\nend\ndemo()");
    }

    #[test]
    fn test_programs_are_balanced() {
        let gripper = script();
        for text in [
            gripper.activation_program(),
            gripper.open_program(),
            gripper.close_program(),
            enable_freedrive(),
            end_freedrive(),
            align_tool_z(),
        ] {
            assert_eq!(block_balance(&text), 0, "unbalanced:\n{}", text);
        }
    }

    #[test]
    fn test_every_set_var_consumes_ack() {
        let text = script().open_program();
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        let set_at = lines.iter().position(|l| l.starts_with("socket_set_var(")).unwrap();
        assert_eq!(lines[set_at + 1], "socket_read_byte_list(3, socket)");
        // Raw socket_set_var appears only inside the helper
        assert_eq!(text.matches("socket_set_var(").count(), 1);
    }

    #[test]
    fn test_activation_order() {
        let text = script().activation_program();
        let order: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("rq_set_var(\""))
            .collect();
        assert_eq!(
            order,
            vec![
                "rq_set_var(\"ACT\", 0, SOCK)",
                "rq_set_var(\"GTO\", 0, SOCK)",
                "rq_set_var(\"ACT\", 1, SOCK)",
                "rq_set_var(\"FOR\", 128, SOCK)",
                "rq_set_var(\"SPE\", 200, SOCK)",
                "rq_set_var(\"GTO\", 1, SOCK)",
                "rq_set_var(\"FOR\", 200, SOCK)",
                "rq_set_var(\"SPE\", 150, SOCK)",
                "rq_set_var(\"GTO\", 1, SOCK)",
                "rq_set_var(\"POS\", 5, SOCK)",
                "rq_set_var(\"GTO\", 1, SOCK)",
            ]
        );
        assert!(text.contains("socket_open(\"127.0.0.1\", 63352, SOCK)"));
        assert!(text.ends_with("end\nactivate_gripper()"));
    }

    #[test]
    fn test_move_pulse_and_clamp() {
        let text = script().close_program();
        let pulse = "rq_set_var(\"GTO\", 0, socket)\n        sleep(0.03)\n        rq_set_var(\"POS\", p, socket)\n        sleep(0.03)\n        rq_set_var(\"GTO\", 1, socket)\n        sleep(0.06)";
        assert!(text.contains(pulse), "{}", text);
        assert!(text.contains("if p < 10:"));
        assert!(text.contains("if p > 245:"));
        assert!(text.contains("return (d2 <= tol + 2)"));
        assert!(text.contains("def rq_wait_pos_reached(goal, tol=5, max_s=12.0, poll=0.02, socket=SOCK):"));
        assert!(text.contains("return rq_move_and_classify(245, tol, max_s, socket)"));
        assert!(text.trim_end().ends_with("rq_close_and_classify()\nend\nclose_gripper()"));
    }

    #[test]
    fn test_routine_preamble_uses_routine_close_timeout() {
        let mut preamble = script().routine_preamble("taught_routine");
        assert_eq!(preamble.depth(), 1);
        preamble.close();
        let text = preamble.finish();
        assert!(text.starts_with("def taught_routine():"));
        assert!(text.contains("def rq_close_and_classify(max_s=0.5, tol=5, socket=SOCK):"));
        assert!(text.contains("def rq_open_and_classify(max_s=12.0, tol=5, socket=SOCK):"));
    }

    #[test]
    fn test_direct_commands() {
        assert_eq!(stop(), "stopl(1.0)");
        assert!(enable_freedrive().contains("freedrive_mode()\n    sleep(3600.0)"));
        assert!(end_freedrive().contains("end_freedrive_mode()"));
        assert!(align_tool_z().contains("movel(new_pose, a=0.2, v=0.05)"));
    }
}
