//! The portable instruction tree shipped from the coordinator to an agent.
//!
//! A build compiles into one [`Instruction`] tree; the agent-side
//! [`crate::session::BuildSession`] walks it. Nodes are immutable once built:
//! the builder methods here are compiler-side helpers, never interpreter
//! behavior.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of operations a node can perform.
///
/// The wire tag is the `name` field of the serialized node; an unknown tag is
/// a deserialize-time error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Opcode {
    Exec,
    Echo,
    Export,
    Test,
    Compose,
    Mkdirs,
    Cleandir,
    UploadArtifact,
    DownloadFile,
    DownloadDir,
    GenerateProperty,
    GenerateTestReport,
    Secret,
    Fail,
    ReportCurrentStatus,
    ReportCompleting,
    ReportCompleted,
    End,
    Noop,
}

impl Opcode {
    fn wire_name(self) -> &'static str {
        match self {
            Opcode::Exec => "exec",
            Opcode::Echo => "echo",
            Opcode::Export => "export",
            Opcode::Test => "test",
            Opcode::Compose => "compose",
            Opcode::Mkdirs => "mkdirs",
            Opcode::Cleandir => "cleandir",
            Opcode::UploadArtifact => "uploadArtifact",
            Opcode::DownloadFile => "downloadFile",
            Opcode::DownloadDir => "downloadDir",
            Opcode::GenerateProperty => "generateProperty",
            Opcode::GenerateTestReport => "generateTestReport",
            Opcode::Secret => "secret",
            Opcode::Fail => "fail",
            Opcode::ReportCurrentStatus => "reportCurrentStatus",
            Opcode::ReportCompleting => "reportCompleting",
            Opcode::ReportCompleted => "reportCompleted",
            Opcode::End => "end",
            Opcode::Noop => "noop",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Gate controlling whether a node runs given the build's pass/fail state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunCondition {
    #[default]
    Passed,
    Failed,
    Any,
}

impl fmt::Display for RunCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunCondition::Passed => f.write_str("passed"),
            RunCondition::Failed => f.write_str("failed"),
            RunCondition::Any => f.write_str("any"),
        }
    }
}

/// Embedded predicate: the node runs only if executing `command` succeeds
/// (or fails) as `expectation` demands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestPredicate {
    pub command: Box<Instruction>,
    pub expectation: bool,
}

/// One node of the instruction tree.
///
/// `args` is a string-keyed string map; positional arguments (exec argv, echo
/// lines, report sources) use numeric keys `"0".."n"`. `sub_commands` is
/// always present, possibly empty. The working directory is inherited from
/// the nearest ancestor when unset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    #[serde(rename = "name")]
    pub opcode: Opcode,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default, rename = "subCommands")]
    pub sub_commands: Vec<Instruction>,
    #[serde(
        default,
        rename = "workingDirectory",
        skip_serializing_if = "Option::is_none"
    )]
    pub working_directory: Option<String>,
    #[serde(default, rename = "runIfConfig")]
    pub run_if: RunCondition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<TestPredicate>,
    #[serde(default, rename = "onCancel", skip_serializing_if = "Option::is_none")]
    pub on_cancel: Option<Box<Instruction>>,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Instruction {
            opcode,
            args: BTreeMap::new(),
            sub_commands: Vec::new(),
            working_directory: None,
            run_if: RunCondition::default(),
            test: None,
            on_cancel: None,
        }
    }

    fn with_positional_args<S: AsRef<str>>(mut self, args: &[S]) -> Self {
        for (i, arg) in args.iter().enumerate() {
            self.args.insert(i.to_string(), arg.as_ref().to_string());
        }
        self
    }

    fn with_arg(mut self, name: &str, value: &str) -> Self {
        self.args.insert(name.to_string(), value.to_string());
        self
    }

    // -- compiler-side constructors -------------------------------------

    pub fn echo<S: AsRef<str>>(lines: &[S]) -> Self {
        Instruction::new(Opcode::Echo).with_positional_args(lines)
    }

    /// `exec` with argv `[command, args...]` encoded as positional args.
    pub fn exec<S: AsRef<str>>(command: &str, args: &[S]) -> Self {
        let mut node = Instruction::new(Opcode::Exec);
        node.args.insert("0".to_string(), command.to_string());
        for (i, arg) in args.iter().enumerate() {
            node.args
                .insert((i + 1).to_string(), arg.as_ref().to_string());
        }
        node
    }

    pub fn compose(sub_commands: Vec<Instruction>) -> Self {
        let mut node = Instruction::new(Opcode::Compose);
        node.sub_commands = sub_commands;
        node
    }

    pub fn noop() -> Self {
        Instruction::new(Opcode::Noop)
    }

    pub fn fail(message: &str) -> Self {
        Instruction::new(Opcode::Fail).with_positional_args(&[message])
    }

    pub fn export(name: &str, value: &str, secure: bool) -> Self {
        Instruction::new(Opcode::Export)
            .with_arg("name", name)
            .with_arg("value", value)
            .with_arg("secure", if secure { "true" } else { "false" })
    }

    /// Display-only form: echoes the current value of `name`.
    pub fn export_name(name: &str) -> Self {
        Instruction::new(Opcode::Export).with_arg("name", name)
    }

    /// No-arg form: dumps the whole env table.
    pub fn export_dump() -> Self {
        Instruction::new(Opcode::Export)
    }

    pub fn secret(value: &str) -> Self {
        Instruction::new(Opcode::Secret).with_arg("value", value)
    }

    pub fn secret_with_substitution(value: &str, substitution: &str) -> Self {
        Instruction::new(Opcode::Secret)
            .with_arg("value", value)
            .with_arg("substitution", substitution)
    }

    pub fn test_cond(flag: &str, left: &str) -> Self {
        Instruction::new(Opcode::Test)
            .with_arg("flag", flag)
            .with_arg("left", left)
    }

    /// `-eq` flavor: compares `left` to the captured output of `sub_command`.
    pub fn test_eq(left: &str, sub_command: Instruction) -> Self {
        let mut node = Instruction::test_cond("-eq", left);
        node.sub_commands = vec![sub_command];
        node
    }

    pub fn mkdirs(path: &str) -> Self {
        Instruction::new(Opcode::Mkdirs).with_arg("path", path)
    }

    pub fn cleandir<S: AsRef<str>>(path: &str, allowed: &[S]) -> Self {
        let allowed: Vec<&str> = allowed.iter().map(AsRef::as_ref).collect();
        let mut node = Instruction::new(Opcode::Cleandir).with_arg("path", path);
        if !allowed.is_empty() {
            let encoded = serde_json::to_string(&allowed).expect("serialize allow-list");
            node = node.with_arg("allowed", &encoded);
        }
        node
    }

    pub fn upload_artifact(src: &str, dest: &str) -> Self {
        Instruction::new(Opcode::UploadArtifact)
            .with_arg("src", src)
            .with_arg("dest", dest)
    }

    pub fn generate_test_report<S: AsRef<str>>(srcs: &[S], dest: &str) -> Self {
        Instruction::new(Opcode::GenerateTestReport)
            .with_positional_args(srcs)
            .with_arg("dest", dest)
    }

    pub fn generate_property(name: &str, src: &str, xpath: &str) -> Self {
        Instruction::new(Opcode::GenerateProperty)
            .with_arg("name", name)
            .with_arg("src", src)
            .with_arg("xpath", xpath)
    }

    pub fn download_file(args: &[(&str, &str)]) -> Self {
        let mut node = Instruction::new(Opcode::DownloadFile);
        for (name, value) in args {
            node.args.insert((*name).to_string(), (*value).to_string());
        }
        node
    }

    pub fn download_dir(args: &[(&str, &str)]) -> Self {
        let mut node = Instruction::new(Opcode::DownloadDir);
        for (name, value) in args {
            node.args.insert((*name).to_string(), (*value).to_string());
        }
        node
    }

    pub fn report_current_status(status: &str) -> Self {
        Instruction::new(Opcode::ReportCurrentStatus).with_arg("status", status)
    }

    pub fn report_completing() -> Self {
        Instruction::new(Opcode::ReportCompleting)
    }

    pub fn report_completed() -> Self {
        Instruction::new(Opcode::ReportCompleted)
    }

    pub fn end() -> Self {
        Instruction::new(Opcode::End)
    }

    // -- chainable modifiers --------------------------------------------

    pub fn run_if(mut self, condition: RunCondition) -> Self {
        self.run_if = condition;
        self
    }

    /// Propagates `condition` to this node and every descendant still on the
    /// default condition.
    pub fn run_if_recursively(mut self, condition: RunCondition) -> Self {
        self.apply_run_if(condition);
        self
    }

    fn apply_run_if(&mut self, condition: RunCondition) {
        self.run_if = condition;
        for sub in &mut self.sub_commands {
            if sub.run_if == RunCondition::default() {
                sub.apply_run_if(condition);
            }
        }
    }

    pub fn with_working_directory(mut self, dir: &str) -> Self {
        self.working_directory = Some(dir.to_string());
        self
    }

    /// Propagates `dir` to this node and every descendant lacking an explicit
    /// working directory.
    pub fn with_working_directory_recursively(mut self, dir: &str) -> Self {
        self.apply_working_directory(dir);
        self
    }

    fn apply_working_directory(&mut self, dir: &str) {
        self.working_directory = Some(dir.to_string());
        for sub in &mut self.sub_commands {
            if sub.working_directory.is_none() {
                sub.apply_working_directory(dir);
            }
        }
    }

    pub fn with_test(mut self, command: Instruction, expectation: bool) -> Self {
        self.test = Some(TestPredicate {
            command: Box::new(command),
            expectation,
        });
        self
    }

    pub fn with_on_cancel(mut self, on_cancel: Instruction) -> Self {
        self.on_cancel = Some(Box::new(on_cancel));
        self
    }

    // -- accessors ------------------------------------------------------

    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(String::as_str)
    }

    /// Positional args `"0".."n"`, stopping at the first gap.
    pub fn list_args(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut i = 0usize;
        while let Some(value) = self.args.get(&i.to_string()) {
            out.push(value.as_str());
            i += 1;
        }
        out
    }

    /// Deterministic indented dump: opcode, args in key order, non-default
    /// run-condition, then children one level deeper.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(0, &mut out);
        out
    }

    fn dump_into(&self, level: usize, out: &mut String) {
        for _ in 0..level * 4 {
            out.push(' ');
        }
        out.push_str(self.opcode.wire_name());
        for (name, value) in &self.args {
            out.push_str(&format!(" \"{name}:{value}\""));
        }
        if self.run_if != RunCondition::default() {
            out.push_str(&format!(" (runIf:{})", self.run_if));
        }
        for sub in &self.sub_commands {
            out.push('\n');
            sub.dump_into(level + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_preserves_defaults() {
        let node = Instruction::compose(vec![
            Instruction::echo(&["hello"]),
            Instruction::exec("ls", &["-l"]).run_if(RunCondition::Any),
        ]);
        let json = serde_json::to_string(&node).expect("serialize");
        let parsed: Instruction = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, node);
    }

    #[test]
    fn wire_shape_uses_protocol_field_names() {
        let node = Instruction::echo(&["hi"]).with_working_directory("build");
        let json = serde_json::to_value(&node).expect("serialize");
        assert_eq!(json["name"], "echo");
        assert_eq!(json["args"]["0"], "hi");
        assert_eq!(json["subCommands"], serde_json::json!([]));
        assert_eq!(json["workingDirectory"], "build");
        assert_eq!(json["runIfConfig"], "passed");
    }

    #[test]
    fn unknown_opcode_is_a_construction_error() {
        let raw = r#"{"name": "launchMissiles", "args": {}, "subCommands": []}"#;
        assert!(serde_json::from_str::<Instruction>(raw).is_err());
    }

    #[test]
    fn unknown_run_condition_is_a_construction_error() {
        let raw = r#"{"name": "echo", "args": {}, "subCommands": [], "runIfConfig": "sometimes"}"#;
        assert!(serde_json::from_str::<Instruction>(raw).is_err());
    }

    #[test]
    fn missing_args_and_sub_commands_default_to_empty() {
        let raw = r#"{"name": "noop"}"#;
        let node: Instruction = serde_json::from_str(raw).expect("deserialize");
        assert!(node.args.is_empty());
        assert!(node.sub_commands.is_empty());
        assert_eq!(node.run_if, RunCondition::Passed);
    }

    #[test]
    fn list_args_follow_numeric_keys_in_order() {
        let node = Instruction::exec("make", &["-j4", "all"]);
        assert_eq!(node.list_args(), vec!["make", "-j4", "all"]);
    }

    #[test]
    fn working_directory_propagates_only_where_unset() {
        let node = Instruction::compose(vec![
            Instruction::echo(&["a"]),
            Instruction::echo(&["b"]).with_working_directory("pinned"),
        ])
        .with_working_directory_recursively("root");

        assert_eq!(node.working_directory.as_deref(), Some("root"));
        assert_eq!(
            node.sub_commands[0].working_directory.as_deref(),
            Some("root")
        );
        assert_eq!(
            node.sub_commands[1].working_directory.as_deref(),
            Some("pinned")
        );
    }

    #[test]
    fn run_if_propagates_only_over_default_children() {
        let node = Instruction::compose(vec![
            Instruction::echo(&["a"]),
            Instruction::echo(&["b"]).run_if(RunCondition::Failed),
        ])
        .run_if_recursively(RunCondition::Any);

        assert_eq!(node.run_if, RunCondition::Any);
        assert_eq!(node.sub_commands[0].run_if, RunCondition::Any);
        assert_eq!(node.sub_commands[1].run_if, RunCondition::Failed);
    }

    #[test]
    fn dump_is_deterministic_and_indented() {
        let node = Instruction::compose(vec![
            Instruction::echo(&["hello"]),
            Instruction::export("answer", "42", false).run_if(RunCondition::Any),
        ]);
        assert_eq!(
            node.dump(),
            "compose\n    echo \"0:hello\"\n    export \"name:answer\" \"secure:false\" \"value:42\" (runIf:any)"
        );
    }
}
