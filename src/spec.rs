/// Specification objects and their document form
///
/// These are plain value containers describing environment policy,
/// per-descriptor handlers, and a whole process program. Each round-trips
/// to a generic self-describing value tree (`serde_json::Value`).
use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::path::PathBuf;

use serde_json::{json, Map, Value};

use crate::env::Environment;
use crate::fd_handler::{FdHandler, OpenMode};
use crate::types::{Result, RunError};

/// Document type tag for a process program.
pub const PROGRAM_TYPE_NAME: &str = "ProcessProgram";

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| RunError::Type(format!("{} must be an object", what)))
}

fn as_string(value: &Value, what: &str) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RunError::Type(format!("{} must be a string", what)))
}

fn as_string_array(value: &Value, what: &str) -> Result<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| RunError::Type(format!("{} must be an array", what)))?;
    items.iter().map(|item| as_string(item, what)).collect()
}

fn require<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a Value> {
    obj.get(key).ok_or_else(|| RunError::Name(key.to_string()))
}

/// Policy describing how the child's environment derives from the parent's.
///
/// Materialization order is fixed: keep, then unset, then set. The editing
/// operations preserve disjointness of the three name sets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvSpec {
    pub keep_all: bool,
    pub keep: Vec<String>,
    pub unset: Vec<String>,
    pub set: BTreeMap<String, String>,
}

impl Default for EnvSpec {
    fn default() -> Self {
        EnvSpec {
            keep_all: true,
            keep: Vec::new(),
            unset: Vec::new(),
            set: BTreeMap::new(),
        }
    }
}

impl EnvSpec {
    /// Inherit nothing by default; `set`/`unset` are deliberately left as
    /// they are.
    pub fn clear_keep(&mut self) {
        self.keep_all = false;
        self.keep.clear();
    }

    pub fn keep_name(&mut self, name: &str) {
        self.unset.retain(|n| n != name);
        self.set.remove(name);
        if !self.keep.iter().any(|n| n == name) {
            self.keep.push(name.to_string());
        }
    }

    pub fn unset_name(&mut self, name: &str) {
        self.keep.retain(|n| n != name);
        self.set.remove(name);
        if !self.unset.iter().any(|n| n == name) {
            self.unset.push(name.to_string());
        }
    }

    pub fn assign(&mut self, name: &str, value: &str) {
        self.keep.retain(|n| n != name);
        self.unset.retain(|n| n != name);
        self.set.insert(name.to_string(), value.to_string());
    }

    /// Apply the keep → unset → set pipeline against `parent`.
    pub fn materialize(&self, parent: &Environment) -> Environment {
        let mut env = if self.keep_all {
            parent.clone()
        } else {
            let mut env = Environment::new();
            for name in &self.keep {
                if let Some(value) = parent.get(name) {
                    env.insert(name, value);
                }
            }
            env
        };
        for name in &self.unset {
            env.remove(name);
        }
        for (name, value) in &self.set {
            env.insert(name, value);
        }
        env
    }

    /// Materialize against the calling process's environment.
    pub fn build(&self) -> Environment {
        self.materialize(&Environment::from_parent())
    }

    pub fn to_value(&self) -> Value {
        let keep = if self.keep_all {
            json!(true)
        } else if self.keep.is_empty() {
            json!(false)
        } else {
            json!(self.keep)
        };
        json!({
            "keep": keep,
            "unset": self.unset,
            "set": self.set,
        })
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = as_object(value, "env")?;
        let mut spec = EnvSpec::default();
        if let Some(keep) = obj.get("keep") {
            match keep {
                Value::Bool(all) => spec.keep_all = *all,
                Value::Array(_) => {
                    spec.keep_all = false;
                    spec.keep = as_string_array(keep, "env.keep")?;
                }
                _ => {
                    return Err(RunError::Type(
                        "env.keep must be a bool or an array of names".to_string(),
                    ))
                }
            }
        }
        if let Some(unset) = obj.get("unset") {
            spec.unset = as_string_array(unset, "env.unset")?;
        }
        if let Some(set) = obj.get("set") {
            for (name, value) in as_object(set, "env.set")? {
                spec.set
                    .insert(name.clone(), as_string(value, "env.set value")?);
            }
        }
        Ok(spec)
    }
}

/// Tagged descriptor-handler specification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FdHandlerSpec {
    Leave,
    Close,
    Null,
    Capture,
    Dup { from_fd: RawFd },
    File { path: PathBuf, mode: OpenMode },
}

impl Default for FdHandlerSpec {
    fn default() -> Self {
        FdHandlerSpec::Leave
    }
}

impl FdHandlerSpec {
    pub fn kind_name(&self) -> &'static str {
        match self {
            FdHandlerSpec::Leave => "leave",
            FdHandlerSpec::Close => "close",
            FdHandlerSpec::Null => "null",
            FdHandlerSpec::Capture => "capture",
            FdHandlerSpec::Dup { .. } => "dup",
            FdHandlerSpec::File { .. } => "file",
        }
    }

    /// Build the runtime handler bound to `fd`.
    pub fn build(&self, fd: RawFd) -> Result<FdHandler> {
        match self {
            FdHandlerSpec::Leave => Ok(FdHandler::leave(fd)),
            FdHandlerSpec::Close => Ok(FdHandler::close_target(fd)),
            FdHandlerSpec::Null => Ok(FdHandler::null(fd)),
            FdHandlerSpec::Capture => FdHandler::capture(fd),
            FdHandlerSpec::Dup { from_fd } => Ok(FdHandler::dup(fd, *from_fd)),
            FdHandlerSpec::File { path, mode } => FdHandler::file(fd, path, *mode),
        }
    }

    /// Parse the command-line grammar: `leave`, `null`, `close`, `capture`,
    /// `stdout`, `stderr`, or `dup<N>`.
    pub fn parse(spec: &str) -> Result<Self> {
        match spec {
            "leave" => Ok(FdHandlerSpec::Leave),
            "close" => Ok(FdHandlerSpec::Close),
            "null" => Ok(FdHandlerSpec::Null),
            "capture" => Ok(FdHandlerSpec::Capture),
            "stdout" => Ok(FdHandlerSpec::Dup { from_fd: 1 }),
            "stderr" => Ok(FdHandlerSpec::Dup { from_fd: 2 }),
            _ => {
                if let Some(digits) = spec.strip_prefix("dup") {
                    let from_fd = digits.parse::<RawFd>().map_err(|_| {
                        RunError::Usage(format!("invalid fd handler spec {:?}", spec))
                    })?;
                    Ok(FdHandlerSpec::Dup { from_fd })
                } else {
                    Err(RunError::Usage(format!(
                        "invalid fd handler spec {:?}",
                        spec
                    )))
                }
            }
        }
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".to_string(), json!(self.kind_name()));
        match self {
            FdHandlerSpec::Dup { from_fd } => {
                obj.insert("from_fd".to_string(), json!(from_fd));
            }
            FdHandlerSpec::File { path, mode } => {
                obj.insert("filename".to_string(), json!(path.to_string_lossy()));
                obj.insert("mode".to_string(), json!(mode.as_str()));
            }
            _ => {}
        }
        Value::Object(obj)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        // A bare string names one of the no-argument kinds.
        let kind = match value {
            Value::String(kind) => kind.clone(),
            _ => as_string(require(as_object(value, "fd handler")?, "type")?, "type")?,
        };
        match kind.as_str() {
            "leave" => Ok(FdHandlerSpec::Leave),
            "close" => Ok(FdHandlerSpec::Close),
            "null" => Ok(FdHandlerSpec::Null),
            "capture" => Ok(FdHandlerSpec::Capture),
            "dup" => {
                let obj = as_object(value, "dup handler")?;
                let from_fd = require(obj, "from_fd")?
                    .as_i64()
                    .ok_or_else(|| RunError::Type("from_fd must be an integer".to_string()))?;
                let from_fd = RawFd::try_from(from_fd)
                    .map_err(|_| RunError::Value(format!("from_fd out of range: {}", from_fd)))?;
                Ok(FdHandlerSpec::Dup { from_fd })
            }
            "file" => {
                let obj = as_object(value, "file handler")?;
                let path = PathBuf::from(as_string(require(obj, "filename")?, "filename")?);
                let mode = match obj.get("mode") {
                    Some(mode) => OpenMode::parse(&as_string(mode, "mode")?)?,
                    None => OpenMode::read_write_create(),
                };
                Ok(FdHandlerSpec::File { path, mode })
            }
            other => Err(RunError::Type(format!("unknown fd handler type {:?}", other))),
        }
    }
}

/// Full description of a process to launch: executable, argv, environment
/// policy, and the three standard-descriptor handlers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: EnvSpec,
    pub stdin: FdHandlerSpec,
    pub stdout: FdHandlerSpec,
    pub stderr: FdHandlerSpec,
}

impl Default for ProgramSpec {
    fn default() -> Self {
        ProgramSpec {
            executable: PathBuf::from("/bin/true"),
            args: Vec::new(),
            env: EnvSpec::default(),
            stdin: FdHandlerSpec::default(),
            stdout: FdHandlerSpec::default(),
            stderr: FdHandlerSpec::default(),
        }
    }
}

impl ProgramSpec {
    pub fn to_value(&self) -> Value {
        json!({
            "type": PROGRAM_TYPE_NAME,
            "executable": self.executable.to_string_lossy(),
            "args": self.args,
            "env": self.env.to_value(),
            "stdin": self.stdin.to_value(),
            "stdout": self.stdout.to_value(),
            "stderr": self.stderr.to_value(),
        })
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = as_object(value, "program")?;
        let doc_type = as_string(require(obj, "type")?, "type")?;
        if doc_type != PROGRAM_TYPE_NAME {
            return Err(RunError::Type(format!(
                "unknown program type {:?}",
                doc_type
            )));
        }
        let mut spec = ProgramSpec {
            executable: PathBuf::from(as_string(require(obj, "executable")?, "executable")?),
            args: as_string_array(require(obj, "args")?, "args")?,
            ..Default::default()
        };
        if let Some(env) = obj.get("env") {
            spec.env = EnvSpec::from_value(env)?;
        }
        if let Some(stdin) = obj.get("stdin") {
            spec.stdin = FdHandlerSpec::from_value(stdin)?;
        }
        if let Some(stdout) = obj.get("stdout") {
            spec.stdout = FdHandlerSpec::from_value(stdout)?;
        }
        if let Some(stderr) = obj.get("stderr") {
            spec.stderr = FdHandlerSpec::from_value(stderr)?;
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent() -> Environment {
        [("A", "1"), ("B", "2"), ("C", "3")]
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_materialize_pipeline() {
        let mut spec = EnvSpec {
            keep_all: false,
            ..Default::default()
        };
        spec.keep_name("A");
        spec.keep_name("B");
        spec.unset_name("B");
        spec.assign("D", "4");
        spec.assign("A", "z");

        let env = spec.materialize(&parent());
        let entries: Vec<(String, String)> = env
            .iter()
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
        assert_eq!(
            entries,
            vec![
                ("A".to_string(), "z".to_string()),
                ("D".to_string(), "4".to_string()),
            ]
        );
    }

    #[test]
    fn test_materialize_keep_all() {
        let mut spec = EnvSpec::default();
        spec.unset_name("C");
        let env = spec.materialize(&parent());
        assert_eq!(env.get("A"), Some("1"));
        assert_eq!(env.get("B"), Some("2"));
        assert_eq!(env.get("C"), None);
    }

    #[test]
    fn test_edit_ops_keep_names_disjoint() {
        let mut spec = EnvSpec::default();
        spec.assign("X", "1");
        spec.unset_name("X");
        assert!(!spec.set.contains_key("X"));
        assert_eq!(spec.unset, vec!["X"]);
        spec.keep_name("X");
        assert!(spec.unset.is_empty());
        assert_eq!(spec.keep, vec!["X"]);
    }

    #[test]
    fn test_clear_keep_leaves_set_and_unset() {
        let mut spec = EnvSpec::default();
        spec.keep_name("A");
        spec.unset_name("B");
        spec.assign("C", "3");
        spec.clear_keep();
        assert!(!spec.keep_all);
        assert!(spec.keep.is_empty());
        assert_eq!(spec.unset, vec!["B"]);
        assert_eq!(spec.set.get("C").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_env_spec_round_trip() {
        let specs = [
            EnvSpec::default(),
            EnvSpec {
                keep_all: false,
                ..Default::default()
            },
            EnvSpec {
                keep_all: false,
                keep: vec!["PATH".to_string(), "HOME".to_string()],
                unset: vec!["TERM".to_string()],
                set: [("LANG".to_string(), "C".to_string())].into_iter().collect(),
            },
        ];
        for spec in specs {
            assert_eq!(EnvSpec::from_value(&spec.to_value()).unwrap(), spec);
        }
    }

    #[test]
    fn test_fd_handler_spec_round_trip() {
        let specs = [
            FdHandlerSpec::Leave,
            FdHandlerSpec::Close,
            FdHandlerSpec::Null,
            FdHandlerSpec::Capture,
            FdHandlerSpec::Dup { from_fd: 2 },
            FdHandlerSpec::File {
                path: PathBuf::from("/tmp/out.log"),
                mode: OpenMode::parse("wct").unwrap(),
            },
        ];
        for spec in specs {
            assert_eq!(FdHandlerSpec::from_value(&spec.to_value()).unwrap(), spec);
        }
    }

    #[test]
    fn test_fd_handler_spec_from_bare_string() {
        let value = json!("capture");
        assert_eq!(
            FdHandlerSpec::from_value(&value).unwrap(),
            FdHandlerSpec::Capture
        );
        assert!(FdHandlerSpec::from_value(&json!("bogus")).is_err());
    }

    #[test]
    fn test_cli_grammar() {
        assert_eq!(FdHandlerSpec::parse("null").unwrap(), FdHandlerSpec::Null);
        assert_eq!(
            FdHandlerSpec::parse("stdout").unwrap(),
            FdHandlerSpec::Dup { from_fd: 1 }
        );
        assert_eq!(
            FdHandlerSpec::parse("stderr").unwrap(),
            FdHandlerSpec::Dup { from_fd: 2 }
        );
        assert_eq!(
            FdHandlerSpec::parse("dup7").unwrap(),
            FdHandlerSpec::Dup { from_fd: 7 }
        );
        assert!(matches!(
            FdHandlerSpec::parse("dup"),
            Err(RunError::Usage(_))
        ));
        assert!(matches!(
            FdHandlerSpec::parse("pipe"),
            Err(RunError::Usage(_))
        ));
    }

    #[test]
    fn test_program_spec_round_trip() {
        let spec = ProgramSpec {
            executable: PathBuf::from("/bin/echo"),
            args: vec!["hello".to_string(), "world".to_string()],
            env: EnvSpec {
                keep_all: false,
                keep: vec!["PATH".to_string()],
                unset: vec![],
                set: [("GREETING".to_string(), "hi".to_string())]
                    .into_iter()
                    .collect(),
            },
            stdin: FdHandlerSpec::Null,
            stdout: FdHandlerSpec::Capture,
            stderr: FdHandlerSpec::Dup { from_fd: 1 },
        };
        let round = ProgramSpec::from_value(&spec.to_value()).unwrap();
        assert_eq!(round, spec);
    }

    #[test]
    fn test_program_spec_defaults_on_load() {
        let value = json!({
            "type": "ProcessProgram",
            "executable": "/bin/true",
            "args": [],
        });
        let spec = ProgramSpec::from_value(&value).unwrap();
        assert_eq!(spec.env, EnvSpec::default());
        assert_eq!(spec.stdin, FdHandlerSpec::Leave);
        assert_eq!(spec.stdout, FdHandlerSpec::Leave);
        assert_eq!(spec.stderr, FdHandlerSpec::Leave);
    }

    #[test]
    fn test_program_spec_unknown_type() {
        let value = json!({"type": "ShellProgram", "executable": "/bin/sh", "args": []});
        assert!(matches!(
            ProgramSpec::from_value(&value),
            Err(RunError::Type(_))
        ));
    }

    #[test]
    fn test_program_spec_missing_type() {
        let value = json!({"executable": "/bin/sh", "args": []});
        assert!(matches!(
            ProgramSpec::from_value(&value),
            Err(RunError::Name(_))
        ));
    }
}
