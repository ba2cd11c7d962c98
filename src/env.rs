/// Child process environment model
///
/// An `Environment` is an ordered name→value mapping plus the machinery to
/// materialize it into the null-terminated string array `execve` expects.
use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::fmt;

use crate::types::{Result, RunError};

extern "C" {
    static environ: *const *const libc::c_char;
}

/// A concrete child environment: an ordered mapping from name to value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Environment {
            vars: BTreeMap::new(),
        }
    }

    /// Snapshot the calling process's environment.
    ///
    /// Entries are split at the first `=`; entries without one are logged
    /// and skipped.
    pub fn from_parent() -> Self {
        let mut env = Environment::new();
        unsafe {
            let mut ptr = environ;
            while !ptr.is_null() && !(*ptr).is_null() {
                let entry = CStr::from_ptr(*ptr).to_string_lossy().into_owned();
                match entry.split_once('=') {
                    Some((name, value)) => {
                        env.vars.insert(name.to_string(), value.to_string());
                    }
                    None => {
                        log::warn!("skipping unconventional environ entry {:?}", entry);
                    }
                }
                ptr = ptr.add(1);
            }
        }
        env
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_string(), value.to_string());
    }

    pub fn remove(&mut self, name: &str) {
        self.vars.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    /// Materialize `NAME=VALUE` C strings for `execve`.
    ///
    /// Names containing `=` or NUL bytes are rejected; values may not
    /// contain NUL bytes.
    pub fn to_exec_array(&self) -> Result<Vec<CString>> {
        let mut entries = Vec::with_capacity(self.vars.len());
        for (name, value) in &self.vars {
            if name.contains('=') {
                return Err(RunError::Value(format!(
                    "environment name contains '=': {:?}",
                    name
                )));
            }
            let entry = CString::new(format!("{}={}", name, value)).map_err(|_| {
                RunError::Value(format!("environment entry for {:?} contains NUL", name))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.vars {
            writeln!(f, "{}={}", name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Environment {
            vars: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_array_shape() {
        let mut env = Environment::new();
        env.insert("PATH", "/bin");
        env.insert("HOME", "/root");
        let arr = env.to_exec_array().unwrap();
        let entries: Vec<&str> = arr.iter().map(|c| c.to_str().unwrap()).collect();
        assert_eq!(entries, vec!["HOME=/root", "PATH=/bin"]);
    }

    #[test]
    fn test_exec_array_rejects_eq_in_name() {
        let mut env = Environment::new();
        env.insert("BAD=NAME", "x");
        assert!(matches!(env.to_exec_array(), Err(RunError::Value(_))));
    }

    #[test]
    fn test_exec_array_rejects_nul() {
        let mut env = Environment::new();
        env.insert("A", "with\0nul");
        assert!(matches!(env.to_exec_array(), Err(RunError::Value(_))));
    }

    #[test]
    fn test_from_parent_sees_known_variable() {
        std::env::set_var("RUNBOX_ENV_PROBE", "probe-value");
        let env = Environment::from_parent();
        assert_eq!(env.get("RUNBOX_ENV_PROBE"), Some("probe-value"));
        std::env::remove_var("RUNBOX_ENV_PROBE");
    }
}
