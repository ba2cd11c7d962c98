/// Process launch, wait, and result collection
///
/// `ProgramSpec::start` forks and execs the child with its descriptors
/// staged; the returned `Program` handle answers `is_done` without blocking
/// and produces a `RunResult` once the child has been reaped.
use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{execve, fork, ForkResult, Pid};
use serde_json::Value;

use crate::fd_handler::FdHandler;
use crate::spec::ProgramSpec;
use crate::types::{Result, RunError};

/// Exit status used by the child when descriptor staging fails before exec.
const EXIT_STAGING_FAILED: i32 = 126;
/// Exit status used by the child when `execve` itself returns.
const EXIT_EXEC_FAILED: i32 = 127;

/// Structured outcome of a completed program: a mapping from result key to
/// stringified value.
///
/// Well-known keys: `status`, `pid`, `stdout`/`stderr` (present iff the
/// corresponding handler captures), `user_cpu_time`, `system_cpu_time`,
/// and `max_rss` (bytes).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunResult {
    entries: BTreeMap<String, String>,
}

impl RunResult {
    pub fn new() -> Self {
        RunResult::default()
    }

    pub fn set(&mut self, name: &str, value: impl fmt::Display) {
        self.entries.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Result<&str> {
        self.entries
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| RunError::Name(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn to_value(&self) -> Value {
        self.entries
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect::<serde_json::Map<String, Value>>()
            .into()
    }

    /// Multi-line listing; values containing newlines are fenced with dash
    /// rules so they read as blocks.
    pub fn pretty(&self) -> String {
        let mut out = String::from("Result:\n");
        for (name, value) in &self.entries {
            if value.contains('\n') {
                out.push_str(&format!(
                    "- {} {}\n{}\n{}\n",
                    name,
                    "-".repeat(77usize.saturating_sub(name.len())),
                    value,
                    "-".repeat(80)
                ));
            } else {
                out.push_str(&format!("- {} = {}\n", name, value));
            }
        }
        out
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Result[")?;
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        write!(f, "]")
    }
}

/// Live handle for a started child process.
pub struct Program {
    pid: Pid,
    waited: bool,
    status: libc::c_int,
    usage: libc::rusage,
    stdin: FdHandler,
    stdout: FdHandler,
    stderr: FdHandler,
}

fn cstring(text: &str) -> Result<CString> {
    CString::new(text).map_err(|_| RunError::Value(format!("string contains NUL: {:?}", text)))
}

impl ProgramSpec {
    /// Fork and exec this program.
    ///
    /// Descriptor handlers, argv, and the environment image are all built
    /// before forking; the child only stages descriptors and calls `execve`.
    pub fn start(&self) -> Result<Program> {
        let stdin = self.stdin.build(0)?;
        let stdout = self.stdout.build(1)?;
        let stderr = self.stderr.build(2)?;

        let executable = cstring(&self.executable.to_string_lossy())?;
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        // argv[0] conventionally is the executable path.
        argv.push(executable.clone());
        for arg in &self.args {
            argv.push(cstring(arg)?);
        }
        let envp = self.env.build().to_exec_array()?;

        let mut handlers = [stdin, stdout, stderr];
        match unsafe { fork() } {
            Err(errno) => Err(RunError::from_errno("fork", errno)),
            Ok(ForkResult::Child) => child_exec(&executable, &argv, &envp, &mut handlers),
            Ok(ForkResult::Parent { child }) => {
                // The capture temp files stay open here so their contents
                // outlive the child.
                let [stdin, stdout, stderr] = handlers;
                Ok(Program {
                    pid: child,
                    waited: false,
                    status: 0,
                    usage: unsafe { std::mem::zeroed() },
                    stdin,
                    stdout,
                    stderr,
                })
            }
        }
    }
}

/// Child-side continuation of `start`. Never returns.
fn child_exec(
    executable: &CStr,
    argv: &[CString],
    envp: &[CString],
    handlers: &mut [FdHandler; 3],
) -> ! {
    // Fixed stdin → stdout → stderr order, so a later handler can dup from
    // a descriptor an earlier one has already mapped.
    for handler in handlers.iter_mut() {
        if handler.start(true).is_err() {
            unsafe { libc::_exit(EXIT_STAGING_FAILED) };
        }
        handler.close();
    }
    let _ = execve(executable, argv, envp);
    unsafe { libc::_exit(EXIT_EXEC_FAILED) };
}

impl Program {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn stdin_handler(&self) -> &FdHandler {
        &self.stdin
    }

    pub fn stdout_handler(&self) -> &FdHandler {
        &self.stdout
    }

    pub fn stderr_handler(&self) -> &FdHandler {
        &self.stderr
    }

    /// Non-blocking completion test. Leaves the zombie reapable so that
    /// `get_result` can still collect resource usage.
    pub fn is_done(&self) -> Result<bool> {
        if self.waited {
            return Ok(true);
        }
        loop {
            match waitid(
                Id::Pid(self.pid),
                WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT,
            ) {
                Ok(WaitStatus::StillAlive) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(RunError::from_errno("waitid", errno)),
            }
        }
    }

    /// Reap the child if needed and return the structured result.
    /// Idempotent after the first successful call.
    pub fn get_result(&mut self) -> Result<RunResult> {
        if !self.waited {
            assert!(self.is_done()?);
            self.usage = unsafe { std::mem::zeroed() };
            loop {
                let rval = unsafe {
                    libc::wait4(
                        self.pid.as_raw(),
                        &mut self.status,
                        libc::WNOHANG,
                        &mut self.usage,
                    )
                };
                if rval == -1 {
                    if Errno::last() == Errno::EINTR {
                        continue;
                    }
                    return Err(RunError::system("wait4"));
                }
                break;
            }
            self.waited = true;
        }

        let mut result = RunResult::new();
        result.set("status", self.status);
        result.set("pid", self.pid.as_raw());
        if let Some(text) = self.stdout.captured() {
            result.set("stdout", text?);
        }
        if let Some(text) = self.stderr.captured() {
            result.set("stderr", text?);
        }
        result.set("user_cpu_time", timeval_seconds(self.usage.ru_utime));
        result.set("system_cpu_time", timeval_seconds(self.usage.ru_stime));
        // ru_maxrss is reported in KiB.
        result.set("max_rss", self.usage.ru_maxrss * 1024);
        Ok(result)
    }
}

fn timeval_seconds(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 * 1e-6
}

/// Block until `program` completes, polling with bounded backoff
/// (1 ms start, ×1.01 per round, 100 ms cap).
pub fn wait(program: &Program) -> Result<()> {
    let cap = Duration::from_millis(100);
    let mut pause = Duration::from_millis(1);
    while !program.is_done()? {
        std::thread::sleep(pause);
        pause = cap.min(pause.mul_f64(1.01));
    }
    Ok(())
}
