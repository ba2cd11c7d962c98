/// Command-line front end for the `run` tool
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;

use crate::program;
use crate::spec::{EnvSpec, FdHandlerSpec, ProgramSpec};

#[derive(Parser, Debug)]
#[command(
    name = "run",
    about = "Run a process from a declarative specification",
    long_about = "Runs a child process from a declarative specification: \
                  environment policy, per-descriptor handlers, and a result \
                  document with exit status, captured output, and resource \
                  usage. Specifications can be edited with flags, persisted \
                  with --write, and loaded back with --read."
)]
struct Cli {
    /// Start the child environment empty instead of inheriting
    #[arg(long)]
    clear_env: bool,

    /// Inherit NAME from the parent environment
    #[arg(long = "keep-env", value_name = "NAME")]
    keep_env: Vec<String>,

    /// Remove NAME from the child environment
    #[arg(short = 'u', long = "unset-env", value_name = "NAME")]
    unset_env: Vec<String>,

    /// Assign VAR=VAL in the child environment
    #[arg(short = 'e', long = "set-env", value_name = "VAR=VAL")]
    set_env: Vec<String>,

    /// Handler for the child's stdin
    #[arg(short = 'I', long = "stdin", value_name = "SPEC")]
    stdin: Option<String>,

    /// Handler for the child's stdout
    #[arg(short = 'O', long = "stdout", value_name = "SPEC")]
    stdout: Option<String>,

    /// Handler for the child's stderr
    #[arg(short = 'E', long = "stderr", value_name = "SPEC")]
    stderr: Option<String>,

    /// Load the specification from FILE ('-' for stdin)
    #[arg(short = 'r', long = "read", value_name = "FILE")]
    read: Option<String>,

    /// Write the specification to FILE ('-' for stdout); implies --no-run
    #[arg(short = 'w', long = "write", value_name = "FILE")]
    write: Option<String>,

    /// Write the result document to FILE ('-' for stdout); implies --no-print
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<String>,

    /// Pretty-print the result to stdout
    #[arg(long, overrides_with = "no_print")]
    print: bool,

    /// Do not print the result
    #[arg(long = "no-print", overrides_with = "print")]
    no_print: bool,

    /// Run the specification
    #[arg(long, overrides_with = "no_run")]
    run: bool,

    /// Do not run the specification
    #[arg(long = "no-run", overrides_with = "run")]
    no_run: bool,

    /// Executable and arguments
    #[arg(
        value_name = "EXECUTABLE",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

pub fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    execute(cli)
}

fn execute(cli: Cli) -> Result<()> {
    let mut spec = match &cli.read {
        Some(file) => load_spec(file)?,
        None => ProgramSpec::default(),
    };

    if !cli.command.is_empty() {
        spec.executable = PathBuf::from(&cli.command[0]);
        spec.args = cli.command[1..].to_vec();
    } else if cli.read.is_none() {
        bail!("no executable given and no specification loaded (see --help)");
    }

    apply_env_edits(&mut spec.env, &cli)?;
    if let Some(handler) = &cli.stdin {
        spec.stdin = FdHandlerSpec::parse(handler)?;
    }
    if let Some(handler) = &cli.stdout {
        spec.stdout = FdHandlerSpec::parse(handler)?;
    }
    if let Some(handler) = &cli.stderr {
        spec.stderr = FdHandlerSpec::parse(handler)?;
    }

    if let Some(file) = &cli.write {
        let text = serde_json::to_string_pretty(&spec.to_value())?;
        write_text(file, &(text + "\n")).context("writing specification document")?;
    }

    let mut do_run = cli.write.is_none();
    if cli.run {
        do_run = true;
    }
    if cli.no_run {
        do_run = false;
    }

    let mut do_print = cli.output.is_none();
    if cli.print {
        do_print = true;
    }
    if cli.no_print {
        do_print = false;
    }

    if do_run {
        let mut child = spec.start()?;
        program::wait(&child)?;
        let result = child.get_result()?;
        if let Some(file) = &cli.output {
            let text = serde_json::to_string_pretty(&result.to_value())?;
            write_text(file, &(text + "\n")).context("writing result document")?;
        }
        if do_print {
            print!("{}", result.pretty());
        }
    }

    Ok(())
}

fn apply_env_edits(env: &mut EnvSpec, cli: &Cli) -> Result<()> {
    if cli.clear_env {
        env.clear_keep();
    }
    for name in &cli.keep_env {
        env.keep_name(name);
    }
    for name in &cli.unset_env {
        env.unset_name(name);
    }
    for assignment in &cli.set_env {
        let (name, value) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow!("--set-env takes VAR=VAL, got {:?}", assignment))?;
        env.assign(name, value);
    }
    Ok(())
}

fn load_spec(file: &str) -> Result<ProgramSpec> {
    let text = read_text(file)?;
    let value: serde_json::Value =
        serde_json::from_str(&text).context("parsing specification document")?;
    Ok(ProgramSpec::from_value(&value)?)
}

fn read_text(file: &str) -> Result<String> {
    if file == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("reading stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file))
    }
}

fn write_text(file: &str, text: &str) -> Result<()> {
    if file == "-" {
        std::io::stdout().write_all(text.as_bytes())?;
        Ok(())
    } else {
        std::fs::write(file, text).with_context(|| format!("writing {}", file))
    }
}
