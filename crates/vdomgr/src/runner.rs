//! External-command execution.
//!
//! Every mutation of kernel state goes through external tools, so all of
//! them funnel through [`run_command`]: captured output, bounded retries,
//! and a dry-run mode in which the command line is only logged. The
//! dry-run/verbose switches live in an explicit [`RunContext`] passed
//! through the operations rather than in process-wide state.

use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, info};

/// Per-invocation execution context.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    no_run: bool,
    verbose: bool,
}

impl RunContext {
    pub fn new(verbose: bool, no_run: bool) -> Self {
        // Dry runs always narrate what they would have done.
        RunContext { no_run, verbose: verbose || no_run }
    }

    /// True if commands are logged instead of executed.
    pub fn no_run_mode(&self) -> bool {
        self.no_run
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

/// Error raised to indicate a failed command.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CommandError {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    message: String,
}

impl CommandError {
    fn new(exit_code: i32, stdout: String, stderr: String, message: String) -> Self {
        CommandError { exit_code, stdout, stderr, message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }
}

/// Options controlling a single [`run_command`] invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    retries: u32,
    stdin: Option<String>,
    strip: bool,
    no_throw: bool,
    shell: bool,
    environment: Vec<(String, String)>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            retries: 1,
            stdin: None,
            strip: false,
            no_throw: false,
            shell: false,
            environment: Vec::new(),
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try the command up to `retries` times, sleeping one second between
    /// attempts.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Strip leading and trailing whitespace from the output.
    pub fn stripped(mut self) -> Self {
        self.strip = true;
        self
    }

    /// Return an empty string instead of an error on failure.
    pub fn no_throw(mut self) -> Self {
        self.no_throw = true;
        self
    }

    /// Run the joined command line through `sh -c`.
    pub fn shell(mut self) -> Self {
        self.shell = true;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }
}

/// Runs a command with default options, returning its standard output.
pub fn run_command(
    ctx: &RunContext,
    argv: &[&str],
) -> Result<String, CommandError> {
    run_command_with(ctx, argv, RunOptions::default())
}

/// Runs a command, returning its standard output.
pub fn run_command_with(
    ctx: &RunContext,
    argv: &[&str],
    opts: RunOptions,
) -> Result<String, CommandError> {
    let command_line = display_command_line(argv, opts.shell);
    if opts.retries > 1 {
        debug!("waiting for '{command_line}'");
    }

    let mut result = Ok(String::new());
    for attempt in 0..opts.retries {
        if opts.retries > 1 {
            debug!("  ... {attempt}/{}", opts.retries);
        }
        if ctx.verbose() {
            println!("    {command_line}");
            info!("{command_line}");
        }
        if ctx.no_run_mode() {
            return Ok(String::new());
        }

        result = execute_once(argv, &opts);
        match result {
            Ok(ref output) => {
                return Ok(if opts.strip {
                    output.trim().to_string()
                } else {
                    output.clone()
                });
            }
            Err(ref mut error) => {
                if attempt + 1 == opts.retries {
                    if opts.retries > 1 {
                        error.set_message(format!(
                            "{}: timed out after {} seconds",
                            argv[0], opts.retries
                        ));
                    }
                    break;
                }
                sleep(Duration::from_secs(1));
            }
        }
    }

    if opts.no_throw { Ok(String::new()) } else { result }
}

/// Try each of a series of commands in turn until one succeeds, returning
/// the output of the first success. If all the commands fail the error of
/// the last one is raised.
pub fn try_commands_until_success(
    ctx: &RunContext,
    commands: &[&[&str]],
    opts: RunOptions,
) -> Result<String, CommandError> {
    let mut last = None;
    for argv in commands {
        match run_command_with(ctx, argv, opts.clone()) {
            Ok(output) => return Ok(output),
            Err(e) => last = Some(e),
        }
    }
    match last {
        Some(e) if !opts.no_throw => Err(e),
        _ => Ok(String::new()),
    }
}

fn execute_once(
    argv: &[&str],
    opts: &RunOptions,
) -> Result<String, CommandError> {
    let mut command = if opts.shell {
        let mut c = Command::new("sh");
        c.arg("-c").arg(argv.join(" "));
        c
    } else {
        let mut c = Command::new(argv[0]);
        c.args(&argv[1..]);
        c
    };
    command
        .stdin(if opts.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &opts.environment {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|e| {
        CommandError::new(
            e.raw_os_error().unwrap_or(1),
            String::new(),
            String::new(),
            format!("{}: {}", argv[0], e),
        )
    })?;
    if let (Some(input), Some(mut pipe)) = (&opts.stdin, child.stdin.take()) {
        // A child that exits without draining its input closes the pipe;
        // that is not an error here.
        let _ = pipe.write_all(input.as_bytes());
    }
    let output = child.wait_with_output().map_err(|e| {
        CommandError::new(
            e.raw_os_error().unwrap_or(1),
            String::new(),
            String::new(),
            format!("{}: {}", argv[0], e),
        )
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    debug!("stdout: {}", stdout.trim_end());
    debug!("stderr: {}", stderr.trim_end());

    if output.status.success() {
        debug!("{}: command succeeded", argv[0]);
        return Ok(stdout);
    }

    let (failure, value) = match output.status.code() {
        Some(code) => ("exit status", code),
        None => ("signal", output.status.signal().unwrap_or(0)),
    };
    let mut message = format!("{}: command failed, {failure} {value}", argv[0]);
    debug!("{message}");
    // A command that explains itself on stderr makes the better message.
    if let Some(line) = stderr.lines().next() {
        if !line.is_empty() {
            message = line.to_string();
        }
    }
    let exit_code = match output.status.code() {
        Some(code) => code,
        None => -output.status.signal().unwrap_or(0),
    };
    Err(CommandError::new(exit_code, stdout, stderr, message))
}

fn display_command_line(argv: &[&str], shell: bool) -> String {
    if shell {
        argv.join(" ")
    } else {
        argv.iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg.chars().all(|c| {
            c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c)
        });
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        RunContext::default()
    }

    #[test]
    fn captures_stdout() {
        let out = run_command(&ctx(), &["echo", "hello"]).unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn strips_output() {
        let out = run_command_with(
            &ctx(),
            &["echo", "hello"],
            RunOptions::new().stripped(),
        )
        .unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let err = run_command(&ctx(), &["false"]).unwrap_err();
        assert_eq!(err.exit_code, 1);
    }

    #[test]
    fn stderr_first_line_becomes_the_message() {
        let err = run_command_with(
            &ctx(),
            &["echo oops >&2; exit 3"],
            RunOptions::new().shell(),
        )
        .unwrap_err();
        assert_eq!(err.exit_code, 3);
        assert_eq!(err.message(), "oops");
    }

    #[test]
    fn no_throw_swallows_failures() {
        let out = run_command_with(
            &ctx(),
            &["false"],
            RunOptions::new().no_throw(),
        )
        .unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn missing_binary_reports_spawn_failure() {
        let err =
            run_command(&ctx(), &["/nonexistent/binary-for-test"]).unwrap_err();
        assert!(err.message().contains("/nonexistent/binary-for-test"));
    }

    #[test]
    fn stdin_is_delivered() {
        let out = run_command_with(
            &ctx(),
            &["cat"],
            RunOptions::new().with_stdin("fed"),
        )
        .unwrap();
        assert_eq!(out, "fed");
    }

    #[test]
    fn no_run_mode_skips_execution() {
        let ctx = RunContext::new(false, true);
        let out = run_command(&ctx, &["false"]).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn first_success_wins() {
        let out = try_commands_until_success(
            &ctx(),
            &[&["false"], &["echo", "ok"]],
            RunOptions::new().stripped(),
        )
        .unwrap();
        assert_eq!(out, "ok");
    }

    #[test]
    fn all_failures_raise_the_last_error() {
        let err = try_commands_until_success(
            &ctx(),
            &[&["false"], &["false"]],
            RunOptions::new(),
        )
        .unwrap_err();
        assert_eq!(err.exit_code, 1);
    }
}
