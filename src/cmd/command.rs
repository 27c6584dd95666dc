use std::io::{BufRead, BufReader, Error, ErrorKind, Lines, Read};
use std::os::fd::AsFd;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use itertools::Itertools;
use timeout_readwrite::TimeoutReader;

use crate::cmd::command::CommandError::{ExecutionError, ExitStatusError, Killed, TimeoutError};

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("Error while executing command")]
    ExecutionError(#[from] Error),

    #[error("Command terminated with a non success exit status code: {0}")]
    ExitStatusError(ExitStatus),

    #[error("Command killed due to timeout: {0}")]
    TimeoutError(String),

    #[error("Command killed by user request: {0}")]
    Killed(String),
}

#[derive(Debug, Clone)]
pub enum AbortReason {
    Timeout(Duration),
    Canceled(String),
}

impl AbortReason {
    pub fn is_cancel(&self) -> bool {
        matches!(self, AbortReason::Canceled(_))
    }
}

/// Decides when a running command should be torn down: a deadline, a
/// cancellation probe, both, or neither.
pub struct CommandKiller<'a> {
    deadline: Option<(Instant, Duration)>,
    cancel: Option<&'a dyn Fn() -> bool>,
}

impl<'a> CommandKiller<'a> {
    pub fn never() -> CommandKiller<'a> {
        CommandKiller {
            deadline: None,
            cancel: None,
        }
    }

    pub fn from_timeout(timeout: Duration) -> CommandKiller<'a> {
        CommandKiller {
            deadline: Some((Instant::now(), timeout)),
            cancel: None,
        }
    }

    pub fn from_cancelable(is_canceled: &'a dyn Fn() -> bool) -> CommandKiller<'a> {
        CommandKiller {
            deadline: None,
            cancel: Some(is_canceled),
        }
    }

    pub fn from(timeout: Duration, is_canceled: &'a dyn Fn() -> bool) -> CommandKiller<'a> {
        CommandKiller {
            deadline: Some((Instant::now(), timeout)),
            cancel: Some(is_canceled),
        }
    }

    pub fn should_abort(&self) -> Option<AbortReason> {
        if let Some((since, timeout)) = self.deadline
            && since.elapsed() >= timeout
        {
            return Some(AbortReason::Timeout(timeout));
        }
        if let Some(is_canceled) = self.cancel
            && is_canceled()
        {
            return Some(AbortReason::Canceled("task canceled".to_string()));
        }
        None
    }
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(120);

/// One side of the child's output, read line by line with a bounded wait so
/// a single thread can interleave both streams and abort checks.
struct LineStream<R: Read + AsRawFd + AsFd> {
    lines: Lines<BufReader<TimeoutReader<R>>>,
    closed: bool,
}

impl<R: Read + AsRawFd + AsFd> LineStream<R> {
    fn new(source: R, poll_timeout: Duration) -> Self {
        LineStream {
            lines: BufReader::new(TimeoutReader::new(source, poll_timeout)).lines(),
            closed: false,
        }
    }

    /// Forwards buffered lines to the sink until the stream goes quiet,
    /// closes, or the abort trigger fires. Returns whether any line was seen.
    fn pump<F: FnMut(String)>(&mut self, sink: &mut F, abort: &CommandKiller) -> bool {
        let mut saw_output = false;

        while !self.closed && abort.should_abort().is_none() {
            match self.lines.next() {
                None => self.closed = true,
                Some(Ok(line)) => {
                    saw_output = true;
                    sink(line);
                }
                Some(Err(ref err)) if err.kind() == ErrorKind::TimedOut => break,
                Some(Err(err)) => {
                    debug!("stopping output stream on read error: {}", err);
                    self.closed = true;
                }
            }
        }

        saw_output
    }

    /// Final pass after a kill, flushing whatever the child managed to write.
    fn drain<F: FnMut(String)>(&mut self, sink: &mut F) {
        while let Some(Ok(line)) = self.lines.next() {
            sink(line);
        }
    }
}

pub trait ExecutableCommand {
    fn get_args(&self) -> Vec<String>;

    fn kill(&self, cmd_handle: &mut Child);

    fn exec(&mut self) -> Result<(), CommandError>;

    fn exec_with_output<STDOUT, STDERR>(
        &mut self,
        stdout_output: &mut STDOUT,
        stderr_output: &mut STDERR,
    ) -> Result<(), CommandError>
    where
        STDOUT: FnMut(String),
        STDERR: FnMut(String);

    fn exec_with_abort<STDOUT, STDERR>(
        &mut self,
        stdout_output: &mut STDOUT,
        stderr_output: &mut STDERR,
        abort_notifier: &CommandKiller,
    ) -> Result<(), CommandError>
    where
        STDOUT: FnMut(String),
        STDERR: FnMut(String);
}

/// A child process of the driver. The child gets its own process group so a
/// kill reaches the whole tree the back-end may spawn, and the environment
/// overlay is applied per launch; the parent environment is never mutated.
pub struct HostCommand {
    command: Command,
    term_grace_period: Duration,
    kill_grace_period: Duration,
}

impl HostCommand {
    pub fn new<P: AsRef<Path>>(binary: P, args: &[&str], envs: &[(&str, &str)]) -> HostCommand {
        let mut command = Command::new(binary.as_ref().as_os_str());
        command.args(args);
        command.process_group(0);

        envs.iter().for_each(|(k, v)| {
            command.env(k, v);
        });

        HostCommand {
            command,
            term_grace_period: Duration::from_secs(5),
            kill_grace_period: Duration::from_secs(10),
        }
    }

    pub fn set_kill_grace_periods(&mut self, term_after: Duration, kill_after: Duration) {
        self.term_grace_period = term_after;
        self.kill_grace_period = kill_after;
    }

    pub fn set_current_dir<P: AsRef<Path>>(&mut self, root_dir: P) {
        self.command.current_dir(root_dir);
    }

    fn signal_group(cmd_handle: &Child, signal: libc::c_int) {
        // negative pid addresses the process group
        unsafe {
            let pid = cmd_handle.id() as i32;
            let _ = libc::kill(-pid, signal);
        }
    }
}

impl ExecutableCommand for HostCommand {
    fn get_args(&self) -> Vec<String> {
        self.command
            .get_args()
            .map(|a| a.to_str().unwrap_or_default().to_string())
            .collect()
    }

    /// Escalating group kill: SIGINT first for a graceful stop, SIGTERM once
    /// the term grace period elapses, SIGKILL after the kill grace period.
    fn kill(&self, cmd_handle: &mut Child) {
        info!("killing command: {:?}", cmd_handle);

        Self::signal_group(cmd_handle, libc::SIGINT);

        let killed_since = Instant::now();
        let mut term_sent = false;
        let mut kill_sent = false;
        while let Ok(None) = cmd_handle.try_wait() {
            if !term_sent && killed_since.elapsed() >= self.term_grace_period {
                Self::signal_group(cmd_handle, libc::SIGTERM);
                term_sent = true;
            }
            if !kill_sent && killed_since.elapsed() >= self.kill_grace_period {
                info!("command still running after grace period, hard killing it");
                Self::signal_group(cmd_handle, libc::SIGKILL);
                let _ = cmd_handle.kill();
                kill_sent = true;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        let _ = cmd_handle.wait();
    }

    fn exec(&mut self) -> Result<(), CommandError> {
        self.exec_with_abort(
            &mut |line| info!("{}", line),
            &mut |line| warn!("{}", line),
            &CommandKiller::never(),
        )
    }

    fn exec_with_output<STDOUT, STDERR>(
        &mut self,
        stdout_output: &mut STDOUT,
        stderr_output: &mut STDERR,
    ) -> Result<(), CommandError>
    where
        STDOUT: FnMut(String),
        STDERR: FnMut(String),
    {
        self.exec_with_abort(stdout_output, stderr_output, &CommandKiller::never())
    }

    fn exec_with_abort<STDOUT, STDERR>(
        &mut self,
        stdout_output: &mut STDOUT,
        stderr_output: &mut STDERR,
        abort_notifier: &CommandKiller,
    ) -> Result<(), CommandError>
    where
        STDOUT: FnMut(String),
        STDERR: FnMut(String),
    {
        let mut cmd_handle = self
            .command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ExecutionError)?;

        let stdout = cmd_handle
            .stdout
            .take()
            .ok_or_else(|| ExecutionError(Error::new(ErrorKind::BrokenPipe, "Cannot get stdout for command")))?;
        let stderr = cmd_handle
            .stderr
            .take()
            .ok_or_else(|| ExecutionError(Error::new(ErrorKind::BrokenPipe, "Cannot get stderr for command")))?;

        // stdout paces the loop with a 1s wait; stderr is only skimmed so a
        // chatty stderr cannot starve stdout
        let mut stdout_stream = LineStream::new(stdout, Duration::from_secs(1));
        let mut stderr_stream = LineStream::new(stderr, Duration::ZERO);

        let mut last_output = Instant::now();
        while !(stdout_stream.closed && stderr_stream.closed) {
            if abort_notifier.should_abort().is_some() {
                break;
            }

            let mut saw_output = stdout_stream.pump(stdout_output, abort_notifier);
            saw_output |= stderr_stream.pump(stderr_output, abort_notifier);

            if saw_output {
                last_output = Instant::now();
            } else if last_output.elapsed() > HEARTBEAT_INTERVAL {
                stderr_output("Command still running. No output available. Waiting for next line...".to_string());
                last_output = Instant::now();
            }
        }

        // streams are done or abandoned; now wait for the child itself,
        // tearing the group down if an abort arrives meanwhile
        let exit_status = loop {
            match cmd_handle.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if let Some(reason) = abort_notifier.should_abort() {
                        let msg = format!("Killing process {:?} due to {:?}", self.command, reason);
                        warn!("{}", msg);
                        self.kill(&mut cmd_handle);

                        stdout_stream.drain(stdout_output);
                        stderr_stream.drain(stderr_output);

                        return if reason.is_cancel() {
                            Err(Killed(msg))
                        } else {
                            Err(TimeoutError(msg))
                        };
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(err) => return Err(ExecutionError(err)),
            }
        };

        if !exit_status.success() {
            debug!(
                "command: {:?} terminated with error exit status {:?}",
                self.command, exit_status
            );
            return Err(ExitStatusError(exit_status));
        }

        Ok(())
    }
}

/// Looks a binary up in PATH, returning its full path when it exists and is
/// executable.
pub fn binary_in_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| crate::preflight::is_executable(candidate))
}

pub fn does_binary_exist(binary: &str) -> bool {
    binary_in_path(binary).is_some()
}

pub fn command_to_string<P>(binary: P, args: &[&str], envs: &[(&str, &str)]) -> String
where
    P: AsRef<Path>,
{
    let rendered_envs = envs.iter().map(|(k, v)| format!("{k}={v}")).join(" ");
    format!("{} {:?} {}", rendered_envs, binary.as_ref().as_os_str(), args.join(" "))
}

#[cfg(test)]
mod tests {
    use crate::cmd::command::{CommandError, CommandKiller, ExecutableCommand, HostCommand, does_binary_exist};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_binary_exist() {
        assert!(!does_binary_exist("sdfsdf"));
        assert!(does_binary_exist("ls"));
    }

    #[test]
    fn test_error() {
        let mut cmd = HostCommand::new("false", &[], &[]);
        assert!(cmd.exec().is_err());
        assert!(matches!(cmd.exec(), Err(CommandError::ExitStatusError(_))));
    }

    #[test]
    fn test_both_streams_are_captured() {
        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let mut cmd = HostCommand::new("sh", &["-c", "echo out; echo err >&2; echo out2"], &[]);
        cmd.exec_with_output(&mut |line| stdout_lines.push(line), &mut |line| stderr_lines.push(line))
            .unwrap();

        assert_eq!(stdout_lines, vec!["out".to_string(), "out2".to_string()]);
        assert_eq!(stderr_lines, vec!["err".to_string()]);
    }

    #[test]
    fn test_env_overlay_reaches_the_child() {
        let mut output = String::new();
        let mut cmd = HostCommand::new("sh", &["-c", "printf '%s' \"$OVERLAY_VAR\""], &[("OVERLAY_VAR", "visible")]);
        cmd.exec_with_output(&mut |line| output.push_str(&line), &mut |_| {}).unwrap();
        assert_eq!(output, "visible");

        // and the parent env stays untouched
        assert!(std::env::var("OVERLAY_VAR").is_err());
    }

    #[test]
    fn test_command_with_timeout() {
        let mut cmd = HostCommand::new("sleep", &["120"], &[]);
        cmd.set_kill_grace_periods(Duration::from_secs(0), Duration::from_secs(1));
        let ret = cmd.exec_with_abort(&mut |_| {}, &mut |_| {}, &CommandKiller::from_timeout(Duration::from_secs(2)));

        assert!(matches!(ret, Err(CommandError::TimeoutError(_))));

        let mut cmd = HostCommand::new("sleep", &["1"], &[]);
        let ret = cmd.exec_with_abort(&mut |_| {}, &mut |_| {}, &CommandKiller::from_timeout(Duration::from_secs(5)));
        assert!(ret.is_ok());
    }

    #[test]
    fn test_command_with_abort() {
        let mut cmd = HostCommand::new("sleep", &["120"], &[]);
        cmd.set_kill_grace_periods(Duration::from_secs(0), Duration::from_secs(1));
        let should_kill = Arc::new(AtomicBool::new(false));
        let should_kill2 = should_kill.clone();
        let barrier = Arc::new(Barrier::new(2));

        let _ = thread::spawn({
            let barrier = barrier.clone();
            move || {
                barrier.wait();
                thread::sleep(Duration::from_secs(2));
                should_kill.store(true, Ordering::Release);
            }
        });

        let cmd_killer = move || should_kill2.load(Ordering::Acquire);
        let cmd_killer = CommandKiller::from_cancelable(&cmd_killer);
        barrier.wait();
        let ret = cmd.exec_with_abort(&mut |_| {}, &mut |_| {}, &cmd_killer);

        assert!(matches!(ret, Err(CommandError::Killed(_))));
    }
}
