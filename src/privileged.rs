use std::io::ErrorKind;
use std::process::Child;
use std::process::Command;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::config::TamperConfig;
use crate::error::TamperError;

/// A command submitted to the privileged shell, still running or finished.
pub trait PendingCommand: Send {
    fn command(&self) -> &str;
    /// Returns `None` while the command is still running, the exit status otherwise.
    fn try_status(&mut self) -> Result<Option<i32>, TamperError>;
    fn kill(&mut self) -> Result<(), TamperError>;
}

/// Runs shell commands as superuser.
/// Completion is asynchronous, callers poll the returned [`PendingCommand`].
pub trait PrivilegedRunner: Send {
    fn has_access(&mut self) -> bool;
    fn submit(&mut self, cmd: &str) -> Result<Box<dyn PendingCommand>, TamperError>;
    /// Close every privileged shell session this runner opened.
    fn close_all(&mut self) -> Result<(), TamperError>;
}

/// Bounded poll loop settings.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_interval: Duration, timeout: Duration) -> PollPolicy {
        PollPolicy {
            interval,
            max_interval: max_interval.max(interval),
            timeout,
        }
    }
    pub fn from_config(config: &TamperConfig) -> PollPolicy {
        PollPolicy::new(
            config.poll_interval(),
            config.max_poll_interval(),
            config.command_timeout(),
        )
    }
}

fn next_interval(interval: Duration, max_interval: Duration) -> Duration {
    interval.saturating_mul(2).min(max_interval)
}

/// Poll `pending` until it finishes, doubling the sleep up to `max_interval`.
/// A command still running after `timeout` is killed and reported as timed out.
pub fn wait_for(
    pending: &mut dyn PendingCommand,
    policy: &PollPolicy,
) -> Result<i32, TamperError> {
    let start = Instant::now();
    let mut interval = policy.interval;
    loop {
        if let Some(status) = pending.try_status()? {
            debug!(
                "command [{}] finished with {} after {:?}",
                pending.command(),
                status,
                start.elapsed()
            );
            return Ok(status);
        }
        if start.elapsed() >= policy.timeout {
            let cmd = pending.command().to_string();
            warn!("command [{}] timeout, killing it", cmd);
            if let Err(e) = pending.kill() {
                warn!("kill command [{}] failed: {}", cmd, e);
            }
            return Err(TamperError::CommandTimeout {
                cmd,
                timeout_ms: policy.timeout.as_millis(),
            });
        }
        thread::sleep(interval);
        interval = next_interval(interval, policy.max_interval);
    }
}

/// Submit `cmd` and block until it exits successfully.
pub fn run_privileged(
    runner: &mut dyn PrivilegedRunner,
    cmd: &str,
    policy: &PollPolicy,
) -> Result<(), TamperError> {
    let mut pending = runner.submit(cmd)?;
    let status = wait_for(pending.as_mut(), policy)?;
    if status != 0 {
        return Err(TamperError::CommandFailed {
            cmd: cmd.to_string(),
            status,
        });
    }
    Ok(())
}

fn lock_child<'a>(
    child: &'a Arc<Mutex<Child>>,
) -> Result<std::sync::MutexGuard<'a, Child>, TamperError> {
    match child.lock() {
        Ok(c) => Ok(c),
        Err(e) => Err(TamperError::LockFailed {
            var_name: String::from("child"),
            e: e.to_string(),
        }),
    }
}

struct ShellCommand {
    cmd: String,
    child: Arc<Mutex<Child>>,
}

impl PendingCommand for ShellCommand {
    fn command(&self) -> &str {
        &self.cmd
    }
    fn try_status(&mut self) -> Result<Option<i32>, TamperError> {
        let mut child = lock_child(&self.child)?;
        match child.try_wait()? {
            Some(status) => match status.code() {
                Some(code) => Ok(Some(code)),
                None => Err(TamperError::CommandKilled {
                    cmd: self.cmd.clone(),
                }),
            },
            None => Ok(None),
        }
    }
    fn kill(&mut self) -> Result<(), TamperError> {
        let mut child = lock_child(&self.child)?;
        match child.kill() {
            Ok(_) => (),
            // already exited
            Err(e) if e.kind() == ErrorKind::InvalidInput => (),
            Err(e) => return Err(e.into()),
        }
        child.wait()?;
        Ok(())
    }
}

/// Runs commands through `sh -c`, prefixed with `sudo -n` when we are not root.
pub struct ShellRunner {
    elevate: Option<Vec<String>>,
    sessions: Vec<Arc<Mutex<Child>>>,
}

impl ShellRunner {
    pub fn new() -> ShellRunner {
        ShellRunner {
            elevate: None,
            sessions: Vec::new(),
        }
    }
    fn is_root() -> bool {
        match Command::new("id").arg("-u").output() {
            Ok(o) => String::from_utf8_lossy(&o.stdout).trim() == "0",
            Err(e) => {
                debug!("run id -u failed: {}", e);
                false
            }
        }
    }
    fn sudo_works() -> bool {
        match Command::new("sudo")
            .args(["-n", "true"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(s) => s.success(),
            Err(e) => {
                debug!("run sudo -n true failed: {}", e);
                false
            }
        }
    }
}

impl PrivilegedRunner for ShellRunner {
    fn has_access(&mut self) -> bool {
        if self.elevate.is_some() {
            return true;
        }
        if ShellRunner::is_root() {
            debug!("running as root");
            self.elevate = Some(Vec::new());
        } else if ShellRunner::sudo_works() {
            debug!("passwordless sudo available");
            self.elevate = Some(vec![String::from("sudo"), String::from("-n")]);
        }
        self.elevate.is_some()
    }
    fn submit(&mut self, cmd: &str) -> Result<Box<dyn PendingCommand>, TamperError> {
        if !self.has_access() {
            return Err(TamperError::PermissionDenied {
                cmd: cmd.to_string(),
            });
        }
        let prefix = match &self.elevate {
            Some(p) => p.clone(),
            None => Vec::new(),
        };
        let mut command = match prefix.split_first() {
            Some((program, args)) => {
                let mut c = Command::new(program);
                c.args(args).arg("sh");
                c
            }
            None => Command::new("sh"),
        };
        command
            .args(["-c", cmd])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = match command.spawn() {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(TamperError::PermissionDenied {
                    cmd: cmd.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        debug!("submit privileged command [{}] pid {}", cmd, child.id());
        let child = Arc::new(Mutex::new(child));
        self.sessions.push(child.clone());
        Ok(Box::new(ShellCommand {
            cmd: cmd.to_string(),
            child,
        }))
    }
    fn close_all(&mut self) -> Result<(), TamperError> {
        let mut first_err = None;
        for session in self.sessions.drain(..) {
            let mut child = lock_child(&session)?;
            match child.try_wait() {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    warn!("privileged session pid {} still running, killing", child.id());
                    if let Err(e) = child.kill().and_then(|_| child.wait().map(|_| ())) {
                        first_err.get_or_insert(e);
                    }
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
