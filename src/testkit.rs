//! Stand-ins for the privileged shell and the packet-crafting helper.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::process::Command;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::TamperConfig;
use crate::error::TamperError;
use crate::matrix::Opcode;
use crate::privileged::PendingCommand;
use crate::privileged::PrivilegedRunner;
use crate::wire::WireRequest;
use crate::wire::WireResponse;
use crate::wire::decode_request;
use crate::wire::encode_response;
use crate::wire::read_frame;
use crate::wire::write_frame;

pub fn test_config() -> TamperConfig {
    let mut config = TamperConfig::default();
    config.poll_interval_ms = 1;
    config.max_poll_interval_ms = 2;
    config.command_timeout_ms = 200;
    config.accept_timeout_ms = 5_000;
    config.probe_timeout_ms = 5_000;
    config.finish_timeout_ms = 2_000;
    config
}

/// Finishes with `status` after `polls_before_done` unfinished polls.
pub struct ScriptedCommand {
    cmd: String,
    polls_before_done: usize,
    status: i32,
    pub polls: usize,
    pub killed: bool,
}

impl ScriptedCommand {
    pub fn new(cmd: &str, polls_before_done: usize, status: i32) -> ScriptedCommand {
        ScriptedCommand {
            cmd: cmd.to_string(),
            polls_before_done,
            status,
            polls: 0,
            killed: false,
        }
    }
}

impl PendingCommand for ScriptedCommand {
    fn command(&self) -> &str {
        &self.cmd
    }
    fn try_status(&mut self) -> Result<Option<i32>, TamperError> {
        self.polls += 1;
        if self.killed {
            return Err(TamperError::CommandKilled {
                cmd: self.cmd.clone(),
            });
        }
        if self.polls > self.polls_before_done {
            Ok(Some(self.status))
        } else {
            Ok(None)
        }
    }
    fn kill(&mut self) -> Result<(), TamperError> {
        self.killed = true;
        Ok(())
    }
}

pub enum HelperReply {
    Respond(WireResponse),
    /// Answer only after sleeping.
    Delayed(Duration, WireResponse),
    /// A frame whose body is not a valid response.
    Garbage(Vec<u8>),
    /// Drop the connection without answering.
    Hangup,
}

type HelperScript = Box<dyn FnMut(&WireRequest) -> HelperReply + Send>;

#[derive(Default)]
struct LogInner {
    commands: Vec<String>,
    probes: Vec<WireRequest>,
    helper_quits: usize,
    close_all: usize,
}

/// Shared view of everything the mock runner and fake helper saw.
#[derive(Clone, Default)]
pub struct CommandLog {
    inner: Arc<Mutex<LogInner>>,
}

impl CommandLog {
    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().unwrap().commands.clone()
    }
    /// Firewall commands only, in submission order.
    pub fn rule_commands(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains("tables -"))
            .collect()
    }
    pub fn probes(&self) -> Vec<WireRequest> {
        self.inner.lock().unwrap().probes.clone()
    }
    pub fn helper_quits(&self) -> usize {
        self.inner.lock().unwrap().helper_quits
    }
    pub fn close_all_calls(&self) -> usize {
        self.inner.lock().unwrap().close_all
    }
}

struct HelperThread {
    cmd: String,
    handle: Option<JoinHandle<()>>,
}

impl PendingCommand for HelperThread {
    fn command(&self) -> &str {
        &self.cmd
    }
    fn try_status(&mut self) -> Result<Option<i32>, TamperError> {
        let finished = match &self.handle {
            Some(h) => h.is_finished(),
            None => true,
        };
        if !finished {
            return Ok(None);
        }
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
        Ok(Some(0))
    }
    fn kill(&mut self) -> Result<(), TamperError> {
        Ok(())
    }
}

fn serve_helper(addr: SocketAddr, script: Arc<Mutex<HelperScript>>, log: CommandLog) {
    let mut stream = match TcpStream::connect(addr) {
        Ok(s) => s,
        Err(_) => return,
    };
    loop {
        let body = match read_frame(&mut stream) {
            Ok(b) => b,
            Err(_) => return,
        };
        let req = match decode_request(&body) {
            Ok(r) => r,
            Err(_) => return,
        };
        if req.opcode == Opcode::Quit.code() {
            log.inner.lock().unwrap().helper_quits += 1;
            return;
        }
        log.inner.lock().unwrap().probes.push(req.clone());
        let reply = {
            let mut script = script.lock().unwrap();
            (*script)(&req)
        };
        let out = match reply {
            HelperReply::Respond(mut resp) => {
                resp.seq = req.seq;
                encode_response(&resp).unwrap()
            }
            HelperReply::Delayed(delay, mut resp) => {
                thread::sleep(delay);
                resp.seq = req.seq;
                encode_response(&resp).unwrap()
            }
            HelperReply::Garbage(body) => body,
            HelperReply::Hangup => return,
        };
        if write_frame(&mut stream, &out).is_err() {
            return;
        }
    }
}

/// Records every command; firewall commands succeed unless told otherwise,
/// `install` really runs (tests point it at scratch dirs),
/// anything else is taken as the helper launch.
pub struct MockRunner {
    log: CommandLog,
    access: bool,
    adds: usize,
    deletes: usize,
    fail_adds: HashSet<usize>,
    hang_adds: HashSet<usize>,
    fail_deletes: HashSet<usize>,
    helper: Option<Arc<Mutex<HelperScript>>>,
}

impl MockRunner {
    pub fn new() -> MockRunner {
        MockRunner {
            log: CommandLog::default(),
            access: true,
            adds: 0,
            deletes: 0,
            fail_adds: HashSet::new(),
            hang_adds: HashSet::new(),
            fail_deletes: HashSet::new(),
            helper: None,
        }
    }
    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }
    pub fn deny_access(&mut self) {
        self.access = false;
    }
    /// 1-based index of the rule add that fails.
    pub fn fail_nth_add(&mut self, n: usize) {
        self.fail_adds.insert(n);
    }
    pub fn hang_nth_add(&mut self, n: usize) {
        self.hang_adds.insert(n);
    }
    pub fn fail_nth_delete(&mut self, n: usize) {
        self.fail_deletes.insert(n);
    }
    pub fn set_helper<F>(&mut self, f: F)
    where
        F: FnMut(&WireRequest) -> HelperReply + Send + 'static,
    {
        self.helper = Some(Arc::new(Mutex::new(Box::new(f))));
    }
}

impl PrivilegedRunner for MockRunner {
    fn has_access(&mut self) -> bool {
        self.access
    }
    fn submit(&mut self, cmd: &str) -> Result<Box<dyn PendingCommand>, TamperError> {
        if !self.access {
            return Err(TamperError::PermissionDenied {
                cmd: cmd.to_string(),
            });
        }
        self.log.inner.lock().unwrap().commands.push(cmd.to_string());
        if cmd.contains("tables -A ") {
            self.adds += 1;
            if self.hang_adds.contains(&self.adds) {
                return Ok(Box::new(ScriptedCommand::new(cmd, usize::MAX, 0)));
            }
            let status = if self.fail_adds.contains(&self.adds) { 1 } else { 0 };
            return Ok(Box::new(ScriptedCommand::new(cmd, 1, status)));
        }
        if cmd.contains("tables -D ") {
            self.deletes += 1;
            let status = if self.fail_deletes.contains(&self.deletes) { 1 } else { 0 };
            return Ok(Box::new(ScriptedCommand::new(cmd, 1, status)));
        }
        if cmd.starts_with("install ") {
            let status = Command::new("sh")
                .args(["-c", cmd])
                .status()?
                .code()
                .unwrap_or(-1);
            return Ok(Box::new(ScriptedCommand::new(cmd, 0, status)));
        }
        let script = match &self.helper {
            Some(s) => s.clone(),
            None => return Ok(Box::new(ScriptedCommand::new(cmd, usize::MAX, 0))),
        };
        let addr: SocketAddr = match cmd.split_whitespace().last() {
            Some(a) => a.parse()?,
            None => return Ok(Box::new(ScriptedCommand::new(cmd, usize::MAX, 0))),
        };
        let log = self.log.clone();
        let handle = thread::spawn(move || serve_helper(addr, script, log));
        Ok(Box::new(HelperThread {
            cmd: cmd.to_string(),
            handle: Some(handle),
        }))
    }
    fn close_all(&mut self) -> Result<(), TamperError> {
        self.log.inner.lock().unwrap().close_all += 1;
        Ok(())
    }
}
