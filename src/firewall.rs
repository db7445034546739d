use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::panic;
use std::panic::AssertUnwindSafe;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::error::TamperError;
use crate::privileged::PollPolicy;
use crate::privileged::PrivilegedRunner;
use crate::privileged::run_privileged;

/// The (source port, destination port, destination address) triple one rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RstTuple {
    pub src_port: u16,
    pub dst_port: u16,
    pub dst_addr: IpAddr,
}

impl RstTuple {
    pub fn new(src_port: u16, dst_port: u16, dst_addr: IpAddr) -> RstTuple {
        RstTuple {
            src_port,
            dst_port,
            dst_addr,
        }
    }
}

impl fmt::Display for RstTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "sport {} dport {} dst {}",
            self.src_port, self.dst_port, self.dst_addr
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Add,
    Delete,
}

impl RuleAction {
    fn flag(self) -> char {
        match self {
            RuleAction::Add => 'A',
            RuleAction::Delete => 'D',
        }
    }
}

/// Shell command adding or deleting the outbound RST drop rule for `tuple`.
pub fn rule_command(action: RuleAction, tuple: &RstTuple) -> String {
    let program = match tuple.dst_addr {
        IpAddr::V4(_) => "iptables",
        IpAddr::V6(_) => "ip6tables",
    };
    format!(
        "{} -{} OUTPUT -p tcp --tcp-flags RST RST --sport {} --dport {} -d {} -j DROP",
        program,
        action.flag(),
        tuple.src_port,
        tuple.dst_port,
        tuple.dst_addr
    )
}

/// What we know about the rule after trying to add it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallState {
    Installed,
    /// The command ran and refused, no rule is in the table.
    Failed,
    /// The command never reported back, the rule may or may not be there.
    Unknown,
}

/// An installed (or possibly installed) rule, outstanding until passed to [`RstGuard::remove`].
#[derive(Debug)]
pub struct FirewallGuardHandle {
    tuple: RstTuple,
    state: InstallState,
}

impl FirewallGuardHandle {
    pub fn tuple(&self) -> &RstTuple {
        &self.tuple
    }
    pub fn state(&self) -> InstallState {
        self.state
    }
}

/// Result of one guarded probe.
#[derive(Debug)]
pub struct GuardedRun<T> {
    pub value: T,
    pub install: InstallState,
    pub removal: Result<(), TamperError>,
}

impl<T> GuardedRun<T> {
    /// A rule that may still be in the table poisons every later probe.
    pub fn rule_orphaned(&self) -> bool {
        self.removal.is_err() && self.install != InstallState::Failed
    }
}

/// Suppresses the local stack's RST answers around one probe.
pub struct RstGuard {
    policy: PollPolicy,
}

impl RstGuard {
    pub fn new(policy: PollPolicy) -> RstGuard {
        RstGuard { policy }
    }
    pub fn install(&self, runner: &mut dyn PrivilegedRunner, tuple: RstTuple) -> FirewallGuardHandle {
        let cmd = rule_command(RuleAction::Add, &tuple);
        let state = match run_privileged(runner, &cmd, &self.policy) {
            Ok(_) => {
                debug!("rst drop rule installed: {}", tuple);
                InstallState::Installed
            }
            Err(TamperError::CommandFailed { status, .. }) => {
                warn!("failed to enable rst drop rule {}, status {}", tuple, status);
                InstallState::Failed
            }
            Err(e) => {
                warn!("enable rst drop rule {} not confirmed: {}", tuple, e);
                InstallState::Unknown
            }
        };
        FirewallGuardHandle { tuple, state }
    }
    pub fn remove(
        &self,
        runner: &mut dyn PrivilegedRunner,
        handle: FirewallGuardHandle,
    ) -> Result<(), TamperError> {
        let cmd = rule_command(RuleAction::Delete, &handle.tuple);
        match run_privileged(runner, &cmd, &self.policy) {
            Ok(_) => {
                debug!("rst drop rule removed: {}", handle.tuple);
                Ok(())
            }
            Err(e) => {
                match handle.state {
                    InstallState::Failed => {
                        debug!("no rule to remove for {}: {}", handle.tuple, e)
                    }
                    _ => error!("rst drop rule {} added but not removed: {}", handle.tuple, e),
                }
                Err(e)
            }
        }
    }
    /// Install the rule for `tuple`, run `f`, then remove the rule.
    /// `f` runs even when the install failed, and the removal runs even if `f` panics.
    pub fn guarded<T, F>(&self, runner: &mut dyn PrivilegedRunner, tuple: RstTuple, f: F) -> GuardedRun<T>
    where
        F: FnOnce(&FirewallGuardHandle) -> T,
    {
        let handle = self.install(runner, tuple);
        let install = handle.state();
        let value = panic::catch_unwind(AssertUnwindSafe(|| f(&handle)));
        let removal = self.remove(runner, handle);
        match value {
            Ok(value) => GuardedRun {
                value,
                install,
                removal,
            },
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}
