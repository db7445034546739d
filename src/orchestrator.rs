use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::mpsc::channel;
use threadpool::ThreadPool;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::channel::ProbeChannel;
use crate::collector::ProbeOutcome;
use crate::collector::ResultCollector;
use crate::collector::RunReport;
use crate::config::TamperConfig;
use crate::error::TamperError;
use crate::firewall::RstGuard;
use crate::firewall::RstTuple;
use crate::installer::ensure_helper;
use crate::matrix::Opcode;
use crate::matrix::ProbeSpec;
use crate::matrix::build_matrix;
use crate::matrix::variant_catalog;
use crate::network::HostNetwork;
use crate::network::resolve_host;
use crate::network::same_family;
use crate::network::usable_source;
use crate::privileged::PollPolicy;
use crate::privileged::PrivilegedRunner;
use crate::wire::decode_endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Initializing,
    RunningMatrix,
    Finalizing,
    Done,
    Aborted,
}

/// Why a run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    NoPrivilegedAccess,
    /// Helper missing and not installable, including unsupported architectures.
    HelperUnavailable { reason: String },
    UnknownHost { host: String },
    NoActiveLink,
    /// No local address of the remote's family.
    NoLocalAddress,
    ChannelStartFailed { reason: String },
    GuardRemovalFailed { tuple: RstTuple, reason: String },
}

impl AbortReason {
    pub fn verdict(&self) -> RunVerdict {
        match self {
            AbortReason::NoPrivilegedAccess
            | AbortReason::HelperUnavailable { .. }
            | AbortReason::ChannelStartFailed { .. } => RunVerdict::Prohibited,
            AbortReason::UnknownHost { .. }
            | AbortReason::NoActiveLink
            | AbortReason::NoLocalAddress => RunVerdict::EnvironmentError,
            AbortReason::GuardRemovalFailed { .. } => RunVerdict::Aborted,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AbortReason::NoPrivilegedAccess => write!(f, "no privileged access"),
            AbortReason::HelperUnavailable { reason } => write!(f, "helper unavailable: {}", reason),
            AbortReason::UnknownHost { host } => write!(f, "unknown host {}", host),
            AbortReason::NoActiveLink => write!(f, "no active network link"),
            AbortReason::NoLocalAddress => write!(f, "no usable local address"),
            AbortReason::ChannelStartFailed { reason } => {
                write!(f, "helper channel failed to start: {}", reason)
            }
            AbortReason::GuardRemovalFailed { tuple, reason } => {
                write!(f, "rst drop rule {} not removed: {}", tuple, reason)
            }
        }
    }
}

/// The one result shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunVerdict {
    Prohibited,
    EnvironmentError,
    Completed,
    Aborted,
}

/// Checked before each probe, a probe in flight always completes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub enum ProbeEvent {
    State(RunState),
    Progress { completed: usize, total: usize },
    Outcome(ProbeOutcome),
}

struct Prepared {
    server: IpAddr,
    local_addrs: Vec<IpAddr>,
    channel: ProbeChannel,
}

struct MatrixRun {
    total: usize,
    collector: ResultCollector,
    global_endpoint: Option<SocketAddr>,
    cancelled: bool,
    abort: Option<AbortReason>,
}

/// Drives one run: initialize, run the matrix probe by probe, tear everything down.
pub struct Orchestrator {
    config: TamperConfig,
    runner: Box<dyn PrivilegedRunner>,
    network: Box<dyn HostNetwork>,
    events: Option<Sender<ProbeEvent>>,
    cancel: CancelToken,
    state: RunState,
}

impl Orchestrator {
    pub fn new(
        config: TamperConfig,
        runner: Box<dyn PrivilegedRunner>,
        network: Box<dyn HostNetwork>,
    ) -> Orchestrator {
        Orchestrator {
            config,
            runner,
            network,
            events: None,
            cancel: CancelToken::new(),
            state: RunState::Idle,
        }
    }
    pub fn with_events(mut self, events: Sender<ProbeEvent>) -> Orchestrator {
        self.events = Some(events);
        self
    }
    pub fn with_cancel(mut self, cancel: CancelToken) -> Orchestrator {
        self.cancel = cancel;
        self
    }
    pub fn state(&self) -> RunState {
        self.state
    }
    fn emit(&self, event: ProbeEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                debug!("event receiver dropped");
            }
        }
    }
    fn transition(&mut self, state: RunState) {
        info!("run state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.emit(ProbeEvent::State(state));
    }
    fn initialize(&mut self) -> Result<Prepared, AbortReason> {
        if !self.runner.has_access() {
            error!("privileged access is not available");
            return Err(AbortReason::NoPrivilegedAccess);
        }
        let helper_path = match ensure_helper(self.runner.as_mut(), &self.config) {
            Ok(p) => p,
            Err(e) => {
                error!("helper unavailable: {}", e);
                return Err(AbortReason::HelperUnavailable {
                    reason: e.to_string(),
                });
            }
        };
        let server = match resolve_host(&self.config.server) {
            Ok(s) => s,
            Err(_) => {
                return Err(AbortReason::UnknownHost {
                    host: self.config.server.clone(),
                });
            }
        };
        if !self.network.link_active() {
            return Err(AbortReason::NoActiveLink);
        }
        let candidates: Vec<IpAddr> = match &self.config.local_addrs {
            Some(addrs) => addrs.clone(),
            None => self.network.local_addrs(),
        }
        .into_iter()
        .filter(|a| {
            let ok = usable_source(a);
            if !ok {
                debug!("skip local addr {}", a);
            }
            ok
        })
        .collect();
        let local_addrs = same_family(&candidates, &server);
        if local_addrs.is_empty() {
            warn!("no local address of the same family as {}", server);
            return Err(AbortReason::NoLocalAddress);
        }
        let channel = match ProbeChannel::start(self.runner.as_mut(), &helper_path, &self.config) {
            Ok(c) => c,
            Err(e) => {
                error!("start probe channel failed: {}", e);
                return Err(AbortReason::ChannelStartFailed {
                    reason: e.to_string(),
                });
            }
        };
        Ok(Prepared {
            server,
            local_addrs,
            channel,
        })
    }
    fn run_matrix(
        &mut self,
        server: IpAddr,
        local_addrs: &[IpAddr],
        channel: &mut ProbeChannel,
    ) -> MatrixRun {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let variants = variant_catalog(self.config.extended_variants);
        let mut matrix: Vec<ProbeSpec> =
            build_matrix(server, &self.config.server_ports, local_addrs, &variants, &mut rng);
        let total = matrix.len();
        let guard = RstGuard::new(PollPolicy::from_config(&self.config));

        let mut ret = MatrixRun {
            total,
            collector: ResultCollector::new(),
            global_endpoint: None,
            cancelled: false,
            abort: None,
        };
        for i in 0..total {
            if self.cancel.is_cancelled() {
                info!("run cancelled after {} of {} probes", i, total);
                ret.cancelled = true;
                break;
            }
            let spec = matrix[i].clone();
            let tuple = RstTuple::new(spec.src_port, spec.dst_port, spec.dst_addr);
            if !channel.is_open() {
                // a failed restart leaves this request to fail on its own
                if let Err(e) = channel.reopen(self.runner.as_mut()) {
                    warn!("restart helper failed: {}", e);
                }
            }
            let run = guard.guarded(self.runner.as_mut(), tuple, |_| channel.run_probe(&spec));
            let orphaned = run.rule_orphaned();
            let removal_err = match &run.removal {
                Err(e) => e.to_string(),
                Ok(_) => String::new(),
            };
            let outcome = match run.value {
                Ok(resp) => ProbeOutcome::new(spec, resp.success, resp.payload),
                Err(e) => {
                    warn!("probe {} failed: {}", spec, e);
                    ProbeOutcome::failed(spec)
                }
            };

            if outcome.spec.opcode == Opcode::GlobalIp && outcome.success {
                match outcome.payload.as_deref().and_then(decode_endpoint) {
                    Some(endpoint) => {
                        info!("global endpoint is {}", endpoint);
                        ret.global_endpoint = Some(endpoint);
                        for later in matrix[i + 1..].iter_mut() {
                            later.observed_source = Some(endpoint);
                        }
                    }
                    None => warn!("global ip probe payload is not an endpoint"),
                }
            }

            ret.collector.push(outcome.clone());
            self.emit(ProbeEvent::Outcome(outcome));
            self.emit(ProbeEvent::Progress {
                completed: ret.collector.len(),
                total,
            });

            if orphaned {
                error!("abandoning the remaining {} probes", total - i - 1);
                ret.abort = Some(AbortReason::GuardRemovalFailed {
                    tuple,
                    reason: removal_err,
                });
                break;
            }
        }
        ret
    }
    /// Teardown errors are logged, they never change the run result.
    fn finalize(&mut self, channel: Option<ProbeChannel>) {
        if let Some(channel) = channel {
            if let Err(e) = channel.finish() {
                warn!("finish probe channel failed: {}", e);
            }
        }
        if let Err(e) = self.runner.close_all() {
            warn!("close privileged sessions failed: {}", e);
        }
    }
    /// Run to completion on the current thread.
    pub fn run(mut self) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!("run {} started", run_id);
        self.transition(RunState::Initializing);

        let mut total = 0;
        let mut outcomes = Vec::new();
        let mut global_endpoint = None;
        let mut cancelled = false;
        let reason = match self.initialize() {
            Ok(prepared) => {
                let Prepared {
                    server,
                    local_addrs,
                    mut channel,
                } = prepared;
                self.transition(RunState::RunningMatrix);
                let matrix_run = self.run_matrix(server, &local_addrs, &mut channel);
                total = matrix_run.total;
                outcomes = matrix_run.collector.into_outcomes();
                global_endpoint = matrix_run.global_endpoint;
                cancelled = matrix_run.cancelled;
                self.transition(RunState::Finalizing);
                self.finalize(Some(channel));
                matrix_run.abort
            }
            Err(reason) => {
                // nothing ran yet, only the shell sessions need closing
                self.finalize(None);
                Some(reason)
            }
        };

        let (state, verdict) = match &reason {
            Some(r) => {
                error!("run {} aborted: {}", run_id, r);
                (RunState::Aborted, r.verdict())
            }
            None => (RunState::Done, RunVerdict::Completed),
        };
        self.transition(state);
        RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            state,
            verdict,
            reason,
            cancelled,
            global_endpoint,
            network: self.network.describe(),
            total,
            outcomes,
        }
    }
}

/// A run executing on its own worker thread.
pub struct RunHandle {
    pub events: Receiver<ProbeEvent>,
    cancel: CancelToken,
    report: Receiver<RunReport>,
    _pool: ThreadPool,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
    /// Block until the run is over.
    pub fn join(self) -> Result<RunReport, TamperError> {
        match self.report.recv() {
            Ok(r) => Ok(r),
            Err(_) => Err(TamperError::WorkerLost),
        }
    }
}

/// Start a run off the calling thread.
pub fn spawn_run(
    config: TamperConfig,
    runner: Box<dyn PrivilegedRunner>,
    network: Box<dyn HostNetwork>,
) -> RunHandle {
    let (tx, rx) = channel();
    let (report_tx, report_rx) = channel();
    let cancel = CancelToken::new();
    let orchestrator = Orchestrator::new(config, runner, network)
        .with_events(tx)
        .with_cancel(cancel.clone());

    let pool = ThreadPool::new(1);
    pool.execute(move || {
        let report = orchestrator.run();
        if report_tx.send(report).is_err() {
            debug!("run handle dropped before the report arrived");
        }
    });
    RunHandle {
        events: rx,
        cancel,
        report: report_rx,
        _pool: pool,
    }
}
