#![doc = include_str!("../README.md")]
use tracing::Level;

pub mod channel;
pub mod collector;
pub mod config;
pub mod error;
pub mod firewall;
pub mod installer;
pub mod matrix;
pub mod network;
pub mod orchestrator;
pub mod privileged;
#[cfg(test)]
mod testkit;
pub mod wire;

/// Crate-wide tracing setup.
pub struct Logger;

impl Logger {
    fn init(level: Level) -> Result<(), TamperError> {
        match tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .try_init()
        {
            Ok(_) => Ok(()),
            Err(e) => Err(TamperError::InitLoggerError { e: e.to_string() }),
        }
    }
    pub fn init_debug_logging() -> Result<(), TamperError> {
        Logger::init(Level::DEBUG)
    }
    pub fn init_info_logging() -> Result<(), TamperError> {
        Logger::init(Level::INFO)
    }
    pub fn init_warn_logging() -> Result<(), TamperError> {
        Logger::init(Level::WARN)
    }
}

/// The outcome of one executed probe.
pub use collector::ProbeOutcome;
/// Everything a finished (or aborted) run produced.
pub use collector::RunReport;
pub use config::TamperConfig;
pub use error::TamperError;
/// Shell-backed privileged runner, uses `sudo -n` when not root.
pub use privileged::ShellRunner;
/// Local addresses and link state read from the host interfaces.
pub use network::SystemNetwork;
pub use network::StaticNetwork;
/// Run a full probe matrix on a background worker.
///
/// ```no_run
/// use tcptamper::SystemNetwork;
/// use tcptamper::ShellRunner;
/// use tcptamper::TamperConfig;
/// use tcptamper::spawn_run;
///
/// let handle = spawn_run(
///     TamperConfig::default(),
///     Box::new(ShellRunner::new()),
///     Box::new(SystemNetwork),
/// );
/// let report = handle.join().unwrap();
/// println!("{}", report);
/// ```
pub use orchestrator::spawn_run;
pub use orchestrator::CancelToken;
pub use orchestrator::Orchestrator;
pub use orchestrator::ProbeEvent;
pub use orchestrator::RunHandle;
pub use orchestrator::RunVerdict;
