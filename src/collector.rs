use chrono::DateTime;
use chrono::Utc;
use prettytable::Cell;
use prettytable::Row;
use prettytable::Table;
use prettytable::row;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

use crate::error::TamperError;
use crate::matrix::ProbeSpec;
use crate::orchestrator::AbortReason;
use crate::orchestrator::RunState;
use crate::orchestrator::RunVerdict;

/// What came back for one executed probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub spec: ProbeSpec,
    pub success: bool,
    pub payload: Option<Vec<u8>>,
}

impl ProbeOutcome {
    pub fn new(spec: ProbeSpec, success: bool, payload: Option<Vec<u8>>) -> ProbeOutcome {
        ProbeOutcome {
            spec,
            success,
            payload,
        }
    }
    pub fn failed(spec: ProbeSpec) -> ProbeOutcome {
        ProbeOutcome::new(spec, false, None)
    }
    pub fn payload_hex(&self) -> String {
        match &self.payload {
            Some(p) => hex::encode(p),
            None => String::new(),
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let status = if self.success { "ok" } else { "failed" };
        write!(f, "{} {}", self.spec, status)?;
        if let Some(observed) = self.spec.observed_source {
            write!(f, " seen as {}", observed)?;
        }
        if self.payload.is_some() {
            write!(f, " payload {}", self.payload_hex())?;
        }
        Ok(())
    }
}

/// Append-only outcome log, in completion order.
#[derive(Debug, Clone, Default)]
pub struct ResultCollector {
    outcomes: Vec<ProbeOutcome>,
}

impl ResultCollector {
    pub fn new() -> ResultCollector {
        ResultCollector {
            outcomes: Vec::new(),
        }
    }
    pub fn push(&mut self, outcome: ProbeOutcome) {
        self.outcomes.push(outcome);
    }
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
    pub fn outcomes(&self) -> &[ProbeOutcome] {
        &self.outcomes
    }
    pub fn into_outcomes(self) -> Vec<ProbeOutcome> {
        self.outcomes
    }
}

/// Final result of one run, complete or partial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: RunState,
    pub verdict: RunVerdict,
    pub reason: Option<AbortReason>,
    pub cancelled: bool,
    /// Our address and port as the remote peer saw them.
    pub global_endpoint: Option<SocketAddr>,
    pub network: String,
    /// Planned matrix size.
    pub total: usize,
    pub outcomes: Vec<ProbeOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }
    /// The string handed to the upload collaborator.
    pub fn to_post_string(&self) -> String {
        let mut ret = format!("Network info: {}", self.network);
        for outcome in &self.outcomes {
            ret += "\n";
            ret += &outcome.to_string();
        }
        ret
    }
    pub fn to_json(&self) -> Result<String, TamperError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut table = Table::new();
        table.add_row(Row::new(vec![
            Cell::new(&format!("TCP Tamper Results ({})", self.run_id))
                .style_spec("c")
                .with_hspan(6),
        ]));
        table.add_row(row![c -> "id", c -> "variant", c -> "source", c -> "destination", c -> "status", c -> "payload"]);
        for (i, o) in self.outcomes.iter().enumerate() {
            let name = match o.spec.extra {
                Some(e) => format!("{}({})", o.spec.name, e),
                None => o.spec.name.clone(),
            };
            let src = SocketAddr::new(o.spec.src_addr, o.spec.src_port);
            let dst = SocketAddr::new(o.spec.dst_addr, o.spec.dst_port);
            let status = if o.success { "ok" } else { "failed" };
            table.add_row(row![c -> i + 1, name, src, dst, c -> status, o.payload_hex()]);
        }

        let mut summary = format!(
            "{:?}, {}/{} probes run, {} ok",
            self.verdict,
            self.outcomes.len(),
            self.total,
            self.succeeded()
        );
        if let Some(reason) = &self.reason {
            summary += &format!(", reason: {}", reason);
        }
        if self.cancelled {
            summary += ", cancelled";
        }
        if let Some(endpoint) = self.global_endpoint {
            summary += &format!(", global endpoint {}", endpoint);
        }
        let cost = self.finished_at - self.started_at;
        summary += &format!(", took {:.3}s", cost.num_milliseconds() as f64 / 1000.0);
        table.add_row(Row::new(vec![Cell::new(&summary).with_hspan(6)]));
        write!(f, "{}", table)
    }
}
