//! Classification of engine stdout/stderr lines.
//!
//! This is the boundary contract with the engine's human-readable output.
//! Two signals matter to supervision: the gateway announcing its listening
//! port (readiness) and an agent failure report (surfaced to subscribers
//! without tearing the process down).

use regex::Regex;

/// A supervision-relevant signal extracted from one output line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineSignal {
    /// The gateway is accepting connections, optionally reporting its port.
    GatewayListening { port: Option<u16> },
    /// The engine reported an agent-level failure.
    AgentFailure { message: String },
    /// Nothing supervision cares about.
    None,
}

pub struct LogClassifier {
    listening: Regex,
    agent_failure: Regex,
}

impl Default for LogClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LogClassifier {
    pub fn new() -> Self {
        Self {
            // e.g. "gateway listening on ws://127.0.0.1:4517"
            //      "Gateway listening on port 4517"
            listening: Regex::new(
                r"(?i)gateway\s+listening(?:\s+on)?(?:\s+(?:port\s+|ws://127\.0\.0\.1:|ws://localhost:))?(\d+)?",
            )
            .expect("listening regex is valid"),
            // e.g. "[agent] failure: model backend unreachable"
            //      "agent failure: tool call rejected"
            agent_failure: Regex::new(r"(?i)(?:\[agent\]\s*|agent\s+)failure:\s*(.+)")
                .expect("agent failure regex is valid"),
        }
    }

    pub fn classify(&self, line: &str) -> LineSignal {
        if let Some(caps) = self.agent_failure.captures(line) {
            let message = caps
                .get(1)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            return LineSignal::AgentFailure { message };
        }

        if let Some(caps) = self.listening.captures(line) {
            let port = caps.get(1).and_then(|m| m.as_str().parse::<u16>().ok());
            return LineSignal::GatewayListening { port };
        }

        LineSignal::None
    }
}
