//! Selection strategies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// How the balancer picks among eligible workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    WeightedRoundRobin,
    LeastLoad,
    LeastConnections,
    ResponseTime,
    Predictive,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::WeightedRoundRobin,
        Strategy::LeastLoad,
        Strategy::LeastConnections,
        Strategy::ResponseTime,
        Strategy::Predictive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::WeightedRoundRobin => "weighted_round_robin",
            Strategy::LeastLoad => "least_load",
            Strategy::LeastConnections => "least_connections",
            Strategy::ResponseTime => "response_time",
            Strategy::Predictive => "predictive",
        }
    }

    /// Parse a configured strategy name, falling back to weighted round
    /// robin (with a warning) for unrecognized names.
    pub fn from_name_lossy(name: &str) -> Self {
        name.parse::<Strategy>().unwrap_or_else(|e| {
            warn!(error = %e, "falling back to weighted_round_robin");
            Strategy::WeightedRoundRobin
        })
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown balancing strategy: {0:?}")]
pub struct UnknownStrategy(pub String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s.trim())
            .ok_or_else(|| UnknownStrategy(s.to_string()))
    }
}
