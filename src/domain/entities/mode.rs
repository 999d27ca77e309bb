use serde::{Deserialize, Serialize};

/// Trading mode. Every persisted row carries the mode so that test runs can
/// never touch real-account state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradingMode {
    /// Signal evaluation only; order submissions are filled virtually.
    DryRun,
    /// Paper-trading account on the mock investment server.
    Paper,
    /// Live account. Requires explicit confirmation at startup.
    Real,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::DryRun => "DRY_RUN",
            TradingMode::Paper => "PAPER",
            TradingMode::Real => "REAL",
        }
    }

    pub fn is_paper_server(&self) -> bool {
        matches!(self, TradingMode::DryRun | TradingMode::Paper)
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DRY_RUN" => Ok(TradingMode::DryRun),
            "PAPER" => Ok(TradingMode::Paper),
            "REAL" => Ok(TradingMode::Real),
            other => Err(format!("unknown trading mode: {}", other)),
        }
    }
}
