//! Health states and the monotone-worsening comparison

use serde::{Deserialize, Serialize};

/// Health verdict for a probed entity or an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Invalid,
    Ok,
    Warning,
    Error,
    Unknown,
}

impl HealthState {
    /// Merge a proposed state into the current one.
    ///
    /// States only worsen within one aggregation pass: Ok < Warning < Error.
    /// Invalid and Unknown carry no information and are always superseded.
    pub fn worsen(self, proposed: HealthState) -> HealthState {
        match (self, proposed) {
            (HealthState::Invalid | HealthState::Unknown, p) => p,
            (c, HealthState::Invalid | HealthState::Unknown) => c,
            (c, p) => {
                if p.severity() > c.severity() {
                    p
                } else {
                    c
                }
            }
        }
    }

    fn severity(self) -> u8 {
        match self {
            HealthState::Ok => 0,
            HealthState::Warning => 1,
            HealthState::Error => 2,
            HealthState::Invalid | HealthState::Unknown => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Invalid => "invalid",
            HealthState::Ok => "ok",
            HealthState::Warning => "warning",
            HealthState::Error => "error",
            HealthState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP status codes in 200..=299 count as success
pub fn is_success_code(code: u16) -> bool {
    (200..=299).contains(&code)
}
