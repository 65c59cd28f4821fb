use std::fmt;

/// Terminal disposition recorded on a dead-lettered frame (spec §3 Routing
/// Decision Record `reason`, restricted to the subset that is actually
/// terminal — see `RoutingReason` for the non-terminal routing outcomes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    Malformed,
    NoCapabilityMatch,
    DispatchFailure,
    ParkCapExceeded,
}

impl DlqReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::NoCapabilityMatch => "no_capability_match",
            Self::DispatchFailure => "dispatch_failure",
            Self::ParkCapExceeded => "park_cap_exceeded",
        }
    }
}

impl fmt::Display for DlqReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing Decision Record `reason` (spec §3). `Routed` is not terminal by
/// itself — the caller still has to observe the dispatch outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingReason {
    Routed,
    NoCapabilityMatch,
    AllBusy,
    AllUnhealthy,
    ParkedForRetry,
}

impl RoutingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routed => "routed",
            Self::NoCapabilityMatch => "no_capability_match",
            Self::AllBusy => "all_busy",
            Self::AllUnhealthy => "all_unhealthy",
            Self::ParkedForRetry => "parked_for_retry",
        }
    }
}

impl fmt::Display for RoutingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
