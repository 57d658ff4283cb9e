//! Query lifecycle stages.

use serde::{Deserialize, Serialize};

/// Execution stage of a query. Declaration order is the lifecycle order:
/// stored state may only move towards later variants.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Lifecycle {
    #[default]
    None,
    Defined,
    Initialized,
    Running,
    Results,
    NextTimeout,
    MaxResults,
    Closed,
    Cancelled,
}

impl Lifecycle {
    pub const ALL: [Lifecycle; 9] = [
        Lifecycle::None,
        Lifecycle::Defined,
        Lifecycle::Initialized,
        Lifecycle::Running,
        Lifecycle::Results,
        Lifecycle::NextTimeout,
        Lifecycle::MaxResults,
        Lifecycle::Closed,
        Lifecycle::Cancelled,
    ];

    /// Storage name of the stage
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::None => "NONE",
            Lifecycle::Defined => "DEFINED",
            Lifecycle::Initialized => "INITIALIZED",
            Lifecycle::Running => "RUNNING",
            Lifecycle::Results => "RESULTS",
            Lifecycle::NextTimeout => "NEXTTIMEOUT",
            Lifecycle::MaxResults => "MAXRESULTS",
            Lifecycle::Closed => "CLOSED",
            Lifecycle::Cancelled => "CANCELLED",
        }
    }

    /// Parse a storage name back into a stage
    pub fn parse(s: &str) -> Option<Lifecycle> {
        Lifecycle::ALL
            .iter()
            .copied()
            .find(|l| l.as_str().eq_ignore_ascii_case(s))
    }

    /// The later of two stages
    #[inline]
    pub fn advance(self, other: Lifecycle) -> Lifecycle {
        self.max(other)
    }

    /// True once the query has been closed or cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(self, Lifecycle::Closed | Lifecycle::Cancelled)
    }

    /// True for the stages that report pages back to the caller
    pub fn is_paging(&self) -> bool {
        matches!(
            self,
            Lifecycle::Results | Lifecycle::NextTimeout | Lifecycle::MaxResults
        )
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
