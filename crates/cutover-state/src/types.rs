//! Store-only value types.
//!
//! The shared domain types live in `cutover-core`; these describe
//! backend bookkeeping that only the state-backed adapters need.

use serde::{Deserialize, Serialize};

use cutover_core::RevisionId;

/// A revision attached to an environment as a routable backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficTarget {
    pub environment: String,
    pub revision: RevisionId,
    /// Address the traffic layer forwards to (host:port or URL).
    pub endpoint: String,
    pub attached_at: u64,
}

impl TrafficTarget {
    pub fn table_key(&self) -> String {
        target_key(&self.environment, &self.revision)
    }
}

pub(crate) fn target_key(environment: &str, revision: &RevisionId) -> String {
    format!("{environment}:{revision}")
}

/// Which revision a locally managed service runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceBinding {
    pub environment: String,
    /// Revision the service currently schedules.
    pub revision: RevisionId,
    /// Revision the service ran before the last update, kept running
    /// alongside until superseded.
    pub standby: Option<RevisionId>,
    pub updated_at: u64,
}
