//! Deadline-bounded health probing.
//!
//! The prober polls a target at a fixed interval and only the deadline
//! ends a failing probe. The [`ProbeWindow`] keeps track of how the
//! endpoint failed so that a consistently explicit "unhealthy" answer is
//! reported differently from an endpoint that never answered.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use cutover_core::{HealthReport, RevisionId, now_secs};

use crate::check::{CheckResult, HealthCheck};

/// What to probe: a revision and the URL that reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTarget {
    pub revision: RevisionId,
    pub url: String,
}

impl HealthTarget {
    /// Build a target from a URL template; `{revision}` is substituted.
    pub fn from_template(template: &str, revision: &RevisionId) -> Self {
        Self {
            revision: revision.clone(),
            url: template.replace("{revision}", revision.as_str()),
        }
    }
}

/// Final verdict of a probe window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// Every attempt got an explicit failure answer.
    Unhealthy(String),
    /// The window closed without a pass, and not every attempt was an
    /// explicit failure.
    TimedOut(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

/// Outcome plus the report handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct ProbeVerdict {
    pub outcome: ProbeOutcome,
    pub report: HealthReport,
    pub attempts: u32,
}

/// Tallies the failed attempts of one probe window.
#[derive(Debug, Default)]
pub struct ProbeWindow {
    attempts: u32,
    explicit_failures: u32,
    no_responses: u32,
    last_detail: Option<String>,
}

impl ProbeWindow {
    /// Record a failed attempt.
    pub fn record(&mut self, result: &CheckResult) {
        self.attempts += 1;
        match result {
            CheckResult::Pass => {}
            CheckResult::Fail(detail) => {
                self.explicit_failures += 1;
                self.last_detail = Some(detail.clone());
            }
            CheckResult::NoResponse(detail) => {
                self.no_responses += 1;
                self.last_detail = Some(detail.clone());
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Verdict once the window has closed without a pass.
    pub fn verdict(&self) -> ProbeOutcome {
        let detail = self
            .last_detail
            .clone()
            .unwrap_or_else(|| "no check completed".to_string());
        if self.explicit_failures > 0 && self.no_responses == 0 {
            ProbeOutcome::Unhealthy(detail)
        } else {
            ProbeOutcome::TimedOut(detail)
        }
    }
}

/// Polls a [`HealthCheck`] until it passes or the window closes.
#[derive(Clone)]
pub struct Prober {
    check: Arc<dyn HealthCheck>,
    request_timeout: Duration,
}

impl Prober {
    pub fn new(check: Arc<dyn HealthCheck>, request_timeout: Duration) -> Self {
        Self {
            check,
            request_timeout,
        }
    }

    /// Probe `target` every `interval` until a check passes or `timeout`
    /// elapses. At least one check is always made.
    pub async fn probe(
        &self,
        target: &HealthTarget,
        timeout: Duration,
        interval: Duration,
    ) -> ProbeVerdict {
        let deadline = Instant::now() + timeout;
        let mut window = ProbeWindow::default();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && window.attempts() > 0 {
                break;
            }
            let request_timeout = if remaining.is_zero() {
                self.request_timeout
            } else {
                self.request_timeout.min(remaining)
            };

            let result = self.check.check(&target.url, request_timeout).await;
            if result == CheckResult::Pass {
                info!(
                    revision = %target.revision,
                    url = %target.url,
                    attempts = window.attempts() + 1,
                    "health probe passed"
                );
                return ProbeVerdict {
                    outcome: ProbeOutcome::Healthy,
                    report: HealthReport {
                        revision: target.revision.clone(),
                        checked_at: now_secs(),
                        passed: true,
                        detail: format!("{} healthy", target.url),
                    },
                    attempts: window.attempts() + 1,
                };
            }
            window.record(&result);
            debug!(revision = %target.revision, ?result, "health probe attempt failed");

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(interval.min(remaining)).await;
        }

        let outcome = window.verdict();
        warn!(
            revision = %target.revision,
            url = %target.url,
            attempts = window.attempts(),
            ?outcome,
            "health probe failed"
        );
        let detail = match &outcome {
            ProbeOutcome::Unhealthy(d) | ProbeOutcome::TimedOut(d) => d.clone(),
            ProbeOutcome::Healthy => String::new(),
        };
        ProbeVerdict {
            report: HealthReport {
                revision: target.revision.clone(),
                checked_at: now_secs(),
                passed: false,
                detail,
            },
            outcome,
            attempts: window.attempts(),
        }
    }
}
