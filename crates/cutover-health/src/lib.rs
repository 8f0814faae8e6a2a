//! cutover-health — health probing for deployment gates.
//!
//! A [`HealthCheck`] performs one attempt against a target and classifies
//! the result as a pass, an explicit failure (the endpoint answered "not
//! healthy"), or no response at all. The [`Prober`] repeats checks at a
//! fixed interval until one passes or the deadline elapses, then reports
//! `Healthy`, `Unhealthy` or `TimedOut`.
//!
//! ```text
//! Prober::probe(target, timeout, interval)
//!   ├── HealthCheck::check() every `interval`
//!   ├── ProbeWindow (explicit failures vs non-responses)
//!   └── ProbeVerdict { outcome, report, attempts }
//! ```
//!
//! A failed attempt never ends a probe; only the deadline does.
//!
//! [`HttpCheck`] speaks HTTP/1.1 over TCP, or over rustls for `https`
//! targets, trusting the webpki roots unless given its own client config.

pub mod check;
pub mod prober;

pub use check::{BoxFuture, CheckResult, HealthCheck, HttpCheck};
pub use prober::{HealthTarget, ProbeOutcome, ProbeVerdict, ProbeWindow, Prober};
