//! Per-environment settings the orchestrator needs at run time.

use std::collections::HashMap;

use anyhow::Context;

use cutover_core::{CutoverConfig, EnvironmentConfig, RevisionId, StepTimeouts};
use cutover_health::HealthTarget;

#[derive(Debug, Clone)]
pub struct EnvironmentSettings {
    /// `{revision}` template reaching one revision directly.
    pub private_health_url: String,
    /// The load-balanced path.
    pub public_health_url: String,
    pub timeouts: StepTimeouts,
}

impl EnvironmentSettings {
    pub fn from_config(config: &EnvironmentConfig) -> anyhow::Result<Self> {
        Ok(Self {
            private_health_url: config.private_health_url.clone(),
            public_health_url: config.public_health_url.clone(),
            timeouts: config.timeouts.resolve()?,
        })
    }

    pub fn private_target(&self, revision: &RevisionId) -> HealthTarget {
        HealthTarget::from_template(&self.private_health_url, revision)
    }

    /// The public URL probed on behalf of `revision`.
    pub fn public_target(&self, revision: &RevisionId) -> HealthTarget {
        HealthTarget::from_template(&self.public_health_url, revision)
    }

    /// Address the traffic layer forwards to for `revision`: the scheme
    /// and authority of its private health URL.
    pub fn endpoint_for(&self, revision: &RevisionId) -> String {
        let url = self.private_target(revision).url;
        let authority_start = url.find("://").map(|i| i + 3).unwrap_or(0);
        match url[authority_start..].find('/') {
            Some(end) => url[..authority_start + end].to_string(),
            None => url,
        }
    }
}

/// Settings for every configured environment.
pub fn settings_from_config(
    config: &CutoverConfig,
) -> anyhow::Result<HashMap<String, EnvironmentSettings>> {
    config
        .environments
        .iter()
        .map(|(name, env)| {
            let settings = EnvironmentSettings::from_config(env)
                .with_context(|| format!("environment {name}"))?;
            Ok((name.clone(), settings))
        })
        .collect()
}
