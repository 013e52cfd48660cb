//! Startup configuration. Each key is read from its mounted file under the
//! envs directory first, then from the process environment.

use std::{path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use keeper_agent::{AgentSettings, Intervals};

const URL_FILE: &str = "watch-keeper-config/RAZEEDASH_URL";
const API_FILE: &str = "razee-identity-config/RAZEE_API";
const ORG_KEY_FILES: &[&str] = &["razee-identity-secret/RAZEE_ORG_KEY", "watch-keeper-secret/RAZEEDASH_ORG_KEY"];
const CLUSTER_ID_FILES: &[&str] = &["razee-identity-config/CLUSTER_ID", "watch-keeper-config/CLUSTER_ID_OVERRIDE"];
const CLUSTER_NAME_FILES: &[&str] = &["razee-identity-config/CLUSTER_NAME", "watch-keeper-config/DEFAULT_CLUSTER_NAME"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeeperConfig {
    pub collector_url: String,
    pub org_key: Option<String>,
    pub cluster_id_override: Option<String>,
    pub cluster_name: Option<String>,
    /// Minutes.
    pub start_delay_max: u64,
    pub config_namespace: String,
    pub intervals: Intervals,
    pub log_level: Option<String>,
}

struct Source<'a> {
    dir: &'a Path,
    env: &'a dyn Fn(&str) -> Option<String>,
}

fn non_empty(s: String) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

impl Source<'_> {
    fn file(&self, rel: &str) -> Option<String> { std::fs::read_to_string(self.dir.join(rel)).ok().and_then(non_empty) }

    fn value(&self, env_key: &str, files: &[&str]) -> Option<String> {
        files.iter().find_map(|f| self.file(f)).or_else(|| (self.env)(env_key).and_then(non_empty))
    }

    fn number(&self, key: &str, default: u64) -> Result<u64> {
        let file = format!("watch-keeper-config/{}", key);
        match self.value(key, &[file.as_str()]) {
            Some(v) => v.parse().with_context(|| format!("{} must be a whole number, got {:?}", key, v)),
            None => Ok(default),
        }
    }
}

/// Resolve configuration from `dir` and `env`. Fails when no collector URL
/// can be found or a numeric key does not parse.
pub fn resolve(dir: &Path, env: impl Fn(&str) -> Option<String>) -> Result<KeeperConfig> {
    let src = Source { dir, env: &env };

    let collector_url = src
        .file(URL_FILE)
        .or_else(|| src.file(API_FILE).map(|api| format!("{}/api/v2", api.trim_end_matches('/'))))
        .or_else(|| (src.env)("RAZEEDASH_URL").and_then(non_empty))
        .ok_or_else(|| anyhow!("no collector URL: set RAZEEDASH_URL or mount {} or {}", URL_FILE, API_FILE))?;

    let defaults = Intervals::default();
    Ok(KeeperConfig {
        collector_url,
        org_key: src.value("RAZEEDASH_ORG_KEY", ORG_KEY_FILES),
        cluster_id_override: src.value("CLUSTER_ID_OVERRIDE", CLUSTER_ID_FILES),
        cluster_name: src.value("DEFAULT_CLUSTER_NAME", CLUSTER_NAME_FILES),
        start_delay_max: src.number("START_DELAY_MAX", 10)?,
        config_namespace: src
            .value("CONFIG_NAMESPACE", &["watch-keeper-config/CONFIG_NAMESPACE"])
            .unwrap_or_else(|| "kube-system".to_string()),
        intervals: Intervals {
            validate: src.number("VALIDATE_INTERVAL", defaults.validate)?,
            poll: src.number("POLL_INTERVAL", defaults.poll)?,
            clean_start: src.number("CLEAN_START_INTERVAL", defaults.clean_start)?,
        },
        log_level: src.value("LOG_LEVEL", &["watch-keeper-config/LOG_LEVEL"]),
    })
}

impl KeeperConfig {
    pub fn apply(&self, settings: &mut AgentSettings) {
        settings.config_namespace = self.config_namespace.clone();
        settings.cluster_name = self.cluster_name.clone();
        settings.intervals = self.intervals;
        settings.start_delay_max = Duration::from_secs(self.start_delay_max * 60);
    }
}

/// Map a LOG_LEVEL value onto a tracing filter directive. Bunyan-style
/// `fatal` becomes `error`; anything else passes through.
pub fn filter_directive(level: Option<&str>) -> String {
    match level.map(str::to_ascii_lowercase).as_deref() {
        None | Some("") => "info".to_string(),
        Some("fatal") => "error".to_string(),
        Some(other) => other.to_string(),
    }
}
