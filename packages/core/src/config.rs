//! Worker configuration.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::event::Kind;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no job kinds configured")]
    NoKinds,

    #[error("no relay endpoints configured")]
    NoRelays,

    #[error("invalid kind '{value}': {reason}")]
    InvalidKind { value: String, reason: String },

    #[error("kind {0} is outside the job request range 5000-5999")]
    UnsupportedKind(u16),

    #[error("invalid relay url '{0}': expected ws:// or wss://")]
    InvalidRelayUrl(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Configuration for a worker.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Worker name, used as the environment prefix and in logs.
    pub name: String,
    /// Job request kinds to subscribe to.
    pub kinds: BTreeSet<Kind>,
    /// Relay endpoints to connect to.
    pub relays: Vec<String>,
    /// Secret identity key handed to the signer. Generated by it when absent.
    pub identity: Option<String>,
    /// Whether the key collaborator should avoid persisting identity.
    pub ephemeral: bool,
    /// How long the dispatch loop waits between queue polls when idle.
    pub poll_interval: Duration,
    /// Total attempts at publishing a result event.
    pub result_publish_attempts: u32,
    /// Delay between result publication attempts.
    pub publish_retry_delay: Duration,
    /// Upper bound on a single work invocation.
    pub work_timeout: Option<Duration>,
    /// How long shutdown waits for the actors to stop.
    pub shutdown_timeout: Duration,
    /// Base URL of an event explorer, used for log links.
    pub explorer_url: Option<String>,
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("name", &self.name)
            .field("kinds", &self.kinds)
            .field("relays", &self.relays)
            .field("identity", &self.identity.as_ref().map(|_| "<redacted>"))
            .field("ephemeral", &self.ephemeral)
            .field("poll_interval", &self.poll_interval)
            .field("result_publish_attempts", &self.result_publish_attempts)
            .field("publish_retry_delay", &self.publish_retry_delay)
            .field("work_timeout", &self.work_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("explorer_url", &self.explorer_url)
            .finish()
    }
}

impl WorkerConfig {
    /// Create a config with defaults and no kinds or relays.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kinds: BTreeSet::new(),
            relays: Vec::new(),
            identity: None,
            ephemeral: false,
            poll_interval: Duration::from_secs(1),
            result_publish_attempts: 2,
            publish_retry_delay: Duration::from_millis(500),
            work_timeout: None,
            shutdown_timeout: Duration::from_secs(5),
            explorer_url: None,
        }
    }

    /// Load a config from the process environment.
    ///
    /// Reads `{name}_KINDS`, `{name}_RELAYS`, `{name}_NSEC`,
    /// `{name}_EPHEMERAL`, `{name}_POLL_INTERVAL_MS` and
    /// `{name}_WORK_TIMEOUT_SECS`.
    pub fn from_env(name: impl Into<String>) -> Result<Self, ConfigError> {
        Self::from_lookup(name, |key| std::env::var(key).ok())
    }

    /// Load a config through an arbitrary key lookup.
    pub fn from_lookup<F>(name: impl Into<String>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new(name);
        let key = |suffix: &str| format!("{}_{}", config.name, suffix);

        let kinds_key = key("KINDS");
        let relays_key = key("RELAYS");
        let nsec_key = key("NSEC");
        let ephemeral_key = key("EPHEMERAL");
        let poll_key = key("POLL_INTERVAL_MS");
        let timeout_key = key("WORK_TIMEOUT_SECS");

        if let Some(raw) = lookup(&kinds_key) {
            config.kinds = parse_kinds(&raw)?;
        }
        if let Some(raw) = lookup(&relays_key) {
            config.relays = split_list(&raw).map(str::to_string).collect();
        }
        config.identity = lookup(&nsec_key).filter(|v| !v.trim().is_empty());
        if let Some(raw) = lookup(&ephemeral_key) {
            config.ephemeral = parse_bool(&ephemeral_key, &raw)?;
        }
        if let Some(raw) = lookup(&poll_key) {
            config.poll_interval = Duration::from_millis(parse_u64(&poll_key, &raw)?);
        }
        if let Some(raw) = lookup(&timeout_key) {
            config.work_timeout = Some(Duration::from_secs(parse_u64(&timeout_key, &raw)?));
        }

        Ok(config)
    }

    /// Add job kinds to subscribe to.
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds.extend(kinds.into_iter().map(Kind));
        self
    }

    /// Add a relay endpoint.
    pub fn with_relay(mut self, url: impl Into<String>) -> Self {
        self.relays.push(url.into());
        self
    }

    /// Set the identity key handed to the signer.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_result_publish_attempts(mut self, attempts: u32) -> Self {
        self.result_publish_attempts = attempts;
        self
    }

    pub fn with_publish_retry_delay(mut self, delay: Duration) -> Self {
        self.publish_retry_delay = delay;
        self
    }

    pub fn with_work_timeout(mut self, timeout: Duration) -> Self {
        self.work_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_explorer_url(mut self, url: impl Into<String>) -> Self {
        self.explorer_url = Some(url.into());
        self
    }

    /// Check that the config can start a worker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kinds.is_empty() {
            return Err(ConfigError::NoKinds);
        }
        if let Some(kind) = self.kinds.iter().find(|k| !k.is_job_request()) {
            return Err(ConfigError::UnsupportedKind(kind.as_u16()));
        }
        if self.relays.is_empty() {
            return Err(ConfigError::NoRelays);
        }
        if let Some(url) = self
            .relays
            .iter()
            .find(|u| !(u.starts_with("ws://") || u.starts_with("wss://")))
        {
            return Err(ConfigError::InvalidRelayUrl(url.clone()));
        }
        if self.result_publish_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "result_publish_attempts".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "poll_interval".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.work_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::InvalidValue {
                key: "work_timeout".into(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Explorer link for an event id, when an explorer is configured.
    pub fn explorer_link(&self, event_id: &str) -> Option<String> {
        self.explorer_url
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), event_id))
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_kinds(raw: &str) -> Result<BTreeSet<Kind>, ConfigError> {
    split_list(raw)
        .map(|value| {
            value
                .parse::<u16>()
                .map(Kind)
                .map_err(|e| ConfigError::InvalidKind {
                    value: value.to_string(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("'{}' is not a boolean", other),
        }),
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn loads_prefixed_variables() {
        let config = WorkerConfig::from_lookup(
            "HelloWorldDVM",
            lookup(&[
                ("HelloWorldDVM_KINDS", "5050, 5100"),
                ("HelloWorldDVM_RELAYS", "wss://relay.damus.io,wss://relay.primal.net"),
                ("HelloWorldDVM_NSEC", "nsec1secret"),
                ("HelloWorldDVM_EPHEMERAL", "true"),
                ("HelloWorldDVM_POLL_INTERVAL_MS", "250"),
            ]),
        )
        .unwrap();

        assert_eq!(config.kinds.iter().map(|k| k.as_u16()).collect::<Vec<_>>(), [5050, 5100]);
        assert_eq!(config.relays.len(), 2);
        assert_eq!(config.identity.as_deref(), Some("nsec1secret"));
        assert!(config.ephemeral);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.work_timeout, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_kind_is_rejected() {
        let err = WorkerConfig::from_lookup("W", lookup(&[("W_KINDS", "5050,abc")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKind { ref value, .. } if value == "abc"));

        let err = WorkerConfig::from_lookup("W", lookup(&[("W_KINDS", "70000")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKind { .. }));
    }

    #[test]
    fn validation_requires_kinds_and_relays() {
        let config = WorkerConfig::new("w").with_relay("wss://relay.test");
        assert_eq!(config.validate(), Err(ConfigError::NoKinds));

        let config = WorkerConfig::new("w").with_kinds([5050]);
        assert_eq!(config.validate(), Err(ConfigError::NoRelays));

        let config = WorkerConfig::new("w").with_kinds([1]).with_relay("wss://relay.test");
        assert_eq!(config.validate(), Err(ConfigError::UnsupportedKind(1)));

        let config = WorkerConfig::new("w").with_kinds([5050]).with_relay("https://relay.test");
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRelayUrl(_))));

        let config = WorkerConfig::new("w")
            .with_kinds([5050])
            .with_relay("wss://relay.test")
            .with_result_publish_attempts(0);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn zero_work_timeout_is_rejected() {
        let config = WorkerConfig::from_lookup(
            "W",
            lookup(&[
                ("W_KINDS", "5050"),
                ("W_RELAYS", "wss://relay.test"),
                ("W_WORK_TIMEOUT_SECS", "0"),
            ]),
        )
        .unwrap();
        assert_eq!(config.work_timeout, Some(Duration::ZERO));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "work_timeout"
        ));

        let config = config.with_work_timeout(Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn debug_redacts_identity() {
        let config = WorkerConfig::new("w").with_identity("nsec1secret");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("nsec1secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn explorer_link_joins_paths() {
        let config = WorkerConfig::new("w").with_explorer_url("https://dvmdash.live/event/");
        assert_eq!(
            config.explorer_link("abc").as_deref(),
            Some("https://dvmdash.live/event/abc")
        );
        assert_eq!(WorkerConfig::new("w").explorer_link("abc"), None);
    }
}
