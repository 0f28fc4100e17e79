use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use sip_core::SipUri;
use sip_transaction::TimerTable;
use smol_str::SmolStr;

/// Configuration a [`Party`](crate::Party) is created with.
///
/// The identity can be supplied whole (`uri`, `aor`) or in parts
/// (`username`, `host`); each setter keeps the others consistent, so
/// `aor("a@h")` and `uri("sip:a@h")` are interchangeable and either form
/// can be read back.
#[derive(Clone, Default)]
pub struct PartyConfig {
    username: Option<SmolStr>,
    host: Option<SmolStr>,
    display_name: Option<SmolStr>,
    pub listen_addr: Option<IpAddr>,
    pub listen_port: u16,
    pub port_filter: Option<Arc<dyn Fn(u16) -> bool + Send + Sync>>,
    /// Timer overrides; `Some` makes the party build its own stack with
    /// these values instead of joining the process-shared one.
    pub timers: Option<TimerTable>,
    pub max_forwards: u32,
}

impl fmt::Debug for PartyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartyConfig")
            .field("username", &self.username)
            .field("host", &self.host)
            .field("listen_addr", &self.listen_addr)
            .field("listen_port", &self.listen_port)
            .field("max_forwards", &self.max_forwards)
            .finish()
    }
}

/// Errors raised while assembling a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    BadUri(String),
    BadAor(String),
    MissingIdentity,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::BadUri(input) => write!(f, "not a usable SIP URI: {input}"),
            ConfigError::BadAor(input) => write!(f, "not a user@host AOR: {input}"),
            ConfigError::MissingIdentity => write!(f, "party has no username/host configured"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl PartyConfig {
    pub fn new() -> Self {
        Self {
            max_forwards: 70,
            ..Self::default()
        }
    }

    /// Sets the identity from a full SIP URI string; `username` and `host`
    /// are derived from it.
    pub fn uri(mut self, uri: &str) -> Result<Self, ConfigError> {
        let parsed = SipUri::parse(uri).ok_or_else(|| ConfigError::BadUri(uri.to_owned()))?;
        self.username = parsed.user.clone();
        self.host = Some(parsed.host.clone());
        Ok(self)
    }

    /// Sets the identity from a bare `user@host` AOR; the URI is composed
    /// from it.
    pub fn aor(mut self, aor: &str) -> Result<Self, ConfigError> {
        let (user, host) = aor
            .split_once('@')
            .ok_or_else(|| ConfigError::BadAor(aor.to_owned()))?;
        if user.is_empty() || host.is_empty() {
            return Err(ConfigError::BadAor(aor.to_owned()));
        }
        self.username = Some(SmolStr::new(user));
        self.host = Some(SmolStr::new(host.to_ascii_lowercase()));
        Ok(self)
    }

    pub fn username(mut self, username: &str) -> Self {
        self.username = Some(SmolStr::new(username));
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(SmolStr::new(host.to_ascii_lowercase()));
        self
    }

    pub fn display_name(mut self, name: &str) -> Self {
        self.display_name = Some(SmolStr::new(name));
        self
    }

    pub fn listen_addr(mut self, addr: IpAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn port_filter(mut self, filter: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
        self.port_filter = Some(Arc::new(filter));
        self
    }

    /// Overrides T1/T2/T4 (test hook).
    pub fn timers(mut self, t1: Duration, t2: Duration, t4: Duration) -> Self {
        self.timers = Some(TimerTable::new(t1, t2, t4));
        self
    }

    pub fn max_forwards(mut self, max_forwards: u32) -> Self {
        self.max_forwards = max_forwards;
        self
    }

    /// The configured identity as an address-of-record string.
    pub fn aor_value(&self) -> Result<SmolStr, ConfigError> {
        match (&self.username, &self.host) {
            (Some(user), Some(host)) => Ok(SmolStr::new(format!("{user}@{host}"))),
            _ => Err(ConfigError::MissingIdentity),
        }
    }

    /// The configured identity as a SIP URI.
    pub fn uri_value(&self) -> Result<SipUri, ConfigError> {
        match (&self.username, &self.host) {
            (Some(user), Some(host)) => Ok(SipUri::for_aor(user.clone(), host.clone())),
            _ => Err(ConfigError::MissingIdentity),
        }
    }

    pub fn display_name_value(&self) -> Option<&SmolStr> {
        self.display_name.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_and_aor_are_interchangeable() {
        let via_uri = PartyConfig::new().uri("sip:alice@example.com").unwrap();
        let via_aor = PartyConfig::new().aor("alice@example.com").unwrap();
        assert_eq!(via_uri.aor_value().unwrap(), via_aor.aor_value().unwrap());
        assert_eq!(
            via_uri.uri_value().unwrap().to_string(),
            "sip:alice@example.com"
        );
    }

    #[test]
    fn parts_compose_upward() {
        let config = PartyConfig::new().username("bob").host("EXAMPLE.com");
        assert_eq!(config.aor_value().unwrap().as_str(), "bob@example.com");
    }

    #[test]
    fn missing_identity_is_an_error() {
        assert_eq!(
            PartyConfig::new().aor_value(),
            Err(ConfigError::MissingIdentity)
        );
        assert!(PartyConfig::new().aor("nope").is_err());
        assert!(PartyConfig::new().uri("mailto:x@y").is_err());
    }
}
