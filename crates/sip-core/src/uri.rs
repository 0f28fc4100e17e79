// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use percent_encoding::percent_decode_str;
use smol_str::SmolStr;

use crate::{Params, TelUri};

/// Parsed representation of a SIP or SIPS URI (RFC 3261 §19.1).
///
/// The URI is stored decomposed; `Display` rebuilds the wire form from the
/// components, so mutations (setting a port, adding a parameter) are
/// reflected when the URI is serialized again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: Params,
    pub headers: Vec<(SmolStr, SmolStr)>,
}

impl SipUri {
    /// Constructs a plain `sip:` URI for the given host.
    pub fn new(host: impl Into<SmolStr>) -> Self {
        Self {
            sips: false,
            user: None,
            host: host.into(),
            port: None,
            params: Params::new(),
            headers: Vec::new(),
        }
    }

    /// Constructs a `sip:user@host` URI, the common address-of-record form.
    pub fn for_aor(user: impl Into<SmolStr>, host: impl Into<SmolStr>) -> Self {
        let mut uri = Self::new(host);
        uri.user = Some(user.into());
        uri
    }

    /// Attempts to parse a SIP or SIPS URI from the provided string.
    ///
    /// A URI usable on the wire must have a scheme and a non-empty host, so
    /// both are required here.
    pub fn parse(input: &str) -> Option<Self> {
        let (scheme, rest) = input.trim().split_once(':')?;
        let sips = scheme.eq_ignore_ascii_case("sips");
        if !sips && !scheme.eq_ignore_ascii_case("sip") {
            return None;
        }

        let (addr_part, headers_part) = match rest.split_once('?') {
            Some((addr, headers)) => (addr, Some(headers)),
            None => (rest, None),
        };

        let (base, params) = match addr_part.split_once(';') {
            Some((base, tail)) => (base.trim(), Params::parse(tail)),
            None => (addr_part.trim(), Params::new()),
        };

        let (user, host_port) = match base.rsplit_once('@') {
            Some((user, host)) => {
                let decoded = percent_decode_str(user.trim()).decode_utf8().ok()?;
                (Some(SmolStr::new(decoded.as_ref())), host.trim())
            }
            None => (None, base),
        };

        if host_port.is_empty() {
            return None;
        }

        let (host, port) = split_host_port(host_port)?;
        let host = percent_decode_str(host)
            .decode_utf8()
            .ok()?
            .to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }

        let mut headers = Vec::new();
        if let Some(headers_part) = headers_part {
            for pair in headers_part.split('&') {
                if pair.is_empty() {
                    continue;
                }
                if let Some((k, v)) = pair.split_once('=') {
                    headers.push((SmolStr::new(k.trim()), SmolStr::new(v.trim())));
                }
            }
        }

        Some(Self {
            sips,
            user,
            host: SmolStr::new(host),
            port,
            params,
            headers,
        })
    }

    /// Returns the scheme token of this URI.
    pub fn scheme(&self) -> &'static str {
        if self.sips {
            "sips"
        } else {
            "sip"
        }
    }

    /// Returns the address-of-record `user@host` form, or just the host when
    /// there is no user part.
    pub fn aor(&self) -> SmolStr {
        match &self.user {
            Some(user) => SmolStr::new(format!("{}@{}", user, self.host)),
            None => self.host.clone(),
        }
    }

    /// Returns the port, defaulting to 5060 when unset.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(5060)
    }

    /// Returns a copy stripped of parameters and headers, the form used for
    /// address-of-record comparison.
    pub fn base(&self) -> Self {
        Self {
            sips: self.sips,
            user: self.user.clone(),
            host: self.host.clone(),
            port: self.port,
            params: Params::new(),
            headers: Vec::new(),
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme())?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)?;
        for (i, (name, value)) in self.headers.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

/// Unified URI type covering the schemes the stack can carry: SIP/SIPS
/// (RFC 3261) and tel (RFC 3966).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Uri {
    Sip(SipUri),
    Tel(TelUri),
}

impl Uri {
    /// Parses a URI string, detecting the scheme.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.len() >= 4 && trimmed[..4].eq_ignore_ascii_case("tel:") {
            TelUri::parse(trimmed).map(Uri::Tel)
        } else {
            SipUri::parse(trimmed).map(Uri::Sip)
        }
    }

    pub fn is_sip(&self) -> bool {
        matches!(self, Uri::Sip(_))
    }

    pub fn as_sip(&self) -> Option<&SipUri> {
        match self {
            Uri::Sip(uri) => Some(uri),
            Uri::Tel(_) => None,
        }
    }

    pub fn as_tel(&self) -> Option<&TelUri> {
        match self {
            Uri::Tel(uri) => Some(uri),
            Uri::Sip(_) => None,
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uri::Sip(uri) => uri.fmt(f),
            Uri::Tel(uri) => uri.fmt(f),
        }
    }
}

impl From<SipUri> for Uri {
    fn from(uri: SipUri) -> Self {
        Uri::Sip(uri)
    }
}

impl From<TelUri> for Uri {
    fn from(uri: TelUri) -> Self {
        Uri::Tel(uri)
    }
}

/// Splits a `host[:port]` or bracketed IPv6 `[host]:port` string.
fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if let Some(stripped) = input.strip_prefix('[') {
        let end = stripped.find(']')?;
        let host = &stripped[..end];
        let remainder = &stripped[end + 1..];
        if let Some(port_str) = remainder.strip_prefix(':') {
            Some((host, Some(port_str.parse().ok()?)))
        } else if remainder.is_empty() {
            Some((host, None))
        } else {
            None
        }
    } else if let Some((host, port_str)) = input.rsplit_once(':') {
        // Two or more colons without brackets is an unbracketed IPv6 literal.
        if host.contains(':') {
            return None;
        }
        Some((host, Some(port_str.parse().ok()?)))
    } else {
        Some((input, None))
    }
}
