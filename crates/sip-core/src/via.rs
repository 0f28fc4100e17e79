use std::fmt;

use smol_str::SmolStr;

use crate::Params;

/// Typed view of a Via header field value (RFC 3261 §20.42), e.g.
/// `SIP/2.0/UDP pc33.example.com:5060;branch=z9hG4bK776asdhds`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    pub transport: SmolStr,
    pub sent_by: SmolStr,
    pub params: Params,
}

impl ViaHeader {
    /// Builds a UDP Via for the given sent-by with the supplied branch.
    pub fn udp(sent_by: impl Into<SmolStr>, branch: impl Into<SmolStr>) -> Self {
        let mut params = Params::new();
        params.set("branch", Some(branch.into()));
        Self {
            transport: SmolStr::new("UDP"),
            sent_by: sent_by.into(),
            params,
        }
    }

    /// Parses a Via field value.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (proto, rest) = split_token(input)?;

        let mut pieces = proto.splitn(3, '/');
        let name = pieces.next()?.trim();
        let version = pieces.next()?.trim();
        let transport = pieces.next()?.trim();
        if !name.eq_ignore_ascii_case("SIP") || version != "2.0" || transport.is_empty() {
            return None;
        }

        let rest = rest.trim_start();
        let (sent_by, params) = match rest.split_once(';') {
            Some((sent_by, tail)) => (sent_by.trim(), Params::parse(tail)),
            None => (rest, Params::new()),
        };
        if sent_by.is_empty() {
            return None;
        }

        Some(Self {
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            sent_by: SmolStr::new(sent_by),
            params,
        })
    }

    /// Returns the branch parameter, which identifies the transaction.
    pub fn branch(&self) -> Option<&str> {
        self.params.value("branch")
    }

    /// Returns the host portion of sent-by.
    pub fn host(&self) -> &str {
        match self.sent_by.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => &self.sent_by,
        }
    }

    /// Returns the port portion of sent-by, if present.
    pub fn port(&self) -> Option<u16> {
        let (_, port) = self.sent_by.rsplit_once(':')?;
        port.parse().ok()
    }
}

/// Splits the leading `SIP/2.0/<transport>` token from the remainder.
fn split_token(input: &str) -> Option<(&str, &str)> {
    let end = input.find(|c: char| c.is_ascii_whitespace())?;
    Some((&input[..end], &input[end..]))
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}{}", self.transport, self.sent_by, self.params)
    }
}

/// Returns true if the branch carries the RFC 3261 magic cookie.
pub fn is_rfc3261_branch(branch: &str) -> bool {
    branch.len() > 7 && branch.starts_with("z9hG4bK")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_branch_and_sent_by() {
        let via = ViaHeader::parse("SIP/2.0/UDP pc33.example.com;branch=z9hG4bK776asdhds").unwrap();
        assert_eq!(via.transport.as_str(), "UDP");
        assert_eq!(via.sent_by.as_str(), "pc33.example.com");
        assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
        assert_eq!(via.port(), None);
    }

    #[test]
    fn sent_by_port_splits() {
        let via = ViaHeader::parse("SIP/2.0/udp 10.0.0.1:5070;branch=z9hG4bKx;received=1.2.3.4")
            .unwrap();
        assert_eq!(via.host(), "10.0.0.1");
        assert_eq!(via.port(), Some(5070));
        assert_eq!(via.params.value("received"), Some("1.2.3.4"));
    }

    #[test]
    fn display_round_trips() {
        let text = "SIP/2.0/UDP host:5060;branch=z9hG4bKabc;rport";
        let via = ViaHeader::parse(text).unwrap();
        assert_eq!(via.to_string(), text);
    }

    #[test]
    fn rejects_non_sip_protocol() {
        assert!(ViaHeader::parse("HTTP/1.1/TCP host").is_none());
        assert!(ViaHeader::parse("SIP/2.0/ host").is_none());
    }

    #[test]
    fn magic_cookie_check() {
        assert!(is_rfc3261_branch("z9hG4bKnashds8"));
        assert!(!is_rfc3261_branch("z9hG4bK"));
        assert!(!is_rfc3261_branch("1234"));
    }
}
