/// SIP protocol version. Only SIP/2.0 exists on the wire today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SipVersion {
    #[default]
    V2,
}

impl SipVersion {
    pub fn as_str(&self) -> &'static str {
        "SIP/2.0"
    }

    /// Parses a version token (case-insensitive).
    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("SIP/2.0") {
            Some(SipVersion::V2)
        } else {
            None
        }
    }
}

impl std::fmt::Display for SipVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
