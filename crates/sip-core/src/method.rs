use smol_str::SmolStr;

/// SIP request methods understood by the stack.
///
/// Extension methods are preserved verbatim in `Unknown` so they survive a
/// parse/serialize round trip even though no state machine handles them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Register,
    Unknown(SmolStr),
}

impl Method {
    /// Returns the canonical uppercase token for this method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Register => "REGISTER",
            Method::Unknown(token) => token.as_str(),
        }
    }

    /// Parses a method token, returning `Unknown` for extension methods.
    pub fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("INVITE") {
            Method::Invite
        } else if token.eq_ignore_ascii_case("ACK") {
            Method::Ack
        } else if token.eq_ignore_ascii_case("BYE") {
            Method::Bye
        } else if token.eq_ignore_ascii_case("CANCEL") {
            Method::Cancel
        } else if token.eq_ignore_ascii_case("OPTIONS") {
            Method::Options
        } else if token.eq_ignore_ascii_case("REGISTER") {
            Method::Register
        } else {
            Method::Unknown(SmolStr::new(token.to_ascii_uppercase()))
        }
    }

    /// Returns true for methods that create or continue an INVITE dialog.
    pub fn is_invite(&self) -> bool {
        matches!(self, Method::Invite)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
