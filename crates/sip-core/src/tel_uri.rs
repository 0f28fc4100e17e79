use std::fmt;

use smol_str::SmolStr;

use crate::Params;

/// A tel URI per RFC 3966, e.g. `tel:+1-555-123-4567`.
///
/// The subscriber number is stored with visual separators removed; the raw
/// digits (and a leading `+` for global numbers) are what comparison and
/// routing care about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TelUri {
    pub number: SmolStr,
    pub is_global: bool,
    pub params: Params,
}

impl TelUri {
    pub fn parse(input: &str) -> Option<Self> {
        let rest = input.trim().strip_prefix("tel:").or_else(|| {
            input
                .trim()
                .strip_prefix("TEL:")
                .or_else(|| input.trim().strip_prefix("Tel:"))
        })?;

        let (number_part, params) = match rest.split_once(';') {
            Some((number, tail)) => (number, Params::parse(tail)),
            None => (rest, Params::new()),
        };

        let is_global = number_part.starts_with('+');
        let digits: String = number_part
            .chars()
            .filter(|c| !matches!(c, '-' | '.' | '(' | ')' | ' '))
            .collect();
        let body = if is_global { &digits[1..] } else { &digits[..] };
        if body.is_empty() || !body.chars().all(|c| c.is_ascii_hexdigit() || c == '*' || c == '#')
        {
            return None;
        }
        // Local numbers need a phone-context to be routable.
        if !is_global && !params.contains("phone-context") {
            return None;
        }

        Some(Self {
            number: SmolStr::new(digits),
            is_global,
            params,
        })
    }
}

impl fmt::Display for TelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tel:{}{}", self.number, self.params)
    }
}
