use std::fmt;

use smol_str::SmolStr;

use crate::{Params, Uri};

/// A `name-addr` / `addr-spec` header value: optional display name, URI and
/// trailing header parameters. Used by From, To, Contact, Route and
/// Record-Route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<SmolStr>,
    pub uri: Uri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: impl Into<Uri>) -> Self {
        Self {
            display_name: None,
            uri: uri.into(),
            params: Params::new(),
        }
    }

    /// Parses a single header field value such as
    /// `"Alice" <sip:alice@example.com>;tag=88sja8x`.
    ///
    /// In the bare `addr-spec` form (no angle brackets) everything after the
    /// first `;` is treated as header parameters, which is the conventional
    /// reading of the RFC 3261 ambiguity.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();

        let (display_name, rest) = if let Some(stripped) = input.strip_prefix('"') {
            let (name, rest) = take_quoted(stripped)?;
            (Some(SmolStr::new(name)), rest.trim_start())
        } else if let Some(lt) = input.find('<') {
            let name = input[..lt].trim();
            let display = if name.is_empty() {
                None
            } else {
                Some(SmolStr::new(name))
            };
            (display, &input[lt..])
        } else {
            (None, input)
        };

        if let Some(stripped) = rest.strip_prefix('<') {
            let end = stripped.find('>')?;
            let uri = Uri::parse(&stripped[..end])?;
            let tail = stripped[end + 1..].trim_start();
            let params = match tail.strip_prefix(';') {
                Some(tail) => Params::parse(tail),
                None => Params::new(),
            };
            Some(Self {
                display_name,
                uri,
                params,
            })
        } else {
            // addr-spec form; display names require the bracketed form
            if display_name.is_some() {
                return None;
            }
            let (spec, params) = match rest.split_once(';') {
                Some((spec, tail)) => (spec.trim(), Params::parse(tail)),
                None => (rest, Params::new()),
            };
            Some(Self {
                display_name: None,
                uri: Uri::parse(spec)?,
                params,
            })
        }
    }

    /// Returns the `tag` parameter, present on From/To of dialog messages.
    pub fn tag(&self) -> Option<&str> {
        self.params.value("tag")
    }

    pub fn set_tag(&mut self, tag: impl Into<SmolStr>) {
        self.params.set("tag", Some(tag.into()));
    }

    pub fn with_tag(mut self, tag: impl Into<SmolStr>) -> Self {
        self.set_tag(tag);
        self
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", escape_quoted(name))?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

/// Consumes a quoted string body (after the opening quote), unescaping
/// backslash pairs. Returns the text and the remainder after the closing
/// quote.
fn take_quoted(input: &str) -> Option<(String, &str)> {
    let mut out = String::new();
    let mut chars = input.char_indices();
    while let Some((idx, ch)) = chars.next() {
        match ch {
            '\\' => {
                let (_, escaped) = chars.next()?;
                out.push(escaped);
            }
            '"' => return Some((out, &input[idx + 1..])),
            _ => out.push(ch),
        }
    }
    None
}

fn escape_quoted(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_display_name_with_angle_brackets_inside() {
        let na = NameAddr::parse("\"Alice <Admin>\" <sip:alice@example.com>").unwrap();
        assert_eq!(na.display_name.as_deref(), Some("Alice <Admin>"));
        assert_eq!(na.uri.to_string(), "sip:alice@example.com");
    }

    #[test]
    fn parses_token_display_name() {
        let na = NameAddr::parse("Bob <sip:bob@biloxi.example.com>;tag=a6c85cf").unwrap();
        assert_eq!(na.display_name.as_deref(), Some("Bob"));
        assert_eq!(na.tag(), Some("a6c85cf"));
    }

    #[test]
    fn parses_bare_addr_spec_with_header_params() {
        let na = NameAddr::parse("sip:carol@chicago.example.com;tag=73413").unwrap();
        assert!(na.display_name.is_none());
        assert_eq!(na.tag(), Some("73413"));
        assert_eq!(na.uri.to_string(), "sip:carol@chicago.example.com");
    }

    #[test]
    fn escaped_quotes_round_trip() {
        let na = NameAddr::parse("\"A \\\"quoted\\\" name\" <sip:a@h>").unwrap();
        assert_eq!(na.display_name.as_deref(), Some("A \"quoted\" name"));
        let shown = na.to_string();
        assert_eq!(shown, "\"A \\\"quoted\\\" name\" <sip:a@h>");
        assert_eq!(NameAddr::parse(&shown).unwrap(), na);
    }

    #[test]
    fn display_always_brackets_the_uri() {
        let na = NameAddr::parse("sip:a@h;tag=1").unwrap();
        assert_eq!(na.to_string(), "<sip:a@h>;tag=1");
    }

    #[test]
    fn uri_params_stay_inside_brackets() {
        let na = NameAddr::parse("<sip:p.example.com;lr>;foo=bar").unwrap();
        assert!(na.uri.as_sip().unwrap().params.contains("lr"));
        assert_eq!(na.params.value("foo"), Some("bar"));
    }
}
