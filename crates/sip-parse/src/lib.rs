// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message parser and serializer.
//!
//! Parses requests and responses from UDP datagrams with RFC 3261 §25
//! framing: the head/body split at the first empty line, folded header
//! continuation lines, compact header names, and Content-Length body
//! framing. Input tolerates bare-LF line endings; output always emits CRLF.
//!
//! Failures are structured [`ParseError`] values carrying the byte offset of
//! the offence and the 4xx status a transaction layer should answer with.
//!
//! # Example
//! ```
//! use sip_parse::{parse_request, serialize_request};
//! use bytes::Bytes;
//! # let raw = b"OPTIONS sip:bob@example.com SIP/2.0\r\nVia: SIP/2.0/UDP pc33.example.com;branch=z9hG4bK776asdhds\r\nMax-Forwards: 70\r\nTo: <sip:bob@example.com>\r\nFrom: Alice <sip:alice@example.com>;tag=1928301774\r\nCall-ID: a84b4c76e66710@pc33.example.com\r\nCSeq: 314159 OPTIONS\r\nContent-Length: 0\r\n\r\n";
//! let request = parse_request(&Bytes::from_static(raw)).unwrap();
//! let bytes = serialize_request(&request);
//! assert_eq!(parse_request(&bytes).unwrap().headers, request.headers);
//! ```

use bytes::{Bytes, BytesMut};
use sip_core::{
    is_rfc3261_branch, Headers, Method, Request, RequestLine, Response, SipMessage, SipVersion,
    StatusLine, Uri, ViaHeader,
};
use smol_str::SmolStr;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest Content-Length value accepted before the datagram is rejected
/// outright. A UDP datagram cannot carry more anyway.
const MAX_CONTENT_LENGTH: usize = 64 * 1024;

/// Classified parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Grammar violation in the start line, a header line or framing.
    Malformed,
    /// A header every message must carry is absent or duplicated.
    MissingMandatory,
    /// The request-URI (or a mandatory URI-bearing header) failed to parse.
    BadUri,
    /// The body is shorter than the declared Content-Length.
    Truncated,
}

/// Structured parse error.
///
/// `suggested_status` is the response code the transaction layer should send
/// when the sender is identifiable; `recoverable` says whether enough of the
/// message survived to craft that reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub offset: usize,
    pub recoverable: bool,
    pub suggested_status: u16,
    pub detail: &'static str,
}

impl ParseError {
    fn new(kind: ParseErrorKind, offset: usize, detail: &'static str) -> Self {
        Self {
            kind,
            offset,
            recoverable: true,
            suggested_status: 400,
            detail,
        }
    }

    fn unrecoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} at byte {}: {} (suggest {})",
            self.kind, self.offset, self.detail, self.suggested_status
        )
    }
}

impl std::error::Error for ParseError {}

/// Parses a datagram into a request or response, deciding by start line.
pub fn parse_message(datagram: &Bytes) -> Result<SipMessage, ParseError> {
    let head = Head::split(datagram, DEFAULT_MAX_MESSAGE_SIZE)?;
    if head.is_response() {
        parse_response_from(head).map(SipMessage::Response)
    } else {
        parse_request_from(head).map(SipMessage::Request)
    }
}

/// Parses a SIP request from raw network bytes.
pub fn parse_request(datagram: &Bytes) -> Result<Request, ParseError> {
    parse_request_from(Head::split(datagram, DEFAULT_MAX_MESSAGE_SIZE)?)
}

/// Parses a SIP response from raw network bytes.
pub fn parse_response(datagram: &Bytes) -> Result<Response, ParseError> {
    parse_response_from(Head::split(datagram, DEFAULT_MAX_MESSAGE_SIZE)?)
}

/// Intermediate framing state: decoded head text, logical lines with their
/// byte offsets, and the raw body slice.
struct Head<'a> {
    lines: Vec<(usize, String)>,
    body: &'a [u8],
}

impl<'a> Head<'a> {
    fn split(datagram: &'a Bytes, max_size: usize) -> Result<Self, ParseError> {
        let data = datagram.as_ref();
        if data.len() > max_size {
            return Err(
                ParseError::new(ParseErrorKind::Malformed, max_size, "datagram too large")
                    .unrecoverable(),
            );
        }

        let (head_bytes, body) = split_head_body(data);
        let head = std::str::from_utf8(head_bytes).map_err(|e| {
            ParseError::new(ParseErrorKind::Malformed, e.valid_up_to(), "head is not ASCII")
                .unrecoverable()
        })?;

        // Logical lines: physical lines starting with SP/HT continue the
        // previous one (RFC 3261 §7.3.1 folding).
        let mut lines: Vec<(usize, String)> = Vec::new();
        let mut offset = 0usize;
        for raw in head.split('\n') {
            let line_offset = offset;
            offset += raw.len() + 1;
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                match lines.last_mut() {
                    Some((_, prev)) => {
                        prev.push(' ');
                        prev.push_str(line.trim());
                        continue;
                    }
                    None => {
                        return Err(ParseError::new(
                            ParseErrorKind::Malformed,
                            line_offset,
                            "continuation line before any header",
                        ))
                    }
                }
            }
            lines.push((line_offset, line.to_owned()));
        }

        if lines.is_empty() {
            return Err(
                ParseError::new(ParseErrorKind::Malformed, 0, "empty datagram").unrecoverable(),
            );
        }

        Ok(Self { lines, body })
    }

    fn is_response(&self) -> bool {
        let first = self.lines[0].1.trim_start();
        first.len() >= 7 && first[..7].eq_ignore_ascii_case("SIP/2.0")
    }
}

fn parse_request_from(head: Head<'_>) -> Result<Request, ParseError> {
    let (start_offset, start_line) = (&head.lines[0].0, head.lines[0].1.as_str());
    let (method, uri) = parse_request_line(start_line, *start_offset)?;
    let headers = parse_header_lines(&head.lines[1..])?;

    check_mandatory(&headers, *start_offset, true)?;
    check_single_valued(&headers)?;

    if let Some((_, cseq_method)) = headers.get("CSeq").and_then(|v| sip_core::parse_cseq(v)) {
        if cseq_method != method {
            return Err(ParseError::new(
                ParseErrorKind::Malformed,
                0,
                "CSeq method disagrees with request line",
            ));
        }
    } else {
        return Err(ParseError::new(
            ParseErrorKind::Malformed,
            0,
            "CSeq is unparseable",
        ));
    }

    match headers.get("Via").and_then(|v| ViaHeader::parse(v)) {
        Some(via) => {
            if let Some(branch) = via.branch() {
                if !is_rfc3261_branch(branch) {
                    return Err(ParseError::new(
                        ParseErrorKind::Malformed,
                        0,
                        "Via branch lacks the z9hG4bK cookie",
                    ));
                }
            }
        }
        None => {
            return Err(ParseError::new(
                ParseErrorKind::Malformed,
                0,
                "top Via is unparseable",
            ))
        }
    }

    let body = extract_body(head.body, &headers)?;
    Ok(Request::new(RequestLine::new(method, uri), headers, body))
}

fn parse_response_from(head: Head<'_>) -> Result<Response, ParseError> {
    let (start_offset, start_line) = (&head.lines[0].0, head.lines[0].1.as_str());
    let status = parse_status_line(start_line, *start_offset)?;
    let headers = parse_header_lines(&head.lines[1..])?;
    check_mandatory(&headers, *start_offset, false)?;
    check_single_valued(&headers)?;
    let body = extract_body(head.body, &headers)?;
    Ok(Response::new(status, headers, body))
}

/// Splits raw bytes at the first empty line. Accepts CRLF CRLF, LF LF and
/// the mixed forms a lenient peer might emit. With no empty line the whole
/// datagram is head (a headers-only message without the final blank line).
fn split_head_body(data: &[u8]) -> (&[u8], &[u8]) {
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\n' {
            let mut j = i + 1;
            if j < data.len() && data[j] == b'\r' {
                j += 1;
            }
            if j < data.len() && data[j] == b'\n' {
                return (&data[..i], &data[j + 1..]);
            }
        }
        i += 1;
    }
    (data, &[])
}

/// RFC 3261 §25.1 `token` grammar: `1*(alphanum / "-" / "." / "!" / "%" /
/// "*" / "_" / "+" / "` / "'" / "~")`.
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '!' | '%' | '*' | '_' | '+' | '`' | '\'' | '~')
}

fn parse_request_line(line: &str, offset: usize) -> Result<(Method, Uri), ParseError> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(|c: char| !c.is_whitespace()),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) = parser(line.trim())
        .map_err(|_| ParseError::new(ParseErrorKind::Malformed, offset, "bad request line"))?;

    if SipVersion::from_token(version_token.trim()).is_none() {
        return Err(ParseError::new(
            ParseErrorKind::Malformed,
            offset,
            "unsupported SIP version",
        ));
    }
    let uri = Uri::parse(uri_token).ok_or(ParseError::new(
        ParseErrorKind::BadUri,
        offset,
        "request-URI failed to parse",
    ))?;
    Ok((Method::from_token(method_token), uri))
}

fn parse_status_line(line: &str, offset: usize) -> Result<StatusLine, ParseError> {
    use nom::{
        bytes::complete::tag_no_case,
        character::complete::{space1, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>("SIP/2.0"),
        space1::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (_, _, code, _, reason)) = parser(line.trim())
        .map_err(|_| ParseError::new(ParseErrorKind::Malformed, offset, "bad status line"))?;

    if !(100..=699).contains(&code) {
        return Err(ParseError::new(
            ParseErrorKind::Malformed,
            offset,
            "status code out of range",
        ));
    }
    Ok(StatusLine::new(code, reason.trim()))
}

fn parse_header_lines(lines: &[(usize, String)]) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();
    for (offset, line) in lines {
        let (name, value) = line.split_once(':').ok_or(ParseError::new(
            ParseErrorKind::Malformed,
            *offset,
            "header line has no colon",
        ))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseError::new(
                ParseErrorKind::Malformed,
                *offset,
                "empty header name",
            ));
        }
        headers.push(canonical_header_name(name), value.trim());
    }
    Ok(headers)
}

const MANDATORY: [&str; 6] = ["Call-ID", "From", "To", "CSeq", "Via", "Max-Forwards"];

fn check_mandatory(headers: &Headers, offset: usize, request: bool) -> Result<(), ParseError> {
    for name in MANDATORY {
        // Max-Forwards is a request header; a response cannot carry it.
        if !request && name == "Max-Forwards" {
            continue;
        }
        if headers.get(name).is_none() {
            return Err(ParseError::new(
                ParseErrorKind::MissingMandatory,
                offset,
                "mandatory header absent",
            ));
        }
    }
    Ok(())
}

fn check_single_valued(headers: &Headers) -> Result<(), ParseError> {
    for name in ["Call-ID", "From", "To", "CSeq", "Max-Forwards"] {
        if headers.count(name) > 1 {
            return Err(ParseError::new(
                ParseErrorKind::MissingMandatory,
                0,
                "single-valued header repeated",
            ));
        }
    }
    Ok(())
}

/// Maps the compact header forms of RFC 3261 §7.3.3 to their long names and
/// well-known names to their canonical capitalisation.
pub fn canonical_header_name(name: &str) -> SmolStr {
    if name.len() == 1 {
        let compact = match name.as_bytes()[0].to_ascii_lowercase() {
            b'v' => Some("Via"),
            b'f' => Some("From"),
            b't' => Some("To"),
            b'm' => Some("Contact"),
            b'i' => Some("Call-ID"),
            b'l' => Some("Content-Length"),
            b'c' => Some("Content-Type"),
            _ => None,
        };
        if let Some(long) = compact {
            return SmolStr::new(long);
        }
    }
    for known in [
        "Via",
        "From",
        "To",
        "Call-ID",
        "CSeq",
        "Contact",
        "Max-Forwards",
        "Content-Length",
        "Content-Type",
        "Route",
        "Record-Route",
        "Expires",
        "Allow",
    ] {
        if name.eq_ignore_ascii_case(known) {
            return SmolStr::new(known);
        }
    }
    SmolStr::new(name)
}

/// Frames the body per Content-Length; absent a declaration, the rest of the
/// datagram is the body.
fn extract_body(body_bytes: &[u8], headers: &Headers) -> Result<Bytes, ParseError> {
    let values: Vec<&SmolStr> = headers.get_all("Content-Length").collect();

    let declared = if values.is_empty() {
        body_bytes.len()
    } else {
        let mut declared: Option<usize> = None;
        for value in &values {
            let parsed: usize = value.trim().parse().map_err(|_| {
                ParseError::new(ParseErrorKind::Malformed, 0, "Content-Length is not a number")
            })?;
            if parsed > MAX_CONTENT_LENGTH {
                return Err(ParseError::new(
                    ParseErrorKind::Malformed,
                    0,
                    "Content-Length exceeds datagram bounds",
                ));
            }
            if let Some(existing) = declared {
                if existing != parsed {
                    return Err(ParseError::new(
                        ParseErrorKind::Malformed,
                        0,
                        "conflicting Content-Length headers",
                    ));
                }
            }
            declared = Some(parsed);
        }
        declared.unwrap_or(0)
    };

    if declared > body_bytes.len() {
        return Err(ParseError::new(
            ParseErrorKind::Truncated,
            0,
            "body shorter than Content-Length",
        ));
    }
    Ok(Bytes::copy_from_slice(&body_bytes[..declared]))
}

/// Serializes a SIP request, normalising Content-Length and defaulting
/// Max-Forwards. Output is always CRLF-delimited ASCII.
pub fn serialize_request(req: &Request) -> Bytes {
    use std::fmt::Write;
    let mut buf = String::new();

    let _ = write!(
        buf,
        "{} {} {}\r\n",
        req.start.method.as_str(),
        req.start.uri,
        req.start.version.as_str()
    );

    let mut has_max_forwards = false;
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        if header.name.eq_ignore_ascii_case("Max-Forwards") {
            has_max_forwards = true;
        }
        let _ = write!(
            buf,
            "{}: {}\r\n",
            canonical_header_name(&header.name),
            header.value.trim()
        );
    }

    if !has_max_forwards {
        let _ = write!(buf, "Max-Forwards: 70\r\n");
    }
    let _ = write!(buf, "Content-Length: {}\r\n", req.body.len());
    buf.push_str("\r\n");

    let mut out = BytesMut::with_capacity(buf.len() + req.body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(req.body.as_ref());
    out.freeze()
}

/// Serializes a SIP response, normalising Content-Length.
pub fn serialize_response(res: &Response) -> Bytes {
    use std::fmt::Write;
    let mut buf = String::new();

    let _ = write!(
        buf,
        "{} {} {}\r\n",
        res.start.version.as_str(),
        res.start.code,
        res.start.reason
    );

    for header in res.headers.iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        let _ = write!(
            buf,
            "{}: {}\r\n",
            canonical_header_name(&header.name),
            header.value.trim()
        );
    }
    let _ = write!(buf, "Content-Length: {}\r\n", res.body.len());
    buf.push_str("\r\n");

    let mut out = BytesMut::with_capacity(buf.len() + res.body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(res.body.as_ref());
    out.freeze()
}

/// Splits a comma-separated multi-value header into its elements, treating
/// commas inside quoted strings or angle brackets as content.
pub fn split_header_values(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut angle_depth = 0usize;
    let mut start = 0usize;

    for (idx, ch) in raw.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => angle_depth = angle_depth.saturating_add(1),
            '>' if !in_quotes => angle_depth = angle_depth.saturating_sub(1),
            ',' if !in_quotes && angle_depth == 0 => {
                let part = raw[start..idx].trim();
                if !part.is_empty() {
                    parts.push(part);
                }
                start = idx + 1;
            }
            _ => {}
        }
    }
    let part = raw[start..].trim();
    if !part.is_empty() {
        parts.push(part);
    }
    parts
}

/// Builds the 4xx reply for a datagram that failed to parse, scraping
/// whatever identification headers it did carry. Returns `None` when the
/// datagram is a response or too damaged to answer (no request line).
pub fn reply_to_malformed(datagram: &[u8], error: &ParseError) -> Option<Response> {
    if !error.recoverable || error.suggested_status >= 500 {
        return None;
    }
    let (head_bytes, _) = split_head_body(datagram);
    let head = std::str::from_utf8(head_bytes).ok()?;
    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let start = lines.next()?.trim();
    // Never answer a response, and insist on something request-line shaped.
    if start.len() >= 7 && start[..7].eq_ignore_ascii_case("SIP/2.0") {
        return None;
    }
    if start.split_whitespace().count() != 3 || !start.ends_with("SIP/2.0") {
        return None;
    }

    let mut headers = Headers::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = canonical_header_name(name.trim());
        if ["Via", "From", "To", "Call-ID", "CSeq"]
            .iter()
            .any(|k| name.eq_ignore_ascii_case(k))
        {
            headers.push(name, value.trim());
        }
    }
    // A reply no one can correlate is useless.
    if headers.get("Via").is_none() {
        return None;
    }

    Some(Response::new(
        StatusLine::for_code(error.suggested_status),
        headers,
        Bytes::new(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sip_core::SipUri;

    fn sample_request_bytes() -> Bytes {
        Bytes::from_static(
            b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@example.com>\r\n\
From: <sip:alice@example.com>;tag=123\r\n\
Call-ID: abc123\r\n\
CSeq: 1 OPTIONS\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n",
        )
    }

    #[test]
    fn parses_basic_request() {
        let req = parse_request(&sample_request_bytes()).expect("parse");
        assert_eq!(req.start.method.as_str(), "OPTIONS");
        assert_eq!(req.start.uri.to_string(), "sip:example.com");
        assert_eq!(req.call_id().unwrap().as_str(), "abc123");
        assert_eq!(req.cseq(), Some((1, Method::Options)));
    }

    #[test]
    fn tolerates_bare_lf_line_endings() {
        let raw = Bytes::from_static(
            b"OPTIONS sip:example.com SIP/2.0\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\n\
To: <sip:bob@example.com>\n\
From: <sip:alice@example.com>;tag=123\n\
Call-ID: abc123\n\
CSeq: 1 OPTIONS\n\
Max-Forwards: 70\n\
Content-Length: 4\n\nbody",
        );
        let req = parse_request(&raw).expect("parse");
        assert_eq!(req.body.as_ref(), b"body");
    }

    #[test]
    fn unfolds_continuation_lines() {
        let raw = Bytes::from_static(
            b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@example.com>\r\n\
From: <sip:alice@example.com>\r\n\
\x20;tag=123\r\n\
Call-ID: abc123\r\n\
CSeq: 1 OPTIONS\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n",
        );
        let req = parse_request(&raw).expect("parse");
        assert_eq!(
            req.headers.get("From").unwrap().as_str(),
            "<sip:alice@example.com> ;tag=123"
        );
        assert_eq!(req.from_field().unwrap().tag(), Some("123"));
    }

    #[test]
    fn missing_call_id_is_structured() {
        let raw = Bytes::from_static(
            b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@example.com>\r\n\
From: <sip:alice@example.com>;tag=1\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n",
        );
        let err = parse_request(&raw).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MissingMandatory);
        assert_eq!(err.suggested_status, 400);
        assert!(err.recoverable);
    }

    #[test]
    fn missing_max_forwards_is_structured() {
        let raw = Bytes::from_static(
            b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@example.com>\r\n\
From: <sip:alice@example.com>;tag=1\r\n\
Call-ID: abc\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n",
        );
        let err = parse_request(&raw).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MissingMandatory);
        assert_eq!(err.suggested_status, 400);
        assert!(err.recoverable);
    }

    #[test]
    fn responses_do_not_require_max_forwards() {
        let raw = Bytes::from_static(
            b"SIP/2.0 180 Ringing\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@example.com>;tag=321\r\n\
From: <sip:alice@example.com>;tag=123\r\n\
Call-ID: abc\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n",
        );
        assert!(parse_response(&raw).is_ok());
    }

    #[test]
    fn truncated_body_is_classified() {
        let raw = Bytes::from_static(
            b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@example.com>\r\n\
From: <sip:alice@example.com>;tag=1\r\n\
Call-ID: abc\r\n\
CSeq: 1 INVITE\r\n\
Max-Forwards: 70\r\n\
Content-Length: 99\r\n\r\nshort",
        );
        let err = parse_request(&raw).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Truncated);
    }

    #[test]
    fn bad_request_uri_is_classified() {
        let raw = Bytes::from_static(
            b"INVITE bob SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@example.com>\r\n\
From: <sip:alice@example.com>;tag=1\r\n\
Call-ID: abc\r\n\
CSeq: 1 INVITE\r\n\r\n",
        );
        let err = parse_request(&raw).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::BadUri);
    }

    #[test]
    fn compact_names_are_canonicalised() {
        let raw = Bytes::from_static(
            b"INVITE sip:bob@example.com SIP/2.0\r\n\
v: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
f: <sip:alice@example.com>;tag=1\r\n\
t: <sip:bob@example.com>\r\n\
i: abc\r\n\
CSeq: 1 INVITE\r\n\
Max-Forwards: 70\r\n\
m: <sip:alice@host>\r\n\
c: application/sdp\r\n\
l: 2\r\n\r\nv=",
        );
        let req = parse_request(&raw).expect("parse");
        for name in ["Via", "From", "To", "Call-ID", "Contact", "Content-Type"] {
            assert!(
                req.headers.iter().any(|h| h.name == name),
                "{name} not canonicalised"
            );
        }
        assert_eq!(req.body.as_ref(), b"v=");
    }

    #[test]
    fn cseq_method_mismatch_rejected() {
        let raw = Bytes::from_static(
            b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@example.com>\r\n\
From: <sip:alice@example.com>;tag=1\r\n\
Call-ID: abc\r\n\
CSeq: 1 BYE\r\n\
Max-Forwards: 70\r\n\r\n",
        );
        assert!(parse_request(&raw).is_err());
    }

    #[test]
    fn rejects_pre_rfc3261_branch() {
        let raw = Bytes::from_static(
            b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=badbranch\r\n\
To: <sip:b@h>\r\n\
From: <sip:a@h>;tag=1\r\n\
Call-ID: abc\r\n\
CSeq: 1 OPTIONS\r\n\
Max-Forwards: 70\r\n\r\n",
        );
        assert!(parse_request(&raw).is_err());
    }

    #[test]
    fn parses_response_and_repeated_record_route() {
        let raw = Bytes::from_static(
            b"SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:bob@example.com>;tag=321\r\n\
From: <sip:alice@example.com>;tag=123\r\n\
Call-ID: abc123\r\n\
CSeq: 1 INVITE\r\n\
Record-Route: <sip:proxy1>\r\n\
Record-Route: <sip:proxy2>\r\n\
Content-Length: 5\r\n\r\nhello",
        );
        let res = parse_response(&raw).expect("parse");
        assert_eq!(res.start.code, 200);
        let rr: Vec<&str> = res.headers.get_all("Record-Route").map(|v| v.as_str()).collect();
        assert_eq!(rr, vec!["<sip:proxy1>", "<sip:proxy2>"]);
        assert_eq!(res.body.as_ref(), b"hello");
    }

    #[test]
    fn body_truncated_to_content_length() {
        let raw = Bytes::from_static(
            b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:b@h>\r\n\
From: <sip:a@h>;tag=1\r\n\
Call-ID: abc\r\n\
CSeq: 1 OPTIONS\r\n\
Max-Forwards: 70\r\n\
Content-Length: 4\r\n\r\nbodyEXTRA",
        );
        let req = parse_request(&raw).expect("parse");
        assert_eq!(req.body.as_ref(), b"body");
    }

    #[test]
    fn conflicting_content_lengths_rejected() {
        let raw = Bytes::from_static(
            b"OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host;branch=z9hG4bKx\r\n\
To: <sip:b@h>\r\n\
From: <sip:a@h>;tag=1\r\n\
Call-ID: abc\r\n\
CSeq: 1 OPTIONS\r\n\
Max-Forwards: 70\r\n\
Content-Length: 4\r\n\
Content-Length: 5\r\n\r\nbody!",
        );
        assert!(parse_request(&raw).is_err());
    }

    #[test]
    fn serializer_recomputes_content_length_and_max_forwards() {
        let uri = SipUri::parse("sip:example.com").unwrap();
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP host;branch=z9hG4bKx");
        headers.push("To", "<sip:b@h>");
        headers.push("From", "<sip:a@h>;tag=1");
        headers.push("Call-ID", "abc");
        headers.push("CSeq", "1 OPTIONS");
        headers.push("Content-Length", "999");

        let req = Request::new(
            RequestLine::new(Method::Options, uri),
            headers,
            Bytes::from_static(b"hello"),
        );
        let bytes = serialize_request(&req);
        let text = std::str::from_utf8(&bytes).unwrap();
        assert_eq!(text.matches("Content-Length").count(), 1);
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Max-Forwards: 70\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn split_respects_quotes_and_angles() {
        let parts = split_header_values(
            "\"Smith, John\" <sip:john@h>, <sip:p1;lr>, sip:plain@h;q=0.5",
        );
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "\"Smith, John\" <sip:john@h>");
        assert_eq!(parts[1], "<sip:p1;lr>");
    }

    #[test]
    fn split_ignores_escaped_quote() {
        let parts = split_header_values(r#""a\",b" <sip:x@h>, <sip:y@h>"#);
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn malformed_reply_carries_identification() {
        let raw = b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP host:5070;branch=z9hG4bKx\r\n\
From: <sip:alice@example.com>;tag=1\r\n\
To: <sip:bob@example.com>\r\n\
CSeq: 1 INVITE\r\n\r\n";
        let err = parse_request(&Bytes::from_static(raw)).unwrap_err();
        let reply = reply_to_malformed(raw, &err).expect("reply");
        assert_eq!(reply.start.code, 400);
        assert!(reply.headers.get("Via").is_some());
        assert!(reply.headers.get("Call-ID").is_none());
    }

    #[test]
    fn malformed_reply_never_answers_responses() {
        let raw = b"SIP/2.0 999 Nope\r\nVia: SIP/2.0/UDP h;branch=z9hG4bKx\r\n\r\n";
        let err = parse_message(&Bytes::from_static(&raw[..])).unwrap_err();
        assert!(reply_to_malformed(raw, &err).is_none());
    }

    #[test]
    fn message_dispatches_on_start_line() {
        assert!(parse_message(&sample_request_bytes()).unwrap().is_request());
    }

    proptest! {
        #[test]
        fn roundtrip_request(
            method_idx in 0usize..5,
            user in "[a-z]{1,8}",
            host in "[a-z]{1,8}",
            body in "[ -~]{0,32}"
        ) {
            let methods = [Method::Options, Method::Invite, Method::Bye, Method::Cancel, Method::Ack];
            let method = methods[method_idx].clone();
            let uri = SipUri::parse(&format!("sip:{user}@{host}.example.com")).unwrap();
            let mut headers = Headers::new();
            headers.push("Via", "SIP/2.0/UDP host:5060;branch=z9hG4bKabc123");
            headers.push("To", format!("<sip:{user}@{host}.example.com>"));
            headers.push("From", "<sip:caller@example.com>;tag=fgh");
            headers.push("Call-ID", format!("{user}@{host}"));
            headers.push("CSeq", format!("1 {}", method.as_str()));

            let req = Request::new(
                RequestLine::new(method.clone(), uri),
                headers,
                Bytes::from(body.clone().into_bytes()),
            );
            let bytes = serialize_request(&req);
            let reparsed = parse_request(&bytes).expect("reparse");
            prop_assert_eq!(reparsed.start.method, method);
            prop_assert_eq!(reparsed.body.as_ref(), body.as_bytes());
            for name in ["Via", "To", "From", "Call-ID", "CSeq"] {
                prop_assert_eq!(
                    req.headers.get(name).map(|v| v.as_str()),
                    reparsed.headers.get(name).map(|v| v.as_str())
                );
            }
        }

        #[test]
        fn roundtrip_response(code in 100u16..700, reason in "[A-Za-z ]{1,12}") {
            prop_assume!(reason.trim() == reason && !reason.is_empty());
            let mut headers = Headers::new();
            headers.push("Via", "SIP/2.0/UDP host;branch=z9hG4bKabc");
            headers.push("To", "<sip:b@h>;tag=1");
            headers.push("From", "<sip:a@h>;tag=2");
            headers.push("Call-ID", "cid");
            headers.push("CSeq", "1 INVITE");
            let res = Response::new(StatusLine::new(code, reason.as_str()), headers, Bytes::new());
            let reparsed = parse_response(&serialize_response(&res)).expect("reparse");
            prop_assert_eq!(reparsed.start.code, code);
            prop_assert_eq!(reparsed.start.reason.as_str(), reason.as_str());
        }
    }
}
