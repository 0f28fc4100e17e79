// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{
    headers::Headers, method::Method, name_addr::NameAddr, uri::Uri, version::SipVersion,
    via::ViaHeader,
};

/// First line of a SIP request: `Method SP Request-URI SP SIP-Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: Uri,
    pub version: SipVersion,
}

impl RequestLine {
    pub fn new(method: Method, uri: impl Into<Uri>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: SipVersion::V2,
        }
    }
}

/// First line of a SIP response: `SIP-Version SP Status-Code SP Reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: SipVersion,
    pub code: u16,
    pub reason: SmolStr,
}

impl StatusLine {
    pub fn new(code: u16, reason: impl Into<SmolStr>) -> Self {
        Self {
            version: SipVersion::V2,
            code,
            reason: reason.into(),
        }
    }

    /// Builds a status line with the conventional reason phrase for `code`.
    pub fn for_code(code: u16) -> Self {
        Self::new(code, reason_phrase(code))
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_final(&self) -> bool {
        self.code >= 200
    }

    pub fn is_failure(&self) -> bool {
        self.code >= 300
    }
}

/// In-memory representation of a SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub start: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.start.method
    }

    /// Returns the Call-ID header value.
    pub fn call_id(&self) -> Option<&SmolStr> {
        self.headers.get("Call-ID")
    }

    /// Parses the CSeq header into its sequence number and method.
    pub fn cseq(&self) -> Option<(u32, Method)> {
        parse_cseq(self.headers.get("CSeq")?)
    }

    /// Parses the From header as a name-addr.
    pub fn from_field(&self) -> Option<NameAddr> {
        NameAddr::parse(self.headers.get("From")?)
    }

    /// Parses the To header as a name-addr.
    pub fn to_field(&self) -> Option<NameAddr> {
        NameAddr::parse(self.headers.get("To")?)
    }

    /// Parses the topmost Via header.
    pub fn top_via(&self) -> Option<ViaHeader> {
        ViaHeader::parse(self.headers.get("Via")?)
    }
}

/// In-memory representation of a SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub start: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    pub fn code(&self) -> u16 {
        self.start.code
    }

    pub fn call_id(&self) -> Option<&SmolStr> {
        self.headers.get("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, Method)> {
        parse_cseq(self.headers.get("CSeq")?)
    }

    pub fn from_field(&self) -> Option<NameAddr> {
        NameAddr::parse(self.headers.get("From")?)
    }

    pub fn to_field(&self) -> Option<NameAddr> {
        NameAddr::parse(self.headers.get("To")?)
    }

    pub fn top_via(&self) -> Option<ViaHeader> {
        ViaHeader::parse(self.headers.get("Via")?)
    }
}

/// Either a SIP request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(res) => Some(res),
            _ => None,
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(req) => &req.headers,
            Self::Response(res) => &res.headers,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            Self::Request(req) => &req.body,
            Self::Response(res) => &res.body,
        }
    }
}

/// Parses a CSeq field value, `"314159 INVITE"` style.
pub fn parse_cseq(value: &str) -> Option<(u32, Method)> {
    let mut parts = value.split_whitespace();
    let number = parts.next()?.parse().ok()?;
    let method = Method::from_token(parts.next()?);
    Some((number, method))
}

/// Parses an Expires field value (delta seconds).
pub fn parse_expires(value: &str) -> Option<u32> {
    value.trim().parse().ok()
}

/// Conventional reason phrases for the status codes this stack emits.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        415 => "Unsupported Media Type",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        _ => match code {
            100..=199 => "Provisional",
            200..=299 => "OK",
            300..=399 => "Redirection",
            400..=499 => "Client Error",
            500..=599 => "Server Error",
            _ => "Global Failure",
        },
    }
}
