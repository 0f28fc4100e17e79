// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types: messages, headers, URIs and typed header views.
//!
//! This crate carries the data model shared by the rest of the stack:
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`]
//! - **URIs**: [`SipUri`] (sip/sips), [`TelUri`] (RFC 3966), [`Uri`]
//! - **Headers**: the order-preserving [`Headers`] container, ordered
//!   case-preserving [`Params`], and the typed [`NameAddr`] / [`ViaHeader`]
//!   views parsed on demand
//! - **Methods**: the [`Method`] enum
//!
//! Header and parameter strings use [`SmolStr`](smol_str::SmolStr); message
//! bodies are opaque [`Bytes`](bytes::Bytes). Wire parsing and serialization
//! live in `sip-parse`.

pub mod headers;
pub mod method;
pub mod msg;
pub mod name_addr;
pub mod params;
pub mod tel_uri;
pub mod uri;
pub mod version;
pub mod via;

pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{
    parse_cseq, parse_expires, reason_phrase, Request, RequestLine, Response, SipMessage,
    StatusLine,
};
pub use name_addr::NameAddr;
pub use params::{Param, Params};
pub use tel_uri::TelUri;
pub use uri::{SipUri, Uri};
pub use version::SipVersion;
pub use via::{is_rfc3261_branch, ViaHeader};
