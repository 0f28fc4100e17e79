// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §17 transaction layer.
//!
//! Four state machines (INVITE/non-INVITE x client/server) drive
//! retransmission over UDP, owned and demultiplexed by the
//! [`TransactionManager`]. Timers run on the shared `sip-timer` wheel; bytes
//! leave through a [`TransportDispatcher`] implemented by the transport
//! layer; parsed messages are delivered upward to the transaction user.

use rand::{distributions::Alphanumeric, Rng};
use sip_core::{reason_phrase, Headers, Method, Request, Response, StatusLine};
use smol_str::SmolStr;

pub mod fsm;
pub mod manager;
pub mod timers;

pub use fsm::{
    ClientInviteEvent, ClientInviteFsm, ClientInviteState, ClientNonInviteEvent,
    ClientNonInviteFsm, ClientNonInviteState, ServerInviteEvent, ServerInviteFsm,
    ServerInviteState, ServerNonInviteEvent, ServerNonInviteFsm, ServerNonInviteState, TxAction,
};
pub use manager::{
    ClientTransactionUser, ServerTransactionHandle, TransactionManager, TransactionUpcall,
    TransportContext, TransportDispatcher,
};
pub use timers::TimerTable;

/// Timers named by RFC 3261 §17.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
}

/// Which side of the transaction this stack plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Unique transaction identifier: the top Via's branch parameter and
/// sent-by, plus the method and direction.
///
/// CANCEL keeps its own method here, so a CANCEL server transaction is
/// distinct from the INVITE it targets even though both share a branch; the
/// manager strips the method to find the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub sent_by: SmolStr,
    pub method: Method,
    pub role: TransactionRole,
}

impl TransactionKey {
    /// Derives the key for an inbound or outbound request.
    pub fn from_request(req: &Request, role: TransactionRole) -> Option<Self> {
        let via = req.top_via()?;
        let branch = SmolStr::new(via.branch()?);
        // ACK matches the INVITE transaction it acknowledges.
        let method = match &req.start.method {
            Method::Ack => Method::Invite,
            other => other.clone(),
        };
        Some(Self {
            branch,
            sent_by: via.sent_by,
            method,
            role,
        })
    }

    /// Derives the key a response belongs to; the method comes from CSeq.
    pub fn from_response(resp: &Response, role: TransactionRole) -> Option<Self> {
        let via = resp.top_via()?;
        let branch = SmolStr::new(via.branch()?);
        let (_, method) = resp.cseq()?;
        Some(Self {
            branch,
            sent_by: via.sent_by,
            method,
            role,
        })
    }

    /// The key of the INVITE transaction sharing this key's branch. Used to
    /// match CANCEL and ACK against their target.
    pub fn as_invite(&self) -> Self {
        Self {
            branch: self.branch.clone(),
            sent_by: self.sent_by.clone(),
            method: Method::Invite,
            role: self.role,
        }
    }
}

/// Generates a new branch identifier carrying the RFC 3261 magic cookie.
pub fn generate_branch() -> SmolStr {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("z9hG4bK{suffix}"))
}

/// Builds a response to `req` with the given status, copying the headers a
/// response must echo: every Via, then From, To, Call-ID and CSeq. The To
/// tag is untouched; dialog-aware layers add their own.
pub fn response_for(req: &Request, code: u16) -> Response {
    let mut headers = Headers::new();
    for via in req.headers.get_all("Via") {
        headers.push("Via", via.clone());
    }
    for name in ["From", "To", "Call-ID", "CSeq"] {
        if let Some(value) = req.headers.get(name) {
            headers.push(name, value.clone());
        }
    }
    Response::new(
        StatusLine::new(code, reason_phrase(code)),
        headers,
        bytes::Bytes::new(),
    )
}

/// Builds the ACK the transaction layer owes for a non-2xx final response
/// (RFC 3261 §17.1.1.3): same request-URI, Call-ID, From, CSeq number and
/// top Via as the INVITE, To copied from the answer, method ACK.
pub fn build_non_2xx_ack(invite: &Request, response: &Response) -> Request {
    let mut headers = Headers::new();
    if let Some(via) = invite.headers.get("Via") {
        headers.push("Via", via.clone());
    }
    for name in ["From", "Call-ID", "Max-Forwards"] {
        if let Some(value) = invite.headers.get(name) {
            headers.push(name, value.clone());
        }
    }
    if let Some(to) = response.headers.get("To") {
        headers.push("To", to.clone());
    }
    if let Some((number, _)) = invite.cseq() {
        headers.push("CSeq", format!("{number} ACK"));
    }
    if let Some(route) = invite.headers.get("Route") {
        headers.push("Route", route.clone());
    }
    Request::new(
        sip_core::RequestLine::new(Method::Ack, invite.start.uri.clone()),
        headers,
        bytes::Bytes::new(),
    )
}
