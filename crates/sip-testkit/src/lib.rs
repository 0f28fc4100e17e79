// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test harness for the stack.
//!
//! Provides canned requests/responses for parser and transaction tests, and
//! a loopback [`Agent`] wrapper that binds a real party on 127.0.0.1 with
//! compressed timers so end-to-end call flows complete in tens of
//! milliseconds.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sip_core::{Headers, Method, Request, RequestLine, Response, SipUri, StatusLine, Uri};
use sip_dialog::{Dialog, DialogState};
use sip_parse::{serialize_request, serialize_response};
use sip_party::{Party, PartyConfig, PartyDelegate, Stack, StackConfig};
use sip_transaction::TimerTable;
use tokio::sync::mpsc;

/// T1 compressed for tests; T2/T4 keep their default ratios to T1 so
/// retransmission counts match the full-speed profile.
pub const TEST_T1: Duration = Duration::from_millis(25);
pub const TEST_T2: Duration = Duration::from_millis(200);
pub const TEST_T4: Duration = Duration::from_millis(250);

/// Timer table every test agent runs with.
pub fn test_timers() -> TimerTable {
    TimerTable::new(TEST_T1, TEST_T2, TEST_T4)
}

/// Constructs a minimal OPTIONS request for the provided URI string.
pub fn build_options(uri: &str) -> Request {
    let mut headers = Headers::new();
    headers.push("Via", "SIP/2.0/UDP client.example.com:5060;branch=z9hG4bKtest");
    headers.push("From", "<sip:alice@example.com>;tag=1234");
    headers.push("To", "<sip:bob@example.com>");
    headers.push("Call-ID", "test-callid@example.com");
    headers.push("CSeq", "1 OPTIONS");
    headers.push("Max-Forwards", "70");
    headers.push("Content-Length", "0");

    Request::new(
        RequestLine::new(Method::Options, Uri::Sip(SipUri::parse(uri).unwrap())),
        headers,
        Bytes::new(),
    )
}

/// Constructs a minimal INVITE request for the provided URI string.
pub fn build_invite(uri: &str, branch: &str, call_id: &str) -> Request {
    let mut headers = Headers::new();
    headers.push(
        "Via",
        format!("SIP/2.0/UDP client.example.com:5060;branch={branch}"),
    );
    headers.push("From", "<sip:alice@example.com>;tag=1234");
    headers.push("To", "<sip:bob@example.com>");
    headers.push("Call-ID", call_id);
    headers.push("CSeq", "1 INVITE");
    headers.push("Max-Forwards", "70");
    headers.push("Contact", "<sip:alice@client.example.com:5060>");
    headers.push("Content-Length", "0");

    Request::new(
        RequestLine::new(Method::Invite, Uri::Sip(SipUri::parse(uri).unwrap())),
        headers,
        Bytes::new(),
    )
}

/// Constructs a minimal response with the given status code.
pub fn build_response(code: u16, reason: &str) -> Response {
    let mut headers = Headers::new();
    headers.push("Via", "SIP/2.0/UDP server.example.com:5060;branch=z9hG4bKtest");
    headers.push("From", "<sip:alice@example.com>;tag=1234");
    headers.push("To", "<sip:bob@example.com>;tag=4321");
    headers.push("Call-ID", "test-callid@example.com");
    headers.push("CSeq", "1 OPTIONS");
    headers.push("Content-Length", "0");

    Response::new(StatusLine::new(code, reason), headers, Bytes::new())
}

/// Serializes a request to bytes for transport-layer testing.
pub fn as_bytes(request: &Request) -> Bytes {
    serialize_request(request)
}

/// Serializes a response to bytes for transport-layer testing.
pub fn response_as_bytes(response: &Response) -> Bytes {
    serialize_response(response)
}

/// A datagram missing its Call-ID, for parse-recovery scenarios.
pub fn malformed_invite_datagram(target: &str) -> Bytes {
    Bytes::from(format!(
        "INVITE {target} SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:49000;branch=z9hG4bKbroken\r\n\
From: <sip:mallory@example.com>;tag=m1\r\n\
To: <{target}>\r\n\
CSeq: 1 INVITE\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n"
    ))
}

/// Delegate that records every event a party delivers.
pub struct RecordingDelegate {
    invites_tx: mpsc::UnboundedSender<Arc<Dialog>>,
    invites_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Dialog>>>,
    transitions: Mutex<Vec<(DialogState, DialogState)>>,
}

impl Default for RecordingDelegate {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDelegate {
    pub fn new() -> Self {
        let (invites_tx, invites_rx) = mpsc::unbounded_channel();
        Self {
            invites_tx,
            invites_rx: tokio::sync::Mutex::new(invites_rx),
            transitions: Mutex::new(Vec::new()),
        }
    }

    /// Waits for the next inbound INVITE dialog.
    pub async fn next_invite(&self, deadline: Duration) -> Option<Arc<Dialog>> {
        let mut rx = self.invites_rx.lock().await;
        tokio::time::timeout(deadline, rx.recv()).await.ok()?
    }

    /// Every state transition observed, in delivery order.
    pub fn transitions(&self) -> Vec<(DialogState, DialogState)> {
        self.transitions.lock().clone()
    }
}

#[async_trait]
impl PartyDelegate for RecordingDelegate {
    async fn on_inbound_invite(&self, dialog: Arc<Dialog>) {
        let _ = self.invites_tx.send(dialog);
    }

    async fn on_dialog_state(&self, _dialog: Arc<Dialog>, old: DialogState, new: DialogState) {
        self.transitions.lock().push((old, new));
    }
}

/// A live party bound on the loopback interface with test timers.
pub struct Agent {
    pub party: Party,
    pub stack: Arc<Stack>,
    pub delegate: Arc<RecordingDelegate>,
    pub addr: SocketAddr,
}

impl Agent {
    /// Spawns `user@127.0.0.1` on its own stack.
    pub async fn spawn(user: &str) -> anyhow::Result<Self> {
        Self::spawn_with(
            user,
            StackConfig {
                timers: Some(test_timers()),
                linger: Some(Duration::from_millis(200)),
                ..StackConfig::default()
            },
        )
        .await
    }

    /// Spawns an agent with a custom stack configuration (metrics sinks,
    /// outbound fault injection).
    pub async fn spawn_with(user: &str, mut config: StackConfig) -> anyhow::Result<Self> {
        if config.timers.is_none() {
            config.timers = Some(test_timers());
        }
        let stack = Stack::new(config);
        Self::join(user, stack).await
    }

    /// Spawns an agent on an existing stack (socket sharing scenarios).
    pub async fn join(user: &str, stack: Arc<Stack>) -> anyhow::Result<Self> {
        let party = Party::with_stack(
            PartyConfig::new()
                .aor(&format!("{user}@127.0.0.1"))?
                .listen_addr(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            stack.clone(),
        )?;
        let delegate = Arc::new(RecordingDelegate::new());
        party.set_delegate(delegate.clone());
        let addr = party.listen().await?;
        Ok(Self {
            party,
            stack,
            delegate,
            addr,
        })
    }

    /// The URI a peer dials to reach this agent.
    pub fn contact_uri(&self) -> String {
        format!(
            "sip:{}@127.0.0.1:{}",
            self.party.uri().user.as_deref().unwrap_or("anon"),
            self.addr.port()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_parse::parse_request;

    #[test]
    fn canned_messages_parse_back() {
        let invite = build_invite("sip:bob@example.com", "z9hG4bKb1", "cid-1");
        let reparsed = parse_request(&as_bytes(&invite)).expect("parse");
        assert_eq!(reparsed.start.method, Method::Invite);
        assert_eq!(reparsed.call_id().unwrap().as_str(), "cid-1");

        let options = build_options("sip:bob@example.com");
        assert!(parse_request(&as_bytes(&options)).is_ok());

        let ok = build_response(200, "OK");
        let bytes = response_as_bytes(&ok);
        let reparsed = sip_parse::parse_response(&bytes).expect("parse response");
        assert_eq!(reparsed.start.code, 200);
    }

    #[test]
    fn malformed_datagram_is_actually_malformed() {
        let raw = malformed_invite_datagram("sip:bob@127.0.0.1:5060");
        assert!(sip_parse::parse_request(&raw).is_err());
    }

    #[tokio::test]
    async fn agents_bind_distinct_ephemeral_ports() {
        let a = Agent::spawn("alice").await.unwrap();
        let b = Agent::spawn("bob").await.unwrap();
        assert_ne!(a.addr, b.addr);
        assert!(a.contact_uri().contains("alice@127.0.0.1"));
    }
}
