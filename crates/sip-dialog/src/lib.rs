// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §12 dialog state management.
//!
//! A [`Dialog`] tracks one peer-to-peer INVITE relationship: identification
//! (Call-ID plus local and remote tags), CSeq sequencing in both directions,
//! the route set, the remote target, and the Early/Confirmed/Terminated
//! lifecycle. Early dialogs are keyed by (Call-ID, local tag) until the
//! first tagged response supplies the remote half; forked 2xx answers each
//! promote to their own dialog.
//!
//! Requests and responses built here follow §12.2: in-dialog requests pick
//! the request-URI from the route set (`lr` aware), ACK and CANCEL reuse the
//! INVITE's CSeq number, and every other request increments the local CSeq
//! by one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng};
use sip_core::{
    reason_phrase, Headers, Method, NameAddr, Request, RequestLine, Response, SipUri, StatusLine,
    Uri,
};
use sip_parse::split_header_values;
use sip_fsm::{AsyncFsm, FsmError, TransitionTable};
use smol_str::SmolStr;
use tracing::debug;

/// Dialog lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogState {
    /// Created; no provisional answer seen yet.
    Initial,
    /// A tagged provisional answer exists.
    Early,
    /// The 2xx/ACK exchange happened.
    Confirmed,
    /// Ended by BYE, CANCEL or a final failure we asked for.
    Terminated,
    /// Sink state; `last_error` carries the reason.
    Error,
}

/// Inputs for the dialog state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogInput {
    EarlyAnswer,
    Confirm,
    Terminate,
    Fail,
}

/// Structured reason a dialog entered `Error` or was refused an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogError {
    /// The INVITE transaction timed out (Timer B/F).
    TransactionTimeout,
    /// The transport reported a terminal send failure.
    TransportFailure,
    /// The peer answered the INVITE with a final failure.
    Rejected(u16),
    /// An in-dialog request did not fit the dialog (bad tags, bad method).
    InvalidRequest,
    /// The remote CSeq went backwards.
    CseqRegression,
    /// A header the dialog depends on is missing on a confirmed dialog.
    MissingHeader,
    /// Illegal state transition requested.
    BadState,
}

impl fmt::Display for DialogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogError::TransactionTimeout => write!(f, "INVITE transaction timed out"),
            DialogError::TransportFailure => write!(f, "transport failure"),
            DialogError::Rejected(code) => write!(f, "peer rejected with {code}"),
            DialogError::InvalidRequest => write!(f, "request does not match dialog"),
            DialogError::CseqRegression => write!(f, "remote CSeq went backwards"),
            DialogError::MissingHeader => write!(f, "mandatory header missing"),
            DialogError::BadState => write!(f, "operation invalid in this dialog state"),
        }
    }
}

impl std::error::Error for DialogError {}

/// Full dialog identifier: (Call-ID, local tag, remote tag).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub remote_tag: SmolStr,
}

/// Identifier of an early dialog before the remote tag is learned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProvisionalDialogId {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
}

fn dialog_fsm() -> AsyncFsm<DialogState, DialogInput> {
    use DialogInput::*;
    use DialogState::*;
    AsyncFsm::spawn(
        TransitionTable::new(Initial)
            .terminal(Terminated)
            .terminal(Error)
            .on(Initial, EarlyAnswer, Early)
            .on(Initial, Confirm, Confirmed)
            .on(Initial, Terminate, Terminated)
            .on(Initial, Fail, Error)
            .on(Early, EarlyAnswer, Early)
            .on(Early, Confirm, Confirmed)
            .on(Early, Terminate, Terminated)
            .on(Early, Fail, Error)
            .on(Confirmed, Confirm, Confirmed)
            .on(Confirmed, Terminate, Terminated)
            .on(Confirmed, Fail, Error),
    )
}

struct DialogCore {
    remote_tag: Option<SmolStr>,
    remote_target: Option<SipUri>,
    route_set: Vec<SipUri>,
    local_cseq: u32,
    remote_cseq: u32,
    invite_cseq: Option<u32>,
    last_invite: Option<Request>,
    /// The 2xx a UAS keeps retransmitting until the ACK lands.
    pending_2xx: Option<Response>,
    last_error: Option<DialogError>,
    auth_attempted: bool,
}

/// One INVITE dialog, shareable across tasks.
pub struct Dialog {
    call_id: SmolStr,
    local_tag: SmolStr,
    local_uri: SipUri,
    remote_uri: SipUri,
    /// Where the peer should reach us (our Contact).
    local_target: SipUri,
    secure: bool,
    is_uac: bool,
    core: Mutex<DialogCore>,
    fsm: AsyncFsm<DialogState, DialogInput>,
}

impl fmt::Debug for Dialog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialog")
            .field("call_id", &self.call_id)
            .field("local_tag", &self.local_tag)
            .field("state", &self.state())
            .finish()
    }
}

impl Dialog {
    /// Creates the caller-side dialog before the INVITE goes out.
    pub fn new_uac(local_uri: SipUri, remote_uri: SipUri, local_target: SipUri) -> Arc<Self> {
        let secure = local_uri.sips || remote_uri.sips;
        Arc::new(Self {
            call_id: generate_call_id(&local_uri.host),
            local_tag: generate_tag(),
            local_uri,
            remote_uri,
            local_target,
            secure,
            is_uac: true,
            core: Mutex::new(DialogCore {
                remote_tag: None,
                remote_target: None,
                route_set: Vec::new(),
                local_cseq: 0,
                remote_cseq: 0,
                invite_cseq: None,
                last_invite: None,
                pending_2xx: None,
                last_error: None,
                auth_attempted: false,
            }),
            fsm: dialog_fsm(),
        })
    }

    /// Creates the callee-side dialog from a dialog-creating request.
    ///
    /// Captures the remote tag from From, the remote target from Contact,
    /// the remote CSeq, and the route set from Record-Route in the order
    /// received (§12.1.1).
    pub fn new_uas(request: &Request, local_uri: SipUri, local_target: SipUri) -> Option<Arc<Self>> {
        let call_id = request.call_id()?.clone();
        let from = request.from_field()?;
        let remote_tag = SmolStr::new(from.tag()?);
        let remote_uri = match &from.uri {
            Uri::Sip(uri) => uri.clone(),
            Uri::Tel(_) => return None,
        };
        let (remote_cseq, _) = request.cseq()?;
        let remote_target = contact_uri(&request.headers);
        let route_set = record_route_set(&request.headers, false);
        let secure = local_uri.sips || remote_uri.sips;

        Some(Arc::new(Self {
            call_id,
            local_tag: generate_tag(),
            local_uri,
            remote_uri,
            local_target,
            secure,
            is_uac: false,
            core: Mutex::new(DialogCore {
                remote_tag: Some(remote_tag),
                remote_target,
                route_set,
                local_cseq: 0,
                remote_cseq,
                invite_cseq: Some(remote_cseq),
                last_invite: Some(request.clone()),
                pending_2xx: None,
                last_error: None,
                auth_attempted: false,
            }),
            fsm: dialog_fsm(),
        }))
    }

    pub fn call_id(&self) -> &SmolStr {
        &self.call_id
    }

    pub fn local_tag(&self) -> &SmolStr {
        &self.local_tag
    }

    pub fn local_uri(&self) -> &SipUri {
        &self.local_uri
    }

    pub fn remote_uri(&self) -> &SipUri {
        &self.remote_uri
    }

    pub fn is_uac(&self) -> bool {
        self.is_uac
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn state(&self) -> DialogState {
        self.fsm.state()
    }

    pub fn last_error(&self) -> Option<DialogError> {
        self.core.lock().last_error.clone()
    }

    pub fn remote_tag(&self) -> Option<SmolStr> {
        self.core.lock().remote_tag.clone()
    }

    pub fn remote_target(&self) -> Option<SipUri> {
        self.core.lock().remote_target.clone()
    }

    pub fn route_set(&self) -> Vec<SipUri> {
        self.core.lock().route_set.clone()
    }

    pub fn provisional_id(&self) -> ProvisionalDialogId {
        ProvisionalDialogId {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
        }
    }

    /// Full identifier, available once the remote tag is learned.
    pub fn id(&self) -> Option<DialogId> {
        let remote_tag = self.core.lock().remote_tag.clone()?;
        Some(DialogId {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag,
        })
    }

    /// Waits until the dialog state satisfies `predicate`.
    pub async fn wait_for_state(
        &self,
        predicate: impl Fn(&DialogState) -> bool,
        deadline: Duration,
    ) -> Result<DialogState, FsmError> {
        self.fsm.wait_for_state(predicate, deadline).await
    }

    /// Marks the dialog failed and records why.
    pub fn fail(&self, error: DialogError) {
        {
            let mut core = self.core.lock();
            if core.last_error.is_none() {
                core.last_error = Some(error);
            }
            core.pending_2xx = None;
        }
        let _ = self.fsm.post(DialogInput::Fail);
    }

    /// Moves to Terminated (BYE completed, CANCEL completed, or local
    /// teardown).
    pub fn mark_terminated(&self) {
        self.core.lock().pending_2xx = None;
        let _ = self.fsm.post(DialogInput::Terminate);
    }

    /// UAC side: absorb a response to the dialog-creating INVITE.
    ///
    /// Learns the remote tag and target, captures the reversed Record-Route
    /// set from a 2xx (§12.1.2), and advances the state machine. Returns the
    /// state after the update.
    pub fn on_invite_response(&self, response: &Response) -> DialogState {
        let code = response.start.code;
        let to_tag = response.to_field().and_then(|to| to.tag().map(SmolStr::new));

        {
            let mut core = self.core.lock();
            if let Some(tag) = &to_tag {
                if core.remote_tag.is_none() {
                    core.remote_tag = Some(tag.clone());
                }
            }
            if let Some(contact) = contact_uri(&response.headers) {
                core.remote_target = Some(contact);
            }
            if (200..300).contains(&code) {
                let routes = record_route_set(&response.headers, true);
                if !routes.is_empty() {
                    core.route_set = routes;
                }
            }
        }

        match code {
            100..=199 => {
                if to_tag.is_some() {
                    let _ = self.fsm.post(DialogInput::EarlyAnswer);
                }
            }
            200..=299 => {
                let _ = self.fsm.post(DialogInput::Confirm);
            }
            487 => {
                // Our own CANCEL completing; an orderly end, not an error.
                self.mark_terminated();
            }
            _ => {
                self.fail(DialogError::Rejected(code));
            }
        }
        self.state()
    }

    /// Validates and absorbs an in-dialog request (UAS direction).
    pub fn on_in_dialog_request(&self, request: &Request) -> Result<(), DialogError> {
        let (cseq, method) = request.cseq().ok_or(DialogError::MissingHeader)?;
        if cseq == 0 {
            return Err(DialogError::InvalidRequest);
        }
        let mut core = self.core.lock();
        if method == Method::Ack {
            // ACK reuses the INVITE's CSeq; retransmissions are fine.
            if core.invite_cseq != Some(cseq) {
                return Err(DialogError::InvalidRequest);
            }
            core.pending_2xx = None;
        } else if method == Method::Cancel {
            if core.invite_cseq != Some(cseq) {
                return Err(DialogError::InvalidRequest);
            }
        } else {
            if cseq <= core.remote_cseq {
                return Err(DialogError::CseqRegression);
            }
            core.remote_cseq = cseq;
            if method == Method::Invite {
                core.invite_cseq = Some(cseq);
                core.last_invite = Some(request.clone());
            }
        }
        // Target refresh.
        if let Some(contact) = contact_uri(&request.headers) {
            core.remote_target = Some(contact);
        }
        Ok(())
    }

    /// Confirms the dialog after the ACK for our 2xx arrived (UAS side).
    pub fn on_ack_received(&self) {
        self.core.lock().pending_2xx = None;
        let _ = self.fsm.post(DialogInput::Confirm);
    }

    /// Records that our UAS answered 1xx/2xx so state follows §12.1.1.
    pub fn on_local_answer(&self, code: u16) {
        match code {
            100..=199 => {
                let _ = self.fsm.post(DialogInput::EarlyAnswer);
            }
            200..=299 => {
                let _ = self.fsm.post(DialogInput::Confirm);
            }
            _ => {}
        }
    }

    /// The 2xx this UAS still retransmits, if the ACK has not arrived.
    pub fn pending_2xx(&self) -> Option<Response> {
        self.core.lock().pending_2xx.clone()
    }

    pub fn set_pending_2xx(&self, response: Response) {
        self.core.lock().pending_2xx = Some(response);
    }

    /// The INVITE that created (or last refreshed) this dialog.
    pub fn last_invite(&self) -> Option<Request> {
        self.core.lock().last_invite.clone()
    }

    /// Rebuilds the pending INVITE to answer a 401/407 challenge: same
    /// Call-ID, CSeq incremented, a fresh branch, and the supplied
    /// Authorization header value. One attempt per dialog.
    pub fn reissue_invite(&self, authorization: &str) -> Result<Request, DialogError> {
        let mut core = self.core.lock();
        if core.auth_attempted {
            return Err(DialogError::BadState);
        }
        let mut invite = core.last_invite.clone().ok_or(DialogError::BadState)?;
        core.auth_attempted = true;
        core.local_cseq += 1;
        let cseq = core.local_cseq;
        core.invite_cseq = Some(cseq);

        invite.headers.set("CSeq", format!("{cseq} INVITE"));
        invite.headers.set(
            "Via",
            format!(
                "SIP/2.0/UDP {};branch={}",
                via_sent_by(&self.local_target),
                generate_branch_token()
            ),
        );
        invite.headers.set("Authorization", authorization);
        core.last_invite = Some(invite.clone());
        Ok(invite)
    }

    /// True once a credentialed retry has been sent for this dialog.
    pub fn auth_attempted(&self) -> bool {
        self.core.lock().auth_attempted
    }

    /// Creates a sibling dialog for a forked answer (RFC 3261 §12.1: every
    /// 2xx carrying a new remote tag establishes its own dialog). The fork
    /// shares our half of the identifier and the INVITE it answers; remote
    /// state is learned from the forked answer itself.
    pub fn fork(&self) -> Arc<Self> {
        let core = self.core.lock();
        Arc::new(Self {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
            local_uri: self.local_uri.clone(),
            remote_uri: self.remote_uri.clone(),
            local_target: self.local_target.clone(),
            secure: self.secure,
            is_uac: self.is_uac,
            core: Mutex::new(DialogCore {
                remote_tag: None,
                remote_target: None,
                route_set: Vec::new(),
                local_cseq: core.local_cseq,
                remote_cseq: 0,
                invite_cseq: core.invite_cseq,
                last_invite: core.last_invite.clone(),
                pending_2xx: None,
                last_error: None,
                auth_attempted: core.auth_attempted,
            }),
            fsm: dialog_fsm(),
        })
    }

    /// Builds the dialog-creating INVITE. CSeq starts at 1.
    pub fn build_invite(&self, body: Bytes, content_type: Option<&str>) -> Request {
        let mut core = self.core.lock();
        core.local_cseq += 1;
        let cseq = core.local_cseq;
        core.invite_cseq = Some(cseq);

        let target = Uri::Sip(self.remote_uri.base());
        let mut headers = self.base_headers(&core, cseq, Method::Invite);
        headers.push("Contact", NameAddr::new(Uri::Sip(self.local_target.clone())).to_string());
        if let Some(ct) = content_type {
            headers.push("Content-Type", ct);
        }
        let request = Request::new(RequestLine::new(Method::Invite, target), headers, body);
        core.last_invite = Some(request.clone());
        request
    }

    /// Builds an in-dialog request (BYE, re-INVITE, OPTIONS...). ACK and
    /// CANCEL have dedicated builders; this one increments the local CSeq.
    pub fn build_request(&self, method: Method) -> Result<Request, DialogError> {
        if method == Method::Ack || method == Method::Cancel {
            return Err(DialogError::InvalidRequest);
        }
        let mut core = self.core.lock();
        if core.remote_tag.is_none() {
            return Err(DialogError::BadState);
        }
        core.local_cseq += 1;
        let cseq = core.local_cseq;
        if method == Method::Invite {
            core.invite_cseq = Some(cseq);
        }

        let (target, routes) = self.route_target(&core);
        let mut headers = self.base_headers(&core, cseq, method.clone());
        for route in &routes {
            headers.push("Route", format!("<{route}>"));
        }
        headers.push("Contact", NameAddr::new(Uri::Sip(self.local_target.clone())).to_string());
        let request = Request::new(RequestLine::new(method.clone(), target), headers, Bytes::new());
        if method == Method::Invite {
            core.last_invite = Some(request.clone());
        }
        Ok(request)
    }

    /// Builds the ACK for a 2xx answer (§13.2.2.4): CSeq number of the
    /// INVITE with method ACK, To taken from the answer.
    pub fn build_ack(&self, response: &Response) -> Result<Request, DialogError> {
        let core = self.core.lock();
        let cseq = core.invite_cseq.ok_or(DialogError::BadState)?;
        let (target, routes) = self.route_target(&core);

        let mut headers = Headers::new();
        headers.push(
            "Via",
            format!(
                "SIP/2.0/UDP {};branch={}",
                via_sent_by(&self.local_target),
                generate_branch_token()
            ),
        );
        headers.push("Max-Forwards", "70");
        headers.push("From", self.local_name_addr().to_string());
        match response.headers.get("To") {
            Some(to) => headers.push("To", to.clone()),
            None => return Err(DialogError::MissingHeader),
        }
        headers.push("Call-ID", self.call_id.clone());
        headers.push("CSeq", format!("{cseq} ACK"));
        for route in &routes {
            headers.push("Route", format!("<{route}>"));
        }
        Ok(Request::new(
            RequestLine::new(Method::Ack, target),
            headers,
            Bytes::new(),
        ))
    }

    /// Builds a CANCEL for the pending INVITE (§9.1): same request-URI, the
    /// INVITE's top Via and CSeq number with method CANCEL.
    pub fn build_cancel(&self) -> Result<Request, DialogError> {
        let core = self.core.lock();
        let invite = core.last_invite.as_ref().ok_or(DialogError::BadState)?;
        let cseq = core.invite_cseq.ok_or(DialogError::BadState)?;

        let mut headers = Headers::new();
        match invite.headers.get("Via") {
            Some(via) => headers.push("Via", via.clone()),
            None => return Err(DialogError::MissingHeader),
        }
        headers.push("Max-Forwards", "70");
        for name in ["From", "To", "Call-ID"] {
            match invite.headers.get(name) {
                Some(value) => headers.push(name, value.clone()),
                None => return Err(DialogError::MissingHeader),
            }
        }
        headers.push("CSeq", format!("{cseq} CANCEL"));
        Ok(Request::new(
            RequestLine::new(Method::Cancel, invite.start.uri.clone()),
            headers,
            Bytes::new(),
        ))
    }

    /// Builds a response to `request` within this dialog: identification
    /// headers copied, our tag on To, Contact on dialog-establishing
    /// answers.
    pub fn build_response(&self, request: &Request, code: u16) -> Response {
        let mut headers = Headers::new();
        for via in request.headers.get_all("Via") {
            headers.push("Via", via.clone());
        }
        if let Some(from) = request.headers.get("From") {
            headers.push("From", from.clone());
        }
        if let Some(to) = request.headers.get("To") {
            let tagged = match NameAddr::parse(to) {
                Some(mut addr) if addr.tag().is_none() && code != 100 => {
                    addr.set_tag(self.local_tag.clone());
                    addr.to_string()
                }
                _ => to.to_string(),
            };
            headers.push("To", tagged);
        }
        for name in ["Call-ID", "CSeq"] {
            if let Some(value) = request.headers.get(name) {
                headers.push(name, value.clone());
            }
        }
        // Record-Route must survive into dialog-establishing answers.
        if request.start.method == Method::Invite && code >= 180 && code < 300 {
            for rr in request.headers.get_all("Record-Route") {
                headers.push("Record-Route", rr.clone());
            }
            headers.push(
                "Contact",
                NameAddr::new(Uri::Sip(self.local_target.clone())).to_string(),
            );
        }
        Response::new(
            StatusLine::new(code, reason_phrase(code)),
            headers,
            Bytes::new(),
        )
    }

    /// True when `request` belongs to this dialog: Call-ID matches and the
    /// peer's From tag equals our recorded remote tag.
    pub fn matches_request(&self, request: &Request) -> bool {
        let Some(call_id) = request.call_id() else {
            return false;
        };
        if *call_id != self.call_id {
            return false;
        }
        let from_tag = request
            .from_field()
            .and_then(|f| f.tag().map(SmolStr::new));
        let to_tag = request.to_field().and_then(|t| t.tag().map(SmolStr::new));
        let core = self.core.lock();
        match (&core.remote_tag, from_tag) {
            (Some(expected), Some(actual)) if *expected == actual => {}
            _ => return false,
        }
        match to_tag {
            Some(tag) => tag == self.local_tag,
            // Dialog-creating request retransmissions carry no To tag.
            None => true,
        }
    }

    fn local_name_addr(&self) -> NameAddr {
        NameAddr::new(Uri::Sip(self.local_uri.base())).with_tag(self.local_tag.clone())
    }

    fn remote_name_addr(&self, core: &DialogCore) -> NameAddr {
        let mut addr = NameAddr::new(Uri::Sip(self.remote_uri.base()));
        if let Some(tag) = &core.remote_tag {
            addr.set_tag(tag.clone());
        }
        addr
    }

    fn base_headers(&self, core: &DialogCore, cseq: u32, method: Method) -> Headers {
        let mut headers = Headers::new();
        headers.push(
            "Via",
            format!(
                "SIP/2.0/UDP {};branch={}",
                via_sent_by(&self.local_target),
                generate_branch_token()
            ),
        );
        headers.push("Max-Forwards", "70");
        headers.push("From", self.local_name_addr().to_string());
        headers.push("To", self.remote_name_addr(core).to_string());
        headers.push("Call-ID", self.call_id.clone());
        headers.push("CSeq", format!("{cseq} {}", method.as_str()));
        headers
    }

    /// §12.2.1.1 request targeting: a loose-routing first hop keeps the
    /// remote target in the request-URI and the whole set in Route; a
    /// strict-routing first hop becomes the request-URI, with the remainder
    /// plus the remote target as Route.
    fn route_target(&self, core: &DialogCore) -> (Uri, Vec<SipUri>) {
        let remote_target = core
            .remote_target
            .clone()
            .unwrap_or_else(|| self.remote_uri.base());
        match core.route_set.first() {
            None => (Uri::Sip(remote_target), Vec::new()),
            Some(first) if first.params.contains("lr") => {
                (Uri::Sip(remote_target), core.route_set.clone())
            }
            Some(first) => {
                let mut routes: Vec<SipUri> = core.route_set[1..].to_vec();
                routes.push(remote_target);
                (Uri::Sip(first.clone()), routes)
            }
        }
    }
}

/// Tracks every dialog a party owns, early and confirmed.
pub struct DialogManager {
    early: DashMap<ProvisionalDialogId, Arc<Dialog>>,
    confirmed: DashMap<DialogId, Arc<Dialog>>,
}

impl Default for DialogManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DialogManager {
    pub fn new() -> Self {
        Self {
            early: DashMap::new(),
            confirmed: DashMap::new(),
        }
    }

    /// Registers a dialog that has no remote tag yet.
    pub fn insert_early(&self, dialog: Arc<Dialog>) {
        self.early.insert(dialog.provisional_id(), dialog);
    }

    /// Registers a dialog under its full identifier.
    pub fn insert_confirmed(&self, dialog: Arc<Dialog>) {
        if let Some(id) = dialog.id() {
            self.confirmed.insert(id, dialog);
        }
    }

    /// Promotes an early dialog once its remote tag is known. The dialog
    /// stays in the early table as well until removal, so late provisionals
    /// from other forks still find it.
    pub fn promote(&self, dialog: &Arc<Dialog>) {
        if let Some(id) = dialog.id() {
            debug!(?id, "dialog promoted");
            self.confirmed.insert(id, dialog.clone());
        }
    }

    /// Looks a dialog up by its full identifier.
    pub fn get(&self, id: &DialogId) -> Option<Arc<Dialog>> {
        self.confirmed.get(id).map(|d| d.clone())
    }

    /// Finds the dialog a response belongs to. The full triple wins;
    /// otherwise the provisional key matches responses from any fork.
    pub fn find_for_response(&self, response: &Response) -> Option<Arc<Dialog>> {
        let call_id = response.call_id()?.clone();
        let local_tag = response
            .from_field()
            .and_then(|f| f.tag().map(SmolStr::new))?;
        if let Some(remote_tag) = response.to_field().and_then(|t| t.tag().map(SmolStr::new)) {
            let id = DialogId {
                call_id: call_id.clone(),
                local_tag: local_tag.clone(),
                remote_tag,
            };
            if let Some(dialog) = self.confirmed.get(&id) {
                return Some(dialog.clone());
            }
        }
        self.early
            .get(&ProvisionalDialogId { call_id, local_tag })
            .map(|d| d.clone())
    }

    /// Finds the dialog an in-dialog request belongs to (tags reversed:
    /// their From is our remote).
    pub fn find_for_request(&self, request: &Request) -> Option<Arc<Dialog>> {
        let call_id = request.call_id()?.clone();
        let remote_tag = request
            .from_field()
            .and_then(|f| f.tag().map(SmolStr::new))?;
        if let Some(local_tag) = request.to_field().and_then(|t| t.tag().map(SmolStr::new)) {
            let id = DialogId {
                call_id,
                local_tag,
                remote_tag,
            };
            return self.confirmed.get(&id).map(|d| d.clone());
        }
        // No To tag: could be a retransmission of the dialog-creating
        // request; scan the early table.
        self.early
            .iter()
            .find(|entry| entry.value().matches_request(request))
            .map(|entry| entry.value().clone())
    }

    pub fn remove(&self, dialog: &Arc<Dialog>) {
        self.early.remove(&dialog.provisional_id());
        if let Some(id) = dialog.id() {
            self.confirmed.remove(&id);
        }
    }

    pub fn count(&self) -> usize {
        self.confirmed.len().max(self.early.len())
    }

    /// All distinct dialogs currently tracked.
    pub fn all(&self) -> Vec<Arc<Dialog>> {
        let mut seen = Vec::new();
        let mut out: Vec<Arc<Dialog>> = Vec::new();
        for entry in self.early.iter() {
            let key = (entry.value().call_id.clone(), entry.value().local_tag.clone());
            if !seen.contains(&key) {
                seen.push(key);
                out.push(entry.value().clone());
            }
        }
        for entry in self.confirmed.iter() {
            let key = (entry.value().call_id.clone(), entry.value().local_tag.clone());
            if !seen.contains(&key) {
                seen.push(key);
                out.push(entry.value().clone());
            }
        }
        out
    }
}

/// Extracts the first Contact URI from the headers.
fn contact_uri(headers: &Headers) -> Option<SipUri> {
    let raw = headers.get("Contact")?;
    let first = split_header_values(raw).into_iter().next()?;
    let addr = NameAddr::parse(first)?;
    match addr.uri {
        Uri::Sip(uri) => Some(uri),
        Uri::Tel(_) => None,
    }
}

/// Collects the route set from Record-Route headers; a UAC reverses it, a
/// UAS keeps the received order (§12.1).
fn record_route_set(headers: &Headers, reverse: bool) -> Vec<SipUri> {
    let mut routes: Vec<SipUri> = headers
        .get_all("Record-Route")
        .flat_map(|value| split_header_values(value))
        .filter_map(|element| match NameAddr::parse(element)?.uri {
            Uri::Sip(uri) => Some(uri),
            Uri::Tel(_) => None,
        })
        .collect();
    if reverse {
        routes.reverse();
    }
    routes
}

fn via_sent_by(local_target: &SipUri) -> String {
    match local_target.port {
        Some(port) => format!("{}:{}", local_target.host, port),
        None => local_target.host.to_string(),
    }
}

/// Random 8-character tag for From/To (§19.3 requires 32 bits of entropy).
pub fn generate_tag() -> SmolStr {
    let tag: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    SmolStr::new(tag)
}

/// Random Call-ID scoped to the local host.
pub fn generate_call_id(host: &str) -> SmolStr {
    let unique: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect();
    SmolStr::new(format!("{unique}@{host}"))
}

fn generate_branch_token() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("z9hG4bK{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> SipUri {
        SipUri::parse(s).unwrap()
    }

    fn uac_dialog() -> Arc<Dialog> {
        Dialog::new_uac(
            uri("sip:alice@example.com"),
            uri("sip:bob@example.com"),
            uri("sip:alice@10.0.0.1:5060"),
        )
    }

    fn answer(dialog: &Dialog, invite: &Request, code: u16, to_tag: &str) -> Response {
        let mut headers = Headers::new();
        for via in invite.headers.get_all("Via") {
            headers.push("Via", via.clone());
        }
        headers.push("From", invite.headers.get("From").unwrap().clone());
        let to = invite.headers.get("To").unwrap();
        headers.push("To", format!("{to};tag={to_tag}"));
        headers.push("Call-ID", dialog.call_id().clone());
        headers.push("CSeq", invite.headers.get("CSeq").unwrap().clone());
        headers.push("Contact", "<sip:bob@10.0.0.2:5070>");
        Response::new(StatusLine::for_code(code), headers, Bytes::new())
    }

    #[tokio::test]
    async fn invite_then_2xx_confirms_and_learns_remote_state() {
        let dialog = uac_dialog();
        assert_eq!(dialog.state(), DialogState::Initial);

        let invite = dialog.build_invite(Bytes::new(), None);
        assert_eq!(invite.cseq(), Some((1, Method::Invite)));
        assert!(invite.from_field().unwrap().tag().is_some());
        assert!(invite.to_field().unwrap().tag().is_none());

        let ringing = answer(&dialog, &invite, 180, "remote1");
        assert_eq!(dialog.on_invite_response(&ringing), DialogState::Early);

        let ok = answer(&dialog, &invite, 200, "remote1");
        assert_eq!(dialog.on_invite_response(&ok), DialogState::Confirmed);
        assert_eq!(dialog.remote_tag().unwrap().as_str(), "remote1");
        assert_eq!(
            dialog.remote_target().unwrap().to_string(),
            "sip:bob@10.0.0.2:5070"
        );
    }

    #[tokio::test]
    async fn cseq_increases_per_request_and_ack_reuses_invite_number() {
        let dialog = uac_dialog();
        let invite = dialog.build_invite(Bytes::new(), None);
        let ok = answer(&dialog, &invite, 200, "rt");
        dialog.on_invite_response(&ok);

        let ack = dialog.build_ack(&ok).unwrap();
        assert_eq!(ack.cseq(), Some((1, Method::Ack)));
        assert_eq!(
            ack.headers.get("To").unwrap().as_str(),
            ok.headers.get("To").unwrap().as_str()
        );

        let bye = dialog.build_request(Method::Bye).unwrap();
        assert_eq!(bye.cseq(), Some((2, Method::Bye)));
        let reinvite = dialog.build_request(Method::Invite).unwrap();
        assert_eq!(reinvite.cseq(), Some((3, Method::Invite)));
    }

    #[tokio::test]
    async fn cancel_reuses_invite_cseq_and_branch() {
        let dialog = uac_dialog();
        let invite = dialog.build_invite(Bytes::new(), None);
        let cancel = dialog.build_cancel().unwrap();
        assert_eq!(cancel.cseq(), Some((1, Method::Cancel)));
        assert_eq!(
            cancel.headers.get("Via").unwrap(),
            invite.headers.get("Via").unwrap()
        );
        assert_eq!(cancel.start.uri, invite.start.uri);
        assert_eq!(
            cancel.headers.get("To").unwrap(),
            invite.headers.get("To").unwrap()
        );
    }

    #[tokio::test]
    async fn loose_route_set_keeps_remote_target_in_request_uri() {
        let dialog = uac_dialog();
        let invite = dialog.build_invite(Bytes::new(), None);
        let mut ok = answer(&dialog, &invite, 200, "rt");
        ok.headers.push("Record-Route", "<sip:p2.example.com;lr>");
        ok.headers.push("Record-Route", "<sip:p1.example.com;lr>");
        dialog.on_invite_response(&ok);

        // Reversed on the UAC: p1 first.
        assert_eq!(
            dialog
                .route_set()
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>(),
            vec!["sip:p1.example.com;lr", "sip:p2.example.com;lr"]
        );

        let bye = dialog.build_request(Method::Bye).unwrap();
        assert_eq!(bye.start.uri.to_string(), "sip:bob@10.0.0.2:5070");
        let routes: Vec<&str> = bye.headers.get_all("Route").map(|v| v.as_str()).collect();
        assert_eq!(
            routes,
            vec!["<sip:p1.example.com;lr>", "<sip:p2.example.com;lr>"]
        );
    }

    #[tokio::test]
    async fn strict_route_head_becomes_request_uri() {
        let dialog = uac_dialog();
        let invite = dialog.build_invite(Bytes::new(), None);
        let mut ok = answer(&dialog, &invite, 200, "rt");
        // Strict router records itself without lr.
        ok.headers.push("Record-Route", "<sip:strict.example.com>");
        dialog.on_invite_response(&ok);

        let bye = dialog.build_request(Method::Bye).unwrap();
        assert_eq!(bye.start.uri.to_string(), "sip:strict.example.com");
        let routes: Vec<&str> = bye.headers.get_all("Route").map(|v| v.as_str()).collect();
        assert_eq!(routes, vec!["<sip:bob@10.0.0.2:5070>"]);
    }

    #[tokio::test]
    async fn uas_dialog_records_route_set_in_received_order() {
        let caller = uac_dialog();
        let mut invite = caller.build_invite(Bytes::new(), None);
        invite.headers.push("Record-Route", "<sip:p1.example.com;lr>");
        invite.headers.push("Record-Route", "<sip:p2.example.com;lr>");
        invite.headers.push("Contact", "<sip:alice@10.0.0.1:5060>");

        let callee = Dialog::new_uas(
            &invite,
            uri("sip:bob@example.com"),
            uri("sip:bob@10.0.0.2:5070"),
        )
        .unwrap();
        assert_eq!(
            callee
                .route_set()
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>(),
            vec!["sip:p1.example.com;lr", "sip:p2.example.com;lr"]
        );
        assert!(callee.remote_tag().is_some());
        assert!(!callee.is_uac());
    }

    #[tokio::test]
    async fn remote_cseq_regression_is_rejected() {
        let caller = uac_dialog();
        let invite = caller.build_invite(Bytes::new(), None);
        let callee = Dialog::new_uas(
            &invite,
            uri("sip:bob@example.com"),
            uri("sip:bob@10.0.0.2:5070"),
        )
        .unwrap();

        let ok = callee.build_response(&invite, 200);
        caller.on_invite_response(&ok);

        let bye = caller.build_request(Method::Bye).unwrap();
        assert!(callee.on_in_dialog_request(&bye).is_ok());
        // A replayed CSeq must not move the dialog forward again.
        assert_eq!(
            callee.on_in_dialog_request(&bye),
            Err(DialogError::CseqRegression)
        );
    }

    #[tokio::test]
    async fn uas_response_carries_local_tag_and_contact() {
        let caller = uac_dialog();
        let invite = caller.build_invite(Bytes::new(), None);
        let callee = Dialog::new_uas(
            &invite,
            uri("sip:bob@example.com"),
            uri("sip:bob@10.0.0.2:5070"),
        )
        .unwrap();

        let ringing = callee.build_response(&invite, 180);
        let to = ringing.to_field().unwrap();
        assert_eq!(to.tag(), Some(callee.local_tag().as_str()));
        assert!(ringing.headers.get("Contact").is_some());

        let trying = callee.build_response(&invite, 100);
        assert!(trying.to_field().unwrap().tag().is_none());
    }

    #[tokio::test]
    async fn rejection_parks_dialog_in_error_with_reason() {
        let dialog = uac_dialog();
        let invite = dialog.build_invite(Bytes::new(), None);
        let busy = answer(&dialog, &invite, 486, "rt");
        assert_eq!(dialog.on_invite_response(&busy), DialogState::Error);
        assert_eq!(dialog.last_error(), Some(DialogError::Rejected(486)));
    }

    #[tokio::test]
    async fn four_eighty_seven_after_cancel_terminates_cleanly() {
        let dialog = uac_dialog();
        let invite = dialog.build_invite(Bytes::new(), None);
        let _ = dialog.build_cancel().unwrap();
        let terminated = answer(&dialog, &invite, 487, "rt");
        assert_eq!(dialog.on_invite_response(&terminated), DialogState::Terminated);
        assert_eq!(dialog.last_error(), None);
    }

    #[tokio::test]
    async fn forked_answers_get_their_own_dialogs() {
        let dialog = uac_dialog();
        let invite = dialog.build_invite(Bytes::new(), None);

        let first = answer(&dialog, &invite, 200, "forkA");
        dialog.on_invite_response(&first);
        assert_eq!(dialog.remote_tag().unwrap().as_str(), "forkA");

        // A second 2xx with a different tag belongs to a sibling dialog.
        let fork = dialog.fork();
        let mut second = answer(&dialog, &invite, 200, "forkB");
        second.headers.set("Contact", "<sip:bob@10.0.0.3:5080>");
        assert_eq!(fork.on_invite_response(&second), DialogState::Confirmed);
        assert_eq!(fork.remote_tag().unwrap().as_str(), "forkB");
        assert_eq!(
            fork.remote_target().unwrap().to_string(),
            "sip:bob@10.0.0.3:5080"
        );

        // Same local half, distinct full identifiers.
        assert_eq!(fork.call_id(), dialog.call_id());
        assert_eq!(fork.local_tag(), dialog.local_tag());
        assert_ne!(fork.id(), dialog.id());

        // The fork can ACK its own answer with the shared INVITE CSeq.
        let ack = fork.build_ack(&second).unwrap();
        assert_eq!(ack.cseq(), Some((1, Method::Ack)));

        let manager = DialogManager::new();
        manager.promote(&dialog);
        manager.promote(&fork);
        assert!(manager.get(&dialog.id().unwrap()).is_some());
        assert!(manager.get(&fork.id().unwrap()).is_some());
    }

    #[tokio::test]
    async fn manager_promotes_early_dialogs_per_fork() {
        let manager = DialogManager::new();
        let dialog = uac_dialog();
        let invite = dialog.build_invite(Bytes::new(), None);
        manager.insert_early(dialog.clone());

        let ringing = answer(&dialog, &invite, 180, "fork1");
        let found = manager.find_for_response(&ringing).expect("early match");
        assert!(Arc::ptr_eq(&found, &dialog));
        found.on_invite_response(&ringing);
        manager.promote(&found);

        assert!(dialog.id().is_some());
        let ok = answer(&dialog, &invite, 200, "fork1");
        let confirmed = manager.find_for_response(&ok).expect("confirmed match");
        assert!(Arc::ptr_eq(&confirmed, &dialog));
    }

    #[tokio::test]
    async fn manager_finds_dialog_for_in_dialog_request() {
        let manager = DialogManager::new();
        let caller = uac_dialog();
        let invite = caller.build_invite(Bytes::new(), None);
        let ok = answer(&caller, &invite, 200, "rt");
        caller.on_invite_response(&ok);
        manager.promote(&caller);

        // Peer's BYE: From carries their tag, To carries ours.
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP 10.0.0.2:5070;branch=z9hG4bKbye1");
        headers.push("From", "<sip:bob@example.com>;tag=rt");
        headers.push(
            "To",
            format!("<sip:alice@example.com>;tag={}", caller.local_tag()),
        );
        headers.push("Call-ID", caller.call_id().clone());
        headers.push("CSeq", "1 BYE");
        let bye = Request::new(
            RequestLine::new(Method::Bye, Uri::Sip(uri("sip:alice@10.0.0.1:5060"))),
            headers,
            Bytes::new(),
        );

        let found = manager.find_for_request(&bye).expect("request match");
        assert!(Arc::ptr_eq(&found, &caller));
        assert!(found.on_in_dialog_request(&bye).is_ok());
    }
}
