// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The user-facing party API.
//!
//! A [`Party`] is one endpoint identity (`sip:user@host`) able to place and
//! receive INVITE dialogs. Parties share a process-scoped [`Stack`] (the
//! UDP transport, the transaction manager and the retry scheduler), so any
//! number of parties can listen on one socket; inbound dialog-creating
//! requests are routed to their party by request-URI address-of-record.
//!
//! # Example
//! ```no_run
//! use sip_party::{Party, PartyConfig};
//! # async fn example() -> anyhow::Result<()> {
//! let alice = Party::new(PartyConfig::new().aor("alice@127.0.0.1")?)?;
//! alice.listen().await?;
//! let dialog = alice.invite("sip:bob@127.0.0.1:5060").await?;
//! dialog
//!     .wait_for_state(|s| *s == sip_dialog::DialogState::Confirmed, std::time::Duration::from_secs(5))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use sip_core::{Method, Request, Response, SipUri, Uri};
use sip_dialog::{
    generate_call_id, generate_tag, Dialog, DialogError, DialogId, DialogManager, DialogState,
};
use sip_observe::{StackMetrics, TracingStackMetrics};
use sip_parse::{parse_message, reply_to_malformed, serialize_request, serialize_response};
use sip_timer::RetryScheduler;
use sip_transaction::{
    generate_branch, response_for, ClientTransactionUser, ServerTransactionHandle, TimerTable,
    TransactionKey, TransactionManager, TransactionUpcall, TransportContext, TransportDispatcher,
};
use sip_transport::{InboundPacket, ListenSpec, SocketBinding, TransportError, UdpTransport};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod collab;
mod config;

pub use collab::{AuthorizationProvider, PartyDelegate, SessionDescription};
pub use config::{ConfigError, PartyConfig};
pub use sip_dialog::{DialogState as State, ProvisionalDialogId};

const ALLOW: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS";

/// Drops an outbound datagram when it returns false. Test fault injection.
pub type OutboundFilter = Arc<dyn Fn(&TransportContext, &Bytes) -> bool + Send + Sync>;

/// Knobs for building an isolated [`Stack`].
#[derive(Clone, Default)]
pub struct StackConfig {
    pub timers: Option<TimerTable>,
    pub linger: Option<Duration>,
    pub metrics: Option<Arc<dyn StackMetrics>>,
    pub outbound_filter: Option<OutboundFilter>,
}

/// The process-scoped plumbing every party shares: socket pool, transaction
/// manager, retry scheduler and the AOR registry.
pub struct Stack {
    transport: Arc<UdpTransport>,
    transactions: TransactionManager,
    scheduler: Arc<RetryScheduler>,
    timer_table: TimerTable,
    /// AOR -> party, weakly held: parties own the stack, never the reverse.
    registry: DashMap<SmolStr, Weak<PartyCore>>,
    pending_invites: DashMap<TransactionKey, PendingInvite>,
    metrics: Arc<dyn StackMetrics>,
}

struct PendingInvite {
    party: Arc<PartyCore>,
    dialog: Arc<Dialog>,
    request: Request,
    handle: ServerTransactionHandle,
    ctx: TransportContext,
}

static SHARED_STACK: OnceCell<Arc<Stack>> = OnceCell::new();

impl Stack {
    /// Builds an isolated stack. Tests use this; production code usually
    /// goes through [`Stack::shared`].
    pub fn new(config: StackConfig) -> Arc<Self> {
        let metrics: Arc<dyn StackMetrics> = config
            .metrics
            .unwrap_or_else(|| Arc::new(TracingStackMetrics));
        let linger = config.linger.unwrap_or(Duration::from_secs(5));
        let timer_table = config.timers.unwrap_or_default();

        let (transport, inbound_rx) = UdpTransport::with_metrics(linger, metrics.clone());
        let scheduler = RetryScheduler::new();
        let dispatcher = Arc::new(UdpDispatcher {
            transport: transport.clone(),
            outbound_filter: config.outbound_filter,
        });
        let transactions = TransactionManager::with_metrics(
            dispatcher,
            scheduler.clone(),
            timer_table,
            metrics.clone(),
        );

        let stack = Arc::new(Self {
            transport,
            transactions: transactions.clone(),
            scheduler,
            timer_table,
            registry: DashMap::new(),
            pending_invites: DashMap::new(),
            metrics,
        });
        transactions.set_upcall(Arc::new(StackUpcall(Arc::downgrade(&stack))));
        stack.spawn_inbound_loop(inbound_rx);
        stack
    }

    /// The process-shared stack, created with defaults on first use. Must be
    /// first called from a long-lived tokio runtime.
    pub fn shared() -> Arc<Self> {
        SHARED_STACK
            .get_or_init(|| Stack::new(StackConfig::default()))
            .clone()
    }

    pub fn transport(&self) -> &Arc<UdpTransport> {
        &self.transport
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }

    pub fn timer_table(&self) -> TimerTable {
        self.timer_table
    }

    fn spawn_inbound_loop(self: &Arc<Self>, mut inbound_rx: mpsc::Receiver<InboundPacket>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(packet) = inbound_rx.recv().await {
                let Some(stack) = weak.upgrade() else { break };
                stack.route_datagram(packet).await;
            }
        });
    }

    /// §4.C demultiplexing step 1: parse, answer malformed requests once,
    /// then hand the message to the transaction layer.
    async fn route_datagram(&self, packet: InboundPacket) {
        let ctx = TransportContext {
            peer: packet.peer,
            local: packet.local,
        };
        match parse_message(&packet.payload) {
            Ok(message) => self.transactions.receive(message, ctx).await,
            Err(error) => {
                self.metrics.on_parse_failure();
                debug!(%error, peer = %packet.peer, "datagram failed to parse");
                match reply_to_malformed(&packet.payload, &error) {
                    Some(reply) => {
                        let bytes = serialize_response(&reply);
                        if let Err(e) = self
                            .transport
                            .send_from(packet.local, packet.peer, &bytes)
                            .await
                        {
                            debug!(%e, "could not answer malformed datagram");
                        }
                    }
                    None => self.metrics.on_dropped_datagram(),
                }
            }
        }
    }

    fn find_dialog_for_request(&self, request: &Request) -> Option<(Arc<PartyCore>, Arc<Dialog>)> {
        for entry in self.registry.iter() {
            let Some(party) = entry.value().upgrade() else {
                continue;
            };
            if let Some(dialog) = party.dialogs.find_for_request(request) {
                return Some((party, dialog));
            }
        }
        None
    }

    fn find_dialog_for_response(
        &self,
        response: &Response,
    ) -> Option<(Arc<PartyCore>, Arc<Dialog>)> {
        for entry in self.registry.iter() {
            let Some(party) = entry.value().upgrade() else {
                continue;
            };
            if let Some(dialog) = party.dialogs.find_for_response(response) {
                return Some((party, dialog));
            }
        }
        None
    }

    async fn handle_new_invite(
        self: &Arc<Self>,
        request: Request,
        handle: ServerTransactionHandle,
        ctx: TransportContext,
    ) {
        let aor = match &request.start.uri {
            Uri::Sip(uri) => uri.aor(),
            Uri::Tel(_) => {
                handle.send_final(response_for(&request, 404)).await;
                return;
            }
        };
        let Some(party) = self.registry.get(&aor).and_then(|p| p.value().upgrade()) else {
            debug!(%aor, "no party registered for request-URI");
            handle.send_final(response_for(&request, 404)).await;
            return;
        };

        let Some(contact) = party.contact() else {
            handle.send_final(response_for(&request, 503)).await;
            return;
        };
        let Some(dialog) = Dialog::new_uas(&request, party.local_uri.clone(), contact) else {
            handle.send_final(response_for(&request, 400)).await;
            return;
        };

        party.dialogs.insert_early(dialog.clone());
        party.dialogs.promote(&dialog);
        self.pending_invites.insert(
            handle.key().clone(),
            PendingInvite {
                party: party.clone(),
                dialog: dialog.clone(),
                request: request.clone(),
                handle: handle.clone(),
                ctx,
            },
        );

        handle
            .send_provisional(dialog.build_response(&request, 100))
            .await;
        let old = dialog.state();
        handle
            .send_provisional(dialog.build_response(&request, 180))
            .await;
        dialog.on_local_answer(180);
        party.notify(&dialog, old).await;

        let delegate = party.delegate();
        match delegate {
            Some(delegate) => delegate.on_inbound_invite(dialog).await,
            None => debug!(%aor, "inbound INVITE with no delegate; left ringing"),
        }
    }

    async fn handle_in_dialog_request(
        self: &Arc<Self>,
        request: Request,
        handle: ServerTransactionHandle,
        ctx: TransportContext,
    ) {
        let Some((party, dialog)) = self.find_dialog_for_request(&request) else {
            handle.send_final(response_for(&request, 481)).await;
            return;
        };

        if let Err(error) = dialog.on_in_dialog_request(&request) {
            warn!(%error, "in-dialog request rejected");
            let code = match error {
                DialogError::CseqRegression => 500,
                _ => 400,
            };
            handle.send_final(response_for(&request, code)).await;
            return;
        }

        match request.start.method.clone() {
            Method::Bye => {
                handle.send_final(dialog.build_response(&request, 200)).await;
                let old = dialog.state();
                dialog.mark_terminated();
                party.notify(&dialog, old).await;
                party.dialogs.remove(&dialog);
            }
            Method::Invite => {
                // re-INVITE: answer with a refreshed description.
                let mut ok = dialog.build_response(&request, 200);
                if let Some(sdp) = party.sdp() {
                    if let Ok(body) = sdp.answer(&request.body) {
                        ok.headers.push("Content-Type", "application/sdp");
                        ok.body = body;
                    }
                }
                dialog.set_pending_2xx(ok.clone());
                let old = dialog.state();
                handle.send_final(ok).await;
                dialog.on_local_answer(200);
                party.notify(&dialog, old).await;
                self.spawn_2xx_watchdog(party, dialog, ctx);
            }
            Method::Options => {
                let mut ok = dialog.build_response(&request, 200);
                ok.headers.push("Allow", ALLOW);
                handle.send_final(ok).await;
            }
            other => {
                debug!(method = %other, "in-dialog method not supported");
                let mut resp = response_for(&request, 501);
                resp.headers.push("Allow", ALLOW);
                handle.send_final(resp).await;
            }
        }
    }

    /// Retransmits a UAS 2xx on the T1-doubling schedule until the ACK
    /// clears it or 64·T1 passes (RFC 3261 §13.3.1.4).
    fn spawn_2xx_watchdog(
        self: &Arc<Self>,
        party: Arc<PartyCore>,
        dialog: Arc<Dialog>,
        ctx: TransportContext,
    ) {
        let manager = self.transactions.clone();
        let table = self.timer_table;
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let giveup = table.t1.saturating_mul(64);
            let mut interval = table.t1;
            loop {
                tokio::time::sleep(interval).await;
                let Some(response) = dialog.pending_2xx() else {
                    break;
                };
                if started.elapsed() >= giveup {
                    warn!("no ACK for 2xx; tearing the dialog down");
                    let old = dialog.state();
                    dialog.fail(DialogError::TransactionTimeout);
                    party.notify(&dialog, old).await;
                    party.dialogs.remove(&dialog);
                    break;
                }
                let _ = manager.retransmit_response(&ctx, &response).await;
                interval = table.next_interval(interval);
            }
        });
    }
}

/// Bridges the transaction manager to the pooled UDP sockets.
struct UdpDispatcher {
    transport: Arc<UdpTransport>,
    outbound_filter: Option<OutboundFilter>,
}

#[async_trait]
impl TransportDispatcher for UdpDispatcher {
    async fn dispatch(&self, ctx: &TransportContext, payload: Bytes) -> Result<(), TransportError> {
        if let Some(filter) = &self.outbound_filter {
            if !filter(ctx, &payload) {
                debug!(peer = %ctx.peer, "outbound datagram dropped by filter");
                return Ok(());
            }
        }
        self.transport.send_from(ctx.local, ctx.peer, &payload).await
    }
}

struct StackUpcall(Weak<Stack>);

#[async_trait]
impl TransactionUpcall for StackUpcall {
    async fn on_request(
        &self,
        request: Request,
        handle: ServerTransactionHandle,
        ctx: TransportContext,
    ) {
        let Some(stack) = self.0.upgrade() else { return };
        let in_dialog = request
            .to_field()
            .map(|to| to.tag().is_some())
            .unwrap_or(false);

        if in_dialog {
            stack.handle_in_dialog_request(request, handle, ctx).await;
            return;
        }
        match request.start.method.clone() {
            Method::Invite => stack.handle_new_invite(request, handle, ctx).await,
            Method::Options => {
                let mut ok = response_for(&request, 200);
                ok.headers.push("Allow", ALLOW);
                handle.send_final(ok).await;
            }
            other => {
                debug!(method = %other, "out-of-dialog method not supported");
                let mut resp = response_for(&request, 405);
                resp.headers.push("Allow", ALLOW);
                handle.send_final(resp).await;
            }
        }
    }

    async fn on_ack(&self, request: Request, _ctx: TransportContext) {
        let Some(stack) = self.0.upgrade() else { return };
        let Some((party, dialog)) = stack.find_dialog_for_request(&request) else {
            debug!("ACK matched no dialog");
            return;
        };
        if let Err(error) = dialog.on_in_dialog_request(&request) {
            debug!(%error, "ACK did not fit the dialog");
            return;
        }
        if !request.body.is_empty() {
            if let Some(sdp) = party.sdp() {
                sdp.remote_description(&request.body);
            }
        }
        let old = dialog.state();
        dialog.on_ack_received();
        party.notify(&dialog, old).await;
    }

    async fn on_cancel(&self, invite_key: &TransactionKey, terminated: bool) {
        let Some(stack) = self.0.upgrade() else { return };
        if !terminated {
            return;
        }
        if let Some((_, pending)) = stack.pending_invites.remove(invite_key) {
            let old = pending.dialog.state();
            pending.dialog.mark_terminated();
            pending.party.notify(&pending.dialog, old).await;
            pending.party.dialogs.remove(&pending.dialog);
        }
    }

    async fn on_stray_response(&self, response: Response, ctx: TransportContext) -> bool {
        let Some(stack) = self.0.upgrade() else {
            return false;
        };
        let Some((_, dialog)) = stack.find_dialog_for_response(&response) else {
            return false;
        };
        // Retransmitted 2xx after the client transaction terminated: the
        // ACK got lost, so answer it again.
        if response.start.is_success() && dialog.is_uac() && dialog.state() == DialogState::Confirmed
        {
            if let Ok(ack) = dialog.build_ack(&response) {
                let _ = stack
                    .transactions
                    .send_raw(&ctx, serialize_request(&ack))
                    .await;
                return true;
            }
        }
        false
    }

    async fn on_server_terminated(&self, key: &TransactionKey, reason: &str) {
        let Some(stack) = self.0.upgrade() else { return };
        debug!(?key, reason, "server transaction terminated");
        stack.pending_invites.remove(key);
    }
}

struct PartyCore {
    stack: Arc<Stack>,
    local_uri: SipUri,
    max_forwards: u32,
    listen_addr: Option<IpAddr>,
    listen_port: u16,
    port_filter: Option<Arc<dyn Fn(u16) -> bool + Send + Sync>>,
    contact: Mutex<Option<SipUri>>,
    binding: Mutex<Option<SocketBinding>>,
    dialogs: DialogManager,
    delegate: RwLock<Option<Arc<dyn PartyDelegate>>>,
    sdp: RwLock<Option<Arc<dyn SessionDescription>>>,
    auth: RwLock<Option<Arc<dyn AuthorizationProvider>>>,
}

impl PartyCore {
    fn contact(&self) -> Option<SipUri> {
        self.contact.lock().clone()
    }

    fn delegate(&self) -> Option<Arc<dyn PartyDelegate>> {
        self.delegate.read().clone()
    }

    fn sdp(&self) -> Option<Arc<dyn SessionDescription>> {
        self.sdp.read().clone()
    }

    fn auth(&self) -> Option<Arc<dyn AuthorizationProvider>> {
        self.auth.read().clone()
    }

    async fn notify(&self, dialog: &Arc<Dialog>, old: DialogState) {
        let new = dialog.state();
        if new == old {
            return;
        }
        self.stack.metrics.on_dialog_state(match new {
            DialogState::Initial => "initial",
            DialogState::Early => "early",
            DialogState::Confirmed => "confirmed",
            DialogState::Terminated => "terminated",
            DialogState::Error => "error",
        });
        if let Some(delegate) = self.delegate() {
            delegate.on_dialog_state(dialog.clone(), old, new).await;
        }
    }
}

/// What a client transaction reports back to its dialog.
enum TuKind {
    Invite,
    Bye,
    Cancel,
    Options,
}

struct DialogTu {
    stack: Arc<Stack>,
    party: Arc<PartyCore>,
    dialog: Arc<Dialog>,
    ctx: TransportContext,
    kind: TuKind,
}

#[async_trait]
impl ClientTransactionUser for DialogTu {
    async fn on_provisional(&self, _key: &TransactionKey, response: &Response) {
        if let TuKind::Invite = self.kind {
            let dialog = self.dialog_for_response(response);
            let old = dialog.state();
            dialog.on_invite_response(response);
            // A tagged provisional fixes the dialog id; make it findable
            // under the full triple from now on.
            if dialog.id().is_some() {
                self.party.dialogs.promote(&dialog);
            }
            self.party.notify(&dialog, old).await;
        }
    }

    async fn on_final(&self, _key: &TransactionKey, response: &Response) {
        match self.kind {
            TuKind::Invite => {
                let code = response.start.code;
                if (code == 401 || code == 407) && !self.dialog.auth_attempted() {
                    if self.try_reissue_with_auth(response).await {
                        return;
                    }
                }

                let dialog = self.dialog_for_response(response);
                let old = dialog.state();
                let state = dialog.on_invite_response(response);
                if state == DialogState::Confirmed {
                    self.party.dialogs.promote(&dialog);
                    if !response.body.is_empty() {
                        if let Some(sdp) = self.party.sdp() {
                            sdp.remote_description(&response.body);
                        }
                    }
                    match dialog.build_ack(response) {
                        Ok(ack) => {
                            let _ = self
                                .stack
                                .transactions
                                .send_raw(&self.ctx, serialize_request(&ack))
                                .await;
                        }
                        Err(error) => warn!(%error, "could not build ACK"),
                    }
                }
                self.party.notify(&dialog, old).await;
            }
            TuKind::Bye => {
                let old = self.dialog.state();
                self.dialog.mark_terminated();
                self.party.notify(&self.dialog, old).await;
                self.party.dialogs.remove(&self.dialog);
            }
            // The 200 for a CANCEL carries no dialog news; the 487 arrives
            // on the INVITE transaction.
            TuKind::Cancel => {}
            TuKind::Options => {}
        }
    }

    async fn on_timeout(&self, _key: &TransactionKey) {
        let old = self.dialog.state();
        self.dialog.fail(DialogError::TransactionTimeout);
        self.party.notify(&self.dialog, old).await;
    }

    async fn on_transport_error(&self, _key: &TransactionKey) {
        let old = self.dialog.state();
        self.dialog.fail(DialogError::TransportFailure);
        self.party.notify(&self.dialog, old).await;
    }

    async fn on_terminated(&self, key: &TransactionKey, reason: &str) {
        debug!(?key, reason, "client transaction terminated");
    }
}

impl DialogTu {
    /// Resolves which dialog an INVITE answer belongs to. The first tagged
    /// answer settles this transaction's dialog; an answer carrying a
    /// different remote tag is a fork and gets its own dialog under its own
    /// full identifier (RFC 3261 §12.1).
    fn dialog_for_response(&self, response: &Response) -> Arc<Dialog> {
        let to_tag = response.to_field().and_then(|to| to.tag().map(SmolStr::new));
        let Some(tag) = to_tag else {
            return self.dialog.clone();
        };
        match self.dialog.remote_tag() {
            None => self.dialog.clone(),
            Some(existing) if existing == tag => self.dialog.clone(),
            Some(_) => {
                let forked_id = DialogId {
                    call_id: self.dialog.call_id().clone(),
                    local_tag: self.dialog.local_tag().clone(),
                    remote_tag: tag,
                };
                if let Some(found) = self.party.dialogs.get(&forked_id) {
                    return found;
                }
                debug!(?forked_id, "forked answer; creating sibling dialog");
                self.dialog.fork()
            }
        }
    }

    /// 401/407 handling: ask the credential collaborator for an
    /// Authorization value and reissue the INVITE with the next CSeq.
    async fn try_reissue_with_auth(&self, response: &Response) -> bool {
        let Some(provider) = self.party.auth() else {
            return false;
        };
        let challenge = response
            .headers
            .get("WWW-Authenticate")
            .or_else(|| response.headers.get("Proxy-Authenticate"));
        let Some(challenge) = challenge else {
            return false;
        };
        let Some(original) = self.dialog.last_invite() else {
            return false;
        };
        let Some(value) = provider.authorize(challenge, &original) else {
            return false;
        };
        let Ok(retry) = self.dialog.reissue_invite(&value) else {
            return false;
        };
        info!("answering challenge with credentialed INVITE");
        let tu = Arc::new(DialogTu {
            stack: self.stack.clone(),
            party: self.party.clone(),
            dialog: self.dialog.clone(),
            ctx: self.ctx,
            kind: TuKind::Invite,
        });
        self.stack
            .transactions
            .send_request(retry, self.ctx, tu)
            .await
            .is_some()
    }
}

/// A party in a SIP call: an endpoint, caller or callee.
#[derive(Clone)]
pub struct Party {
    core: Arc<PartyCore>,
}

impl Party {
    /// Creates a party on the process-shared stack. Timer overrides in the
    /// config produce a private stack instead, so tests can compress time.
    pub fn new(config: PartyConfig) -> anyhow::Result<Self> {
        let stack = match config.timers {
            Some(table) => Stack::new(StackConfig {
                timers: Some(table),
                ..StackConfig::default()
            }),
            None => Stack::shared(),
        };
        Self::with_stack(config, stack)
    }

    /// Creates a party on an explicit stack (the testable path; the stack
    /// singleton is never reached through hidden state).
    pub fn with_stack(config: PartyConfig, stack: Arc<Stack>) -> anyhow::Result<Self> {
        let local_uri = config.uri_value().context("party identity")?;
        Ok(Self {
            core: Arc::new(PartyCore {
                stack,
                local_uri,
                max_forwards: config.max_forwards,
                listen_addr: config.listen_addr,
                listen_port: config.listen_port,
                port_filter: config.port_filter.clone(),
                contact: Mutex::new(None),
                binding: Mutex::new(None),
                dialogs: DialogManager::new(),
                delegate: RwLock::new(None),
                sdp: RwLock::new(None),
                auth: RwLock::new(None),
            }),
        })
    }

    pub fn aor(&self) -> SmolStr {
        self.core.local_uri.aor()
    }

    pub fn uri(&self) -> &SipUri {
        &self.core.local_uri
    }

    pub fn stack(&self) -> &Arc<Stack> {
        &self.core.stack
    }

    pub fn set_delegate(&self, delegate: Arc<dyn PartyDelegate>) {
        *self.core.delegate.write() = Some(delegate);
    }

    pub fn set_session_description(&self, sdp: Arc<dyn SessionDescription>) {
        *self.core.sdp.write() = Some(sdp);
    }

    pub fn set_authorization(&self, auth: Arc<dyn AuthorizationProvider>) {
        *self.core.auth.write() = Some(auth);
    }

    /// Binds (or reuses) the listening socket and registers this party's
    /// AOR so inbound INVITEs whose request-URI matches reach it.
    pub async fn listen(&self) -> anyhow::Result<SocketAddr> {
        if let Some(binding) = self.core.binding.lock().as_ref() {
            return Ok(binding.local_addr());
        }

        let addr = self.core.listen_addr.or_else(|| {
            self.core.local_uri.host.parse::<IpAddr>().ok()
        });
        let spec = ListenSpec {
            addr: Some(addr.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))),
            port: self.core.listen_port,
            port_filter: self.core.port_filter.clone(),
            exclusive: false,
        };
        let binding = self
            .core
            .stack
            .transport
            .listen(&spec)
            .await
            .context("party listen")?;
        let local = binding.local_addr();

        let mut contact = SipUri::new(local.ip().to_string());
        contact.user = self.core.local_uri.user.clone();
        contact.port = Some(local.port());
        *self.core.contact.lock() = Some(contact);
        *self.core.binding.lock() = Some(binding);

        self.core
            .stack
            .registry
            .insert(self.aor(), Arc::downgrade(&self.core));
        info!(aor = %self.aor(), %local, "party listening");
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.binding.lock().as_ref().map(|b| b.local_addr())
    }

    /// Starts an INVITE dialog toward `target` (a SIP URI string) and
    /// returns the dialog handle; progress is observable through its state.
    pub async fn invite(&self, target: &str) -> anyhow::Result<Arc<Dialog>> {
        self.listen().await?;
        let remote = SipUri::parse(target).ok_or_else(|| anyhow!("bad target URI: {target}"))?;
        let contact = self
            .core
            .contact()
            .ok_or_else(|| anyhow!("party is not bound"))?;

        let dialog = Dialog::new_uac(self.core.local_uri.clone(), remote.clone(), contact);
        self.core.dialogs.insert_early(dialog.clone());

        let (body, content_type) = match self.core.sdp() {
            Some(sdp) => (sdp.offer().context("SDP offer")?, Some("application/sdp")),
            None => (Bytes::new(), None),
        };
        let mut invite = dialog.build_invite(body, content_type);
        invite
            .headers
            .set("Max-Forwards", self.core.max_forwards.to_string());

        let ctx = self.ctx_for(&dialog).await?;
        let tu = Arc::new(DialogTu {
            stack: self.core.stack.clone(),
            party: self.core.clone(),
            dialog: dialog.clone(),
            ctx,
            kind: TuKind::Invite,
        });
        self.core
            .stack
            .transactions
            .send_request(invite, ctx, tu)
            .await
            .ok_or_else(|| anyhow!("INVITE could not start a transaction"))?;
        Ok(dialog)
    }

    /// Accepts a ringing inbound INVITE with a 200.
    pub async fn accept(&self, dialog: &Arc<Dialog>) -> anyhow::Result<()> {
        let (_, pending) = self
            .take_pending(dialog)
            .ok_or_else(|| anyhow!("no pending INVITE for this dialog"))?;

        let mut ok = dialog.build_response(&pending.request, 200);
        if let Some(sdp) = self.core.sdp() {
            match sdp.answer(&pending.request.body) {
                Ok(body) => {
                    ok.headers.push("Content-Type", "application/sdp");
                    ok.body = body;
                }
                Err(error) => warn!(%error, "SDP answer failed; accepting without a body"),
            }
        }

        dialog.set_pending_2xx(ok.clone());
        let old = dialog.state();
        pending.handle.send_final(ok).await;
        dialog.on_local_answer(200);
        self.core.notify(dialog, old).await;
        self.core
            .stack
            .spawn_2xx_watchdog(self.core.clone(), dialog.clone(), pending.ctx);
        Ok(())
    }

    /// Declines a ringing inbound INVITE with the given status (4xx-6xx).
    pub async fn reject(&self, dialog: &Arc<Dialog>, status: u16) -> anyhow::Result<()> {
        anyhow::ensure!((400..700).contains(&status), "not a failure status");
        let (_, pending) = self
            .take_pending(dialog)
            .ok_or_else(|| anyhow!("no pending INVITE for this dialog"))?;

        let resp = dialog.build_response(&pending.request, status);
        pending.handle.send_final(resp).await;
        let old = dialog.state();
        dialog.mark_terminated();
        self.core.notify(dialog, old).await;
        self.core.dialogs.remove(dialog);
        Ok(())
    }

    /// Cancels a pending outbound INVITE.
    pub async fn cancel(&self, dialog: &Arc<Dialog>) -> anyhow::Result<()> {
        let cancel = dialog.build_cancel().context("CANCEL needs a pending INVITE")?;
        let ctx = self.ctx_for(dialog).await?;
        let tu = Arc::new(DialogTu {
            stack: self.core.stack.clone(),
            party: self.core.clone(),
            dialog: dialog.clone(),
            ctx,
            kind: TuKind::Cancel,
        });
        self.core
            .stack
            .transactions
            .send_request(cancel, ctx, tu)
            .await
            .ok_or_else(|| anyhow!("CANCEL could not start a transaction"))?;
        Ok(())
    }

    /// Ends a confirmed dialog with BYE.
    pub async fn hangup(&self, dialog: &Arc<Dialog>) -> anyhow::Result<()> {
        let mut bye = dialog.build_request(Method::Bye).context("BYE")?;
        bye.headers
            .set("Max-Forwards", self.core.max_forwards.to_string());
        let ctx = self.ctx_for(dialog).await?;
        let tu = Arc::new(DialogTu {
            stack: self.core.stack.clone(),
            party: self.core.clone(),
            dialog: dialog.clone(),
            ctx,
            kind: TuKind::Bye,
        });
        self.core
            .stack
            .transactions
            .send_request(bye, ctx, tu)
            .await
            .ok_or_else(|| anyhow!("BYE could not start a transaction"))?;
        Ok(())
    }

    /// Renegotiates a confirmed dialog with a re-INVITE carrying a fresh
    /// offer.
    pub async fn reinvite(&self, dialog: &Arc<Dialog>) -> anyhow::Result<()> {
        let mut invite = dialog.build_request(Method::Invite).context("re-INVITE")?;
        if let Some(sdp) = self.core.sdp() {
            invite.headers.push("Content-Type", "application/sdp");
            invite.body = sdp.offer().context("SDP offer")?;
        }
        invite
            .headers
            .set("Max-Forwards", self.core.max_forwards.to_string());
        let ctx = self.ctx_for(dialog).await?;
        let tu = Arc::new(DialogTu {
            stack: self.core.stack.clone(),
            party: self.core.clone(),
            dialog: dialog.clone(),
            ctx,
            kind: TuKind::Invite,
        });
        self.core
            .stack
            .transactions
            .send_request(invite, ctx, tu)
            .await
            .ok_or_else(|| anyhow!("re-INVITE could not start a transaction"))?;
        Ok(())
    }

    /// Sends an out-of-dialog OPTIONS ping.
    pub async fn options(&self, target: &str) -> anyhow::Result<()> {
        self.listen().await?;
        let remote = SipUri::parse(target).ok_or_else(|| anyhow!("bad target URI: {target}"))?;
        let contact = self
            .core
            .contact()
            .ok_or_else(|| anyhow!("party is not bound"))?;

        let mut headers = sip_core::Headers::new();
        let sent_by = match contact.port {
            Some(port) => format!("{}:{}", contact.host, port),
            None => contact.host.to_string(),
        };
        headers.push(
            "Via",
            format!("SIP/2.0/UDP {};branch={}", sent_by, generate_branch()),
        );
        headers.push("Max-Forwards", self.core.max_forwards.to_string());
        headers.push(
            "From",
            format!("<{}>;tag={}", self.core.local_uri.base(), generate_tag()),
        );
        headers.push("To", format!("<{}>", remote.base()));
        headers.push("Call-ID", generate_call_id(&self.core.local_uri.host));
        headers.push("CSeq", "1 OPTIONS");
        let request = Request::new(
            sip_core::RequestLine::new(Method::Options, Uri::Sip(remote.base())),
            headers,
            Bytes::new(),
        );

        let dest =
            UdpTransport::resolve(remote.host.as_str(), remote.port_or_default()).await?;
        let local = self
            .local_addr()
            .ok_or_else(|| anyhow!("party is not bound"))?;
        let ctx = TransportContext { peer: dest, local };
        let throwaway = Dialog::new_uac(
            self.core.local_uri.clone(),
            remote,
            contact,
        );
        let tu = Arc::new(DialogTu {
            stack: self.core.stack.clone(),
            party: self.core.clone(),
            dialog: throwaway,
            ctx,
            kind: TuKind::Options,
        });
        self.core
            .stack
            .transactions
            .send_request(request, ctx, tu)
            .await
            .ok_or_else(|| anyhow!("OPTIONS could not start a transaction"))?;
        Ok(())
    }

    /// Unregisters the AOR, BYEs every confirmed dialog and releases the
    /// socket reference.
    pub async fn terminate(&self) -> anyhow::Result<()> {
        self.core.stack.registry.remove(&self.aor());
        for dialog in self.core.dialogs.all() {
            if dialog.state() == DialogState::Confirmed {
                if let Err(error) = self.hangup(&dialog).await {
                    warn!(%error, "BYE on terminate failed");
                }
            }
        }
        if let Some(binding) = self.core.binding.lock().take() {
            binding.release();
        }
        *self.core.contact.lock() = None;
        Ok(())
    }

    /// Dialogs currently tracked by this party.
    pub fn dialogs(&self) -> Vec<Arc<Dialog>> {
        self.core.dialogs.all()
    }

    fn take_pending(&self, dialog: &Arc<Dialog>) -> Option<(TransactionKey, PendingInvite)> {
        let key = self
            .core
            .stack
            .pending_invites
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.value().dialog, dialog))
            .map(|entry| entry.key().clone())?;
        self.core.stack.pending_invites.remove(&key)
    }

    /// Where in-dialog traffic for `dialog` should be sent: the remote
    /// target once one is learned, the remote URI before that.
    async fn ctx_for(&self, dialog: &Arc<Dialog>) -> anyhow::Result<TransportContext> {
        let target = dialog
            .remote_target()
            .unwrap_or_else(|| dialog.remote_uri().base());
        let dest = UdpTransport::resolve(target.host.as_str(), target.port_or_default()).await?;
        let local = self
            .local_addr()
            .ok_or_else(|| anyhow!("party is not bound"))?;
        Ok(TransportContext { peer: dest, local })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config(aor: &str) -> PartyConfig {
        PartyConfig::new()
            .aor(aor)
            .unwrap()
            .listen_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn test_stack() -> Arc<Stack> {
        Stack::new(StackConfig {
            timers: Some(TimerTable::new(
                Duration::from_millis(25),
                Duration::from_millis(200),
                Duration::from_millis(250),
            )),
            linger: Some(Duration::from_millis(100)),
            ..StackConfig::default()
        })
    }

    #[tokio::test]
    async fn parties_share_one_socket() {
        let stack = test_stack();
        let mut parties = Vec::new();
        for i in 0..10 {
            let party = Party::with_stack(
                loopback_config(&format!("user{i}@127.0.0.1")),
                stack.clone(),
            )
            .unwrap();
            party.listen().await.unwrap();
            parties.push(party);
        }
        assert_eq!(stack.transport().socket_count(), 1);
        let addr = parties[0].local_addr().unwrap();
        assert!(parties.iter().all(|p| p.local_addr().unwrap() == addr));
    }

    #[tokio::test]
    async fn listen_registers_and_terminate_unregisters() {
        let stack = test_stack();
        let party =
            Party::with_stack(loopback_config("reg@127.0.0.1"), stack.clone()).unwrap();
        party.listen().await.unwrap();
        assert!(stack.registry.contains_key("reg@127.0.0.1"));
        party.terminate().await.unwrap();
        assert!(!stack.registry.contains_key("reg@127.0.0.1"));
    }

    #[tokio::test]
    async fn contact_follows_bound_address() {
        let stack = test_stack();
        let party =
            Party::with_stack(loopback_config("carol@127.0.0.1"), stack.clone()).unwrap();
        let addr = party.listen().await.unwrap();
        let contact = party.core.contact().unwrap();
        assert_eq!(contact.user.as_deref(), Some("carol"));
        assert_eq!(contact.host.as_str(), "127.0.0.1");
        assert_eq!(contact.port, Some(addr.port()));
    }

    #[tokio::test]
    async fn invite_to_silent_peer_times_out_with_structured_error() {
        let stack = test_stack();
        let party =
            Party::with_stack(loopback_config("timeout@127.0.0.1"), stack.clone()).unwrap();
        party.listen().await.unwrap();

        // A bound socket that never answers.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = format!("sip:quiet@127.0.0.1:{}", silent.local_addr().unwrap().port());

        let dialog = party.invite(&target).await.unwrap();
        let state = dialog
            .wait_for_state(
                |s| matches!(s, DialogState::Error),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(state, DialogState::Error);
        assert_eq!(dialog.last_error(), Some(DialogError::TransactionTimeout));
    }
}
