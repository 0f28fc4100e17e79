// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction ownership and demultiplexing.
//!
//! The [`TransactionManager`] owns every live transaction, keyed by branch /
//! sent-by / method / direction. Inbound messages land here from the
//! transport receive loop: matched messages drive the owning state machine,
//! out-of-transaction requests create server transactions and surface
//! through the [`TransactionUpcall`], orphan responses are counted and
//! dropped. Timers are armed on the shared `sip-timer` wheel and fire back
//! into the manager's command queue, so each transaction sees its inputs in
//! FIFO order.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use sip_core::{Method, Request, Response, SipMessage};
use sip_observe::{StackMetrics, TracingStackMetrics};
use sip_parse::serialize_response;
use sip_timer::{RetryScheduler, TimerHandle};
use sip_transport::TransportError;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    build_non_2xx_ack, response_for,
    fsm::{
        ClientInviteEvent, ClientInviteFsm, ClientNonInviteEvent, ClientNonInviteFsm,
        ServerInviteEvent, ServerInviteFsm, ServerInviteState, ServerNonInviteEvent,
        ServerNonInviteFsm, TxAction,
    },
    timers::TimerTable,
    TransactionKey, TransactionRole, TransactionTimer,
};

/// Where a message came from / should go back to: the peer address and the
/// local socket that carries the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportContext {
    pub peer: SocketAddr,
    pub local: SocketAddr,
}

/// Sends serialized messages for the manager.
#[async_trait]
pub trait TransportDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, ctx: &TransportContext, payload: Bytes) -> Result<(), TransportError>;
}

/// Callbacks a client transaction delivers to its user (a dialog).
#[async_trait]
pub trait ClientTransactionUser: Send + Sync + 'static {
    async fn on_provisional(&self, key: &TransactionKey, response: &Response);
    async fn on_final(&self, key: &TransactionKey, response: &Response);
    /// Timer B/F expired without a final response.
    async fn on_timeout(&self, key: &TransactionKey);
    async fn on_transport_error(&self, key: &TransactionKey);
    async fn on_terminated(&self, key: &TransactionKey, reason: &str);
}

/// Callbacks for traffic that does not belong to a live client transaction:
/// new server transactions, 2xx ACKs, CANCEL and stray responses. The stack
/// above the manager implements this once.
#[async_trait]
pub trait TransactionUpcall: Send + Sync + 'static {
    /// A request that created a new server transaction.
    async fn on_request(
        &self,
        request: Request,
        handle: ServerTransactionHandle,
        ctx: TransportContext,
    );
    /// ACK for a 2xx; belongs to the dialog, not the server transaction.
    async fn on_ack(&self, request: Request, ctx: TransportContext);
    /// A CANCEL matched (or failed to match) an INVITE server transaction.
    /// `terminated` is true when the manager already generated the 487.
    async fn on_cancel(&self, invite_key: &TransactionKey, terminated: bool);
    /// A response with no matching client transaction. Return true when a
    /// dialog consumed it (e.g. a retransmitted 2xx that needs re-ACKing);
    /// false lets the manager count it as an orphan and drop it.
    async fn on_stray_response(&self, response: Response, ctx: TransportContext) -> bool;
    /// A server transaction left the map.
    async fn on_server_terminated(&self, key: &TransactionKey, reason: &str);
}

enum ClientKind {
    Invite(ClientInviteFsm),
    NonInvite(ClientNonInviteFsm),
}

enum ServerKind {
    Invite(ServerInviteFsm),
    NonInvite(ServerNonInviteFsm),
}

struct ClientEntry {
    kind: ClientKind,
    ctx: TransportContext,
    request: Request,
    tu: Arc<dyn ClientTransactionUser>,
    timers: HashMap<TransactionTimer, TimerHandle>,
}

struct ServerEntry {
    kind: ServerKind,
    ctx: TransportContext,
    request: Request,
    last_provisional: Option<Response>,
    timers: HashMap<TransactionTimer, TimerHandle>,
}

enum Command {
    Timer {
        key: TransactionKey,
        timer: TransactionTimer,
    },
    TransportError {
        key: TransactionKey,
    },
}

struct Inner {
    dispatcher: Arc<dyn TransportDispatcher>,
    scheduler: Arc<RetryScheduler>,
    timer_table: TimerTable,
    upcall: RwLock<Option<Arc<dyn TransactionUpcall>>>,
    client: DashMap<TransactionKey, ClientEntry>,
    server: DashMap<TransactionKey, ServerEntry>,
    metrics: Arc<dyn StackMetrics>,
}

/// Owns SIP transactions; see the module docs.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<Inner>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

/// Handle a server transaction user responds through.
#[derive(Clone)]
pub struct ServerTransactionHandle {
    manager: TransactionManager,
    key: TransactionKey,
}

impl ServerTransactionHandle {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// Sends a provisional (1xx) response through the transaction.
    pub async fn send_provisional(&self, response: Response) {
        self.manager.server_send(&self.key, response, false).await;
    }

    /// Sends a final response; non-2xx arms the retransmit machinery, 2xx
    /// terminates the transaction and leaves retransmission to the dialog.
    pub async fn send_final(&self, response: Response) {
        self.manager.server_send(&self.key, response, true).await;
    }
}

impl TransactionManager {
    pub fn new(
        dispatcher: Arc<dyn TransportDispatcher>,
        scheduler: Arc<RetryScheduler>,
        timer_table: TimerTable,
    ) -> Self {
        Self::with_metrics(dispatcher, scheduler, timer_table, Arc::new(TracingStackMetrics))
    }

    pub fn with_metrics(
        dispatcher: Arc<dyn TransportDispatcher>,
        scheduler: Arc<RetryScheduler>,
        timer_table: TimerTable,
        metrics: Arc<dyn StackMetrics>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Inner {
                dispatcher,
                scheduler,
                timer_table,
                upcall: RwLock::new(None),
                client: DashMap::new(),
                server: DashMap::new(),
                metrics,
            }),
            cmd_tx,
        };
        manager.spawn_command_loop(cmd_rx);
        manager
    }

    /// Installs the upcall target. Must happen before traffic arrives.
    pub fn set_upcall(&self, upcall: Arc<dyn TransactionUpcall>) {
        *self.inner.upcall.write() = Some(upcall);
    }

    pub fn timer_table(&self) -> TimerTable {
        self.inner.timer_table
    }

    /// Live transaction count, both directions.
    pub fn transaction_count(&self) -> usize {
        self.inner.client.len() + self.inner.server.len()
    }

    fn upcall(&self) -> Option<Arc<dyn TransactionUpcall>> {
        self.inner.upcall.read().clone()
    }

    fn spawn_command_loop(&self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    Command::Timer { key, timer } => manager.handle_timer(key, timer).await,
                    Command::TransportError { key } => manager.handle_transport_error(key).await,
                }
            }
        });
    }

    /// Starts a client transaction for `request` and returns its key.
    ///
    /// The branch in the top Via must be fresh; the caller (dialog layer)
    /// generates it via [`crate::generate_branch`].
    pub async fn send_request(
        &self,
        request: Request,
        ctx: TransportContext,
        tu: Arc<dyn ClientTransactionUser>,
    ) -> Option<TransactionKey> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let is_invite = request.start.method == Method::Invite;

        let actions = {
            let mut entry = ClientEntry {
                kind: if is_invite {
                    ClientKind::Invite(ClientInviteFsm::new(self.inner.timer_table))
                } else {
                    ClientKind::NonInvite(ClientNonInviteFsm::new(self.inner.timer_table))
                },
                ctx,
                request: request.clone(),
                tu,
                timers: HashMap::new(),
            };
            let actions = match &mut entry.kind {
                ClientKind::Invite(fsm) => {
                    fsm.on_event(ClientInviteEvent::SendInvite(request))
                }
                ClientKind::NonInvite(fsm) => {
                    fsm.on_event(ClientNonInviteEvent::SendRequest(request))
                }
            };
            self.inner.client.insert(key.clone(), entry);
            actions
        };
        self.inner.metrics.on_transaction_created("client");
        self.apply_client_actions(&key, actions).await;
        Some(key)
    }

    /// Sends bytes outside any transaction (ACK for 2xx, dialog-level 2xx
    /// retransmissions).
    pub async fn send_raw(&self, ctx: &TransportContext, payload: Bytes) -> Result<(), TransportError> {
        let result = self.inner.dispatcher.dispatch(ctx, payload).await;
        if result.is_ok() {
            self.inner.metrics.on_packet_sent();
        }
        result
    }

    /// Entry point for every parsed inbound message.
    pub async fn receive(&self, message: SipMessage, ctx: TransportContext) {
        match message {
            SipMessage::Request(request) => self.receive_request(request, ctx).await,
            SipMessage::Response(response) => self.receive_response(response, ctx).await,
        }
    }

    async fn receive_request(&self, request: Request, ctx: TransportContext) {
        let Some(key) = TransactionKey::from_request(&request, TransactionRole::Server) else {
            debug!("request without usable Via/branch dropped");
            self.inner.metrics.on_dropped_datagram();
            return;
        };

        match request.start.method {
            Method::Ack => self.receive_ack(key, request, ctx).await,
            Method::Cancel => self.receive_cancel(key, request, ctx).await,
            _ => self.receive_plain_request(key, request, ctx).await,
        }
    }

    /// ACK matches the INVITE server transaction when one is still absorbing
    /// (non-2xx answer); otherwise it belongs to the dialog (2xx case).
    async fn receive_ack(&self, key: TransactionKey, request: Request, ctx: TransportContext) {
        let actions = {
            match self.inner.server.get_mut(&key) {
                Some(mut entry) => match &mut entry.kind {
                    ServerKind::Invite(fsm) => Some(fsm.on_event(ServerInviteEvent::ReceiveAck)),
                    ServerKind::NonInvite(_) => None,
                },
                None => None,
            }
        };
        match actions {
            Some(actions) => self.apply_server_actions(&key, actions).await,
            None => {
                if let Some(upcall) = self.upcall() {
                    upcall.on_ack(request, ctx).await;
                }
            }
        }
    }

    /// CANCEL: answered 200 through its own server transaction; a matched
    /// INVITE in Proceeding additionally gets a 487 generated for it.
    async fn receive_cancel(&self, key: TransactionKey, request: Request, ctx: TransportContext) {
        // Retransmitted CANCEL replays the 200.
        if self.inner.server.contains_key(&key) {
            let actions = {
                match self.inner.server.get_mut(&key) {
                    Some(mut entry) => match &mut entry.kind {
                        ServerKind::NonInvite(fsm) => {
                            fsm.on_event(ServerNonInviteEvent::ReceiveRetransmit)
                        }
                        ServerKind::Invite(_) => Vec::new(),
                    },
                    None => Vec::new(),
                }
            };
            self.apply_server_actions(&key, actions).await;
            return;
        }

        // New CANCEL transaction; 200 OK regardless of the match outcome.
        let ok = response_for(&request, 200);
        let actions = {
            let mut entry = ServerEntry {
                kind: ServerKind::NonInvite(ServerNonInviteFsm::new(self.inner.timer_table)),
                ctx,
                request: request.clone(),
                last_provisional: None,
                timers: HashMap::new(),
            };
            let actions = match &mut entry.kind {
                ServerKind::NonInvite(fsm) => fsm.on_event(ServerNonInviteEvent::SendFinal(ok)),
                ServerKind::Invite(_) => unreachable!(),
            };
            self.inner.server.insert(key.clone(), entry);
            actions
        };
        self.inner.metrics.on_transaction_created("server");
        self.apply_server_actions(&key, actions).await;

        // Find the INVITE this CANCEL targets.
        let invite_key = key.as_invite();
        let four_eighty_seven = {
            match self.inner.server.get(&invite_key) {
                Some(entry) => match &entry.kind {
                    ServerKind::Invite(fsm) if fsm.state() == ServerInviteState::Proceeding => {
                        let mut response = response_for(&entry.request, 487);
                        // Keep the To tag the provisionals carried.
                        if let Some(provisional) = &entry.last_provisional {
                            if let Some(to) = provisional.headers.get("To") {
                                response.headers.set("To", to.clone());
                            }
                        }
                        Some(response)
                    }
                    _ => None,
                },
                None => None,
            }
        };

        match four_eighty_seven {
            Some(response) => {
                self.server_send(&invite_key, response, true).await;
                if let Some(upcall) = self.upcall() {
                    upcall.on_cancel(&invite_key, true).await;
                }
            }
            None => {
                if let Some(upcall) = self.upcall() {
                    upcall.on_cancel(&invite_key, false).await;
                }
            }
        }
    }

    async fn receive_plain_request(
        &self,
        key: TransactionKey,
        request: Request,
        ctx: TransportContext,
    ) {
        // Retransmission of a request we already own.
        if self.inner.server.contains_key(&key) {
            let actions = {
                match self.inner.server.get_mut(&key) {
                    Some(mut entry) => match &mut entry.kind {
                        ServerKind::Invite(fsm) => {
                            fsm.on_event(ServerInviteEvent::ReceiveRetransmit)
                        }
                        ServerKind::NonInvite(fsm) => {
                            fsm.on_event(ServerNonInviteEvent::ReceiveRetransmit)
                        }
                    },
                    None => Vec::new(),
                }
            };
            self.apply_server_actions(&key, actions).await;
            return;
        }

        let is_invite = request.start.method == Method::Invite;
        let entry = ServerEntry {
            kind: if is_invite {
                ServerKind::Invite(ServerInviteFsm::new(self.inner.timer_table))
            } else {
                ServerKind::NonInvite(ServerNonInviteFsm::new(self.inner.timer_table))
            },
            ctx,
            request: request.clone(),
            last_provisional: None,
            timers: HashMap::new(),
        };
        self.inner.server.insert(key.clone(), entry);
        self.inner.metrics.on_transaction_created("server");

        let handle = ServerTransactionHandle {
            manager: self.clone(),
            key,
        };
        match self.upcall() {
            Some(upcall) => upcall.on_request(request, handle, ctx).await,
            None => warn!("request arrived before an upcall was installed"),
        }
    }

    async fn receive_response(&self, response: Response, ctx: TransportContext) {
        let Some(key) = TransactionKey::from_response(&response, TransactionRole::Client) else {
            self.inner.metrics.on_dropped_datagram();
            return;
        };

        let actions = {
            match self.inner.client.get_mut(&key) {
                Some(mut entry) => {
                    let provisional = response.start.is_provisional();
                    Some(match &mut entry.kind {
                        ClientKind::Invite(fsm) => {
                            if provisional {
                                fsm.on_event(ClientInviteEvent::ReceiveProvisional(response.clone()))
                            } else {
                                fsm.on_event(ClientInviteEvent::ReceiveFinal(response.clone()))
                            }
                        }
                        ClientKind::NonInvite(fsm) => {
                            if provisional {
                                fsm.on_event(ClientNonInviteEvent::ReceiveProvisional(response.clone()))
                            } else {
                                fsm.on_event(ClientNonInviteEvent::ReceiveFinal(response.clone()))
                            }
                        }
                    })
                }
                None => None,
            }
        };

        match actions {
            Some(actions) => self.apply_client_actions(&key, actions).await,
            None => {
                let consumed = match self.upcall() {
                    Some(upcall) => upcall.on_stray_response(response, ctx).await,
                    None => false,
                };
                if !consumed {
                    debug!(?key, "orphan response dropped");
                    self.inner.metrics.on_orphan_response();
                }
            }
        }
    }

    async fn server_send(&self, key: &TransactionKey, response: Response, final_: bool) {
        let actions = {
            match self.inner.server.get_mut(key) {
                Some(mut entry) => {
                    if !final_ {
                        entry.last_provisional = Some(response.clone());
                    }
                    match &mut entry.kind {
                        ServerKind::Invite(fsm) => {
                            if final_ {
                                fsm.on_event(ServerInviteEvent::SendFinal(response))
                            } else {
                                fsm.on_event(ServerInviteEvent::SendProvisional(response))
                            }
                        }
                        ServerKind::NonInvite(fsm) => {
                            if final_ {
                                fsm.on_event(ServerNonInviteEvent::SendFinal(response))
                            } else {
                                fsm.on_event(ServerNonInviteEvent::SendProvisional(response))
                            }
                        }
                    }
                }
                None => {
                    warn!(?key, "response for unknown server transaction");
                    Vec::new()
                }
            }
        };
        self.apply_server_actions(key, actions).await;
    }

    async fn handle_timer(&self, key: TransactionKey, timer: TransactionTimer) {
        match key.role {
            TransactionRole::Client => {
                let actions = {
                    match self.inner.client.get_mut(&key) {
                        Some(mut entry) => {
                            entry.timers.remove(&timer);
                            match &mut entry.kind {
                                ClientKind::Invite(fsm) => {
                                    fsm.on_event(ClientInviteEvent::TimerFired(timer))
                                }
                                ClientKind::NonInvite(fsm) => {
                                    fsm.on_event(ClientNonInviteEvent::TimerFired(timer))
                                }
                            }
                        }
                        None => Vec::new(),
                    }
                };
                self.apply_client_actions(&key, actions).await;
            }
            TransactionRole::Server => {
                let actions = {
                    match self.inner.server.get_mut(&key) {
                        Some(mut entry) => {
                            entry.timers.remove(&timer);
                            match &mut entry.kind {
                                ServerKind::Invite(fsm) => {
                                    fsm.on_event(ServerInviteEvent::TimerFired(timer))
                                }
                                ServerKind::NonInvite(fsm) => {
                                    fsm.on_event(ServerNonInviteEvent::TimerFired(timer))
                                }
                            }
                        }
                        None => Vec::new(),
                    }
                };
                self.apply_server_actions(&key, actions).await;
            }
        }
    }

    async fn handle_transport_error(&self, key: TransactionKey) {
        match key.role {
            TransactionRole::Client => {
                let actions = {
                    match self.inner.client.get_mut(&key) {
                        Some(mut entry) => match &mut entry.kind {
                            ClientKind::Invite(fsm) => {
                                fsm.on_event(ClientInviteEvent::TransportError)
                            }
                            ClientKind::NonInvite(fsm) => {
                                fsm.on_event(ClientNonInviteEvent::TransportError)
                            }
                        },
                        None => Vec::new(),
                    }
                };
                self.apply_client_actions(&key, actions).await;
            }
            TransactionRole::Server => {
                let actions = {
                    match self.inner.server.get_mut(&key) {
                        Some(mut entry) => match &mut entry.kind {
                            ServerKind::Invite(fsm) => {
                                fsm.on_event(ServerInviteEvent::TransportError)
                            }
                            ServerKind::NonInvite(fsm) => {
                                fsm.on_event(ServerNonInviteEvent::TransportError)
                            }
                        },
                        None => Vec::new(),
                    }
                };
                self.apply_server_actions(&key, actions).await;
            }
        }
    }

    async fn apply_client_actions(&self, key: &TransactionKey, actions: Vec<TxAction>) {
        let Some((ctx, request, tu)) = ({
            self.inner
                .client
                .get(key)
                .map(|entry| (entry.ctx, entry.request.clone(), entry.tu.clone()))
        }) else {
            return;
        };

        for action in actions {
            match action {
                TxAction::Transmit(bytes) => self.transmit(key, &ctx, bytes).await,
                TxAction::DeliverProvisional(response) => {
                    tu.on_provisional(key, &response).await;
                }
                TxAction::DeliverFinal(response) => {
                    tu.on_final(key, &response).await;
                }
                TxAction::GenerateAck(response) => {
                    let ack = build_non_2xx_ack(&request, &response);
                    let bytes = sip_parse::serialize_request(&ack);
                    self.transmit(key, &ctx, bytes).await;
                }
                TxAction::Schedule { timer, duration } => self.arm_client_timer(key, timer, duration),
                TxAction::Cancel(timer) => {
                    if let Some(mut entry) = self.inner.client.get_mut(key) {
                        if let Some(handle) = entry.timers.remove(&timer) {
                            handle.cancel();
                        }
                    }
                }
                TxAction::NotifyTimeout => tu.on_timeout(key).await,
                TxAction::NotifyTransportError => tu.on_transport_error(key).await,
                TxAction::Terminate { reason } => {
                    self.remove_client(key);
                    self.inner
                        .metrics
                        .on_transaction_terminated("client", reason.as_str());
                    tu.on_terminated(key, reason.as_str()).await;
                }
            }
        }
    }

    async fn apply_server_actions(&self, key: &TransactionKey, actions: Vec<TxAction>) {
        let Some(ctx) = ({ self.inner.server.get(key).map(|entry| entry.ctx) }) else {
            return;
        };

        for action in actions {
            match action {
                TxAction::Transmit(bytes) => self.transmit(key, &ctx, bytes).await,
                TxAction::Schedule { timer, duration } => self.arm_server_timer(key, timer, duration),
                TxAction::Cancel(timer) => {
                    if let Some(mut entry) = self.inner.server.get_mut(key) {
                        if let Some(handle) = entry.timers.remove(&timer) {
                            handle.cancel();
                        }
                    }
                }
                TxAction::Terminate { reason } => {
                    self.remove_server(key);
                    self.inner
                        .metrics
                        .on_transaction_terminated("server", reason.as_str());
                    if let Some(upcall) = self.upcall() {
                        upcall.on_server_terminated(key, reason.as_str()).await;
                    }
                }
                // Server machines have no TU deliveries; timeouts surface
                // through termination.
                TxAction::NotifyTimeout | TxAction::NotifyTransportError => {}
                TxAction::DeliverProvisional(_)
                | TxAction::DeliverFinal(_)
                | TxAction::GenerateAck(_) => {}
            }
        }
    }

    async fn transmit(&self, key: &TransactionKey, ctx: &TransportContext, bytes: Bytes) {
        match self.inner.dispatcher.dispatch(ctx, bytes).await {
            Ok(()) => self.inner.metrics.on_packet_sent(),
            Err(e) if e.is_terminal() => {
                warn!(?key, %e, "terminal transport error");
                // Fed back through the command queue so the FSM event runs
                // after the current action batch completes.
                let _ = self.cmd_tx.send(Command::TransportError { key: key.clone() });
            }
            Err(e) => {
                // Non-terminal: leave the retransmit timers to make progress.
                debug!(?key, %e, "send failed");
            }
        }
    }

    fn arm_client_timer(&self, key: &TransactionKey, timer: TransactionTimer, duration: std::time::Duration) {
        let cmd_tx = self.cmd_tx.clone();
        let timer_key = key.clone();
        let handle = self.inner.scheduler.schedule_after(duration, move || {
            let _ = cmd_tx.send(Command::Timer {
                key: timer_key,
                timer,
            });
        });
        if let Some(mut entry) = self.inner.client.get_mut(key) {
            if let Some(previous) = entry.timers.insert(timer, handle) {
                previous.cancel();
            }
        } else {
            handle.cancel();
        }
    }

    fn arm_server_timer(&self, key: &TransactionKey, timer: TransactionTimer, duration: std::time::Duration) {
        let cmd_tx = self.cmd_tx.clone();
        let timer_key = key.clone();
        let handle = self.inner.scheduler.schedule_after(duration, move || {
            let _ = cmd_tx.send(Command::Timer {
                key: timer_key,
                timer,
            });
        });
        if let Some(mut entry) = self.inner.server.get_mut(key) {
            if let Some(previous) = entry.timers.insert(timer, handle) {
                previous.cancel();
            }
        } else {
            handle.cancel();
        }
    }

    fn remove_client(&self, key: &TransactionKey) {
        if let Some((_, entry)) = self.inner.client.remove(key) {
            for (_, handle) in entry.timers {
                handle.cancel();
            }
        }
    }

    fn remove_server(&self, key: &TransactionKey) {
        if let Some((_, entry)) = self.inner.server.remove(key) {
            for (_, handle) in entry.timers {
                handle.cancel();
            }
        }
    }

    /// Drives a serialized 2xx retransmission for a dialog that is still
    /// waiting for its ACK.
    pub async fn retransmit_response(
        &self,
        ctx: &TransportContext,
        response: &Response,
    ) -> Result<(), TransportError> {
        self.send_raw(ctx, serialize_response(response)).await
    }
}
