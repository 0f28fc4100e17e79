// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The four transaction state machines of RFC 3261 §17.
//!
//! Each machine is a pure event-to-actions function: the manager feeds it
//! user sends, inbound messages and timer expiries, and executes the actions
//! it returns (transmit, deliver upward, arm/cancel timers, terminate).
//! Retransmissions always reuse the exact bytes sent the first time.

use std::time::Duration;

use bytes::Bytes;
use sip_core::{Request, Response};
use sip_parse::{serialize_request, serialize_response};
use smol_str::SmolStr;

use crate::{timers::TimerTable, TransactionTimer};

/// Client INVITE transaction states (RFC 3261 Figure 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// Server INVITE transaction states (RFC 3261 Figure 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Client non-INVITE transaction states (RFC 3261 Figure 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Server non-INVITE transaction states (RFC 3261 Figure 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Actions a state machine asks the runtime to perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxAction {
    /// Put these exact bytes on the wire.
    Transmit(Bytes),
    /// Hand a provisional response up to the transaction user.
    DeliverProvisional(Response),
    /// Hand a final response up to the transaction user.
    DeliverFinal(Response),
    /// Transaction-layer ACK owed for a non-2xx final response.
    GenerateAck(Response),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Cancel(TransactionTimer),
    /// Timer B/F expired: tell the TU the transaction timed out.
    NotifyTimeout,
    /// A terminal transport error was attributed to this transaction.
    NotifyTransportError,
    Terminate {
        reason: SmolStr,
    },
}

/// Events driving the client INVITE machine.
#[derive(Debug, Clone)]
pub enum ClientInviteEvent {
    SendInvite(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Implements RFC 3261 §17.1.1.
pub struct ClientInviteFsm {
    state: ClientInviteState,
    timers: TimerTable,
    a_interval: Duration,
    last_invite: Option<Bytes>,
    retransmit_count: u32,
}

impl ClientInviteFsm {
    pub fn new(timers: TimerTable) -> Self {
        Self {
            state: ClientInviteState::Calling,
            a_interval: timers.t1,
            timers,
            last_invite: None,
            retransmit_count: 0,
        }
    }

    pub fn state(&self) -> ClientInviteState {
        self.state
    }

    /// Number of retransmissions performed so far (the first send excluded).
    pub fn retransmit_count(&self) -> u32 {
        self.retransmit_count
    }

    pub fn on_event(&mut self, event: ClientInviteEvent) -> Vec<TxAction> {
        use ClientInviteState::*;
        match (self.state, event) {
            (Calling, ClientInviteEvent::SendInvite(invite)) => {
                let bytes = serialize_request(&invite);
                self.last_invite = Some(bytes.clone());
                vec![
                    TxAction::Transmit(bytes),
                    TxAction::Schedule {
                        timer: TransactionTimer::A,
                        duration: self.timers.duration(TransactionTimer::A),
                    },
                    TxAction::Schedule {
                        timer: TransactionTimer::B,
                        duration: self.timers.duration(TransactionTimer::B),
                    },
                ]
            }
            (Calling | Proceeding, ClientInviteEvent::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![
                    TxAction::Cancel(TransactionTimer::A),
                    TxAction::DeliverProvisional(response),
                ]
            }
            (Calling | Proceeding, ClientInviteEvent::ReceiveFinal(response)) => {
                if response.start.is_success() {
                    // 2xx terminates immediately; the ACK belongs to the TU.
                    self.state = Terminated;
                    vec![
                        TxAction::Cancel(TransactionTimer::A),
                        TxAction::Cancel(TransactionTimer::B),
                        TxAction::DeliverFinal(response),
                        TxAction::Terminate {
                            reason: SmolStr::new("2xx received"),
                        },
                    ]
                } else {
                    self.state = Completed;
                    vec![
                        TxAction::Cancel(TransactionTimer::A),
                        TxAction::Cancel(TransactionTimer::B),
                        TxAction::DeliverFinal(response.clone()),
                        TxAction::GenerateAck(response),
                        TxAction::Schedule {
                            timer: TransactionTimer::D,
                            duration: self.timers.duration(TransactionTimer::D),
                        },
                    ]
                }
            }
            // Retransmitted final: re-ACK, do not re-deliver.
            (Completed, ClientInviteEvent::ReceiveFinal(response)) => {
                if response.start.is_success() {
                    Vec::new()
                } else {
                    vec![TxAction::GenerateAck(response)]
                }
            }
            (Calling, ClientInviteEvent::TimerFired(TransactionTimer::A)) => {
                self.a_interval = self.timers.next_interval(self.a_interval);
                match &self.last_invite {
                    Some(bytes) => {
                        self.retransmit_count += 1;
                        vec![
                            TxAction::Transmit(bytes.clone()),
                            TxAction::Schedule {
                                timer: TransactionTimer::A,
                                duration: self.a_interval,
                            },
                        ]
                    }
                    None => Vec::new(),
                }
            }
            (Calling | Proceeding, ClientInviteEvent::TimerFired(TransactionTimer::B)) => {
                self.state = Terminated;
                vec![
                    TxAction::Cancel(TransactionTimer::A),
                    TxAction::NotifyTimeout,
                    TxAction::Terminate {
                        reason: SmolStr::new("Timer B expired"),
                    },
                ]
            }
            (Completed, ClientInviteEvent::TimerFired(TransactionTimer::D)) => {
                self.state = Terminated;
                vec![TxAction::Terminate {
                    reason: SmolStr::new("Timer D expired"),
                }]
            }
            (Terminated, _) => Vec::new(),
            (_, ClientInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![
                    TxAction::Cancel(TransactionTimer::A),
                    TxAction::Cancel(TransactionTimer::B),
                    TxAction::NotifyTransportError,
                    TxAction::Terminate {
                        reason: SmolStr::new("transport error"),
                    },
                ]
            }
            (_, ClientInviteEvent::TimerFired(_)) => Vec::new(),
            _ => Vec::new(),
        }
    }
}

/// Events driving the server INVITE machine.
#[derive(Debug, Clone)]
pub enum ServerInviteEvent {
    /// A retransmission of the INVITE arrived.
    ReceiveRetransmit,
    SendProvisional(Response),
    SendFinal(Response),
    ReceiveAck,
    TimerFired(TransactionTimer),
    TransportError,
}

/// Implements RFC 3261 §17.2.1.
pub struct ServerInviteFsm {
    state: ServerInviteState,
    timers: TimerTable,
    g_interval: Duration,
    last_provisional: Option<Bytes>,
    last_final: Option<Bytes>,
}

impl ServerInviteFsm {
    pub fn new(timers: TimerTable) -> Self {
        Self {
            state: ServerInviteState::Proceeding,
            g_interval: timers.t1,
            timers,
            last_provisional: None,
            last_final: None,
        }
    }

    pub fn state(&self) -> ServerInviteState {
        self.state
    }

    pub fn on_event(&mut self, event: ServerInviteEvent) -> Vec<TxAction> {
        use ServerInviteState::*;
        match (self.state, event) {
            // Absorb retransmits by replaying the newest response sent.
            (Proceeding, ServerInviteEvent::ReceiveRetransmit) => self
                .last_provisional
                .clone()
                .map(TxAction::Transmit)
                .into_iter()
                .collect(),
            (Completed, ServerInviteEvent::ReceiveRetransmit) => self
                .last_final
                .clone()
                .map(TxAction::Transmit)
                .into_iter()
                .collect(),
            (Proceeding, ServerInviteEvent::SendProvisional(response)) => {
                let bytes = serialize_response(&response);
                self.last_provisional = Some(bytes.clone());
                vec![TxAction::Transmit(bytes)]
            }
            (Proceeding, ServerInviteEvent::SendFinal(response)) => {
                let bytes = serialize_response(&response);
                if response.start.is_success() {
                    // The TU retransmits 2xx itself until the ACK arrives.
                    self.state = Terminated;
                    vec![
                        TxAction::Transmit(bytes),
                        TxAction::Terminate {
                            reason: SmolStr::new("2xx sent"),
                        },
                    ]
                } else {
                    self.state = Completed;
                    self.last_final = Some(bytes.clone());
                    vec![
                        TxAction::Transmit(bytes),
                        TxAction::Schedule {
                            timer: TransactionTimer::G,
                            duration: self.timers.duration(TransactionTimer::G),
                        },
                        TxAction::Schedule {
                            timer: TransactionTimer::H,
                            duration: self.timers.duration(TransactionTimer::H),
                        },
                    ]
                }
            }
            (Completed, ServerInviteEvent::ReceiveAck) => {
                self.state = Confirmed;
                vec![
                    TxAction::Cancel(TransactionTimer::G),
                    TxAction::Cancel(TransactionTimer::H),
                    TxAction::Schedule {
                        timer: TransactionTimer::I,
                        duration: self.timers.duration(TransactionTimer::I),
                    },
                ]
            }
            (Completed, ServerInviteEvent::TimerFired(TransactionTimer::G)) => {
                match &self.last_final {
                    Some(bytes) => {
                        let transmit = TxAction::Transmit(bytes.clone());
                        self.g_interval = self.timers.next_interval(self.g_interval);
                        vec![
                            transmit,
                            TxAction::Schedule {
                                timer: TransactionTimer::G,
                                duration: self.g_interval,
                            },
                        ]
                    }
                    None => Vec::new(),
                }
            }
            (Completed, ServerInviteEvent::TimerFired(TransactionTimer::H)) => {
                self.state = Terminated;
                vec![
                    TxAction::Cancel(TransactionTimer::G),
                    TxAction::NotifyTimeout,
                    TxAction::Terminate {
                        reason: SmolStr::new("Timer H expired"),
                    },
                ]
            }
            (Confirmed, ServerInviteEvent::TimerFired(TransactionTimer::I)) => {
                self.state = Terminated;
                vec![TxAction::Terminate {
                    reason: SmolStr::new("Timer I expired"),
                }]
            }
            (Terminated, _) => Vec::new(),
            (_, ServerInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![
                    TxAction::Cancel(TransactionTimer::G),
                    TxAction::Cancel(TransactionTimer::H),
                    TxAction::NotifyTransportError,
                    TxAction::Terminate {
                        reason: SmolStr::new("transport error"),
                    },
                ]
            }
            (_, ServerInviteEvent::TimerFired(_)) => Vec::new(),
            _ => Vec::new(),
        }
    }
}

/// Events driving the client non-INVITE machine.
#[derive(Debug, Clone)]
pub enum ClientNonInviteEvent {
    SendRequest(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Implements RFC 3261 §17.1.2.
pub struct ClientNonInviteFsm {
    state: ClientNonInviteState,
    timers: TimerTable,
    e_interval: Duration,
    last_request: Option<Bytes>,
    retransmit_count: u32,
}

impl ClientNonInviteFsm {
    pub fn new(timers: TimerTable) -> Self {
        Self {
            state: ClientNonInviteState::Trying,
            e_interval: timers.t1,
            timers,
            last_request: None,
            retransmit_count: 0,
        }
    }

    pub fn state(&self) -> ClientNonInviteState {
        self.state
    }

    pub fn retransmit_count(&self) -> u32 {
        self.retransmit_count
    }

    pub fn on_event(&mut self, event: ClientNonInviteEvent) -> Vec<TxAction> {
        use ClientNonInviteState::*;
        match (self.state, event) {
            (Trying, ClientNonInviteEvent::SendRequest(request)) if self.last_request.is_none() => {
                let bytes = serialize_request(&request);
                self.last_request = Some(bytes.clone());
                vec![
                    TxAction::Transmit(bytes),
                    TxAction::Schedule {
                        timer: TransactionTimer::E,
                        duration: self.timers.duration(TransactionTimer::E),
                    },
                    TxAction::Schedule {
                        timer: TransactionTimer::F,
                        duration: self.timers.duration(TransactionTimer::F),
                    },
                ]
            }
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![TxAction::DeliverProvisional(response)]
            }
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveFinal(response)) => {
                self.state = Completed;
                vec![
                    TxAction::Cancel(TransactionTimer::E),
                    TxAction::Cancel(TransactionTimer::F),
                    TxAction::DeliverFinal(response),
                    TxAction::Schedule {
                        timer: TransactionTimer::K,
                        duration: self.timers.duration(TransactionTimer::K),
                    },
                ]
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(TransactionTimer::E)) => {
                self.e_interval = self.timers.next_interval(self.e_interval);
                match &self.last_request {
                    Some(bytes) => {
                        self.retransmit_count += 1;
                        vec![
                            TxAction::Transmit(bytes.clone()),
                            TxAction::Schedule {
                                timer: TransactionTimer::E,
                                duration: self.e_interval,
                            },
                        ]
                    }
                    None => Vec::new(),
                }
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(TransactionTimer::F)) => {
                self.state = Terminated;
                vec![
                    TxAction::Cancel(TransactionTimer::E),
                    TxAction::NotifyTimeout,
                    TxAction::Terminate {
                        reason: SmolStr::new("Timer F expired"),
                    },
                ]
            }
            (Completed, ClientNonInviteEvent::TimerFired(TransactionTimer::K)) => {
                self.state = Terminated;
                vec![TxAction::Terminate {
                    reason: SmolStr::new("Timer K expired"),
                }]
            }
            (Terminated, _) => Vec::new(),
            (_, ClientNonInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![
                    TxAction::Cancel(TransactionTimer::E),
                    TxAction::Cancel(TransactionTimer::F),
                    TxAction::NotifyTransportError,
                    TxAction::Terminate {
                        reason: SmolStr::new("transport error"),
                    },
                ]
            }
            (_, ClientNonInviteEvent::TimerFired(_)) => Vec::new(),
            _ => Vec::new(),
        }
    }
}

/// Events driving the server non-INVITE machine.
#[derive(Debug, Clone)]
pub enum ServerNonInviteEvent {
    ReceiveRetransmit,
    SendProvisional(Response),
    SendFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Implements RFC 3261 §17.2.2.
pub struct ServerNonInviteFsm {
    state: ServerNonInviteState,
    timers: TimerTable,
    last_provisional: Option<Bytes>,
    last_final: Option<Bytes>,
}

impl ServerNonInviteFsm {
    pub fn new(timers: TimerTable) -> Self {
        Self {
            state: ServerNonInviteState::Trying,
            timers,
            last_provisional: None,
            last_final: None,
        }
    }

    pub fn state(&self) -> ServerNonInviteState {
        self.state
    }

    pub fn on_event(&mut self, event: ServerNonInviteEvent) -> Vec<TxAction> {
        use ServerNonInviteState::*;
        match (self.state, event) {
            // A retransmitted request in Trying is discarded: nothing has
            // been sent yet that could be replayed.
            (Trying, ServerNonInviteEvent::ReceiveRetransmit) => Vec::new(),
            (Proceeding, ServerNonInviteEvent::ReceiveRetransmit) => self
                .last_provisional
                .clone()
                .map(TxAction::Transmit)
                .into_iter()
                .collect(),
            (Completed, ServerNonInviteEvent::ReceiveRetransmit) => self
                .last_final
                .clone()
                .map(TxAction::Transmit)
                .into_iter()
                .collect(),
            (Trying | Proceeding, ServerNonInviteEvent::SendProvisional(response)) => {
                self.state = Proceeding;
                let bytes = serialize_response(&response);
                self.last_provisional = Some(bytes.clone());
                vec![TxAction::Transmit(bytes)]
            }
            (Trying | Proceeding, ServerNonInviteEvent::SendFinal(response)) => {
                self.state = Completed;
                let bytes = serialize_response(&response);
                self.last_final = Some(bytes.clone());
                vec![
                    TxAction::Transmit(bytes),
                    TxAction::Schedule {
                        timer: TransactionTimer::J,
                        duration: self.timers.duration(TransactionTimer::J),
                    },
                ]
            }
            (Completed, ServerNonInviteEvent::TimerFired(TransactionTimer::J)) => {
                self.state = Terminated;
                vec![TxAction::Terminate {
                    reason: SmolStr::new("Timer J expired"),
                }]
            }
            (Terminated, _) => Vec::new(),
            (_, ServerNonInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![
                    TxAction::Cancel(TransactionTimer::J),
                    TxAction::NotifyTransportError,
                    TxAction::Terminate {
                        reason: SmolStr::new("transport error"),
                    },
                ]
            }
            (_, ServerNonInviteEvent::TimerFired(_)) => Vec::new(),
            _ => Vec::new(),
        }
    }
}
