//! Collaborator interfaces the core calls out to but does not implement:
//! session description handling, authentication, and the user's event
//! callbacks.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sip_core::Request;
use sip_dialog::{Dialog, DialogState};
use smol_str::SmolStr;

/// Produces and consumes session descriptions at the INVITE offer/answer
/// boundaries. The core treats the payloads as opaque bytes.
pub trait SessionDescription: Send + Sync + 'static {
    /// Body for an outbound INVITE.
    fn offer(&self) -> anyhow::Result<Bytes>;
    /// Body for the 2xx answering `offer`.
    fn answer(&self, offer: &Bytes) -> anyhow::Result<Bytes>;
    /// The peer's description, delivered at the ACK/2xx boundary.
    fn remote_description(&self, sdp: &Bytes);
}

/// Answers 401/407 challenges. The returned value becomes the Authorization
/// header of the retried request, which keeps its Call-ID and increments its
/// CSeq.
pub trait AuthorizationProvider: Send + Sync + 'static {
    fn authorize(&self, challenge: &str, request: &Request) -> Option<SmolStr>;
}

/// User-facing callbacks a party delivers. All methods default to no-ops so
/// implementations only override what they care about.
#[async_trait]
pub trait PartyDelegate: Send + Sync + 'static {
    /// A new INVITE arrived for this party; answer via
    /// [`Party::accept`](crate::Party::accept) or
    /// [`Party::reject`](crate::Party::reject).
    async fn on_inbound_invite(&self, dialog: Arc<Dialog>) {
        let _ = dialog;
    }

    /// A dialog changed state.
    async fn on_dialog_state(&self, dialog: Arc<Dialog>, old: DialogState, new: DialogState) {
        let _ = (dialog, old, new);
    }
}
