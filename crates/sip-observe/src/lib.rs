// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Observability hooks for the stack.
//!
//! The transport and transaction layers report low-cardinality events to a
//! pluggable [`StackMetrics`] sink. The default sink does nothing; install
//! [`TracingStackMetrics`] to forward events to `tracing`, or
//! [`CounterStackMetrics`] (used by the test suites) to count them.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use sip_observe::{set_stack_metrics, TracingStackMetrics};
//! set_stack_metrics(Arc::new(TracingStackMetrics));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Metrics sink used by the stack to report events.
///
/// Implementations should treat the arguments as low-cardinality labels and
/// must not block: calls arrive from the transport receive loops.
pub trait StackMetrics: Send + Sync + 'static {
    fn on_packet_received(&self) {}
    fn on_packet_sent(&self) {}
    /// A datagram failed to parse and was answered or dropped.
    fn on_parse_failure(&self) {}
    /// A datagram was dropped without any reply.
    fn on_dropped_datagram(&self) {}
    /// A response arrived that matched no client transaction.
    fn on_orphan_response(&self) {}
    fn on_transaction_created(&self, role: &'static str) {
        let _ = role;
    }
    fn on_transaction_terminated(&self, role: &'static str, reason: &str) {
        let _ = (role, reason);
    }
    fn on_dialog_state(&self, state: &'static str) {
        let _ = state;
    }
}

#[derive(Debug, Default)]
struct NoopStackMetrics;

impl StackMetrics for NoopStackMetrics {}

static STACK_METRICS: OnceCell<Arc<dyn StackMetrics>> = OnceCell::new();
static NOOP: NoopStackMetrics = NoopStackMetrics;

/// Installs the global metrics sink. Returns `false` if one was installed
/// already (the first install wins).
pub fn set_stack_metrics(metrics: Arc<dyn StackMetrics>) -> bool {
    STACK_METRICS.set(metrics).is_ok()
}

/// Returns the configured sink, or the no-op default.
pub fn stack_metrics() -> &'static dyn StackMetrics {
    STACK_METRICS
        .get()
        .map(|arc| arc.as_ref())
        .unwrap_or(&NOOP)
}

/// Sink that logs every event through `tracing` at debug/warn level.
#[derive(Debug, Default)]
pub struct TracingStackMetrics;

impl StackMetrics for TracingStackMetrics {
    fn on_packet_received(&self) {
        tracing::trace!("packet received");
    }

    fn on_packet_sent(&self) {
        tracing::trace!("packet sent");
    }

    fn on_parse_failure(&self) {
        tracing::warn!("datagram failed to parse");
    }

    fn on_dropped_datagram(&self) {
        tracing::debug!("datagram dropped");
    }

    fn on_orphan_response(&self) {
        tracing::debug!("orphan response dropped");
    }

    fn on_transaction_created(&self, role: &'static str) {
        tracing::debug!(role, "transaction created");
    }

    fn on_transaction_terminated(&self, role: &'static str, reason: &str) {
        tracing::debug!(role, reason, "transaction terminated");
    }

    fn on_dialog_state(&self, state: &'static str) {
        tracing::debug!(state, "dialog state change");
    }
}

/// Atomic-counter sink. Instances are shared with the code under test so
/// suites can assert the counter invariants directly.
#[derive(Debug, Default)]
pub struct CounterStackMetrics {
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub parse_failures: AtomicU64,
    pub dropped_datagrams: AtomicU64,
    pub orphan_responses: AtomicU64,
    pub transactions_created: AtomicU64,
    pub transactions_terminated: AtomicU64,
}

impl CounterStackMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl StackMetrics for CounterStackMetrics {
    fn on_packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    fn on_packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn on_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn on_dropped_datagram(&self) {
        self.dropped_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    fn on_orphan_response(&self) {
        self.orphan_responses.fetch_add(1, Ordering::Relaxed);
    }

    fn on_transaction_created(&self, _role: &'static str) {
        self.transactions_created.fetch_add(1, Ordering::Relaxed);
    }

    fn on_transaction_terminated(&self, _role: &'static str, _reason: &str) {
        self.transactions_terminated.fetch_add(1, Ordering::Relaxed);
    }
}
