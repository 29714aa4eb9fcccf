//! Request handler invoked for every publish on the wake topic
//!
//! Runs on the bus delivery task. It must never fail outward: every problem
//! is logged here and the message counts as consumed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::wake::{decode_request, BroadcastTarget, WakeDispatcher, WakeOutcome};

/// Counters for handled and dropped requests
#[derive(Debug, Default)]
pub struct HandlerStats {
    pub dispatched: AtomicUsize,
    pub dropped: AtomicUsize,
}

/// Decodes wake requests and forwards them to the dispatcher
///
/// Only holds shared immutable state and atomics, so it can be called from
/// several delivery tasks at once.
pub struct RequestHandler {
    dispatcher: WakeDispatcher,
    targets: Arc<[BroadcastTarget]>,
    stats: HandlerStats,
}

impl RequestHandler {
    pub fn new(dispatcher: WakeDispatcher, targets: Vec<BroadcastTarget>) -> Self {
        Self {
            dispatcher,
            targets: targets.into(),
            stats: HandlerStats::default(),
        }
    }

    pub fn handle(&self, payload: &[u8]) {
        self.try_handle(payload);
    }

    /// Same as [`handle`](Self::handle) but hands the outcomes back
    ///
    /// Returns `None` when the payload was dropped.
    pub fn try_handle(&self, payload: &[u8]) -> Option<Vec<WakeOutcome>> {
        let request = match decode_request(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    "Dropping wake request ({}): {}",
                    e.reason(),
                    String::from_utf8_lossy(payload)
                );
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        info!(
            "Sending wake on lan to ({}) mac: {}",
            request.label, request.target_address
        );
        let outcomes = self
            .dispatcher
            .dispatch(request.target_address, &self.targets);
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);

        for outcome in &outcomes {
            if outcome.succeeded {
                info!("Wake packet for {} sent: {}", request.target_address, outcome);
            } else {
                warn!("Wake packet for {} not sent: {}", request.target_address, outcome);
            }
        }

        Some(outcomes)
    }

    pub fn stats(&self) -> &HandlerStats {
        &self.stats
    }
}
