//! The background poll loop.
//!
//! One per node. It wakes on the poll timer, on gossip notifications, on
//! poll-interval mutations, and on shutdown. A zero interval stops the
//! timer entirely; gossip notifications keep working and still trigger
//! catalog reads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;

use crate::catalog::CatalogError;
use crate::registry::Registry;

pub(crate) fn run(registry: Arc<Registry>, shutdown: Receiver<()>) {
    let (interval_tx, interval_rx) = crossbeam::channel::bounded(1);
    registry.settings().watch_poll_interval(interval_tx);

    // On a node without a gossip transport the notification senders are
    // gone and these channels sit disconnected; the first receive error
    // swaps in a channel that never fires.
    let mut update_rx = registry.gossip_update_rx();
    let mut cancel_rx = registry.gossip_cancel_rx();

    // None until the first poll; the timer then fires immediately, so a
    // freshly started node reads the catalog right away.
    let mut last_poll: Option<Instant> = None;

    loop {
        let interval = registry.settings().poll_interval();
        let tick = if interval.is_zero() {
            crossbeam::channel::never()
        } else {
            let wait = match last_poll {
                Some(at) => (at + interval).saturating_duration_since(Instant::now()),
                None => Duration::ZERO,
            };
            crossbeam::channel::after(wait)
        };

        crossbeam::select! {
            // Interval mutated: recompute the deadline before waiting again.
            recv(interval_rx) -> _ => continue,
            recv(update_rx) -> msg => {
                match msg {
                    // Already known locally; the catalog holds nothing new.
                    Ok(id) if registry.find_request(id) => continue,
                    Ok(_) => {}
                    Err(_) => {
                        update_rx = crossbeam::channel::never();
                        continue;
                    }
                }
            }
            recv(cancel_rx) -> msg => {
                // Removal needs no catalog read.
                match msg {
                    Ok(id) => registry.cancel_request_locally(id),
                    Err(_) => cancel_rx = crossbeam::channel::never(),
                }
                continue;
            }
            recv(tick) -> _ => {}
            recv(shutdown) -> _ => return,
        }

        if let Err(err) = registry.poll_requests() {
            match err {
                CatalogError::ShuttingDown => {}
                err => {
                    tracing::warn!(%err, "failed to poll statement diagnostics requests");
                }
            }
        }
        last_poll = Some(Instant::now());
    }
}
