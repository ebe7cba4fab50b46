//! Keepalive driver: periodic liveness probes.
//!
//! Each side ticks at the negotiated interval and sends
//! KEEPALIVE(RESPOND=1) carrying its receive position; the dispatcher
//! answers probes with RESPOND cleared and refreshes the receive deadline on
//! every inbound frame. Deadline enforcement itself lives in the dispatcher
//! read loop — never in OS socket options.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::resume::Positions;
use super::writer::FrameSender;
use crate::frame::Frame;

pub(crate) fn spawn_keepalive(
    sender: FrameSender,
    positions: Arc<Positions>,
    interval: Duration,
    mut closed: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the connection is fresh then.
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let probe = Frame::keepalive(true, positions.received(), Bytes::new());
                    if let Err(e) = sender.send(probe).await {
                        tracing::debug!("Keepalive probe not sent: {}", e);
                    }
                }
            }
        }
    })
}
