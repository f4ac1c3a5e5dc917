//! Speed daemon
//!
//! A centralized average-speed limit enforcement service for a network
//! of Automatic Number Plate Recognition cameras and ticket
//! dispatchers. Clients connect over TCP and speak a small binary
//! protocol (see [`wire`]): cameras report licence-plate sightings,
//! dispatchers receive tickets for roads they're responsible for, and
//! either kind of client may ask for periodic heartbeats.
//!
//! # Overview
//!
//! Each camera is on a specific road, at a specific mile marker, with a
//! specific speed limit; it reports every plate it observes along with
//! the timestamp of the observation. When the same plate is seen at two
//! points on the same road with an average speed at or above the
//! limit, the server generates a ticket and routes it to a dispatcher
//! registered for that road — waiting, if necessary, until one
//! connects. A plate is never ticketed twice for the same day (spec
//! §3, "Day").
//!
//! # Architecture
//!
//! - [`wire`] — the binary codec for the 7 frame types.
//! - [`framer`] — per-connection inbound/outbound frame queues.
//! - [`heartbeat`] — the per-connection heartbeat timer.
//! - [`session`] — the per-connection role state machine.
//! - [`engine`] — the shared, single-consumer ticketing engine.
//!
//! The engine is the only state shared across connections; everything
//! else lives for the lifetime of one TCP connection.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;
use tracing::info;

pub mod engine;
pub mod framer;
pub mod heartbeat;
pub mod session;
pub mod wire;

/// Accept connections until the listener errors, handing each one off
/// to its own [`session::run`] task. All connections share a single
/// [`engine::EngineHandle`].
///
/// # Errors
/// Returns an error if accepting a connection fails.
#[tracing::instrument(skip(listener))]
pub async fn run(listener: TcpListener) -> Result<(), anyhow::Error> {
    let engine = engine::spawn();
    let next_peer_id = AtomicU64::new(0);

    loop {
        let (stream, addr) = listener.accept().await?;
        let peer = next_peer_id.fetch_add(1, Ordering::Relaxed);

        info!(peer, %addr, "accepted connection");

        if let Err(err) = stream.set_nodelay(true) {
            tracing::warn!(peer, error = %err, "failed to set TCP_NODELAY");
        }

        tokio::spawn(session::run(peer, stream, engine.clone()));
    }
}
