//! Per-connection role/lifecycle state machine.
//!
//! A session starts `Unidentified`, becomes a `Camera` or `Dispatcher`
//! on the first identifying frame, and is torn down the moment any
//! frame violates the transition table in spec §4.4. The session owns
//! its [`Framer`] outright — the framer never holds a reference back to
//! the session, which is what lets each be dropped independently.

use std::ops::ControlFlow;
use std::sync::atomic::Ordering;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::engine::{EngineHandle, PeerId};
use crate::framer::Framer;
use crate::heartbeat::Heartbeat;
use crate::wire::{self, Frame, IAmCamera, IAmDispatcher, Plate, WantHeartbeat};

#[derive(Debug, Clone, Copy)]
enum Role {
    Unidentified,
    Camera { road: u16, mile: u16, limit: u16 },
    Dispatcher,
}

/// Drive one connection to completion. Returns once the peer
/// disconnects or the session closes it for a protocol violation.
#[tracing::instrument(skip(stream, engine))]
pub async fn run(peer: PeerId, stream: TcpStream, engine: EngineHandle) {
    let mut framer = Framer::spawn(stream);
    let mut heartbeat = Heartbeat::default();
    let mut role = Role::Unidentified;

    loop {
        tokio::select! {
            frame = framer.inbound.recv() => {
                let Some(frame) = frame else { break };

                match handle_frame(peer, frame, &mut role, &mut heartbeat, &engine, &framer.outbound).await {
                    ControlFlow::Continue(()) => {}
                    ControlFlow::Break(reason) => {
                        warn!(peer, reason, "closing connection for protocol violation");
                        let _ = framer
                            .outbound
                            .send(Frame::Error(wire::Error::new(reason)))
                            .await;
                        break;
                    }
                }
            }

            () = heartbeat.tick() => {
                debug!(peer, "sending heartbeat");
                if framer.outbound.send(Frame::Heartbeat).await.is_err() {
                    break;
                }
            }
        }
    }

    if framer.flags.bad_frame_seen.load(Ordering::Relaxed) {
        let _ = framer
            .outbound
            .send(Frame::Error(wire::Error::new("malformed frame")))
            .await;
    }

    // Deregister before closing: the engine holds a clone of
    // `framer.outbound` for ticket delivery, so the writer's queue never
    // observes `None` (and `close()` never returns) until that clone is
    // dropped, which only happens once `Deregister` is processed.
    engine.deregister(peer);
    framer.close().await;
    info!(peer, "session closed");
}

/// Apply one inbound frame to the state machine. `Break(reason)` means
/// the caller must send an `Error(reason)` frame and close.
async fn handle_frame(
    peer: PeerId,
    frame: Frame,
    role: &mut Role,
    heartbeat: &mut Heartbeat,
    engine: &EngineHandle,
    outbound: &tokio::sync::mpsc::Sender<Frame>,
) -> ControlFlow<&'static str> {
    if let Frame::WantHeartbeat(WantHeartbeat { interval }) = frame {
        return match heartbeat.activate(interval) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break("already requested heartbeat"),
        };
    }

    let current = *role;
    match (current, frame) {
        (Role::Unidentified, Frame::IAmCamera(IAmCamera { road, mile, limit })) => {
            info!(peer, road, mile, limit, "identified as camera");
            *role = Role::Camera { road, mile, limit };
            ControlFlow::Continue(())
        }

        (Role::Unidentified, Frame::IAmDispatcher(IAmDispatcher { roads })) => {
            info!(peer, ?roads, "identified as dispatcher");
            engine.register_dispatcher(peer, roads, outbound.clone());
            *role = Role::Dispatcher;
            ControlFlow::Continue(())
        }

        (Role::Unidentified, Frame::Plate(_)) => ControlFlow::Break("plate before identification"),

        (Role::Camera { .. }, Frame::IAmCamera(_) | Frame::IAmDispatcher(_))
        | (Role::Dispatcher, Frame::IAmCamera(_) | Frame::IAmDispatcher(_)) => {
            ControlFlow::Break("already identified")
        }

        (Role::Camera { road, mile, limit }, Frame::Plate(Plate { plate, timestamp })) => {
            engine.submit(plate, road, mile, limit, timestamp);
            ControlFlow::Continue(())
        }

        (Role::Dispatcher, Frame::Plate(_)) => ControlFlow::Break("dispatcher cannot send plates"),

        (_, Frame::Heartbeat | Frame::Ticket(_) | Frame::Error(_)) => {
            ControlFlow::Break("unexpected server-to-client frame")
        }
    }
}
