//! The shared ticketing engine.
//!
//! All cross-connection state — observations, registered dispatchers,
//! per-plate day coverage, and the deferred-ticket queue — lives here,
//! owned by a single task. Sessions never touch this state directly;
//! they talk to it through an [`EngineHandle`], a cheap `Clone`-able
//! wrapper around an unbounded command channel. Because the channel has
//! exactly one consumer, every `register`/`deregister`/`submit` is
//! observed in a single total order without a lock, the same guarantee
//! the teacher's `Controller`/`ControllerMessage` pair provides.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::wire::{Frame, Ticket};

pub type PeerId = u64;

/// How long the engine will wait for a dispatcher's outbound queue to
/// have room before giving up on that delivery attempt and falling
/// back to the pending queue. See spec §5 Backpressure.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observation {
    mile: u16,
    timestamp: u32,
}

/// A handle to the engine's single command queue. Cloning is cheap and
/// safe to hand to every connection task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

enum Command {
    RegisterDispatcher {
        peer: PeerId,
        roads: Vec<u16>,
        outbound: mpsc::Sender<Frame>,
    },
    Deregister {
        peer: PeerId,
    },
    Submit {
        plate: String,
        road: u16,
        mile: u16,
        limit: u16,
        timestamp: u32,
    },
}

impl EngineHandle {
    /// Register `peer` as a dispatcher for `roads`, delivering any
    /// tickets already pending for those roads.
    pub fn register_dispatcher(&self, peer: PeerId, roads: Vec<u16>, outbound: mpsc::Sender<Frame>) {
        self.send(Command::RegisterDispatcher {
            peer,
            roads,
            outbound,
        });
    }

    /// Remove `peer` from every road it was dispatching for. A no-op
    /// for peers that never registered as a dispatcher (cameras have
    /// nothing to undo, per spec §4.5).
    pub fn deregister(&self, peer: PeerId) {
        self.send(Command::Deregister { peer });
    }

    /// Record a Plate observation from a camera and issue/deliver any
    /// tickets it causes.
    pub fn submit(&self, plate: String, road: u16, mile: u16, limit: u16, timestamp: u32) {
        self.send(Command::Submit {
            plate,
            road,
            mile,
            limit,
            timestamp,
        });
    }

    fn send(&self, command: Command) {
        // The only way this fails is if the engine task has already
        // shut down, which only happens at process exit.
        let _ = self.tx.send(command);
    }
}

/// Spawn the engine's single-consumer task and return a handle to it.
pub fn spawn() -> EngineHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(rx));
    EngineHandle { tx }
}

#[tracing::instrument(skip(rx))]
async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut engine = Engine::default();

    while let Some(command) = rx.recv().await {
        match command {
            Command::RegisterDispatcher {
                peer,
                roads,
                outbound,
            } => {
                debug!(peer, ?roads, "registering dispatcher");
                engine.register_dispatcher(peer, roads, outbound).await;
            }
            Command::Deregister { peer } => {
                debug!(peer, "deregistering dispatcher");
                engine.deregister(peer);
            }
            Command::Submit {
                plate,
                road,
                mile,
                limit,
                timestamp,
            } => {
                let tickets = engine.record_observation(plate, road, mile, limit, timestamp);
                for ticket in tickets {
                    info!(?ticket, "issuing ticket");
                    engine.deliver(ticket).await;
                }
            }
        }
    }
}

#[derive(Default)]
struct Engine {
    observations: HashMap<(String, u16), Vec<Observation>>,
    dispatchers_by_road: HashMap<u16, BTreeMap<PeerId, mpsc::Sender<Frame>>>,
    dispatcher_roads: HashMap<PeerId, Vec<u16>>,
    ticketed_days: HashMap<String, HashSet<u32>>,
    pending_by_road: HashMap<u16, VecDeque<Ticket>>,
}

impl Engine {
    /// Record one Plate observation and return every ticket it causes,
    /// in the order their days were consumed. Pure and synchronous so
    /// it can be unit-tested without a running engine task.
    fn record_observation(
        &mut self,
        plate: String,
        road: u16,
        mile: u16,
        limit: u16,
        timestamp: u32,
    ) -> Vec<Ticket> {
        let new_obs = Observation { mile, timestamp };

        let mut prior = self
            .observations
            .get(&(plate.clone(), road))
            .cloned()
            .unwrap_or_default();
        prior.sort_by_key(|o| o.timestamp);

        let covered = self.ticketed_days.entry(plate.clone()).or_default();

        let mut issued = Vec::new();
        for other in &prior {
            if other.timestamp == new_obs.timestamp {
                // Delta t = 0: no finite speed, no candidate.
                continue;
            }

            let (a, b) = if other.timestamp < new_obs.timestamp {
                (*other, new_obs)
            } else {
                (new_obs, *other)
            };

            let distance = f64::from(a.mile.abs_diff(b.mile));
            let dt_seconds = f64::from(b.timestamp - a.timestamp);
            let avg_mph = distance * 3600.0 / dt_seconds;

            if avg_mph < f64::from(limit) {
                continue;
            }

            let day_start = a.timestamp / 86_400;
            let day_end = b.timestamp / 86_400;
            if (day_start..=day_end).any(|day| covered.contains(&day)) {
                continue;
            }
            covered.extend(day_start..=day_end);

            let speed_hundredths = (avg_mph * 100.0).round().clamp(0.0, f64::from(u16::MAX));
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let speed = speed_hundredths as u16;

            issued.push(Ticket {
                plate: plate.clone(),
                road,
                mile1: a.mile,
                timestamp1: a.timestamp,
                mile2: b.mile,
                timestamp2: b.timestamp,
                speed,
            });
        }

        self.observations
            .entry((plate, road))
            .or_default()
            .push(new_obs);

        issued
    }

    async fn register_dispatcher(
        &mut self,
        peer: PeerId,
        roads: Vec<u16>,
        outbound: mpsc::Sender<Frame>,
    ) {
        for &road in &roads {
            self.dispatchers_by_road
                .entry(road)
                .or_default()
                .insert(peer, outbound.clone());
        }
        self.dispatcher_roads.insert(peer, roads.clone());

        for road in roads {
            let pending: Vec<Ticket> = self
                .pending_by_road
                .get_mut(&road)
                .map(|q| q.drain(..).collect())
                .unwrap_or_default();
            for ticket in pending {
                self.deliver(ticket).await;
            }
        }
    }

    fn deregister(&mut self, peer: PeerId) {
        if let Some(roads) = self.dispatcher_roads.remove(&peer) {
            for road in roads {
                if let Some(peers) = self.dispatchers_by_road.get_mut(&road) {
                    peers.remove(&peer);
                }
            }
        }
    }

    /// Deliver `ticket` to the earliest-registered live dispatcher for
    /// its road, or queue it if none is currently connected. A ticket
    /// is delivered at most once, ever.
    async fn deliver(&mut self, ticket: Ticket) {
        loop {
            let candidate = self
                .dispatchers_by_road
                .get(&ticket.road)
                .and_then(|peers| peers.iter().next())
                .map(|(&peer, tx)| (peer, tx.clone()));

            let Some((peer, tx)) = candidate else {
                self.pending_by_road
                    .entry(ticket.road)
                    .or_default()
                    .push_back(ticket);
                return;
            };

            match tokio::time::timeout(DELIVERY_TIMEOUT, tx.send(Frame::Ticket(ticket.clone())))
                .await
            {
                Ok(Ok(())) => return,
                Ok(Err(_)) | Err(_) => {
                    warn!(peer, "dispatcher unreachable, trying next");
                    if let Some(peers) = self.dispatchers_by_road.get_mut(&ticket.road) {
                        peers.remove(&peer);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(road: u16, mile1: u16, t1: u32, mile2: u16, t2: u32, speed: u16) -> Ticket {
        Ticket {
            plate: "UN1X".into(),
            road,
            mile1,
            timestamp1: t1,
            mile2,
            timestamp2: t2,
            speed,
        }
    }

    /// S1: basic violation, one day.
    #[test]
    fn basic_violation_issues_one_ticket() {
        let mut engine = Engine::default();
        assert!(engine
            .record_observation("UN1X".into(), 123, 8, 60, 0)
            .is_empty());
        let tickets = engine.record_observation("UN1X".into(), 123, 9, 60, 45);
        assert_eq!(tickets, vec![ticket(123, 8, 0, 9, 45, 8000)]);
    }

    /// S3: three observations in one day, one ticket covering the day.
    #[test]
    fn per_day_uniqueness_collapses_overlapping_spans() {
        let mut engine = Engine::default();
        let mut all = Vec::new();
        all.extend(engine.record_observation("UN1X".into(), 1, 0, 30, 0));
        all.extend(engine.record_observation("UN1X".into(), 1, 1, 30, 30));
        all.extend(engine.record_observation("UN1X".into(), 1, 2, 30, 60));
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], ticket(1, 0, 0, 1, 30, 12_000));
    }

    /// S4: average speed exactly at the limit still tickets; one mph
    /// over the limit does not omit the ticket; raising the limit past
    /// the observed average suppresses it.
    #[test]
    fn boundary_speed_at_limit_is_ticketed() {
        let mut engine = Engine::default();
        engine.record_observation("UN1X".into(), 1, 0, 100, 0);
        let tickets = engine.record_observation("UN1X".into(), 1, 100, 100, 3600);
        assert_eq!(tickets, vec![ticket(1, 0, 0, 100, 3600, 10_000)]);
    }

    #[test]
    fn boundary_speed_just_below_limit_is_not_ticketed() {
        let mut engine = Engine::default();
        engine.record_observation("UN1X".into(), 1, 0, 101, 0);
        assert!(engine
            .record_observation("UN1X".into(), 1, 100, 101, 3600)
            .is_empty());
    }

    /// Equal timestamps on the same plate/road never produce a ticket
    /// against each other (delta t = 0 is not a finite speed).
    #[test]
    fn equal_timestamps_never_ticket_each_other() {
        let mut engine = Engine::default();
        engine.record_observation("UN1X".into(), 1, 0, 60, 100);
        let tickets = engine.record_observation("UN1X".into(), 1, 5, 60, 100);
        assert!(tickets.is_empty());
    }

    /// No two tickets for the same plate ever cover a common day
    /// (invariant 1), even across many submissions.
    #[test]
    fn never_double_tickets_the_same_day() {
        let mut engine = Engine::default();
        let mut issued = Vec::new();
        issued.extend(engine.record_observation("UN1X".into(), 1, 0, 30, 0));
        issued.extend(engine.record_observation("UN1X".into(), 1, 1, 30, 40));
        issued.extend(engine.record_observation("UN1X".into(), 1, 2, 30, 80));
        issued.extend(engine.record_observation("UN1X".into(), 1, 3, 30, 120));

        let mut days_seen = HashSet::new();
        for t in &issued {
            let day1 = t.timestamp1 / 86_400;
            let day2 = t.timestamp2 / 86_400;
            for day in day1..=day2 {
                assert!(days_seen.insert(day), "day {day} covered twice");
            }
        }
    }

    #[tokio::test]
    async fn deferred_ticket_is_delivered_once_a_dispatcher_registers() {
        let mut engine = Engine::default();
        engine.record_observation("UN1X".into(), 123, 8, 60, 0);
        let tickets = engine.record_observation("UN1X".into(), 123, 9, 60, 45);
        for t in tickets {
            engine.deliver(t).await;
        }
        assert_eq!(engine.pending_by_road[&123].len(), 1);

        let (tx, mut rx) = mpsc::channel(8);
        engine.register_dispatcher(1, vec![123], tx).await;
        assert!(engine.pending_by_road.get(&123).map_or(true, |q| q.is_empty()));

        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, Frame::Ticket(_)));
    }

    #[tokio::test]
    async fn deregistering_a_dispatcher_stops_future_delivery_to_it() {
        let mut engine = Engine::default();
        let (tx, rx) = mpsc::channel(8);
        engine.register_dispatcher(1, vec![123], tx).await;
        engine.deregister(1);
        drop(rx);

        engine.record_observation("UN1X".into(), 123, 8, 60, 0);
        let tickets = engine.record_observation("UN1X".into(), 123, 9, 60, 45);
        for t in tickets {
            engine.deliver(t).await;
        }
        assert_eq!(engine.pending_by_road[&123].len(), 1);
    }
}
