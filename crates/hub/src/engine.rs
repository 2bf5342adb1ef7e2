//! The telemetry-to-state inference engine.
//!
//! One engine task owns all machine state and consumes a single queue of
//! readings and timer expiries, so nothing can interleave mid-mutation.
//!
//! ## Per-machine state machine
//!
//! ```text
//! Idle --[power > start]--> Running --[power < stop]--> PendingStop
//!  ^                          ^                             |
//!  |                          +--[power > start: cancel]----+
//!  +-----------[debounce elapsed: commit stop]--------------+
//! ```
//!
//! PendingStop is still "running" to the outside world; the debounce
//! absorbs the low-power phases a wash cycle legitimately passes through,
//! so one cycle is not recorded as several short runs.

use std::collections::HashMap;

use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info};

use crate::config::{ClassEntry, Config};
use crate::db::{format_runtime, Db};
use crate::payload::ChannelReading;
use crate::state::{Machine, MachineEvent, MachineEventKind, SharedState};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum EngineMsg {
    Reading(ChannelReading),
    /// A stop-debounce timer elapsed. Only honored while the generation
    /// matches the currently armed timer; anything else is a stale fire.
    StopElapsed { machine: i64, gen: u64 },
}

/// What one physical reading asks a machine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drive {
    Start,
    Stop,
    Hold,
}

// ---------------------------------------------------------------------------
// Runtime structures
// ---------------------------------------------------------------------------

struct ChannelRuntime {
    class: ClassEntry,
    /// Machine ids mapped to this meter, in configured order.
    units: Vec<i64>,
    /// Amperage above which a two-machine channel counts both as active.
    dual_current_threshold: f64,
}

struct Unit {
    machine: Machine,
    class: ClassEntry,
    /// Monotonic twin of `machine.started_at`, used for runtime math.
    run_began: Option<Instant>,
}

struct ArmedStop {
    gen: u64,
    /// Run start captured when the timer was armed. A brief recovery and
    /// re-dip re-arms with the same capture, so one continuous run is
    /// never split.
    run_began: Instant,
    abort: AbortHandle,
}

pub struct Engine {
    channels: HashMap<u8, ChannelRuntime>,
    units: HashMap<i64, Unit>,
    /// At most one live stop timer per machine; arming replaces, a start
    /// cancels.
    timers: HashMap<i64, ArmedStop>,
    next_gen: u64,
    db: Db,
    shared: SharedState,
    events: broadcast::Sender<MachineEvent>,
    /// Handed to timer tasks so expiries come back through the queue.
    tx: mpsc::Sender<EngineMsg>,
}

// ---------------------------------------------------------------------------
// Construction & run loop
// ---------------------------------------------------------------------------

impl Engine {
    pub fn new(
        cfg: &Config,
        db: Db,
        shared: SharedState,
        events: broadcast::Sender<MachineEvent>,
        tx: mpsc::Sender<EngineMsg>,
    ) -> Self {
        let mut channels = HashMap::new();
        let mut units = HashMap::new();

        for ch in &cfg.channels {
            let class = cfg.class(ch.class);
            channels.insert(
                ch.channel,
                ChannelRuntime {
                    class,
                    units: ch.machines.iter().map(|m| m.id).collect(),
                    dual_current_threshold: ch.dual_current_threshold.unwrap_or(f64::INFINITY),
                },
            );
            for m in &ch.machines {
                units.insert(
                    m.id,
                    Unit {
                        machine: Machine::idle(m.id, m.name.clone()),
                        class,
                        run_began: None,
                    },
                );
            }
        }

        Self {
            channels,
            units,
            timers: HashMap::new(),
            next_gen: 0,
            db,
            shared,
            events,
            tx,
        }
    }

    /// Consume the message queue until every sender is gone. Intended to be
    /// `tokio::spawn`-ed from main.
    pub async fn run(mut self, mut rx: mpsc::Receiver<EngineMsg>) {
        while let Some(msg) = rx.recv().await {
            self.handle(msg).await;
        }
    }

    pub async fn handle(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::Reading(r) => self.handle_reading(r).await,
            EngineMsg::StopElapsed { machine, gen } => {
                self.handle_stop_elapsed(machine, gen).await
            }
        }
    }

    // -----------------------------------------------------------------
    // Reading ingestion
    // -----------------------------------------------------------------

    async fn handle_reading(&mut self, r: ChannelReading) {
        let Some(ch) = self.channels.get(&r.channel) else {
            debug!(channel = r.channel, "reading for unmapped channel ignored");
            return;
        };

        let drives: Vec<(i64, Drive)> = match ch.units.as_slice() {
            [only] => vec![(*only, single_drive(&ch.class, r.power_w))],
            [first, second] => {
                let [a, b] = dual_drives(&ch.class, ch.dual_current_threshold, &r);
                vec![(*first, a), (*second, b)]
            }
            _ => Vec::new(), // validation bounds machine counts to 1..=2
        };

        for (id, drive) in drives {
            self.drive_unit(id, drive, r.power_w).await;
        }
    }

    async fn drive_unit(&mut self, id: i64, drive: Drive, power_w: f64) {
        let running = {
            let Some(unit) = self.units.get_mut(&id) else {
                return;
            };
            unit.machine.power_w = power_w;
            unit.machine.running
        };
        let armed = self.timers.contains_key(&id);

        match (drive, running, armed) {
            (Drive::Start, false, _) => self.start_run(id).await,
            (Drive::Start, true, true) => self.cancel_stop(id),
            (Drive::Stop, true, false) => self.arm_stop(id),
            _ => {}
        }

        self.publish_snapshot(id).await;
    }

    // -----------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------

    async fn start_run(&mut self, id: i64) {
        self.cancel_stop(id);

        let now = OffsetDateTime::now_utc();
        let snapshot = {
            let Some(unit) = self.units.get_mut(&id) else {
                return;
            };
            unit.machine.running = true;
            unit.machine.started_at = Some(now);
            unit.machine.last_started_at = Some(now);
            unit.run_began = Some(Instant::now());
            unit.machine.clone()
        };

        info!(
            machine = id,
            name = %snapshot.name,
            power_w = snapshot.power_w,
            "machine started"
        );

        if let Err(e) = self.db.record_start(id, &Db::today_utc()).await {
            error!(machine = id, "stats: record_start failed: {e:#}");
        }

        {
            let mut st = self.shared.write().await;
            st.record_machine(
                MachineEventKind::Started,
                format!("{} started ({:.0} W)", snapshot.name, snapshot.power_w),
            );
        }

        let _ = self.events.send(MachineEvent {
            kind: MachineEventKind::Started,
            machine: snapshot,
        });
    }

    fn arm_stop(&mut self, id: i64) {
        let (debounce_secs, run_began) = {
            let Some(unit) = self.units.get(&id) else {
                return;
            };
            let Some(run_began) = unit.run_began else {
                return;
            };
            (unit.class.debounce_secs, run_began)
        };

        eprintln!("DBG arm_stop now-run_began = {} ns", run_began.elapsed().as_nanos());
        self.cancel_stop(id);
        self.next_gen += 1;
        let gen = self.next_gen;

        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            sleep(Duration::from_secs(debounce_secs)).await;
            let _ = tx.send(EngineMsg::StopElapsed { machine: id, gen }).await;
        });

        self.timers.insert(
            id,
            ArmedStop {
                gen,
                run_began,
                abort: handle.abort_handle(),
            },
        );
        debug!(machine = id, debounce_secs, "stop debounce armed");
    }

    fn cancel_stop(&mut self, id: i64) {
        if let Some(armed) = self.timers.remove(&id) {
            armed.abort.abort();
            debug!(machine = id, "pending stop canceled, run continues");
        }
    }

    async fn handle_stop_elapsed(&mut self, id: i64, gen: u64) {
        let fresh = self.timers.get(&id).is_some_and(|a| a.gen == gen);
        if !fresh {
            return; // superseded while the expiry was in flight
        }
        let Some(armed) = self.timers.remove(&id) else {
            return;
        };

        let runtime_ms = armed.run_began.elapsed().as_millis() as i64;
        let snapshot = {
            let Some(unit) = self.units.get_mut(&id) else {
                return;
            };
            unit.machine.running = false;
            unit.machine.started_at = None;
            unit.run_began = None;
            unit.machine.clone()
        };

        info!(
            machine = id,
            name = %snapshot.name,
            runtime_ms,
            "machine stopped"
        );

        if let Err(e) = self.db.add_runtime(id, &Db::today_utc(), runtime_ms).await {
            error!(machine = id, "stats: add_runtime failed: {e:#}");
        }

        {
            let mut st = self.shared.write().await;
            st.record_machine(
                MachineEventKind::Stopped,
                format!(
                    "{} stopped after {}",
                    snapshot.name,
                    format_runtime(runtime_ms)
                ),
            );
        }

        let _ = self.events.send(MachineEvent {
            kind: MachineEventKind::Stopped,
            machine: snapshot.clone(),
        });

        self.publish_snapshot(id).await;
    }

    async fn publish_snapshot(&self, id: i64) {
        if let Some(unit) = self.units.get(&id) {
            let mut st = self.shared.write().await;
            st.machines.insert(id, unit.machine.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Drive derivation
// ---------------------------------------------------------------------------

fn single_drive(class: &ClassEntry, power_w: f64) -> Drive {
    if power_w > class.start_watts {
        Drive::Start
    } else if power_w < class.stop_watts {
        Drive::Stop
    } else {
        Drive::Hold
    }
}

/// Shared-circuit pairs: power says somebody is running, current says
/// whether it is one unit or both. One shared meter cannot tell WHICH unit
/// runs alone, so single-unit activity is always attributed to the first
/// machine of the pair. Telling them apart would need per-unit sensing.
fn dual_drives(class: &ClassEntry, current_threshold: f64, r: &ChannelReading) -> [Drive; 2] {
    if r.power_w > class.start_watts {
        let both = r.current_a.is_some_and(|c| c >= current_threshold);
        [Drive::Start, if both { Drive::Start } else { Drive::Stop }]
    } else if r.power_w < class.stop_watts {
        [Drive::Stop, Drive::Stop]
    } else {
        [Drive::Hold, Drive::Hold]
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::MonitorState;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tokio::time::advance;

    /// Washer on channel 1 (10 W / 5 W, 180 s debounce), dryer pair on
    /// channel 4 (100 W / 50 W, 120 s debounce, 3.5 A dual threshold).
    const CONFIG: &str = r#"
[[channels]]
channel = 1
class = "washer"
machines = [{ id = 1, name = "Washer 1" }]

[[channels]]
channel = 4
class = "dryer"
dual_current_threshold = 3.5
machines = [{ id = 5, name = "Dryer A" }, { id = 6, name = "Dryer B" }]
"#;

    struct Rig {
        engine: Engine,
        rx: mpsc::Receiver<EngineMsg>,
        events: broadcast::Receiver<MachineEvent>,
        db: Db,
        shared: SharedState,
    }

    async fn rig() -> Rig {
        let cfg: Config = toml::from_str(CONFIG).unwrap();
        cfg.validate().unwrap();

        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let machines = cfg
            .channels
            .iter()
            .flat_map(|c| c.machines.iter())
            .map(|m| Machine::idle(m.id, m.name.clone()))
            .collect();
        let shared: SharedState = Arc::new(RwLock::new(MonitorState::new(machines)));

        let (events_tx, events_rx) = broadcast::channel(64);
        let (tx, rx) = mpsc::channel(64);
        let engine = Engine::new(&cfg, db.clone(), shared.clone(), events_tx, tx);

        // The sqlite pool is connected above under the real clock; pausing
        // only now keeps every timer/runtime assertion below on a paused
        // clock without the pool's acquire timer racing the connect.
        tokio::time::pause();

        Rig {
            engine,
            rx,
            events: events_rx,
            db,
            shared,
        }
    }

    impl Rig {
        async fn reading(&mut self, channel: u8, power_w: f64, current_a: Option<f64>) {
            self.engine
                .handle(EngineMsg::Reading(ChannelReading {
                    channel,
                    power_w,
                    current_a,
                }))
                .await;
        }

        /// Wait for the next armed stop timer to expire (the paused clock
        /// auto-advances to its deadline) and deliver it to the engine.
        async fn fire_next_timer(&mut self) {
            let msg = self.rx.recv().await.expect("a stop timer should fire");
            self.engine.handle(msg).await;
        }

        fn drain_events(&mut self) -> Vec<MachineEvent> {
            let mut out = Vec::new();
            while let Ok(ev) = self.events.try_recv() {
                out.push(ev);
            }
            out
        }

        async fn machine(&self, id: i64) -> Machine {
            self.shared.read().await.machines[&id].clone()
        }

        async fn bucket(&self, id: i64) -> (i64, i64) {
            self.db
                .usage_since(&Db::today_utc())
                .await
                .unwrap()
                .into_iter()
                .find(|b| b.machine == id)
                .map(|b| (b.starts, b.runtime_ms))
                .unwrap_or((0, 0))
        }
    }

    // -- Starting ----------------------------------------------------------

    #[tokio::test]
    async fn rising_above_start_threshold_starts_exactly_once() {
        let mut rig = rig().await;

        rig.reading(1, 0.0, None).await;
        assert!(rig.drain_events().is_empty());

        rig.reading(1, 15.0, None).await;
        let events = rig.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MachineEventKind::Started);
        assert_eq!(events[0].machine.id, 1);
        assert!(events[0].machine.running);

        // Staying high produces no further events or counts.
        rig.reading(1, 400.0, None).await;
        rig.reading(1, 350.0, None).await;
        assert!(rig.drain_events().is_empty());
        assert_eq!(rig.bucket(1).await, (1, 0));

        let m = rig.machine(1).await;
        assert!(m.running);
        assert!(m.started_at.is_some());
        assert_eq!(m.last_started_at, m.started_at);
        assert_eq!(m.power_w, 350.0);
    }

    #[tokio::test]
    async fn power_at_threshold_does_not_start() {
        let mut rig = rig().await;
        rig.reading(1, 10.0, None).await; // must exceed, not equal
        assert!(rig.drain_events().is_empty());
        assert!(!rig.machine(1).await.running);
    }

    #[tokio::test]
    async fn unknown_channel_is_ignored() {
        let mut rig = rig().await;
        rig.reading(99, 5000.0, None).await;
        assert!(rig.drain_events().is_empty());
    }

    // -- Debounced stopping ------------------------------------------------

    #[tokio::test]
    async fn sustained_dip_stops_once_with_accumulated_runtime() {
        let mut rig = rig().await;

        rig.reading(1, 15.0, None).await;
        rig.drain_events();

        advance(Duration::from_secs(60)).await;
        rig.reading(1, 2.0, None).await; // arms the 180 s debounce
        assert!(rig.drain_events().is_empty()); // still "running"
        assert!(rig.machine(1).await.running);

        rig.fire_next_timer().await;
        let events = rig.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MachineEventKind::Stopped);

        let m = rig.machine(1).await;
        assert!(!m.running);
        assert!(m.started_at.is_none());
        assert!(m.last_started_at.is_some(), "last-used survives the stop");

        // 60 s running high + 180 s debounce window.
        assert_eq!(rig.bucket(1).await, (1, 240_000));
    }

    #[tokio::test]
    async fn brief_dip_does_not_split_a_run() {
        let mut rig = rig().await;

        rig.reading(1, 15.0, None).await;
        rig.drain_events();
        let started_at = rig.machine(1).await.started_at;

        advance(Duration::from_secs(30)).await;
        rig.reading(1, 2.0, None).await; // dip arms the timer
        advance(Duration::from_secs(15)).await;
        rig.reading(1, 20.0, None).await; // recovery cancels it

        // Long after the original debounce deadline, nothing fires.
        advance(Duration::from_secs(600)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(rig.rx.try_recv().is_err(), "canceled timer must not fire");
        assert!(rig.drain_events().is_empty());

        let m = rig.machine(1).await;
        assert!(m.running);
        assert_eq!(m.started_at, started_at, "run continuity preserved");
        assert_eq!(rig.bucket(1).await, (1, 0));
    }

    #[tokio::test]
    async fn hysteresis_band_holds_running_state() {
        let mut rig = rig().await;

        rig.reading(1, 15.0, None).await;
        rig.drain_events();

        // Between stop (5 W) and start (10 W): neither arms nor starts.
        rig.reading(1, 7.0, None).await;
        advance(Duration::from_secs(600)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(rig.rx.try_recv().is_err());
        assert!(rig.machine(1).await.running);
    }

    #[tokio::test]
    async fn hysteresis_band_holds_idle_state() {
        let mut rig = rig().await;
        rig.reading(1, 7.0, None).await;
        assert!(rig.drain_events().is_empty());
        assert!(!rig.machine(1).await.running);
    }

    #[tokio::test]
    async fn redip_rearms_without_splitting_runtime() {
        let mut rig = rig().await;

        rig.reading(1, 15.0, None).await;
        rig.drain_events();

        advance(Duration::from_secs(100)).await;
        rig.reading(1, 2.0, None).await; // arm #1
        advance(Duration::from_secs(50)).await;
        rig.reading(1, 20.0, None).await; // cancel
        advance(Duration::from_secs(50)).await;
        rig.reading(1, 2.0, None).await; // arm #2

        rig.fire_next_timer().await;
        let events = rig.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MachineEventKind::Stopped);

        // One run: 100 + 50 + 50 + 180 s of debounce tail.
        assert_eq!(rig.bucket(1).await, (1, 380_000));
    }

    /// The full washer walkthrough: 0 W, 15 W, 2 W @ +30 s, 20 W @ +45 s,
    /// 2 W @ +5 min, then the debounce window runs out.
    #[tokio::test]
    async fn washer_cycle_with_midcycle_dip() {
        let mut rig = rig().await;

        rig.reading(1, 0.0, None).await;
        rig.reading(1, 15.0, None).await;
        advance(Duration::from_secs(30)).await;
        rig.reading(1, 2.0, None).await;
        advance(Duration::from_secs(15)).await;
        rig.reading(1, 20.0, None).await;
        advance(Duration::from_secs(255)).await;
        rig.reading(1, 2.0, None).await;

        rig.fire_next_timer().await;

        let events = rig.drain_events();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![MachineEventKind::Started, MachineEventKind::Stopped]
        );

        // Runtime spans the original 15 W reading through debounce expiry:
        // 300 s of cycle + 180 s of debounce.
        assert_eq!(rig.bucket(1).await, (1, 480_000));
    }

    // -- Dual-occupancy channels -------------------------------------------

    #[tokio::test]
    async fn low_current_activates_first_unit_only() {
        let mut rig = rig().await;

        rig.reading(4, 120.0, Some(2.0)).await;
        let events = rig.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].machine.id, 5);

        assert!(rig.machine(5).await.running);
        assert!(!rig.machine(6).await.running);
    }

    #[tokio::test]
    async fn high_current_activates_both_units() {
        let mut rig = rig().await;

        rig.reading(4, 120.0, Some(2.0)).await;
        rig.drain_events();

        rig.reading(4, 240.0, Some(4.0)).await;
        let events = rig.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].machine.id, 6);

        assert!(rig.machine(5).await.running);
        assert!(rig.machine(6).await.running);
        assert_eq!(rig.bucket(5).await.0, 1);
        assert_eq!(rig.bucket(6).await.0, 1);
    }

    #[tokio::test]
    async fn missing_current_attributes_to_first_unit() {
        let mut rig = rig().await;
        rig.reading(4, 150.0, None).await;
        assert!(rig.machine(5).await.running);
        assert!(!rig.machine(6).await.running);
    }

    #[tokio::test]
    async fn current_drop_stops_second_unit_only() {
        let mut rig = rig().await;

        rig.reading(4, 240.0, Some(4.0)).await;
        rig.drain_events();
        assert!(rig.machine(6).await.running);

        // Power still high, current back under the pair threshold: the
        // second unit winds down through its own debounce.
        rig.reading(4, 120.0, Some(2.0)).await;
        rig.fire_next_timer().await;

        let events = rig.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MachineEventKind::Stopped);
        assert_eq!(events[0].machine.id, 6);

        assert!(rig.machine(5).await.running);
        assert!(!rig.machine(6).await.running);
    }

    #[tokio::test]
    async fn low_power_stops_both_units() {
        let mut rig = rig().await;

        rig.reading(4, 240.0, Some(4.0)).await;
        rig.drain_events();

        advance(Duration::from_secs(60)).await;
        // Below the stop threshold; current is irrelevant here.
        rig.reading(4, 30.0, Some(4.0)).await;

        rig.fire_next_timer().await;
        rig.fire_next_timer().await;

        let mut stopped: Vec<i64> = rig
            .drain_events()
            .into_iter()
            .map(|e| e.machine.id)
            .collect();
        stopped.sort_unstable();
        assert_eq!(stopped, vec![5, 6]);

        assert!(!rig.machine(5).await.running);
        assert!(!rig.machine(6).await.running);
        // Both accumulated the same 60 s + 120 s debounce tail.
        assert_eq!(rig.bucket(5).await, (1, 180_000));
        assert_eq!(rig.bucket(6).await, (1, 180_000));
    }
}
