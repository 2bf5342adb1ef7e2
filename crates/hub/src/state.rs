use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// Longest stored prefix of a raw payload kept for debugging.
const MAX_PAYLOAD_CHARS: usize = 240;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<MonitorState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// One laundry machine as the outside world sees it. The engine task owns
/// the authoritative copy; everything here is a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Machine {
    pub id: i64,
    pub name: String,
    /// Last observed power on the machine's meter channel, watts.
    pub power_w: f64,
    pub running: bool,
    /// When the current run began. None while idle.
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    /// When the most recent run began, retained across stops for
    /// "last used" display.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_started_at: Option<OffsetDateTime>,
}

impl Machine {
    pub fn idle(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            power_w: 0.0,
            running: false,
            started_at: None,
            last_started_at: None,
        }
    }
}

/// Start/stop notification carrying the full machine record.
#[derive(Debug, Clone, Serialize)]
pub struct MachineEvent {
    pub kind: MachineEventKind,
    pub machine: Machine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineEventKind {
    Started,
    Stopped,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Stop,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct MonitorState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    /// Snapshots keyed by machine id; BTreeMap keeps listings ordered.
    pub machines: BTreeMap<i64, Machine>,
    pub messages_seen: u64,
    pub last_message_at: Option<OffsetDateTime>,
    /// Truncated copy of the most recent raw payload. Debugging aid for
    /// unexpected device shapes; never read by transition logic.
    pub last_payload: Option<String>,
    pub last_error: Option<String>,
    pub events: VecDeque<SystemEvent>,
}

// ---------------------------------------------------------------------------
// JSON response (what the debug API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct DebugResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub messages_seen: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    pub last_payload: Option<String>,
    pub last_error: Option<String>,
    pub process_memory_bytes: Option<u64>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl MonitorState {
    pub fn new(machines: Vec<Machine>) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            machines: machines.into_iter().map(|m| (m.id, m)).collect(),
            messages_seen: 0,
            last_message_at: None,
            last_payload: None,
            last_error: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Note an inbound broker message, whatever its shape.
    pub fn note_message(&mut self, payload: &[u8]) {
        self.messages_seen += 1;
        self.last_message_at = Some(OffsetDateTime::now_utc());
        self.last_payload = Some(
            String::from_utf8_lossy(payload)
                .chars()
                .take(MAX_PAYLOAD_CHARS)
                .collect(),
        );
    }

    /// Record an error event and remember it as the latest error.
    pub fn record_error(&mut self, detail: String) {
        self.last_error = Some(detail.clone());
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Record a machine start/stop in the event ring.
    pub fn record_machine(&mut self, kind: MachineEventKind, detail: String) {
        let kind = match kind {
            MachineEventKind::Started => EventKind::Start,
            MachineEventKind::Stopped => EventKind::Stop,
        };
        self.push_event(kind, detail);
    }

    pub fn machines_snapshot(&self) -> Vec<Machine> {
        self.machines.values().cloned().collect()
    }

    /// Build the JSON-serialisable diagnostics snapshot.
    pub fn to_debug(&self, process_memory_bytes: Option<u64>) -> DebugResponse {
        DebugResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            messages_seen: self.messages_seen,
            last_message_at: self.last_message_at,
            last_payload: self.last_payload.clone(),
            last_error: self.last_error.clone(),
            process_memory_bytes,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_seeds_idle_machines() {
        let st = MonitorState::new(vec![Machine::idle(2, "Washer 2"), Machine::idle(1, "Washer 1")]);
        let snap = st.machines_snapshot();
        assert_eq!(snap.len(), 2);
        // Ordered by id regardless of insertion order.
        assert_eq!(snap[0].id, 1);
        assert_eq!(snap[1].id, 2);
        assert!(!snap[0].running);
        assert!(snap[0].started_at.is_none());
    }

    #[test]
    fn note_message_tracks_count_and_payload() {
        let mut st = MonitorState::new(vec![]);
        st.note_message(br#"{"power":[1.0]}"#);
        st.note_message(br#"{"power":[2.0]}"#);

        assert_eq!(st.messages_seen, 2);
        assert!(st.last_message_at.is_some());
        assert_eq!(st.last_payload.as_deref(), Some(r#"{"power":[2.0]}"#));
    }

    #[test]
    fn note_message_truncates_long_payloads() {
        let mut st = MonitorState::new(vec![]);
        let big = vec![b'x'; 10_000];
        st.note_message(&big);
        assert_eq!(st.last_payload.as_ref().unwrap().len(), 240);
    }

    #[test]
    fn note_message_tolerates_invalid_utf8() {
        let mut st = MonitorState::new(vec![]);
        st.note_message(&[0xff, 0xfe, b'a']);
        assert!(st.last_payload.is_some());
    }

    #[test]
    fn record_error_keeps_latest() {
        let mut st = MonitorState::new(vec![]);
        st.record_error("first".into());
        st.record_error("second".into());
        assert_eq!(st.last_error.as_deref(), Some("second"));
        assert_eq!(st.events.len(), 2);
    }

    #[test]
    fn event_ring_is_bounded() {
        let mut st = MonitorState::new(vec![]);
        for i in 0..(MAX_EVENTS + 50) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        // Oldest entries were dropped.
        assert_eq!(st.events.front().unwrap().detail, "event 50");
    }

    #[test]
    fn debug_snapshot_reverses_events() {
        let mut st = MonitorState::new(vec![]);
        st.record_system("older".into());
        st.record_system("newer".into());
        let dbg = st.to_debug(None);
        assert_eq!(dbg.events[0].detail, "newer");
        assert_eq!(dbg.events[1].detail, "older");
    }
}
