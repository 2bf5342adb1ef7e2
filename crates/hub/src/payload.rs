//! Payload normalization for power telemetry.
//!
//! The hub subscribes to every topic and decides relevance from the payload
//! alone: meters from different vendors publish different JSON shapes on
//! whatever topics their firmware likes. Each recognized shape has its own
//! matcher; matchers are tried in order and the first match wins. Anything
//! unparseable or unmatched yields no readings, never an error.

use serde_json::{Map, Value};

/// One normalized reading for a physical meter channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelReading {
    /// 1-based channel number.
    pub channel: u8,
    pub power_w: f64,
    /// Amperage, when the meter reports it. Needed for shared-circuit pairs.
    pub current_a: Option<f64>,
}

type Matcher = fn(&Value) -> Option<Vec<ChannelReading>>;

/// Ordered from most to least specific. Adding a device shape means adding
/// a matcher here, not editing the existing ones.
const MATCHERS: &[Matcher] = &[notify_status, reading_list, indexed_array, flat_single];

/// Parse a raw broker payload into zero or more channel readings.
pub fn normalize(payload: &[u8]) -> Vec<ChannelReading> {
    let Ok(value) = serde_json::from_slice::<Value>(payload) else {
        return Vec::new();
    };
    for matcher in MATCHERS {
        if let Some(readings) = matcher(&value) {
            return readings;
        }
    }
    Vec::new()
}

// ---------------------------------------------------------------------------
// Shape matchers
// ---------------------------------------------------------------------------

/// RPC-style status envelope: a `params` object (or the top-level object
/// itself) whose keys look like `"switch:0"` / `"meter:1"`, each holding a
/// power value and often a current value. The numeric suffix is the meter's
/// 0-based index; channels are 1-based, so channel = index + 1.
fn notify_status(v: &Value) -> Option<Vec<ChannelReading>> {
    let obj = v.as_object()?;
    let source = obj.get("params").and_then(Value::as_object).unwrap_or(obj);

    let mut readings = Vec::new();
    for (key, entry) in source {
        let Some((prefix, index)) = key.split_once(':') else {
            continue;
        };
        if prefix.is_empty() {
            continue;
        }
        let Ok(index) = index.parse::<u8>() else {
            continue;
        };
        let Some(entry) = entry.as_object() else {
            continue;
        };
        let Some(power_w) = field(entry, &["apower", "power", "act_power"]) else {
            continue;
        };
        let Some(channel) = index.checked_add(1) else {
            continue;
        };
        readings.push(ChannelReading {
            channel,
            power_w,
            current_a: field(entry, &["current", "amps"]),
        });
    }

    if readings.is_empty() {
        None
    } else {
        Some(readings)
    }
}

/// An object carrying an explicit array of per-channel readings. Malformed
/// elements are skipped rather than failing the whole message.
fn reading_list(v: &Value) -> Option<Vec<ChannelReading>> {
    let list = v.as_object()?.get("readings")?.as_array()?;
    Some(
        list.iter()
            .filter_map(|e| flat_reading(e.as_object()?))
            .collect(),
    )
}

/// A positionally-indexed array of per-channel power values, e.g.
/// `{"power": [430.1, 0.0, 2210.5]}`. Channel number = array index + 1.
fn indexed_array(v: &Value) -> Option<Vec<ChannelReading>> {
    let obj = v.as_object()?;
    let list = obj
        .get("power")
        .or_else(|| obj.get("energy"))?
        .as_array()?;
    Some(
        list.iter()
            .enumerate()
            .filter_map(|(i, e)| {
                Some(ChannelReading {
                    channel: u8::try_from(i).ok()?.checked_add(1)?,
                    power_w: num(e)?,
                    current_a: None,
                })
            })
            .collect(),
    )
}

/// A flat object with one channel/power pair under any of several
/// field-name spellings.
fn flat_single(v: &Value) -> Option<Vec<ChannelReading>> {
    flat_reading(v.as_object()?).map(|r| vec![r])
}

fn flat_reading(obj: &Map<String, Value>) -> Option<ChannelReading> {
    let channel = field(obj, &["channel", "ch", "relay", "output"])?;
    if channel < 1.0 || channel > 255.0 || channel.fract() != 0.0 {
        return None;
    }
    Some(ChannelReading {
        channel: channel as u8,
        power_w: field(obj, &["power", "apower", "watts", "power_w"])?,
        current_a: field(obj, &["current", "amps", "current_a"]),
    })
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// First present field under any of the given spellings, as a number.
fn field(obj: &Map<String, Value>, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|n| num(obj.get(*n)?))
}

/// Meters disagree on whether numbers are JSON numbers or strings.
fn num(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
