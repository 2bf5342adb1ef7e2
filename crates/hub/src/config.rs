//! TOML config file loading and validation for metered channels and the
//! machines behind them.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub classes: ClassTable,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

/// Threshold profiles per appliance class. Washers draw near-zero watts at
/// idle; gas dryers keep ignition/control electronics powered, so their
/// idle draw is tens of watts and the thresholds must sit well above it.
#[derive(Debug, Deserialize)]
pub struct ClassTable {
    #[serde(default = "ClassTable::washer_defaults")]
    pub washer: ClassEntry,
    #[serde(default = "ClassTable::dryer_defaults")]
    pub dryer: ClassEntry,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ClassEntry {
    /// Power above this (watts) means a cycle has begun.
    pub start_watts: f64,
    /// Power below this (watts) arms the stop debounce.
    pub stop_watts: f64,
    /// How long power must stay low before a stop is committed.
    pub debounce_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelClass {
    Washer,
    Dryer,
}

#[derive(Debug, Deserialize)]
pub struct ChannelEntry {
    /// Physical meter channel number as it appears in telemetry (1-based).
    pub channel: u8,
    pub class: ChannelClass,
    /// One machine per channel, or an ordered pair sharing one circuit.
    pub machines: Vec<MachineEntry>,
    /// Amperage at/above which a shared-circuit pair is judged to have
    /// both units active. Required for (and only valid on) two-machine
    /// channels.
    pub dual_current_threshold: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MachineEntry {
    pub id: i64,
    pub name: String,
}

impl ClassTable {
    fn washer_defaults() -> ClassEntry {
        ClassEntry {
            start_watts: 10.0,
            stop_watts: 5.0,
            debounce_secs: 180,
        }
    }

    fn dryer_defaults() -> ClassEntry {
        ClassEntry {
            start_watts: 100.0,
            stop_watts: 50.0,
            debounce_secs: 120,
        }
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self {
            washer: Self::washer_defaults(),
            dryer: Self::dryer_defaults(),
        }
    }
}

impl Config {
    pub fn class(&self, class: ChannelClass) -> ClassEntry {
        match class {
            ChannelClass::Washer => self.classes.washer,
            ChannelClass::Dryer => self.classes.dryer,
        }
    }

    /// Machine id -> display name, across every channel.
    pub fn machine_names(&self) -> HashMap<i64, String> {
        self.channels
            .iter()
            .flat_map(|c| c.machines.iter())
            .map(|m| (m.id, m.name.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_classes(&mut errors);
        self.validate_channels(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_classes(&self, errors: &mut Vec<String>) {
        for (name, c) in [("washer", &self.classes.washer), ("dryer", &self.classes.dryer)] {
            if c.stop_watts <= 0.0 {
                errors.push(format!(
                    "class '{name}': stop_watts must be positive, got {}",
                    c.stop_watts
                ));
            }
            if c.start_watts <= c.stop_watts {
                errors.push(format!(
                    "class '{name}': start_watts ({}) must be greater than stop_watts ({})",
                    c.start_watts, c.stop_watts
                ));
            }
            if c.debounce_secs == 0 {
                errors.push(format!("class '{name}': debounce_secs must be positive"));
            }
        }
    }

    fn validate_channels(&self, errors: &mut Vec<String>) {
        let mut seen_channels: HashSet<u8> = HashSet::new();
        let mut seen_ids: HashSet<i64> = HashSet::new();

        for (i, ch) in self.channels.iter().enumerate() {
            let ctx = || format!("channel {} (channels[{i}])", ch.channel);

            if ch.channel == 0 {
                errors.push(format!("{}: channel numbers are 1-based", ctx()));
            } else if !seen_channels.insert(ch.channel) {
                errors.push(format!("{}: duplicate channel number", ctx()));
            }

            match ch.machines.len() {
                1 => {
                    if ch.dual_current_threshold.is_some() {
                        errors.push(format!(
                            "{}: dual_current_threshold is only valid on two-machine channels",
                            ctx()
                        ));
                    }
                }
                2 => match ch.dual_current_threshold {
                    None => errors.push(format!(
                        "{}: two machines share this meter but dual_current_threshold is missing",
                        ctx()
                    )),
                    Some(a) if a <= 0.0 => errors.push(format!(
                        "{}: dual_current_threshold must be positive, got {a}",
                        ctx()
                    )),
                    Some(_) => {}
                },
                n => errors.push(format!(
                    "{}: expected 1 or 2 machines, got {n}",
                    ctx()
                )),
            }

            for m in &ch.machines {
                if m.id <= 0 {
                    errors.push(format!("{}: machine id {} must be positive", ctx(), m.id));
                } else if !seen_ids.insert(m.id) {
                    errors.push(format!("{}: duplicate machine id {}", ctx(), m.id));
                }
                if m.name.trim().is_empty() {
                    errors.push(format!("{}: machine {} has an empty name", ctx(), m.id));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        channels = config.channels.len(),
        machines = config.machine_names().len(),
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
