//! Stateful laundry-appliance power simulator for local development.
//!
//! Models the load shapes that make the hub's debounce logic earn its keep:
//! - Washers pass through near-zero-power soak phases mid-cycle
//! - Gas dryers draw tens of watts at idle (ignition/control electronics)
//! - Per-reading electrical noise
//! - Random cycle starts so a running hub sees organic traffic

use std::fmt;

/// One phase of a cycle: nominal draw in watts for a number of ticks.
#[derive(Debug, Clone, Copy)]
struct Phase {
    watts: f64,
    ticks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appliance {
    Washer,
    Dryer,
}

impl Appliance {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "dryer" => Self::Dryer,
            _ => Self::Washer,
        }
    }

    /// Baseline draw while idle. Dryer control boards idle at tens of
    /// watts, which is exactly why dryer-class stop thresholds sit high.
    fn idle_watts(self) -> f64 {
        match self {
            Self::Washer => 1.0,
            Self::Dryer => 25.0,
        }
    }

    fn profile(self) -> &'static [Phase] {
        match self {
            // Fill, agitate, soak (the low-power dip), spin.
            Self::Washer => &[
                Phase { watts: 80.0, ticks: 2 },
                Phase { watts: 450.0, ticks: 6 },
                Phase { watts: 3.0, ticks: 3 },
                Phase { watts: 320.0, ticks: 4 },
            ],
            // Ignite, heat, tumble-cooldown.
            Self::Dryer => &[
                Phase { watts: 150.0, ticks: 1 },
                Phase { watts: 2400.0, ticks: 10 },
                Phase { watts: 250.0, ticks: 3 },
            ],
        }
    }
}

impl fmt::Display for Appliance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Washer => write!(f, "washer"),
            Self::Dryer => write!(f, "dryer"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CycleState {
    Idle,
    Running { phase: usize, left: u32 },
}

/// Per-channel cycle simulator. Call [`sample`](Self::sample) once per
/// publishing tick.
pub struct CycleSim {
    appliance: Appliance,
    state: CycleState,
    /// Chance per idle tick that a customer starts a load.
    start_prob: f32,
}

impl CycleSim {
    pub fn new(appliance: Appliance, start_prob: f32) -> Self {
        Self {
            appliance,
            state: CycleState::Idle,
            start_prob,
        }
    }

    /// Advance one tick and return the instantaneous draw in watts.
    pub fn sample(&mut self) -> f64 {
        let nominal = match self.state {
            CycleState::Idle => {
                if fastrand::f32() < self.start_prob {
                    self.state = CycleState::Running { phase: 0, left: 0 };
                    return self.sample();
                }
                self.appliance.idle_watts()
            }
            CycleState::Running { phase, left } => {
                let profile = self.appliance.profile();
                let watts = profile[phase].watts;
                let next_left = left + 1;
                if next_left >= profile[phase].ticks {
                    if phase + 1 >= profile.len() {
                        self.state = CycleState::Idle;
                    } else {
                        self.state = CycleState::Running {
                            phase: phase + 1,
                            left: 0,
                        };
                    }
                } else {
                    self.state = CycleState::Running {
                        phase,
                        left: next_left,
                    };
                }
                watts
            }
        };

        // Electrical noise, +-5% of the nominal draw plus a watt of floor.
        let noise = (fastrand::f64() - 0.5) * (nominal * 0.1 + 1.0);
        (nominal + noise).max(0.0)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, CycleState::Running { .. })
    }

    pub fn appliance(&self) -> Appliance {
        self.appliance
    }
}

/// Rough amperage for a draw on a 120 V circuit.
pub fn estimate_current(power_w: f64) -> f64 {
    power_w / 120.0
}

// ===========================================================================
// Tests
// ===========================================================================
