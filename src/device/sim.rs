//! Simulated printer for running the daemon without hardware.
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{Device, DeviceError, DeviceProvider};
use crate::gcode::{STATUS_QUERY, Sensor};

const AMBIENT: f64 = 25.0;

#[derive(Debug, Clone)]
struct Heater {
    current: f64,
    target: f64,
}

impl Heater {
    fn new() -> Self {
        Self { current: AMBIENT, target: 0.0 }
    }

    /// Moves `step` degrees toward the target, or back toward ambient when off.
    fn advance(&mut self, step: f64) {
        let goal = if self.target > 0.0 { self.target } else { AMBIENT };
        if self.current < goal {
            self.current = (self.current + step).min(goal);
        } else {
            self.current = (self.current - step).max(goal);
        }
    }
}

#[derive(Debug)]
struct Thermal {
    hotend: Heater,
    bed: Heater,
}

/// A printer that answers `ok` to everything and models heat-up: every
/// temperature query moves each heater `heat_step` degrees toward its target.
pub struct SimulatedPrinter {
    name: String,
    greeting: String,
    heat_step: f64,
    thermal: Mutex<Thermal>,
}

impl SimulatedPrinter {
    pub fn new(name: impl Into<String>, heat_step: f64) -> Self {
        Self {
            name: name.into(),
            greeting: "start\necho:simulated firmware\nok".to_string(),
            heat_step,
            thermal: Mutex::new(Thermal { hotend: Heater::new(), bed: Heater::new() }),
        }
    }

    pub fn temperature(&self, sensor: Sensor) -> f64 {
        let thermal = self.thermal.lock().unwrap_or_else(PoisonError::into_inner);
        match sensor {
            Sensor::Hotend => thermal.hotend.current,
            Sensor::Bed => thermal.bed.current,
        }
    }

    fn report(thermal: &Thermal) -> String {
        format!(
            "ok T:{:.1} /{:.1} B:{:.1} /{:.1} @:0 B@:0\n",
            thermal.hotend.current, thermal.hotend.target, thermal.bed.current, thermal.bed.target
        )
    }
}

fn s_value(words: &[&str]) -> Option<f64> {
    words
        .iter()
        .find_map(|w| w.strip_prefix(['S', 's']).and_then(|v| v.parse().ok()))
}

#[async_trait]
impl Device for SimulatedPrinter {
    fn name(&self) -> &str {
        &self.name
    }

    fn greeting(&self) -> &str {
        &self.greeting
    }

    async fn send_raw(&self, command: &str) -> Result<String, DeviceError> {
        let words: Vec<&str> = command.split_whitespace().collect();
        let Some(code) = words.first().map(|w| w.to_ascii_uppercase()) else {
            return Ok("ok\n".to_string());
        };
        let mut thermal = self.thermal.lock().unwrap_or_else(PoisonError::into_inner);
        match code.as_str() {
            "M104" | "M109" => {
                if let Some(t) = s_value(&words[1..]) {
                    thermal.hotend.target = t;
                }
            }
            "M140" | "M190" => {
                if let Some(t) = s_value(&words[1..]) {
                    thermal.bed.target = t;
                }
            }
            STATUS_QUERY => {
                thermal.hotend.advance(self.heat_step);
                thermal.bed.advance(self.heat_step);
                return Ok(Self::report(&thermal));
            }
            _ => {}
        }
        Ok("ok\n".to_string())
    }
}

/// Provider whose attached set is controlled by the caller.
#[derive(Default)]
pub struct SimulatedProvider {
    attached: Mutex<BTreeSet<String>>,
    heat_step: f64,
}

impl SimulatedProvider {
    pub fn new(heat_step: f64) -> Self {
        Self { attached: Mutex::new(BTreeSet::new()), heat_step }
    }

    pub fn attach(&self, name: impl Into<String>) {
        self.lock().insert(name.into());
    }

    pub fn detach(&self, name: &str) {
        self.lock().remove(name);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DeviceProvider for SimulatedProvider {
    async fn attached(&self) -> Result<BTreeSet<String>, DeviceError> {
        Ok(self.lock().clone())
    }

    async fn connect(&self, name: &str) -> Result<Arc<dyn Device>, DeviceError> {
        if !self.lock().contains(name) {
            return Err(DeviceError::NotConnected(name.to_string()));
        }
        Ok(Arc::new(SimulatedPrinter::new(name, self.heat_step)))
    }
}
