//! Hazard phase state machine and the UPS shutdown latch.

use serde::Serialize;
use std::fmt;
use tracing::{error, info, warn};

use crate::config::SafetyConfig;
use crate::control::CommandRequest;
use crate::telemetry::reading::{FireStatus, UpsStatus, VocReading};

/// Operating phase shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyPhase {
    /// No hazard reported.
    Normal,
    /// VOC at the warning level, or a fire detector fault.
    Warning,
    /// Any alarm, critical VOC, or the UPS latch.
    Emergency,
}

impl SafetyPhase {
    /// Upper-case name used in logs and on the dashboard.
    pub fn label(self) -> &'static str {
        match self {
            SafetyPhase::Normal => "NORMAL",
            SafetyPhase::Warning => "WARNING",
            SafetyPhase::Emergency => "EMERGENCY",
        }
    }

    /// Short procedure text for the phase.
    pub fn guidance(self) -> &'static str {
        match self {
            SafetyPhase::Normal => "Regular Monitoring Active / Check Sensor Status Periodically",
            SafetyPhase::Warning => {
                "Potential Hazard Detected / Verify Ventilation & Check Equipment / Prepare for Evacuation"
            }
            SafetyPhase::Emergency => {
                "CRITICAL DANGER (Fire/Toxic Gas) / EVACUATE IMMEDIATELY / Trigger Fire Alarm & Call 119"
            }
        }
    }
}

impl fmt::Display for SafetyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Phase implied by the fire detector and the VOC detector alone.
///
/// A sensor that has not reported yet contributes nothing.
pub fn hazard_phase(
    fire: Option<&FireStatus>,
    voc: Option<&VocReading>,
    thresholds: &SafetyConfig,
) -> SafetyPhase {
    let conc = voc.map_or(f64::NAN, |v| v.concentration_ppm);
    let voc_alarm = voc.is_some_and(|v| v.alarm > 0);
    let is_fire = fire.is_some_and(|f| f.is_fire);
    let is_fault = fire.is_some_and(|f| f.is_fault);

    if is_fire || voc_alarm || conc >= thresholds.critical_ppm {
        SafetyPhase::Emergency
    } else if is_fault || conc >= thresholds.warning_ppm {
        SafetyPhase::Warning
    } else {
        SafetyPhase::Normal
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyReport {
    /// Phase after this evaluation.
    pub phase: SafetyPhase,
    /// Phase before this evaluation.
    pub previous: SafetyPhase,
    /// The phase changed with this evaluation.
    pub entered: bool,
    /// Procedure text for `phase`.
    pub guidance: &'static str,
    /// The UPS latch was set by this evaluation; HV must be switched off.
    pub trigger_shutdown: bool,
    /// The UPS latch is holding.
    pub ups_latched: bool,
}

impl SafetyReport {
    /// Report published before any sensor has spoken.
    pub fn initial() -> Self {
        Self {
            phase: SafetyPhase::Normal,
            previous: SafetyPhase::Normal,
            entered: false,
            guidance: SafetyPhase::Normal.guidance(),
            trigger_shutdown: false,
            ups_latched: false,
        }
    }
}

/// NORMAL / WARNING / EMERGENCY evaluation with a one-shot UPS latch.
///
/// The latch sets the first time the UPS runs on battery with less than
/// `shutdown_threshold_min` minutes left and clears only when the UPS
/// reports it is online again. While it holds the phase is EMERGENCY.
#[derive(Debug, Clone)]
pub struct SafetyInterlock {
    thresholds: SafetyConfig,
    phase: SafetyPhase,
    ups_latched: bool,
}

impl SafetyInterlock {
    /// Interlock in the normal phase with the latch clear.
    pub fn new(thresholds: SafetyConfig) -> Self {
        Self {
            thresholds,
            phase: SafetyPhase::Normal,
            ups_latched: false,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SafetyPhase {
        self.phase
    }

    /// Whether the UPS shutdown has already been requested.
    pub fn is_latched(&self) -> bool {
        self.ups_latched
    }

    /// Re-evaluate from the latest fire, VOC and UPS readings.
    pub fn observe(
        &mut self,
        fire: Option<&FireStatus>,
        voc: Option<&VocReading>,
        ups: Option<&UpsStatus>,
    ) -> SafetyReport {
        let trigger_shutdown = ups.is_some_and(|status| self.update_latch(status));

        let mut phase = hazard_phase(fire, voc, &self.thresholds);
        if self.ups_latched {
            phase = SafetyPhase::Emergency;
        }

        let previous = self.phase;
        let entered = phase != previous;
        if entered {
            match phase {
                SafetyPhase::Emergency => error!(from = %previous, "Entered EMERGENCY phase"),
                SafetyPhase::Warning => warn!(from = %previous, "Entered WARNING phase"),
                SafetyPhase::Normal => info!(from = %previous, "Back to NORMAL phase"),
            }
        }
        self.phase = phase;

        SafetyReport {
            phase,
            previous,
            entered,
            guidance: phase.guidance(),
            trigger_shutdown,
            ups_latched: self.ups_latched,
        }
    }

    /// Returns true when the latch was set by this status.
    fn update_latch(&mut self, status: &UpsStatus) -> bool {
        if self.ups_latched {
            if status.is_online() {
                info!(status = %status.status, "UPS back online, shutdown latch cleared");
                self.ups_latched = false;
            }
            return false;
        }
        // NaN time left never compares below the threshold.
        if status.is_on_battery() && status.time_left_min < self.thresholds.shutdown_threshold_min {
            error!(
                time_left_min = status.time_left_min,
                threshold_min = self.thresholds.shutdown_threshold_min,
                "UPS on battery below threshold, switching HV off"
            );
            self.ups_latched = true;
            return true;
        }
        false
    }
}

/// Power-off requests covering every configured HV channel.
pub fn shutdown_requests(slots: &[(u16, u16)]) -> Vec<CommandRequest> {
    slots
        .iter()
        .filter(|(_, channels)| *channels > 0)
        .map(|&(slot, channels)| CommandRequest::hv_power(slot, (0..channels).collect(), false))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::CommandAction;

    fn thresholds() -> SafetyConfig {
        SafetyConfig {
            warning_ppm: 10.0,
            critical_ppm: 50.0,
            shutdown_threshold_min: 15.0,
        }
    }

    fn voc(ppm: f64, alarm: u16) -> VocReading {
        VocReading {
            concentration_ppm: ppm,
            alarm,
        }
    }

    fn ups(status: &str, time_left_min: f64) -> UpsStatus {
        UpsStatus {
            status: status.to_string(),
            line_voltage: 0.0,
            battery_charge_pct: 80.0,
            time_left_min,
        }
    }

    #[test]
    fn hazard_rules() {
        let t = thresholds();
        assert_eq!(hazard_phase(None, None, &t), SafetyPhase::Normal);
        assert_eq!(hazard_phase(None, Some(&voc(9.9, 0)), &t), SafetyPhase::Normal);
        assert_eq!(hazard_phase(None, Some(&voc(10.0, 0)), &t), SafetyPhase::Warning);
        assert_eq!(hazard_phase(None, Some(&voc(50.0, 0)), &t), SafetyPhase::Emergency);
        assert_eq!(hazard_phase(None, Some(&voc(1.0, 1)), &t), SafetyPhase::Emergency);
        assert_eq!(
            hazard_phase(Some(&FireStatus::decode(0x01)), None, &t),
            SafetyPhase::Warning
        );
        assert_eq!(
            hazard_phase(Some(&FireStatus::decode(0x04)), None, &t),
            SafetyPhase::Emergency
        );
    }

    #[test]
    fn warning_entry_reported_once_per_crossing() {
        let mut interlock = SafetyInterlock::new(thresholds());
        let entries: Vec<bool> = [2.0, 12.0, 14.0, 11.0, 3.0, 4.0]
            .iter()
            .map(|&ppm| interlock.observe(None, Some(&voc(ppm, 0)), None))
            .map(|report| report.entered && report.phase == SafetyPhase::Warning)
            .collect();
        assert_eq!(entries, vec![false, true, false, false, false, false]);
        assert_eq!(interlock.phase(), SafetyPhase::Normal);
    }

    #[test]
    fn ups_latch_fires_once_per_excursion() {
        let mut interlock = SafetyInterlock::new(thresholds());
        let statuses = [
            ups("ONLINE", 60.0),
            ups("ONBATT", 10.0),
            ups("ONBATT", 9.0),
            ups("ONBATT", 30.0),
            ups("ONLINE", 60.0),
            ups("ONBATT", 5.0),
        ];
        let triggers: Vec<bool> = statuses
            .iter()
            .map(|status| interlock.observe(None, None, Some(status)).trigger_shutdown)
            .collect();
        assert_eq!(triggers, vec![false, true, false, false, false, true]);
    }

    #[test]
    fn latch_holds_emergency_until_online() {
        let mut interlock = SafetyInterlock::new(thresholds());
        interlock.observe(None, None, Some(&ups("ONBATT", 10.0)));
        let report = interlock.observe(None, None, Some(&ups("ONBATT", 40.0)));
        assert_eq!(report.phase, SafetyPhase::Emergency);
        assert!(report.ups_latched);

        let report = interlock.observe(None, None, Some(&ups("ONLINE", 40.0)));
        assert_eq!(report.phase, SafetyPhase::Normal);
        assert!(report.entered);
        assert!(!interlock.is_latched());
    }

    #[test]
    fn unknown_time_left_never_latches() {
        let mut interlock = SafetyInterlock::new(thresholds());
        let report = interlock.observe(None, None, Some(&ups("ONBATT", f64::NAN)));
        assert!(!report.trigger_shutdown);
        assert_eq!(report.phase, SafetyPhase::Normal);
    }

    #[test]
    fn shutdown_covers_every_channel() {
        let requests = shutdown_requests(&[(0, 4), (3, 0), (5, 2)]);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], CommandRequest::hv_power(0, vec![0, 1, 2, 3], false));
        assert_eq!(requests[1].action, CommandAction::SetPower(false));
    }
}
