//! Pacing collaborators.
//!
//! Two kinds of pacing can drive the model's `pace` bound variable; at most
//! one is active per run:
//!
//! - [`EventPacing`], built from a [`PacingProtocol`]: a schedule of stimulus
//!   events with piecewise-constant levels. The orchestrator halts the
//!   integrator at every level change, so the right-hand side never sees a
//!   discontinuity inside a step.
//! - [`WaveformPacing`]: a fixed sampled waveform, linearly interpolated and
//!   clamped outside its time grid. Smooth enough to be evaluated inside the
//!   right-hand side directly.

use crate::errors::{MyocyteError, MyocyteResult};
use crate::variable::Time;
use serde::{Deserialize, Serialize};

/// One scheduled stimulus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PacingEvent {
    /// Pacing level while the event is active.
    pub level: f64,
    /// Time of the first occurrence.
    pub start: Time,
    /// Duration of each occurrence.
    pub duration: f64,
    /// Recurrence period; zero means the event fires once.
    pub period: f64,
    /// Number of occurrences for a periodic event; zero repeats indefinitely.
    pub multiplier: u32,
}

/// A declarative stimulus schedule, serialisable as configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacingProtocol {
    pub events: Vec<PacingEvent>,
}

impl PacingProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single stimulus.
    pub fn schedule(&mut self, level: f64, start: Time, duration: f64) -> &mut Self {
        self.events.push(PacingEvent {
            level,
            start,
            duration,
            period: 0.0,
            multiplier: 0,
        });
        self
    }

    /// Add a recurring stimulus. `multiplier` zero repeats indefinitely.
    pub fn schedule_periodic(
        &mut self,
        level: f64,
        start: Time,
        duration: f64,
        period: f64,
        multiplier: u32,
    ) -> &mut Self {
        self.events.push(PacingEvent {
            level,
            start,
            duration,
            period,
            multiplier,
        });
        self
    }

    pub fn from_toml(text: &str) -> MyocyteResult<Self> {
        toml::from_str(text).map_err(|e| MyocyteError::InvalidConfiguration(e.to_string()))
    }

    pub fn to_toml(&self) -> MyocyteResult<String> {
        toml::to_string(self).map_err(|e| MyocyteError::InvalidConfiguration(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    start: Time,
    level: f64,
    duration: f64,
    period: f64,
    /// Remaining occurrences; `None` repeats indefinitely.
    remaining: Option<u32>,
}

/// Runtime cursor over an event schedule.
///
/// Supports the three operations the orchestrator needs: advance the
/// internal cursor to a time, report the time of the next level change, and
/// report the current level.
#[derive(Debug, Clone)]
pub struct EventPacing {
    /// Sorted by start time, descending; the next event is at the back.
    pending: Vec<Pending>,
    active_until: Option<Time>,
    level: f64,
    time: Time,
}

impl EventPacing {
    /// Build the cursor and advance it to `t0`, firing everything scheduled
    /// before the run starts.
    pub fn new(protocol: &PacingProtocol, t0: Time) -> MyocyteResult<Self> {
        for event in &protocol.events {
            if !(event.duration > 0.0) || !event.duration.is_finite() {
                return Err(MyocyteError::InvalidConfiguration(format!(
                    "pacing event at t = {} must have a positive duration",
                    event.start
                )));
            }
            if event.period < 0.0 {
                return Err(MyocyteError::InvalidConfiguration(format!(
                    "pacing event at t = {} has a negative period",
                    event.start
                )));
            }
            if event.period > 0.0 && event.period < event.duration {
                return Err(MyocyteError::PacingConflict {
                    time: event.start + event.period,
                });
            }
            if event.multiplier > 0 && event.period == 0.0 {
                return Err(MyocyteError::InvalidConfiguration(format!(
                    "pacing event at t = {} has a multiplier but no period",
                    event.start
                )));
            }
        }
        let mut pending: Vec<Pending> = protocol
            .events
            .iter()
            .map(|event| Pending {
                start: event.start,
                level: event.level,
                duration: event.duration,
                period: event.period,
                remaining: if event.period == 0.0 {
                    Some(1)
                } else if event.multiplier == 0 {
                    None
                } else {
                    Some(event.multiplier)
                },
            })
            .collect();
        pending.sort_by(|a, b| b.start.total_cmp(&a.start));
        let mut pacing = Self {
            pending,
            active_until: None,
            level: 0.0,
            time: f64::NEG_INFINITY,
        };
        pacing.advance_time(t0)?;
        Ok(pacing)
    }

    fn push_pending(&mut self, event: Pending) {
        let position = self
            .pending
            .partition_point(|p| p.start > event.start);
        self.pending.insert(position, event);
    }

    /// Advance the internal cursor to `t`, processing every level change at
    /// or before it. Returns the level at `t`.
    pub fn advance_time(&mut self, t: Time) -> MyocyteResult<f64> {
        if t < self.time {
            return Err(MyocyteError::Error(format!(
                "pacing cursor cannot move backwards (from {} to {})",
                self.time, t
            )));
        }
        loop {
            let next_stop = self.active_until.unwrap_or(f64::INFINITY);
            let next_start = self
                .pending
                .last()
                .map(|p| p.start)
                .unwrap_or(f64::INFINITY);
            let next = next_stop.min(next_start);
            if next > t {
                break;
            }
            if next_stop <= next_start {
                self.level = 0.0;
                self.active_until = None;
            } else {
                if self.active_until.is_some() {
                    return Err(MyocyteError::PacingConflict { time: next_start });
                }
                let event = self.pending.pop().expect("next_start came from pending");
                self.level = event.level;
                self.active_until = Some(event.start + event.duration);
                let remaining = event.remaining.map(|r| r - 1);
                if event.period > 0.0 && remaining.map_or(true, |r| r > 0) {
                    self.push_pending(Pending {
                        start: event.start + event.period,
                        remaining,
                        ..event
                    });
                }
            }
        }
        self.time = t;
        Ok(self.level)
    }

    /// Time of the next level change, or infinity when the schedule is
    /// exhausted.
    pub fn next_time(&self) -> Time {
        let next_stop = self.active_until.unwrap_or(f64::INFINITY);
        let next_start = self
            .pending
            .last()
            .map(|p| p.start)
            .unwrap_or(f64::INFINITY);
        next_stop.min(next_start)
    }

    pub fn level(&self) -> f64 {
        self.level
    }
}

/// Fixed-form pacing: a sampled waveform on an ascending time grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformPacing {
    times: Vec<Time>,
    levels: Vec<f64>,
}

impl WaveformPacing {
    pub fn new(times: Vec<Time>, levels: Vec<f64>) -> MyocyteResult<Self> {
        if times.is_empty() || times.len() != levels.len() {
            return Err(MyocyteError::InvalidConfiguration(
                "waveform pacing needs matching, non-empty time and level arrays".to_string(),
            ));
        }
        if times.windows(2).any(|w| !(w[0] < w[1])) {
            return Err(MyocyteError::InvalidConfiguration(
                "waveform pacing times must be strictly ascending".to_string(),
            ));
        }
        Ok(Self { times, levels })
    }

    /// Level at time `t`, linearly interpolated and clamped to the end
    /// values outside the grid.
    pub fn level_at(&self, t: Time) -> f64 {
        if t <= self.times[0] {
            return self.levels[0];
        }
        let last = self.times.len() - 1;
        if t >= self.times[last] {
            return self.levels[last];
        }
        let hi = self.times.partition_point(|&x| x <= t);
        let lo = hi - 1;
        let theta = (t - self.times[lo]) / (self.times[hi] - self.times[lo]);
        self.levels[lo] + theta * (self.levels[hi] - self.levels[lo])
    }
}

/// Run-configuration selector for the pacing source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum PacingConfig {
    /// No pacing; the pace bound variable stays at zero.
    #[default]
    None,
    /// Event-schedule pacing.
    Protocol(PacingProtocol),
    /// Fixed-form pacing from a sampled waveform.
    Waveform { times: Vec<Time>, levels: Vec<f64> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_event_fires_and_expires() {
        let mut protocol = PacingProtocol::new();
        protocol.schedule(2.0, 1.0, 0.5);
        let mut pacing = EventPacing::new(&protocol, 0.0).unwrap();

        assert_eq!(pacing.level(), 0.0);
        assert_eq!(pacing.next_time(), 1.0);

        assert_eq!(pacing.advance_time(1.0).unwrap(), 2.0);
        assert_eq!(pacing.next_time(), 1.5);

        assert_eq!(pacing.advance_time(1.5).unwrap(), 0.0);
        assert_eq!(pacing.next_time(), f64::INFINITY);
    }

    #[test]
    fn periodic_event_reschedules() {
        let mut protocol = PacingProtocol::new();
        protocol.schedule_periodic(1.0, 0.0, 0.5, 2.0, 3);
        let mut pacing = EventPacing::new(&protocol, 0.0).unwrap();

        assert_eq!(pacing.level(), 1.0);
        let mut changes = Vec::new();
        let mut t = 0.0;
        while pacing.next_time().is_finite() {
            t = pacing.next_time();
            pacing.advance_time(t).unwrap();
            changes.push((t, pacing.level()));
        }
        assert_eq!(
            changes,
            vec![
                (0.5, 0.0),
                (2.0, 1.0),
                (2.5, 0.0),
                (4.0, 1.0),
                (4.5, 0.0),
            ]
        );
        assert!(t < 6.0);
    }

    #[test]
    fn events_starting_before_the_run_are_applied() {
        let mut protocol = PacingProtocol::new();
        protocol.schedule(3.0, -1.0, 10.0);
        let pacing = EventPacing::new(&protocol, 0.0).unwrap();
        assert_eq!(pacing.level(), 3.0);
        assert_eq!(pacing.next_time(), 9.0);
    }

    #[test]
    fn overlapping_events_conflict() {
        let mut protocol = PacingProtocol::new();
        protocol.schedule(1.0, 0.0, 2.0);
        protocol.schedule(2.0, 1.0, 1.0);
        let mut pacing = EventPacing::new(&protocol, 0.0).unwrap();
        let err = pacing.advance_time(1.0).unwrap_err();
        assert!(matches!(err, MyocyteError::PacingConflict { .. }));
    }

    #[test]
    fn self_overlapping_period_is_rejected() {
        let mut protocol = PacingProtocol::new();
        protocol.schedule_periodic(1.0, 0.0, 2.0, 1.0, 0);
        let err = EventPacing::new(&protocol, 0.0).unwrap_err();
        assert!(matches!(err, MyocyteError::PacingConflict { .. }));
    }

    #[test]
    fn cursor_cannot_move_backwards() {
        let mut protocol = PacingProtocol::new();
        protocol.schedule(1.0, 0.0, 1.0);
        let mut pacing = EventPacing::new(&protocol, 5.0).unwrap();
        assert!(pacing.advance_time(4.0).is_err());
    }

    #[test]
    fn waveform_interpolates_and_clamps() {
        let waveform =
            WaveformPacing::new(vec![0.0, 1.0, 2.0], vec![0.0, 2.0, 0.0]).unwrap();
        assert_eq!(waveform.level_at(-1.0), 0.0);
        assert_eq!(waveform.level_at(0.5), 1.0);
        assert_eq!(waveform.level_at(1.0), 2.0);
        assert_eq!(waveform.level_at(1.75), 0.5);
        assert_eq!(waveform.level_at(9.0), 0.0);
    }

    #[test]
    fn waveform_validation() {
        assert!(WaveformPacing::new(vec![], vec![]).is_err());
        assert!(WaveformPacing::new(vec![0.0, 0.0], vec![1.0, 2.0]).is_err());
        assert!(WaveformPacing::new(vec![0.0], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn protocol_round_trips_through_toml() {
        let mut protocol = PacingProtocol::new();
        protocol.schedule_periodic(1.0, 100.0, 2.0, 1000.0, 0);
        let text = protocol.to_toml().unwrap();
        let parsed = PacingProtocol::from_toml(&text).unwrap();
        assert_eq!(parsed, protocol);
    }
}
