//! Test modes, runtime status and report records.
//!
//! Everything here is plain data: `Copy` where it is small, `serde`
//! everywhere so reports can be persisted with `postcard` and rendered with
//! `serde_json`.

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::config::MAX_PRESSURE_POINTS;
use crate::fsm::TestState;

/// Completed reports kept in the ring.
pub const HISTORY_CAPACITY: usize = 4;

/// Which directions a test runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TestMode {
    Pressurization,
    Depressurization,
    #[default]
    Both,
}

impl TestMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pressurization => "pressurization",
            Self::Depressurization => "depressurization",
            Self::Both => "both",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pressurization" => Some(Self::Pressurization),
            "depressurization" => Some(Self::Depressurization),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    /// Directions in execution order.
    pub fn plan(self) -> Vec<Direction, 2> {
        let dirs: &[Direction] = match self {
            Self::Pressurization => &[Direction::Pressurization],
            Self::Depressurization => &[Direction::Depressurization],
            Self::Both => &[Direction::Pressurization, Direction::Depressurization],
        };
        Vec::from_slice(dirs).unwrap_or_default()
    }
}

/// Direction a point was measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    None,
    Pressurization,
    Depressurization,
}

impl Direction {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pressurization => "pressurization",
            Self::Depressurization => "depressurization",
        }
    }
}

/// Averages over the measuring window of one pressure point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TestPointResult {
    pub target_pressure_pa: f32,
    pub avg_pressure_pa: f32,
    pub avg_fan_flow_m3h: f32,
    pub avg_fan_temperature_c: f32,
    pub avg_envelope_temperature_c: f32,
    pub avg_pwm_percent: f32,
    pub sample_count: u16,
    pub valid: bool,
}

/// Power-law fit `Q = C·ΔP^n` and the figures derived from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CurveSummary {
    /// Flow coefficient C (m³/h/Paⁿ).
    pub cl_m3h_pan: f32,
    pub exponent_n: f32,
    pub correlation_r: f32,
    pub q_ref_m3h: f32,
    pub ach_ref_h1: f32,
    pub w_ref_m3h_m2: f32,
    pub q_ref_envelope_m3h_m2: f32,
    pub eqla10_cm2: f32,
    pub eqla10_cm2_per_m2_envelope: f32,
    pub lbl_ela4_cm2: f32,
    pub lbl_ela4_cm2_per_m2_envelope: f32,
    pub uncertainty_pct: f32,
    pub valid: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionReport {
    pub direction: Direction,
    pub points: Vec<TestPointResult, MAX_PRESSURE_POINTS>,
    pub summary: CurveSummary,
}

impl DirectionReport {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub report_id: u32,
    pub completed_tick_ms: u32,
    pub reference_pressure_pa: u8,
    pub pressurization: Option<DirectionReport>,
    pub depressurization: Option<DirectionReport>,
    pub mean_summary: CurveSummary,
}

impl TestReport {
    pub fn has_pressurization(&self) -> bool {
        self.pressurization.as_ref().is_some_and(|d| d.summary.valid)
    }

    pub fn has_depressurization(&self) -> bool {
        self.depressurization.as_ref().is_some_and(|d| d.summary.valid)
    }

    pub fn direction(&self, direction: Direction) -> Option<&DirectionReport> {
        match direction {
            Direction::Pressurization => self.pressurization.as_ref(),
            Direction::Depressurization => self.depressurization.as_ref(),
            Direction::None => None,
        }
    }

    /// The report slot for `direction`, created on first use.  `None` for
    /// [`Direction::None`].
    pub fn direction_mut(&mut self, direction: Direction) -> Option<&mut DirectionReport> {
        let slot = match direction {
            Direction::Pressurization => &mut self.pressurization,
            Direction::Depressurization => &mut self.depressurization,
            Direction::None => return None,
        };
        Some(slot.get_or_insert_with(|| DirectionReport::new(direction)))
    }

    /// Mean ACH at the reference pressure, 0 when the mean fit is invalid.
    pub fn ach_ref(&self) -> f32 {
        if self.mean_summary.valid {
            self.mean_summary.ach_ref_h1
        } else {
            0.0
        }
    }
}

/// Live progress of the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestRuntime {
    pub active: bool,
    pub state: TestState,
    pub requested_mode: TestMode,
    pub current_direction: Direction,
    pub current_point_index: u8,
    pub total_points: u8,
    pub current_target_pressure_pa: f32,
    pub current_measured_pressure_pa: f32,
    pub current_measured_flow_m3h: f32,
    pub state_elapsed_ms: u32,
    pub active_sample_count: u16,
    pub report_ready: bool,
    pub latest_report_id: u32,
    pub latest_ach_ref_h1: f32,
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self {
            active: false,
            state: TestState::Idle,
            requested_mode: TestMode::Both,
            current_direction: Direction::None,
            current_point_index: 0,
            total_points: 0,
            current_target_pressure_pa: 0.0,
            current_measured_pressure_pa: 0.0,
            current_measured_flow_m3h: 0.0,
            state_elapsed_ms: 0,
            active_sample_count: 0,
            report_ready: false,
            latest_report_id: 0,
            latest_ach_ref_h1: 0.0,
        }
    }
}

impl TestRuntime {
    /// Copy the "latest report" fields from `latest`.
    pub fn reflect_latest(&mut self, latest: Option<&TestReport>) {
        self.report_ready = latest.is_some();
        self.latest_report_id = latest.map_or(0, |r| r.report_id);
        self.latest_ach_ref_h1 = latest.map_or(0.0, TestReport::ach_ref);
    }
}

/// Ring buffer of completed reports.  The newest entry sits just before
/// `head`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportHistory {
    reports: [TestReport; HISTORY_CAPACITY],
    count: u8,
    head: u8,
}

impl ReportHistory {
    /// Rebuild from persisted fields, repairing out-of-range counters.
    pub fn from_parts(reports: [TestReport; HISTORY_CAPACITY], count: u8, head: u8) -> Self {
        Self {
            reports,
            count: count.min(HISTORY_CAPACITY as u8),
            head: head % HISTORY_CAPACITY as u8,
        }
    }

    pub fn push(&mut self, report: TestReport) {
        self.reports[usize::from(self.head)] = report;
        self.head = (self.head + 1) % HISTORY_CAPACITY as u8;
        if usize::from(self.count) < HISTORY_CAPACITY {
            self.count += 1;
        }
    }

    pub fn latest(&self) -> Option<&TestReport> {
        if self.count == 0 {
            return None;
        }
        let idx = (usize::from(self.head) + HISTORY_CAPACITY - 1) % HISTORY_CAPACITY;
        Some(&self.reports[idx])
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &TestReport> {
        let head = usize::from(self.head);
        (1..=usize::from(self.count))
            .map(move |back| &self.reports[(head + HISTORY_CAPACITY - back) % HISTORY_CAPACITY])
    }

    pub fn len(&self) -> usize {
        usize::from(self.count)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn head(&self) -> u8 {
        self.head
    }

    pub fn slots(&self) -> &[TestReport; HISTORY_CAPACITY] {
        &self.reports
    }
}
