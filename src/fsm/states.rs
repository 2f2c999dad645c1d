//! Concrete state handler functions and table builder.
//!
//! ```text
//!  IDLE ──[start]──▶ PREPARING ──▶ STABILIZING ──[settled]──▶ MEASURING
//!                       ▲                                        │
//!                       ├──────────[next point / direction]──────┤
//!                       │                                        ▼
//!                                                  [all done] COMPLETED
//!
//!  any running state ──[stop]──▶ ABORTED
//!  MEASURING ──[missing direction report]──▶ ERROR
//! ```
//!
//! Terminal states stay put until the service forces a new start.

use super::context::{ControlRequest, TestContext};
use super::{StateDescriptor, TestState};
use crate::config::MAX_PRESSURE_POINTS;
use crate::sequencer::curve;
use crate::sequencer::report::{Direction, TestReport};
use log::{error, info, warn};

// ═══════════════════════════════════════════════════════════════════════════
//  Table builder
// ═══════════════════════════════════════════════════════════════════════════

pub fn build_state_table() -> [StateDescriptor; TestState::COUNT] {
    [
        StateDescriptor {
            id: TestState::Idle,
            name: "Idle",
            on_enter: None,
            on_update: stay,
        },
        StateDescriptor {
            id: TestState::Preparing,
            name: "Preparing",
            on_enter: None,
            on_update: preparing_update,
        },
        StateDescriptor {
            id: TestState::Stabilizing,
            name: "Stabilizing",
            on_enter: Some(stabilizing_enter),
            on_update: stabilizing_update,
        },
        StateDescriptor {
            id: TestState::Measuring,
            name: "Measuring",
            on_enter: Some(measuring_enter),
            on_update: measuring_update,
        },
        StateDescriptor {
            id: TestState::Completed,
            name: "Completed",
            on_enter: Some(completed_enter),
            on_update: stay,
        },
        StateDescriptor {
            id: TestState::Aborted,
            name: "Aborted",
            on_enter: Some(aborted_enter),
            on_update: stay,
        },
        StateDescriptor {
            id: TestState::Error,
            name: "Error",
            on_enter: Some(error_enter),
            on_update: stay,
        },
    ]
}

fn stay(_ctx: &mut TestContext) -> Option<TestState> {
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  PREPARING
// ═══════════════════════════════════════════════════════════════════════════

fn preparing_update(ctx: &mut TestContext) -> Option<TestState> {
    let Some(target) = ctx.point_target(ctx.runtime.current_point_index) else {
        error!("TEST | no target for point {}", ctx.runtime.current_point_index);
        return Some(TestState::Error);
    };
    ctx.runtime.current_target_pressure_pa = target;
    ctx.request(ControlRequest::Target(target));
    info!(
        "TEST | {} point {}/{} target={:.1}Pa",
        ctx.runtime.current_direction.name(),
        ctx.runtime.current_point_index + 1,
        ctx.runtime.total_points,
        target
    );
    Some(TestState::Stabilizing)
}

// ═══════════════════════════════════════════════════════════════════════════
//  STABILIZING
// ═══════════════════════════════════════════════════════════════════════════

fn stabilizing_enter(ctx: &mut TestContext) {
    ctx.stable_since_ms = None;
}

fn stabilizing_update(ctx: &mut TestContext) -> Option<TestState> {
    let now = ctx.inputs.now_ms;
    let metrics = ctx.inputs.metrics;

    if !metrics.envelope_sample_valid {
        ctx.stable_since_ms = None;
        return None;
    }

    let error = (ctx.runtime.current_measured_pressure_pa - ctx.runtime.current_target_pressure_pa).abs();
    if error > ctx.config.target_tolerance_pa {
        ctx.stable_since_ms = None;
        return None;
    }

    let since = *ctx.stable_since_ms.get_or_insert(now);
    let settle_ms = u32::from(ctx.config.settle_time_s) * 1000;
    (now.wrapping_sub(since) >= settle_ms).then_some(TestState::Measuring)
}

// ═══════════════════════════════════════════════════════════════════════════
//  MEASURING
// ═══════════════════════════════════════════════════════════════════════════

fn measuring_enter(ctx: &mut TestContext) {
    ctx.accumulator = Default::default();
    ctx.measure_started_ms = Some(ctx.inputs.now_ms);
    ctx.runtime.active_sample_count = 0;
}

fn measuring_update(ctx: &mut TestContext) -> Option<TestState> {
    let inputs = ctx.inputs;
    let m = inputs.metrics;

    if m.fan_sample_valid && m.envelope_sample_valid {
        let flow = ctx.fan_flow(&m);
        ctx.accumulator.add(
            m.envelope_pressure_pa.abs(),
            flow,
            m.fan_temperature_c,
            m.envelope_temperature_c,
            inputs.output_pwm_percent,
        );
        ctx.runtime.active_sample_count = ctx.accumulator.samples();
    }

    let started = *ctx.measure_started_ms.get_or_insert(inputs.now_ms);
    let measure_ms = u32::from(ctx.config.measure_time_s) * 1000;
    if inputs.now_ms.wrapping_sub(started) < measure_ms {
        return None;
    }

    if !record_point(ctx) {
        return Some(TestState::Error);
    }
    Some(advance(ctx))
}

/// Store the finished point in its direction report.
fn record_point(ctx: &mut TestContext) -> bool {
    let idx = usize::from(ctx.runtime.current_point_index);
    let point = ctx.accumulator.finish(ctx.runtime.current_target_pressure_pa);
    let direction = ctx.runtime.current_direction;

    let Some(report) = ctx.report.direction_mut(direction) else {
        error!("TEST | no report for direction {}", direction.name());
        return false;
    };
    if idx >= MAX_PRESSURE_POINTS {
        error!("TEST | point index {} out of range", idx);
        return false;
    }

    if idx < report.points.len() {
        report.points[idx] = point;
    } else if idx == report.points.len() {
        // Capacity equals MAX_PRESSURE_POINTS, checked above.
        report.points.push(point).ok();
    } else {
        error!("TEST | point {} recorded out of order", idx);
        return false;
    }

    info!(
        "TEST | point {} done: p={:.1}Pa q={:.1}m3/h n={} valid={}",
        idx + 1,
        point.avg_pressure_pa,
        point.avg_fan_flow_m3h,
        point.sample_count,
        point.valid
    );
    true
}

/// Move to the next point, the next direction, or finish the report.
fn advance(ctx: &mut TestContext) -> TestState {
    let next_idx = ctx.runtime.current_point_index + 1;
    if usize::from(next_idx) < ctx.config.point_count() {
        ctx.runtime.current_point_index = next_idx;
        ctx.runtime.current_target_pressure_pa = ctx.point_target(next_idx).unwrap_or(0.0);
        ctx.stable_since_ms = None;
        return TestState::Preparing;
    }

    let direction = ctx.runtime.current_direction;
    let config = &ctx.config;
    let Some(report) = ctx.report.direction_mut(direction) else {
        return TestState::Error;
    };
    report.summary = curve::summarize(config, report).unwrap_or_default();
    if report.summary.valid {
        info!(
            "TEST | {} fit: C={:.2} n={:.3} r={:.4} q_ref={:.1}m3/h",
            direction.name(),
            report.summary.cl_m3h_pan,
            report.summary.exponent_n,
            report.summary.correlation_r,
            report.summary.q_ref_m3h
        );
    } else {
        warn!("TEST | {} fit failed", direction.name());
    }

    if ctx.plan_slot + 1 < ctx.plan.len() {
        ctx.plan_slot += 1;
        ctx.runtime.current_direction = ctx.plan[ctx.plan_slot];
        ctx.runtime.current_point_index = 0;
        ctx.runtime.current_target_pressure_pa = ctx.point_target(0).unwrap_or(0.0);
        ctx.runtime.active_sample_count = 0;
        ctx.stable_since_ms = None;
        ctx.measure_started_ms = None;
        return TestState::Preparing;
    }

    finish_report(ctx);
    TestState::Completed
}

fn finish_report(ctx: &mut TestContext) {
    let summary_of = |r: &TestReport, d: Direction| r.direction(d).map(|d| d.summary);
    let press = summary_of(&ctx.report, Direction::Pressurization);
    let depress = summary_of(&ctx.report, Direction::Depressurization);
    ctx.report.mean_summary = curve::mean_summary(press.as_ref(), depress.as_ref());
    ctx.report.completed_tick_ms = ctx.inputs.now_ms;

    ctx.history.push(ctx.report.clone());
    ctx.completed_report = Some(ctx.report.report_id);
    ctx.runtime.reflect_latest(ctx.history.latest());
    info!(
        "TEST | report {} complete: ach={:.2}/h valid={}",
        ctx.report.report_id,
        ctx.report.ach_ref(),
        ctx.report.mean_summary.valid
    );
}

// ═══════════════════════════════════════════════════════════════════════════
//  Terminal states
// ═══════════════════════════════════════════════════════════════════════════

fn release(ctx: &mut TestContext) {
    ctx.runtime.active = false;
    ctx.request(ControlRequest::Release);
}

fn completed_enter(ctx: &mut TestContext) {
    release(ctx);
}

fn aborted_enter(ctx: &mut TestContext) {
    warn!("TEST | aborted in point {}", ctx.runtime.current_point_index + 1);
    release(ctx);
}

fn error_enter(ctx: &mut TestContext) {
    error!("TEST | sequencer error, control released");
    release(ctx);
}
