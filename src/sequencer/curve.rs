//! Air density, fan flow and the power-law leakage fit.
//!
//! ```text
//!   ln Q = ln C + n · ln ΔP          least squares over valid points
//!   q_ref = C · ΔP_ref^n             → ACH, per-floor, per-envelope flows
//!   A_x   = C·x^n / 3600 / √(2x/ρ)   → EqLA10 (x = 10), ELA4 (x = 4)
//! ```
//!
//! Sums are accumulated in `f64`; results are stored as `f32`.

use core::f32::consts::PI;

use crate::config::TestConfig;

use super::report::{CurveSummary, DirectionReport};

pub const SEA_LEVEL_AIR_DENSITY: f32 = 1.225;
const AIR_GAS_CONSTANT: f32 = 287.05;
const SEA_LEVEL_PRESSURE_PA: f32 = 101_325.0;
/// Aperture the fan curve coefficients are calibrated at.
pub const FULL_APERTURE_CM: f32 = 31.0;
/// Temperature at which leakage areas are reported.
const REFERENCE_TEMPERATURE_C: f32 = 20.0;

/// Barometric air density (kg/m³) at `altitude_m` and `temperature_c`.
pub fn air_density(altitude_m: f32, temperature_c: f32) -> f32 {
    let altitude = altitude_m.clamp(0.0, 6000.0);
    let pressure = SEA_LEVEL_PRESSURE_PA * (1.0 - 2.25577e-5 * altitude).powf(5.25588);
    let kelvin = temperature_c.clamp(-40.0, 80.0) + 273.15;
    if kelvin <= 1.0 {
        return SEA_LEVEL_AIR_DENSITY;
    }
    pressure / (AIR_GAS_CONSTANT * kelvin)
}

/// Open area of the fan ring relative to the calibrated full aperture.
pub fn aperture_scale(diameter_cm: f32) -> f32 {
    let area = |d_cm: f32| PI * (d_cm / 100.0 * 0.5).powi(2);
    let full = area(FULL_APERTURE_CM);
    if full <= 0.0 {
        return 1.0;
    }
    area(diameter_cm.clamp(5.0, 60.0)) / full
}

/// Fan volume flow (m³/h) from its ring pressure, corrected for aperture
/// and air density.
pub fn fan_flow_m3h(config: &TestConfig, fan_pressure_pa: f32, temperature_c: f32) -> f32 {
    let dp = fan_pressure_pa.abs();
    if dp <= 0.0 || config.fan_curve_c <= 0.0 || config.fan_curve_n <= 0.0 {
        return 0.0;
    }
    let rho = air_density(config.altitude_m, temperature_c);
    let density_factor = if rho > 0.0 {
        (SEA_LEVEL_AIR_DENSITY / rho).sqrt()
    } else {
        1.0
    };
    config.fan_curve_c * dp.powf(config.fan_curve_n) * aperture_scale(config.fan_aperture_cm) * density_factor
}

fn per(value: f32, divisor: f32) -> f32 {
    if divisor > 0.0 { value / divisor } else { 0.0 }
}

/// Fit the direction's valid points.  `None` when there are fewer than two
/// usable points, fewer than the ISO minimum (if enforced), or the points
/// are degenerate.
pub fn summarize(config: &TestConfig, report: &DirectionReport) -> Option<CurveSummary> {
    let usable = || {
        report
            .points
            .iter()
            .filter(|p| p.valid && p.avg_pressure_pa > 0.0 && p.avg_fan_flow_m3h > 0.0)
    };

    let (mut sx, mut sy, mut sx2, mut sy2, mut sxy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64, 0.0f64);
    let mut count = 0usize;
    for p in usable() {
        let x = f64::from(p.avg_pressure_pa).ln();
        let y = f64::from(p.avg_fan_flow_m3h).ln();
        sx += x;
        sy += y;
        sx2 += x * x;
        sy2 += y * y;
        sxy += x * y;
        count += 1;
    }

    if count < 2
        || (config.enforce_iso_9972_rules && count < usize::from(config.min_points_required))
    {
        return None;
    }

    let n = count as f64;
    let denominator = n * sx2 - sx * sx;
    if denominator.abs() < 1e-6 {
        return None;
    }

    let slope = (n * sxy - sx * sy) / denominator;
    let intercept = (sy - slope * sx) / n;
    let cl = intercept.exp();

    let corr_den = denominator * (n * sy2 - sy * sy);
    let correlation = if corr_den > 1e-9 {
        (n * sxy - sx * sy) / corr_den.sqrt()
    } else {
        0.0
    };

    let mut rel_err2 = 0.0f64;
    for p in usable() {
        let predicted = cl * f64::from(p.avg_pressure_pa).powf(slope);
        if predicted > 0.0 {
            let rel = (f64::from(p.avg_fan_flow_m3h) - predicted) / predicted;
            rel_err2 += rel * rel;
        }
    }

    let (cl, slope) = (cl as f32, slope as f32);
    let q_ref = cl * f32::from(config.reference_pressure_pa).powf(slope);
    if !(cl.is_finite() && slope.is_finite() && q_ref.is_finite()) {
        return None;
    }
    let rho = air_density(config.altitude_m, REFERENCE_TEMPERATURE_C);
    let leakage_area_cm2 = |dp: f32| {
        if rho > 0.0 {
            let q_m3s = cl * dp.powf(slope) / 3600.0;
            q_m3s / (2.0 * dp / rho).sqrt() * 10_000.0
        } else {
            0.0
        }
    };
    let eqla10 = leakage_area_cm2(10.0);
    let ela4 = leakage_area_cm2(4.0);

    let fit_pct = ((rel_err2 / n).sqrt() * 100.0) as f32;
    let dim_pct = config.dimensions_uncertainty_pct;

    Some(CurveSummary {
        cl_m3h_pan: cl,
        exponent_n: slope,
        correlation_r: correlation as f32,
        q_ref_m3h: q_ref,
        ach_ref_h1: per(q_ref, config.building_volume_m3),
        w_ref_m3h_m2: per(q_ref, config.floor_area_m2),
        q_ref_envelope_m3h_m2: per(q_ref, config.envelope_area_m2),
        eqla10_cm2: eqla10,
        eqla10_cm2_per_m2_envelope: per(eqla10, config.envelope_area_m2),
        lbl_ela4_cm2: ela4,
        lbl_ela4_cm2_per_m2_envelope: per(ela4, config.envelope_area_m2),
        uncertainty_pct: (fit_pct * fit_pct + dim_pct * dim_pct).sqrt(),
        valid: true,
    })
}

/// Combine both directions.  With two valid fits every field is averaged
/// and half the relative q_ref spread is added to the uncertainty; with one
/// it passes through; with none the result is invalid.
pub fn mean_summary(press: Option<&CurveSummary>, depress: Option<&CurveSummary>) -> CurveSummary {
    let press = press.filter(|s| s.valid);
    let depress = depress.filter(|s| s.valid);

    match (press, depress) {
        (Some(a), Some(b)) => {
            let avg = |x: f32, y: f32| (x + y) * 0.5;
            let mut mean = CurveSummary {
                cl_m3h_pan: avg(a.cl_m3h_pan, b.cl_m3h_pan),
                exponent_n: avg(a.exponent_n, b.exponent_n),
                correlation_r: avg(a.correlation_r, b.correlation_r),
                q_ref_m3h: avg(a.q_ref_m3h, b.q_ref_m3h),
                ach_ref_h1: avg(a.ach_ref_h1, b.ach_ref_h1),
                w_ref_m3h_m2: avg(a.w_ref_m3h_m2, b.w_ref_m3h_m2),
                q_ref_envelope_m3h_m2: avg(a.q_ref_envelope_m3h_m2, b.q_ref_envelope_m3h_m2),
                eqla10_cm2: avg(a.eqla10_cm2, b.eqla10_cm2),
                eqla10_cm2_per_m2_envelope: avg(
                    a.eqla10_cm2_per_m2_envelope,
                    b.eqla10_cm2_per_m2_envelope,
                ),
                lbl_ela4_cm2: avg(a.lbl_ela4_cm2, b.lbl_ela4_cm2),
                lbl_ela4_cm2_per_m2_envelope: avg(
                    a.lbl_ela4_cm2_per_m2_envelope,
                    b.lbl_ela4_cm2_per_m2_envelope,
                ),
                uncertainty_pct: avg(a.uncertainty_pct, b.uncertainty_pct),
                valid: true,
            };
            if mean.q_ref_m3h > 0.0 {
                let spread_pct = (a.q_ref_m3h - b.q_ref_m3h).abs() / mean.q_ref_m3h * 100.0;
                mean.uncertainty_pct += spread_pct * 0.5;
            }
            mean
        }
        (Some(one), None) | (None, Some(one)) => *one,
        (None, None) => CurveSummary::default(),
    }
}
