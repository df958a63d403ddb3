//! Calibration engine: speed trace in, RPM / fuel series out.

use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conditions::RideConditions;
use crate::profile::Profile;
use crate::{Result, TelemetryError, Trace};

pub const KMH_TO_MPH: f64 = 0.621371;
const SECONDS_PER_HOUR: f64 = 3600.0;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct EnrichedSample {
    pub timestamp: DateTime<Utc>,
    pub speed_kmh: f64,
    pub speed_mph: f64,
    pub rpm: i64,
    pub fuel_rate_lph: f64,
    pub cumulative_fuel_l: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EnrichedSeries {
    pub samples: Vec<EnrichedSample>,
    pub total_factor: f64,
}

impl EnrichedSeries {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn total_fuel_l(&self) -> f64 {
        self.samples
            .last()
            .map(|s| s.cumulative_fuel_l)
            .unwrap_or(0.0)
    }

    pub fn duration_s(&self) -> f64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => {
                (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0
            }
            _ => 0.0,
        }
    }

    pub fn max_rpm(&self) -> Option<i64> {
        self.samples.iter().map(|s| s.rpm).max()
    }
}

/// Compute RPM, fuel rate and cumulative fuel for every sample of `trace`.
///
/// The RPM curve is scaled by the ride conditions' total factor before
/// lookup. Output RPM is clipped to the unscaled curve minimum below and the
/// scaled curve maximum above; fuel rate is clipped at zero.
pub fn calculate_telemetry(
    trace: &Trace,
    profile: &Profile,
    conditions: &RideConditions,
) -> Result<EnrichedSeries> {
    let samples = trace.samples();
    if samples.is_empty() {
        return Err(TelemetryError::EmptyTrace);
    }

    let total_factor = conditions.total_factor();
    let adjusted_rpm = profile.rpm_curve.scale_y(total_factor);
    let (rpm_lo, rpm_hi) = rpm_bounds(
        profile.rpm_curve.min_y(),
        profile.rpm_curve.max_y() * total_factor,
    );
    debug!(
        "profile '{}': total factor {:.4}, rpm bounds [{}, {}]",
        profile.name, total_factor, rpm_lo, rpm_hi
    );

    let speed_kmh: Array1<f64> = samples.iter().map(|s| s.speed_kmh).collect();
    let speed_mph = speed_kmh.mapv(|v| v * KMH_TO_MPH);
    let rpm: Array1<i64> = speed_mph.mapv(|mph| {
        let raw = adjusted_rpm.evaluate(mph).round_ties_even();
        clip_rpm(raw, rpm_lo, rpm_hi)
    });
    let fuel_rate = rpm.mapv(|r| profile.fuel_curve.evaluate(r as f64).max(0.0));
    let time_delta = time_deltas_s(trace);
    let cumulative = cumulative_fuel(&fuel_rate, &time_delta);

    let enriched = samples
        .iter()
        .enumerate()
        .map(|(i, sample)| EnrichedSample {
            timestamp: sample.timestamp,
            speed_kmh: speed_kmh[i],
            speed_mph: speed_mph[i],
            rpm: rpm[i],
            fuel_rate_lph: fuel_rate[i],
            cumulative_fuel_l: cumulative[i],
        })
        .collect();

    Ok(EnrichedSeries {
        samples: enriched,
        total_factor,
    })
}

/// Integer clip range. Crossed bounds are swapped first.
fn rpm_bounds(lower: f64, upper: f64) -> (i64, i64) {
    let (lo, hi) = if lower <= upper {
        (lower, upper)
    } else {
        (upper, lower)
    };
    let lo_i = lo.ceil() as i64;
    let hi_i = (hi.floor() as i64).max(lo_i);
    (lo_i, hi_i)
}

fn clip_rpm(raw: f64, lo: i64, hi: i64) -> i64 {
    if raw.is_nan() {
        return lo;
    }
    // Float-to-int casts saturate, so out-of-range extrapolation still clips correctly.
    (raw as i64).clamp(lo, hi)
}

/// Seconds since the previous sample; 0 for the first.
fn time_deltas_s(trace: &Trace) -> Array1<f64> {
    let samples = trace.samples();
    let mut deltas = Array1::zeros(samples.len());
    for i in 1..samples.len() {
        let delta = samples[i].timestamp - samples[i - 1].timestamp;
        deltas[i] = match delta.num_microseconds() {
            Some(us) => us as f64 / 1_000_000.0,
            None => delta.num_milliseconds() as f64 / 1000.0,
        };
    }
    deltas
}

fn cumulative_fuel(fuel_rate_lph: &Array1<f64>, time_delta_s: &Array1<f64>) -> Array1<f64> {
    let mut total = 0.0;
    let mut out = Array1::zeros(fuel_rate_lph.len());
    for (i, (rate, dt)) in fuel_rate_lph.iter().zip(time_delta_s.iter()).enumerate() {
        total += rate * (dt / SECONDS_PER_HOUR);
        out[i] = total;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{DriveMode, EngineSize, FuelLoad, WaterCondition};
    use crate::curve::Curve;
    use crate::TraceSample;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 14, 9, 30, 0).unwrap()
    }

    fn trace_at(speeds_kmh: &[f64], spacing_s: i64) -> Trace {
        let samples = speeds_kmh
            .iter()
            .enumerate()
            .map(|(i, &v)| TraceSample::new(t0() + Duration::seconds(spacing_s * i as i64), v))
            .collect();
        Trace::new(samples).unwrap()
    }

    fn scenario_profile() -> Profile {
        Profile::new(
            "scenario",
            Curve::new("rpm", &[(0.0, 1000.0), (30.0, 5000.0)]).unwrap(),
            Curve::new("fuel", &[(1000.0, 2.0), (5000.0, 10.0)]).unwrap(),
        )
    }

    fn wide_profile() -> Profile {
        Profile::new(
            "wide",
            Curve::new("rpm", &[(0.0, 1000.0), (20.0, 4000.0), (60.0, 7000.0)]).unwrap(),
            Curve::new("fuel", &[(1000.0, 2.0), (4000.0, 20.0), (7000.0, 70.0)]).unwrap(),
        )
    }

    fn neutral() -> RideConditions {
        RideConditions {
            rider_weight_kg: 80.0,
            engine_size: EngineSize::Small,
            fuel_load: FuelLoad::Full,
            drive_mode: DriveMode::Normal,
            water_condition: WaterCondition::Calm,
        }
    }

    #[test]
    fn test_three_sample_scenario() {
        let trace = trace_at(&[0.0, 20.0, 40.0], 10);
        let series = calculate_telemetry(&trace, &scenario_profile(), &neutral()).unwrap();
        assert!((series.total_factor - 1.02).abs() < 1e-12);
        assert_eq!(series.len(), 3);

        let rpm: Vec<i64> = series.samples.iter().map(|s| s.rpm).collect();
        // 0 mph -> 1020, 12.43 mph -> 2710, 24.85 mph -> 4400 on the scaled curve.
        assert_eq!(rpm, vec![1020, 2710, 4400]);
        for r in &rpm {
            assert!((1000..=5100).contains(r));
        }

        let fuel = &series.samples;
        assert!((fuel[0].fuel_rate_lph - 2.04).abs() < 1e-9);
        assert!((fuel[1].fuel_rate_lph - 5.42).abs() < 1e-9);
        assert!((fuel[2].fuel_rate_lph - 8.8).abs() < 1e-9);

        assert_eq!(fuel[0].cumulative_fuel_l, 0.0);
        assert!(fuel[1].cumulative_fuel_l > fuel[0].cumulative_fuel_l);
        assert!(fuel[2].cumulative_fuel_l > fuel[1].cumulative_fuel_l);
        let expected_total = 5.42 * 10.0 / 3600.0 + 8.8 * 10.0 / 3600.0;
        assert!((series.total_fuel_l() - expected_total).abs() < 1e-9);
        assert_eq!(series.duration_s(), 20.0);
    }

    #[test]
    fn test_rpm_clip_uses_unscaled_min_and_scaled_max() {
        let conditions = RideConditions {
            engine_size: EngineSize::Large,
            fuel_load: FuelLoad::Low,
            ..neutral()
        };
        assert!((conditions.total_factor() - 1.05).abs() < 1e-12);
        // 0 km/h would be 1050 on the scaled curve; 200 km/h extrapolates far past the top.
        let trace = trace_at(&[0.0, 200.0], 1);
        let series = calculate_telemetry(&trace, &wide_profile(), &conditions).unwrap();
        assert_eq!(series.samples[0].rpm, 1050);
        assert_eq!(series.samples[1].rpm, 7350);
        assert_eq!(series.max_rpm(), Some(7350));
    }

    #[test]
    fn test_rpm_lower_clip_applies_to_unscaled_minimum() {
        let conditions = RideConditions {
            drive_mode: DriveMode::Limited,
            fuel_load: FuelLoad::Low,
            ..neutral()
        };
        // Scaled curve starts at 850 rpm; lower bound stays at 1000.
        let trace = trace_at(&[0.0, 5.0], 1);
        let series = calculate_telemetry(&trace, &wide_profile(), &conditions).unwrap();
        assert_eq!(series.samples[0].rpm, 1000);
        assert!(series.samples[1].rpm >= 1000);
        assert!(series.samples[1].rpm <= 5950);
    }

    #[test]
    fn test_crossed_bounds_are_swapped() {
        // Under no-wake the scaled maximum (900) falls below the unscaled minimum (1500).
        let narrow = Profile::new(
            "narrow",
            Curve::new("rpm", &[(0.0, 1500.0), (30.0, 3000.0)]).unwrap(),
            Curve::new("fuel", &[(0.0, 1.0), (3000.0, 10.0)]).unwrap(),
        );
        let conditions = RideConditions {
            drive_mode: DriveMode::NoWake,
            fuel_load: FuelLoad::Low,
            ..neutral()
        };
        let trace = trace_at(&[0.0, 200.0], 1);
        let series = calculate_telemetry(&trace, &narrow, &conditions).unwrap();
        // Bounds become [900, 1500].
        assert_eq!(series.samples[0].rpm, 900);
        assert_eq!(series.samples[1].rpm, 1500);
        assert_eq!(rpm_bounds(1500.0, 900.0), (900, 1500));
    }

    #[test]
    fn test_fractional_upper_bound_stays_inside_range() {
        assert_eq!(rpm_bounds(1000.0, 5099.5), (1000, 5099));
        assert_eq!(rpm_bounds(999.2, 5000.0), (1000, 5000));
        assert_eq!(clip_rpm(1e30, 1000, 5000), 5000);
        assert_eq!(clip_rpm(-1e30, 1000, 5000), 1000);
        assert_eq!(clip_rpm(f64::NAN, 1000, 5000), 1000);
    }

    #[test]
    fn test_rounding_is_half_to_even() {
        // At 0 mph the curve sits exactly on 1002.5 rpm.
        let profile = Profile::new(
            "tiny",
            Curve::new("rpm", &[(0.0, 1002.5), (2.0, 1000.0), (4.0, 2000.0)]).unwrap(),
            Curve::new("fuel", &[(1000.0, 1.0), (2000.0, 2.0)]).unwrap(),
        );
        let conditions = RideConditions {
            fuel_load: FuelLoad::Low,
            ..neutral()
        };
        assert_eq!(conditions.total_factor(), 1.0);
        let trace = trace_at(&[0.0], 1);
        let series = calculate_telemetry(&trace, &profile, &conditions).unwrap();
        assert_eq!(series.samples[0].rpm, 1002);
    }

    #[test]
    fn test_fuel_rate_never_negative() {
        // Fuel curve extrapolates below zero under 1000 rpm.
        let profile = Profile::new(
            "steep",
            Curve::new("rpm", &[(0.0, 500.0), (30.0, 5000.0)]).unwrap(),
            Curve::new("fuel", &[(1000.0, 0.5), (5000.0, 20.0)]).unwrap(),
        );
        let trace = trace_at(&[0.0, 1.0, 50.0], 5);
        let series = calculate_telemetry(&trace, &profile, &neutral()).unwrap();
        assert_eq!(series.samples[0].fuel_rate_lph, 0.0);
        for s in &series.samples {
            assert!(s.fuel_rate_lph >= 0.0);
        }
    }

    #[test]
    fn test_cumulative_fuel_handles_irregular_spacing() {
        let start = t0();
        let samples = vec![
            TraceSample::new(start, 30.0),
            TraceSample::new(start + Duration::milliseconds(500), 30.0),
            TraceSample::new(start + Duration::milliseconds(500), 30.0),
            TraceSample::new(start + Duration::seconds(61), 30.0),
        ];
        let trace = Trace::new(samples).unwrap();
        let series = calculate_telemetry(&trace, &scenario_profile(), &neutral()).unwrap();
        let rate = series.samples[0].fuel_rate_lph;
        let cumulative: Vec<f64> = series.samples.iter().map(|s| s.cumulative_fuel_l).collect();
        assert_eq!(cumulative[0], 0.0);
        assert!((cumulative[1] - rate * 0.5 / 3600.0).abs() < 1e-12);
        assert_eq!(cumulative[2], cumulative[1]);
        assert!((cumulative[3] - rate * 61.0 / 3600.0).abs() < 1e-12);
        for w in cumulative.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn test_engine_is_deterministic_and_leaves_inputs_alone() {
        let trace = trace_at(&[3.0, 17.5, 42.0, 61.2, 12.0], 2);
        let profile = wide_profile();
        let conditions = RideConditions {
            rider_weight_kg: 93.4,
            water_condition: WaterCondition::Rough,
            ..neutral()
        };
        let before = (trace.clone(), profile.clone());
        let first = calculate_telemetry(&trace, &profile, &conditions).unwrap();
        let second = calculate_telemetry(&trace, &profile, &conditions).unwrap();
        assert_eq!(first, second);
        for (a, b) in first.samples.iter().zip(second.samples.iter()) {
            assert_eq!(a.fuel_rate_lph.to_bits(), b.fuel_rate_lph.to_bits());
            assert_eq!(a.cumulative_fuel_l.to_bits(), b.cumulative_fuel_l.to_bits());
        }
        assert_eq!(before, (trace, profile));
    }

    #[test]
    fn test_single_sample_trace() {
        let trace = trace_at(&[25.0], 1);
        let series = calculate_telemetry(&trace, &scenario_profile(), &neutral()).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series.total_fuel_l(), 0.0);
        assert_eq!(series.duration_s(), 0.0);
    }
}
