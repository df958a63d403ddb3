//! Piecewise-linear calibration curves.
//!
//! A [`Curve`] is a validated list of `(x, y)` control points. Queries inside
//! the domain interpolate between the bracketing points; queries outside it
//! extend the nearest edge segment's slope instead of clamping to the edge
//! value.

use serde::{Deserialize, Serialize};

use crate::{Result, TelemetryError};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "CurveColumns")]
pub struct Curve {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

#[derive(Deserialize)]
struct CurveColumns {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl TryFrom<CurveColumns> for Curve {
    type Error = TelemetryError;

    fn try_from(columns: CurveColumns) -> Result<Self> {
        Curve::from_columns("curve", columns.xs, columns.ys)
    }
}

impl Curve {
    /// Build a curve from control points. `label` names the curve in errors.
    pub fn new(label: &str, points: &[(f64, f64)]) -> Result<Self> {
        let (xs, ys): (Vec<f64>, Vec<f64>) = points.iter().copied().unzip();
        Self::from_columns(label, xs, ys)
    }

    /// Build a curve from parallel x/y columns, paired by index.
    pub fn from_columns(label: &str, xs: Vec<f64>, ys: Vec<f64>) -> Result<Self> {
        let invalid = |reason: String| TelemetryError::InvalidCurve {
            curve: label.to_string(),
            reason,
        };
        if xs.len() != ys.len() {
            return Err(invalid(format!(
                "{} x values but {} y values",
                xs.len(),
                ys.len()
            )));
        }
        if xs.len() < 2 {
            return Err(invalid(format!(
                "need at least 2 points, got {}",
                xs.len()
            )));
        }
        if let Some(idx) = xs.iter().chain(ys.iter()).position(|v| !v.is_finite()) {
            return Err(invalid(format!(
                "non-finite value at position {}",
                idx % xs.len()
            )));
        }
        if let Some(pos) = xs.windows(2).position(|w| w[1] <= w[0]) {
            return Err(invalid(format!(
                "x values must be strictly ascending ({} then {})",
                xs[pos],
                xs[pos + 1]
            )));
        }
        Ok(Self { xs, ys })
    }

    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.xs.iter().copied().zip(self.ys.iter().copied())
    }

    pub fn min_y(&self) -> f64 {
        self.ys.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max_y(&self) -> f64 {
        self.ys.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// New curve with every y multiplied by `factor`; x values are unchanged.
    pub fn scale_y(&self, factor: f64) -> Curve {
        Curve {
            xs: self.xs.clone(),
            ys: self.ys.iter().map(|y| y * factor).collect(),
        }
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        let seg = self.segment_for(x);
        let (x0, x1) = (self.xs[seg], self.xs[seg + 1]);
        let (y0, y1) = (self.ys[seg], self.ys[seg + 1]);
        if x == x0 {
            return y0;
        }
        if x == x1 {
            return y1;
        }
        y0 + (x - x0) * (y1 - y0) / (x1 - x0)
    }

    pub fn evaluate_all(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.evaluate(x)).collect()
    }

    /// Index of the segment used for `x`: the bracketing one inside the
    /// domain, the first or last one outside it.
    fn segment_for(&self, x: f64) -> usize {
        let last = self.xs.len() - 2;
        // First index whose x is >= query; the segment ends there.
        let upper = self.xs.partition_point(|&v| v < x);
        upper.saturating_sub(1).min(last)
    }
}
