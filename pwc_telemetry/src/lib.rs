//! Synthesized engine telemetry for personal watercraft.
//!
//! GPS speed traces from FIT, GPX and GoPro MP4 files are mapped through a
//! vehicle profile's calibration curves to produce engine RPM, fuel rate and
//! cumulative fuel used per sample.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod conditions;
pub mod curve;
pub mod engine;
pub mod gopro;
pub mod output;
pub mod profile;

pub use conditions::{DriveMode, EngineSize, FuelLoad, RideConditions, WaterCondition};
pub use curve::Curve;
pub use engine::{calculate_telemetry, EnrichedSample, EnrichedSeries};
pub use output::{write_series, write_series_stdout, OutputFormat};
pub use profile::{Profile, ProfileStore};

const MPS_TO_KMH: f64 = 3.6;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to parse FIT file: {0}")]
    FitParse(String),
    #[error("failed to parse GPX file: {0}")]
    GpxParse(String),
    #[error("failed to parse GoPro file: {0}")]
    GoProParse(String),
    #[error("no usable speed data: {0}")]
    NoSpeedData(String),
    #[error("trace contains no samples")]
    EmptyTrace,
    #[error("trace timestamps go backwards at sample {index}")]
    UnorderedTrace { index: usize },
    #[error("invalid speed {value} km/h at sample {index}")]
    InvalidSpeed { index: usize, value: f64 },
    #[error("invalid curve '{curve}': {reason}")]
    InvalidCurve { curve: String, reason: String },
    #[error("invalid value '{value}' for {field}")]
    InvalidConditionValue { field: &'static str, value: String },
    #[error("profile store error: {0}")]
    ProfileStore(String),
    #[error("profile '{0}' not found")]
    ProfileNotFound(String),
    #[error("failed to write output: {0}")]
    OutputWrite(String),
}

impl TelemetryError {
    /// True for failures raised while turning a source file into a trace.
    pub fn is_adapter_error(&self) -> bool {
        matches!(
            self,
            TelemetryError::UnsupportedFormat(_)
                | TelemetryError::FitParse(_)
                | TelemetryError::GpxParse(_)
                | TelemetryError::GoProParse(_)
                | TelemetryError::NoSpeedData(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TelemetryError>;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct TraceSample {
    pub timestamp: DateTime<Utc>,
    pub speed_kmh: f64,
}

impl TraceSample {
    pub fn new(timestamp: DateTime<Utc>, speed_kmh: f64) -> Self {
        Self {
            timestamp,
            speed_kmh,
        }
    }
}

/// Time-ordered speed observations. Never empty; every speed is finite and
/// non-negative.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "TraceDoc")]
pub struct Trace {
    samples: Vec<TraceSample>,
}

#[derive(Deserialize)]
struct TraceDoc {
    samples: Vec<TraceSample>,
}

impl TryFrom<TraceDoc> for Trace {
    type Error = TelemetryError;

    fn try_from(doc: TraceDoc) -> Result<Self> {
        Trace::new(doc.samples)
    }
}

impl Trace {
    pub fn new(samples: Vec<TraceSample>) -> Result<Self> {
        if samples.is_empty() {
            return Err(TelemetryError::EmptyTrace);
        }
        if let Some((index, sample)) = samples
            .iter()
            .enumerate()
            .find(|(_, s)| !(s.speed_kmh.is_finite() && s.speed_kmh >= 0.0))
        {
            return Err(TelemetryError::InvalidSpeed {
                index,
                value: sample.speed_kmh,
            });
        }
        if let Some(pos) = samples
            .windows(2)
            .position(|w| w[1].timestamp < w[0].timestamp)
        {
            return Err(TelemetryError::UnorderedTrace { index: pos + 1 });
        }
        Ok(Self { samples })
    }

    /// Sort by timestamp (stable) and build the trace. Used by the adapters,
    /// whose sources are not guaranteed to be in order.
    pub fn from_unordered(mut samples: Vec<TraceSample>) -> Result<Self> {
        samples.sort_by_key(|s| s.timestamp);
        Self::new(samples)
    }

    pub fn samples(&self) -> &[TraceSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.samples[0].timestamp
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.samples[self.samples.len() - 1].timestamp
    }

    pub fn span_s(&self) -> f64 {
        (self.end() - self.start()).num_milliseconds() as f64 / 1000.0
    }

    pub fn max_speed_kmh(&self) -> f64 {
        self.samples
            .iter()
            .map(|s| s.speed_kmh)
            .fold(0.0, f64::max)
    }

    pub fn mean_speed_kmh(&self) -> f64 {
        self.samples.iter().map(|s| s.speed_kmh).sum::<f64>() / self.samples.len() as f64
    }
}

/// Parse a speed trace from bytes using the provided format hint (extension or file name).
pub fn parse_trace(input: &[u8], format: &str) -> Result<Trace> {
    let format_lc = format.to_ascii_lowercase();
    let kind = format_lc.rsplit('.').next().unwrap_or("");
    match kind {
        "fit" => parse_fit_trace(input),
        "gpx" => parse_gpx_trace(input),
        "mp4" | "mov" => gopro::parse_gopro_trace(input),
        _ => Err(TelemetryError::UnsupportedFormat(format.to_string())),
    }
}

/// Speed-related fields of one FIT `record` message.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct FitRecord {
    timestamp: Option<DateTime<Utc>>,
    speed: Option<f64>,
    enhanced_speed: Option<f64>,
}

fn parse_fit_trace(input: &[u8]) -> Result<Trace> {
    use fitparser::de::from_bytes;
    use fitparser::profile::MesgNum;
    let messages = from_bytes(input).map_err(|e| TelemetryError::FitParse(e.to_string()))?;

    let records: Vec<FitRecord> = messages
        .into_iter()
        .filter(|message| message.kind() == MesgNum::Record)
        .map(|message| {
            let mut record = FitRecord::default();
            for field in message.fields() {
                match field.name() {
                    "timestamp" => {
                        if let fitparser::Value::Timestamp(ts) = field.value() {
                            record.timestamp = Some(ts.with_timezone(&Utc));
                        }
                    }
                    "speed" => record.speed = fit_value_to_f64(field.value()),
                    "enhanced_speed" => record.enhanced_speed = fit_value_to_f64(field.value()),
                    _ => {}
                }
            }
            record
        })
        .collect();

    Trace::from_unordered(fit_samples(&records)?)
}

/// Map FIT records to samples. `enhanced_speed` wins over `speed`; records
/// missing a timestamp or both speeds are skipped.
fn fit_samples(records: &[FitRecord]) -> Result<Vec<TraceSample>> {
    if records.is_empty() {
        return Err(TelemetryError::NoSpeedData(
            "no 'record' messages found in FIT file".into(),
        ));
    }
    let out: Vec<TraceSample> = records
        .iter()
        .filter_map(|record| {
            let ts = record.timestamp?;
            let mps = record.enhanced_speed.or(record.speed)?;
            mps.is_finite()
                .then(|| TraceSample::new(ts, mps.max(0.0) * MPS_TO_KMH))
        })
        .collect();
    if out.is_empty() {
        return Err(TelemetryError::NoSpeedData(
            "could not extract timestamp and speed from FIT records".into(),
        ));
    }
    debug!("FIT: {} of {} records carried speed", out.len(), records.len());
    Ok(out)
}

fn fit_value_to_f64(value: &fitparser::Value) -> Option<f64> {
    match value {
        fitparser::Value::Float32(v) => Some(*v as f64),
        fitparser::Value::Float64(v) => Some(*v),
        fitparser::Value::SInt16(v) => Some(*v as f64),
        fitparser::Value::UInt16(v) => Some(*v as f64),
        fitparser::Value::SInt32(v) => Some(*v as f64),
        fitparser::Value::UInt32(v) => Some(*v as f64),
        fitparser::Value::SInt64(v) => Some(*v as f64),
        fitparser::Value::UInt64(v) => Some(*v as f64),
        fitparser::Value::UInt16z(v) => Some(*v as f64),
        fitparser::Value::UInt32z(v) => Some(*v as f64),
        fitparser::Value::UInt64z(v) => Some(*v as f64),
        fitparser::Value::Byte(v) => Some(*v as f64),
        fitparser::Value::UInt8(v) => Some(*v as f64),
        fitparser::Value::UInt8z(v) => Some(*v as f64),
        fitparser::Value::SInt8(v) => Some(*v as f64),
        fitparser::Value::Array(values) => values.iter().find_map(fit_value_to_f64),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug)]
struct GpxFix {
    time: DateTime<Utc>,
    lat: f64,
    lon: f64,
    ele: Option<f64>,
}

fn parse_gpx_trace(input: &[u8]) -> Result<Trace> {
    use gpx::read;
    use std::io::Cursor;

    let mut cursor = Cursor::new(input);
    let gpx = read(&mut cursor).map_err(|e| TelemetryError::GpxParse(e.to_string()))?;
    let mut out = Vec::new();

    for track in gpx.tracks {
        for segment in track.segments {
            let mut previous: Option<GpxFix> = None;
            for point in segment.points {
                let Some(time) = point.time else {
                    continue;
                };
                let iso = time
                    .format()
                    .map_err(|e| TelemetryError::GpxParse(e.to_string()))?;
                let utc = DateTime::parse_from_rfc3339(&iso)
                    .map_err(|e| TelemetryError::GpxParse(e.to_string()))?
                    .with_timezone(&Utc);
                let geo = point.point();
                let fix = GpxFix {
                    time: utc,
                    lat: geo.y(),
                    lon: geo.x(),
                    ele: point.elevation,
                };
                match previous {
                    None => out.push(TraceSample::new(fix.time, 0.0)),
                    Some(prev) => {
                        let seconds = (fix.time - prev.time).num_milliseconds() as f64 / 1000.0;
                        if seconds > 0.0 {
                            let mps = segment_distance(&prev, &fix) / seconds;
                            out.push(TraceSample::new(fix.time, mps * MPS_TO_KMH));
                        }
                    }
                }
                previous = Some(fix);
            }
        }
    }

    if out.is_empty() {
        return Err(TelemetryError::NoSpeedData(
            "could not extract valid timestamp and speed data from GPX file".into(),
        ));
    }
    Trace::from_unordered(out)
}

/// 3D distance when both fixes carry an elevation, horizontal distance otherwise.
fn segment_distance(a: &GpxFix, b: &GpxFix) -> f64 {
    let flat = haversine_distance(a.lat, a.lon, b.lat, b.lon);
    match (a.ele, b.ele) {
        (Some(e0), Some(e1)) => (flat * flat + (e1 - e0).powi(2)).sqrt(),
        _ => flat,
    }
}

fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let r = 6_371_000.0_f64;
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(lat2 - lat1);
    let dlon = to_rad(lon2 - lon1);
    let a = (dlat / 2.0).sin().powi(2)
        + to_rad(lat1).cos() * to_rad(lat2).cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    r * c
}
