//! Tabular sinks for enriched series.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use rust_xlsxwriter::{Format, Workbook, XlsxError};

use crate::engine::{EnrichedSample, EnrichedSeries};
use crate::{Result, TelemetryError};

/// Column names, in order. Downstream overlay tools key on these exact strings.
pub const COLUMNS: [&str; 5] = [
    "date",
    "Speed (km/h)",
    "Engine RPM (rpm)",
    "Fuel Rate (L/h)",
    "Fuel Used (L)",
];

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
const SHEET_NAME: &str = "Telemetry";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Xlsx,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("csv") => Ok(OutputFormat::Csv),
            Some("xlsx") => Ok(OutputFormat::Xlsx),
            _ => Err(TelemetryError::OutputWrite(format!(
                "unsupported output extension for {} (expected .csv or .xlsx)",
                path.display()
            ))),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Xlsx => "xlsx",
        }
    }
}

pub fn format_timestamp(sample: &EnrichedSample) -> String {
    sample.timestamp.format(DATE_FORMAT).to_string()
}

/// Write `series` to `path`, choosing the sink from the file extension.
/// The series is borrowed, so a failed write can be retried elsewhere.
pub fn write_series(series: &EnrichedSeries, path: &Path) -> Result<OutputFormat> {
    let format = OutputFormat::from_path(path)?;
    match format {
        OutputFormat::Csv => {
            let file = File::create(path).map_err(|e| {
                TelemetryError::OutputWrite(format!("failed to create {}: {}", path.display(), e))
            })?;
            write_csv(series, file)?;
        }
        OutputFormat::Xlsx => write_xlsx(series, path)
            .map_err(|e| TelemetryError::OutputWrite(format!("{}: {}", path.display(), e)))?,
    }
    Ok(format)
}

pub fn write_series_stdout(series: &EnrichedSeries) -> Result<()> {
    let stdout = io::stdout();
    let handle = stdout.lock();
    write_csv(series, handle)
}

pub fn write_csv<W: Write>(series: &EnrichedSeries, sink: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(sink);
    write_csv_rows(series, &mut writer).map_err(|e| TelemetryError::OutputWrite(e.to_string()))
}

fn write_csv_rows<W: Write>(
    series: &EnrichedSeries,
    writer: &mut csv::Writer<W>,
) -> std::result::Result<(), csv::Error> {
    writer.write_record(COLUMNS)?;
    for sample in &series.samples {
        writer.write_record([
            format_timestamp(sample),
            sample.speed_kmh.to_string(),
            sample.rpm.to_string(),
            sample.fuel_rate_lph.to_string(),
            sample.cumulative_fuel_l.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_xlsx(series: &EnrichedSeries, path: &Path) -> std::result::Result<(), XlsxError> {
    let mut workbook = Workbook::new();
    let header = Format::new().set_bold();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(SHEET_NAME)?;

    for (col, name) in COLUMNS.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, *name, &header)?;
    }
    worksheet.set_column_width(0, 26)?;

    for (idx, sample) in series.samples.iter().enumerate() {
        let row = idx as u32 + 1;
        worksheet.write_string(row, 0, format_timestamp(sample))?;
        worksheet.write_number(row, 1, sample.speed_kmh)?;
        worksheet.write_number(row, 2, sample.rpm as f64)?;
        worksheet.write_number(row, 3, sample.fuel_rate_lph)?;
        worksheet.write_number(row, 4, sample.cumulative_fuel_l)?;
    }

    workbook.save(path)?;
    Ok(())
}
