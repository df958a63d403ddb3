//! GoPro MP4 adapter.
//!
//! GoPro cameras store GPS fixes as GPMF (a KLV stream) in a dedicated `gpmd`
//! metadata track. The MP4 box tree is walked to find that track's samples,
//! then the GPS5 / GPS9 records inside each payload are decoded.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use tracing::debug;

use crate::{Result, TelemetryError, Trace, TraceSample};

const NO_GPS: &str = "No GPS5 stream found. GPS may have been off.";
const MPS_TO_KMH: f64 = 3.6;
const GPS5_SPEED_2D: usize = 3;
const GPS9_SPEED_2D: usize = 3;
const GPS9_DAYS: usize = 5;
const GPS9_SECONDS: usize = 6;

fn parse_err(msg: impl Into<String>) -> TelemetryError {
    TelemetryError::GoProParse(msg.into())
}

fn fourcc(kind: &[u8; 4]) -> String {
    String::from_utf8_lossy(kind).into_owned()
}

fn be_u16(data: &[u8], pos: usize) -> Result<u16> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| parse_err("unexpected end of data"))
}

fn be_u32(data: &[u8], pos: usize) -> Result<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| parse_err("unexpected end of data"))
}

fn be_u64(data: &[u8], pos: usize) -> Result<u64> {
    data.get(pos..pos + 8)
        .map(|b| u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .ok_or_else(|| parse_err("unexpected end of data"))
}

#[derive(Clone, Copy, Debug)]
struct Atom<'a> {
    kind: [u8; 4],
    body: &'a [u8],
}

fn atoms(data: &[u8]) -> Result<Vec<Atom<'_>>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 8 <= data.len() {
        let size32 = be_u32(data, pos)?;
        let kind = [data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]];
        let (header, size) = match size32 {
            0 => (8usize, (data.len() - pos) as u64),
            1 => (16usize, be_u64(data, pos + 8)?),
            n => (8usize, n as u64),
        };
        let end = (pos as u64)
            .checked_add(size)
            .filter(|&end| size >= header as u64 && end <= data.len() as u64)
            .ok_or_else(|| parse_err(format!("truncated '{}' box", fourcc(&kind))))?;
        out.push(Atom {
            kind,
            body: &data[pos + header..end as usize],
        });
        pos = end as usize;
    }
    Ok(out)
}

fn child<'a>(parent: &Atom<'a>, kind: &[u8; 4]) -> Result<Option<Atom<'a>>> {
    Ok(atoms(parent.body)?.into_iter().find(|a| &a.kind == kind))
}

fn require<'a>(parent: &Atom<'a>, kind: &[u8; 4]) -> Result<Atom<'a>> {
    child(parent, kind)?.ok_or_else(|| {
        parse_err(format!(
            "'{}' box missing inside '{}'",
            fourcc(kind),
            fourcc(&parent.kind)
        ))
    })
}

/// Location and duration of one `gpmd` sample.
#[derive(Clone, Copy, Debug, PartialEq)]
struct SampleRef {
    offset: u64,
    size: u32,
    duration_s: Option<f64>,
}

fn sample_entry_format(stsd: &Atom<'_>) -> Option<[u8; 4]> {
    let b = stsd.body.get(12..16)?;
    Some([b[0], b[1], b[2], b[3]])
}

fn media_timescale(mdhd: &Atom<'_>) -> Result<u32> {
    let version = *mdhd.body.first().ok_or_else(|| parse_err("empty mdhd box"))?;
    let pos = if version == 1 { 20 } else { 12 };
    be_u32(mdhd.body, pos)
}

/// Per-sample durations, expanded from the run table. Never yields more than
/// `samples` entries, whatever the runs claim.
fn read_stts(stts: &Atom<'_>, samples: usize) -> Result<Vec<u32>> {
    let count = be_u32(stts.body, 4)? as usize;
    let mut deltas = Vec::new();
    for i in 0..count {
        let run = be_u32(stts.body, 8 + 8 * i)? as usize;
        let delta = be_u32(stts.body, 12 + 8 * i)?;
        let take = run.min(samples - deltas.len());
        deltas.extend(std::iter::repeat(delta).take(take));
        if deltas.len() == samples {
            break;
        }
    }
    Ok(deltas)
}

/// Sample sizes. A fixed-size table must describe samples that fit inside a
/// file of `file_len` bytes.
fn read_stsz(stsz: &Atom<'_>, file_len: usize) -> Result<Vec<u32>> {
    let fixed = be_u32(stsz.body, 4)?;
    let count = be_u32(stsz.body, 8)? as usize;
    if fixed != 0 {
        if count > file_len / fixed as usize {
            return Err(parse_err(format!(
                "stsz claims {count} samples of {fixed} bytes in a {file_len} byte file"
            )));
        }
        return Ok(vec![fixed; count]);
    }
    (0..count).map(|i| be_u32(stsz.body, 12 + 4 * i)).collect()
}

fn read_stsc(stsc: &Atom<'_>) -> Result<Vec<(u32, u32)>> {
    let count = be_u32(stsc.body, 4)? as usize;
    (0..count)
        .map(|i| {
            let first_chunk = be_u32(stsc.body, 8 + 12 * i)?;
            let per_chunk = be_u32(stsc.body, 12 + 12 * i)?;
            Ok((first_chunk, per_chunk))
        })
        .collect()
}

fn read_chunk_offsets(stbl: &Atom<'_>) -> Result<Vec<u64>> {
    if let Some(stco) = child(stbl, b"stco")? {
        let count = be_u32(stco.body, 4)? as usize;
        return (0..count)
            .map(|i| be_u32(stco.body, 8 + 4 * i).map(u64::from))
            .collect();
    }
    if let Some(co64) = child(stbl, b"co64")? {
        let count = be_u32(co64.body, 4)? as usize;
        return (0..count).map(|i| be_u64(co64.body, 8 + 8 * i)).collect();
    }
    Err(parse_err("no chunk offset table in gpmd track"))
}

fn layout_samples(sizes: &[u32], chunk_offsets: &[u64], stsc: &[(u32, u32)]) -> Vec<(u64, u32)> {
    let mut out = Vec::with_capacity(sizes.len());
    let mut sample = 0usize;
    for (idx, &offset) in chunk_offsets.iter().enumerate() {
        let chunk_no = idx as u32 + 1;
        let per_chunk = stsc
            .iter()
            .rev()
            .find(|(first, _)| *first <= chunk_no)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        let mut pos = offset;
        for _ in 0..per_chunk {
            let Some(&size) = sizes.get(sample) else {
                return out;
            };
            out.push((pos, size));
            pos = pos.saturating_add(size as u64);
            sample += 1;
        }
    }
    out
}

/// Sample table of the first track whose sample entry is `gpmd`, or `None`.
fn find_gpmd_samples(file: &[u8]) -> Result<Option<Vec<SampleRef>>> {
    let top = atoms(file)?;
    let moov = top
        .iter()
        .find(|a| &a.kind == b"moov")
        .ok_or_else(|| parse_err("no 'moov' box; not an MP4 file"))?;

    for trak in atoms(moov.body)?.into_iter().filter(|a| &a.kind == b"trak") {
        let Some(mdia) = child(&trak, b"mdia")? else {
            continue;
        };
        let Some(minf) = child(&mdia, b"minf")? else {
            continue;
        };
        let Some(stbl) = child(&minf, b"stbl")? else {
            continue;
        };
        let stsd = require(&stbl, b"stsd")?;
        if sample_entry_format(&stsd) != Some(*b"gpmd") {
            continue;
        }

        let timescale = match child(&mdia, b"mdhd")? {
            Some(mdhd) => media_timescale(&mdhd)?,
            None => 0,
        };
        let sizes = read_stsz(&require(&stbl, b"stsz")?, file.len())?;
        let deltas = match child(&stbl, b"stts")? {
            Some(stts) => read_stts(&stts, sizes.len())?,
            None => Vec::new(),
        };
        let stsc = read_stsc(&require(&stbl, b"stsc")?)?;
        let offsets = read_chunk_offsets(&stbl)?;

        let samples = layout_samples(&sizes, &offsets, &stsc)
            .into_iter()
            .enumerate()
            .map(|(i, (offset, size))| SampleRef {
                offset,
                size,
                duration_s: match (deltas.get(i), timescale) {
                    (Some(&d), ts) if ts > 0 => Some(d as f64 / ts as f64),
                    _ => None,
                },
            })
            .collect();
        return Ok(Some(samples));
    }
    Ok(None)
}

#[derive(Clone, Copy, Debug)]
struct Klv<'a> {
    key: [u8; 4],
    kind: u8,
    struct_size: usize,
    repeat: usize,
    data: &'a [u8],
}

impl<'a> Klv<'a> {
    fn is_nested(&self) -> bool {
        self.kind == 0
    }

    fn children(&self) -> Result<Vec<Klv<'a>>> {
        parse_klvs(self.data)
    }

    fn numbers(&self) -> Vec<f64> {
        let width = element_width(self.kind);
        if width == 0 {
            return Vec::new();
        }
        self.data
            .chunks_exact(width)
            .filter_map(|chunk| decode_number(self.kind, chunk))
            .collect()
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(self.data)
            .trim_end_matches('\0')
            .trim()
            .to_string()
    }
}

fn parse_klvs(data: &[u8]) -> Result<Vec<Klv<'_>>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 8 <= data.len() {
        let key = [data[pos], data[pos + 1], data[pos + 2], data[pos + 3]];
        if key == [0; 4] {
            break;
        }
        let kind = data[pos + 4];
        let struct_size = data[pos + 5] as usize;
        let repeat = be_u16(data, pos + 6)? as usize;
        let len = struct_size * repeat;
        let start = pos + 8;
        let body = data
            .get(start..start + len)
            .ok_or_else(|| parse_err(format!("truncated GPMF entry '{}'", fourcc(&key))))?;
        out.push(Klv {
            key,
            kind,
            struct_size,
            repeat,
            data: body,
        });
        pos = start + ((len + 3) & !3);
    }
    Ok(out)
}

fn element_width(kind: u8) -> usize {
    match kind {
        b'b' | b'B' | b'c' => 1,
        b's' | b'S' => 2,
        b'l' | b'L' | b'f' | b'q' => 4,
        b'd' | b'j' | b'J' | b'Q' => 8,
        _ => 0,
    }
}

fn decode_number(kind: u8, b: &[u8]) -> Option<f64> {
    Some(match kind {
        b'b' => b[0] as i8 as f64,
        b'B' => b[0] as f64,
        b's' => i16::from_be_bytes([b[0], b[1]]) as f64,
        b'S' => u16::from_be_bytes([b[0], b[1]]) as f64,
        b'l' => i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64,
        b'L' => u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64,
        b'f' => f32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64,
        b'q' => u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64 / 65_536.0,
        b'd' => f64::from_be_bytes(b.try_into().ok()?),
        b'j' => i64::from_be_bytes(b.try_into().ok()?) as f64,
        b'J' => u64::from_be_bytes(b.try_into().ok()?) as f64,
        b'Q' => u64::from_be_bytes(b.try_into().ok()?) as f64 / 4_294_967_296.0,
        _ => return None,
    })
}

/// Decode one record of a complex (`?`) entry described by a TYPE string.
fn decode_complex(layout: &[u8], record: &[u8]) -> Vec<f64> {
    let mut out = Vec::with_capacity(layout.len());
    let mut pos = 0usize;
    for &kind in layout {
        let width = element_width(kind);
        let Some(chunk) = record.get(pos..pos + width) else {
            break;
        };
        out.push(decode_number(kind, chunk).unwrap_or(f64::NAN));
        pos += width;
    }
    out
}

/// Rows of raw values for a GPS entry, one row per fix.
fn records(entry: &Klv<'_>, type_layout: Option<&[u8]>) -> Vec<Vec<f64>> {
    if entry.struct_size == 0 {
        return Vec::new();
    }
    if entry.kind == b'?' {
        let Some(layout) = type_layout else {
            return Vec::new();
        };
        return entry
            .data
            .chunks_exact(entry.struct_size)
            .map(|record| decode_complex(layout, record))
            .collect();
    }
    let values = entry.numbers();
    let per_record = entry.struct_size / element_width(entry.kind).max(1);
    if per_record == 0 {
        return Vec::new();
    }
    values
        .chunks_exact(per_record)
        .take(entry.repeat)
        .map(|c| c.to_vec())
        .collect()
}

fn scale_at(scal: &[f64], idx: usize) -> f64 {
    let value = if scal.len() == 1 {
        scal[0]
    } else {
        scal.get(idx).copied().unwrap_or(1.0)
    };
    if value == 0.0 {
        1.0
    } else {
        value
    }
}

/// `GPSU` is `yymmddhhmmss.sss` in UTC.
fn parse_gpsu(text: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(&format!("20{text}"), "%Y%m%d%H%M%S%.f").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

fn gps9_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn seconds(value: f64) -> Duration {
    Duration::microseconds((value * 1_000_000.0).round() as i64)
}

/// `base` shifted by whole `days` plus `secs`, or `None` when the result
/// leaves chrono's representable range.
fn shift_time(base: DateTime<Utc>, days: f64, secs: f64) -> Option<DateTime<Utc>> {
    base.checked_add_signed(Duration::try_days(days as i64)?)?
        .checked_add_signed(seconds(secs))
}

/// Decode the GPS fixes of one GPMF payload. `duration_s` is the payload's
/// MP4 sample duration, used to space GPS5 fixes after the `GPSU` base time.
pub fn parse_gpmf_payload(payload: &[u8], duration_s: Option<f64>) -> Result<Vec<TraceSample>> {
    let mut out = Vec::new();
    let mut streams = Vec::new();
    collect_streams(&parse_klvs(payload)?, &mut streams)?;

    for stream in streams {
        let mut scal: Vec<f64> = vec![1.0];
        let mut gpsu: Option<DateTime<Utc>> = None;
        let mut layout: Option<Vec<u8>> = None;
        let mut fix_lost = false;
        for entry in &stream {
            match &entry.key {
                b"SCAL" => scal = entry.numbers(),
                b"GPSU" => gpsu = parse_gpsu(&entry.text()),
                b"TYPE" => layout = Some(entry.text().into_bytes()),
                b"GPSF" => fix_lost = entry.numbers().first() == Some(&0.0),
                _ => {}
            }
        }
        if fix_lost {
            debug!("GPMF payload without GPS lock skipped");
            continue;
        }

        for entry in &stream {
            match &entry.key {
                b"GPS5" => {
                    let Some(base) = gpsu else {
                        continue;
                    };
                    let rows = records(entry, None);
                    let step = duration_s.unwrap_or(1.0) / rows.len().max(1) as f64;
                    for (j, row) in rows.iter().enumerate() {
                        let Some(raw) = row.get(GPS5_SPEED_2D) else {
                            continue;
                        };
                        let mps = raw / scale_at(&scal, GPS5_SPEED_2D);
                        if !mps.is_finite() {
                            continue;
                        }
                        let ts = shift_time(base, 0.0, step * j as f64)
                            .ok_or_else(|| parse_err("GPS5 fix time out of range"))?;
                        out.push(TraceSample::new(ts, mps.max(0.0) * MPS_TO_KMH));
                    }
                }
                b"GPS9" => {
                    for row in records(entry, layout.as_deref()) {
                        if row.len() <= GPS9_SECONDS {
                            continue;
                        }
                        let mps = row[GPS9_SPEED_2D] / scale_at(&scal, GPS9_SPEED_2D);
                        let days = row[GPS9_DAYS] / scale_at(&scal, GPS9_DAYS);
                        let secs = row[GPS9_SECONDS] / scale_at(&scal, GPS9_SECONDS);
                        if !(mps.is_finite() && days.is_finite() && secs.is_finite()) {
                            continue;
                        }
                        let ts = shift_time(gps9_epoch(), days, secs).ok_or_else(|| {
                            parse_err(format!("GPS9 fix time out of range ({days} days, {secs} s)"))
                        })?;
                        out.push(TraceSample::new(ts, mps.max(0.0) * MPS_TO_KMH));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(out)
}

/// Gather the entries of every nested STRM that carries GPS data.
fn collect_streams<'a>(entries: &[Klv<'a>], out: &mut Vec<Vec<Klv<'a>>>) -> Result<()> {
    for entry in entries {
        if !entry.is_nested() {
            continue;
        }
        let children = entry.children()?;
        let has_gps = children
            .iter()
            .any(|c| &c.key == b"GPS5" || &c.key == b"GPS9");
        if has_gps {
            out.push(children);
        } else {
            collect_streams(&children, out)?;
        }
    }
    Ok(())
}

pub fn parse_gopro_trace(file: &[u8]) -> Result<Trace> {
    let samples = find_gpmd_samples(file)?
        .ok_or_else(|| TelemetryError::NoSpeedData("no GoPro telemetry (gpmd) track".into()))?;

    let mut out = Vec::new();
    for sample in &samples {
        let payload = usize::try_from(sample.offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(sample.size as usize)?))
            .and_then(|range| file.get(range))
            .ok_or_else(|| parse_err("gpmd sample points past end of file"))?;
        out.extend(parse_gpmf_payload(payload, sample.duration_s)?);
    }
    debug!("GoPro: {} GPS fixes from {} payloads", out.len(), samples.len());

    if out.is_empty() {
        return Err(TelemetryError::NoSpeedData(NO_GPS.into()));
    }
    Trace::from_unordered(out)
}
