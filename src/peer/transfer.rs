//! Transfer framing and segment-size adaptation.
//!
//! Covers the `ADCGET`/`ADCSND` exchange and the chunk-size feedback loop
//! that keeps segment durations near `SEGMENT_TIME`.

use super::error::Error;

/// `ADCGET <type> <adc-path> <start> <bytes> [ZL1] [RE1]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdcGet {
    pub kind: String,
    pub path: String,
    pub start: u64,
    pub bytes: i64,
    pub zlib: bool,
    pub recursive_list: bool,
}

pub fn build_adc_get(kind: &str, path: &str, start: u64, bytes: i64, zlib: bool) -> String {
    if zlib {
        format!("ADCGET {} {} {} {} ZL1", kind, path, start, bytes)
    } else {
        format!("ADCGET {} {} {} {}", kind, path, start, bytes)
    }
}

pub fn parse_adc_get(line: &str) -> Result<AdcGet, Error> {
    let mut parts = line.split(' ');
    let header = parts.next().ok_or_else(|| Error::Malformed(line.to_string()))?;
    if header != "ADCGET" {
        return Err(Error::Malformed(line.to_string()));
    }
    let kind = parts
        .next()
        .ok_or_else(|| Error::Malformed(line.to_string()))?
        .to_string();
    if !matches!(kind.as_str(), "file" | "tthl" | "list") {
        return Err(Error::UnsupportedType(kind));
    }
    let path = parts
        .next()
        .ok_or_else(|| Error::Malformed(line.to_string()))?
        .to_string();
    let start: u64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Malformed(line.to_string()))?;
    let bytes: i64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Malformed(line.to_string()))?;
    let mut zlib = false;
    let mut recursive_list = false;
    for flag in parts {
        match flag {
            "ZL1" => zlib = true,
            "RE1" => recursive_list = true,
            _ => {}
        }
    }
    Ok(AdcGet {
        kind,
        path,
        start,
        bytes,
        zlib,
        recursive_list,
    })
}

/// `ADCSND <type> <adc-path> <start> <bytes> [ZL1]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdcSnd {
    pub kind: String,
    pub path: String,
    pub start: u64,
    pub bytes: u64,
    pub zlib: bool,
}

pub fn build_adc_snd(kind: &str, path: &str, start: u64, bytes: u64, zlib: bool) -> String {
    if zlib {
        format!("ADCSND {} {} {} {} ZL1", kind, path, start, bytes)
    } else {
        format!("ADCSND {} {} {} {}", kind, path, start, bytes)
    }
}

/// Validates a received `ADCSND` header against the byte count we
/// requested "oversized response to `GET`".
pub fn validate_response_size(requested: u64, snd: &AdcSnd) -> Result<(), Error> {
    if snd.bytes > requested {
        Err(Error::OversizedResponse {
            requested,
            got: snd.bytes,
        })
    } else {
        Ok(())
    }
}

/// Legacy dialect-B `$Get <file>$<offset+1>|`.
pub fn build_legacy_get(file: &str, offset: u64) -> String {
    format!("$Get {}${}", file, offset + 1)
}

pub fn parse_legacy_get(raw: &str) -> Option<(String, u64)> {
    let rest = raw.strip_prefix("$Get ")?;
    let (file, offset_plus_one) = rest.rsplit_once('$')?;
    let offset: u64 = offset_plus_one.parse().ok()?;
    Some((file.to_string(), offset.saturating_sub(1)))
}

pub fn build_legacy_send() -> String {
    "$Send".to_string()
}

/// `SEGMENT_TIME`, the target duration of one chunk.
pub const SEGMENT_TIME_MS: u64 = 120_000;
pub const MIN_CHUNK_LEN: u64 = 64 * 1024;
pub const MAX_INITIAL_CHUNK_LEN: u64 = 1024 * 1024;

/// Picks the size of the first chunk of a new segment: `max(64 KiB,
/// min(lastChunk, 1 MiB))`.
pub fn initial_chunk_len(last_chunk: u64) -> u64 {
    MIN_CHUNK_LEN.max(last_chunk.min(MAX_INITIAL_CHUNK_LEN))
}

/// Adjusts the chunk size for the next segment given how long the last one
/// took and the measured throughput.
///
/// `ticks` is the elapsed wall time for the last chunk; `speed` is bytes per
/// second. `leaf_size` is the TTH leaf size added/subtracted at the
/// boundary bands.
pub fn adjust_chunk_len(chunk: u64, ticks_ms: u64, speed_bytes_per_sec: u64, leaf_size: u64) -> u64 {
    if ticks_ms <= 10 {
        return (chunk * 2).max(MIN_CHUNK_LEN);
    }

    let msecs = if speed_bytes_per_sec == 0 {
        u64::MAX
    } else {
        1000 * chunk / speed_bytes_per_sec
    };

    let quarter = SEGMENT_TIME_MS / 4;
    let eighty_percent = (SEGMENT_TIME_MS as f64 / 1.25) as u64;
    let low_band = (SEGMENT_TIME_MS as f64 * 0.75) as u64;
    let high_band = (SEGMENT_TIME_MS as f64 * 1.25) as u64;
    let quadruple = SEGMENT_TIME_MS * 4;

    let next = if msecs < quarter {
        chunk * 2
    } else if msecs < eighty_percent {
        chunk + leaf_size
    } else if msecs >= low_band && msecs <= high_band {
        chunk
    } else if msecs < quadruple {
        chunk.saturating_sub(leaf_size)
    } else {
        chunk / 2
    };

    next.max(MIN_CHUNK_LEN)
}
