//! The computation that runs inside the worker process.
//!
//! The work itself is a placeholder: it sums the series `1/0! + 1/1! + 1/2! + ...` for Euler's
//! number until the requested time has passed. What matters is that it takes a while, produces a
//! small structured [`ResultRecord`], and ends either by completing or by crashing.

use std::{
    hint::black_box,
    time::{Duration, Instant},
};

use crate::{channel::ChannelHandle, error::SerializationError, record::ResultRecord};

/// Exit status of a worker process whose result could not be written.
pub const WRITE_FAILURE_EXIT_CODE: i32 = 2;

/// Parameters of a single worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// The loop runs until at least this much time has passed.
    pub requested_duration: Duration,
    /// Crash with an arithmetic fault before doing any work.
    pub force_error: bool,
}

impl WorkerConfig {
    /// Creates a config for a normal run of `requested_duration`.
    #[inline]
    pub fn new(requested_duration: Duration) -> Self {
        Self {
            requested_duration,
            force_error: false,
        }
    }

    /// Makes the worker crash instead of producing a result.
    #[inline]
    pub fn force_error(self, force_error: bool) -> Self {
        Self {
            force_error,
            ..self
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

/// Runs the computation and returns its result.
///
/// At least one iteration is always performed, and the reported duration is never shorter than
/// the requested one.
///
/// # Panics
///
/// Panics with a division by zero if [`WorkerConfig::force_error`] is set.
pub fn compute(config: &WorkerConfig) -> ResultRecord {
    let start = Instant::now();
    let mut record = ResultRecord::new();

    if config.force_error {
        log::warn!("worker run {} is failing on purpose", record.uuid);
        divide_by_zero();
    }

    let mut k = 1.0f64;
    loop {
        record.e_value += 1.0 / k;
        record.iterations += 1;
        k *= record.iterations as f64;
        record.duration = start.elapsed();
        if record.duration >= config.requested_duration {
            break;
        }
    }
    record
}

/// Runs the computation and writes its result through `handle`.
///
/// This is what a worker process does. The [`ChannelHandle`] is the only connection to the
/// launching side, so the result is written exactly once, right before returning.
pub fn run(config: &WorkerConfig, handle: &ChannelHandle) -> Result<ResultRecord, SerializationError> {
    let start = Instant::now();
    log::debug!("worker entering run ({config:?}, channel '{handle}')");

    let record = compute(config);
    handle.write(&record)?;

    log::debug!("worker exiting run");
    log::info!(
        "worker run {} took {:?} ({} iterations)",
        record.uuid,
        start.elapsed(),
        record.iterations
    );
    Ok(record)
}

/// Formats a duration as `<seconds>.<nanoseconds>` for a worker command line.
///
/// Unlike a float, this is exact for every [`Duration`], including [`Duration::MAX`].
pub fn format_duration(duration: Duration) -> String {
    format!("{}.{:09}", duration.as_secs(), duration.subsec_nanos())
}

/// Parses a duration in seconds, as produced by [`format_duration`].
///
/// Plain decimal numbers (`3`, `0.25`, `18446744073709551615.999999999`) are read exactly, up to
/// nanosecond precision. Anything else is accepted if it parses as a float that fits in a
/// [`Duration`]. Negative, non-finite and out-of-range values are rejected with an error, never a
/// panic.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(duration) = parse_decimal(s) {
        return Ok(duration);
    }
    let secs: f64 = s
        .parse()
        .map_err(|e| format!("'{s}' is not a number of seconds: {e}"))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| format!("'{s}' is not a valid number of seconds: {e}"))
}

fn parse_decimal(s: &str) -> Option<Duration> {
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if whole.is_empty() || !all_digits(whole) || !all_digits(frac) || frac.len() > 9 {
        return None;
    }
    let secs = whole.parse::<u64>().ok()?;
    let nanos = if frac.is_empty() {
        0
    } else {
        frac.parse::<u32>().ok()? * 10u32.pow(9 - frac.len() as u32)
    };
    Some(Duration::new(secs, nanos))
}

fn divide_by_zero() -> u64 {
    let zero = black_box(0u64);
    1 / zero
}
