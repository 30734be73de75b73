//! CSV history import
//!
//! One record per line, `day,steps`, where `day` is either a Unix timestamp
//! in milliseconds or a `YYYY-MM-DD` date. Bad lines are rejected one by one
//! and reported; they never abort the batch.

use crate::calendar::DayResolver;
use crate::types::{CalendarDay, DailyStepRecord};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A rejected import line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportError {
    /// 1-based line number
    pub line: usize,
    pub reason: String,
}

/// Aggregate outcome of an import
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Non-blank, non-comment lines seen
    pub total: usize,
    pub imported: usize,
    pub failed: usize,
    /// Valid records left unapplied because the live total was larger
    #[serde(default)]
    pub skipped: usize,
    pub errors: Vec<ImportError>,
    /// Today's record when it replaced the live total
    pub today_override: Option<DailyStepRecord>,
}

impl ImportReport {
    pub(crate) fn reject(&mut self, line: usize, reason: impl Into<String>) {
        self.failed += 1;
        self.errors.push(ImportError {
            line,
            reason: reason.into(),
        });
    }
}

/// Parsed lines, before anything is written
#[derive(Debug, Clone, Default)]
pub struct ParsedImport {
    /// Valid records with their line numbers, in file order
    pub records: Vec<(usize, DailyStepRecord)>,
    pub report: ImportReport,
}

pub fn parse_csv(text: &str, resolver: &dyn DayResolver) -> ParsedImport {
    let mut parsed = ParsedImport::default();

    for (index, raw) in text.lines().enumerate() {
        let line_num = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if parsed.report.total == 0 && is_header(line) {
            continue;
        }

        parsed.report.total += 1;
        match parse_line(line, resolver) {
            Ok(record) => parsed.records.push((line_num, record)),
            Err(reason) => {
                tracing::debug!(line = line_num, reason = %reason, "rejecting import line");
                parsed.report.reject(line_num, reason);
            }
        }
    }

    parsed
}

fn is_header(line: &str) -> bool {
    line.to_ascii_lowercase().contains("steps")
        && line.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
}

fn parse_line(line: &str, resolver: &dyn DayResolver) -> Result<DailyStepRecord, String> {
    let mut fields = line.split(',').map(str::trim);
    let (Some(day_field), Some(steps_field), None) = (fields.next(), fields.next(), fields.next())
    else {
        return Err("expected two comma-separated fields".to_string());
    };

    let day = parse_day(day_field, resolver)?;
    let steps: i64 = steps_field
        .parse()
        .map_err(|_| format!("steps is not an integer: {steps_field:?}"))?;
    let steps = u32::try_from(steps).map_err(|_| format!("steps out of range: {steps}"))?;

    Ok(DailyStepRecord::new(day, steps))
}

fn parse_day(field: &str, resolver: &dyn DayResolver) -> Result<CalendarDay, String> {
    if field.contains('-') && !field.starts_with('-') {
        return field.parse::<CalendarDay>().map_err(|e| e.to_string());
    }
    let millis: i64 = field
        .parse()
        .map_err(|_| format!("unrecognised day: {field:?}"))?;
    if millis < 0 {
        return Err(format!("timestamp before 1970: {millis}"));
    }
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|instant| resolver.day_of(instant))
        .ok_or_else(|| format!("timestamp out of range: {millis}"))
}
