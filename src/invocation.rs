//! Invocation payloads and the response envelope.

use std::process::ExitCode;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    config::DEFAULT_DOMAIN,
    error::{Error, Result},
};

/// Request for a date-range backfill.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackfillRequest {
    pub domain: Option<String>,
    #[serde(default)]
    pub scheduled: bool,
    /// `YYYY-MM-DD`, inclusive.
    pub start_date: Option<String>,
    /// `YYYY-MM-DD`, inclusive.
    pub end_date: Option<String>,
}

/// A validated backfill: one domain, an inclusive range of UTC days.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillPlan {
    pub domain: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| Error::InvalidInvocation(format!("{field} {value:?}: {e}")))
}

impl BackfillRequest {
    /// Scheduled runs cover the day before `today`; otherwise both dates are required.
    pub fn resolve(&self, today: NaiveDate) -> Result<BackfillPlan> {
        let domain = self
            .domain
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_owned());
        let (start, end) = if self.scheduled {
            let yesterday = today
                .checked_sub_days(Days::new(1))
                .ok_or_else(|| Error::InvalidInvocation(format!("no day before {today}")))?;
            (yesterday, yesterday)
        } else {
            match (&self.start_date, &self.end_date) {
                (Some(start), Some(end)) => (parse_date("start_date", start)?, parse_date("end_date", end)?),
                _ => {
                    return Err(Error::InvalidInvocation(
                        "start_date and end_date are required".to_owned(),
                    ))
                }
            }
        };
        if start > end {
            return Err(Error::InvalidInvocation(format!(
                "start_date {start} is after end_date {end}"
            )));
        }
        Ok(BackfillPlan { domain, start, end })
    }
}

pub const WINDOWS_PER_DAY: u32 = 12;

impl BackfillPlan {
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }

    /// Listing windows of one day: `HH:00:00` to `HH+1:59:59` for even `HH`.
    pub fn windows(day: NaiveDate) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        (0..WINDOWS_PER_DAY)
            .filter_map(|i| {
                let hour = i * 2;
                let start = NaiveTime::from_hms_opt(hour, 0, 0)?;
                let end = NaiveTime::from_hms_opt(hour + 1, 59, 59)?;
                Some((
                    Utc.from_utc_datetime(&day.and_time(start)),
                    Utc.from_utc_datetime(&day.and_time(end)),
                ))
            })
            .collect()
    }
}

/// One object named by a storage notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct NotificationRecord {
    s3: NotificationEntity,
}

#[derive(Debug, Deserialize)]
pub struct NotificationEntity {
    bucket: NamedBucket,
    object: NamedObject,
}

#[derive(Debug, Deserialize)]
pub struct NamedBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
pub struct NamedObject {
    key: String,
}

/// Either `{records: [{bucket, key}]}` or an S3-style `{Records: [...]}` notification.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StorageEvent {
    Simple {
        records: Vec<ObjectRef>,
    },
    Notification {
        #[serde(rename = "Records")]
        records: Vec<NotificationRecord>,
    },
}

impl StorageEvent {
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|_| Error::InvalidInvocation("expected a records list of {bucket, key}".to_owned()))
    }

    /// Objects named by the event, keys URL-decoded.
    pub fn objects(&self) -> Vec<ObjectRef> {
        let pairs: Vec<(&str, &str)> = match self {
            StorageEvent::Simple { records } => records
                .iter()
                .map(|r| (r.bucket.as_str(), r.key.as_str()))
                .collect(),
            StorageEvent::Notification { records } => records
                .iter()
                .map(|r| (r.s3.bucket.name.as_str(), r.s3.object.key.as_str()))
                .collect(),
        };
        pairs
            .into_iter()
            .map(|(bucket, key)| ObjectRef {
                bucket: bucket.to_owned(),
                key: percent_decode_str(key).decode_utf8_lossy().into_owned(),
            })
            .collect()
    }
}

/// What one invocation did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Keys of every object written.
    pub uploaded_files: Vec<String>,
    /// Log files discovered.
    pub total_found: usize,
    /// Log files converted without error.
    pub converted: usize,
}

impl Summary {
    pub fn message(&self) -> String {
        format!(
            "Converted {} of {} files into {} objects",
            self.converted,
            self.total_found,
            self.uploaded_files.len()
        )
    }
}

/// Response envelope printed by the binaries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: serde_json::Value,
}

impl Response {
    pub fn from_result(result: &Result<Summary, anyhow::Error>) -> Self {
        match result {
            Ok(summary) => Response {
                status_code: 200,
                body: json!({
                    "message": summary.message(),
                    "uploaded_files": summary.uploaded_files,
                    "total_found": summary.total_found,
                    "converted": summary.converted,
                }),
            },
            Err(e) => Response {
                status_code: 500,
                body: json!({ "error": format!("{e:#}") }),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }

    /// Print as JSON on stdout. The exit code follows the status.
    pub fn emit(&self) -> ExitCode {
        match serde_json::to_string_pretty(self) {
            Ok(text) => println!("{text}"),
            Err(e) => tracing::error!("could not render response: {e}"),
        }
        if self.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}
