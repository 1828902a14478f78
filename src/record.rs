/* [10/Oct/2025:16:04:18 +0800] 203.0.113.7 - 1532 "https://referrer.example/" "GET https://cdn.example/live/seg_0042.ts"
 *   200 191 1400823 HIT "Mozilla/5.0 (...)" "video/mp2t" 198.51.100.20
 *
 * [date time] client_ip proxy_ip response_time "referrer" "method url" status
 *   request_bytes response_bytes cache_status "user_agent" "content_type" access_ip
 */

use std::{fmt, sync::OnceLock};

use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TEXT: &str = "-";
pub const DEFAULT_TIMEZONE: &str = "+0000";
pub const DEFAULT_METHOD: &str = "GET";
pub const DEFAULT_URL: &str = "/";
pub const DEFAULT_STATUS: i32 = 200;

/// One normalized access-log line.
///
/// Every field has a default, so construction never fails once a line has
/// been recognized. The partition columns come from `date_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub date_time: String,
    pub timezone: String,
    pub client_ip: String,
    pub proxy_ip: String,
    pub response_time: i64,
    pub referrer: String,
    pub http_method: String,
    pub request_url: String,
    pub http_status: i32,
    pub request_bytes: i64,
    pub response_bytes: i64,
    pub cache_status: String,
    pub user_agent: String,
    pub file_type: String,
    pub access_ip: String,
    pub year: String,
    pub month: String,
    pub day: String,
}

impl ParsedRecord {
    /// A record with every field at its default, stamped with `date_time`
    /// and the partition derived from it.
    pub fn with_timestamp(date_time: &str, timezone: Option<&str>) -> Self {
        let partition = derive_partition(date_time);
        ParsedRecord {
            date_time: date_time.to_owned(),
            timezone: text_or(timezone.unwrap_or(""), DEFAULT_TIMEZONE),
            client_ip: DEFAULT_TEXT.to_owned(),
            proxy_ip: DEFAULT_TEXT.to_owned(),
            response_time: 0,
            referrer: DEFAULT_TEXT.to_owned(),
            http_method: DEFAULT_METHOD.to_owned(),
            request_url: DEFAULT_URL.to_owned(),
            http_status: DEFAULT_STATUS,
            request_bytes: 0,
            response_bytes: 0,
            cache_status: DEFAULT_TEXT.to_owned(),
            user_agent: DEFAULT_TEXT.to_owned(),
            file_type: DEFAULT_TEXT.to_owned(),
            access_ip: DEFAULT_TEXT.to_owned(),
            year: partition.year,
            month: partition.month,
            day: partition.day,
        }
    }

    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(&self.year, &self.month, &self.day)
    }
}

/// Strip surrounding quote characters; empty text becomes `default`.
pub fn text_or(value: &str, default: &str) -> String {
    let value = value.trim_matches(|c| c == '"' || c == '\'');
    if value.is_empty() {
        default.to_owned()
    } else {
        value.to_owned()
    }
}

/// Parse-or-default: only plain ASCII digits are accepted.
pub fn number_or<T: std::str::FromStr>(value: &str, default: T) -> T {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return default;
    }
    value.parse().unwrap_or(default)
}

/// Extension of the requested object, as the text after the last `.`
/// cut at any query or fragment.
pub fn file_type(request_url: &str) -> String {
    if request_url.is_empty() || request_url == "/" {
        return DEFAULT_TEXT.to_owned();
    }
    match request_url.rsplit_once('.') {
        Some((_, ext)) => {
            let ext = ext.split(['?', '#']).next().unwrap_or_default();
            text_or(ext, DEFAULT_TEXT)
        }
        None => DEFAULT_TEXT.to_owned(),
    }
}

/// `(year, month, day)`, zero-padded. Used for output paths and catalog partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub year: String,
    pub month: String,
    pub day: String,
}

static OBJECT_KEY_PARTITION: OnceLock<Regex> = OnceLock::new();
static FILE_NAME_DATE: OnceLock<Regex> = OnceLock::new();
static ISO_PREFIX: OnceLock<Regex> = OnceLock::new();
static US_PREFIX: OnceLock<Regex> = OnceLock::new();

impl PartitionKey {
    pub fn new(year: &str, month: &str, day: &str) -> Self {
        PartitionKey {
            year: year.to_owned(),
            month: month.to_owned(),
            day: day.to_owned(),
        }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        PartitionKey {
            year: date.year().to_string(),
            month: format!("{:02}", date.month()),
            day: format!("{:02}", date.day()),
        }
    }

    pub fn today() -> Self {
        Self::from_date(Utc::now().date_naive())
    }

    /// Find a `year=YYYY/month=MM/day=DD` segment in an object key.
    pub fn from_object_key(key: &str) -> Option<Self> {
        let re = OBJECT_KEY_PARTITION
            .get_or_init(|| Regex::new(r"year=(\d{4})/month=(\d{2})/day=(\d{2})").unwrap());
        let caps = re.captures(key)?;
        Some(Self::new(&caps[1], &caps[2], &caps[3]))
    }

    /// CDN log files are named like `domain_2025_10_13_160000_180000.gz`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let re = FILE_NAME_DATE.get_or_init(|| Regex::new(r"(\d{4})_(\d{2})_(\d{2})_").unwrap());
        let caps = re.captures(name)?;
        Some(Self::new(&caps[1], &caps[2], &caps[3]))
    }

    /// Hive-style path segment, without leading or trailing slash.
    pub fn path_segment(&self) -> String {
        format!("year={}/month={}/day={}", self.year, self.month, self.day)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path_segment())
    }
}

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%d/%b/%Y:%H:%M:%S", // 10/Oct/2025:16:04:18
    "%d/%m/%Y:%H:%M:%S", // 10/10/2025:16:04:18
    "%Y-%m-%d %H:%M:%S", // 2025-10-10 16:04:18
    "%m/%d/%Y %H:%M:%S", // 10/13/2025 16:04:18
];

/// Partition for a source timestamp. Falls back to today's date when
/// nothing recognizable is found.
pub fn derive_partition(date_time: &str) -> PartitionKey {
    derive_partition_or(date_time, Utc::now().date_naive())
}

pub fn derive_partition_or(date_time: &str, today: NaiveDate) -> PartitionKey {
    for format in TIMESTAMP_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(date_time, format) {
            return PartitionKey::from_date(parsed.date());
        }
    }

    let iso = ISO_PREFIX.get_or_init(|| Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})").unwrap());
    if let Some(caps) = iso.captures(date_time) {
        return PartitionKey::new(&caps[1], &pad2(&caps[2]), &pad2(&caps[3]));
    }
    let us = US_PREFIX.get_or_init(|| Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{4})").unwrap());
    if let Some(caps) = us.captures(date_time) {
        return PartitionKey::new(&caps[3], &pad2(&caps[1]), &pad2(&caps[2]));
    }

    tracing::debug!("no date in timestamp {date_time:?}, using processing date");
    PartitionKey::from_date(today)
}

fn pad2(digits: &str) -> String {
    format!("{digits:0>2}")
}
