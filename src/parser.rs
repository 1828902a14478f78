//! Line parsing for CDN access logs.
//!
//! The canonical fifteen-field format is matched with one regex. Lines from
//! CDNs that emit common/combined-log shapes go through a looser scanner
//! that only needs a bracketed timestamp and a quoted request.

use std::sync::OnceLock;

use regex_lite::{Captures, Regex};

use crate::record::{
    file_type, number_or, text_or, ParsedRecord, DEFAULT_METHOD, DEFAULT_STATUS, DEFAULT_TEXT,
    DEFAULT_URL,
};

static CANONICAL: OnceLock<Regex> = OnceLock::new();

fn canonical() -> &'static Regex {
    CANONICAL.get_or_init(|| {
        Regex::new(concat!(
            r#"^\[(\S+)\s+([^\]]+)\]\s+(\S+)\s+(\S+)\s+(\S+)\s+"([^"]*)"\s+"(\S+)\s+([^"]*)"\s+"#,
            r#"(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+"([^"]*)"\s+"([^"]*)"\s+(\S+)"#,
        ))
        .unwrap()
    })
}

/// Which strategy recognized a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Canonical,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Empty,
    NoTimestamp,
    /// A timestamp was found but no `"METHOD URL"` request token.
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Parsed(ParsedRecord, Strategy),
    Skipped(SkipReason),
}

/// Recognize one raw line.
pub fn classify(line: &str) -> ParseOutcome {
    let line = line.trim();
    if line.is_empty() {
        return ParseOutcome::Skipped(SkipReason::Empty);
    }
    if let Some(caps) = canonical().captures(line) {
        return ParseOutcome::Parsed(from_canonical(&caps), Strategy::Canonical);
    }
    match fallback(line) {
        Ok(record) => ParseOutcome::Parsed(record, Strategy::Fallback),
        Err(reason) => ParseOutcome::Skipped(reason),
    }
}

/// Parse one line, dropping anything neither strategy recognizes.
pub fn parse_line(line: &str) -> Option<ParsedRecord> {
    match classify(line) {
        ParseOutcome::Parsed(record, _) => Some(record),
        ParseOutcome::Skipped(_) => None,
    }
}

fn from_canonical(caps: &Captures<'_>) -> ParsedRecord {
    let group = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();

    let mut record = ParsedRecord::with_timestamp(group(1), Some(group(2)));
    record.client_ip = text_or(group(3), DEFAULT_TEXT);
    record.proxy_ip = text_or(group(4), DEFAULT_TEXT);
    record.response_time = number_or(group(5), 0);
    record.referrer = text_or(group(6), DEFAULT_TEXT);
    record.http_method = text_or(group(7), DEFAULT_METHOD);
    record.request_url = text_or(group(8), DEFAULT_URL);
    record.http_status = number_or(group(9), DEFAULT_STATUS);
    record.request_bytes = number_or(group(10), 0);
    record.response_bytes = number_or(group(11), 0);
    record.cache_status = text_or(group(12), DEFAULT_TEXT);
    record.user_agent = text_or(group(13), DEFAULT_TEXT);
    // Group 14 is the response content type; it is not kept.
    record.access_ip = text_or(group(15), DEFAULT_TEXT);
    record.file_type = file_type(&record.request_url);
    record
}

/// `ip - - [10/Oct/2025:16:04:18 +0000] "GET /a.ts HTTP/1.1" 200 512 "ref" "ua"`
///
/// Also takes CDN-shaped lines whose request is preceded by a quoted referrer:
/// `[ts] ip - 5 "ref" "GET /a.ts" 200 1 2 HIT "ua" ...`
fn fallback(line: &str) -> Result<ParsedRecord, SkipReason> {
    let Some(open) = line.find('[') else {
        return Err(SkipReason::NoTimestamp);
    };
    let Some(close) = line[open..].find(']').map(|i| open + i) else {
        return Err(SkipReason::NoTimestamp);
    };
    let stamp = line[open + 1..close].trim();
    if stamp.is_empty() {
        return Err(SkipReason::NoTimestamp);
    }
    let (date_time, timezone) = match stamp.split_once(char::is_whitespace) {
        Some((date_time, timezone)) => (date_time, Some(timezone.trim())),
        None => (stamp, None),
    };

    let after_stamp = &line[close + 1..];
    let mut rest = after_stamp;
    let mut preceding = None;
    let (method, url, after_request) = loop {
        let Some((quoted, after)) = next_quoted(rest) else {
            return Err(SkipReason::Unrecognized);
        };
        let mut parts = quoted.split_whitespace();
        if let Some(method) = parts.next() {
            if method.bytes().all(|b| b.is_ascii_alphabetic()) {
                break (method, parts.next(), after);
            }
        }
        preceding = Some(quoted);
        rest = after;
    };

    let mut record = ParsedRecord::with_timestamp(date_time, timezone);
    let client_ip = match line[..open].split_whitespace().next() {
        Some(ip) => Some(ip),
        None => after_stamp
            .split_whitespace()
            .next()
            .filter(|token| !token.starts_with('"')),
    };
    if let Some(client_ip) = client_ip {
        record.client_ip = text_or(client_ip, DEFAULT_TEXT);
    }
    record.http_method = method.to_owned();
    record.request_url = text_or(url.unwrap_or_default(), DEFAULT_URL);
    record.file_type = file_type(&record.request_url);

    let (numbers, after_numbers) = match after_request.find('"') {
        Some(quote) => (&after_request[..quote], &after_request[quote..]),
        None => (after_request, ""),
    };
    let mut numbers = numbers.split_whitespace();
    record.http_status = numbers
        .next()
        .map_or(DEFAULT_STATUS, |s| number_or(s, DEFAULT_STATUS));

    match preceding {
        // CDN order: status, request bytes, response bytes, cache status, "ua".
        Some(referrer) => {
            record.referrer = text_or(referrer, DEFAULT_TEXT);
            record.request_bytes = numbers.next().map_or(0, |s| number_or(s, 0));
            record.response_bytes = numbers.next().map_or(0, |s| number_or(s, 0));
            if let Some(cache_status) = numbers.next() {
                record.cache_status = text_or(cache_status, DEFAULT_TEXT);
            }
            if let Some((user_agent, _)) = next_quoted(after_numbers) {
                record.user_agent = text_or(user_agent, DEFAULT_TEXT);
            }
        }
        // Combined order: status, bytes, "referrer", "ua".
        None => {
            record.response_bytes = numbers.next().map_or(0, |s| number_or(s, 0));
            if let Some((referrer, after)) = next_quoted(after_numbers) {
                record.referrer = text_or(referrer, DEFAULT_TEXT);
                if let Some((user_agent, _)) = next_quoted(after) {
                    record.user_agent = text_or(user_agent, DEFAULT_TEXT);
                }
            }
        }
    }
    Ok(record)
}

/// Contents of the next `"..."` in `s`, and the text after its closing quote.
fn next_quoted(s: &str) -> Option<(&str, &str)> {
    let start = s.find('"')? + 1;
    let len = s[start..].find('"')?;
    Some((&s[start..start + len], &s[start + len + 1..]))
}

/// Running counts of what a [`LineParser`] has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub canonical: u64,
    pub fallback: u64,
    pub empty: u64,
    pub no_timestamp: u64,
    pub unrecognized: u64,
}

impl ParseStats {
    pub fn parsed(&self) -> u64 {
        self.canonical + self.fallback
    }

    pub fn skipped(&self) -> u64 {
        self.no_timestamp + self.unrecognized
    }

    pub fn lines(&self) -> u64 {
        self.parsed() + self.skipped() + self.empty
    }
}

/// Counting wrapper around [`classify`].
#[derive(Debug, Default)]
pub struct LineParser {
    stats: ParseStats,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, line: &str) -> Option<ParsedRecord> {
        match classify(line) {
            ParseOutcome::Parsed(record, Strategy::Canonical) => {
                self.stats.canonical += 1;
                Some(record)
            }
            ParseOutcome::Parsed(record, Strategy::Fallback) => {
                self.stats.fallback += 1;
                Some(record)
            }
            ParseOutcome::Skipped(reason) => {
                match reason {
                    SkipReason::Empty => self.stats.empty += 1,
                    SkipReason::NoTimestamp => self.stats.no_timestamp += 1,
                    SkipReason::Unrecognized => self.stats.unrecognized += 1,
                }
                None
            }
        }
    }

    pub fn stats(&self) -> ParseStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL_LINE: &str = r#"[10/Oct/2025:16:04:18 +0800] 203.0.113.7 - 1532 "https://ref.example/page" "GET https://cdn.example/live/seg_0042.ts?auth=1" 206 191 1400823 HIT "Mozilla/5.0 (X11; Linux x86_64)" "video/mp2t" 198.51.100.20"#;

    #[test]
    fn canonical_positional_mapping() {
        let (record, strategy) = match classify(CANONICAL_LINE) {
            ParseOutcome::Parsed(record, strategy) => (record, strategy),
            other => panic!("not parsed: {other:?}"),
        };
        assert_eq!(strategy, Strategy::Canonical);
        assert_eq!(record.date_time, "10/Oct/2025:16:04:18");
        assert_eq!(record.timezone, "+0800");
        assert_eq!(record.client_ip, "203.0.113.7");
        assert_eq!(record.proxy_ip, "-");
        assert_eq!(record.response_time, 1532);
        assert_eq!(record.referrer, "https://ref.example/page");
        assert_eq!(record.http_method, "GET");
        assert_eq!(record.request_url, "https://cdn.example/live/seg_0042.ts?auth=1");
        assert_eq!(record.http_status, 206);
        assert_eq!(record.request_bytes, 191);
        assert_eq!(record.response_bytes, 1400823);
        assert_eq!(record.cache_status, "HIT");
        assert_eq!(record.user_agent, "Mozilla/5.0 (X11; Linux x86_64)");
        assert_eq!(record.file_type, "ts");
        assert_eq!(record.access_ip, "198.51.100.20");
        assert_eq!(
            (record.year.as_str(), record.month.as_str(), record.day.as_str()),
            ("2025", "10", "10")
        );
    }

    #[test]
    fn canonical_numeric_garbage_defaults() {
        let line = r#"[10/Oct/2025:16:04:18 +0800] 203.0.113.7 - n/a "-" "HEAD /x" OK - 12kb MISS "" "-" 198.51.100.20"#;
        let record = parse_line(line).expect("parsed");
        assert_eq!(record.response_time, 0);
        assert_eq!(record.http_status, 200);
        assert_eq!(record.request_bytes, 0);
        assert_eq!(record.response_bytes, 0);
        assert_eq!(record.user_agent, "-");
        assert_eq!(record.http_method, "HEAD");
        assert_eq!(record.file_type, "-");
    }

    #[test]
    fn canonical_empty_url_defaults_to_root() {
        let line = r#"[10/Oct/2025:16:04:18 +0800] 1.2.3.4 - 5 "-" "GET " 200 1 2 HIT "ua" "-" 5.6.7.8"#;
        let record = parse_line(line).expect("parsed");
        assert_eq!(record.request_url, "/");
        assert_eq!(record.file_type, "-");
    }

    #[test]
    fn fallback_combined_log_format() {
        let line = r#"192.0.2.1 - - [10/Oct/2025:13:55:36 -0700] "GET /videos/intro.mp4 HTTP/1.1" 200 2326 "http://ref.example/" "curl/8.0""#;
        let (record, strategy) = match classify(line) {
            ParseOutcome::Parsed(record, strategy) => (record, strategy),
            other => panic!("not parsed: {other:?}"),
        };
        assert_eq!(strategy, Strategy::Fallback);
        assert_eq!(record.client_ip, "192.0.2.1");
        assert_eq!(record.date_time, "10/Oct/2025:13:55:36");
        assert_eq!(record.timezone, "-0700");
        assert_eq!(record.http_method, "GET");
        assert_eq!(record.request_url, "/videos/intro.mp4");
        assert_eq!(record.file_type, "mp4");
        assert_eq!(record.http_status, 200);
        assert_eq!(record.response_bytes, 2326);
        assert_eq!(record.referrer, "http://ref.example/");
        assert_eq!(record.user_agent, "curl/8.0");
        assert_eq!(record.access_ip, "-");
        assert_eq!(record.proxy_ip, "-");
        assert_eq!(record.response_time, 0);
        assert_eq!(record.request_bytes, 0);
        assert_eq!(record.cache_status, "-");
    }

    #[test]
    fn fallback_minimal_shape() {
        let record = parse_line(r#"[2025-10-10 08:00:00] "POST""#).expect("parsed");
        // Only the date part before the first space is the timestamp.
        assert_eq!(record.date_time, "2025-10-10");
        assert_eq!(record.timezone, "08:00:00");
        assert_eq!(record.client_ip, "-");
        assert_eq!(record.http_method, "POST");
        assert_eq!(record.request_url, "/");
        assert_eq!(record.http_status, 200);
        assert_eq!(record.year, "2025");
        assert_eq!(record.month, "10");
        assert_eq!(record.day, "10");
    }

    #[test]
    fn fallback_cdn_line_missing_access_ip() {
        let line = r#"[10/Oct/2025:16:04:18 +0800] 1.2.3.4 - 5 "-" "GET /live/a.ts" 200 1 2 HIT "ua" "video/mp2t""#;
        let (record, strategy) = match classify(line) {
            ParseOutcome::Parsed(record, strategy) => (record, strategy),
            other => panic!("not parsed: {other:?}"),
        };
        assert_eq!(strategy, Strategy::Fallback);
        assert_eq!(record.client_ip, "1.2.3.4");
        assert_eq!(record.referrer, "-");
        assert_eq!(record.http_method, "GET");
        assert_eq!(record.request_url, "/live/a.ts");
        assert_eq!(record.file_type, "ts");
        assert_eq!(record.http_status, 200);
        assert_eq!(record.request_bytes, 1);
        assert_eq!(record.response_bytes, 2);
        assert_eq!(record.cache_status, "HIT");
        assert_eq!(record.user_agent, "ua");
        assert_eq!(record.access_ip, "-");
        assert_eq!(record.day, "10");
    }

    #[test]
    fn bracket_before_timestamp_is_ignored() {
        let line = r#"edge] 1.2.3.4 [10/Oct/2025:16:04:18 +0800] "GET /a.ts HTTP/1.1" 200 5"#;
        let record = parse_line(line).expect("parsed");
        assert_eq!(record.date_time, "10/Oct/2025:16:04:18");
        assert_eq!(record.timezone, "+0800");
        assert_eq!(record.request_url, "/a.ts");
        assert_eq!(record.response_bytes, 5);
    }

    #[test]
    fn missing_timestamp_is_skipped() {
        assert_eq!(
            classify(r#"192.0.2.1 - - "GET / HTTP/1.1" 200 1"#),
            ParseOutcome::Skipped(SkipReason::NoTimestamp)
        );
        assert_eq!(
            classify("] backwards ["),
            ParseOutcome::Skipped(SkipReason::NoTimestamp)
        );
        assert_eq!(classify("[]"), ParseOutcome::Skipped(SkipReason::NoTimestamp));
        assert_eq!(parse_line("plain garbage"), None);
    }

    #[test]
    fn timestamp_without_request_is_skipped() {
        assert_eq!(
            classify("[10/Oct/2025:13:55:36 +0000] service started"),
            ParseOutcome::Skipped(SkipReason::Unrecognized)
        );
        assert_eq!(
            classify(r#"[10/Oct/2025:13:55:36 +0000] "12 34""#),
            ParseOutcome::Skipped(SkipReason::Unrecognized)
        );
    }

    #[test]
    fn blank_lines_are_empty() {
        assert_eq!(classify("   \t"), ParseOutcome::Skipped(SkipReason::Empty));
    }

    #[test]
    fn parser_counts_outcomes() {
        let mut parser = LineParser::new();
        let lines = [
            CANONICAL_LINE,
            r#"192.0.2.1 - - [10/Oct/2025:13:55:36 -0700] "GET / HTTP/1.1" 200 1"#,
            "",
            "garbage",
            "[10/Oct/2025:13:55:36 +0000] nothing quoted",
        ];
        let parsed = lines.iter().filter_map(|l| parser.parse(l)).count();
        assert_eq!(parsed, 2);
        let stats = parser.stats();
        assert_eq!(stats.canonical, 1);
        assert_eq!(stats.fallback, 1);
        assert_eq!(stats.empty, 1);
        assert_eq!(stats.no_timestamp, 1);
        assert_eq!(stats.unrecognized, 1);
        assert_eq!(stats.skipped(), 2);
        assert_eq!(stats.lines(), 5);
    }
}
