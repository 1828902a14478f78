//! Fetcher for compressed log files.
//!
//! A [`LogSource`] produces the compressed payload of one file; [`LogLines`]
//! decompresses it lazily, one line at a time.

use std::{
    io::{BufRead, BufReader, Cursor},
    time::Duration,
};

use bytes::Bytes;
use flate2::bufread::MultiGzDecoder;
use serde::Serialize;

use crate::{
    error::{Error, Result},
    storage::Storage,
};

/// Where one log file lives, and which domain it was listed for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogFileReference {
    pub locator: String,
    pub domain: String,
}

impl LogFileReference {
    pub fn new(locator: impl Into<String>, domain: impl Into<String>) -> Self {
        LogFileReference {
            locator: locator.into(),
            domain: domain.into(),
        }
    }

    /// The locator as a URL; the listing API hands out bare `host/path` values.
    pub fn url(&self) -> String {
        if self.locator.starts_with("http://") || self.locator.starts_with("https://") {
            self.locator.clone()
        } else {
            format!("https://{}", self.locator.trim_start_matches('/'))
        }
    }

    /// Last path component, without query string or fragment.
    pub fn file_name(&self) -> &str {
        let path = self.locator.split(['?', '#']).next().unwrap_or_default();
        path.rsplit('/').next().unwrap_or_default()
    }
}

/// A downloaded, still-compressed log file.
pub struct CompressedLog {
    pub reference: LogFileReference,
    pub data: Bytes,
}

impl CompressedLog {
    pub fn lines(&self) -> LogLines<Cursor<Bytes>> {
        LogLines::new(Cursor::new(self.data.clone()), &self.reference.locator)
    }
}

/// Lines of a gzip stream, decoded lossily as UTF-8 without line terminators.
///
/// Stops after the first decompression error.
pub struct LogLines<R> {
    reader: BufReader<MultiGzDecoder<R>>,
    locator: String,
    buffer: Vec<u8>,
    done: bool,
}

impl<R: BufRead> LogLines<R> {
    pub fn new(compressed: R, locator: &str) -> Self {
        LogLines {
            reader: BufReader::new(MultiGzDecoder::new(compressed)),
            locator: locator.to_owned(),
            buffer: Vec::new(),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for LogLines<R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.buffer.clear();
        match self.reader.read_until(b'\n', &mut self.buffer) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                let mut line: &[u8] = &self.buffer;
                while let [rest @ .., b'\n' | b'\r'] = line {
                    line = rest;
                }
                Some(Ok(String::from_utf8_lossy(line).into_owned()))
            }
            Err(e) => {
                self.done = true;
                Some(Err(Error::fetch(&self.locator, e)))
            }
        }
    }
}

/// Something that can hand over the compressed bytes of a log file.
#[allow(async_fn_in_trait)]
pub trait LogSource {
    async fn fetch(&self, reference: &LogFileReference) -> Result<CompressedLog>;

    async fn fetch_and_decompress(
        &self,
        reference: &LogFileReference,
    ) -> Result<LogLines<Cursor<Bytes>>> {
        Ok(self.fetch(reference).await?.lines())
    }
}

/// Downloads log files over HTTP(S).
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("building HTTP client: {e}")))?;
        Ok(HttpFetcher { client })
    }
}

impl LogSource for HttpFetcher {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch(&self, reference: &LogFileReference) -> Result<CompressedLog> {
        let url = reference.url();
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::fetch(&url, e))?;
        let data = response.bytes().await.map_err(|e| Error::fetch(&url, e))?;
        tracing::info!("downloaded {} ({} bytes)", reference.file_name(), data.len());
        Ok(CompressedLog {
            reference: reference.clone(),
            data,
        })
    }
}

/// Reads log files from object storage; the locator is the object key.
pub struct StorageFetcher {
    storage: Storage,
}

impl StorageFetcher {
    pub fn new(storage: Storage) -> Self {
        StorageFetcher { storage }
    }
}

impl LogSource for StorageFetcher {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch(&self, reference: &LogFileReference) -> Result<CompressedLog> {
        let data = self
            .storage
            .read(&reference.locator)
            .await
            .map_err(|e| Error::fetch(&reference.locator, e))?;
        tracing::info!("read {} ({} bytes)", reference.locator, data.len());
        Ok(CompressedLog {
            reference: reference.clone(),
            data,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    pub(crate) fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn url_normalization() {
        let bare = LogFileReference::new("cdnlog.example.com/v1/a_2025_10_13_000000_020000.gz?Expires=1", "d");
        assert_eq!(
            bare.url(),
            "https://cdnlog.example.com/v1/a_2025_10_13_000000_020000.gz?Expires=1"
        );
        assert_eq!(bare.file_name(), "a_2025_10_13_000000_020000.gz");

        let http = LogFileReference::new("http://h/x.gz", "d");
        assert_eq!(http.url(), "http://h/x.gz");
        assert_eq!(http.file_name(), "x.gz");
    }

    #[test]
    fn lines_are_decompressed_lazily_and_trimmed() {
        let data = gzip("first\r\nsecond\n\nlast-without-newline");
        let lines: Vec<String> = LogLines::new(Cursor::new(data), "mem")
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(lines, vec!["first", "second", "", "last-without-newline"]);
    }

    #[test]
    fn concatenated_gzip_members_are_read() {
        let mut data = gzip("a\n");
        data.extend(gzip("b\n"));
        let lines: Vec<String> = LogLines::new(Cursor::new(data), "mem")
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut raw = b"ok \xff\xfe end\n".to_vec();
        raw.extend_from_slice(b"next\n");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let data = encoder.finish().unwrap();
        let lines: Vec<String> = LogLines::new(Cursor::new(data), "mem")
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ok "));
    }

    #[test]
    fn corrupt_payload_is_fetch_failed() {
        let mut lines = LogLines::new(Cursor::new(b"definitely not gzip".to_vec()), "bad.gz");
        let err = lines.next().unwrap().unwrap_err();
        assert_eq!(err.kind(), "fetch_failed");
        assert!(lines.next().is_none());
    }

    #[tokio::test]
    async fn storage_fetcher_reads_object() {
        let storage = Storage::memory().unwrap();
        storage
            .write("raw/a.gz", gzip("x\ny\n"), "application/gzip")
            .await
            .unwrap();
        let fetcher = StorageFetcher::new(storage);
        let lines: Vec<String> = fetcher
            .fetch_and_decompress(&LogFileReference::new("raw/a.gz", "d"))
            .await
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(lines, vec!["x", "y"]);

        let err = fetcher
            .fetch(&LogFileReference::new("raw/missing.gz", "d"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "fetch_failed");
    }
}
