//! Discovery of CDN log files for a time window.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

use crate::{
    acs::{RpcRequest, SigningContext},
    config::UpstreamConfig,
    error::{Error, Result},
    fetcher::LogFileReference,
};

pub const LIST_ACTION: &str = "DescribeCdnDomainLogs";
pub const API_VERSION: &str = "2018-05-10";
/// Largest page the listing API hands out.
const PAGE_SIZE: u32 = 1000;

/// Source of log-file references.
#[allow(async_fn_in_trait)]
pub trait LogListing {
    async fn list_log_files(
        &self,
        domain: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<LogFileReference>>;
}

/// An explicit `null` reads the same as a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Wire shape of the listing response. Every level may be absent or null.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ListingResponse {
    #[serde(deserialize_with = "null_as_default")]
    pub domain_log_details: DomainLogDetails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DomainLogDetails {
    #[serde(deserialize_with = "null_as_default")]
    pub domain_log_detail: Vec<DomainLogDetail>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DomainLogDetail {
    pub domain_name: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub log_count: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub log_infos: LogInfos,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogInfos {
    #[serde(deserialize_with = "null_as_default")]
    pub log_info_detail: Vec<LogInfoDetail>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogInfoDetail {
    pub log_path: Option<String>,
    pub log_name: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

impl ListingResponse {
    /// All log paths in response order. Entries without a path are dropped.
    pub fn flatten(self, domain: &str) -> Vec<LogFileReference> {
        let mut refs = Vec::new();
        for detail in self.domain_log_details.domain_log_detail {
            let name = detail.domain_name.as_deref().unwrap_or(domain);
            tracing::info!("domain {name}: {} log files", detail.log_count);
            for info in detail.log_infos.log_info_detail {
                let Some(path) = info.log_path else {
                    continue;
                };
                tracing::debug!(
                    "found log {} ({} to {})",
                    info.log_name.as_deref().unwrap_or("?"),
                    info.start_time.as_deref().unwrap_or("?"),
                    info.end_time.as_deref().unwrap_or("?")
                );
                refs.push(LogFileReference::new(path, name));
            }
        }
        refs
    }
}

pub fn format_instant(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub(crate) fn validate_window(domain: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if domain.trim().is_empty() {
        return Err(Error::InvalidInvocation("domain must not be empty".to_owned()));
    }
    if start > end {
        return Err(Error::InvalidInvocation(format!(
            "start {} is after end {}",
            format_instant(start),
            format_instant(end)
        )));
    }
    Ok(())
}

/// Client for the Alibaba Cloud CDN log-listing API.
pub struct CdnLogClient<'a> {
    client: reqwest::Client,
    config: &'a UpstreamConfig,
}

impl<'a> CdnLogClient<'a> {
    pub fn new(config: &'a UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.list_timeout)
            .build()
            .map_err(|e| Error::Config(format!("building HTTP client: {e}")))?;
        Ok(CdnLogClient { client, config })
    }

    pub fn request(&self, domain: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> RpcRequest {
        RpcRequest {
            method: http::Method::POST,
            host: self.config.endpoint.clone(),
            action: LIST_ACTION.to_owned(),
            version: API_VERSION.to_owned(),
            query: BTreeMap::from([
                ("DomainName".to_owned(), domain.to_owned()),
                ("StartTime".to_owned(), format_instant(start)),
                ("EndTime".to_owned(), format_instant(end)),
                ("PageSize".to_owned(), PAGE_SIZE.to_string()),
            ]),
        }
    }
}

impl LogListing for CdnLogClient<'_> {
    #[tracing::instrument(level = "info", skip(self))]
    async fn list_log_files(
        &self,
        domain: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<LogFileReference>> {
        validate_window(domain, start_time, end_time)?;
        let request = self.request(domain, start_time, end_time);
        let headers = request
            .signed_header_map(&self.config.credentials, &SigningContext::now())
            .map_err(|e| Error::upstream(domain, e))?;

        let response = self
            .client
            .request(request.method.clone(), request.url())
            .headers(headers)
            .send()
            .await
            .map_err(|e| Error::upstream(domain, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| Error::upstream(domain, e))?;
        if !status.is_success() {
            return Err(Error::upstream(domain, format!("HTTP {status}: {body}")));
        }
        let listing: ListingResponse =
            serde_json::from_str(&body).map_err(|e| Error::upstream(domain, e))?;
        let refs = listing.flatten(domain);
        tracing::info!(
            "{} log files for {domain} between {} and {}",
            refs.len(),
            format_instant(start_time),
            format_instant(end_time)
        );
        Ok(refs)
    }
}
