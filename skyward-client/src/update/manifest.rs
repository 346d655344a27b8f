//! Build manifest model and fetching.
//!
//! The manifest server returns either a single build descriptor or a list
//! wrapper `{"response": [...]}`; the newest entry of a list wins.

use async_trait::async_trait;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use super::error::{Result, UpdateError};
use super::retry::RetryPolicy;

/// Named download sources in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSources(pub Vec<(String, String)>);

impl DownloadSources {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(name, url)| (name.as_str(), url.as_str()))
    }
}

impl Serialize for DownloadSources {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, url) in &self.0 {
            map.serialize_entry(name, url)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DownloadSources {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SourcesVisitor;

        impl<'de> Visitor<'de> for SourcesVisitor {
            type Value = DownloadSources;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of source name to URL")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, url)) = access.next_entry::<String, String>()? {
                    entries.push((name, url));
                }
                Ok(DownloadSources(entries))
            }
        }

        deserializer.deserialize_map(SourcesVisitor)
    }
}

/// One build offered by the manifest server. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDescriptor {
    pub version: String,

    /// Build date, epoch milliseconds.
    pub date: i64,

    /// Incremental id of this build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<String>,

    /// Incremental id of the build this payload applies on top of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_build_incremental: Option<String>,

    #[serde(default, skip_serializing_if = "DownloadSources::is_empty")]
    pub download_sources: DownloadSources,

    /// Single download URL, used when no named sources are given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default)]
    pub file_name: String,

    #[serde(default)]
    pub file_size: u64,

    /// Hex SHA-512 of the payload.
    #[serde(default)]
    pub sha_512: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
}

impl BuildDescriptor {
    /// Descriptor for the build currently installed on the device.
    pub fn installed(version: String, date: i64, incremental: Option<String>) -> Self {
        Self {
            version,
            date,
            incremental,
            pre_build_incremental: None,
            download_sources: DownloadSources::default(),
            url: None,
            file_name: String::new(),
            file_size: 0,
            sha_512: String::new(),
            changelog: None,
        }
    }

    /// Candidate download URLs in preference order.
    pub fn urls(&self) -> Vec<&str> {
        if !self.download_sources.is_empty() {
            self.download_sources.iter().map(|(_, url)| url).collect()
        } else {
            self.url.iter().map(String::as_str).collect()
        }
    }

    /// Checks that a fetched descriptor can drive a download.
    pub fn validate(&self) -> Result<()> {
        if self.version.is_empty() {
            return Err(UpdateError::Parse("missing version".to_string()));
        }
        if self.urls().is_empty() {
            return Err(UpdateError::Parse("no download source".to_string()));
        }
        if self.file_name.is_empty() || self.file_name.contains('/') {
            return Err(UpdateError::Parse(format!(
                "invalid file name {:?}",
                self.file_name
            )));
        }
        if self.file_size == 0 {
            return Err(UpdateError::Parse("file size is zero".to_string()));
        }
        if self.sha_512.len() != 128 || !self.sha_512.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(UpdateError::Parse("sha_512 is not a 128 digit hex string".to_string()));
        }
        Ok(())
    }
}

/// Whether `new` should replace `old`.
///
/// A later date always wins. With equal dates, `new` must continue the
/// incremental chain: its `pre_build_incremental` is `old`'s incremental and
/// its own incremental differs.
pub fn is_newer(new: &BuildDescriptor, old: &BuildDescriptor) -> bool {
    if new.date != old.date {
        return new.date > old.date;
    }
    match (&new.pre_build_incremental, &old.incremental) {
        (Some(pre), Some(old_inc)) => pre == old_inc && new.incremental.as_ref() != Some(old_inc),
        _ => false,
    }
}

/// Raw manifest document.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ManifestDocument {
    List { response: Vec<BuildDescriptor> },
    Single(BuildDescriptor),
}

impl ManifestDocument {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| UpdateError::Parse(e.to_string()))
    }

    /// The newest build in the document.
    pub fn latest(self) -> Result<BuildDescriptor> {
        match self {
            ManifestDocument::Single(build) => Ok(build),
            ManifestDocument::List { response } => response
                .into_iter()
                .reduce(|best, next| if is_newer(&next, &best) { next } else { best })
                .ok_or_else(|| UpdateError::Parse("manifest lists no builds".to_string())),
        }
    }
}

/// A build descriptor together with the source chosen for downloading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub build: BuildDescriptor,
    pub source_url: String,
}

/// Where the orchestrator gets the latest build from.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch_latest(&self) -> Result<ManifestEntry>;
}

/// HTTP manifest client with bounded retries on network errors.
pub struct ManifestClient {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
    reachability_timeout: Duration,
}

impl ManifestClient {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        retry: RetryPolicy,
        reachability_timeout: Duration,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            retry,
            reachability_timeout,
        }
    }

    async fn fetch_once(&self) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| UpdateError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Network(format!(
                "manifest server returned {}",
                status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| UpdateError::Network(e.to_string()))?;
        Ok(body.to_vec())
    }

    /// Fetch and parse the manifest. Network errors are retried with
    /// backoff; parse errors are returned immediately.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn fetch(&self) -> Result<BuildDescriptor> {
        let mut attempt = 0;
        let body = loop {
            match self.fetch_once().await {
                Ok(body) => break body,
                Err(e) => {
                    attempt += 1;
                    if !self.retry.should_retry(attempt) {
                        warn!(attempts = attempt, error = %e, "Giving up on manifest fetch");
                        return Err(e);
                    }
                    let delay = self.retry.delay(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Manifest fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let build = ManifestDocument::parse(&body)?.latest()?;
        build.validate()?;
        info!(
            version = %build.version,
            date = build.date,
            size = build.file_size,
            "Manifest fetched"
        );
        Ok(build)
    }
}

#[async_trait]
impl ManifestSource for ManifestClient {
    async fn fetch_latest(&self) -> Result<ManifestEntry> {
        let build = self.fetch().await?;
        let source_url = select_source(&build.urls(), self.reachability_timeout)
            .await
            .ok_or_else(|| UpdateError::Parse("no download source".to_string()))?;
        Ok(ManifestEntry { build, source_url })
    }
}

/// First URL whose host accepts a TCP connection, else the first URL.
pub async fn select_source(urls: &[&str], timeout: Duration) -> Option<String> {
    let first = urls.first()?.to_string();
    for url in urls {
        let Ok(parsed) = reqwest::Url::parse(url) else {
            debug!(url = %url, "Skipping unparseable source");
            continue;
        };
        let (Some(host), Some(port)) = (parsed.host_str(), parsed.port_or_known_default()) else {
            continue;
        };
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => {
                debug!(url = %url, "Source reachable");
                return Some(url.to_string());
            }
            Ok(Err(e)) => debug!(url = %url, error = %e, "Source unreachable"),
            Err(_) => debug!(url = %url, "Source reachability timed out"),
        }
    }
    info!(url = %first, "No source reachable, using the first one");
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(date: i64, incremental: Option<&str>, pre: Option<&str>) -> BuildDescriptor {
        BuildDescriptor {
            incremental: incremental.map(String::from),
            pre_build_incremental: pre.map(String::from),
            ..BuildDescriptor::installed("14".into(), date, None)
        }
    }

    #[test]
    fn test_parse_single_descriptor() {
        let json = r#"{
            "version": "14",
            "date": 1700000000000,
            "pre_build_incremental": null,
            "download_sources": {"mirror": "https://m.example/u.zip", "cdn": "https://cdn.example/u.zip"},
            "file_name": "u.zip",
            "file_size": 1073741824,
            "sha_512": "ab",
            "unknown_field": 42
        }"#;
        let build = ManifestDocument::parse(json.as_bytes()).unwrap().latest().unwrap();
        assert_eq!(build.version, "14");
        assert_eq!(build.file_size, 1073741824);
        assert_eq!(
            build.urls(),
            vec!["https://m.example/u.zip", "https://cdn.example/u.zip"]
        );
    }

    #[test]
    fn test_parse_list_picks_newest() {
        let json = r#"{"response": [
            {"version": "13", "date": 1600000000000, "url": "http://a/1", "file_name": "a", "file_size": 1, "sha_512": "00"},
            {"version": "14", "date": 1700000000000, "url": "http://a/2", "file_name": "b", "file_size": 1, "sha_512": "00"}
        ]}"#;
        let build = ManifestDocument::parse(json.as_bytes()).unwrap().latest().unwrap();
        assert_eq!(build.version, "14");
        assert_eq!(build.urls(), vec!["http://a/2"]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ManifestDocument::parse(b"not json"),
            Err(UpdateError::Parse(_))
        ));
        let empty = ManifestDocument::parse(br#"{"response": []}"#).unwrap();
        assert!(matches!(empty.latest(), Err(UpdateError::Parse(_))));
    }

    #[test]
    fn test_validate_descriptor() {
        let mut b = build(1, None, None);
        b.url = Some("http://a/u.zip".into());
        b.file_name = "u.zip".into();
        b.file_size = 10;
        b.sha_512 = "a".repeat(128);
        assert!(b.validate().is_ok());

        b.sha_512 = "xyz".into();
        assert!(b.validate().is_err());

        b.sha_512 = "A".repeat(128);
        b.file_name = "../etc/passwd".into();
        assert!(b.validate().is_err());
    }

    #[test]
    fn test_is_newer_by_date() {
        let old = build(1_600_000_000_000, None, None);
        let new = build(1_700_000_000_000, None, None);
        assert!(is_newer(&new, &old));
        assert!(!is_newer(&old, &new));
        assert!(!is_newer(&old, &old));
    }

    #[test]
    fn test_is_newer_by_incremental_chain() {
        let old = build(1_700_000_000_000, Some("100"), None);
        let next = build(1_700_000_000_000, Some("101"), Some("100"));
        assert!(is_newer(&next, &old));

        let unrelated = build(1_700_000_000_000, Some("101"), Some("99"));
        assert!(!is_newer(&unrelated, &old));

        let same = build(1_700_000_000_000, Some("100"), Some("100"));
        assert!(!is_newer(&same, &old));

        let no_chain = build(1_700_000_000_000, Some("101"), None);
        assert!(!is_newer(&no_chain, &old));
    }

    #[tokio::test]
    async fn test_select_source_prefers_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let reachable = format!("http://127.0.0.1:{}/u.zip", port);

        // Port 9 on localhost is almost never open.
        let urls = vec!["http://127.0.0.1:9/u.zip", reachable.as_str()];
        let chosen = select_source(&urls, Duration::from_millis(500)).await;
        assert_eq!(chosen.as_deref(), Some(reachable.as_str()));
    }

    #[tokio::test]
    async fn test_select_source_falls_back_to_first() {
        let urls = vec!["http://127.0.0.1:9/a", "not a url"];
        let chosen = select_source(&urls, Duration::from_millis(200)).await;
        assert_eq!(chosen.as_deref(), Some("http://127.0.0.1:9/a"));
        assert_eq!(select_source(&[], Duration::from_millis(10)).await, None);
    }
}
