//! Node image update check against the registry's tag listing.
//!
//! The listing is `{ "results": [ { "name": "...", "images": [ { "digest": "..." } ] } ] }`.
//! The tag named `latest` defines the newest build; semantic version tags sharing a digest
//! with it, or with the running image, name the two versions shown to the user.
//!
//! Registry trouble is never the launcher's problem: every failure produces
//! [`UpdateVerdict::no_news`].

use core::time::Duration;
use std::{collections::HashSet, sync::LazyLock};

use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RegistryConfig;

/// Tags that look like a release version (`1.2.3`, `1.2.3-alpine`, ...).
static SEMVER_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+.*$").expect("static regex is valid"));

/// Outcome of one update check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateVerdict {
    /// Version tag of the running image, empty if the registry doesn't know it.
    pub current_version: String,
    /// Version tag of the image currently tagged `latest`, empty if there is none.
    pub latest_version: String,
    pub up_to_date: bool,
}

impl UpdateVerdict {
    /// Nothing actionable is known.
    #[must_use]
    pub fn no_news() -> Self {
        Self {
            up_to_date: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TagPage {
    #[serde(default)]
    results: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    images: Vec<TagImage>,
}

#[derive(Debug, Deserialize)]
struct TagImage {
    #[serde(default)]
    digest: Option<String>,
}

impl TagEntry {
    fn digests(&self) -> impl Iterator<Item = &str> {
        self.images.iter().filter_map(|image| image.digest.as_deref())
    }

    fn has_digest(&self, wanted: &HashSet<String>) -> bool {
        self.digests().any(|d| wanted.contains(&d.to_ascii_lowercase()))
    }
}

/// Derives the verdict for `current_digest` from one page of the tag listing.
///
/// Digests compare case-insensitively. A multi-platform `latest` carries one digest per
/// platform; matching any of them counts. When several version tags qualify, the last
/// one in listing order wins. Without a `latest` tag there is no news.
#[must_use]
pub fn resolve_verdict(page: &TagPage, current_digest: &str) -> UpdateVerdict {
    let latest: HashSet<String> = page
        .results
        .iter()
        .filter(|tag| tag.name == "latest")
        .flat_map(TagEntry::digests)
        .map(str::to_ascii_lowercase)
        .collect();
    if latest.is_empty() {
        debug!("Tag listing has no 'latest' tag");
        return UpdateVerdict::no_news();
    }

    let current = HashSet::from([current_digest.to_ascii_lowercase()]);
    UpdateVerdict {
        latest_version: last_version_with(page, &latest),
        current_version: last_version_with(page, &current),
        up_to_date: current.iter().any(|d| latest.contains(d)),
    }
}

fn last_version_with(page: &TagPage, wanted: &HashSet<String>) -> String {
    page.results
        .iter()
        .filter(|tag| SEMVER_TAG.is_match(&tag.name))
        .rfind(|tag| tag.has_digest(wanted))
        .map(|tag| tag.name.clone())
        .unwrap_or_default()
}

/// Fetches the first page of tags and resolves the verdict for `current_digest`.
///
/// Never fails: network errors, timeouts, non-200 responses and malformed bodies all
/// produce [`UpdateVerdict::no_news`].
pub async fn check_updates(
    client: &reqwest::Client,
    config: &RegistryConfig,
    current_digest: &str,
) -> UpdateVerdict {
    let separator = if config.tags_url.contains('?') { '&' } else { '?' };
    let url = format!("{}{separator}page_size={}", config.tags_url, config.page_size);

    let response = match client
        .get(&url)
        .timeout(Duration::from_secs(config.timeout_secs))
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!("Registry unreachable ({url}): {e}");
            return UpdateVerdict::no_news();
        }
    };
    if response.status() != StatusCode::OK {
        warn!("Registry answered {} for {url}", response.status());
        return UpdateVerdict::no_news();
    }
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read registry response: {e}");
            return UpdateVerdict::no_news();
        }
    };
    match serde_json::from_str::<TagPage>(&body) {
        Ok(page) => resolve_verdict(&page, current_digest),
        Err(e) => {
            warn!("Malformed tag listing from registry: {e}");
            UpdateVerdict::no_news()
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::TcpListener,
    };

    use super::*;

    fn page(tags: &[(&str, &[&str])]) -> TagPage {
        let results = tags
            .iter()
            .map(|&(name, digests)| {
                let images = digests
                    .iter()
                    .map(|d| serde_json::json!({ "digest": d }))
                    .collect::<Vec<_>>();
                serde_json::json!({ "name": name, "images": images })
            })
            .collect::<Vec<_>>();
        serde_json::from_value(serde_json::json!({ "results": results })).unwrap()
    }

    #[test]
    fn outdated_node_reports_both_versions() {
        let page = page(&[
            ("latest", &["sha256:d1"]),
            ("1.2.3", &["sha256:d1"]),
            ("1.2.2", &["sha256:d0"]),
        ]);
        let verdict = resolve_verdict(&page, "sha256:d0");
        assert_eq!(
            verdict,
            UpdateVerdict {
                current_version: "1.2.2".to_owned(),
                latest_version: "1.2.3".to_owned(),
                up_to_date: false,
            }
        );
    }

    #[test]
    fn up_to_date_ignores_digest_case() {
        let page = page(&[("latest", &["sha256:ABCDEF"]), ("1.0.0", &["sha256:abcdef"])]);
        let verdict = resolve_verdict(&page, "sha256:abcdef");
        assert!(verdict.up_to_date);
        assert_eq!(verdict.current_version, "1.0.0");
        assert_eq!(verdict.latest_version, "1.0.0");
    }

    #[test]
    fn tag_order_does_not_matter() {
        let page = page(&[
            ("1.2.3", &["sha256:d1"]),
            ("1.2.2", &["sha256:d0"]),
            ("latest", &["sha256:d1"]),
        ]);
        let verdict = resolve_verdict(&page, "sha256:d0");
        assert_eq!(verdict.latest_version, "1.2.3");
        assert_eq!(verdict.current_version, "1.2.2");
        assert!(!verdict.up_to_date);
    }

    #[test]
    fn non_version_tags_are_not_versions() {
        let page = page(&[
            ("latest", &["sha256:d1"]),
            ("alpine", &["sha256:d1"]),
            ("1.2", &["sha256:d1"]),
            ("1.3.0-rc1", &["sha256:d1"]),
        ]);
        let verdict = resolve_verdict(&page, "sha256:d1");
        assert_eq!(verdict.latest_version, "1.3.0-rc1");
        assert!(verdict.up_to_date);
    }

    #[test]
    fn multi_platform_latest_matches_any_platform() {
        let page = page(&[
            ("latest", &["sha256:amd64", "sha256:arm64"]),
            ("2.0.0", &["sha256:amd64", "sha256:arm64"]),
        ]);
        let verdict = resolve_verdict(&page, "sha256:arm64");
        assert!(verdict.up_to_date);
        assert_eq!(verdict.current_version, "2.0.0");
    }

    #[test]
    fn later_version_tag_on_the_same_digest_wins() {
        let page = page(&[
            ("latest", &["sha256:d1"]),
            ("1.2.3", &["sha256:d1"]),
            ("1.2.3-alpine", &["sha256:d1"]),
            ("1.2.2", &["sha256:d0"]),
            ("1.2.2-alpine", &["sha256:d0"]),
        ]);
        let verdict = resolve_verdict(&page, "sha256:d0");
        assert_eq!(verdict.latest_version, "1.2.3-alpine");
        assert_eq!(verdict.current_version, "1.2.2-alpine");
        assert!(!verdict.up_to_date);
    }

    #[test]
    fn missing_latest_is_no_news() {
        let page = page(&[("1.2.3", &["sha256:d1"])]);
        assert_eq!(resolve_verdict(&page, "sha256:d0"), UpdateVerdict::no_news());
        assert_eq!(
            resolve_verdict(&TagPage::default(), "sha256:d0"),
            UpdateVerdict::no_news()
        );
    }

    #[test]
    fn unknown_current_digest_has_no_current_version() {
        let page = page(&[("latest", &["sha256:d1"]), ("1.2.3", &["sha256:d1"])]);
        let verdict = resolve_verdict(&page, "sha256:local-build");
        assert_eq!(verdict.current_version, "");
        assert_eq!(verdict.latest_version, "1.2.3");
        assert!(!verdict.up_to_date);
    }

    /// Serves exactly one HTTP response and returns the URL to request.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            drop(stream.read(&mut buf).await);
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            drop(stream.write_all(response.as_bytes()).await);
            drop(stream.shutdown().await);
        });
        format!("http://{addr}/v2/repositories/example/node/tags")
    }

    fn registry_config(tags_url: String) -> RegistryConfig {
        RegistryConfig {
            tags_url,
            timeout_secs: 2,
            ..RegistryConfig::default()
        }
    }

    #[tokio::test]
    async fn fetches_and_resolves_listing() {
        let url = serve_once(
            "200 OK",
            r#"{"count":3,"results":[
                {"name":"latest","images":[{"digest":"sha256:d1"}]},
                {"name":"1.2.3","images":[{"digest":"sha256:d1"}]},
                {"name":"1.2.2","images":[{"digest":"sha256:d0"}]}
            ]}"#,
        )
        .await;
        let verdict =
            check_updates(&reqwest::Client::new(), &registry_config(url), "sha256:d0").await;
        assert_eq!(verdict.current_version, "1.2.2");
        assert_eq!(verdict.latest_version, "1.2.3");
        assert!(!verdict.up_to_date);
    }

    #[tokio::test]
    async fn server_error_is_no_news() {
        let url = serve_once("500 Internal Server Error", "{}").await;
        let verdict =
            check_updates(&reqwest::Client::new(), &registry_config(url), "sha256:d0").await;
        assert_eq!(verdict, UpdateVerdict::no_news());
    }

    #[tokio::test]
    async fn malformed_body_is_no_news() {
        let url = serve_once("200 OK", "<html>maintenance</html>").await;
        let verdict =
            check_updates(&reqwest::Client::new(), &registry_config(url), "sha256:d0").await;
        assert_eq!(verdict, UpdateVerdict::no_news());
    }

    #[tokio::test]
    async fn unreachable_registry_is_no_news() {
        // bind and drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = registry_config(format!("http://127.0.0.1:{port}/tags"));
        let verdict = check_updates(&reqwest::Client::new(), &config, "sha256:d0").await;
        assert_eq!(verdict, UpdateVerdict::no_news());
    }
}
