//! Page fetching with a TTL-bounded cache.
//!
//! A bounded worker pool fetches URLs concurrently. Brotli is
//! deliberately absent from the accepted encodings (observed decode
//! failures with documentation hosts); the client negotiates gzip and
//! deflate only. Redirects are followed but the final URL must stay on
//! the crawl's authority or the page is discarded.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use url::Url;

use crate::error::{RagError, RagResult};
use crate::store::{Store, sha256_hex};
use crate::types::{PageRecord, SitemapEntry, unix_now};

const FETCH_CONCURRENCY: usize = 8;

pub(crate) struct Fetcher {
    client: Client,
    store: Store,
    base_host: Option<String>,
    ttl_secs: u64,
}

/// One successfully fetched (or cache-served) page.
#[derive(Debug, Clone)]
pub(crate) struct FetchedPage {
    pub url: String,
    pub html: String,
    pub content_hash: String,
    pub lastmod: Option<String>,
    pub from_cache: bool,
}

/// Outcome of one fetch round.
#[derive(Debug, Default)]
pub(crate) struct FetchReport {
    pub pages: Vec<FetchedPage>,
    pub failed_urls: Vec<String>,
    pub status_histogram: BTreeMap<u16, usize>,
}

impl FetchReport {
    pub(crate) fn log_summary(&self) {
        let histogram = self
            .status_histogram
            .iter()
            .map(|(status, count)| format!("{status}x{count}"))
            .collect::<Vec<_>>()
            .join(", ");

        log::info!(
            "Fetch round complete: {} pages ({} from cache), {} failures, statuses: [{histogram}]",
            self.pages.len(),
            self.pages.iter().filter(|p| p.from_cache).count(),
            self.failed_urls.len(),
        );
    }
}

enum FetchOutcome {
    Page(FetchedPage),
    Failed { url: String, reason: String },
}

impl Fetcher {
    pub(crate) fn new(config: &config::RagConfig, store: Store) -> RagResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| RagError::Fetch(format!("failed to build crawl client: {e}")))?;

        let base_host = Url::parse(&config.base_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string));

        Ok(Self {
            client,
            store,
            base_host,
            ttl_secs: config.page_cache_ttl().as_secs(),
        })
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// Fetch every entry not on the skip list, bounded concurrency.
    pub(crate) async fn fetch_all(
        &self,
        entries: &[SitemapEntry],
        skip_list: &BTreeSet<String>,
        force_refresh: bool,
    ) -> FetchReport {
        let mut report = FetchReport::default();

        let outcomes: Vec<(FetchOutcome, Option<u16>)> = futures::stream::iter(
            entries
                .iter()
                .filter(|entry| !skip_list.contains(&entry.url))
                .map(|entry| self.fetch_one(entry, force_refresh)),
        )
        .buffer_unordered(FETCH_CONCURRENCY)
        .collect()
        .await;

        for (outcome, status) in outcomes {
            if let Some(status) = status {
                *report.status_histogram.entry(status).or_insert(0) += 1;
            }

            match outcome {
                FetchOutcome::Page(page) => report.pages.push(page),
                FetchOutcome::Failed { url, reason } => {
                    log::debug!("Fetch failed for {url}: {reason}");
                    report.failed_urls.push(url);
                }
            }
        }

        report
    }

    async fn fetch_one(&self, entry: &SitemapEntry, force_refresh: bool) -> (FetchOutcome, Option<u16>) {
        let url = entry.url.clone();

        let cached = self.store.load_page(&url, self.ttl_secs);

        if !force_refresh && let Some(record) = &cached {
            return (
                FetchOutcome::Page(FetchedPage {
                    url,
                    html: record.html.clone(),
                    content_hash: record.content_hash.clone(),
                    lastmod: entry.lastmod.clone().or_else(|| record.lastmod.clone()),
                    from_cache: true,
                }),
                None,
            );
        }

        let mut request = self.client.get(&url);

        // Revalidate stale entries instead of refetching bodies.
        if let Some(record) = &cached {
            if let Some(etag) = &record.etag {
                request = request.header(reqwest::header::IF_NONE_MATCH, etag);
            }
            if let Some(modified) = &record.last_modified {
                request = request.header(reqwest::header::IF_MODIFIED_SINCE, modified);
            }
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return (
                    FetchOutcome::Failed {
                        url,
                        reason: e.to_string(),
                    },
                    None,
                );
            }
        };

        let status = response.status().as_u16();

        if status == 304 && let Some(record) = cached {
            let refreshed = PageRecord {
                cached_at: unix_now(),
                ..record
            };
            let _ = self.store.write_page(&refreshed);

            return (
                FetchOutcome::Page(FetchedPage {
                    url,
                    html: refreshed.html.clone(),
                    content_hash: refreshed.content_hash.clone(),
                    lastmod: entry.lastmod.clone(),
                    from_cache: true,
                }),
                Some(status),
            );
        }

        if !response.status().is_success() {
            return (
                FetchOutcome::Failed {
                    url,
                    reason: format!("status {status}"),
                },
                Some(status),
            );
        }

        // Redirect confinement: the final URL must stay on the crawl's
        // authority.
        if let Some(base_host) = &self.base_host {
            let final_host = response.url().host_str().unwrap_or("");
            if final_host != base_host {
                log::warn!("Discarding {url}: redirected off-site to {}", response.url());
                return (
                    FetchOutcome::Failed {
                        url,
                        reason: format!("redirected off-site to host '{final_host}'"),
                    },
                    Some(status),
                );
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if !is_html(&content_type) {
            return (
                FetchOutcome::Failed {
                    url,
                    reason: format!("non-HTML content type '{content_type}'"),
                },
                Some(status),
            );
        }

        let etag = header_string(&response, reqwest::header::ETAG);
        let last_modified = header_string(&response, reqwest::header::LAST_MODIFIED);

        let html = match response.text().await {
            Ok(html) => html,
            Err(e) => {
                return (
                    FetchOutcome::Failed {
                        url,
                        reason: format!("body read failed: {e}"),
                    },
                    Some(status),
                );
            }
        };

        let content_hash = sha256_hex(html.as_bytes());

        let record = PageRecord {
            url: url.clone(),
            content_hash: content_hash.clone(),
            etag,
            last_modified,
            lastmod: entry.lastmod.clone(),
            cached_at: unix_now(),
            html: html.clone(),
        };

        if let Err(e) = self.store.write_page(&record) {
            log::warn!("Failed to cache page {url}: {e}");
        }

        (
            FetchOutcome::Page(FetchedPage {
                url,
                html,
                content_hash,
                lastmod: entry.lastmod.clone(),
                from_cache: false,
            }),
            Some(status),
        )
    }
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub(crate) fn is_html(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    essence.is_empty() || essence == "text/html" || essence == "application/xhtml+xml"
}
