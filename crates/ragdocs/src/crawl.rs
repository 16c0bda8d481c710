//! Crawl discovery.
//!
//! Mode order: sitemap when one exists, recursive same-domain BFS
//! otherwise, with an explicit manual list merged in (additive) or used
//! exclusively. The page cap is applied after the global lastmod sort so
//! it always keeps the freshest content.

use std::collections::{HashSet, VecDeque};

use scraper::{Html, Selector};
use url::Url;

use crate::error::{RagError, RagResult};
use crate::fetch::Fetcher;
use crate::robots::Robots;
use crate::sitemap;
use crate::types::{SitemapCache, SitemapEntry};

/// Discover the URLs to index, ordered freshest-first.
pub(crate) async fn discover_urls(
    config: &config::RagConfig,
    fetcher: &Fetcher,
    sitemap_cache: &mut SitemapCache,
) -> RagResult<Vec<SitemapEntry>> {
    let manual: Vec<SitemapEntry> = config
        .manual_urls
        .iter()
        .filter_map(|raw| normalize_url(raw))
        .map(|url| SitemapEntry { url, lastmod: None })
        .collect();

    if config.manual_urls_exclusive {
        log::info!("Using exclusive manual URL list ({} URLs)", manual.len());
        return Ok(cap(dedup(manual), config.max_pages));
    }

    let base = Url::parse(&config.base_url).map_err(|e| RagError::Fetch(format!("invalid base_url: {e}")))?;

    let robots = Robots::load(fetcher.client(), &base).await;

    let mut discovered = match sitemap::discover(fetcher.client(), &base, &robots, sitemap_cache).await {
        Some(entries) => {
            log::info!("Sitemap discovery found {} URLs", entries.len());
            entries
        }
        None => {
            log::info!("No sitemap found; falling back to recursive crawl");
            recursive_discover(fetcher, &base, &robots, config.max_crawl_depth).await
        }
    };

    discovered.retain(|entry| {
        let Ok(url) = Url::parse(&entry.url) else {
            return false;
        };

        url.host_str() == base.host_str() && robots.allows(&url)
    });

    // Manual URLs are additive; deduplication is by normalised URL.
    discovered.extend(manual);

    Ok(cap(dedup(discovered), config.max_pages))
}

/// Same-domain BFS bounded by depth. Pages fetched here land in the page
/// cache, so the indexing pass that follows reads them back for free.
async fn recursive_discover(fetcher: &Fetcher, base: &Url, robots: &Robots, max_depth: u32) -> Vec<SitemapEntry> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut discovered = Vec::new();
    let mut frontier = VecDeque::from([(base.to_string(), 0u32)]);

    while let Some((url, depth)) = frontier.pop_front() {
        let Some(normalized) = normalize_url(&url) else {
            continue;
        };

        if !visited.insert(normalized.clone()) {
            continue;
        }

        discovered.push(SitemapEntry {
            url: normalized.clone(),
            lastmod: None,
        });

        if depth >= max_depth {
            continue;
        }

        let entry = SitemapEntry {
            url: normalized,
            lastmod: None,
        };
        let report = fetcher.fetch_all(&[entry], &Default::default(), false).await;

        for page in &report.pages {
            for link in extract_links(&page.html, base) {
                let Ok(parsed) = Url::parse(&link) else {
                    continue;
                };

                if parsed.host_str() == base.host_str() && robots.allows(&parsed) && !visited.contains(&link) {
                    frontier.push_back((link, depth + 1));
                }
            }
        }
    }

    log::info!("Recursive crawl discovered {} URLs", discovered.len());
    discovered
}

/// Anchor targets resolved against the page base, fragments dropped,
/// obvious non-page assets skipped.
pub(crate) fn extract_links(html: &str, base: &Url) -> Vec<String> {
    const SKIPPED_EXTENSIONS: &[&str] = &[
        ".png", ".jpg", ".jpeg", ".gif", ".svg", ".css", ".js", ".ico", ".pdf", ".zip", ".tar", ".gz", ".woff",
        ".woff2", ".xml", ".json",
    ];

    let document = Html::parse_document(html);
    let Ok(anchors) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut links = Vec::new();

    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };

        let Ok(resolved) = base.join(href) else {
            continue;
        };

        let Some(normalized) = normalize_url(resolved.as_str()) else {
            continue;
        };

        let lowered = normalized.to_ascii_lowercase();
        if SKIPPED_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext)) {
            continue;
        }

        links.push(normalized);
    }

    links
}

/// Canonical URL form used for deduplication: fragment dropped, trailing
/// slash trimmed everywhere but the root.
pub(crate) fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw).ok()?;
    url.set_fragment(None);

    let mut out = url.to_string();

    if out.ends_with('/') && url.path() != "/" {
        out.pop();
    }

    Some(out)
}

fn dedup(entries: Vec<SitemapEntry>) -> Vec<SitemapEntry> {
    sitemap::sort_and_dedup(entries)
}

fn cap(mut entries: Vec<SitemapEntry>, max_pages: usize) -> Vec<SitemapEntry> {
    if entries.len() > max_pages {
        log::info!("Capping crawl at {max_pages} of {} discovered URLs", entries.len());
        entries.truncate(max_pages);
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_drops_fragments_and_trailing_slashes() {
        assert_eq!(
            normalize_url("https://docs.example.com/guide/#setup").as_deref(),
            Some("https://docs.example.com/guide")
        );
        assert_eq!(
            normalize_url("https://docs.example.com/").as_deref(),
            Some("https://docs.example.com/")
        );
        assert_eq!(normalize_url("not a url"), None);
    }

    #[test]
    fn link_extraction_resolves_and_filters() {
        let base = Url::parse("https://docs.example.com/guide/intro").unwrap();
        let html = r#"
            <a href="/api/overview">api</a>
            <a href="sibling#frag">sibling</a>
            <a href="https://other.example.org/external">external</a>
            <a href="/logo.png">asset</a>
        "#;

        let links = extract_links(html, &base);

        assert!(links.contains(&"https://docs.example.com/api/overview".to_string()));
        assert!(links.contains(&"https://docs.example.com/guide/sibling".to_string()));
        // Cross-host links survive extraction; the crawler filters them.
        assert!(links.iter().any(|l| l.starts_with("https://other.example.org")));
        assert!(!links.iter().any(|l| l.ends_with(".png")));
    }
}
