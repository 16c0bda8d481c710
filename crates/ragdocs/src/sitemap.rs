//! Sitemap discovery and parsing.
//!
//! Sitemap indexes are walked recursively. Sub-sitemaps are cached with
//! their `lastmod` so an unchanged sub-sitemap is never refetched; a
//! missing `lastmod` compares as unknown and forces a refetch.

use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::Client;
use url::Url;

use crate::robots::Robots;
use crate::types::{CachedSitemap, SitemapCache, SitemapEntry};

const MAX_INDEX_DEPTH: usize = 3;

#[derive(Debug, PartialEq)]
pub(crate) enum ParsedSitemap {
    /// `<sitemapindex>`: entries point at sub-sitemaps.
    Index(Vec<SitemapEntry>),
    /// `<urlset>`: entries are page URLs.
    UrlSet(Vec<SitemapEntry>),
}

/// Parse one sitemap document, returning `None` on malformed XML.
pub(crate) fn parse_sitemap_xml(xml: &str) -> Option<ParsedSitemap> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut is_index = false;
    let mut saw_root = false;
    let mut entries = Vec::new();

    let mut current_field: Option<&'static str> = None;
    let mut loc = None;
    let mut lastmod = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => match start.name().as_ref() {
                b"sitemapindex" => {
                    is_index = true;
                    saw_root = true;
                }
                b"urlset" => saw_root = true,
                b"url" | b"sitemap" => {
                    loc = None;
                    lastmod = None;
                }
                b"loc" => current_field = Some("loc"),
                b"lastmod" => current_field = Some("lastmod"),
                _ => current_field = None,
            },
            Ok(Event::Text(text)) => {
                let value = text.unescape().ok()?.trim().to_string();
                match current_field {
                    Some("loc") => loc = Some(value),
                    Some("lastmod") => lastmod = Some(value),
                    _ => {}
                }
            }
            Ok(Event::End(end)) => match end.name().as_ref() {
                b"url" | b"sitemap" => {
                    if let Some(url) = loc.take() {
                        entries.push(SitemapEntry {
                            url,
                            lastmod: lastmod.take(),
                        });
                    }
                }
                b"loc" | b"lastmod" => current_field = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("Malformed sitemap XML: {e}");
                return None;
            }
        }
    }

    if !saw_root {
        return None;
    }

    Some(if is_index {
        ParsedSitemap::Index(entries)
    } else {
        ParsedSitemap::UrlSet(entries)
    })
}

/// Discover page URLs via sitemaps, merged across all sub-sitemaps and
/// globally sorted by `lastmod` descending. Returns `None` when no
/// sitemap exists so the caller can fall back to recursive crawling.
pub(crate) async fn discover(
    client: &Client,
    base: &Url,
    robots: &Robots,
    cache: &mut SitemapCache,
) -> Option<Vec<SitemapEntry>> {
    let mut roots = robots.sitemaps.clone();

    if roots.is_empty() {
        let probe = base.join("/sitemap.xml").ok()?;
        roots.push(probe.to_string());
    }

    // (url, lastmod from the parent index, depth)
    let mut worklist: Vec<(String, Option<String>, usize)> = roots.into_iter().map(|url| (url, None, 0)).collect();

    let mut pages: Vec<SitemapEntry> = Vec::new();
    let mut fetched_any = false;

    while let Some((sitemap_url, index_lastmod, depth)) = worklist.pop() {
        if depth > MAX_INDEX_DEPTH {
            log::warn!("Sitemap index nesting exceeds {MAX_INDEX_DEPTH}; skipping {sitemap_url}");
            continue;
        }

        // Unchanged sub-sitemaps come straight from the cache.
        if let (Some(cached), Some(lastmod)) = (cache.sitemaps.get(&sitemap_url), &index_lastmod)
            && cached.lastmod.as_ref() == Some(lastmod)
        {
            log::debug!("Sub-sitemap unchanged, using cache: {sitemap_url}");
            pages.extend(cached.urls.iter().cloned());
            fetched_any = true;
            continue;
        }

        let body = match client.get(&sitemap_url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    log::debug!("Sitemap body unreadable for {sitemap_url}: {e}");
                    continue;
                }
            },
            Ok(response) => {
                log::debug!("Sitemap {sitemap_url} returned {}", response.status());
                continue;
            }
            Err(e) => {
                log::debug!("Sitemap fetch failed for {sitemap_url}: {e}");
                continue;
            }
        };

        match parse_sitemap_xml(&body) {
            Some(ParsedSitemap::Index(subs)) => {
                fetched_any = true;
                for sub in subs {
                    worklist.push((sub.url, sub.lastmod, depth + 1));
                }
            }
            Some(ParsedSitemap::UrlSet(urls)) => {
                fetched_any = true;
                cache.sitemaps.insert(
                    sitemap_url,
                    CachedSitemap {
                        lastmod: index_lastmod,
                        urls: urls.clone(),
                    },
                );
                pages.extend(urls);
            }
            None => log::debug!("Ignoring unparseable sitemap at {sitemap_url}"),
        }
    }

    if !fetched_any {
        return None;
    }

    Some(sort_and_dedup(pages))
}

/// Global `lastmod`-descending order, so any page cap keeps the freshest
/// content; duplicates keep their freshest entry.
pub(crate) fn sort_and_dedup(mut entries: Vec<SitemapEntry>) -> Vec<SitemapEntry> {
    entries.sort_by(|a, b| b.lastmod.cmp(&a.lastmod));

    let mut seen = std::collections::HashSet::new();
    entries.retain(|entry| seen.insert(entry.url.clone()));
    entries
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn parses_urlset_with_lastmod() {
        let xml = indoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://docs.example.com/a</loc><lastmod>2025-06-01</lastmod></url>
              <url><loc>https://docs.example.com/b</loc></url>
            </urlset>
        "#};

        let parsed = parse_sitemap_xml(xml).unwrap();
        let ParsedSitemap::UrlSet(entries) = parsed else {
            unreachable!("urlset expected");
        };

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, "https://docs.example.com/a");
        assert_eq!(entries[0].lastmod.as_deref(), Some("2025-06-01"));
        assert_eq!(entries[1].lastmod, None);
    }

    #[test]
    fn parses_sitemap_index() {
        let xml = indoc! {r#"
            <sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <sitemap><loc>https://docs.example.com/sitemap-1.xml</loc><lastmod>2025-05-01</lastmod></sitemap>
            </sitemapindex>
        "#};

        let parsed = parse_sitemap_xml(xml).unwrap();
        assert_eq!(
            parsed,
            ParsedSitemap::Index(vec![SitemapEntry {
                url: "https://docs.example.com/sitemap-1.xml".to_string(),
                lastmod: Some("2025-05-01".to_string()),
            }])
        );
    }

    #[test]
    fn rejects_non_sitemap_xml() {
        assert!(parse_sitemap_xml("<html><body>nope</body></html>").is_none());
        assert!(parse_sitemap_xml("not xml at all").is_none());
    }

    #[test]
    fn sort_keeps_freshest_first_and_dedups() {
        let entries = vec![
            SitemapEntry {
                url: "https://e.com/old".to_string(),
                lastmod: Some("2024-01-01".to_string()),
            },
            SitemapEntry {
                url: "https://e.com/unknown".to_string(),
                lastmod: None,
            },
            SitemapEntry {
                url: "https://e.com/new".to_string(),
                lastmod: Some("2025-06-01".to_string()),
            },
            SitemapEntry {
                url: "https://e.com/new".to_string(),
                lastmod: Some("2025-01-01".to_string()),
            },
        ];

        let sorted = sort_and_dedup(entries);

        assert_eq!(sorted.len(), 3);
        assert_eq!(sorted[0].url, "https://e.com/new");
        assert_eq!(sorted[0].lastmod.as_deref(), Some("2025-06-01"));
        assert_eq!(sorted[2].url, "https://e.com/unknown");
    }
}
