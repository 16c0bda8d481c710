//! Minimal robots.txt handling.
//!
//! Only two things matter here: `Sitemap:` directives for discovery and
//! `Disallow:` rules under the wildcard user-agent. A robots.txt that
//! fails to load never blocks the crawl (fail-open).

use reqwest::Client;
use url::Url;

#[derive(Debug, Default, Clone)]
pub(crate) struct Robots {
    pub sitemaps: Vec<String>,
    disallow: Vec<String>,
}

impl Robots {
    /// Fetch and parse `<base>/robots.txt`. Any failure yields the
    /// permissive default.
    pub(crate) async fn load(client: &Client, base: &Url) -> Robots {
        let Ok(robots_url) = base.join("/robots.txt") else {
            return Robots::default();
        };

        let body = match client.get(robots_url.clone()).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    log::debug!("robots.txt body unreadable ({e}); crawling without it");
                    return Robots::default();
                }
            },
            Ok(response) => {
                log::debug!("robots.txt returned {}; crawling without it", response.status());
                return Robots::default();
            }
            Err(e) => {
                log::debug!("robots.txt fetch failed ({e}); crawling without it");
                return Robots::default();
            }
        };

        Robots::parse(&body)
    }

    pub(crate) fn parse(body: &str) -> Robots {
        let mut robots = Robots::default();
        let mut applies_to_us = false;

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };

            let value = value.trim();

            match field.trim().to_ascii_lowercase().as_str() {
                "sitemap" => {
                    if !value.is_empty() {
                        robots.sitemaps.push(value.to_string());
                    }
                }
                "user-agent" => applies_to_us = value == "*",
                "disallow" if applies_to_us && !value.is_empty() => {
                    robots.disallow.push(value.to_string());
                }
                _ => {}
            }
        }

        robots
    }

    /// Whether the wildcard rules permit fetching `url`.
    pub(crate) fn allows(&self, url: &Url) -> bool {
        let path = url.path();
        !self.disallow.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn parses_sitemaps_and_wildcard_rules() {
        let robots = Robots::parse(indoc! {"
            Sitemap: https://docs.example.com/sitemap.xml

            User-agent: googlebot
            Disallow: /only-for-google

            User-agent: *
            Disallow: /internal/
            Disallow: /drafts # trailing comment
        "});

        assert_eq!(robots.sitemaps, vec!["https://docs.example.com/sitemap.xml"]);

        let blocked = Url::parse("https://docs.example.com/internal/page").unwrap();
        let open = Url::parse("https://docs.example.com/guide").unwrap();
        let google_only = Url::parse("https://docs.example.com/only-for-google").unwrap();

        assert!(!robots.allows(&blocked));
        assert!(robots.allows(&open));
        assert!(robots.allows(&google_only));
    }

    #[test]
    fn default_is_permissive() {
        let robots = Robots::default();
        let url = Url::parse("https://docs.example.com/anything").unwrap();
        assert!(robots.allows(&url));
    }
}
