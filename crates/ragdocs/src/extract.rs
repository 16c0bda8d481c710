//! Primary-content extraction.
//!
//! Readability does the heavy lifting; two guardrails catch the cases
//! where it guts documentation pages (tiny output, or dropped code
//! blocks), falling back through known content containers down to the
//! raw HTML. Boilerplate elements are skipped later, during the chunk
//! walk.

use std::io::Cursor;

use scraper::{Html, Selector};
use url::Url;

const MIN_EXTRACTED_BYTES: usize = 100;

/// Containers tried, in order, when readability output fails a guardrail.
const FALLBACK_SELECTORS: &[&str] = &[
    "div.main-content",
    "div[role='main']",
    "div#content",
    "article",
    "main",
];

/// Extract the main content of a page as an HTML fragment.
pub(crate) fn extract_content(html: &str, url: &Url) -> String {
    let source_code_blocks = count_code_blocks(html);

    let mut cursor = Cursor::new(html.as_bytes().to_vec());
    let extracted = match readability::extractor::extract(&mut cursor, url) {
        Ok(product) => product.content,
        Err(e) => {
            log::debug!("Readability failed for {url}: {e}");
            return fallback_content(html, url);
        }
    };

    if extracted.len() < MIN_EXTRACTED_BYTES {
        log::debug!("Readability output under {MIN_EXTRACTED_BYTES} bytes for {url}; falling back");
        return fallback_content(html, url);
    }

    let kept_code_blocks = count_code_blocks(&extracted);
    if source_code_blocks > 0 && kept_code_blocks * 2 < source_code_blocks {
        log::debug!(
            "Readability kept {kept_code_blocks}/{source_code_blocks} code blocks for {url}; falling back"
        );
        return fallback_content(html, url);
    }

    extracted
}

fn fallback_content(html: &str, url: &Url) -> String {
    let document = Html::parse_document(html);

    for selector in FALLBACK_SELECTORS {
        let Ok(parsed) = Selector::parse(selector) else {
            continue;
        };

        if let Some(element) = document.select(&parsed).next() {
            log::debug!("Using fallback container '{selector}' for {url}");
            return element.html();
        }
    }

    log::debug!("No content container found for {url}; indexing raw HTML");
    html.to_string()
}

pub(crate) fn count_code_blocks(html: &str) -> usize {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("pre") else {
        return 0;
    };
    document.select(&selector).count()
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn url() -> Url {
        Url::parse("https://docs.example.com/guide").unwrap()
    }

    #[test]
    fn tiny_extraction_falls_back_to_article() {
        let html = indoc! {r#"
            <html><body>
            <nav>irrelevant</nav>
            <article><h1>Guide</h1><p>Real content lives here and keeps going long enough to matter.</p></article>
            </body></html>
        "#};

        let content = extract_content(html, &url());
        assert!(content.contains("Real content"));
    }

    #[test]
    fn code_blocks_are_counted() {
        let html = "<html><body><pre>a</pre><p>x</p><pre>b</pre></body></html>";
        assert_eq!(count_code_blocks(html), 2);
    }

    #[test]
    fn missing_containers_fall_back_to_raw_html() {
        let html = "<html><body><p>tiny</p></body></html>";
        let content = extract_content(html, &url());
        assert!(content.contains("tiny"));
    }
}
