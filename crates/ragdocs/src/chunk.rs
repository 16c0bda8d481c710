//! Semantic chunking.
//!
//! The extracted HTML is walked in document order with a heading stack.
//! Each section (one heading until the next of equal or higher level)
//! packs into parent chunks near the parent target; parents split into
//! child chunks near the child target with a lower bound. Code and table
//! blocks are atomic. Chunk ids are content-position hashes, stable
//! across rebuilds of identical content.

use scraper::ego_tree::NodeRef;
use scraper::{ElementRef, Html, Node};

use crate::store::sha256_hex;
use crate::tokenizer::{count_tokens, split_sentences};
use crate::types::{Chunk, ChunkMetadata, ParentChunk};

/// Absolute parent cap; never exceeded except by a single atomic block.
const PARENT_CAP_TOKENS: usize = 1200;

/// Elements whose subtrees are boilerplate, never content.
const BOILERPLATE_TAGS: &[&str] = &["nav", "footer", "aside", "script", "style", "noscript"];

/// Class/id fragments marking boilerplate containers.
const BOILERPLATE_MARKERS: &[&str] = &["sidebar", "toc", "breadcrumb", "table-of-contents"];

#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkerConfig {
    pub parent_target: usize,
    pub parent_min: usize,
    pub child_target: usize,
    pub child_min: usize,
}

impl From<&config::RagConfig> for ChunkerConfig {
    fn from(config: &config::RagConfig) -> Self {
        Self {
            parent_target: config.parent_chunk_size,
            parent_min: config.parent_chunk_min_tokens,
            child_target: config.child_chunk_size,
            child_min: config.child_chunk_min_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ChunkedPage {
    pub parents: Vec<ParentChunk>,
    pub children: Vec<Chunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Code,
    Table,
}

#[derive(Debug, Clone)]
struct Block {
    kind: BlockKind,
    text: String,
    tokens: usize,
}

#[derive(Debug, Default)]
struct Section {
    heading_path: Vec<String>,
    blocks: Vec<Block>,
}

/// Chunk one extracted page.
pub(crate) fn chunk_page(url: &str, extracted_html: &str, config: &ChunkerConfig) -> ChunkedPage {
    let sections = collect_sections(extracted_html);
    let doc_type = doc_type_of(url);

    let mut page = ChunkedPage {
        parents: Vec::new(),
        children: Vec::new(),
    };
    let mut parent_seq = 0usize;
    let mut child_seq = 0usize;

    for section in &sections {
        for parent_blocks in pack_parents(&section.blocks, config.parent_target, config.parent_min) {
            let parent_text = join_blocks(&parent_blocks);
            let parent_tokens = count_tokens(&parent_text);
            let parent_id = chunk_id(url, &section.heading_path, "p", parent_seq);
            parent_seq += 1;

            let code_identifiers = collect_identifiers(&parent_blocks);

            let parent_metadata = ChunkMetadata {
                url: url.to_string(),
                heading_path: section.heading_path.clone(),
                doc_type: doc_type.clone(),
                code_identifiers: code_identifiers.clone(),
                is_parent: true,
                is_parent_as_child: false,
                tombstoned: false,
            };

            page.parents.push(ParentChunk {
                parent_id: parent_id.clone(),
                text: parent_text.clone(),
                metadata: parent_metadata,
            });

            let pieces = split_children(&parent_blocks, config);

            // Too small to split: the parent doubles as its own child so
            // its content stays searchable.
            let parent_as_child = pieces.len() == 1 && count_tokens(&pieces[0]) == parent_tokens;

            if parent_as_child {
                let id = chunk_id(url, &section.heading_path, "c", child_seq);
                child_seq += 1;

                page.children.push(Chunk {
                    chunk_id: id,
                    parent_id: Some(parent_id.clone()),
                    text: parent_text.clone(),
                    token_count: parent_tokens,
                    context_prefix: None,
                    metadata: ChunkMetadata {
                        url: url.to_string(),
                        heading_path: section.heading_path.clone(),
                        doc_type: doc_type.clone(),
                        code_identifiers: code_identifiers.clone(),
                        is_parent: false,
                        is_parent_as_child: true,
                        tombstoned: false,
                    },
                });
                continue;
            }

            for piece in pieces {
                let id = chunk_id(url, &section.heading_path, "c", child_seq);
                child_seq += 1;

                let token_count = count_tokens(&piece);
                page.children.push(Chunk {
                    chunk_id: id,
                    parent_id: Some(parent_id.clone()),
                    text: piece,
                    token_count,
                    context_prefix: None,
                    metadata: ChunkMetadata {
                        url: url.to_string(),
                        heading_path: section.heading_path.clone(),
                        doc_type: doc_type.clone(),
                        code_identifiers: code_identifiers.clone(),
                        is_parent: false,
                        is_parent_as_child: false,
                        tombstoned: false,
                    },
                });
            }
        }
    }

    page
}

/// Stable id: truncated SHA-256 over (url, heading path, local index).
pub(crate) fn chunk_id(url: &str, heading_path: &[String], kind: &str, index: usize) -> String {
    let key = format!("{url}|{}|{kind}:{index}", heading_path.join(" > "));
    sha256_hex(key.as_bytes())[..32].to_string()
}

fn doc_type_of(url: &str) -> String {
    let lowered = url.to_ascii_lowercase();

    if lowered.contains("/api/") || lowered.contains("/reference/") {
        "reference".to_string()
    } else if lowered.contains("/blog/") || lowered.contains("/changelog/") {
        "post".to_string()
    } else {
        "page".to_string()
    }
}

fn join_blocks(blocks: &[Block]) -> String {
    blocks
        .iter()
        .map(|block| block.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Pack section blocks into parents near the target, never exceeding the
/// absolute cap except for a single oversized atomic block. A trailing
/// parent under the lower bound merges into its predecessor.
fn pack_parents(blocks: &[Block], parent_target: usize, parent_min: usize) -> Vec<Vec<Block>> {
    let mut parents = Vec::new();
    let mut current: Vec<Block> = Vec::new();
    let mut current_tokens = 0usize;

    let mut flush = |current: &mut Vec<Block>, current_tokens: &mut usize, parents: &mut Vec<Vec<Block>>| {
        if !current.is_empty() {
            parents.push(std::mem::take(current));
            *current_tokens = 0;
        }
    };

    for block in blocks {
        // Oversized text splits on sentence boundaries; atomic blocks
        // stand alone when they exceed the cap.
        if block.tokens > PARENT_CAP_TOKENS {
            if block.kind == BlockKind::Text {
                for piece in split_text_by_tokens(&block.text, parent_target) {
                    let tokens = count_tokens(&piece);
                    flush(&mut current, &mut current_tokens, &mut parents);
                    parents.push(vec![Block {
                        kind: BlockKind::Text,
                        text: piece,
                        tokens,
                    }]);
                }
            } else {
                flush(&mut current, &mut current_tokens, &mut parents);
                parents.push(vec![block.clone()]);
            }
            continue;
        }

        if current_tokens + block.tokens > parent_target && !current.is_empty() {
            flush(&mut current, &mut current_tokens, &mut parents);
        }

        current_tokens += block.tokens;
        current.push(block.clone());
    }

    flush(&mut current, &mut current_tokens, &mut parents);

    if parents.len() >= 2 {
        let last_tokens: usize = parents[parents.len() - 1].iter().map(|b| b.tokens).sum();
        if last_tokens < parent_min {
            let runt = parents.pop().unwrap_or_default();
            if let Some(previous) = parents.last_mut() {
                previous.extend(runt);
            }
        }
    }

    parents
}

/// Split a parent's blocks into child texts near the child target with
/// the configured lower bound. Code and table blocks are never split.
fn split_children(blocks: &[Block], config: &ChunkerConfig) -> Vec<String> {
    let mut pieces: Vec<(String, usize)> = Vec::new();

    for block in blocks {
        if block.kind != BlockKind::Text || block.tokens <= config.child_target {
            pieces.push((block.text.clone(), block.tokens));
            continue;
        }

        for piece in split_text_by_tokens(&block.text, config.child_target) {
            let tokens = count_tokens(&piece);
            pieces.push((piece, tokens));
        }
    }

    // Merge undersized pieces into their successor until the lower bound
    // is met.
    let mut merged: Vec<(String, usize)> = Vec::new();
    for (text, tokens) in pieces {
        match merged.last_mut() {
            Some((last_text, last_tokens)) if *last_tokens < config.child_min => {
                last_text.push_str("\n\n");
                last_text.push_str(&text);
                *last_tokens += tokens;
            }
            _ => merged.push((text, tokens)),
        }
    }

    // A trailing runt merges backwards.
    if merged.len() >= 2 && merged[merged.len() - 1].1 < config.child_min {
        let (runt_text, runt_tokens) = merged.pop().unwrap_or_default();
        if let Some((last_text, last_tokens)) = merged.last_mut() {
            last_text.push_str("\n\n");
            last_text.push_str(&runt_text);
            *last_tokens += runt_tokens;
        }
    }

    merged.into_iter().map(|(text, _)| text).collect()
}

/// Greedy sentence packing up to `target` tokens per piece.
fn split_text_by_tokens(text: &str, target: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;

    for sentence in split_sentences(text) {
        let tokens = count_tokens(&sentence);

        if current_tokens + tokens > target && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
            current_tokens = 0;
        }

        current.push_str(&sentence);
        current_tokens += tokens;
    }

    if !current.trim().is_empty() {
        pieces.push(current);
    }

    pieces
}

fn collect_identifiers(blocks: &[Block]) -> Vec<String> {
    let mut identifiers = Vec::new();

    for block in blocks.iter().filter(|b| b.kind == BlockKind::Code) {
        let mut token = String::new();

        for c in block.text.chars().chain([' ']) {
            if c.is_alphanumeric() || c == '_' {
                token.push(c);
            } else {
                if token.len() > 2
                    && token.chars().next().is_some_and(|first| first.is_alphabetic() || first == '_')
                    && !identifiers.contains(&token)
                {
                    identifiers.push(token.clone());
                }
                token.clear();
            }
        }
    }

    identifiers.truncate(24);
    identifiers
}

fn collect_sections(html: &str) -> Vec<Section> {
    let document = Html::parse_document(html);

    let mut sections = Vec::new();
    let mut heading_stack: Vec<(u8, String)> = Vec::new();
    let mut current = Section::default();

    walk(document.tree.root(), &mut sections, &mut heading_stack, &mut current);

    if !current.blocks.is_empty() {
        sections.push(current);
    }

    sections
}

fn walk(node: NodeRef<'_, Node>, sections: &mut Vec<Section>, stack: &mut Vec<(u8, String)>, current: &mut Section) {
    for child in node.children() {
        let Some(element) = ElementRef::wrap(child) else {
            walk(child, sections, stack, current);
            continue;
        };

        let tag = element.value().name();

        if is_boilerplate(&element) {
            continue;
        }

        if let Some(level) = heading_level(tag) {
            let text = collapse_whitespace(&element.text().collect::<String>());

            if !current.blocks.is_empty() {
                sections.push(std::mem::take(current));
            }

            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            stack.push((level, text));

            *current = Section {
                heading_path: stack.iter().map(|(_, t)| t.clone()).collect(),
                blocks: Vec::new(),
            };
            continue;
        }

        match tag {
            "pre" => push_block(current, BlockKind::Code, &element.text().collect::<String>()),
            "table" => push_block(current, BlockKind::Table, &table_text(&element)),
            "p" | "ul" | "ol" | "blockquote" | "dl" => {
                // Heading path of the enclosing section; capture the whole
                // block, nested markup included, and stop descending.
                push_block(current, BlockKind::Text, &collapse_whitespace(&element.text().collect::<String>()));
            }
            _ => walk(child, sections, stack, current),
        }
    }
}

fn push_block(section: &mut Section, kind: BlockKind, text: &str) {
    let text = match kind {
        // Code keeps its layout; prose collapses.
        BlockKind::Code => text.trim_end().to_string(),
        _ => text.to_string(),
    };

    if text.trim().is_empty() {
        return;
    }

    let tokens = count_tokens(&text);
    section.blocks.push(Block { kind, text, tokens });
}

fn table_text(element: &ElementRef<'_>) -> String {
    let mut rows = Vec::new();

    for row in element.select(&selector("tr")) {
        let cells: Vec<String> = row
            .select(&selector("th, td"))
            .map(|cell| collapse_whitespace(&cell.text().collect::<String>()))
            .collect();

        if !cells.is_empty() {
            rows.push(cells.join(" | "));
        }
    }

    rows.join("\n")
}

fn selector(css: &str) -> scraper::Selector {
    scraper::Selector::parse(css).expect("static selectors are valid")
}

fn heading_level(tag: &str) -> Option<u8> {
    match tag {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn is_boilerplate(element: &ElementRef<'_>) -> bool {
    if BOILERPLATE_TAGS.contains(&element.value().name()) {
        return true;
    }

    let classes = element.value().attr("class").unwrap_or("").to_ascii_lowercase();
    let id = element.value().attr("id").unwrap_or("").to_ascii_lowercase();

    BOILERPLATE_MARKERS
        .iter()
        .any(|marker| classes.contains(marker) || id.contains(marker))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn config() -> ChunkerConfig {
        ChunkerConfig {
            parent_target: 900,
            parent_min: 200,
            child_target: 350,
            child_min: 150,
        }
    }

    const PAGE: &str = indoc! {r#"
        <html><body>
        <p>Intro paragraph before any heading.</p>
        <nav><a href="/">skip me</a></nav>
        <h1>Getting Started</h1>
        <p>Install the gateway with your package manager.</p>
        <h2>Configuration</h2>
        <p>Set the backend endpoint before starting.</p>
        <pre>TOOLGATE_BACKEND_ENDPOINT=http://localhost:11434</pre>
        <div class="sidebar"><p>boilerplate links</p></div>
        <h1>Reference</h1>
        <table><tr><th>Key</th><th>Default</th></tr><tr><td>bind_port</td><td>8000</td></tr></table>
        </body></html>
    "#};

    #[test]
    fn heading_paths_track_the_stack() {
        let page = chunk_page("https://docs.example.com/guide", PAGE, &config());

        let paths: Vec<Vec<String>> = page.parents.iter().map(|p| p.metadata.heading_path.clone()).collect();

        assert!(paths.contains(&vec![])); // intro section
        assert!(paths.contains(&vec!["Getting Started".to_string()]));
        assert!(paths.contains(&vec!["Getting Started".to_string(), "Configuration".to_string()]));
        assert!(paths.contains(&vec!["Reference".to_string()]));
    }

    #[test]
    fn boilerplate_is_stripped() {
        let page = chunk_page("https://docs.example.com/guide", PAGE, &config());

        for parent in &page.parents {
            assert!(!parent.text.contains("skip me"));
            assert!(!parent.text.contains("boilerplate links"));
        }
    }

    #[test]
    fn code_and_tables_survive_atomically() {
        let page = chunk_page("https://docs.example.com/guide", PAGE, &config());
        let all_text: String = page.parents.iter().map(|p| p.text.as_str()).collect::<Vec<_>>().join("\n");

        assert!(all_text.contains("TOOLGATE_BACKEND_ENDPOINT=http://localhost:11434"));
        assert!(all_text.contains("Key | Default"));
        assert!(all_text.contains("bind_port | 8000"));
    }

    #[test]
    fn chunk_ids_are_deterministic() {
        let first = chunk_page("https://docs.example.com/guide", PAGE, &config());
        let second = chunk_page("https://docs.example.com/guide", PAGE, &config());

        let ids_first: Vec<&String> = first.children.iter().map(|c| &c.chunk_id).collect();
        let ids_second: Vec<&String> = second.children.iter().map(|c| &c.chunk_id).collect();

        assert_eq!(ids_first, ids_second);
        assert!(ids_first.iter().all(|id| id.len() == 32));
    }

    #[test]
    fn different_urls_produce_different_ids() {
        let a = chunk_page("https://docs.example.com/a", PAGE, &config());
        let b = chunk_page("https://docs.example.com/b", PAGE, &config());

        assert_ne!(a.children[0].chunk_id, b.children[0].chunk_id);
    }

    #[test]
    fn small_parents_become_their_own_children() {
        let page = chunk_page("https://docs.example.com/guide", PAGE, &config());

        // Every section here is tiny, so each parent is indexed as its
        // own child.
        assert!(!page.children.is_empty());
        for child in &page.children {
            assert!(child.metadata.is_parent_as_child);
            assert_eq!(
                page.parents
                    .iter()
                    .find(|p| Some(&p.parent_id) == child.parent_id.as_ref())
                    .map(|p| p.text.as_str()),
                Some(child.text.as_str())
            );
        }
    }

    #[test]
    fn every_child_references_an_existing_parent() {
        let page = chunk_page("https://docs.example.com/guide", PAGE, &config());

        for child in &page.children {
            let parent_id = child.parent_id.as_ref().unwrap();
            assert!(page.parents.iter().any(|p| &p.parent_id == parent_id));
        }
    }

    #[test]
    fn code_identifiers_are_collected() {
        let page = chunk_page("https://docs.example.com/guide", PAGE, &config());

        let config_parent = page
            .parents
            .iter()
            .find(|p| p.metadata.heading_path.last().map(String::as_str) == Some("Configuration"))
            .unwrap();

        assert!(
            config_parent
                .metadata
                .code_identifiers
                .iter()
                .any(|id| id == "TOOLGATE_BACKEND_ENDPOINT")
        );
    }
}
