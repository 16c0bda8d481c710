//! Environment-variable configuration loading.
//!
//! Every recognised option maps one `TOOLGATE_*` variable onto a path in
//! the configuration tree. The variables are collected into a
//! [`toml::Value`] and deserialised in one pass so type errors carry the
//! usual serde diagnostics.

use std::str::FromStr;

use anyhow::{Context, bail};
use serde::Deserialize;
use toml::Value;

use crate::{Config, rag::MIN_UPDATE_INTERVAL};

const ENV_PREFIX: &str = "TOOLGATE_";

#[derive(Clone, Copy)]
enum Kind {
    String,
    Integer,
    Float,
    Bool,
    StringList,
}

/// Recognised variables: env suffix, config path, value kind.
const KEYS: &[(&str, &str, Kind)] = &[
    ("BIND_HOST", "server.bind_host", Kind::String),
    ("BIND_PORT", "server.bind_port", Kind::Integer),
    (
        "HEALTH_CHECK_ON_STARTUP",
        "server.health_check_on_startup",
        Kind::Bool,
    ),
    ("BACKEND_TYPE", "backend.backend_type", Kind::String),
    ("BACKEND_ENDPOINT", "backend.endpoint", Kind::String),
    ("BACKEND_MODEL", "backend.model", Kind::String),
    ("BACKEND_CONNECT_TIMEOUT", "backend.connect_timeout", Kind::Integer),
    ("BACKEND_READ_TIMEOUT", "backend.read_timeout", Kind::Integer),
    ("BACKEND_RETRY_ATTEMPTS", "backend.retry_attempts", Kind::Integer),
    (
        "BACKEND_RETRY_INITIAL_DELAY",
        "backend.retry_initial_delay",
        Kind::Integer,
    ),
    ("MAX_TOOL_ITERATIONS", "chat.max_tool_iterations", Kind::Integer),
    ("TOOL_LOOP_TIMEOUT", "chat.tool_loop_timeout", Kind::Integer),
    (
        "FIRST_ITERATION_TOOL_CHOICE",
        "chat.first_iteration_tool_choice",
        Kind::String,
    ),
    ("MAX_TOOL_RESULT_CHARS", "chat.max_tool_result_chars", Kind::Integer),
    ("SYSTEM_PROMPT_PATH", "chat.system_prompt_path", Kind::String),
    ("SYSTEM_PROMPT_DEFAULT", "chat.system_prompt_default", Kind::String),
    ("DEFAULT_TEMPERATURE", "chat.default_temperature", Kind::Float),
    ("RAG_ENABLED", "rag.enabled", Kind::Bool),
    ("BASE_URL", "rag.base_url", Kind::String),
    ("CACHE_DIR", "rag.cache_dir", Kind::String),
    ("MAX_CRAWL_DEPTH", "rag.max_crawl_depth", Kind::Integer),
    ("MAX_PAGES", "rag.max_pages", Kind::Integer),
    ("REQUEST_TIMEOUT", "rag.request_timeout", Kind::Integer),
    ("PAGE_CACHE_TTL_HOURS", "rag.page_cache_ttl_hours", Kind::Integer),
    ("UPDATE_INTERVAL_HOURS", "rag.update_interval_hours", Kind::Float),
    ("UPDATE_BATCH_SIZE", "rag.update_batch_size", Kind::Integer),
    ("REBUILD_THRESHOLD", "rag.rebuild_threshold", Kind::Float),
    ("CHILD_CHUNK_SIZE", "rag.child_chunk_size", Kind::Integer),
    ("PARENT_CHUNK_SIZE", "rag.parent_chunk_size", Kind::Integer),
    ("CHILD_CHUNK_MIN_TOKENS", "rag.child_chunk_min_tokens", Kind::Integer),
    (
        "PARENT_CHUNK_MIN_TOKENS",
        "rag.parent_chunk_min_tokens",
        Kind::Integer,
    ),
    ("HYBRID_LEXICAL_WEIGHT", "rag.hybrid_lexical_weight", Kind::Float),
    ("HYBRID_SEMANTIC_WEIGHT", "rag.hybrid_semantic_weight", Kind::Float),
    ("SEARCH_TOP_K", "rag.search_top_k", Kind::Integer),
    (
        "RETRIEVER_CANDIDATE_MULTIPLIER",
        "rag.retriever_candidate_multiplier",
        Kind::Integer,
    ),
    ("RERANK_ENABLED", "rag.rerank_enabled", Kind::Bool),
    ("EMBEDDING_MODEL", "rag.embedding_model", Kind::String),
    ("RERANK_MODEL", "rag.rerank_model", Kind::String),
    (
        "CONTEXTUAL_RETRIEVAL_ENABLED",
        "rag.contextual_retrieval_enabled",
        Kind::Bool,
    ),
    ("MANUAL_URLS", "rag.manual_urls", Kind::StringList),
    ("MANUAL_URLS_EXCLUSIVE", "rag.manual_urls_exclusive", Kind::Bool),
];

/// Variables the binary consumes directly; not configuration keys.
const PASSTHROUGH: &[&str] = &["LOG"];

pub(crate) fn from_env() -> anyhow::Result<Config> {
    let vars: Vec<(String, String)> = std::env::vars()
        .filter(|(name, _)| name.starts_with(ENV_PREFIX))
        .collect();

    from_vars(&vars)
}

fn from_vars(vars: &[(String, String)]) -> anyhow::Result<Config> {
    let mut root = toml::Table::new();

    for (name, raw) in vars {
        let suffix = &name[ENV_PREFIX.len()..];

        if PASSTHROUGH.contains(&suffix) {
            continue;
        }

        let Some((_, path, kind)) = KEYS.iter().find(|(key, _, _)| *key == suffix) else {
            bail!("Unrecognised configuration variable '{name}'");
        };

        let value = parse_value(raw, *kind).with_context(|| format!("Invalid value for '{name}'"))?;
        insert(&mut root, path, value);
    }

    let config = Config::deserialize(Value::Table(root))?;

    Ok(config)
}

fn parse_value(raw: &str, kind: Kind) -> anyhow::Result<Value> {
    let value = match kind {
        Kind::String => Value::String(raw.to_string()),
        Kind::Integer => Value::Integer(i64::from_str(raw.trim())?),
        Kind::Float => Value::Float(f64::from_str(raw.trim())?),
        Kind::Bool => {
            let normalized = raw.trim().to_ascii_lowercase();
            match normalized.as_str() {
                "1" | "true" | "yes" | "on" => Value::Boolean(true),
                "0" | "false" | "no" | "off" => Value::Boolean(false),
                other => bail!("expected a boolean, got '{other}'"),
            }
        }
        Kind::StringList => Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| Value::String(part.to_string()))
                .collect(),
        ),
    };

    Ok(value)
}

fn insert(root: &mut toml::Table, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut table = root;

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            table.insert(segment.to_string(), value);
            return;
        }

        table = table
            .entry(segment.to_string())
            .or_insert_with(|| Value::Table(toml::Table::new()))
            .as_table_mut()
            .expect("intermediate configuration nodes are tables");
    }
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if !config.server.is_loopback() {
        log::warn!(
            "Binding to non-loopback host '{}'. The gateway performs no authentication; \
            anyone who can reach this address can run tools.",
            config.server.bind_host
        );
    }

    if config.backend.endpoint.is_empty() {
        bail!("backend.endpoint must not be empty");
    }

    if config.chat.default_temperature < 0.0 {
        bail!(
            "chat.default_temperature must be >= 0, got {}",
            config.chat.default_temperature
        );
    }

    if config.rag.enabled {
        if config.rag.base_url.is_empty() && config.rag.manual_urls.is_empty() {
            bail!("rag.base_url (or rag.manual_urls) is required when RAG is enabled");
        }

        if !(0.0..=1.0).contains(&config.rag.rebuild_threshold) || config.rag.rebuild_threshold == 0.0 {
            bail!(
                "rag.rebuild_threshold must be in (0, 1], got {}",
                config.rag.rebuild_threshold
            );
        }

        if config.rag.hybrid_lexical_weight < 0.0 || config.rag.hybrid_semantic_weight < 0.0 {
            bail!("hybrid retriever weights must be >= 0");
        }

        if config.rag.update_interval() == MIN_UPDATE_INTERVAL
            && config.rag.update_interval_hours * 3600.0 < MIN_UPDATE_INTERVAL.as_secs_f64()
        {
            log::warn!(
                "rag.update_interval_hours = {} is below the 5 minute floor; using 5 minutes",
                config.rag.update_interval_hours
            );
        }
    }

    Ok(())
}
