//! Full-text and regex search over stored connection payloads.
//!
//! Search options are a strict sum type: a request is either a text search
//! (terms with optional exclusions, or an exact phrase) or a regex search
//! (a pattern or a negated pattern) — never both categories, never both
//! subforms. Anything else is rejected with `InvalidSearch` before any work
//! happens.

use crate::config::SearchConfig;
use crate::conntrack::conn_id::{ConnectionId, ObjectIdGen};
use crate::error::CoreError;
use crate::record::MessageRecord;
use crate::storage::{collections, DocumentStore, Filter, SortOrder};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use memchr::memmem;
use regex::bytes::RegexBuilder;
use serde::{Deserialize, Serialize};

/// Options of one search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchOptions {
    TextSearch(TextSearch),
    RegexSearch(RegexSearch),
}

/// Case-insensitive term/phrase search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextSearch {
    /// Every term must occur. Mutually exclusive with `exact_phrase`.
    #[serde(default)]
    pub terms: Vec<String>,
    /// No excluded term may occur; only valid together with `terms`.
    #[serde(default)]
    pub excluded_terms: Vec<String>,
    /// The exact phrase must occur. Mutually exclusive with `terms`.
    #[serde(default)]
    pub exact_phrase: Option<String>,
}

/// Regex match / non-match search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegexSearch {
    /// Connections whose payload matches. Mutually exclusive with
    /// `not_pattern`.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Connections whose payload does not match.
    #[serde(default)]
    pub not_pattern: Option<String>,
}

impl SearchOptions {
    /// Enforces the sum-type shape described in the module docs.
    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |reason: &str| CoreError::InvalidSearch {
            reason: reason.to_string(),
        };
        match self {
            SearchOptions::TextSearch(text) => {
                let has_terms = !text.terms.is_empty();
                let has_phrase = text.exact_phrase.is_some();
                if has_terms && has_phrase {
                    return Err(invalid("terms and exact_phrase are mutually exclusive"));
                }
                if !has_terms && !has_phrase {
                    return Err(invalid("text search requires terms or exact_phrase"));
                }
                if !text.excluded_terms.is_empty() && !has_terms {
                    return Err(invalid("excluded_terms require terms"));
                }
                if text.terms.iter().any(|t| t.is_empty())
                    || text.excluded_terms.iter().any(|t| t.is_empty())
                    || text.exact_phrase.as_deref() == Some("")
                {
                    return Err(invalid("empty search term"));
                }
                Ok(())
            }
            SearchOptions::RegexSearch(regex) => {
                match (&regex.pattern, &regex.not_pattern) {
                    (Some(_), Some(_)) => {
                        Err(invalid("pattern and not_pattern are mutually exclusive"))
                    }
                    (None, None) => Err(invalid("regex search requires pattern or not_pattern")),
                    _ => Ok(()),
                }
            }
        }
    }
}

/// A stored, completed search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformedSearch {
    pub id: String,
    pub options: SearchOptions,
    /// Connections whose payload satisfied the search.
    pub matched_connections: Vec<ConnectionId>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// `true` when the result limit or time budget cut the scan short.
    pub truncated: bool,
}

/// Executes searches against stored connections and records their results.
pub struct SearchManager {
    storage: Arc<dyn DocumentStore>,
    config: SearchConfig,
    ids: ObjectIdGen,
}

/// Compiled form of [SearchOptions].
enum SearchMatcher {
    Text {
        terms: Vec<Vec<u8>>,
        excluded: Vec<Vec<u8>>,
    },
    Phrase(Vec<u8>),
    Regex(regex::bytes::Regex),
    NotRegex(regex::bytes::Regex),
}

impl SearchMatcher {
    fn compile(options: &SearchOptions) -> Result<Self, CoreError> {
        let build_regex = |pattern: &str| {
            RegexBuilder::new(pattern)
                .unicode(false)
                .build()
                .map_err(|e| CoreError::InvalidSearch {
                    reason: e.to_string(),
                })
        };
        Ok(match options {
            SearchOptions::TextSearch(text) => match &text.exact_phrase {
                Some(phrase) => SearchMatcher::Phrase(phrase.to_lowercase().into_bytes()),
                None => SearchMatcher::Text {
                    terms: text.terms.iter().map(|t| t.to_lowercase().into_bytes()).collect(),
                    excluded: text
                        .excluded_terms
                        .iter()
                        .map(|t| t.to_lowercase().into_bytes())
                        .collect(),
                },
            },
            SearchOptions::RegexSearch(regex) => match (&regex.pattern, &regex.not_pattern) {
                (Some(pattern), None) => SearchMatcher::Regex(build_regex(pattern)?),
                (None, Some(pattern)) => SearchMatcher::NotRegex(build_regex(pattern)?),
                _ => unreachable!("validated options"),
            },
        })
    }

    /// `payload` is the raw concatenated connection payload;
    /// `payload_lower` its ASCII-lowercased copy (text matching is
    /// case-insensitive).
    fn matches(&self, payload: &[u8], payload_lower: &[u8]) -> bool {
        match self {
            SearchMatcher::Text { terms, excluded } => {
                terms
                    .iter()
                    .all(|t| memmem::find(payload_lower, t).is_some())
                    && excluded
                        .iter()
                        .all(|t| memmem::find(payload_lower, t).is_none())
            }
            SearchMatcher::Phrase(phrase) => memmem::find(payload_lower, phrase).is_some(),
            SearchMatcher::Regex(regex) => regex.is_match(payload),
            SearchMatcher::NotRegex(regex) => !regex.is_match(payload),
        }
    }
}

impl SearchManager {
    pub(crate) fn new(storage: Arc<dyn DocumentStore>, config: SearchConfig) -> Self {
        SearchManager {
            storage,
            config,
            ids: ObjectIdGen::new(),
        }
    }

    /// Runs a search over every stored connection (newest first) until the
    /// result limit or time budget is reached, then persists and returns
    /// the result.
    pub fn perform_search(&self, options: SearchOptions) -> Result<PerformedSearch, CoreError> {
        options.validate()?;
        let matcher = SearchMatcher::compile(&options)?;

        let started_at = Utc::now();
        let deadline = Instant::now() + Duration::from_millis(self.config.timeout);

        let connections = self
            .storage
            .find(
                collections::CONNECTIONS,
                &Filter::all(),
                Some(("started_at_ms", SortOrder::Desc)),
                0,
                0,
            )
            .map_err(CoreError::storage)?;

        let mut matched = Vec::new();
        let mut truncated = false;
        for connection in &connections {
            if matched.len() >= self.config.max_results || Instant::now() >= deadline {
                truncated = true;
                break;
            }
            let Some(id) = connection
                .get("id")
                .and_then(|v| v.as_str())
                .and_then(ConnectionId::parse)
            else {
                continue;
            };

            let payload = self.connection_payload(&id)?;
            let payload_lower = payload.to_ascii_lowercase();
            if matcher.matches(&payload, &payload_lower) {
                matched.push(id);
            }
        }

        let result = PerformedSearch {
            id: self.ids.next(),
            options,
            matched_connections: matched,
            started_at,
            duration_ms: (Utc::now() - started_at).num_milliseconds().max(0) as u64,
            truncated,
        };
        let doc = serde_json::to_value(&result).map_err(CoreError::storage)?;
        self.storage
            .insert(collections::SEARCHES, doc)
            .map_err(CoreError::storage)?;
        log::info!(
            "Search {} matched {} connections in {} ms",
            result.id,
            result.matched_connections.len(),
            result.duration_ms
        );
        Ok(result)
    }

    /// Previously performed searches, newest first.
    pub fn get_performed_searches(&self) -> Result<Vec<PerformedSearch>, CoreError> {
        let docs = self
            .storage
            .find(
                collections::SEARCHES,
                &Filter::all(),
                Some(("id", SortOrder::Desc)),
                0,
                50,
            )
            .map_err(CoreError::storage)?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc).ok())
            .collect())
    }

    /// Concatenated payload of every message of the connection, in message
    /// order.
    fn connection_payload(&self, id: &ConnectionId) -> Result<Vec<u8>, CoreError> {
        let docs = self
            .storage
            .find(
                collections::MESSAGES,
                &Filter::new().eq("connection_id", id.to_string()),
                Some(("index", SortOrder::Asc)),
                0,
                0,
            )
            .map_err(CoreError::storage)?;
        let mut payload = Vec::new();
        for doc in docs {
            if let Ok(message) = serde_json::from_value::<MessageRecord>(doc) {
                payload.extend_from_slice(&message.data);
            }
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(terms: &[&str], excluded: &[&str], phrase: Option<&str>) -> SearchOptions {
        SearchOptions::TextSearch(TextSearch {
            terms: terms.iter().map(|s| s.to_string()).collect(),
            excluded_terms: excluded.iter().map(|s| s.to_string()).collect(),
            exact_phrase: phrase.map(|s| s.to_string()),
        })
    }

    #[test]
    fn core_search_validation_rejects_mixed_subforms() {
        assert!(text(&["a"], &[], Some("b")).validate().is_err());
        assert!(text(&[], &[], None).validate().is_err());
        assert!(text(&[], &["x"], None).validate().is_err());
        assert!(text(&["a"], &["x"], None).validate().is_ok());
        assert!(text(&[], &[], Some("b")).validate().is_ok());
    }

    #[test]
    fn core_search_validation_rejects_double_regex() {
        let both = SearchOptions::RegexSearch(RegexSearch {
            pattern: Some("a".to_string()),
            not_pattern: Some("b".to_string()),
        });
        assert!(both.validate().is_err());
        let neither = SearchOptions::RegexSearch(RegexSearch::default());
        assert!(neither.validate().is_err());
    }

    #[test]
    fn core_search_matcher_terms_case_insensitive() {
        let options = text(&["Flag"], &["nope"], None);
        let matcher = SearchMatcher::compile(&options).unwrap();
        let payload = b"the FLAG is here".to_vec();
        assert!(matcher.matches(&payload, &payload.to_ascii_lowercase()));
        let payload = b"the FLAG is here, nope".to_vec();
        assert!(!matcher.matches(&payload, &payload.to_ascii_lowercase()));
    }

    #[test]
    fn core_search_matcher_not_pattern_inverts() {
        let options = SearchOptions::RegexSearch(RegexSearch {
            pattern: None,
            not_pattern: Some("secret".to_string()),
        });
        let matcher = SearchMatcher::compile(&options).unwrap();
        assert!(matcher.matches(b"nothing here", b"nothing here"));
        assert!(!matcher.matches(b"a secret", b"a secret"));
    }
}
