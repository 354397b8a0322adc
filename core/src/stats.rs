//! Connection statistics.
//!
//! Aggregates stored connections into hourly per-service buckets for the
//! UI's traffic overview. Statistics are computed on demand from the
//! document store; nothing is maintained incrementally.

use crate::error::CoreError;
use crate::storage::{collections, DocumentStore, Filter, SortOrder};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const HOUR_MS: i64 = 3_600_000;

/// Filter over the statistics source set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatisticsFilter {
    /// Include connections starting at or after this millisecond timestamp.
    #[serde(default)]
    pub from_ms: Option<i64>,
    /// Include connections starting at or before this millisecond
    /// timestamp.
    #[serde(default)]
    pub to_ms: Option<i64>,
    /// Restrict to these server ports. Empty means all.
    #[serde(default)]
    pub services: Vec<u16>,
    /// Restrict to connections matching any of these rules. Empty means
    /// all.
    #[serde(default)]
    pub rule_ids: Vec<String>,
}

/// Counters for one service port.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStats {
    pub connections: u64,
    pub client_bytes: u64,
    pub server_bytes: u64,
    /// Connections that matched at least one rule.
    pub matched_connections: u64,
}

impl ServiceStats {
    fn absorb(&mut self, doc: &Value) {
        self.connections += 1;
        self.client_bytes += doc["client_bytes"].as_u64().unwrap_or(0);
        self.server_bytes += doc["server_bytes"].as_u64().unwrap_or(0);
        let matched = doc["matched_rules"]
            .as_array()
            .map(|rules| !rules.is_empty())
            .unwrap_or(false);
        if matched {
            self.matched_connections += 1;
        }
    }
}

/// One hour of per-service statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsBucket {
    /// Start of the hour (milliseconds since epoch).
    pub hour_start_ms: i64,
    pub services: BTreeMap<u16, ServiceStats>,
}

/// Aggregate over the whole filtered range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TotalStatistics {
    pub connections: u64,
    pub client_bytes: u64,
    pub server_bytes: u64,
    pub matched_connections: u64,
    pub services: BTreeMap<u16, ServiceStats>,
}

/// Hourly-bucketed per-service statistics for the filtered range.
pub fn get_statistics(
    storage: &dyn DocumentStore,
    filter: &StatisticsFilter,
) -> Result<Vec<StatsBucket>, CoreError> {
    let mut buckets: BTreeMap<i64, StatsBucket> = BTreeMap::new();
    for doc in fetch(storage, filter)? {
        let started = doc["started_at_ms"].as_i64().unwrap_or(0);
        let hour_start_ms = started.div_euclid(HOUR_MS) * HOUR_MS;
        let port = doc["server_port"].as_u64().unwrap_or(0) as u16;
        buckets
            .entry(hour_start_ms)
            .or_insert_with(|| StatsBucket {
                hour_start_ms,
                services: BTreeMap::new(),
            })
            .services
            .entry(port)
            .or_default()
            .absorb(&doc);
    }
    Ok(buckets.into_values().collect())
}

/// Aggregate statistics for the filtered range, without bucketing.
pub fn get_total_statistics(
    storage: &dyn DocumentStore,
    filter: &StatisticsFilter,
) -> Result<TotalStatistics, CoreError> {
    let mut totals = TotalStatistics::default();
    for doc in fetch(storage, filter)? {
        let port = doc["server_port"].as_u64().unwrap_or(0) as u16;
        totals.services.entry(port).or_default().absorb(&doc);
        totals.connections += 1;
        totals.client_bytes += doc["client_bytes"].as_u64().unwrap_or(0);
        totals.server_bytes += doc["server_bytes"].as_u64().unwrap_or(0);
        let matched = doc["matched_rules"]
            .as_array()
            .map(|rules| !rules.is_empty())
            .unwrap_or(false);
        if matched {
            totals.matched_connections += 1;
        }
    }
    Ok(totals)
}

/// Fetches the filtered connection documents. The rule filter is applied
/// in-process because it is an any-of over an array field.
fn fetch(storage: &dyn DocumentStore, filter: &StatisticsFilter) -> Result<Vec<Value>, CoreError> {
    let mut store_filter = Filter::new();
    if let Some(from) = filter.from_ms {
        store_filter = store_filter.gte("started_at_ms", from);
    }
    if let Some(to) = filter.to_ms {
        store_filter = store_filter.lte("started_at_ms", to);
    }
    if !filter.services.is_empty() {
        store_filter = store_filter.within(
            "server_port",
            filter.services.iter().map(|p| (*p).into()).collect(),
        );
    }
    let docs = storage
        .find(
            collections::CONNECTIONS,
            &store_filter,
            Some(("started_at_ms", SortOrder::Asc)),
            0,
            0,
        )
        .map_err(CoreError::storage)?;

    if filter.rule_ids.is_empty() {
        return Ok(docs);
    }
    Ok(docs
        .into_iter()
        .filter(|doc| {
            doc["matched_rules"]
                .as_array()
                .map(|rules| {
                    rules
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|id| filter.rule_ids.iter().any(|want| want == id))
                })
                .unwrap_or(false)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn conn(id: &str, started_at_ms: i64, port: u16, rules: &[&str]) -> Value {
        json!({
            "id": id,
            "started_at_ms": started_at_ms,
            "server_port": port,
            "client_bytes": 10,
            "server_bytes": 20,
            "matched_rules": rules,
        })
    }

    #[test]
    fn core_stats_buckets_by_hour_and_service() {
        let store = MemoryStore::new();
        store
            .insert(collections::CONNECTIONS, conn("a", 0, 80, &[]))
            .unwrap();
        store
            .insert(collections::CONNECTIONS, conn("b", 1000, 80, &["r1"]))
            .unwrap();
        store
            .insert(collections::CONNECTIONS, conn("c", HOUR_MS + 1, 443, &[]))
            .unwrap();

        let buckets = get_statistics(&store, &StatisticsFilter::default()).unwrap();
        assert_eq!(buckets.len(), 2);
        let first = &buckets[0];
        assert_eq!(first.hour_start_ms, 0);
        assert_eq!(first.services[&80].connections, 2);
        assert_eq!(first.services[&80].matched_connections, 1);
        assert_eq!(buckets[1].services[&443].connections, 1);
    }

    #[test]
    fn core_stats_totals_respect_filters() {
        let store = MemoryStore::new();
        store
            .insert(collections::CONNECTIONS, conn("a", 0, 80, &["r1"]))
            .unwrap();
        store
            .insert(collections::CONNECTIONS, conn("b", 10, 443, &[]))
            .unwrap();

        let filter = StatisticsFilter {
            services: vec![80],
            ..Default::default()
        };
        let totals = get_total_statistics(&store, &filter).unwrap();
        assert_eq!(totals.connections, 1);
        assert_eq!(totals.matched_connections, 1);
        assert_eq!(totals.client_bytes, 10);

        let filter = StatisticsFilter {
            rule_ids: vec!["r1".to_string()],
            ..Default::default()
        };
        let totals = get_total_statistics(&store, &filter).unwrap();
        assert_eq!(totals.connections, 1);
    }
}
