//! End-to-end scenarios: capture files through the full pipeline.

mod common;

use common::{count_packets, tcp_frame, write_pcap};

use seine_core::config::RuntimeConfig;
use seine_core::error::CoreError;
use seine_core::record::{Direction, MessageFormat, NoopSink};
use seine_core::rules::{PatternExpr, PatternOrigin, Rule, RuleFilter, RulePattern};
use seine_core::search::{RegexSearch, SearchOptions, TextSearch};
use seine_core::services::Service;
use seine_core::stats::StatisticsFilter;
use seine_core::storage::MemoryStore;
use seine_core::Core;

use std::path::PathBuf;
use std::sync::Arc;

use seine_core::protocols::packet::tcp::{ACK, FIN, PSH, SYN};

const CLIENT: [u8; 4] = [172, 16, 0, 10];
const SERVER: [u8; 4] = [172, 16, 0, 20];

const REQUEST: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: example\r\n\r\n";
const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

struct Harness {
    core: Core,
    store: Arc<MemoryStore>,
    dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = RuntimeConfig::default();
    config.capture.data_dir = dir.path().join("data");
    config.pipeline.workers = 2;
    let store = Arc::new(MemoryStore::new());
    let core = Core::new(config, store.clone(), Arc::new(NoopSink)).expect("core init");
    Harness { core, store, dir }
}

/// A complete HTTP exchange: handshake, request, response, FINs.
fn http_conversation(client_port: u16, server_port: u16) -> Vec<(Vec<u8>, i64)> {
    let isn_c = 10_000;
    let isn_s = 20_000;
    vec![
        (
            tcp_frame(CLIENT, SERVER, client_port, server_port, isn_c, SYN, b""),
            1_000,
        ),
        (
            tcp_frame(SERVER, CLIENT, server_port, client_port, isn_s, SYN | ACK, b""),
            1_001,
        ),
        (
            tcp_frame(
                CLIENT,
                SERVER,
                client_port,
                server_port,
                isn_c + 1,
                ACK | PSH,
                REQUEST,
            ),
            1_002,
        ),
        (
            tcp_frame(
                SERVER,
                CLIENT,
                server_port,
                client_port,
                isn_s + 1,
                ACK | PSH,
                RESPONSE,
            ),
            1_050,
        ),
        (
            tcp_frame(
                CLIENT,
                SERVER,
                client_port,
                server_port,
                isn_c + 1 + REQUEST.len() as u32,
                FIN | ACK,
                b"",
            ),
            1_100,
        ),
        (
            tcp_frame(
                SERVER,
                CLIENT,
                server_port,
                client_port,
                isn_s + 1 + RESPONSE.len() as u32,
                FIN | ACK,
                b"",
            ),
            1_101,
        ),
    ]
}

fn import(harness: &Harness, name: &str, frames: &[(Vec<u8>, i64)], flush_all: bool) {
    let path: PathBuf = harness.dir.path().join(name);
    write_pcap(&path, frames);
    harness.core.import_file(&path, flush_all).expect("import");
    harness.core.join_import_workers();
}

#[test]
fn e2e_http_conversation_yields_one_connection() {
    let harness = harness();
    harness
        .core
        .set_service(Service {
            port: 80,
            name: "http".to_string(),
            color: String::new(),
            notes: String::new(),
        })
        .unwrap();
    import(&harness, "http.pcap", &http_conversation(41000, 80), true);

    let connections = harness.core.get_connections(&Default::default()).unwrap();
    assert_eq!(connections.len(), 1);
    let conn = &connections[0];
    assert_eq!(conn.client.port(), 41000);
    assert_eq!(conn.server.port(), 80);
    assert_eq!(conn.client_bytes, REQUEST.len() as u64);
    assert_eq!(conn.server_bytes, RESPONSE.len() as u64);
    assert_eq!(conn.message_count, 2);
    assert_eq!(conn.service, Some(80));

    let messages = harness.core.get_messages(conn.id, MessageFormat::Raw).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].direction, Direction::ClientToServer);
    assert_eq!(messages[0].content.as_bytes(), REQUEST);
    assert_eq!(messages[1].direction, Direction::ServerToClient);

    let raw = harness
        .core
        .download_messages(conn.id, MessageFormat::Raw)
        .unwrap();
    let expected: Vec<u8> = [REQUEST, RESPONSE].concat();
    assert_eq!(raw, expected);

    let hex = harness
        .core
        .download_messages(conn.id, MessageFormat::Hex)
        .unwrap();
    assert_eq!(hex, hex::encode(&expected).into_bytes());

    // both messages were persisted as documents
    assert_eq!(harness.store.len("messages"), 2);
}

#[test]
fn e2e_session_progress_and_file_layout() {
    let harness = harness();
    let frames = http_conversation(41001, 80);
    let path = harness.dir.path().join("layout.pcap");
    write_pcap(&path, &frames);
    let session_id = harness.core.import_file(&path, true).unwrap();
    harness.core.join_import_workers();

    let session = harness.core.get_session(session_id).unwrap();
    assert_eq!(session.packets_read, frames.len() as u64);
    assert_eq!(session.packets_dropped, 0);
    assert!(session.completed_at.is_some());
    assert!(!session.cancelled);
    assert!(session.bytes_processed > 0);

    // the staged file moved from processing/ into pcaps/
    let data = harness.dir.path().join("data");
    let final_path = data.join("pcaps").join(format!("{}.pcap", session_id));
    assert!(final_path.exists());
    assert!(!data
        .join("pcaps")
        .join("processing")
        .join(format!("{}.pcap", session_id))
        .exists());
    assert_eq!(count_packets(&final_path), frames.len());

    // sessions are also in the listing
    assert!(harness
        .core
        .get_sessions()
        .iter()
        .any(|s| s.id == session_id));
}

/// A flow spanning two capture files (the rotation shape) yields a single
/// connection referencing both sessions.
#[test]
fn e2e_flow_spanning_two_sessions_is_one_connection() {
    let harness = harness();
    let frames = http_conversation(41002, 80);
    import(&harness, "first.pcap", &frames[..3], false);
    import(&harness, "second.pcap", &frames[3..], true);

    let connections = harness.core.get_connections(&Default::default()).unwrap();
    assert_eq!(connections.len(), 1);
    let conn = &connections[0];
    assert_eq!(conn.message_count, 2);
    assert_eq!(conn.sessions.len(), 2, "both sessions contributed packets");
}

#[test]
fn e2e_rule_matching_end_to_end() {
    let harness = harness();
    let rule = harness
        .core
        .add_rule(Rule {
            id: String::new(),
            name: "http ok".to_string(),
            color: String::new(),
            notes: String::new(),
            patterns: vec![RulePattern {
                expr: PatternExpr::Literal(b"200 OK".to_vec()),
                case_sensitive: true,
                min_occurrences: 1,
                max_occurrences: None,
                origin: PatternOrigin::Server,
            }],
            filter: RuleFilter::default(),
            version: 0,
        })
        .unwrap();
    assert!(!rule.id.is_empty());
    assert!(rule.version > 0);

    import(&harness, "rule.pcap", &http_conversation(41003, 80), true);
    let connections = harness.core.get_connections(&Default::default()).unwrap();
    assert_eq!(connections[0].matched_rules, vec![rule.id.clone()]);

    // filter by rule id
    let filtered = harness
        .core
        .get_connections(&seine_core::ConnectionFilter {
            rule_id: Some(rule.id),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(filtered.len(), 1);
}

#[test]
fn e2e_rule_compile_gate_rejects_bad_rules() {
    let harness = harness();
    let bad = Rule {
        id: String::new(),
        name: "broken".to_string(),
        color: String::new(),
        notes: String::new(),
        patterns: vec![RulePattern {
            expr: PatternExpr::Regex("(unclosed".to_string()),
            case_sensitive: true,
            min_occurrences: 1,
            max_occurrences: None,
            origin: PatternOrigin::Both,
        }],
        filter: RuleFilter::default(),
        version: 0,
    };
    assert!(matches!(
        harness.core.add_rule(bad),
        Err(CoreError::RuleCompile { .. })
    ));
    assert!(harness.core.get_rules().is_empty());
}

#[test]
fn e2e_search_text_and_regex() {
    let harness = harness();
    import(&harness, "search.pcap", &http_conversation(41004, 80), true);

    let hit = harness
        .core
        .perform_search(SearchOptions::TextSearch(TextSearch {
            terms: vec![],
            excluded_terms: vec![],
            exact_phrase: Some("index.html".to_string()),
        }))
        .unwrap();
    assert_eq!(hit.matched_connections.len(), 1);

    let miss = harness
        .core
        .perform_search(SearchOptions::RegexSearch(RegexSearch {
            pattern: Some("404 Not Found".to_string()),
            not_pattern: None,
        }))
        .unwrap();
    assert!(miss.matched_connections.is_empty());

    let history = harness.core.get_performed_searches().unwrap();
    assert_eq!(history.len(), 2);
}

#[test]
fn e2e_search_rejects_mixed_options() {
    let harness = harness();
    let invalid = SearchOptions::TextSearch(TextSearch {
        terms: vec!["a".to_string()],
        excluded_terms: vec![],
        exact_phrase: Some("b".to_string()),
    });
    assert!(matches!(
        harness.core.perform_search(invalid),
        Err(CoreError::InvalidSearch { .. })
    ));
}

#[test]
fn e2e_user_flags_round_trip() {
    let harness = harness();
    import(&harness, "flags.pcap", &http_conversation(41005, 80), true);
    let conn = harness.core.get_connections(&Default::default()).unwrap()[0].clone();

    harness.core.set_marked(conn.id, true).unwrap();
    harness
        .core
        .set_comment(conn.id, Some("suspicious".to_string()))
        .unwrap();
    let reloaded = harness.core.get_connection(conn.id).unwrap();
    assert!(reloaded.marked);
    assert_eq!(reloaded.comment.as_deref(), Some("suspicious"));

    harness.core.set_hidden(conn.id, true).unwrap();
    let visible = harness
        .core
        .get_connections(&seine_core::ConnectionFilter {
            hidden: Some(false),
            ..Default::default()
        })
        .unwrap();
    assert!(visible.is_empty());
}

#[test]
fn e2e_export_connection_pcap_slice() {
    let harness = harness();
    // two interleaved conversations in one capture
    let mut frames = http_conversation(41006, 80);
    frames.extend(http_conversation(41007, 80));
    frames.sort_by_key(|(_, ts)| *ts);
    import(&harness, "export.pcap", &frames, true);

    let connections = harness.core.get_connections(&Default::default()).unwrap();
    assert_eq!(connections.len(), 2);
    let conn = connections
        .iter()
        .find(|c| c.client.port() == 41006)
        .unwrap();

    let path = harness.core.export_connection_pcap(conn.id).unwrap();
    assert!(path.exists());
    // the slice holds exactly this conversation's packets
    assert_eq!(count_packets(&path), 6);
}

#[test]
fn e2e_statistics_totals() {
    let harness = harness();
    import(&harness, "stats.pcap", &http_conversation(41008, 80), true);

    let totals = harness
        .core
        .get_total_statistics(&StatisticsFilter::default())
        .unwrap();
    assert_eq!(totals.connections, 1);
    assert_eq!(totals.client_bytes, REQUEST.len() as u64);
    assert_eq!(totals.server_bytes, RESPONSE.len() as u64);
    assert_eq!(totals.services[&80].connections, 1);

    let buckets = harness
        .core
        .get_statistics(&StatisticsFilter::default())
        .unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].services[&80].connections, 1);
}

#[test]
fn e2e_cancel_semantics() {
    let harness = harness();
    // unknown sessions are not cancellable
    assert!(!harness
        .core
        .cancel_session(seine_core::SessionId::new(chrono::Utc::now(), 9999)));

    // completed sessions are not cancellable either
    let path = harness.dir.path().join("done.pcap");
    write_pcap(&path, &http_conversation(41009, 80));
    let id = harness.core.import_file(&path, true).unwrap();
    harness.core.join_import_workers();
    assert!(!harness.core.cancel_session(id));
}

#[test]
fn e2e_missing_ids_are_not_found() {
    let harness = harness();
    let bogus = seine_core::ConnectionId::new(chrono::Utc::now(), 123);
    assert!(matches!(
        harness.core.get_connection(bogus),
        Err(CoreError::ConnectionNotFound(_))
    ));
    assert!(matches!(
        harness.core.get_messages(bogus, MessageFormat::Printable),
        Err(CoreError::ConnectionNotFound(_))
    ));
    assert!(matches!(
        harness.core.get_rule("nope"),
        Err(CoreError::RuleNotFound(_))
    ));
}
