#![allow(clippy::needless_doctest_main)]

//! Network-traffic analysis core for capture-the-flag and incident-response
//! workflows.
//!
//! Given packet captures or a live capture feed, seine reconstructs TCP
//! flows, segments them into logical connections, scans their payloads
//! against configured rules, classifies them by service, and exposes the
//! results for interactive exploration and full-text/regex search.
//!
//! The crate is the ingestion-and-analysis pipeline only. The HTTP/REST
//! surface, browser UI, and notification fan-out are external collaborators
//! that bind the operation surface of [Core]; the document store is reached
//! through the [storage::DocumentStore] contract.
//!
//! ```no_run
//! use seine_core::config::default_config;
//! use seine_core::record::NoopSink;
//! use seine_core::storage::MemoryStore;
//! use seine_core::Core;
//! use std::sync::Arc;
//!
//! fn main() {
//!     let core = Core::new(default_config(), Arc::new(MemoryStore::new()), Arc::new(NoopSink))
//!         .unwrap();
//!     let session = core.import_file("capture.pcap", true).unwrap();
//!     core.join_import_workers();
//!     println!("{:?}", core.get_session(session).unwrap());
//! }
//! ```

pub mod capture;
pub mod config;
pub mod conntrack;
mod dispatch;
pub mod error;
pub mod importer;
pub mod memory;
pub mod protocols;
pub mod record;
pub mod rules;
pub mod search;
pub mod services;
pub mod sources;
pub mod stats;
pub mod storage;
pub mod utils;

pub use self::conntrack::conn_id::{ConnectionId, SessionId};
pub use self::conntrack::flow_key::FlowKey;
pub use self::error::CoreError;
pub use self::memory::pktbuf::PktBuf;

use crate::capture::LiveCaptureManager;
use crate::config::RuntimeConfig;
use crate::conntrack::conn_id::ConnIdGen;
use crate::conntrack::pdu::L4Context;
use crate::dispatch::{PacketDispatcher, PipelineShared};
use crate::importer::{PcapImporter, SessionRecord};
use crate::record::format::{render_messages, render_payload};
use crate::record::{
    ConnectionRecord, Direction, EventSink, FinalizeReason, MessageFormat, MessageRecord,
};
use crate::rules::{PatternIndex, Rule, RulesManager};
use crate::search::{PerformedSearch, SearchManager, SearchOptions};
use crate::services::{Service, ServiceRegistry};
use crate::sources::live::CaptureOptions;
use crate::sources::{header_for, InterfaceInfo, SshConfig};
use crate::stats::{StatisticsFilter, StatsBucket, TotalStatistics};
use crate::storage::{collections, find_by_id, DocumentStore, Filter, SortOrder};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filter over stored connections for [Core::get_connections].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionFilter {
    /// Connections starting at or after this millisecond timestamp.
    #[serde(default)]
    pub from_ms: Option<i64>,
    /// Connections starting at or before this millisecond timestamp.
    #[serde(default)]
    pub to_ms: Option<i64>,
    /// Restrict to one server port.
    #[serde(default)]
    pub service_port: Option<u16>,
    /// Restrict to connections that matched this rule.
    #[serde(default)]
    pub rule_id: Option<String>,
    #[serde(default)]
    pub hidden: Option<bool>,
    #[serde(default)]
    pub marked: Option<bool>,
    /// Page size; defaults to 50.
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub skip: usize,
}

fn default_limit() -> usize {
    50
}

/// One message rendered for interactive query.
#[derive(Debug, Clone, Serialize)]
pub struct RenderedMessage {
    pub index: u32,
    pub direction: Direction,
    pub ts: DateTime<Utc>,
    pub content: String,
}

/// Root context wiring the pipeline components.
///
/// The operation surface of this struct is what the HTTP adapter binds:
/// ingest (imports, live capture), query (sessions, connections, messages),
/// mutate (user flags), rules, services, search, and statistics.
pub struct Core {
    config: RuntimeConfig,
    storage: Arc<dyn DocumentStore>,
    sink: Arc<dyn EventSink>,
    patterns: Arc<PatternIndex>,
    rules: RulesManager,
    services: Arc<ServiceRegistry>,
    importer: Arc<PcapImporter>,
    capture: LiveCaptureManager,
    search: SearchManager,
    dispatcher: Arc<PacketDispatcher>,
}

impl Core {
    /// Initializes the pipeline: reserved directories, persisted rules and
    /// services, pattern compilation, and the worker pool.
    ///
    /// This is the only place where failure aborts; once `new` returns, the
    /// pipeline degrades rather than dies.
    pub fn new(
        config: RuntimeConfig,
        storage: Arc<dyn DocumentStore>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, CoreError> {
        let dirs = importer::DataDirs::create(&config.capture.data_dir)
            .map_err(|e| CoreError::source("data dir", e))?;

        let patterns = Arc::new(PatternIndex::new());
        let rules = RulesManager::load(Arc::clone(&storage), Arc::clone(&patterns))?;
        let services = Arc::new(ServiceRegistry::load(Arc::clone(&storage))?);

        let shared = Arc::new(PipelineShared {
            storage: Arc::clone(&storage),
            sink: Arc::clone(&sink),
            patterns: Arc::clone(&patterns),
            services: Arc::clone(&services),
            conn_ids: ConnIdGen::new(),
        });
        let dispatcher = Arc::new(PacketDispatcher::new(&config, Arc::clone(&shared)));
        let importer = Arc::new(PcapImporter::new(
            Arc::clone(&dispatcher),
            Arc::clone(&shared),
            dirs,
        ));
        let capture = LiveCaptureManager::new(
            Arc::clone(&dispatcher),
            Arc::clone(&importer),
            Arc::clone(&shared),
            config.capture.rotation_interval,
        );
        let search = SearchManager::new(Arc::clone(&storage), config.search.clone());

        Ok(Core {
            config,
            storage,
            sink,
            patterns,
            rules,
            services,
            importer,
            capture,
            search,
            dispatcher,
        })
    }

    /* ----------------------------- ingest ----------------------------- */

    /// See [PcapImporter::import_file].
    pub fn import_file<P: AsRef<Path>>(
        &self,
        path: P,
        flush_all: bool,
    ) -> Result<SessionId, CoreError> {
        self.importer.import_file(path, flush_all)
    }

    /// See [LiveCaptureManager::start_local_capture].
    pub fn start_local_capture(&self, options: CaptureOptions) -> Result<(), CoreError> {
        self.capture.start_local_capture(options, &self.config.capture)
    }

    /// See [LiveCaptureManager::start_remote_capture].
    pub fn start_remote_capture(
        &self,
        ssh: &SshConfig,
        options: CaptureOptions,
    ) -> Result<(), CoreError> {
        self.capture
            .start_remote_capture(ssh, options, &self.config.capture)
    }

    /// See [LiveCaptureManager::stop_capture].
    pub fn stop_capture(&self) -> Result<(), CoreError> {
        self.capture.stop_capture()
    }

    /// See [LiveCaptureManager::set_rotation_interval].
    pub fn set_rotation_interval(&self, millis: u64) -> Result<(), CoreError> {
        self.capture.set_rotation_interval(millis)
    }

    /// See [PcapImporter::cancel_session].
    pub fn cancel_session(&self, id: SessionId) -> bool {
        self.importer.cancel_session(id)
    }

    /// Enumerates local capture interfaces.
    pub fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>, CoreError> {
        sources::list_interfaces()
    }

    /// Enumerates capture interfaces on a remote host.
    pub fn list_remote_interfaces(&self, ssh: &SshConfig) -> Result<Vec<InterfaceInfo>, CoreError> {
        sources::remote::list_remote_interfaces(ssh)
    }

    /* ----------------------------- query ------------------------------ */

    pub fn get_sessions(&self) -> Vec<SessionRecord> {
        self.importer.get_sessions()
    }

    pub fn get_session(&self, id: SessionId) -> Result<SessionRecord, CoreError> {
        self.importer.get_session(id)
    }

    /// Stored connections matching `filter`, newest first.
    pub fn get_connections(
        &self,
        filter: &ConnectionFilter,
    ) -> Result<Vec<ConnectionRecord>, CoreError> {
        let mut store_filter = Filter::new();
        if let Some(from) = filter.from_ms {
            store_filter = store_filter.gte("started_at_ms", from);
        }
        if let Some(to) = filter.to_ms {
            store_filter = store_filter.lte("started_at_ms", to);
        }
        if let Some(port) = filter.service_port {
            store_filter = store_filter.eq("server_port", port);
        }
        if let Some(rule_id) = &filter.rule_id {
            store_filter = store_filter.contains("matched_rules", rule_id.clone());
        }
        if let Some(hidden) = filter.hidden {
            store_filter = store_filter.eq("hidden", hidden);
        }
        if let Some(marked) = filter.marked {
            store_filter = store_filter.eq("marked", marked);
        }
        let docs = self
            .storage
            .find(
                collections::CONNECTIONS,
                &store_filter,
                Some(("started_at_ms", SortOrder::Desc)),
                filter.skip,
                filter.limit,
            )
            .map_err(CoreError::storage)?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc).ok())
            .collect())
    }

    pub fn get_connection(&self, id: ConnectionId) -> Result<ConnectionRecord, CoreError> {
        let doc = find_by_id(&*self.storage, collections::CONNECTIONS, &id.to_string())
            .map_err(CoreError::storage)?
            .ok_or_else(|| CoreError::ConnectionNotFound(id.to_string()))?;
        serde_json::from_value(doc).map_err(CoreError::storage)
    }

    /// Messages of a connection rendered for interactive display.
    pub fn get_messages(
        &self,
        id: ConnectionId,
        format: MessageFormat,
    ) -> Result<Vec<RenderedMessage>, CoreError> {
        let messages = self.connection_messages(id)?;
        Ok(messages
            .into_iter()
            .map(|message| RenderedMessage {
                index: message.index,
                direction: message.direction,
                ts: message.ts,
                content: String::from_utf8_lossy(&render_payload(&message.data, format))
                    .into_owned(),
            })
            .collect())
    }

    /// Messages of a connection rendered as one downloadable byte stream.
    pub fn download_messages(
        &self,
        id: ConnectionId,
        format: MessageFormat,
    ) -> Result<Vec<u8>, CoreError> {
        let messages = self.connection_messages(id)?;
        Ok(render_messages(&messages, format))
    }

    fn connection_messages(&self, id: ConnectionId) -> Result<Vec<MessageRecord>, CoreError> {
        // existence check surfaces ConnectionNotFound for bad ids
        self.get_connection(id)?;
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
        Ok(docs
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc).ok())
            .collect())
    }

    /// Writes the packets of one connection into
    /// `connections/<id>.pcap` by re-reading the session PCAPs the
    /// connection was observed in. Returns the written path.
    pub fn export_connection_pcap(&self, id: ConnectionId) -> Result<PathBuf, CoreError> {
        let record = self.get_connection(id)?;
        let flow_key = FlowKey::new(record.client, record.server);
        let dirs = self.importer.dirs();

        let out_path = dirs.connections.join(format!("{}.pcap", id));
        let mut writer = pcap::Capture::dead(pcap::Linktype::ETHERNET)
            .and_then(|cap| cap.savefile(&out_path))
            .map_err(|e| CoreError::source("connection export", e))?;

        let mut written = 0u64;
        for session in &record.sessions {
            for extension in ["pcap", "pcapng"] {
                let path = dirs.pcaps.join(format!("{}.{}", session, extension));
                if !path.exists() {
                    continue;
                }
                let mut source = sources::FileSource::open(&path)?;
                loop {
                    use sources::SourceRead;
                    match sources::PacketSource::read(&mut source)? {
                        SourceRead::Frame(buf) => {
                            if let Ok(ctxt) = L4Context::parse(&buf) {
                                if FlowKey::new(ctxt.src, ctxt.dst) == flow_key {
                                    writer.write(&pcap::Packet {
                                        header: &header_for(&buf),
                                        data: buf.data(),
                                    });
                                    written += 1;
                                }
                            }
                        }
                        SourceRead::Idle => continue,
                        SourceRead::Eof => break,
                    }
                }
            }
        }
        log::info!("Exported {} packets for connection {}", written, id);
        Ok(out_path)
    }

    /* ----------------------------- mutate ----------------------------- */

    pub fn set_hidden(&self, id: ConnectionId, hidden: bool) -> Result<(), CoreError> {
        self.patch_connection(id, serde_json::json!({ "hidden": hidden }))
    }

    pub fn set_marked(&self, id: ConnectionId, marked: bool) -> Result<(), CoreError> {
        self.patch_connection(id, serde_json::json!({ "marked": marked }))
    }

    pub fn set_comment(&self, id: ConnectionId, comment: Option<String>) -> Result<(), CoreError> {
        self.patch_connection(id, serde_json::json!({ "comment": comment }))
    }

    fn patch_connection(&self, id: ConnectionId, patch: serde_json::Value) -> Result<(), CoreError> {
        let updated = self
            .storage
            .update(collections::CONNECTIONS, &id.to_string(), patch)
            .map_err(CoreError::storage)?;
        if !updated {
            return Err(CoreError::ConnectionNotFound(id.to_string()));
        }
        Ok(())
    }

    /* ----------------------------- rules ------------------------------ */

    pub fn get_rules(&self) -> Vec<Rule> {
        self.rules.get_rules()
    }

    pub fn get_rule(&self, id: &str) -> Result<Rule, CoreError> {
        self.rules.get_rule(id)
    }

    pub fn add_rule(&self, rule: Rule) -> Result<Rule, CoreError> {
        let rule = self.rules.add_rule(rule)?;
        self.sink.rules_updated(rule.version);
        Ok(rule)
    }

    pub fn update_rule(&self, id: &str, rule: Rule) -> Result<Rule, CoreError> {
        let rule = self.rules.update_rule(id, rule)?;
        self.sink.rules_updated(rule.version);
        Ok(rule)
    }

    /* ---------------------------- services ---------------------------- */

    pub fn get_services(&self) -> Vec<Service> {
        self.services.get_services()
    }

    pub fn set_service(&self, service: Service) -> Result<Service, CoreError> {
        self.services.set_service(service)
    }

    pub fn delete_service(&self, port: u16) -> Result<(), CoreError> {
        self.services.delete_service(port)
    }

    /* ----------------------------- search ----------------------------- */

    pub fn perform_search(&self, options: SearchOptions) -> Result<PerformedSearch, CoreError> {
        self.search.perform_search(options)
    }

    pub fn get_performed_searches(&self) -> Result<Vec<PerformedSearch>, CoreError> {
        self.search.get_performed_searches()
    }

    /* ------------------------------ stats ----------------------------- */

    pub fn get_statistics(&self, filter: &StatisticsFilter) -> Result<Vec<StatsBucket>, CoreError> {
        stats::get_statistics(&*self.storage, filter)
    }

    pub fn get_total_statistics(
        &self,
        filter: &StatisticsFilter,
    ) -> Result<TotalStatistics, CoreError> {
        stats::get_total_statistics(&*self.storage, filter)
    }

    /* ---------------------------- lifecycle --------------------------- */

    /// The current compiled pattern-set version.
    pub fn rules_version(&self) -> u64 {
        self.patterns.snapshot().version()
    }

    /// Blocks until all file-import workers have finished. Intended for
    /// CLI embedding and tests.
    pub fn join_import_workers(&self) {
        self.importer.join_workers();
    }

    /// Stops live capture (if running), flushes every open flow, and joins
    /// the worker pool.
    pub fn shutdown(&self) {
        if self.capture.is_running() {
            let _ = self.capture.stop_capture();
        }
        self.importer.join_workers();
        self.dispatcher.flush_all(FinalizeReason::SessionEnd);
        self.dispatcher.shutdown();
    }
}
