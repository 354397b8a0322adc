//! Multi-pattern matcher over the active rule set.
//!
//! All literal patterns compile into Aho-Corasick automata (one per
//! case-sensitivity class) and all regex patterns into byte-oriented regex
//! engines. Compiles are atomic: a successful [rebuild](PatternIndex::rebuild)
//! swaps in a new immutable [CompiledPatterns] snapshot, and connections pin
//! the snapshot that was current when they started, so in-flight scanning
//! always completes against a consistent pattern set.
//!
//! Literal scanning is chunk-incremental: a [StreamScanner] carries the
//! trailing `max_literal_len - 1` bytes between chunks so matches straddling
//! a chunk boundary still surface, and suppresses re-reports of matches that
//! ended inside the carried overlap. Regex patterns have no a-priori length
//! bound, so they are counted once per connection over the complete
//! reassembled side (which is retained for message construction anyway).

use crate::error::CoreError;
use crate::rules::{PatternExpr, PatternOrigin, Rule, RuleDirection, RuleFilter};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use regex::bytes::{Regex, RegexBuilder};

/// Client side index into per-side match counts.
pub(crate) const SIDE_CLIENT: usize = 0;
/// Server side index into per-side match counts.
pub(crate) const SIDE_SERVER: usize = 1;

/// A single pattern match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch {
    /// Index of the pattern entry in the compiled set.
    pub pattern: usize,
    /// Absolute byte offset of the match start.
    pub offset: u64,
    /// Match length in bytes.
    pub len: usize,
}

/// One compiled pattern of one rule.
#[derive(Debug, Clone)]
pub(crate) struct PatternEntry {
    pub(crate) rule_id: String,
    pub(crate) origin: PatternOrigin,
    pub(crate) min_occurrences: u32,
    pub(crate) max_occurrences: Option<u32>,
}

/// One rule of the compiled set.
#[derive(Debug, Clone)]
pub(crate) struct CompiledRule {
    pub(crate) id: String,
    pub(crate) filter: RuleFilter,
    /// Indices into [CompiledPatterns::entries].
    pub(crate) patterns: Vec<usize>,
}

/// Connection metadata consulted during rule evaluation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnMeta {
    pub(crate) total_bytes: u64,
    pub(crate) duration_ms: u64,
    pub(crate) server_port: u16,
}

/// An immutable compiled snapshot of the rule set.
#[derive(Debug)]
pub struct CompiledPatterns {
    version: u64,
    entries: Vec<PatternEntry>,
    rules: Vec<CompiledRule>,
    /// Case-sensitive literal automaton + automaton-index -> entry mapping.
    ac_sensitive: Option<(AhoCorasick, Vec<usize>)>,
    /// Case-insensitive literal automaton + mapping.
    ac_insensitive: Option<(AhoCorasick, Vec<usize>)>,
    /// Regex patterns: (entry index, engine).
    regexes: Vec<(usize, Regex)>,
    /// Longest literal pattern length; sizes the stream carry buffer.
    max_literal_len: usize,
}

impl CompiledPatterns {
    /// Compiles `rules` into a snapshot tagged with `version`.
    pub(crate) fn build(rules: &[Rule], version: u64) -> Result<Self, CoreError> {
        let mut entries = Vec::new();
        let mut compiled_rules = Vec::with_capacity(rules.len());
        let mut lit_cs: Vec<Vec<u8>> = Vec::new();
        let mut map_cs = Vec::new();
        let mut lit_ci: Vec<Vec<u8>> = Vec::new();
        let mut map_ci = Vec::new();
        let mut regexes = Vec::new();
        let mut max_literal_len = 0;

        for rule in rules {
            let mut pattern_ids = Vec::with_capacity(rule.patterns.len());
            for (pattern_index, pattern) in rule.patterns.iter().enumerate() {
                let fail = |reason: String| CoreError::RuleCompile {
                    rule_id: (!rule.id.is_empty()).then(|| rule.id.clone()),
                    pattern_index,
                    reason,
                };
                if let Some(max) = pattern.max_occurrences {
                    if max < pattern.min_occurrences {
                        return Err(fail(format!(
                            "occurrence bounds inverted ({} > {})",
                            pattern.min_occurrences, max
                        )));
                    }
                }

                let entry_id = entries.len();
                match &pattern.expr {
                    PatternExpr::Literal(bytes) => {
                        if bytes.is_empty() {
                            return Err(fail("empty literal".to_string()));
                        }
                        max_literal_len = max_literal_len.max(bytes.len());
                        if pattern.case_sensitive {
                            lit_cs.push(bytes.clone());
                            map_cs.push(entry_id);
                        } else {
                            lit_ci.push(bytes.clone());
                            map_ci.push(entry_id);
                        }
                    }
                    PatternExpr::Regex(pattern_str) => {
                        let regex = RegexBuilder::new(pattern_str)
                            .case_insensitive(!pattern.case_sensitive)
                            .unicode(false)
                            .build()
                            .map_err(|e| fail(e.to_string()))?;
                        regexes.push((entry_id, regex));
                    }
                }
                entries.push(PatternEntry {
                    rule_id: rule.id.clone(),
                    origin: pattern.origin,
                    min_occurrences: pattern.min_occurrences,
                    max_occurrences: pattern.max_occurrences,
                });
                pattern_ids.push(entry_id);
            }
            compiled_rules.push(CompiledRule {
                id: rule.id.clone(),
                filter: rule.filter.clone(),
                patterns: pattern_ids,
            });
        }

        let build_ac = |patterns: &[Vec<u8>], insensitive: bool| {
            (!patterns.is_empty()).then(|| {
                AhoCorasickBuilder::new()
                    .ascii_case_insensitive(insensitive)
                    .build(patterns)
            })
        };

        Ok(CompiledPatterns {
            version,
            entries,
            rules: compiled_rules,
            ac_sensitive: build_ac(&lit_cs, false).map(|ac| (ac, map_cs)),
            ac_insensitive: build_ac(&lit_ci, true).map(|ac| (ac, map_ci)),
            regexes,
            max_literal_len,
        })
    }

    /// Version of the rule set this snapshot was compiled from.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub(crate) fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the set contains any regex pattern.
    #[inline]
    pub(crate) fn has_regexes(&self) -> bool {
        !self.regexes.is_empty()
    }

    /// Scans a complete buffer for every pattern, literal and regex.
    ///
    /// Matches for distinct patterns may overlap; matches of one pattern are
    /// reduced to non-overlapping occurrences in start-offset order. Results
    /// are sorted by offset.
    pub fn scan_buffer(&self, bytes: &[u8], base_offset: u64) -> Vec<PatternMatch> {
        let mut out = Vec::new();
        let mut last_end = vec![0u64; self.entries.len()];
        for (ac, map) in [&self.ac_sensitive, &self.ac_insensitive]
            .into_iter()
            .flatten()
        {
            for m in ac.find_overlapping_iter(bytes) {
                let entry = map[m.pattern()];
                let start = base_offset + m.start() as u64;
                let end = base_offset + m.end() as u64;
                // occurrences of one pattern are reduced to a non-overlapping
                // left-to-right selection
                if start < last_end[entry] {
                    continue;
                }
                last_end[entry] = end;
                out.push(PatternMatch {
                    pattern: entry,
                    offset: start,
                    len: m.end() - m.start(),
                });
            }
        }
        for (entry, regex) in &self.regexes {
            for m in regex.find_iter(bytes) {
                out.push(PatternMatch {
                    pattern: *entry,
                    offset: base_offset + m.start() as u64,
                    len: m.end() - m.start(),
                });
            }
        }
        out.sort_by_key(|m| (m.offset, m.pattern));
        out
    }

    /// Counts regex occurrences in a complete side buffer into `counts`.
    pub(crate) fn count_regexes(&self, bytes: &[u8], side: usize, counts: &mut MatchCounts) {
        for (entry, regex) in &self.regexes {
            let n = regex.find_iter(bytes).count() as u32;
            if n > 0 {
                counts.add(*entry, side, n);
            }
        }
    }

    /// Evaluates connection-level rule constraints against accumulated
    /// per-pattern counts. Returns the matched rule ids.
    pub(crate) fn evaluate(&self, meta: &ConnMeta, counts: &MatchCounts) -> Vec<String> {
        let mut matched = Vec::new();
        'rules: for rule in &self.rules {
            let f = &rule.filter;
            if meta.total_bytes < f.min_bytes {
                continue;
            }
            if matches!(f.max_bytes, Some(max) if meta.total_bytes > max) {
                continue;
            }
            if meta.duration_ms < f.min_duration {
                continue;
            }
            if matches!(f.max_duration, Some(max) if meta.duration_ms > max) {
                continue;
            }
            if !f.services.is_empty() && !f.services.contains(&meta.server_port) {
                continue;
            }
            for &entry_id in &rule.patterns {
                let entry = &self.entries[entry_id];
                let occurrences = counts.total(entry_id, entry.origin, f.direction);
                if occurrences < entry.min_occurrences {
                    continue 'rules;
                }
                if matches!(entry.max_occurrences, Some(max) if occurrences > max) {
                    continue 'rules;
                }
            }
            matched.push(rule.id.clone());
        }
        matched
    }
}

/* --------------------------------------------------------------------------------- */

/// Per-pattern, per-side occurrence counters for one connection.
#[derive(Debug, Clone)]
pub(crate) struct MatchCounts {
    counts: Vec<[u32; 2]>,
}

impl MatchCounts {
    pub(crate) fn new(patterns: &CompiledPatterns) -> Self {
        MatchCounts {
            counts: vec![[0; 2]; patterns.entry_count()],
        }
    }

    #[inline]
    pub(crate) fn add(&mut self, entry: usize, side: usize, n: u32) {
        self.counts[entry][side] = self.counts[entry][side].saturating_add(n);
    }

    /// Total occurrences of `entry`, restricted to the sides allowed by the
    /// pattern origin intersected with the rule direction.
    fn total(&self, entry: usize, origin: PatternOrigin, direction: RuleDirection) -> u32 {
        let allow_client = origin != PatternOrigin::Server && direction != RuleDirection::Server;
        let allow_server = origin != PatternOrigin::Client && direction != RuleDirection::Client;
        let mut total = 0;
        if allow_client {
            total += self.counts[entry][SIDE_CLIENT];
        }
        if allow_server {
            total += self.counts[entry][SIDE_SERVER];
        }
        total
    }
}

/* --------------------------------------------------------------------------------- */

/// Incremental literal scanner for one flow side.
///
/// Feeds contiguous stream chunks into the literal automata, counting
/// matches into [MatchCounts]. Carries the trailing bytes needed to catch
/// matches straddling chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct StreamScanner {
    /// Trailing bytes of the stream scanned so far.
    carry: Vec<u8>,
    /// Absolute stream offset one past the last scanned byte.
    consumed: u64,
    /// Per-entry absolute end offset of the last accepted occurrence.
    last_end: Vec<u64>,
}

impl StreamScanner {
    pub(crate) fn new(patterns: &CompiledPatterns) -> Self {
        StreamScanner {
            carry: Vec::new(),
            consumed: 0,
            last_end: vec![0; patterns.entry_count()],
        }
    }

    /// Scans the next stream chunk, counting literal occurrences on `side`.
    pub(crate) fn push(
        &mut self,
        patterns: &CompiledPatterns,
        side: usize,
        chunk: &[u8],
        counts: &mut MatchCounts,
    ) {
        if patterns.ac_sensitive.is_none() && patterns.ac_insensitive.is_none() {
            self.consumed += chunk.len() as u64;
            return;
        }

        let base = self.consumed - self.carry.len() as u64;
        let mut hay = std::mem::take(&mut self.carry);
        hay.extend_from_slice(chunk);

        for (ac, map) in [&patterns.ac_sensitive, &patterns.ac_insensitive]
            .into_iter()
            .flatten()
        {
            for m in ac.find_overlapping_iter(&hay) {
                let entry = map[m.pattern()];
                let start = base + m.start() as u64;
                let end = base + m.end() as u64;
                // Matches ending inside the carried overlap were counted on
                // a previous push.
                if end <= self.consumed {
                    continue;
                }
                // Same-pattern occurrences must not overlap; literals have a
                // fixed length, so greedy left-to-right selection is exact.
                if start < self.last_end[entry] {
                    continue;
                }
                self.last_end[entry] = end;
                counts.add(entry, side, 1);
            }
        }

        self.consumed = base + hay.len() as u64;
        let keep = patterns.max_literal_len.saturating_sub(1).min(hay.len());
        self.carry = hay.split_off(hay.len() - keep);
    }
}

/* --------------------------------------------------------------------------------- */

/// Shared handle over the current [CompiledPatterns] snapshot.
///
/// Rebuilds swap the snapshot under a lock; readers clone the `Arc` and keep
/// scanning against the version they pinned.
pub struct PatternIndex {
    current: RwLock<Arc<CompiledPatterns>>,
    next_version: AtomicU64,
}

impl PatternIndex {
    /// Creates an index holding an empty version-0 snapshot.
    pub fn new() -> Self {
        let empty = CompiledPatterns::build(&[], 0).expect("empty rule set always compiles");
        PatternIndex {
            current: RwLock::new(Arc::new(empty)),
            next_version: AtomicU64::new(1),
        }
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<CompiledPatterns> {
        Arc::clone(&self.current.read().unwrap())
    }

    /// Atomically recompiles the full rule set and publishes the result.
    /// Returns the new version. On failure the current snapshot is kept.
    pub fn rebuild(&self, rules: &[Rule]) -> Result<u64, CoreError> {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let compiled = CompiledPatterns::build(rules, version)?;
        *self.current.write().unwrap() = Arc::new(compiled);
        log::debug!("Published pattern set version {}", version);
        Ok(version)
    }
}

impl Default for PatternIndex {
    fn default() -> Self {
        PatternIndex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RulePattern;

    fn literal_rule(id: &str, bytes: &[u8], case_sensitive: bool) -> Rule {
        Rule {
            id: id.to_string(),
            name: id.to_string(),
            color: String::new(),
            notes: String::new(),
            patterns: vec![RulePattern {
                expr: PatternExpr::Literal(bytes.to_vec()),
                case_sensitive,
                min_occurrences: 1,
                max_occurrences: None,
                origin: PatternOrigin::Both,
            }],
            filter: RuleFilter::default(),
            version: 0,
        }
    }

    #[test]
    fn core_compile_rejects_empty_literal() {
        let rule = literal_rule("r1", b"", true);
        let err = CompiledPatterns::build(&[rule], 1).unwrap_err();
        assert!(matches!(err, CoreError::RuleCompile { .. }));
    }

    #[test]
    fn core_compile_rejects_bad_regex() {
        let mut rule = literal_rule("r1", b"x", true);
        rule.patterns[0].expr = PatternExpr::Regex("(unclosed".to_string());
        let err = CompiledPatterns::build(&[rule], 1).unwrap_err();
        assert!(matches!(err, CoreError::RuleCompile { .. }));
    }

    #[test]
    fn core_scan_buffer_reports_offsets() {
        let compiled =
            CompiledPatterns::build(&[literal_rule("r1", b"flag{", true)], 1).unwrap();
        let matches = compiled.scan_buffer(b"xx flag{a} flag{b}", 100);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].offset, 103);
        assert_eq!(matches[1].offset, 111);
        assert!(matches.iter().all(|m| m.len == 5));
    }

    #[test]
    fn core_scan_buffer_case_insensitive() {
        let compiled =
            CompiledPatterns::build(&[literal_rule("r1", b"secret", false)], 1).unwrap();
        let matches = compiled.scan_buffer(b"SeCrEt", 0);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn core_scan_buffer_overlapping_distinct_patterns() {
        let rules = vec![
            literal_rule("r1", b"abcd", true),
            literal_rule("r2", b"bc", true),
        ];
        let compiled = CompiledPatterns::build(&rules, 1).unwrap();
        let matches = compiled.scan_buffer(b"abcd", 0);
        // both patterns surface even though their matches overlap
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn core_scan_buffer_same_pattern_non_overlapping() {
        let compiled = CompiledPatterns::build(&[literal_rule("r1", b"aa", true)], 1).unwrap();
        let matches = compiled.scan_buffer(b"aaaa", 0);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].offset, 0);
        assert_eq!(matches[1].offset, 2);
    }

    #[test]
    fn core_stream_scanner_catches_cross_chunk_match() {
        let compiled =
            CompiledPatterns::build(&[literal_rule("r1", b"flag{", true)], 1).unwrap();
        let mut counts = MatchCounts::new(&compiled);
        let mut scanner = StreamScanner::new(&compiled);
        scanner.push(&compiled, SIDE_CLIENT, b"xxxfl", &mut counts);
        scanner.push(&compiled, SIDE_CLIENT, b"ag{yy", &mut counts);
        assert_eq!(
            counts.total(0, PatternOrigin::Both, RuleDirection::Both),
            1
        );
    }

    #[test]
    fn core_stream_scanner_does_not_double_count_overlap() {
        let compiled =
            CompiledPatterns::build(&[literal_rule("r1", b"abc", true)], 1).unwrap();
        let mut counts = MatchCounts::new(&compiled);
        let mut scanner = StreamScanner::new(&compiled);
        scanner.push(&compiled, SIDE_SERVER, b"zzabc", &mut counts);
        // carry holds "bc"; the completed match must not be re-reported
        scanner.push(&compiled, SIDE_SERVER, b"zzzzz", &mut counts);
        assert_eq!(
            counts.total(0, PatternOrigin::Both, RuleDirection::Both),
            1
        );
    }

    #[test]
    fn core_rebuild_bumps_version_and_keeps_old_snapshot_on_error() {
        let index = PatternIndex::new();
        let v1 = index.rebuild(&[literal_rule("r1", b"x", true)]).unwrap();
        let snapshot = index.snapshot();
        assert_eq!(snapshot.version(), v1);

        let mut bad = literal_rule("r2", b"y", true);
        bad.patterns[0].expr = PatternExpr::Regex("(".to_string());
        assert!(index.rebuild(&[bad]).is_err());
        assert_eq!(index.snapshot().version(), v1);
    }
}
