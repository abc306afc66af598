//! Query execution over the log store
//!
//! All predicates combine with logical AND; unset fields are
//! unconstrained. Results are ordered newest-first (`timestamp DESC,
//! id DESC`) and paginated with a default limit of 100 and a hard
//! ceiling of 10 000.
//!
//! # WAL Mode Concurrency
//!
//! The store runs in WAL mode, so these read queries execute
//! concurrently with the batcher's writer thread. The r2d2 pool hands
//! out up to four reader connections for query parallelism.

use super::{classify, format_ts, Store, StoreError};
use crate::record::{LogRecord, StructuredData};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Page size when the caller does not specify one.
pub const DEFAULT_LIMIT: usize = 100;
/// Hard ceiling on a single page.
pub const MAX_LIMIT: usize = 10_000;

/// How the full-text predicate interprets its input before it reaches
/// FTS5. Phrase treats the whole string as literal text, natural keeps
/// a small boolean vocabulary, raw hands the string to FTS5 untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Literal text. The input becomes a single quoted FTS5 phrase, so
    /// no query syntax survives. The right default for user input.
    #[default]
    Phrase,

    /// Keyword search: AND / OR / NOT (any case) and trailing-`*`
    /// prefixes pass through, everything else is literal text.
    Natural,

    /// Unprocessed FTS5 syntax. Invalid input surfaces as a query error.
    Raw,
}

/// Boolean vocabulary recognised in natural mode.
const FTS_OPERATORS: [&str; 3] = ["AND", "OR", "NOT"];

impl SearchMode {
    /// Turn caller input into the string bound to `MATCH`.
    pub fn to_match_expr(self, input: &str) -> String {
        match self {
            SearchMode::Phrase => quote_phrase(input),
            SearchMode::Natural => {
                let terms: Vec<String> = input.split_whitespace().map(natural_term).collect();
                terms.join(" ")
            }
            SearchMode::Raw => input.to_string(),
        }
    }
}

/// One whitespace-separated word of a natural-mode query.
fn natural_term(word: &str) -> String {
    if let Some(op) = FTS_OPERATORS.iter().find(|op| word.eq_ignore_ascii_case(op)) {
        return (*op).to_string();
    }
    let (stem, wildcard) = match word.strip_suffix('*') {
        Some(stem) => (stem, true),
        None => (word, false),
    };
    let mut term = String::with_capacity(word.len());
    for ch in stem.chars() {
        match ch {
            // Grouping and column-filter syntax stays out of literal terms
            '(' | ')' => {}
            ':' => term.push(' '),
            '"' => term.push_str("\"\""),
            _ => term.push(ch),
        }
    }
    if wildcard {
        term.push('*');
    }
    term
}

/// Wrap the whole input as one FTS5 string literal, doubling any
/// embedded quotes.
fn quote_phrase(input: &str) -> String {
    let mut quoted = String::with_capacity(input.len() + 2);
    quoted.push('"');
    for ch in input.chars() {
        quoted.push(ch);
        if ch == '"' {
            quoted.push('"');
        }
    }
    quoted.push('"');
    quoted
}

/// Filter set for historical queries. Every present field narrows the
/// result; absent fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Exact record id.
    pub id: Option<i64>,
    /// Full-text match over the message body.
    pub message: Option<String>,
    /// How `message` is interpreted before reaching FTS5.
    #[serde(default)]
    pub mode: SearchMode,
    pub hostname: Option<String>,
    pub app_name: Option<String>,
    pub proc_id: Option<String>,
    pub msg_id: Option<String>,
    pub facility: Option<u8>,
    pub severity: Option<u8>,
    /// Matches records at least this severe (`severity <= min_severity`;
    /// numerically smaller is more severe).
    pub min_severity: Option<u8>,
    pub priority: Option<u8>,
    /// Inclusive lower bound on the message timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the message timestamp.
    pub until: Option<DateTime<Utc>>,
    /// Experimental structured-data predicate: `path` or `path=value`
    /// over the canonical SD mapping, e.g. `ex@32473.eventID=1011`.
    pub structured_data: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl SearchQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    pub fn effective_offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

const SELECT_COLS: &str = "l.id, l.priority, l.facility, l.severity, l.version, \
     l.timestamp, l.hostname, l.app_name, l.proc_id, l.msg_id, \
     l.structured_data, l.message, l.created_at";

impl Store {
    /// Execute a filtered, paginated query on a pooled reader connection.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<LogRecord>, StoreError> {
        let conn = self.read_conn()?;
        run_search(&conn, query)
    }

    /// The newest `limit` records by id, newest first. Backs the tail
    /// view of the UI.
    pub fn get_recent(&self, limit: usize) -> Result<Vec<LogRecord>, StoreError> {
        let conn = self.read_conn()?;
        let limit = limit.clamp(1, MAX_LIMIT);
        let sql = format!("SELECT {SELECT_COLS} FROM logs l ORDER BY l.id DESC LIMIT ?1");
        let mut stmt = conn.prepare_cached(&sql).map_err(|e| classify(e, 0))?;
        let rows = stmt
            .query_map([limit as i64], row_to_record)
            .map_err(|e| classify(e, 0))?;
        collect_rows(rows)
    }
}

fn run_search(conn: &Connection, query: &SearchQuery) -> Result<Vec<LogRecord>, StoreError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    // FTS queries drive the scan from the index side of the join
    let from = if query.message.is_some() {
        "logs_fts JOIN logs l ON l.id = logs_fts.rowid"
    } else {
        "logs l"
    };
    if let Some(message) = &query.message {
        clauses.push("logs_fts MATCH ?");
        params.push(Value::Text(query.mode.to_match_expr(message)));
    }

    if let Some(id) = query.id {
        clauses.push("l.id = ?");
        params.push(Value::Integer(id));
    }

    let text_predicates = [
        ("l.hostname = ?", &query.hostname),
        ("l.app_name = ?", &query.app_name),
        ("l.proc_id = ?", &query.proc_id),
        ("l.msg_id = ?", &query.msg_id),
    ];
    for (clause, value) in text_predicates {
        if let Some(value) = value {
            clauses.push(clause);
            params.push(Value::Text(value.clone()));
        }
    }

    let int_predicates = [
        ("l.facility = ?", query.facility),
        ("l.severity = ?", query.severity),
        ("l.severity <= ?", query.min_severity),
        ("l.priority = ?", query.priority),
    ];
    for (clause, value) in int_predicates {
        if let Some(value) = value {
            clauses.push(clause);
            params.push(Value::Integer(i64::from(value)));
        }
    }

    if let Some(since) = &query.since {
        clauses.push("l.timestamp >= ?");
        params.push(Value::Text(format_ts(since)));
    }
    if let Some(until) = &query.until {
        clauses.push("l.timestamp <= ?");
        params.push(Value::Text(format_ts(until)));
    }

    if let Some(expr) = &query.structured_data {
        let (clause, mut sd_params) = sd_predicate(expr)?;
        clauses.push(clause);
        params.append(&mut sd_params);
    }

    let mut sql = format!("SELECT {SELECT_COLS} FROM {from}");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY l.timestamp DESC, l.id DESC LIMIT ? OFFSET ?");
    params.push(Value::Integer(query.effective_limit() as i64));
    params.push(Value::Integer(query.effective_offset() as i64));

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| map_query_err(e, query))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), row_to_record)
        .map_err(|e| map_query_err(e, query))?;
    collect_rows(rows)
}

/// Translate `path` / `path=value` into a `json_extract` predicate over
/// the canonical structured-data mapping. Segments split on `.`; an
/// SD-ID or parameter name containing a literal dot cannot be addressed,
/// which is the documented limit of this experimental surface.
fn sd_predicate(expr: &str) -> Result<(&'static str, Vec<Value>), StoreError> {
    let (path, value) = match expr.split_once('=') {
        Some((path, value)) => (path.trim(), Some(value)),
        None => (expr.trim(), None),
    };
    if path.is_empty() || path.contains('"') {
        return Err(StoreError::UnsupportedPredicate(expr.to_string()));
    }

    let mut json_path = String::from("$");
    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(StoreError::UnsupportedPredicate(expr.to_string()));
        }
        json_path.push_str(&format!(".\"{segment}\""));
    }

    match value {
        Some(value) => Ok((
            "json_extract(l.structured_data, ?) = ?",
            vec![Value::Text(json_path), Value::Text(value.to_string())],
        )),
        None => Ok((
            "json_extract(l.structured_data, ?) IS NOT NULL",
            vec![Value::Text(json_path)],
        )),
    }
}

/// A backend built without the JSON functions reports the predicate as
/// unsupported rather than a generic store failure.
fn map_query_err(err: rusqlite::Error, query: &SearchQuery) -> StoreError {
    if let Some(expr) = &query.structured_data {
        if err.to_string().contains("no such function: json_extract") {
            return StoreError::UnsupportedPredicate(expr.clone());
        }
    }
    classify(err, 0)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRecord> {
    let timestamp: String = row.get(5)?;
    let structured_data: String = row.get(10)?;
    let created_at: String = row.get(12)?;
    Ok(LogRecord {
        id: Some(row.get(0)?),
        priority: row.get(1)?,
        facility: row.get(2)?,
        severity: row.get(3)?,
        version: row.get(4)?,
        timestamp: parse_stored_ts(&timestamp, 5)?,
        hostname: row.get(6)?,
        app_name: row.get(7)?,
        proc_id: row.get(8)?,
        msg_id: row.get(9)?,
        structured_data: StructuredData::from_canonical_json(&structured_data)
            .map_err(|e| conversion_err(10, e))?,
        message: row.get(11)?,
        created_at: Some(parse_stored_ts(&created_at, 12)?),
    })
}

fn parse_stored_ts(text: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(column, e))
}

fn conversion_err(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn collect_rows(
    rows: impl Iterator<Item = rusqlite::Result<LogRecord>>,
) -> Result<Vec<LogRecord>, StoreError> {
    let mut records = Vec::new();
    for row in rows {
        records.push(row.map_err(|e| classify(e, 0))?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use crate::store::StoreOptions;

    fn open_seeded() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("logs.db"), StoreOptions::default()).unwrap();
        let lines = [
            r#"<165>1 2023-10-15T14:30:45.123Z web01 nginx 1234 access [ex@32473 iut="3" eventID="1011"] User login succeeded"#,
            r#"<34>1 2023-10-15T14:30:46Z web01 sshd 77 auth - Failed password for root"#,
            r#"<13>1 2023-10-15T14:30:47Z db01 postgres 900 query - slow query detected"#,
            r#"<165>1 2023-10-15T14:30:48Z web02 nginx 1234 access - User logout"#,
            r#"<13>1 2023-10-15T14:30:49Z db01 postgres 900 query - checkpoint complete"#,
        ];
        let records: Vec<_> = lines.iter().map(|l| parser::parse(l).unwrap()).collect();
        store.insert_batch(&records).unwrap();
        (dir, store)
    }

    #[test]
    fn test_facility_filter_matches_only_that_facility() {
        let (_dir, store) = open_seeded();
        let results = store
            .search(&SearchQuery {
                facility: Some(20),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.facility == 20));
    }

    #[test]
    fn test_min_severity_is_at_least_as_severe() {
        let (_dir, store) = open_seeded();
        let results = store
            .search(&SearchQuery {
                min_severity: Some(2),
                ..Default::default()
            })
            .unwrap();
        // Only the <34> (severity 2) record qualifies
        assert_eq!(results.len(), 1);
        assert!(results.iter().all(|r| r.severity <= 2));
    }

    #[test]
    fn test_fts_message_search() {
        let (_dir, store) = open_seeded();
        let results = store
            .search(&SearchQuery {
                message: Some("password".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].app_name, "sshd");
    }

    #[test]
    fn test_results_ordered_newest_first() {
        let (_dir, store) = open_seeded();
        let results = store.search(&SearchQuery::default()).unwrap();
        assert_eq!(results.len(), 5);
        for pair in results.windows(2) {
            assert!(
                (pair[0].timestamp, pair[0].id) >= (pair[1].timestamp, pair[1].id),
                "expected timestamp DESC, id DESC"
            );
        }
    }

    #[test]
    fn test_pagination() {
        let (_dir, store) = open_seeded();
        let page = |offset| {
            store
                .search(&SearchQuery {
                    limit: Some(2),
                    offset: Some(offset),
                    ..Default::default()
                })
                .unwrap()
        };
        let first = page(0);
        let second = page(2);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert!(first[1].id > second[0].id || first[1].timestamp > second[0].timestamp);
    }

    #[test]
    fn test_limit_is_clamped() {
        let query = SearchQuery {
            limit: Some(1_000_000),
            ..Default::default()
        };
        assert_eq!(query.effective_limit(), MAX_LIMIT);
        assert_eq!(SearchQuery::default().effective_limit(), DEFAULT_LIMIT);
    }

    #[test]
    fn test_time_range_bounds() {
        let (_dir, store) = open_seeded();
        let since = "2023-10-15T14:30:46Z".parse().unwrap();
        let until = "2023-10-15T14:30:48Z".parse().unwrap();
        let results = store
            .search(&SearchQuery {
                since: Some(since),
                until: Some(until),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|r| r.timestamp >= since && r.timestamp <= until));
    }

    #[test]
    fn test_round_trip_field_equality() {
        let (_dir, store) = open_seeded();
        let original = parser::parse(
            r#"<165>1 2023-10-15T14:30:45.123Z web01 nginx 1234 access [ex@32473 iut="3" eventID="1011"] User login succeeded"#,
        )
        .unwrap();

        let results = store
            .search(&SearchQuery {
                msg_id: Some("access".to_string()),
                hostname: Some("web01".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        let stored = &results[0];

        // The id predicate finds the same record
        let by_id = store
            .search(&SearchQuery {
                id: stored.id,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(&by_id[0], stored);

        assert!(stored.id.is_some());
        assert!(stored.created_at.is_some());
        assert_eq!(stored.priority, original.priority);
        assert_eq!(stored.facility, original.facility);
        assert_eq!(stored.severity, original.severity);
        assert_eq!(stored.version, original.version);
        assert_eq!(stored.timestamp, original.timestamp);
        assert_eq!(stored.hostname, original.hostname);
        assert_eq!(stored.app_name, original.app_name);
        assert_eq!(stored.proc_id, original.proc_id);
        assert_eq!(stored.msg_id, original.msg_id);
        assert_eq!(stored.structured_data, original.structured_data);
        assert_eq!(stored.message, original.message);
    }

    #[test]
    fn test_structured_data_predicate() {
        let (_dir, store) = open_seeded();

        let by_value = store
            .search(&SearchQuery {
                structured_data: Some("ex@32473.eventID=1011".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_value.len(), 1);
        assert_eq!(by_value[0].app_name, "nginx");

        let by_presence = store
            .search(&SearchQuery {
                structured_data: Some("ex@32473.iut".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_presence.len(), 1);

        let no_match = store
            .search(&SearchQuery {
                structured_data: Some("ex@32473.eventID=9999".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(no_match.is_empty());
    }

    #[test]
    fn test_malformed_structured_data_predicate() {
        let (_dir, store) = open_seeded();
        for bad in ["", "  ", "a..b", "x\"y"] {
            let err = store
                .search(&SearchQuery {
                    structured_data: Some(bad.to_string()),
                    ..Default::default()
                })
                .unwrap_err();
            assert!(
                matches!(err, StoreError::UnsupportedPredicate(_)),
                "input {bad:?} should be unsupported"
            );
        }
    }

    #[test]
    fn test_get_recent_newest_first() {
        let (_dir, store) = open_seeded();
        let recent = store.get_recent(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent[0].id > recent[1].id && recent[1].id > recent[2].id);
        assert_eq!(recent[0].message, "checkpoint complete");
    }

    #[test]
    fn test_search_mode_match_expressions() {
        assert_eq!(
            SearchMode::Phrase.to_match_expr("user's query"),
            "\"user's query\""
        );
        assert_eq!(
            SearchMode::Phrase.to_match_expr("say \"hi\""),
            "\"say \"\"hi\"\"\""
        );
        assert_eq!(
            SearchMode::Natural.to_match_expr("login and not logout"),
            "login AND NOT logout"
        );
        assert_eq!(SearchMode::Natural.to_match_expr("pass*"), "pass*");
        assert_eq!(
            SearchMode::Natural.to_match_expr("msg:(boot) \"x\""),
            "msg boot \"\"x\"\""
        );
        assert_eq!(
            SearchMode::Raw.to_match_expr("message:login NEAR/5 root"),
            "message:login NEAR/5 root"
        );
    }
}
