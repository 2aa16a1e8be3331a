//! Database queries for engram operations

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::embedding::cosine_similarity;
use crate::error::{LimbicError, Result};
use crate::scoring::decay::decay_rate_for_importance;
use crate::types::*;

use super::migrations::fts_available;

/// Serialize a timestamp the way the schema stores it (RFC3339, microseconds)
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// SHA-256 of trimmed content, hex-encoded
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Column list shared by every engram SELECT
const ENGRAM_COLUMNS: &str = "e.id, e.content, e.category, e.importance, e.original_importance,
        e.decay_rate, e.access_count, e.last_accessed_at, e.inserted_at, e.updated_at,
        e.protected, e.thread_id, e.project_id, e.superseded_at, e.content_hash,
        e.has_embedding, e.metadata";

/// Parse an engram from a database row
pub fn engram_from_row(row: &Row) -> rusqlite::Result<Engram> {
    let metadata_str: String = row.get("metadata")?;
    let metadata: HashMap<String, serde_json::Value> =
        serde_json::from_str(&metadata_str).unwrap_or_default();

    let category_str: String = row.get("category")?;
    let inserted_at: String = row.get("inserted_at")?;
    let updated_at: String = row.get("updated_at")?;
    let last_accessed_at: Option<String> = row.get("last_accessed_at")?;
    let superseded_at: Option<String> = row.get("superseded_at")?;
    let protected: i32 = row.get("protected")?;
    let has_embedding: i32 = row.get("has_embedding")?;

    Ok(Engram {
        id: row.get("id")?,
        content: row.get("content")?,
        category: category_str.parse().unwrap_or_default(),
        importance: row.get("importance")?,
        original_importance: row.get("original_importance")?,
        embedding: None, // Loaded separately
        metadata,
        access_count: row.get("access_count")?,
        last_accessed_at: parse_ts_opt(last_accessed_at),
        inserted_at: parse_ts(&inserted_at),
        updated_at: parse_ts(&updated_at),
        decay_rate: row.get("decay_rate")?,
        protected: protected != 0,
        thread_id: row.get("thread_id")?,
        project_id: row.get("project_id")?,
        tags: vec![], // Loaded separately
        superseded_at: parse_ts_opt(superseded_at),
        content_hash: row.get("content_hash")?,
        has_embedding: has_embedding != 0,
    })
}

/// Load tags for an engram
pub fn load_tags(conn: &Connection, engram_id: EngramId) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT t.name FROM tags t
         JOIN engram_tags et ON t.id = et.tag_id
         WHERE et.engram_id = ?
         ORDER BY t.name",
    )?;
    let tags = stmt
        .query_map(params![engram_id], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(tags)
}

fn save_tags(conn: &Connection, engram_id: EngramId, tags: &[String]) -> Result<()> {
    conn.execute(
        "DELETE FROM engram_tags WHERE engram_id = ?",
        params![engram_id],
    )?;
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        conn.execute("INSERT OR IGNORE INTO tags (name) VALUES (?)", params![tag])?;
        conn.execute(
            "INSERT OR IGNORE INTO engram_tags (engram_id, tag_id)
             SELECT ?, id FROM tags WHERE name = ?",
            params![engram_id, tag],
        )?;
    }
    Ok(())
}

fn validate_unit_interval(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(LimbicError::Validation(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

/// Create a new engram
///
/// `original_importance` and `decay_rate` are fixed here: the first from
/// the supplied importance, the second from the importance table unless
/// explicitly overridden.
pub fn create_engram(conn: &Connection, input: &CreateEngramInput) -> Result<Engram> {
    if input.content.trim().is_empty() {
        return Err(LimbicError::Validation("content must be non-empty".into()));
    }

    let importance = input.importance.unwrap_or(0.5);
    validate_unit_interval("importance", importance)?;

    let decay_rate = match input.decay_rate {
        Some(rate) => {
            validate_unit_interval("decay_rate", rate)?;
            rate
        }
        None => decay_rate_for_importance(importance),
    };

    let now = format_ts(Utc::now());
    let hash = content_hash(&input.content);
    let metadata_json = serde_json::to_string(&input.metadata)?;
    let project_id = input
        .project_id
        .clone()
        .unwrap_or_else(|| "global".to_string());

    conn.execute(
        "INSERT INTO engrams (content, category, importance, original_importance, decay_rate,
                              access_count, inserted_at, updated_at, protected, thread_id,
                              project_id, content_hash, has_embedding, metadata)
         VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, 0, ?)",
        params![
            input.content,
            input.category.as_str(),
            importance,
            importance,
            decay_rate,
            now,
            now,
            input.protected,
            input.thread_id,
            project_id,
            hash,
            metadata_json,
        ],
    )?;
    let id = conn.last_insert_rowid();

    save_tags(conn, id, &input.tags)?;

    if let Some(ref embedding) = input.embedding {
        store_embedding(conn, id, embedding, None)?;
    }

    get_engram(conn, id)
}

/// Fetch an engram by id
pub fn get_engram(conn: &Connection, id: EngramId) -> Result<Engram> {
    let sql = format!("SELECT {} FROM engrams e WHERE e.id = ?", ENGRAM_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut engram = stmt
        .query_row(params![id], engram_from_row)
        .map_err(|_| LimbicError::NotFound(id))?;
    engram.tags = load_tags(conn, id)?;
    Ok(engram)
}

/// Fast duplicate pre-check by content hash within a category
pub fn find_by_content_hash(
    conn: &Connection,
    hash: &str,
    category: EngramCategory,
) -> Result<Option<Engram>> {
    let sql = format!(
        "SELECT {} FROM engrams e
         WHERE e.content_hash = ? AND e.category = ? AND e.superseded_at IS NULL
         LIMIT 1",
        ENGRAM_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let engram = stmt
        .query_row(params![hash, category.as_str()], engram_from_row)
        .optional()?;

    match engram {
        Some(mut e) => {
            e.tags = load_tags(conn, e.id)?;
            Ok(Some(e))
        }
        None => Ok(None),
    }
}

/// Update an engram; `original_importance` is never touched
pub fn update_engram(conn: &Connection, id: EngramId, input: &UpdateEngramInput) -> Result<Engram> {
    // Ensure it exists before building the update
    get_engram(conn, id)?;

    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref content) = input.content {
        if content.trim().is_empty() {
            return Err(LimbicError::Validation("content must be non-empty".into()));
        }
        sets.push("content = ?".into());
        values.push(Box::new(content.clone()));
        sets.push("content_hash = ?".into());
        values.push(Box::new(content_hash(content)));
    }
    if let Some(category) = input.category {
        sets.push("category = ?".into());
        values.push(Box::new(category.as_str().to_string()));
    }
    if let Some(importance) = input.importance {
        validate_unit_interval("importance", importance)?;
        sets.push("importance = ?".into());
        values.push(Box::new(importance));
    }
    if let Some(decay_rate) = input.decay_rate {
        validate_unit_interval("decay_rate", decay_rate)?;
        sets.push("decay_rate = ?".into());
        values.push(Box::new(decay_rate));
    }
    if let Some(ref metadata) = input.metadata {
        sets.push("metadata = ?".into());
        values.push(Box::new(serde_json::to_string(metadata)?));
    }
    if let Some(protected) = input.protected {
        sets.push("protected = ?".into());
        values.push(Box::new(protected));
    }
    if let Some(superseded) = input.superseded_at {
        sets.push("superseded_at = ?".into());
        values.push(Box::new(superseded.map(format_ts)));
    }

    if !sets.is_empty() {
        sets.push("updated_at = ?".into());
        values.push(Box::new(format_ts(Utc::now())));

        let sql = format!("UPDATE engrams SET {} WHERE id = ?", sets.join(", "));
        values.push(Box::new(id));
        let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        conn.execute(&sql, refs.as_slice())?;
    }

    if let Some(ref tags) = input.tags {
        save_tags(conn, id, tags)?;
    }

    get_engram(conn, id)
}

/// Delete an engram by id; returns true if a row was removed
pub fn delete_engram(conn: &Connection, id: EngramId) -> Result<bool> {
    let n = conn.execute("DELETE FROM engrams WHERE id = ?", params![id])?;
    Ok(n > 0)
}

/// Delete a set of engrams; returns the number removed
pub fn delete_engrams(conn: &Connection, ids: &[EngramId]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
    let sql = format!(
        "DELETE FROM engrams WHERE id IN ({})",
        placeholders.join(", ")
    );
    let refs: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
    Ok(conn.execute(&sql, refs.as_slice())?)
}

/// Append filter predicates to a WHERE clause under alias `e`
fn push_filter_sql(
    filter: &EngramFilter,
    sql: &mut String,
    values: &mut Vec<Box<dyn rusqlite::ToSql>>,
) {
    if let Some(category) = filter.category {
        sql.push_str(" AND e.category = ?");
        values.push(Box::new(category.as_str().to_string()));
    }
    if let Some(ref project) = filter.project_id {
        sql.push_str(" AND e.project_id = ?");
        values.push(Box::new(project.clone()));
    }
    if let Some(ref thread) = filter.thread_id {
        sql.push_str(" AND e.thread_id = ?");
        values.push(Box::new(thread.clone()));
    }
    if let Some(ref tags) = filter.tags {
        for tag in tags {
            sql.push_str(
                " AND e.id IN (SELECT et.engram_id FROM engram_tags et
                               JOIN tags t ON et.tag_id = t.id WHERE t.name = ?)",
            );
            values.push(Box::new(tag.clone()));
        }
    }
    if !filter.include_superseded {
        sql.push_str(" AND e.superseded_at IS NULL");
    }
    if let Some(protected) = filter.protected {
        sql.push_str(" AND e.protected = ?");
        values.push(Box::new(protected));
    }
    if let Some(after) = filter.inserted_after {
        sql.push_str(" AND e.inserted_at >= ?");
        values.push(Box::new(format_ts(after)));
    }
    if let Some(before) = filter.inserted_before {
        sql.push_str(" AND e.inserted_at <= ?");
        values.push(Box::new(format_ts(before)));
    }
}

/// List engrams newest first
pub fn list_recent(conn: &Connection, filter: &EngramFilter, limit: usize) -> Result<Vec<Engram>> {
    let mut sql = format!("SELECT {} FROM engrams e WHERE 1=1", ENGRAM_COLUMNS);
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    push_filter_sql(filter, &mut sql, &mut values);
    sql.push_str(" ORDER BY e.inserted_at DESC LIMIT ?");
    values.push(Box::new(limit as i64));

    let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let mut engrams: Vec<Engram> = stmt
        .query_map(refs.as_slice(), engram_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    for engram in &mut engrams {
        engram.tags = load_tags(conn, engram.id)?;
    }
    Ok(engrams)
}

/// Ranked full-text search
///
/// Uses FTS5 bm25() when the index exists; otherwise a case-insensitive
/// substring match over whitespace tokens of length >= 2, ranked by
/// importance descending.
pub fn lexical_search(
    conn: &Connection,
    query: &str,
    limit: usize,
    filter: &EngramFilter,
) -> Result<Vec<(Engram, f32)>> {
    if query.trim().is_empty() {
        return Ok(vec![]);
    }

    if fts_available(conn) {
        match fts_search(conn, query, limit, filter) {
            Ok(results) => return Ok(results),
            Err(e) => {
                tracing::warn!("FTS query failed, using substring fallback: {}", e);
            }
        }
    }

    substring_search(conn, query, limit, filter)
}

fn fts_search(
    conn: &Connection,
    query: &str,
    limit: usize,
    filter: &EngramFilter,
) -> Result<Vec<(Engram, f32)>> {
    let escaped = escape_fts_query(query);
    if escaped.is_empty() {
        return Ok(vec![]);
    }

    let mut sql = format!(
        "SELECT {}, bm25(engrams_fts) AS rank
         FROM engrams_fts fts
         JOIN engrams e ON fts.rowid = e.id
         WHERE engrams_fts MATCH ?",
        ENGRAM_COLUMNS
    );
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(escaped)];
    push_filter_sql(filter, &mut sql, &mut values);
    sql.push_str(" ORDER BY bm25(engrams_fts) LIMIT ?");
    values.push(Box::new(limit as i64));

    let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(refs.as_slice(), |row| {
        let engram = engram_from_row(row)?;
        let rank: f64 = row.get("rank")?;
        Ok((engram, rank))
    })?;

    let mut results = Vec::new();
    for row in rows {
        let (mut engram, rank) = row?;
        engram.tags = load_tags(conn, engram.id)?;
        // bm25() is negative, closer to 0 = better; normalize to (0, 1]
        let score = 1.0 / (1.0 + rank.abs() as f32);
        results.push((engram, score));
    }
    Ok(results)
}

/// Substring fallback: token-AND over tokens of length >= 2
fn substring_search(
    conn: &Connection,
    query: &str,
    limit: usize,
    filter: &EngramFilter,
) -> Result<Vec<(Engram, f32)>> {
    let tokens: Vec<String> = query
        .split_whitespace()
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .collect();
    if tokens.is_empty() {
        return Ok(vec![]);
    }

    let mut sql = format!("SELECT {} FROM engrams e WHERE 1=1", ENGRAM_COLUMNS);
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    for token in &tokens {
        sql.push_str(" AND LOWER(e.content) LIKE ?");
        values.push(Box::new(format!("%{}%", token)));
    }
    push_filter_sql(filter, &mut sql, &mut values);
    sql.push_str(" ORDER BY e.importance DESC LIMIT ?");
    values.push(Box::new(limit as i64));

    let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let mut results = Vec::new();
    for row in stmt.query_map(refs.as_slice(), engram_from_row)? {
        let mut engram = row?;
        engram.tags = load_tags(conn, engram.id)?;
        let score = engram.importance;
        results.push((engram, score));
    }
    Ok(results)
}

/// Escape user input for an FTS5 MATCH expression
///
/// Quotes any term carrying FTS5 operator characters and the boolean
/// operators themselves, so user text cannot inject query syntax.
fn escape_fts_query(query: &str) -> String {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    trimmed
        .split_whitespace()
        .map(escape_fts_term)
        .collect::<Vec<_>>()
        .join(" ")
}

fn escape_fts_term(term: &str) -> String {
    // Anything beyond plain alphanumerics can carry FTS5 operator
    // meaning (quotes, wildcards, column filters, NEAR, +/-)
    let needs_quotes = term.chars().any(|c| !c.is_ascii_alphanumeric());
    let is_operator = matches!(term, "AND" | "OR" | "NOT" | "NEAR");

    if needs_quotes || is_operator {
        let mut escaped = String::with_capacity(term.len() + 4);
        escaped.push('"');
        for c in term.chars() {
            if c == '"' {
                escaped.push_str("\"\"");
            } else {
                escaped.push(c);
            }
        }
        escaped.push('"');
        escaped
    } else {
        term.to_string()
    }
}

/// Store the float embedding for an engram
pub fn store_embedding(
    conn: &Connection,
    id: EngramId,
    embedding: &[f32],
    model: Option<&str>,
) -> Result<()> {
    if embedding.is_empty() {
        return Err(LimbicError::Validation("embedding must be non-empty".into()));
    }
    let bytes: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();
    let now = format_ts(Utc::now());
    conn.execute(
        "INSERT OR REPLACE INTO embeddings (engram_id, embedding, dimensions, model, created_at)
         VALUES (?, ?, ?, ?, ?)",
        params![id, bytes, embedding.len(), model, now],
    )?;
    conn.execute(
        "UPDATE engrams SET has_embedding = 1 WHERE id = ?",
        params![id],
    )?;
    Ok(())
}

/// Load the float embedding for an engram
pub fn get_embedding(conn: &Connection, id: EngramId) -> Result<Option<Vec<f32>>> {
    let row = conn
        .query_row(
            "SELECT embedding, dimensions FROM embeddings WHERE engram_id = ?",
            params![id],
            |row| {
                let bytes: Vec<u8> = row.get(0)?;
                let dimensions: usize = row.get(1)?;
                Ok((bytes, dimensions))
            },
        )
        .optional()?;

    match row {
        Some((bytes, dimensions)) => {
            let expected = dimensions.checked_mul(4).ok_or_else(|| {
                LimbicError::Validation("embedding dimensions too large".into())
            })?;
            if bytes.len() != expected {
                return Err(LimbicError::Validation(format!(
                    "embedding byte length {} does not match dimensions {}",
                    bytes.len(),
                    dimensions
                )));
            }
            let mut embedding = Vec::with_capacity(dimensions);
            for chunk in bytes.chunks_exact(4) {
                let arr: [u8; 4] = chunk.try_into().expect("chunks_exact(4)");
                embedding.push(f32::from_le_bytes(arr));
            }
            Ok(Some(embedding))
        }
        None => Ok(None),
    }
}

/// Nearest neighbours by cosine similarity against a query vector
pub fn vector_search(
    conn: &Connection,
    query: &[f32],
    top_k: usize,
    min_similarity: Option<f32>,
    filter: &EngramFilter,
) -> Result<Vec<(Engram, f32)>> {
    if query.is_empty() {
        return Ok(vec![]);
    }

    let mut sql = format!(
        "SELECT {} FROM engrams e WHERE e.has_embedding = 1",
        ENGRAM_COLUMNS
    );
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    push_filter_sql(filter, &mut sql, &mut values);

    let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let candidates: Vec<Engram> = stmt
        .query_map(refs.as_slice(), engram_from_row)?
        .filter_map(|r| r.ok())
        .collect();

    let threshold = min_similarity.unwrap_or(f32::MIN);
    let mut scored: Vec<(Engram, f32)> = Vec::new();
    for mut engram in candidates {
        if let Some(embedding) = get_embedding(conn, engram.id)? {
            let similarity = cosine_similarity(query, &embedding);
            if similarity >= threshold {
                engram.tags = load_tags(conn, engram.id)?;
                engram.embedding = Some(embedding);
                scored.push((engram, similarity));
            }
        }
    }

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);
    Ok(scored)
}

/// Atomic batched access update: `access_count += inc, last_accessed_at = now`
/// for every id in the group
pub fn batch_touch(
    conn: &Connection,
    ids: &[EngramId],
    increment: i64,
    now: DateTime<Utc>,
) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
    let sql = format!(
        "UPDATE engrams SET access_count = access_count + ?, last_accessed_at = ?
         WHERE id IN ({})",
        placeholders.join(", ")
    );
    let ts = format_ts(now);
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(increment), Box::new(ts)];
    for id in ids {
        values.push(Box::new(*id));
    }
    let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    Ok(conn.execute(&sql, refs.as_slice())?)
}

/// Flip the protection flag (admin operation)
pub fn set_protected(conn: &Connection, id: EngramId, protected: bool) -> Result<()> {
    let n = conn.execute(
        "UPDATE engrams SET protected = ?, updated_at = ? WHERE id = ?",
        params![protected, format_ts(Utc::now()), id],
    )?;
    if n == 0 {
        return Err(LimbicError::NotFound(id));
    }
    Ok(())
}

/// Mark an engram superseded, excluding it from active retrieval
pub fn supersede(conn: &Connection, id: EngramId) -> Result<()> {
    let n = conn.execute(
        "UPDATE engrams SET superseded_at = ?, updated_at = ? WHERE id = ?",
        params![format_ts(Utc::now()), format_ts(Utc::now()), id],
    )?;
    if n == 0 {
        return Err(LimbicError::NotFound(id));
    }
    Ok(())
}

/// Merge keys into an engram's metadata JSON
pub fn merge_metadata(
    conn: &Connection,
    id: EngramId,
    patch: &HashMap<String, serde_json::Value>,
) -> Result<()> {
    let engram = get_engram(conn, id)?;
    let mut metadata = engram.metadata;
    for (key, value) in patch {
        metadata.insert(key.clone(), value.clone());
    }
    conn.execute(
        "UPDATE engrams SET metadata = ?, updated_at = ? WHERE id = ?",
        params![serde_json::to_string(&metadata)?, format_ts(Utc::now()), id],
    )?;
    Ok(())
}

/// Distinct UTC dates on which any engram was accessed; used to rebuild
/// the activity tracker on startup
pub fn distinct_access_dates(conn: &Connection) -> Result<Vec<NaiveDate>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT date(last_accessed_at) FROM engrams
         WHERE last_accessed_at IS NOT NULL",
    )?;
    let dates = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok())
        .filter_map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
        .collect();
    Ok(dates)
}

/// Read up to `limit` unprotected engrams (forgetting sweep input)
pub fn unprotected_batch(conn: &Connection, limit: usize) -> Result<Vec<Engram>> {
    let sql = format!(
        "SELECT {} FROM engrams e WHERE e.protected = 0 LIMIT ?",
        ENGRAM_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let engrams = stmt
        .query_map(params![limit as i64], engram_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(engrams)
}

/// Recent engrams that have not been through synthesis
pub fn unsynthesized_recent(conn: &Connection, limit: usize) -> Result<Vec<Engram>> {
    let sql = format!(
        "SELECT {} FROM engrams e
         WHERE e.superseded_at IS NULL
           AND json_extract(e.metadata, '$.synthesized_at') IS NULL
           AND COALESCE(json_extract(e.metadata, '$.source'), '') != 'autonomous_synthesis'
         ORDER BY e.inserted_at DESC LIMIT ?",
        ENGRAM_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let engrams = stmt
        .query_map(params![limit as i64], engram_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(engrams)
}

/// Aggregate statistics over the store
pub fn store_stats(conn: &Connection) -> Result<StoreStats> {
    let total_engrams: i64 = conn.query_row("SELECT COUNT(*) FROM engrams", [], |r| r.get(0))?;
    let active_engrams: i64 = conn.query_row(
        "SELECT COUNT(*) FROM engrams WHERE superseded_at IS NULL",
        [],
        |r| r.get(0),
    )?;
    let protected_engrams: i64 = conn.query_row(
        "SELECT COUNT(*) FROM engrams WHERE protected = 1",
        [],
        |r| r.get(0),
    )?;
    let engrams_with_embeddings: i64 = conn.query_row(
        "SELECT COUNT(*) FROM engrams WHERE has_embedding = 1",
        [],
        |r| r.get(0),
    )?;
    let db_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    let mut category_counts = HashMap::new();
    let mut stmt = conn.prepare("SELECT category, COUNT(*) FROM engrams GROUP BY category")?;
    for row in stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })? {
        let (category, count) = row?;
        category_counts.insert(category, count);
    }

    let mut project_counts = HashMap::new();
    let mut stmt = conn.prepare("SELECT project_id, COUNT(*) FROM engrams GROUP BY project_id")?;
    for row in stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })? {
        let (project, count) = row?;
        project_counts.insert(project, count);
    }

    Ok(StoreStats {
        total_engrams,
        active_engrams,
        protected_engrams,
        engrams_with_embeddings,
        db_size_bytes,
        category_counts,
        project_counts,
    })
}
