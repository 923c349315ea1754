use super::{Db, decode_list, encode_list};
use crate::error::StoreError;
use crate::models::EnrichmentRecord;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use std::collections::HashMap;

fn map_record(row: &Row<'_>) -> rusqlite::Result<EnrichmentRecord> {
    let tags: String = row.get(3)?;
    let side_effects: String = row.get(4)?;
    let pitfalls: String = row.get(5)?;
    let created_at: DateTime<Utc> = row.get(7)?;
    Ok(EnrichmentRecord {
        span_hash: row.get(0)?,
        summary: row.get(1)?,
        usage_notes: row.get(2)?,
        tags: decode_list(&tags),
        side_effects: decode_list(&side_effects),
        pitfalls: decode_list(&pitfalls),
        model_id: row.get(6)?,
        created_at,
        schema_version: row.get(8)?,
    })
}

const SELECT_RECORD: &str = "SELECT span_hash, summary, usage_notes, tags, side_effects, pitfalls, model_id, created_at, schema_version FROM enrichments";

impl Db {
    /// Look up the current record for a span.
    pub fn get_enrichment(&self, span_hash: &str) -> Result<Option<EnrichmentRecord>, StoreError> {
        let record = self
            .conn
            .query_row(
                &format!("{SELECT_RECORD} WHERE span_hash = ?"),
                params![span_hash],
                map_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Point lookups for many spans. Spans without a record are absent
    /// from the returned map.
    pub fn get_enrichments<S: AsRef<str>>(
        &self,
        span_hashes: &[S],
    ) -> Result<HashMap<String, EnrichmentRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("{SELECT_RECORD} WHERE span_hash = ?"))?;

        let mut records = HashMap::new();
        for hash in span_hashes {
            if let Some(record) = stmt
                .query_row(params![hash.as_ref()], map_record)
                .optional()?
            {
                records.insert(record.span_hash.clone(), record);
            }
        }
        Ok(records)
    }

    /// Insert or supersede the record for `record.span_hash`.
    ///
    /// A single statement, so a span's record is replaced atomically. An
    /// incoming record older than the stored one is ignored; the return
    /// value says whether the write took effect.
    pub fn upsert_enrichment(&self, record: &EnrichmentRecord) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            r#"
            INSERT INTO enrichments (span_hash, summary, usage_notes, tags, side_effects, pitfalls, model_id, created_at, schema_version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(span_hash) DO UPDATE SET
                summary = excluded.summary,
                usage_notes = excluded.usage_notes,
                tags = excluded.tags,
                side_effects = excluded.side_effects,
                pitfalls = excluded.pitfalls,
                model_id = excluded.model_id,
                created_at = excluded.created_at,
                schema_version = excluded.schema_version
            WHERE excluded.created_at >= enrichments.created_at
            "#,
            params![
                record.span_hash,
                record.summary,
                record.usage_notes,
                encode_list(&record.tags),
                encode_list(&record.side_effects),
                encode_list(&record.pitfalls),
                record.model_id,
                record.created_at,
                record.schema_version,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Number of stored records.
    pub fn enrichment_count(&self) -> Result<usize, StoreError> {
        let count: usize = self
            .conn
            .query_row("SELECT COUNT(*) FROM enrichments", [], |row| row.get(0))?;
        Ok(count)
    }
}
