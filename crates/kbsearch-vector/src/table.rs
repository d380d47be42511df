//! LanceDB connection helpers and Arrow row codecs for chunk tables.

use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{Array, ArrayRef, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use lancedb::{connect, Connection, Table};
use std::sync::Arc;

use kbsearch_core::error::{Error, Result};
use kbsearch_core::types::ChunkRecord;

use crate::schema::{build_arrow_schema, parse_table_dim};

pub async fn open_db(uri: &str) -> Result<Connection> {
    connect(uri).execute().await.map_err(Error::vector)
}

/// Chunk tables present in the database as `(dim, name)`, ascending by dim.
pub async fn chunk_tables(conn: &Connection) -> Result<Vec<(usize, String)>> {
    let names = conn.table_names().execute().await.map_err(Error::vector)?;
    let mut tables: Vec<(usize, String)> = names
        .into_iter()
        .filter_map(|n| parse_table_dim(&n).map(|d| (d, n)))
        .collect();
    tables.sort();
    Ok(tables)
}

pub async fn open_table(conn: &Connection, name: &str) -> Result<Option<Table>> {
    let names = conn.table_names().execute().await.map_err(Error::vector)?;
    if !names.iter().any(|n| n == name) {
        return Ok(None);
    }
    conn.open_table(name).execute().await.map(Some).map_err(Error::vector)
}

/// Open `name`, creating an empty table with the chunk schema for `dim` if missing.
pub async fn ensure_table(conn: &Connection, name: &str, dim: usize) -> Result<Table> {
    if let Some(t) = open_table(conn, name).await? {
        return Ok(t);
    }
    let schema = build_arrow_schema(dim_i32(dim)?);
    // create empty table with 0 rows
    let iter = RecordBatchIterator::new(vec![].into_iter(), schema);
    conn.create_table(name, Box::new(iter)).execute().await.map_err(Error::vector)
}

fn dim_i32(dim: usize) -> Result<i32> {
    i32::try_from(dim).map_err(|_| Error::InvalidInput(format!("vector dimensionality {dim} is too large")))
}

/// Single-quoted SQL string literal.
pub fn sql_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn sql_in_list(values: &[String]) -> String {
    values.iter().map(|v| sql_str(v)).collect::<Vec<_>>().join(",")
}

pub fn kb_filter(kb_id: &str) -> String {
    format!("kb_id = {}", sql_str(kb_id))
}

pub fn doc_filter(kb_id: &str, doc_id: &str) -> String {
    format!("kb_id = {} AND doc_id = {}", sql_str(kb_id), sql_str(doc_id))
}

pub fn chunk_ids_filter(kb_id: &str, chunk_ids: &[String]) -> String {
    format!("kb_id = {} AND chunk_id IN ({})", sql_str(kb_id), sql_in_list(chunk_ids))
}

pub fn to_record_batch(rows: &[ChunkRecord], vectors: &[Vec<f32>], dim: usize) -> Result<RecordBatch> {
    let schema = build_arrow_schema(dim_i32(dim)?);
    let indexes: Vec<i64> = rows.iter().map(|r| i64::from(r.chunk_index)).collect();
    let vecs: Vec<Option<Vec<Option<f32>>>> = vectors.iter().map(|v| Some(v.iter().map(|&x| Some(x)).collect())).collect();
    RecordBatch::try_new(
        schema,
        vec![
            text_col(rows, |r| r.kb_id.as_str()),
            text_col(rows, |r| r.chunk_id.as_str()),
            text_col(rows, |r| r.doc_id.as_str()),
            text_col(rows, |r| r.filename.as_str()),
            Arc::new(Int64Array::from(indexes)),
            text_col(rows, |r| r.content.as_str()),
            text_col(rows, |r| r.ingest_generation.as_str()),
            Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(vecs.into_iter(), dim_i32(dim)?)),
        ],
    )
    .map_err(Error::vector)
}

fn text_col(rows: &[ChunkRecord], f: impl Fn(&ChunkRecord) -> &str) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(|r| f(r).to_string()).collect::<Vec<_>>()))
}

/// A decoded chunk-table row, plus the native distance when the batch came
/// from a vector search.
pub struct StoredRow {
    pub chunk: ChunkRecord,
    pub vector: Vec<f32>,
    pub distance: Option<f32>,
}

fn str_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::Vector(format!("column '{name}' missing or not utf8")))
}

pub fn decode_rows(batch: &RecordBatch) -> Result<Vec<StoredRow>> {
    let kb = str_col(batch, "kb_id")?;
    let chunk_id = str_col(batch, "chunk_id")?;
    let doc = str_col(batch, "doc_id")?;
    let filename = str_col(batch, "filename")?;
    let content = str_col(batch, "content")?;
    let generation = str_col(batch, "generation")?;
    let index = batch
        .column_by_name("chunk_index")
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| Error::Vector("column 'chunk_index' missing or not int64".into()))?;
    let vectors = batch
        .column_by_name("vector")
        .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
        .ok_or_else(|| Error::Vector("column 'vector' missing or not a fixed size list".into()))?;
    let distance = batch.column_by_name("_distance").and_then(|c| c.as_any().downcast_ref::<Float32Array>());

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let vector = if vectors.is_valid(i) {
            let list = vectors.value(i);
            list.as_primitive_opt::<Float32Type>().map(|p| p.values().to_vec()).unwrap_or_default()
        } else {
            Vec::new()
        };
        out.push(StoredRow {
            chunk: ChunkRecord {
                chunk_id: chunk_id.value(i).to_string(),
                kb_id: kb.value(i).to_string(),
                doc_id: doc.value(i).to_string(),
                filename: filename.value(i).to_string(),
                chunk_index: u32::try_from(index.value(i)).unwrap_or(u32::MAX),
                content: content.value(i).to_string(),
                ingest_generation: generation.value(i).to_string(),
            },
            vector,
            distance: distance.filter(|d| d.is_valid(i)).map(|d| d.value(i)),
        });
    }
    Ok(out)
}

/// Drain a query stream into decoded rows.
pub async fn collect_rows<S, E>(mut stream: S) -> Result<Vec<StoredRow>>
where
    S: futures::Stream<Item = std::result::Result<RecordBatch, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut rows = Vec::new();
    while let Some(batch) = futures::TryStreamExt::try_next(&mut stream).await.map_err(Error::vector)? {
        rows.extend(decode_rows(&batch)?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_literals_escape_quotes() {
        assert_eq!(sql_str("o'brien"), "'o''brien'");
        assert_eq!(chunk_ids_filter("kb", &["a".into(), "b'".into()]), "kb_id = 'kb' AND chunk_id IN ('a','b''')");
    }

    #[test]
    fn record_batch_decodes_back_to_rows() {
        let row = ChunkRecord {
            chunk_id: "c1".into(),
            kb_id: "kb".into(),
            doc_id: "d".into(),
            filename: "f.txt".into(),
            chunk_index: 7,
            content: "text".into(),
            ingest_generation: "g".into(),
        };
        let batch = to_record_batch(std::slice::from_ref(&row), &[vec![0.5, 0.25]], 2).expect("batch");
        let rows = decode_rows(&batch).expect("decode");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].chunk, row);
        assert_eq!(rows[0].vector, vec![0.5, 0.25]);
        assert!(rows[0].distance.is_none());
    }
}
