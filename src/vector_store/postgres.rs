//! pgvector-backed store over `tokio-postgres`.

use std::error::Error as StdError;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{pin_mut, StreamExt};
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error};

use super::{PatientName, ScopeFilter, TableName, VectorStore};
use crate::embeddings::{StoredResource, VectorLiteral};
use crate::normalizer::{FetchedValue, RawValue};
use crate::retrieval::{RankDirection, RetrievalRow};

/// Vector table living in a Postgres database with the `vector` extension.
pub struct PgVectorStore {
    client: Client,
    table: TableName,
}

impl PgVectorStore {
    /// Connects and spawns the connection driver on the current runtime.
    pub async fn connect(database_url: &str, table: TableName) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("failed to connect to Postgres")?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection error");
            }
        });
        Ok(Self { client, table })
    }

    /// Table this store reads and writes.
    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Creates the extension, the table and its cosine HNSW index if missing.
    pub async fn ensure_schema(&self, dims: usize) -> Result<()> {
        anyhow::ensure!(dims > 0, "embedding dimension must be positive");
        self.client
            .execute("CREATE EXTENSION IF NOT EXISTS vector", &[])
            .await
            .context("failed to ensure pgvector extension")?;
        self.client
            .execute(&create_table_sql(&self.table, dims), &[])
            .await
            .context("failed to create vector table")?;
        self.client
            .execute(&create_index_sql(&self.table), &[])
            .await
            .context("failed to create HNSW index")?;
        Ok(())
    }

    /// Number of stored rows.
    pub async fn count(&self) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table.qualified());
        let row = self
            .client
            .query_one(&sql, &[])
            .await
            .context("failed to count vector rows")?;
        Ok(row.get(0))
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn upsert(&self, record: &StoredResource) -> Result<()> {
        let vector = VectorLiteral::from_embedding(&record.embedding).to_pgvector();
        self.client
            .execute(
                &upsert_sql(&self.table),
                &[
                    &record.patient_id,
                    &record.patient_lastname,
                    &record.patient_firstname,
                    &record.resource_type,
                    &record.resource_id,
                    &vector,
                    &record.text,
                ],
            )
            .await
            .with_context(|| {
                format!(
                    "failed to upsert {}/{} for patient {}",
                    record.resource_type, record.resource_id, record.patient_id
                )
            })?;
        Ok(())
    }

    async fn nearest(
        &self,
        query: &VectorLiteral,
        scope: &ScopeFilter,
        top_k: usize,
        direction: RankDirection,
    ) -> Result<Vec<RetrievalRow>> {
        let vector = query.to_pgvector();
        let limit = i64::try_from(top_k).context("top_k exceeds i64 range")?;
        let rows = self
            .client
            .query(
                &nearest_sql(&self.table, direction),
                &[
                    &vector,
                    &scope.patient_id.as_deref(),
                    &scope.resource_type.as_deref(),
                    &limit,
                ],
            )
            .await
            .context("similarity query failed")?;
        rows.iter().map(retrieval_row).collect()
    }

    async fn resource_rows(&self, patient_id: &str, resource_type: &str) -> Result<Vec<FetchedValue>> {
        let sql = resource_rows_sql(&self.table);
        let params: [&(dyn ToSql + Sync); 2] = [&patient_id, &resource_type];
        let stream = self
            .client
            .query_raw(&sql, params.iter().map(|p| *p as &dyn ToSql))
            .await
            .with_context(|| format!("failed to query {resource_type} rows for patient {patient_id}"))?;
        pin_mut!(stream);

        let mut values = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(row) => values.push(Ok(raw_value(&row))),
                Err(err) => {
                    values.push(Err(anyhow::Error::new(err).context("row stream failed")));
                    break;
                }
            }
        }
        debug!(patient_id, resource_type, rows = values.len(), "resource rows fetched");
        Ok(values)
    }

    async fn patient_name(&self, patient_id: &str) -> Result<Option<PatientName>> {
        let sql = format!(
            "SELECT patient_firstname, patient_lastname FROM {} WHERE patient_id = $1 LIMIT 1",
            self.table.qualified()
        );
        let row = self
            .client
            .query_opt(&sql, &[&patient_id])
            .await
            .context("failed to look up patient name")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let first = row
            .try_get::<_, Option<String>>(0)
            .context("failed to read patient_firstname")?;
        let last = row
            .try_get::<_, Option<String>>(1)
            .context("failed to read patient_lastname")?;
        Ok(Some(patient_name_from(first, last)))
    }
}

/// Name columns are nullable; a missing part reads as empty.
fn patient_name_from(first: Option<String>, last: Option<String>) -> PatientName {
    PatientName {
        first: first.unwrap_or_default(),
        last: last.unwrap_or_default(),
    }
}

fn retrieval_row(row: &Row) -> Result<RetrievalRow> {
    Ok(RetrievalRow {
        entity_id: row.try_get("resource_id")?,
        group_key: row.try_get("patient_id")?,
        category: row.try_get("resource_type")?,
        score: row.try_get("score")?,
        payload: row.try_get("resource_text")?,
    })
}

/// Text column captured as raw bytes so encoding is validated by the normalizer.
struct RawText(Vec<u8>);

impl<'a> FromSql<'a> for RawText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(Self(raw.to_vec()))
    }

    fn accepts(ty: &Type) -> bool {
        is_text_type(ty)
    }
}

fn is_text_type(ty: &Type) -> bool {
    *ty == Type::TEXT
        || *ty == Type::VARCHAR
        || *ty == Type::BPCHAR
        || *ty == Type::NAME
        || *ty == Type::UNKNOWN
}

/// Maps the first column of a row onto [`RawValue`] by its SQL type.
fn raw_value(row: &Row) -> RawValue {
    let Some(column) = row.columns().first() else {
        return RawValue::Null;
    };
    let ty = column.type_().clone();
    let decoded = if is_text_type(&ty) {
        row.try_get::<_, Option<RawText>>(0)
            .map(|v| v.map_or(RawValue::Null, |text| RawValue::Bytes(text.0)))
    } else if ty == Type::TEXT_ARRAY || ty == Type::VARCHAR_ARRAY {
        row.try_get::<_, Option<Vec<Option<RawText>>>>(0).map(|v| {
            v.map_or(RawValue::Null, |items| {
                RawValue::List(
                    items
                        .into_iter()
                        .map(|item| item.map_or(RawValue::Null, |text| RawValue::Bytes(text.0)))
                        .collect(),
                )
            })
        })
    } else if ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(0)
            .map(|v| v.map_or(RawValue::Null, RawValue::Bytes))
    } else if ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(0)
            .map(|v| v.map_or(RawValue::Null, |n| RawValue::Integer(n.into())))
    } else if ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(0)
            .map(|v| v.map_or(RawValue::Null, |n| RawValue::Integer(n.into())))
    } else if ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(0)
            .map(|v| v.map_or(RawValue::Null, RawValue::Integer))
    } else if ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(0)
            .map(|v| v.map_or(RawValue::Null, |n| RawValue::Float(n.into())))
    } else if ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(0)
            .map(|v| v.map_or(RawValue::Null, RawValue::Float))
    } else {
        Ok(RawValue::Other(ty.name().to_string()))
    };
    decoded.unwrap_or_else(|_| RawValue::Other(ty.name().to_string()))
}

fn create_table_sql(table: &TableName, dims: usize) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            patient_id TEXT NOT NULL,
            patient_lastname TEXT NOT NULL DEFAULT '',
            patient_firstname TEXT NOT NULL DEFAULT '',
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            embedding VECTOR({dims}) NOT NULL,
            resource_text TEXT NOT NULL,
            PRIMARY KEY (patient_id, resource_type, resource_id)
        )",
        table.qualified()
    )
}

fn create_index_sql(table: &TableName) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} USING hnsw (embedding vector_cosine_ops)",
        table.hnsw_index_name(),
        table.qualified()
    )
}

fn upsert_sql(table: &TableName) -> String {
    format!(
        "INSERT INTO {} \
            (patient_id, patient_lastname, patient_firstname, resource_type, resource_id, embedding, resource_text) \
            VALUES ($1, $2, $3, $4, $5, $6::text::vector, $7) \
            ON CONFLICT (patient_id, resource_type, resource_id) DO UPDATE SET \
                patient_lastname = EXCLUDED.patient_lastname, \
                patient_firstname = EXCLUDED.patient_firstname, \
                embedding = EXCLUDED.embedding, \
                resource_text = EXCLUDED.resource_text",
        table.qualified()
    )
}

/// Top-K query. `score` is cosine similarity; rows are ordered by distance
/// in the opposite keyword so the HNSW index stays usable.
fn nearest_sql(table: &TableName, direction: RankDirection) -> String {
    let distance_order = match direction {
        RankDirection::HigherIsBetter => "ASC",
        RankDirection::LowerIsBetter => "DESC",
    };
    format!(
        "SELECT \
            resource_id, \
            patient_id, \
            resource_type, \
            resource_text, \
            (1 - (embedding <=> $1::text::vector))::float8 AS score \
        FROM {} \
        WHERE ($2::text IS NULL OR patient_id = $2::text) \
          AND ($3::text IS NULL OR resource_type = $3::text) \
        ORDER BY embedding <=> $1::text::vector {} \
        LIMIT $4",
        table.qualified(),
        distance_order
    )
}

fn resource_rows_sql(table: &TableName) -> String {
    format!(
        "SELECT resource_text FROM {} WHERE patient_id = $1 AND resource_type = $2 ORDER BY resource_id",
        table.qualified()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableName {
        TableName::new("public", "patient_vectors").unwrap()
    }

    #[test]
    fn nearest_sql_orders_distance_against_similarity_direction() {
        let desc = nearest_sql(&table(), RankDirection::HigherIsBetter);
        assert!(desc.contains("ORDER BY embedding <=> $1::text::vector ASC"));
        assert!(desc.contains("AS score"));
        let asc = nearest_sql(&table(), RankDirection::LowerIsBetter);
        assert!(asc.contains("ORDER BY embedding <=> $1::text::vector DESC"));
        assert!(asc.contains("LIMIT $4"));
    }

    #[test]
    fn upsert_targets_the_composite_key() {
        let sql = upsert_sql(&table());
        assert!(sql.starts_with("INSERT INTO \"public\".\"patient_vectors\""));
        assert!(sql.contains("ON CONFLICT (patient_id, resource_type, resource_id)"));
        assert!(sql.contains("$6::text::vector"));
    }

    #[test]
    fn schema_sql_uses_dimensions_and_cosine_ops() {
        assert!(create_table_sql(&table(), 768).contains("VECTOR(768)"));
        assert!(create_index_sql(&table()).contains("vector_cosine_ops"));
    }

    #[test]
    fn null_name_columns_read_as_empty() {
        let name = patient_name_from(None, Some("Doe".to_string()));
        assert_eq!(name.first, "");
        assert_eq!(name.display(), "Doe");
        assert_eq!(patient_name_from(None, None), PatientName::default());
        assert_eq!(patient_name_from(None, None).display(), "");
    }

    #[test]
    fn text_types_are_read_raw() {
        assert!(is_text_type(&Type::TEXT));
        assert!(is_text_type(&Type::VARCHAR));
        assert!(!is_text_type(&Type::INT4));
    }
}
