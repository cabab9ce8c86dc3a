use std::sync::Arc;

use chrono::NaiveDateTime;
use futures_util::{TryStreamExt, pin_mut};
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row, Statement};

use crate::error::SqlBatchError;
use crate::results::ResultSet;
use crate::types::RowValues;

/// Run a statement and collect every row (and, for DML, the affected-row
/// count) into a `ResultSet`.
///
/// Uses the raw query path so one code path serves both queries and DML;
/// concurrent callers on the same client are pipelined by tokio-postgres.
///
/// # Errors
/// Returns errors from query execution or result processing.
pub async fn build_result_set(
    client: &Client,
    stmt: &Statement,
    params: &[RowValues],
) -> Result<ResultSet, SqlBatchError> {
    let stream = client
        .query_raw(stmt, params.iter().map(|p| p as &dyn ToSql))
        .await?;
    pin_mut!(stream);

    let column_names: Vec<String> = stmt
        .columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect();

    let mut result_set = ResultSet::with_capacity(0);
    result_set.set_column_names(Arc::new(column_names));

    let col_count = stmt.columns().len();
    while let Some(row) = stream.try_next().await? {
        let mut row_values = Vec::with_capacity(col_count);
        for i in 0..col_count {
            row_values.push(extract_value(&row, i)?);
        }
        result_set.add_row_values(row_values);
    }

    result_set.rows_affected = stream.rows_affected().unwrap_or(0);

    Ok(result_set)
}

/// Extracts a `RowValues` from a `tokio_postgres` Row at the given index
fn extract_value(row: &Row, idx: usize) -> Result<RowValues, SqlBatchError> {
    let type_info = row.columns()[idx].type_();

    match type_info.name() {
        "int2" => {
            let val: Option<i16> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, |v| RowValues::Int(i64::from(v))))
        }
        "int4" => {
            let val: Option<i32> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, |v| RowValues::Int(i64::from(v))))
        }
        "int8" => {
            let val: Option<i64> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Int))
        }
        "float4" | "float8" => {
            let val: Option<f64> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Float))
        }
        "bool" => {
            let val: Option<bool> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Bool))
        }
        "timestamp" | "timestamptz" => {
            let val: Option<NaiveDateTime> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Timestamp))
        }
        "json" | "jsonb" => {
            let val: Option<Value> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::JSON))
        }
        "bytea" => {
            let val: Option<Vec<u8>> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Blob))
        }
        _ => {
            // Includes text/varchar/char; other types are read as text.
            let val: Option<String> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Text))
        }
    }
}
