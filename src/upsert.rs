use anyhow::{bail, Context, Result};
use rusqlite::{params_from_iter, Connection};
use std::collections::HashSet;
use uuid::Uuid;

use crate::batch::Batch;
use crate::db::quote_ident;

/// Merge a batch into `table`, keyed on `key_columns`.
///
/// The batch is staged into a transient temp table, merged into the target
/// with a single set-based statement, and the staging table dropped - all
/// inside one transaction. Rows whose key already exists have their non-key
/// columns overwritten; new keys are inserted. Returns the number of rows
/// the merge wrote (inserts plus updates).
///
/// Duplicate keys WITHIN the batch are a caller error: SQLite would quietly
/// keep the last row, other engines reject the statement outright, so
/// neither behavior is portable enough to rely on.
pub fn upsert_batch(
    conn: &mut Connection,
    table: &str,
    key_columns: &[&str],
    batch: &Batch,
) -> Result<usize> {
    if batch.is_empty() {
        return Ok(0);
    }

    if key_columns.is_empty() {
        bail!("Upsert into {} requires at least one key column", table);
    }

    let mut key_indexes = Vec::with_capacity(key_columns.len());
    for key in key_columns {
        let idx = batch.column_index(key).with_context(|| {
            format!("Key column {} is not part of the batch for {}", key, table)
        })?;
        key_indexes.push(idx);
    }

    // Reject in-batch duplicates before touching the database
    let mut seen = HashSet::with_capacity(batch.len());
    for row in batch.rows() {
        let key: Vec<String> = key_indexes
            .iter()
            .map(|&i| format!("{:?}", row[i]))
            .collect();
        if !seen.insert(key.clone()) {
            bail!(
                "Duplicate key ({}) within batch for {}",
                key.join(", "),
                table
            );
        }
    }

    let staging = format!("staging_{}_{}", table, Uuid::new_v4().simple());
    let quoted_staging = quote_ident(&staging);
    let quoted_cols: Vec<String> = batch.columns().iter().map(|c| quote_ident(c)).collect();

    let tx = conn.transaction()?;

    // ==========================================================================
    // Stage: typeless temp table shaped exactly like the batch
    // ==========================================================================
    tx.execute(
        &format!(
            "CREATE TEMP TABLE {} ({})",
            quoted_staging,
            quoted_cols.join(", ")
        ),
        [],
    )?;

    let placeholders: Vec<String> = (1..=quoted_cols.len()).map(|i| format!("?{}", i)).collect();
    let insert_sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quoted_staging,
        quoted_cols.join(", "),
        placeholders.join(", ")
    );

    {
        let mut stmt = tx.prepare(&insert_sql)?;
        for row in batch.rows() {
            stmt.execute(params_from_iter(row.iter()))?;
        }
    }

    // ==========================================================================
    // Merge: one set-based statement, then drop the staging table
    // ==========================================================================
    let merge_sql = build_merge_sql(table, &staging, batch.columns(), key_columns);
    let merged = tx
        .execute(&merge_sql, [])
        .with_context(|| format!("Failed to merge staged rows into {}", table))?;

    tx.execute(&format!("DROP TABLE {}", quoted_staging), [])?;

    tx.commit()?;

    Ok(merged)
}

/// Build the INSERT ... SELECT ... ON CONFLICT statement for one merge.
///
/// Key-only batches get DO NOTHING: there is no column left to update, and
/// an empty SET clause is a syntax error.
fn build_merge_sql(
    table: &str,
    staging: &str,
    columns: &[String],
    key_columns: &[&str],
) -> String {
    let col_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let key_list = key_columns
        .iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ");

    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !key_columns.contains(&c.as_str()))
        .map(|c| format!("{} = excluded.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    // The WHERE true is required: without it SQLite parses ON as a join clause
    format!(
        "INSERT INTO {} ({}) SELECT {} FROM {} WHERE true ON CONFLICT({}) {}",
        quote_ident(table),
        col_list,
        col_list,
        quote_ident(staging),
        key_list,
        action
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{setup_database, table_count};
    use rusqlite::types::Value;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn lookup_batch(rows: &[(&str, &str)]) -> Batch {
        let mut batch = Batch::new(&["codigo", "descricao"]);
        for (codigo, descricao) in rows {
            batch
                .push(vec![
                    Value::from(codigo.to_string()),
                    Value::from(descricao.to_string()),
                ])
                .unwrap();
        }
        batch
    }

    fn descricao_of(conn: &Connection, codigo: &str) -> String {
        conn.query_row(
            "SELECT descricao FROM cnaes WHERE codigo = ?1",
            [codigo],
            |row| row.get(0),
        )
        .unwrap()
    }

    fn staging_leftovers(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_temp_master WHERE name LIKE 'staging_%'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_upsert_inserts_new_rows() {
        let mut conn = test_conn();

        let batch = lookup_batch(&[("0111301", "Cultivo de arroz"), ("0111302", "Cultivo de milho")]);
        let written = upsert_batch(&mut conn, "cnaes", &["codigo"], &batch).unwrap();

        assert_eq!(written, 2, "Both rows should be inserted");
        assert_eq!(table_count(&conn, "cnaes").unwrap(), 2);
        assert_eq!(descricao_of(&conn, "0111301"), "Cultivo de arroz");
        assert_eq!(staging_leftovers(&conn), 0, "Staging table must be dropped");
    }

    #[test]
    fn test_upsert_mixes_inserts_and_updates() {
        let mut conn = test_conn();

        conn.execute(
            "INSERT INTO cnaes (codigo, descricao) VALUES
             ('0111301', 'Descricao antiga'),
             ('9999999', 'Fora do lote')",
            [],
        )
        .unwrap();

        let batch = lookup_batch(&[("0111301", "Cultivo de arroz"), ("0111302", "Cultivo de milho")]);
        let written = upsert_batch(&mut conn, "cnaes", &["codigo"], &batch).unwrap();

        assert_eq!(written, 2, "One update plus one insert");
        assert_eq!(
            table_count(&conn, "cnaes").unwrap(),
            3,
            "Existing key must not duplicate"
        );
        assert_eq!(
            descricao_of(&conn, "0111301"),
            "Cultivo de arroz",
            "Conflicting key should take the staged value"
        );
        assert_eq!(descricao_of(&conn, "0111302"), "Cultivo de milho");
        assert_eq!(
            descricao_of(&conn, "9999999"),
            "Fora do lote",
            "Keys absent from the batch must stay untouched"
        );
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut conn = test_conn();

        let batch = lookup_batch(&[("0111301", "Cultivo de arroz"), ("0111302", "Cultivo de milho")]);
        upsert_batch(&mut conn, "cnaes", &["codigo"], &batch).unwrap();
        upsert_batch(&mut conn, "cnaes", &["codigo"], &batch).unwrap();

        assert_eq!(
            table_count(&conn, "cnaes").unwrap(),
            2,
            "Re-importing the same batch must not grow the table"
        );
        assert_eq!(descricao_of(&conn, "0111301"), "Cultivo de arroz");

        println!("✅ Idempotency test PASSED: same batch twice leaves 2 rows");
    }

    #[test]
    fn test_key_only_batch_preserves_existing_columns() {
        let mut conn = test_conn();

        conn.execute(
            "INSERT INTO companies (cnpj_basico, razao_social) VALUES ('11222333', 'ACME LTDA')",
            [],
        )
        .unwrap();

        let mut batch = Batch::new(&["cnpj_basico"]);
        batch.push(vec![Value::from("11222333".to_string())]).unwrap();
        batch.push(vec![Value::from("99888777".to_string())]).unwrap();

        let written = upsert_batch(&mut conn, "companies", &["cnpj_basico"], &batch).unwrap();

        assert_eq!(written, 1, "Only the new key should count as written");
        assert_eq!(table_count(&conn, "companies").unwrap(), 2);

        let razao: String = conn
            .query_row(
                "SELECT razao_social FROM companies WHERE cnpj_basico = '11222333'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(
            razao, "ACME LTDA",
            "Key-only batches must not blank out existing columns"
        );
    }

    #[test]
    fn test_duplicate_keys_within_batch_rejected() {
        let mut conn = test_conn();

        let batch = lookup_batch(&[("0111301", "Primeira"), ("0111301", "Segunda")]);
        let err = upsert_batch(&mut conn, "cnaes", &["codigo"], &batch).unwrap_err();

        assert!(
            err.to_string().contains("Duplicate key"),
            "Got: {}",
            err
        );
        assert_eq!(
            table_count(&conn, "cnaes").unwrap(),
            0,
            "Nothing should be written when the batch is rejected"
        );
    }

    #[test]
    fn test_failed_merge_rolls_back_cleanly() {
        let mut conn = test_conn();

        conn.execute(
            "INSERT INTO cnaes (codigo, descricao) VALUES ('0111301', 'Cultivo de arroz')",
            [],
        )
        .unwrap();

        // Column that does not exist in the target table
        let mut batch = Batch::new(&["codigo", "no_such_column"]);
        batch
            .push(vec![
                Value::from("0111302".to_string()),
                Value::from("x".to_string()),
            ])
            .unwrap();

        let result = upsert_batch(&mut conn, "cnaes", &["codigo"], &batch);
        assert!(result.is_err(), "Merge into unknown column must fail");

        assert_eq!(
            table_count(&conn, "cnaes").unwrap(),
            1,
            "Target table must be unchanged after a failed merge"
        );
        assert_eq!(
            staging_leftovers(&conn),
            0,
            "Rollback must not leave a staging table behind"
        );
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut conn = test_conn();

        let batch = Batch::new(&["codigo", "descricao"]);
        let written = upsert_batch(&mut conn, "cnaes", &["codigo"], &batch).unwrap();

        assert_eq!(written, 0);
        assert_eq!(table_count(&conn, "cnaes").unwrap(), 0);
    }

    #[test]
    fn test_key_column_must_be_in_batch() {
        let mut conn = test_conn();

        let mut batch = Batch::new(&["descricao"]);
        batch.push(vec![Value::from("sem chave".to_string())]).unwrap();

        let err = upsert_batch(&mut conn, "cnaes", &["codigo"], &batch).unwrap_err();
        assert!(
            err.to_string().contains("not part of the batch"),
            "Got: {}",
            err
        );
    }

    #[test]
    fn test_merge_sql_shape() {
        let columns = vec!["codigo".to_string(), "descricao".to_string()];
        let sql = build_merge_sql("cnaes", "staging_cnaes_abc", &columns, &["codigo"]);

        assert!(sql.contains("WHERE true"), "Got: {}", sql);
        assert!(sql.contains("ON CONFLICT(\"codigo\")"), "Got: {}", sql);
        assert!(
            sql.contains("DO UPDATE SET \"descricao\" = excluded.\"descricao\""),
            "Got: {}",
            sql
        );
    }

    #[test]
    fn test_merge_sql_key_only_batch_does_nothing() {
        let columns = vec!["cnpj_basico".to_string()];
        let sql = build_merge_sql("companies", "staging_companies_abc", &columns, &["cnpj_basico"]);

        assert!(sql.ends_with("DO NOTHING"), "Got: {}", sql);
        assert!(!sql.contains("DO UPDATE"), "Got: {}", sql);
    }
}
