use anyhow::{bail, Context, Result};
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::batch::Batch;
use crate::upsert::upsert_batch;

/// One entry of the lookup-file catalog: which file loads into which table.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceSource {
    pub file_name: &'static str,
    pub table: &'static str,
}

/// Every code → description file the registry dumps ship with.
pub const REFERENCE_SOURCES: &[ReferenceSource] = &[
    ReferenceSource {
        file_name: "cnaes.csv",
        table: "cnaes",
    },
    ReferenceSource {
        file_name: "municipios.csv",
        table: "municipalities",
    },
    ReferenceSource {
        file_name: "naturezas.csv",
        table: "legal_natures",
    },
    ReferenceSource {
        file_name: "motivos.csv",
        table: "motivos_situacao_cadastral",
    },
];

/// A single code → description row.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReferenceRecord {
    pub codigo: String,
    pub descricao: Option<String>,
}

/// Parse a lookup file: strictly two semicolon-separated fields per line,
/// no header, quotes treated as ordinary characters. Any other field count
/// is fatal for the whole file.
pub fn parse_reference(text: &str) -> Result<Vec<ReferenceRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .quoting(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();

    for result in reader.records() {
        let record = result.context("Failed to read lookup row")?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        if record.len() != 2 {
            bail!(
                "Expected 2 fields on line {}, found {}",
                line,
                record.len()
            );
        }

        let codigo = record.get(0).unwrap_or("").to_string();
        let descricao = record.get(1).unwrap_or("");
        let descricao = if descricao.is_empty() {
            None
        } else {
            Some(descricao.to_string())
        };

        records.push(ReferenceRecord { codigo, descricao });
    }

    Ok(records)
}

/// Load one lookup file into its table. Returns the number of rows the
/// file contributed.
pub fn import_reference_file(conn: &mut Connection, path: &Path, table: &str) -> Result<usize> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let records = parse_reference(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let mut batch = Batch::new(&["codigo", "descricao"]);
    for record in &records {
        batch.push(vec![
            Value::from(record.codigo.clone()),
            Value::from(record.descricao.clone()),
        ])?;
    }

    upsert_batch(conn, table, &["codigo"], &batch)
        .with_context(|| format!("Failed to load {} into {}", path.display(), table))?;

    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{setup_database, table_count};

    #[test]
    fn test_parse_two_column_file() {
        let text = "0111301;Cultivo de arroz\n0111302;Cultivo de milho\n";
        let records = parse_reference(text).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].codigo, "0111301");
        assert_eq!(records[0].descricao.as_deref(), Some("Cultivo de arroz"));
    }

    #[test]
    fn test_parse_empty_description_becomes_null() {
        let records = parse_reference("99;\n").unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].codigo, "99");
        assert!(records[0].descricao.is_none());
    }

    #[test]
    fn test_parse_treats_quotes_as_data() {
        let records = parse_reference("01;Comercio de \"bens\" usados\n").unwrap();

        assert_eq!(
            records[0].descricao.as_deref(),
            Some("Comercio de \"bens\" usados"),
            "Quotes must pass through untouched"
        );
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        let err = parse_reference("01;A\n02;B;extra\n").unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("Expected 2 fields"), "Got: {}", msg);
        assert!(msg.contains("line 2"), "Got: {}", msg);
    }

    #[test]
    fn test_import_reference_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("municipios.csv");
        fs::write(&path, "3550308;SAO PAULO\n3304557;RIO DE JANEIRO\n").unwrap();

        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let first = import_reference_file(&mut conn, &path, "municipalities").unwrap();
        let second = import_reference_file(&mut conn, &path, "municipalities").unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 2);
        assert_eq!(
            table_count(&conn, "municipalities").unwrap(),
            2,
            "Second import must not grow the table"
        );

        let name: String = conn
            .query_row(
                "SELECT descricao FROM municipalities WHERE codigo = '3550308'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(name, "SAO PAULO");
    }

    #[test]
    fn test_catalog_covers_all_lookup_tables() {
        let tables: Vec<&str> = REFERENCE_SOURCES.iter().map(|s| s.table).collect();

        assert_eq!(tables.len(), 4);
        assert!(tables.contains(&"cnaes"));
        assert!(tables.contains(&"municipalities"));
        assert!(tables.contains(&"legal_natures"));
        assert!(tables.contains(&"motivos_situacao_cadastral"));
    }
}
