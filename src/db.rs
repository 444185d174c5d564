use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;

use crate::reference::REFERENCE_SOURCES;

/// Quote an identifier for interpolation into dynamically built SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Open (or create) the database file at `path`.
pub fn open_database(path: &Path) -> Result<Connection> {
    Connection::open(path)
        .with_context(|| format!("Failed to open database at {}", path.display()))
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Lookup tables (codigo → descricao), one per catalog entry
    // ==========================================================================
    for source in REFERENCE_SOURCES {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    codigo VARCHAR PRIMARY KEY,
                    descricao TEXT
                )",
                quote_ident(source.table)
            ),
            [],
        )?;
    }

    // ==========================================================================
    // Companies Table (parent entity, keyed on the 8-digit CNPJ root)
    // The bulk loader only writes cnpj_basico; the remaining columns are
    // filled by other pipelines and must survive re-imports untouched.
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS companies (
            cnpj_basico VARCHAR PRIMARY KEY,
            razao_social TEXT,
            natureza_juridica TEXT,
            qualificacao_responsavel TEXT,
            capital_social TEXT,
            porte_empresa TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Establishments Table (child entity, composite natural key)
    // Every column is text: the dumps land verbatim, coercion is left to
    // downstream consumers.
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS establishments (
            cnpj_basico TEXT NOT NULL,
            cnpj_ordem TEXT NOT NULL,
            cnpj_dv TEXT NOT NULL,
            identificador_matriz_filial TEXT,
            nome_fantasia TEXT,
            situacao_cadastral TEXT,
            data_situacao_cadastral TEXT,
            motivo_situacao_cadastral TEXT,
            nome_cidade_exterior TEXT,
            pais TEXT,
            data_inicio_atividade TEXT,
            cnae_fiscal_principal TEXT,
            cnae_fiscal_secundaria TEXT,
            tipo_logradouro TEXT,
            logradouro TEXT,
            numero TEXT,
            complemento TEXT,
            bairro TEXT,
            cep TEXT,
            uf TEXT,
            municipio TEXT,
            ddd1 TEXT,
            telefone1 TEXT,
            ddd2 TEXT,
            telefone2 TEXT,
            ddd_fax TEXT,
            fax TEXT,
            correio_eletronico TEXT,
            situacao_especial TEXT,
            data_situacao_especial TEXT,
            PRIMARY KEY (cnpj_basico, cnpj_ordem, cnpj_dv)
        )",
        [],
    )?;

    // ==========================================================================
    // Tax Regimes Table (year + full CNPJ + taxation form)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS regimes_tributarios (
            ano INTEGER,
            cnpj_completo VARCHAR(18),
            forma_tributacao TEXT,
            quantidade_escrituracoes INTEGER,
            PRIMARY KEY (ano, cnpj_completo, forma_tributacao)
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_establishments_cnpj_basico
         ON establishments(cnpj_basico)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_regimes_cnpj_completo
         ON regimes_tributarios(cnpj_completo)",
        [],
    )?;

    Ok(())
}

/// Row count of one target table.
pub fn table_count(conn: &Connection, table: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let expected = [
            "cnaes",
            "municipalities",
            "legal_natures",
            "motivos_situacao_cadastral",
            "companies",
            "establishments",
            "regimes_tributarios",
        ];

        for table in expected {
            let found: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(found, 1, "Table {} should exist after setup", table);
        }

        println!("✅ All {} tables created", expected.len());
    }

    #[test]
    fn test_setup_is_rerunnable() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        conn.execute(
            "INSERT INTO cnaes (codigo, descricao) VALUES ('0111301', 'Cultivo de arroz')",
            [],
        )
        .unwrap();

        // Second setup must not drop or recreate anything
        setup_database(&conn).unwrap();

        assert_eq!(
            table_count(&conn, "cnaes").unwrap(),
            1,
            "Existing rows should survive a second setup"
        );
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("cnaes"), "\"cnaes\"");
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn test_table_count_starts_at_zero() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        assert_eq!(table_count(&conn, "establishments").unwrap(), 0);
    }
}
