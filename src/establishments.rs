use anyhow::{Context, Result};
use csv::StringRecord;
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::batch::Batch;
use crate::upsert::upsert_batch;

/// Entity dump file name inside the data directory.
pub const BASE_FILE_NAME: &str = "base.csv";

/// Column layout of the entity dump, in file order.
pub const ESTABLISHMENT_COLUMNS: [&str; 30] = [
    "cnpj_basico",
    "cnpj_ordem",
    "cnpj_dv",
    "identificador_matriz_filial",
    "nome_fantasia",
    "situacao_cadastral",
    "data_situacao_cadastral",
    "motivo_situacao_cadastral",
    "nome_cidade_exterior",
    "pais",
    "data_inicio_atividade",
    "cnae_fiscal_principal",
    "cnae_fiscal_secundaria",
    "tipo_logradouro",
    "logradouro",
    "numero",
    "complemento",
    "bairro",
    "cep",
    "uf",
    "municipio",
    "ddd1",
    "telefone1",
    "ddd2",
    "telefone2",
    "ddd_fax",
    "fax",
    "correio_eletronico",
    "situacao_especial",
    "data_situacao_especial",
];

/// Natural key of an establishment.
pub const ESTABLISHMENT_KEY: [&str; 3] = ["cnpj_basico", "cnpj_ordem", "cnpj_dv"];

/// One establishment row from the entity dump, positionally mapped.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Establishment {
    // ========================================================================
    // NATURAL KEY (CNPJ root + order + check digits)
    // ========================================================================
    pub cnpj_basico: String,
    pub cnpj_ordem: String,
    pub cnpj_dv: String,

    // ========================================================================
    // ATTRIBUTES (stored verbatim, empty fields become NULL)
    // ========================================================================
    pub identificador_matriz_filial: Option<String>,
    pub nome_fantasia: Option<String>,
    pub situacao_cadastral: Option<String>,
    pub data_situacao_cadastral: Option<String>,
    pub motivo_situacao_cadastral: Option<String>,
    pub nome_cidade_exterior: Option<String>,
    pub pais: Option<String>,
    pub data_inicio_atividade: Option<String>,
    pub cnae_fiscal_principal: Option<String>,
    pub cnae_fiscal_secundaria: Option<String>,
    pub tipo_logradouro: Option<String>,
    pub logradouro: Option<String>,
    pub numero: Option<String>,
    pub complemento: Option<String>,
    pub bairro: Option<String>,
    pub cep: Option<String>,
    pub uf: Option<String>,
    pub municipio: Option<String>,
    pub ddd1: Option<String>,
    pub telefone1: Option<String>,
    pub ddd2: Option<String>,
    pub telefone2: Option<String>,
    pub ddd_fax: Option<String>,
    pub fax: Option<String>,
    pub correio_eletronico: Option<String>,
    pub situacao_especial: Option<String>,
    pub data_situacao_especial: Option<String>,
}

impl Establishment {
    /// Map one raw record to an establishment. Returns None when the row is
    /// unusable: wrong field count, or no CNPJ root to key on.
    pub fn from_record(record: &StringRecord) -> Option<Establishment> {
        if record.len() != ESTABLISHMENT_COLUMNS.len() {
            return None;
        }

        let required = |i: usize| record.get(i).unwrap_or("").to_string();
        let optional = |i: usize| {
            let value = record.get(i).unwrap_or("");
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        };

        let cnpj_basico = required(0);
        if cnpj_basico.is_empty() {
            return None;
        }

        Some(Establishment {
            cnpj_basico,
            cnpj_ordem: required(1),
            cnpj_dv: required(2),
            identificador_matriz_filial: optional(3),
            nome_fantasia: optional(4),
            situacao_cadastral: optional(5),
            data_situacao_cadastral: optional(6),
            motivo_situacao_cadastral: optional(7),
            nome_cidade_exterior: optional(8),
            pais: optional(9),
            data_inicio_atividade: optional(10),
            cnae_fiscal_principal: optional(11),
            cnae_fiscal_secundaria: optional(12),
            tipo_logradouro: optional(13),
            logradouro: optional(14),
            numero: optional(15),
            complemento: optional(16),
            bairro: optional(17),
            cep: optional(18),
            uf: optional(19),
            municipio: optional(20),
            ddd1: optional(21),
            telefone1: optional(22),
            ddd2: optional(23),
            telefone2: optional(24),
            ddd_fax: optional(25),
            fax: optional(26),
            correio_eletronico: optional(27),
            situacao_especial: optional(28),
            data_situacao_especial: optional(29),
        })
    }

    /// The full 14-digit CNPJ (root + order + check digits).
    pub fn full_cnpj(&self) -> String {
        format!("{}{}{}", self.cnpj_basico, self.cnpj_ordem, self.cnpj_dv)
    }

    fn into_row(self) -> Vec<Value> {
        vec![
            Value::from(self.cnpj_basico),
            Value::from(self.cnpj_ordem),
            Value::from(self.cnpj_dv),
            Value::from(self.identificador_matriz_filial),
            Value::from(self.nome_fantasia),
            Value::from(self.situacao_cadastral),
            Value::from(self.data_situacao_cadastral),
            Value::from(self.motivo_situacao_cadastral),
            Value::from(self.nome_cidade_exterior),
            Value::from(self.pais),
            Value::from(self.data_inicio_atividade),
            Value::from(self.cnae_fiscal_principal),
            Value::from(self.cnae_fiscal_secundaria),
            Value::from(self.tipo_logradouro),
            Value::from(self.logradouro),
            Value::from(self.numero),
            Value::from(self.complemento),
            Value::from(self.bairro),
            Value::from(self.cep),
            Value::from(self.uf),
            Value::from(self.municipio),
            Value::from(self.ddd1),
            Value::from(self.telefone1),
            Value::from(self.ddd2),
            Value::from(self.telefone2),
            Value::from(self.ddd_fax),
            Value::from(self.fax),
            Value::from(self.correio_eletronico),
            Value::from(self.situacao_especial),
            Value::from(self.data_situacao_especial),
        ]
    }
}

/// Outcome of parsing the entity dump: usable rows plus how many were skipped.
#[derive(Debug)]
pub struct ParsedBase {
    pub establishments: Vec<Establishment>,
    pub skipped: usize,
}

/// Parse the entity dump: semicolon-delimited, headerless, quotes are data.
/// Malformed rows are skipped and counted, never fatal. `row_limit` caps the
/// number of usable rows kept.
pub fn parse_base(text: &str, row_limit: Option<usize>) -> ParsedBase {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .quoting(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut establishments = Vec::new();
    let mut skipped = 0usize;

    for result in reader.records() {
        if let Some(limit) = row_limit {
            if establishments.len() >= limit {
                break;
            }
        }

        let record = match result {
            Ok(record) => record,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };

        match Establishment::from_record(&record) {
            Some(establishment) => establishments.push(establishment),
            None => skipped += 1,
        }
    }

    ParsedBase {
        establishments,
        skipped,
    }
}

/// Companies derived from the establishments: every distinct CNPJ root,
/// first-seen order, key column only.
pub fn company_batch(establishments: &[Establishment]) -> Result<Batch> {
    let mut batch = Batch::new(&["cnpj_basico"]);
    let mut seen = HashSet::new();

    for establishment in establishments {
        if seen.insert(establishment.cnpj_basico.clone()) {
            batch.push(vec![Value::from(establishment.cnpj_basico.clone())])?;
        }
    }

    Ok(batch)
}

fn establishment_batch(establishments: Vec<Establishment>) -> Result<Batch> {
    let mut batch = Batch::new(&ESTABLISHMENT_COLUMNS);
    for establishment in establishments {
        batch.push(establishment.into_row())?;
    }
    Ok(batch)
}

/// Counts reported after loading the entity dump.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BaseImportStats {
    pub companies: usize,
    pub establishments: usize,
    pub skipped_rows: usize,
}

/// Load the entity dump: parse, derive companies, merge companies first so
/// the parent keys exist, then merge establishments. Each merge is its own
/// transaction.
pub fn import_base_file(
    conn: &mut Connection,
    path: &Path,
    row_limit: Option<usize>,
) -> Result<BaseImportStats> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    // The registry dumps are latin1-encoded
    let text = encoding_rs::mem::decode_latin1(&bytes).into_owned();

    let parsed = parse_base(&text, row_limit);

    let companies = company_batch(&parsed.establishments)?;
    let companies_count = companies.len();
    upsert_batch(conn, "companies", &["cnpj_basico"], &companies)
        .with_context(|| format!("Failed to load companies from {}", path.display()))?;

    let establishments_count = parsed.establishments.len();
    let batch = establishment_batch(parsed.establishments)?;
    upsert_batch(conn, "establishments", &ESTABLISHMENT_KEY, &batch)
        .with_context(|| format!("Failed to load establishments from {}", path.display()))?;

    Ok(BaseImportStats {
        companies: companies_count,
        establishments: establishments_count,
        skipped_rows: parsed.skipped,
    })
}
