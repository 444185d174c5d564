use anyhow::{bail, Context, Result};
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::batch::Batch;
use crate::upsert::upsert_batch;

/// Canonical column order of the tax-regime table.
pub const REGIME_COLUMNS: [&str; 4] = [
    "ano",
    "cnpj_completo",
    "forma_tributacao",
    "quantidade_escrituracoes",
];

/// Natural key of a tax-regime row.
pub const REGIME_KEY: [&str; 3] = ["ano", "cnpj_completo", "forma_tributacao"];

/// One entry of the regime-file dispatch table: files whose name contains
/// `pattern` carry the taxation form in the filename instead of a column,
/// except the 4-column sources, which have no default label.
#[derive(Debug, Clone, Copy)]
pub struct RegimeSource {
    pub pattern: &'static str,
    pub default_label: Option<&'static str>,
}

pub const REGIME_SOURCES: &[RegimeSource] = &[
    RegimeSource {
        pattern: "Imunes e Isentas",
        default_label: None,
    },
    RegimeSource {
        pattern: "Lucro Real",
        default_label: Some("LUCRO REAL"),
    },
    RegimeSource {
        pattern: "Lucro Arbitrado",
        default_label: Some("LUCRO ARBITRADO"),
    },
    RegimeSource {
        pattern: "Lucro Presumido",
        default_label: Some("LUCRO PRESUMIDO"),
    },
];

/// Match a file name against the dispatch table.
pub fn regime_source_for(file_name: &str) -> Option<&'static RegimeSource> {
    REGIME_SOURCES
        .iter()
        .find(|source| file_name.contains(source.pattern))
}

/// Physical layout of a regime file, resolved once per file from the header
/// field count.
#[derive(Debug, Clone, PartialEq)]
pub enum RegimeLayout {
    /// ano, cnpj_completo, forma_tributacao, quantidade_escrituracoes
    FourColumn,
    /// ano, cnpj_completo, quantidade_escrituracoes; the taxation form is
    /// implicit and injected from the filename-derived label
    ThreeColumnWithDefault(String),
}

impl RegimeLayout {
    fn resolve(field_count: usize, default_label: Option<&str>) -> Result<RegimeLayout> {
        match (field_count, default_label) {
            (4, _) => Ok(RegimeLayout::FourColumn),
            (3, Some(label)) => Ok(RegimeLayout::ThreeColumnWithDefault(label.to_string())),
            (3, None) => bail!("3-column file needs a default taxation form"),
            (n, _) => bail!("Unexpected column layout: {} fields", n),
        }
    }
}

/// A tax-regime row in canonical form.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TaxRegimeRecord {
    pub ano: i64,
    pub cnpj_completo: String,
    pub forma_tributacao: String,
    pub quantidade_escrituracoes: i64,
}

const DELIMITER_CANDIDATES: [u8; 4] = [b';', b',', b'\t', b'|'];

/// Guess the delimiter: the first candidate whose per-line count is nonzero
/// and identical across the first lines of the sample wins. When none is
/// consistent, fall back to whichever appears most in the header line.
pub fn sniff_delimiter(sample: &str) -> u8 {
    let lines: Vec<&str> = sample
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(8)
        .collect();

    for &candidate in &DELIMITER_CANDIDATES {
        let counts: Vec<usize> = lines
            .iter()
            .map(|line| line.matches(candidate as char).count())
            .collect();

        if let Some(&first) = counts.first() {
            if first > 0 && counts.iter().all(|&count| count == first) {
                return candidate;
            }
        }
    }

    let header = lines.first().copied().unwrap_or("");
    let mut best = b';';
    let mut best_count = 0;
    for &candidate in &DELIMITER_CANDIDATES {
        let count = header.matches(candidate as char).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

/// Parse one regime file into canonical rows.
///
/// The delimiter is sniffed, the header row is counted (its names are
/// ignored), and the layout resolved once for the whole file. Data rows
/// that disagree with the header width, or carry non-numeric year or
/// bookkeeping counts, are fatal: an unanticipated format, not a bad row.
pub fn parse_regime(text: &str, default_label: Option<&str>) -> Result<Vec<TaxRegimeRecord>> {
    let delimiter = sniff_delimiter(text);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let expected = reader
        .headers()
        .context("Failed to read header row")?
        .len();
    let layout = RegimeLayout::resolve(expected, default_label)?;

    let mut records = Vec::new();

    for result in reader.records() {
        let record = result.context("Failed to read row")?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        if record.len() != expected {
            bail!(
                "Expected {} fields on line {}, found {}",
                expected,
                line,
                record.len()
            );
        }

        let field = |i: usize| record.get(i).unwrap_or("");

        let (cnpj_completo, forma_tributacao, quantidade_raw) = match &layout {
            RegimeLayout::FourColumn => (field(1), field(2).to_string(), field(3)),
            RegimeLayout::ThreeColumnWithDefault(label) => (field(1), label.clone(), field(2)),
        };

        let ano_raw = field(0).trim();
        let ano: i64 = ano_raw
            .parse()
            .with_context(|| format!("Invalid year {:?} on line {}", ano_raw, line))?;

        let quantidade_raw = quantidade_raw.trim();
        let quantidade: i64 = quantidade_raw.parse().with_context(|| {
            format!("Invalid bookkeeping count {:?} on line {}", quantidade_raw, line)
        })?;

        records.push(TaxRegimeRecord {
            ano,
            cnpj_completo: cnpj_completo.to_string(),
            forma_tributacao,
            quantidade_escrituracoes: quantidade,
        });
    }

    Ok(records)
}

/// Load one regime file. Returns the number of rows the file contributed.
pub fn import_regime_file(
    conn: &mut Connection,
    path: &Path,
    default_label: Option<&str>,
) -> Result<usize> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let records = parse_regime(&text, default_label)
        .with_context(|| format!("Unexpected format in {}", path.display()))?;

    let mut batch = Batch::new(&REGIME_COLUMNS);
    for record in &records {
        batch.push(vec![
            Value::from(record.ano),
            Value::from(record.cnpj_completo.clone()),
            Value::from(record.forma_tributacao.clone()),
            Value::from(record.quantidade_escrituracoes),
        ])?;
    }

    upsert_batch(conn, "regimes_tributarios", &REGIME_KEY, &batch)
        .with_context(|| format!("Failed to load {} into regimes_tributarios", path.display()))?;

    Ok(records.len())
}
