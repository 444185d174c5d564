// In-memory batch - one file's worth of rows on their way to a table
// The structured unit handed to the staging-upsert primitive

use anyhow::{bail, Result};
use rusqlite::types::Value;

/// A rectangular batch of rows destined for one relation.
///
/// Columns are ordered; every row carries exactly one `Value` per column.
/// Loaders build a `Batch`, the upsert primitive stages and merges it.
#[derive(Debug, Clone)]
pub struct Batch {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Batch {
    /// Create an empty batch with the given column order.
    pub fn new(columns: &[&str]) -> Self {
        Batch {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Append one row. The row must have exactly one value per column.
    pub fn push(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            bail!(
                "Row has {} values but batch has {} columns",
                row.len(),
                self.columns.len()
            );
        }
        self.rows.push(row);
        Ok(())
    }

    /// Column names, in insert order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// All rows, in arrival order.
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_checks_arity() {
        let mut batch = Batch::new(&["codigo", "descricao"]);

        let ok = batch.push(vec![
            Value::Text("01".to_string()),
            Value::Text("Padaria".to_string()),
        ]);
        assert!(ok.is_ok());

        let short = batch.push(vec![Value::Text("02".to_string())]);
        assert!(short.is_err(), "Row narrower than the batch must be rejected");

        let long = batch.push(vec![Value::Null, Value::Null, Value::Null]);
        assert!(long.is_err(), "Row wider than the batch must be rejected");

        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_column_index() {
        let batch = Batch::new(&["ano", "cnpj_completo", "forma_tributacao"]);

        assert_eq!(batch.column_index("ano"), Some(0));
        assert_eq!(batch.column_index("forma_tributacao"), Some(2));
        assert_eq!(batch.column_index("quantidade_escrituracoes"), None);
    }

    #[test]
    fn test_empty_batch() {
        let batch = Batch::new(&["cnpj_basico"]);
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.columns(), &["cnpj_basico".to_string()]);
    }
}
