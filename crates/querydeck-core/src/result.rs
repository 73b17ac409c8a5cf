//! Materialized query results
//!
//! Values arrive already converted to text by the driver. `None` is SQL
//! NULL and is kept distinct from the empty string.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Column metadata reported by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,
    /// Declared SQL type name (`INT`, `NVARCHAR`, ...)
    pub declared_type: String,
    /// Maximum size reported by the driver
    pub max_size: i64,
    /// Whether the column accepts NULL
    pub nullable: bool,
    /// Whether the column is part of the primary key
    pub is_primary_key: bool,
}

impl ColumnDescriptor {
    /// Create a nullable, non-key column
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
            max_size: 0,
            nullable: true,
            is_primary_key: false,
        }
    }

    /// Set the reported maximum size
    pub fn with_max_size(mut self, max_size: i64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set nullability
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Mark as primary key column
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }

    /// True when the declared type orders numerically
    pub fn is_numeric(&self) -> bool {
        is_numeric_type(&self.declared_type)
    }
}

/// Declared type names that compare numerically rather than lexicographically.
pub fn is_numeric_type(declared_type: &str) -> bool {
    // Strip precision/scale suffixes: DECIMAL(10,2) -> DECIMAL
    let base = declared_type
        .split('(')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    matches!(
        base.as_str(),
        "int"
            | "integer"
            | "bigint"
            | "smallint"
            | "tinyint"
            | "decimal"
            | "numeric"
            | "number"
            | "float"
            | "real"
            | "double"
            | "double precision"
            | "money"
            | "smallmoney"
    )
}

/// One result row
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Row {
    /// Cell values, `None` for NULL
    pub values: Vec<Option<String>>,
}

impl Row {
    /// Build a row from non-null text values
    pub fn from_text<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(|v| Some(v.into())).collect(),
        }
    }

    /// Cell at `index`, flattening NULL and out-of-range to `None`
    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }
}

/// Materialized result of one statement
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultSet {
    /// Column descriptors in select-list order
    pub columns: Vec<ColumnDescriptor>,
    /// Rows, each exactly `columns.len()` wide
    pub rows: Vec<Row>,
    /// Rows affected by DML, 0 for queries
    pub affected_rows: i64,
    /// Server-side execution time
    pub execution_time_ms: f64,
}

impl ResultSet {
    /// Build a result set, rejecting rows whose width differs from the column count
    pub fn new(columns: Vec<ColumnDescriptor>, rows: Vec<Row>) -> Result<Self> {
        let result = Self {
            columns,
            rows,
            affected_rows: 0,
            execution_time_ms: 0.0,
        };
        result.validate()?;
        Ok(result)
    }

    /// Result with no columns, used for DML
    pub fn affected(affected_rows: i64) -> Self {
        Self {
            affected_rows,
            ..Self::default()
        }
    }

    /// Single `Message` column with one informational row.
    ///
    /// Stands in for statements that change session context and produce
    /// no tabular output, so callers always see a uniform shape.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            columns: vec![
                ColumnDescriptor::new("Message", "VARCHAR")
                    .with_max_size(255)
                    .with_nullable(false),
            ],
            rows: vec![Row {
                values: vec![Some(text.into())],
            }],
            affected_rows: 0,
            execution_time_ms: 0.0,
        }
    }

    /// Set affected row count
    pub fn with_affected_rows(mut self, affected_rows: i64) -> Self {
        self.affected_rows = affected_rows;
        self
    }

    /// Set execution time
    pub fn with_execution_time_ms(mut self, execution_time_ms: f64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }

    /// Check the row width invariant
    pub fn validate(&self) -> Result<()> {
        let expected = self.columns.len();
        for (row, values) in self.rows.iter().enumerate() {
            if values.values.len() != expected {
                return Err(Error::InvalidResultShape {
                    row,
                    expected,
                    actual: values.values.len(),
                });
            }
        }
        Ok(())
    }

    /// Number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Position of a column by name (case-insensitive)
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Cell at (`row`, `column`)
    pub fn value(&self, row: usize, column: usize) -> Option<&str> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// Copy of the rows at `indices`, keeping all columns
    pub fn select_rows(&self, indices: &[usize]) -> ResultSet {
        ResultSet {
            columns: self.columns.clone(),
            rows: indices
                .iter()
                .filter_map(|&i| self.rows.get(i).cloned())
                .collect(),
            affected_rows: self.affected_rows,
            execution_time_ms: self.execution_time_ms,
        }
    }

    /// Approximate heap footprint used for cache accounting
    pub fn estimated_size_bytes(&self) -> usize {
        let header = std::mem::size_of::<ResultSet>();
        let columns: usize = self
            .columns
            .iter()
            .map(|c| c.name.len() + c.declared_type.len() + std::mem::size_of::<ColumnDescriptor>())
            .sum();
        let rows: usize = self
            .rows
            .iter()
            .map(|r| {
                std::mem::size_of::<Row>()
                    + r.values
                        .iter()
                        .map(|v| v.as_ref().map_or(0, String::len))
                        .sum::<usize>()
            })
            .sum();

        header + columns + rows
    }
}

/// One statement's result inside a multi-statement task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    /// Statement text as split from the batch
    pub statement: String,
    /// Its result
    pub result: ResultSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultSet {
        ResultSet::new(
            vec![
                ColumnDescriptor::new("id", "INT").primary_key(),
                ColumnDescriptor::new("name", "NVARCHAR").with_max_size(50),
            ],
            vec![
                Row::from_text(["1", "Alice"]),
                Row {
                    values: vec![Some("2".into()), None],
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_ragged_rows() {
        let err = ResultSet::new(
            vec![ColumnDescriptor::new("a", "INT")],
            vec![Row::from_text(["1", "2"])],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidResultShape {
                row: 0,
                expected: 1,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_null_is_distinct_from_empty() {
        let rs = ResultSet::new(
            vec![ColumnDescriptor::new("v", "VARCHAR")],
            vec![Row { values: vec![None] }, Row::from_text([""])],
        )
        .unwrap();
        assert_eq!(rs.rows[0].values[0], None);
        assert_eq!(rs.rows[1].values[0], Some(String::new()));
    }

    #[test]
    fn test_message_shape() {
        let rs = ResultSet::message("Database changed to testdb");
        assert_eq!(rs.column_count(), 1);
        assert_eq!(rs.columns[0].name, "Message");
        assert_eq!(rs.row_count(), 1);
        assert_eq!(rs.value(0, 0), Some("Database changed to testdb"));
        assert_eq!(rs.affected_rows, 0);
        assert_eq!(rs.execution_time_ms, 0.0);
        rs.validate().unwrap();
    }

    #[test]
    fn test_lookup_helpers() {
        let rs = sample();
        assert_eq!(rs.column_index("NAME"), Some(1));
        assert_eq!(rs.value(0, 1), Some("Alice"));
        assert_eq!(rs.value(1, 1), None);
        assert_eq!(rs.value(9, 0), None);

        let picked = rs.select_rows(&[1]);
        assert_eq!(picked.row_count(), 1);
        assert_eq!(picked.value(0, 0), Some("2"));
    }

    #[test]
    fn test_size_grows_with_content() {
        let small = sample();
        let mut large = sample();
        large.rows.push(Row::from_text(["3", "x".repeat(1000).as_str()]));
        assert!(large.estimated_size_bytes() > small.estimated_size_bytes() + 1000);
    }

    #[test]
    fn test_numeric_type_detection() {
        assert!(is_numeric_type("INT"));
        assert!(is_numeric_type("decimal(10,2)"));
        assert!(is_numeric_type("Money"));
        assert!(!is_numeric_type("NVARCHAR"));
        assert!(!is_numeric_type("datetime2"));
    }
}
