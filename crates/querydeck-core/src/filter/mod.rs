//! Vectorized row filtering
//!
//! Scans one column of a materialized [`ResultSet`] and returns the indices
//! of the matching rows in ascending order.
//!
//! ## Matching rules
//!
//! - `Equals`: exact string match.
//! - `Contains`: substring; an empty needle matches every non-null value.
//! - `Range`: inclusive. Numeric when the column's declared type is numeric,
//!   otherwise byte-wise lexicographic. A missing upper bound is unbounded.
//!
//! NULL cells never match, non-numeric cells in a numeric column never match
//! a range, and an out-of-range column index matches nothing.
//!
//! ## Execution
//!
//! ```text
//! rows ──► chunks (rayon, above parallel_threshold_rows)
//!            └─► per chunk: AVX2 kernel | scalar kernel
//!                 └─► indices, concatenated in chunk order
//! ```
//!
//! The AVX2 path is picked at runtime with `is_x86_feature_detected!`. Both
//! paths produce identical results; [`VectorFilter::scalar`] forces the
//! portable one.

mod scalar;
#[cfg(target_arch = "x86_64")]
mod simd;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::FilterConfig;
use crate::error::{Error, Result};
use crate::result::{ResultSet, Row};

/// Default row count above which scans are split across the rayon pool
pub const DEFAULT_PARALLEL_THRESHOLD_ROWS: usize = 64 * 1024;

/// Whether the AVX2 kernels can run on this CPU
pub fn is_vector_acceleration_available() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        simd::is_available()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

/// Comparison applied by a [`FilterCriterion`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    /// Exact match
    Equals,
    /// Substring match
    Contains,
    /// Inclusive range
    Range,
}

impl FilterKind {
    /// Parse `"equals"`, `"contains"` or `"range"` (case-insensitive)
    pub fn parse(kind: &str) -> Result<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "equals" => Ok(Self::Equals),
            "contains" => Ok(Self::Contains),
            "range" => Ok(Self::Range),
            _ => Err(Error::UnsupportedFilterKind(kind.to_string())),
        }
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::Contains => "contains",
            Self::Range => "range",
        }
    }
}

impl FromStr for FilterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One filter request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCriterion {
    /// Column to scan
    pub column_index: usize,
    /// Comparison
    pub kind: FilterKind,
    /// Target value, or lower bound for `Range`
    pub value: String,
    /// Upper bound for `Range`; ignored otherwise
    #[serde(default)]
    pub max_value: Option<String>,
}

impl FilterCriterion {
    /// `column == value`
    pub fn equals(column_index: usize, value: impl Into<String>) -> Self {
        Self {
            column_index,
            kind: FilterKind::Equals,
            value: value.into(),
            max_value: None,
        }
    }

    /// `column LIKE %value%`
    pub fn contains(column_index: usize, value: impl Into<String>) -> Self {
        Self {
            column_index,
            kind: FilterKind::Contains,
            value: value.into(),
            max_value: None,
        }
    }

    /// `min <= column <= max`
    pub fn range(column_index: usize, min: impl Into<String>, max: Option<String>) -> Self {
        Self {
            column_index,
            kind: FilterKind::Range,
            value: min.into(),
            max_value: max,
        }
    }
}

/// Prepared comparison for one scan
enum Matcher<'a> {
    Equals(&'a [u8]),
    Contains(&'a [u8]),
    NumericRange { lo: f64, hi: f64 },
    TextRange { lo: &'a [u8], hi: Option<&'a [u8]> },
}

/// Column scanner with runtime kernel selection
#[derive(Debug, Clone)]
pub struct VectorFilter {
    accelerated: bool,
    parallel_threshold_rows: usize,
}

impl VectorFilter {
    /// Use AVX2 when the CPU supports it
    pub fn new() -> Self {
        Self {
            accelerated: is_vector_acceleration_available(),
            parallel_threshold_rows: DEFAULT_PARALLEL_THRESHOLD_ROWS,
        }
    }

    /// Always use the portable kernels
    pub fn scalar() -> Self {
        Self {
            accelerated: false,
            parallel_threshold_rows: DEFAULT_PARALLEL_THRESHOLD_ROWS,
        }
    }

    /// Create from configuration
    pub fn from_config(config: &FilterConfig) -> Self {
        let filter = if config.force_scalar {
            Self::scalar()
        } else {
            Self::new()
        };
        filter.with_parallel_threshold(config.parallel_threshold_rows)
    }

    /// Row count above which scans run in parallel chunks
    pub fn with_parallel_threshold(mut self, rows: usize) -> Self {
        self.parallel_threshold_rows = rows.max(1);
        self
    }

    /// Whether this instance dispatches to the AVX2 kernels
    pub fn is_accelerated(&self) -> bool {
        self.accelerated
    }

    /// Rows whose `column` equals `value`
    pub fn filter_equals(&self, rs: &ResultSet, column: usize, value: &str) -> Vec<usize> {
        self.scan(rs, column, &Matcher::Equals(value.as_bytes()))
    }

    /// Rows whose `column` contains `value`
    pub fn filter_contains(&self, rs: &ResultSet, column: usize, value: &str) -> Vec<usize> {
        self.scan(rs, column, &Matcher::Contains(value.as_bytes()))
    }

    /// Rows whose `column` lies in `[min, max]`
    pub fn filter_range(
        &self,
        rs: &ResultSet,
        column: usize,
        min: &str,
        max: Option<&str>,
    ) -> Vec<usize> {
        let Some(descriptor) = rs.columns.get(column) else {
            return Vec::new();
        };

        let matcher = if descriptor.is_numeric() {
            let lo = parse_number(min);
            let hi = match max {
                Some(max) => parse_number(max),
                None => Some(f64::INFINITY),
            };
            match (lo, hi) {
                (Some(lo), Some(hi)) => Matcher::NumericRange { lo, hi },
                _ => {
                    tracing::debug!(column, min, ?max, "non-numeric bound on numeric column");
                    return Vec::new();
                }
            }
        } else {
            Matcher::TextRange {
                lo: min.as_bytes(),
                hi: max.map(str::as_bytes),
            }
        };

        self.scan(rs, column, &matcher)
    }

    /// Dispatch a [`FilterCriterion`]
    pub fn apply(&self, rs: &ResultSet, criterion: &FilterCriterion) -> Vec<usize> {
        match criterion.kind {
            FilterKind::Equals => self.filter_equals(rs, criterion.column_index, &criterion.value),
            FilterKind::Contains => {
                self.filter_contains(rs, criterion.column_index, &criterion.value)
            }
            FilterKind::Range => self.filter_range(
                rs,
                criterion.column_index,
                &criterion.value,
                criterion.max_value.as_deref(),
            ),
        }
    }

    /// Row order for displaying `rs` sorted by `column`
    ///
    /// NULLs come first ascending (last descending), then values that parse
    /// as numbers in numeric order, then the rest in byte order. The sort is
    /// stable. An out-of-range column keeps the original order.
    pub fn sort_by_column(&self, rs: &ResultSet, column: usize, ascending: bool) -> Vec<usize> {
        let mut order: Vec<usize> = (0..rs.rows.len()).collect();
        if column >= rs.column_count() {
            return order;
        }

        let keys: Vec<SortKey<'_>> = rs
            .rows
            .iter()
            .map(|row| SortKey::of(row.get(column)))
            .collect();

        order.sort_by(|&a, &b| {
            let ord = keys[a].cmp(&keys[b]);
            if ascending { ord } else { ord.reverse() }
        });
        order
    }

    fn scan(&self, rs: &ResultSet, column: usize, matcher: &Matcher<'_>) -> Vec<usize> {
        if column >= rs.column_count() || rs.rows.is_empty() {
            return Vec::new();
        }

        if rs.rows.len() <= self.parallel_threshold_rows {
            return self.scan_chunk(&rs.rows, 0, column, matcher);
        }

        let chunk = self.parallel_threshold_rows;
        rs.rows
            .par_chunks(chunk)
            .enumerate()
            .map(|(i, rows)| self.scan_chunk(rows, i * chunk, column, matcher))
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect()
    }

    fn scan_chunk(
        &self,
        rows: &[Row],
        base: usize,
        column: usize,
        matcher: &Matcher<'_>,
    ) -> Vec<usize> {
        let mut out = Vec::new();
        match *matcher {
            Matcher::NumericRange { lo, hi } => {
                let values: Vec<f64> = rows
                    .iter()
                    .map(|row| row.get(column).and_then(parse_number).unwrap_or(f64::NAN))
                    .collect();
                self.range_f64(&values, lo, hi, base, &mut out);
            }
            Matcher::TextRange { lo, hi } => {
                for (i, row) in rows.iter().enumerate() {
                    if row.get(column).is_some_and(|v| scalar::range_bytes(v.as_bytes(), lo, hi)) {
                        out.push(base + i);
                    }
                }
            }
            Matcher::Equals(target) => {
                for (i, row) in rows.iter().enumerate() {
                    if row.get(column).is_some_and(|v| self.equals(v.as_bytes(), target)) {
                        out.push(base + i);
                    }
                }
            }
            Matcher::Contains(needle) => {
                for (i, row) in rows.iter().enumerate() {
                    if row.get(column).is_some_and(|v| self.contains(v.as_bytes(), needle)) {
                        out.push(base + i);
                    }
                }
            }
        }
        out
    }

    #[inline]
    fn equals(&self, value: &[u8], target: &[u8]) -> bool {
        #[cfg(target_arch = "x86_64")]
        if self.accelerated {
            // SAFETY: `accelerated` is only set after AVX2 detection
            return unsafe { simd::equals(value, target) };
        }
        scalar::equals(value, target)
    }

    #[inline]
    fn contains(&self, haystack: &[u8], needle: &[u8]) -> bool {
        #[cfg(target_arch = "x86_64")]
        if self.accelerated {
            // SAFETY: `accelerated` is only set after AVX2 detection
            return unsafe { simd::contains(haystack, needle) };
        }
        scalar::contains(haystack, needle)
    }

    fn range_f64(&self, values: &[f64], lo: f64, hi: f64, base: usize, out: &mut Vec<usize>) {
        #[cfg(target_arch = "x86_64")]
        if self.accelerated {
            // SAFETY: `accelerated` is only set after AVX2 detection
            unsafe { simd::range_f64(values, lo, hi, base, out) };
            return;
        }
        scalar::range_f64(values, lo, hi, base, out)
    }
}

impl Default for VectorFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum SortClass {
    Null,
    Number,
    Text,
}

struct SortKey<'a> {
    class: SortClass,
    number: f64,
    text: &'a str,
}

impl<'a> SortKey<'a> {
    fn of(value: Option<&'a str>) -> Self {
        match value {
            None => Self {
                class: SortClass::Null,
                number: 0.0,
                text: "",
            },
            Some(text) => match parse_number(text) {
                Some(number) => Self {
                    class: SortClass::Number,
                    number,
                    text,
                },
                None => Self {
                    class: SortClass::Text,
                    number: 0.0,
                    text,
                },
            },
        }
    }

    fn cmp(&self, other: &Self) -> Ordering {
        self.class.cmp(&other.class).then_with(|| match self.class {
            SortClass::Null => Ordering::Equal,
            SortClass::Number => self.number.total_cmp(&other.number),
            SortClass::Text => self.text.as_bytes().cmp(other.text.as_bytes()),
        })
    }
}
