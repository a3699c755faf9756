//! Query results.
//!
//! A [`QueryResult`] owns exactly one native result resource. The resource is
//! released when the handle drops, whether or not every row was read.

use std::fmt;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};
use smallvec::SmallVec;

use crate::driver::{NativeResult, ResultStatus};
use crate::error::{PgmuxError, Result};

/// Column names shared by every row of one result.
pub type SharedColumns = Arc<[String]>;

// ============================================================================
// Result Classification
// ============================================================================

/// Outcome of a completed request.
#[derive(Debug)]
pub enum QueryResult {
    Command(CommandResult),
    Tuples(TupleResult),
}

impl QueryResult {
    /// Classify a raw response into a result or an error.
    pub(crate) fn classify(raw: Box<dyn NativeResult>) -> Result<Self> {
        match raw.status() {
            ResultStatus::EmptyQuery => {
                Err(PgmuxError::QueryError("Empty query string".to_string()))
            }
            ResultStatus::CommandOk => Ok(QueryResult::Command(CommandResult { raw })),
            ResultStatus::TuplesOk => Ok(QueryResult::Tuples(TupleResult::new(raw))),
            ResultStatus::NonfatalError | ResultStatus::FatalError => {
                Err(PgmuxError::QueryError(raw.error_message()))
            }
            ResultStatus::BadResponse => Err(PgmuxError::ConnectionFailure(raw.error_message())),
            ResultStatus::Unknown(code) => Err(PgmuxError::ConnectionFailure(format!(
                "Unknown result status ({})",
                code
            ))),
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self, QueryResult::Command(_))
    }

    pub fn is_tuples(&self) -> bool {
        matches!(self, QueryResult::Tuples(_))
    }

    /// Rows affected by a command; the row count for tuple results.
    pub fn affected_rows(&self) -> u64 {
        match self {
            QueryResult::Command(c) => c.affected_rows(),
            QueryResult::Tuples(t) => t.num_rows() as u64,
        }
    }

    pub fn into_tuples(self) -> Result<TupleResult> {
        match self {
            QueryResult::Tuples(t) => Ok(t),
            QueryResult::Command(_) => Err(PgmuxError::InvalidArgument(
                "Result does not contain rows".to_string(),
            )),
        }
    }

    pub fn into_command(self) -> Result<CommandResult> {
        match self {
            QueryResult::Command(c) => Ok(c),
            QueryResult::Tuples(_) => Err(PgmuxError::InvalidArgument(
                "Result is not a command result".to_string(),
            )),
        }
    }
}

// ============================================================================
// Command Result
// ============================================================================

/// Result of a statement that returns no rows.
pub struct CommandResult {
    raw: Box<dyn NativeResult>,
}

impl CommandResult {
    pub fn affected_rows(&self) -> u64 {
        self.raw.affected_rows()
    }

    /// Object id assigned by the server to an inserted row, if any.
    pub fn last_oid(&self) -> Option<u32> {
        self.raw.last_oid()
    }
}

impl fmt::Debug for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandResult")
            .field("affected_rows", &self.affected_rows())
            .field("last_oid", &self.last_oid())
            .finish()
    }
}

// ============================================================================
// Tuple Result
// ============================================================================

/// A field addressed by position or by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRef<'a> {
    Index(i64),
    Name(&'a str),
}

impl From<usize> for FieldRef<'_> {
    fn from(index: usize) -> Self {
        FieldRef::Index(i64::try_from(index).unwrap_or(i64::MAX))
    }
}

impl From<i32> for FieldRef<'_> {
    fn from(index: i32) -> Self {
        FieldRef::Index(index.into())
    }
}

impl From<i64> for FieldRef<'_> {
    fn from(index: i64) -> Self {
        FieldRef::Index(index)
    }
}

impl<'a> From<&'a str> for FieldRef<'a> {
    fn from(name: &'a str) -> Self {
        FieldRef::Name(name)
    }
}

impl<'a> From<&'a String> for FieldRef<'a> {
    fn from(name: &'a String) -> Self {
        FieldRef::Name(name.as_str())
    }
}

/// Result of a statement that returns rows.
///
/// Rows are fetched lazily from the native result, once, in order. The
/// sequence cannot be restarted.
pub struct TupleResult {
    raw: Box<dyn NativeResult>,
    columns: SharedColumns,
    num_rows: usize,
    cursor: usize,
}

impl TupleResult {
    fn new(raw: Box<dyn NativeResult>) -> Self {
        let columns: SharedColumns = (0..raw.num_fields())
            .map(|i| raw.field_name(i))
            .collect::<Vec<_>>()
            .into();
        let num_rows = raw.num_rows();
        Self {
            raw,
            columns,
            num_rows,
            cursor: 0,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_fields(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &SharedColumns {
        &self.columns
    }

    /// Name of the field at `field`.
    pub fn field_name<'a>(&self, field: impl Into<FieldRef<'a>>) -> Result<&str> {
        let index = self.resolve(field.into())?;
        Ok(&self.columns[index])
    }

    /// Index of the field called `name`.
    pub fn field_num(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| {
                PgmuxError::InvalidArgument(format!("No field with name \"{}\" in result", name))
            })
    }

    /// Type name of the field, e.g. `int4`.
    pub fn field_type<'a>(&self, field: impl Into<FieldRef<'a>>) -> Result<String> {
        let index = self.resolve(field.into())?;
        Ok(self.raw.field_type(index))
    }

    /// Storage size of the field in bytes; -1 for variable length types.
    pub fn field_size<'a>(&self, field: impl Into<FieldRef<'a>>) -> Result<i32> {
        let index = self.resolve(field.into())?;
        Ok(self.raw.field_size(index))
    }

    /// Number of rows not yet read.
    pub fn remaining(&self) -> usize {
        self.num_rows - self.cursor
    }

    fn resolve(&self, field: FieldRef<'_>) -> Result<usize> {
        match field {
            FieldRef::Name(name) => self.field_num(name),
            FieldRef::Index(index) => usize::try_from(index)
                .ok()
                .filter(|i| *i < self.columns.len())
                .ok_or_else(|| {
                    PgmuxError::InvalidArgument(format!(
                        "No field with index {} in result",
                        index
                    ))
                }),
        }
    }
}

impl Iterator for TupleResult {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.num_rows {
            return None;
        }

        let row = self.cursor;
        match self.raw.fetch_row(row) {
            Some(values) => {
                self.cursor += 1;
                Some(Ok(Row {
                    columns: Arc::clone(&self.columns),
                    values: values.into_iter().collect(),
                }))
            }
            None => {
                // The native result is unusable past this point.
                self.cursor = self.num_rows;
                Some(Err(PgmuxError::ConnectionFailure(self.raw.error_message())))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining()))
    }
}

impl fmt::Debug for TupleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TupleResult")
            .field("columns", &self.columns)
            .field("num_rows", &self.num_rows)
            .field("cursor", &self.cursor)
            .finish()
    }
}

// ============================================================================
// Rows
// ============================================================================

/// One row: column name → text value.
///
/// Uses SmallVec to keep rows of up to 16 columns inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    columns: SharedColumns,
    values: SmallVec<[Option<String>; 16]>,
}

impl Row {
    /// Value of the column called `name`. The outer `None` means no such
    /// column; the inner `None` is SQL NULL.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        let index = self.columns.iter().position(|c| c == name)?;
        self.get_index(index)
    }

    pub fn get_index(&self, index: usize) -> Option<Option<&str>> {
        self.values.get(index).map(|v| v.as_deref())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate `(column, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(|v| v.as_deref()))
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.iter() {
            map.serialize_entry(column, &value)?;
        }
        map.end()
    }
}
