//! Row-stream abstractions shared by adapters, the checkpoint store, and the
//! repeater.
//!
//! Task results are lazily iterated [`RowStream`]s keyed by a monotonically
//! increasing `i64` key. [`MemTable`] is the in-memory drain target used for
//! partial-result stitching and checkpoint tee'ing; [`MemTableStream`] replays
//! a drained table so one materialization can feed both the checkpoint write
//! and the downstream consumer.

use pq_common::{PqError, Result};

/// Column value type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Boolean,
    Integer,
    Float,
    Binary,
    Utf8,
}

/// One typed cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Binary(Vec<u8>),
    Utf8(String),
}

impl Value {
    /// Rough wire-size estimate used by the checkpoint cost model.
    pub fn estimated_size_bytes(&self) -> u64 {
        match self {
            Value::Null => 1,
            Value::Bool(_) => 1,
            Value::I64(_) | Value::F64(_) => 8,
            Value::Binary(b) => b.len() as u64,
            Value::Utf8(s) => s.len() as u64,
        }
    }
}

/// One named, typed output column.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Schema of a row stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Header {
    pub fields: Vec<Field>,
}

impl Header {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Canonical empty header for zero-row results.
    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }
}

/// One keyed row. Keys are strictly increasing within a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: i64,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(key: i64, values: Vec<Value>) -> Self {
        Self { key, values }
    }

    pub fn estimated_size_bytes(&self) -> u64 {
        8 + self
            .values
            .iter()
            .map(Value::estimated_size_bytes)
            .sum::<u64>()
    }
}

/// A lazily iterated stream of keyed rows with a fixed header.
///
/// `next_row` may fail mid-iteration; the repeater treats that as a replay
/// trigger, not a terminal error.
pub trait RowStream: Send {
    fn header(&self) -> &Header;

    fn next_row(&mut self) -> Result<Option<Row>>;

    /// Estimated total byte size; cost-model input, not a contract.
    fn estimated_size_bytes(&self) -> u64;
}

/// The standard boxed stream adapters and stores exchange.
pub type BoxRowStream = Box<dyn RowStream + Send>;

/// Fully materialized, ordered row table.
#[derive(Debug, Clone, PartialEq)]
pub struct MemTable {
    header: Header,
    rows: Vec<Row>,
}

impl MemTable {
    pub fn new(header: Header, rows: Vec<Row>) -> Self {
        Self { header, rows }
    }

    /// Canonical empty table returned when a replay chain reads zero rows.
    pub fn empty(header: Header) -> Self {
        Self {
            header,
            rows: Vec::new(),
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last_key(&self) -> Option<i64> {
        self.rows.last().map(|r| r.key)
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn estimated_size_bytes(&self) -> u64 {
        self.rows.iter().map(Row::estimated_size_bytes).sum()
    }

    /// Union partial tables in attempt order.
    ///
    /// Every part must carry the same header; parts are concatenated, never
    /// re-sorted, because each part's rows were read strictly before the
    /// failure that triggered the next attempt.
    pub fn union_in_order(parts: Vec<MemTable>) -> Result<MemTable> {
        let mut iter = parts.into_iter();
        let mut merged = match iter.next() {
            Some(first) => first,
            None => return Ok(MemTable::empty(Header::empty())),
        };
        for part in iter {
            if part.header != merged.header {
                return Err(PqError::Execution(format!(
                    "cannot union partial tables with mismatched headers: {:?} vs {:?}",
                    merged.header.fields, part.header.fields
                )));
            }
            merged.rows.extend(part.rows);
        }
        Ok(merged)
    }

    /// Replayable stream over this table.
    pub fn into_stream(self) -> MemTableStream {
        MemTableStream {
            table: self,
            pos: 0,
        }
    }
}

/// Stream view over a [`MemTable`]; always drains cleanly.
#[derive(Debug, Clone)]
pub struct MemTableStream {
    table: MemTable,
    pos: usize,
}

impl RowStream for MemTableStream {
    fn header(&self) -> &Header {
        self.table.header()
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        let row = self.table.rows.get(self.pos).cloned();
        if row.is_some() {
            self.pos += 1;
        }
        Ok(row)
    }

    fn estimated_size_bytes(&self) -> u64 {
        self.table.estimated_size_bytes()
    }
}

/// Drain a stream completely into a table.
pub fn drain_stream(stream: &mut dyn RowStream) -> Result<MemTable> {
    let mut table = MemTable::empty(stream.header().clone());
    while let Some(row) = stream.next_row()? {
        table.push(row);
    }
    Ok(table)
}

/// Drain until exhaustion or failure, keeping the rows read before the error.
///
/// The repeater and the checkpoint tee both need the readable prefix of a
/// failing stream; a plain `?`-drain would discard it.
pub fn drain_stream_partial(stream: &mut dyn RowStream) -> (MemTable, Option<PqError>) {
    let mut table = MemTable::empty(stream.header().clone());
    loop {
        match stream.next_row() {
            Ok(Some(row)) => table.push(row),
            Ok(None) => return (table, None),
            Err(err) => return (table, Some(err)),
        }
    }
}
