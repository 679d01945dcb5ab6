//! Per-session resource arena.
//!
//! Every session owns one arena holding its statements, result sets, LOBs and
//! attribute objects. Handles resolve only inside the arena that issued them,
//! and dropping the arena drops everything registered under the session.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use duckdb::arrow::array::ArrayRef;
use duckdb::arrow::datatypes::SchemaRef;
use duckdb::arrow::record_batch::RecordBatch;

use crate::capability::Capabilities;
use crate::engine::cells::{precision_and_scale, sql_type_code, sql_type_name};
use crate::engine::QueryResult;
use crate::error::ServerError;
use crate::lob::LobResource;
use crate::session::{ResourceId, ResourceKind};
use crate::value::ParameterValue;

/// UUID-keyed map of one resource family.
struct Slots<T> {
    kind: ResourceKind,
    items: Mutex<HashMap<ResourceId, Arc<T>>>,
}

impl<T> Slots<T> {
    fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            items: Mutex::new(HashMap::new()),
        }
    }

    fn items(&self) -> MutexGuard<'_, HashMap<ResourceId, Arc<T>>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, id: ResourceId, item: Arc<T>) {
        self.items().insert(id, item);
    }

    fn get(&self, id: &ResourceId) -> Result<Arc<T>, ServerError> {
        self.items()
            .get(id)
            .cloned()
            .ok_or_else(|| ServerError::resource_not_found(self.kind, id))
    }

    fn remove(&self, id: &ResourceId) -> Option<Arc<T>> {
        self.items().remove(id)
    }

    fn len(&self) -> usize {
        self.items().len()
    }

    fn drain(&self) -> Vec<Arc<T>> {
        self.items().drain().map(|(_, item)| item).collect()
    }
}

/// Resources released by [`ResourceArena::clear`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCounts {
    pub statements: usize,
    pub result_sets: usize,
    pub lobs: usize,
    pub attributes: usize,
}

impl ResourceCounts {
    pub fn total(&self) -> usize {
        self.statements + self.result_sets + self.lobs + self.attributes
    }
}

pub struct ResourceArena {
    statements: Slots<StatementResource>,
    result_sets: Slots<ResultSetResource>,
    lobs: Slots<LobResource>,
    attributes: Slots<Attribute>,
    /// LOBs reading straight from a result set's batches, by result set.
    result_lobs: Mutex<HashMap<ResourceId, Vec<ResourceId>>>,
}

impl Default for ResourceArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceArena {
    pub fn new() -> Self {
        Self {
            statements: Slots::new(ResourceKind::Statement),
            result_sets: Slots::new(ResourceKind::ResultSet),
            lobs: Slots::new(ResourceKind::Lob),
            attributes: Slots::new(ResourceKind::Attribute),
            result_lobs: Mutex::new(HashMap::new()),
        }
    }

    fn result_lobs(&self) -> MutexGuard<'_, HashMap<ResourceId, Vec<ResourceId>>> {
        self.result_lobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register_statement(&self, statement: StatementResource) -> Arc<StatementResource> {
        let statement = Arc::new(statement);
        self.statements.insert(statement.id(), statement.clone());
        statement
    }

    /// Resolve a plain, prepared or callable statement handle.
    pub fn statement(&self, id: &ResourceId) -> Result<Arc<StatementResource>, ServerError> {
        self.statements.get(id)
    }

    pub fn remove_statement(&self, id: &ResourceId) -> Option<Arc<StatementResource>> {
        self.statements.remove(id)
    }

    pub fn register_result_set(&self, result_set: ResultSetResource) -> Arc<ResultSetResource> {
        let result_set = Arc::new(result_set);
        self.result_sets.insert(result_set.id(), result_set.clone());
        result_set
    }

    pub fn result_set(&self, id: &ResourceId) -> Result<Arc<ResultSetResource>, ServerError> {
        self.result_sets.get(id)
    }

    /// Unregister a result set together with the LOBs reading from it.
    pub fn remove_result_set(&self, id: &ResourceId) -> Option<Arc<ResultSetResource>> {
        let removed = self.result_sets.remove(id);
        let views = self.result_lobs().remove(id).unwrap_or_default();
        for lob in &views {
            self.lobs.remove(lob);
        }
        removed
    }

    pub fn register_lob(&self, lob: Arc<LobResource>) -> ResourceId {
        let id = lob.id();
        self.lobs.insert(id, lob);
        id
    }

    /// Register a LOB that reads from `result_set`'s batches instead of
    /// owning its bytes. It stays valid only while the result set does.
    pub fn register_result_lob(&self, result_set: ResourceId, lob: Arc<LobResource>) -> ResourceId {
        let id = self.register_lob(lob);
        self.result_lobs().entry(result_set).or_default().push(id);
        id
    }

    pub fn lob(&self, id: &ResourceId) -> Result<Arc<LobResource>, ServerError> {
        self.lobs.get(id)
    }

    pub fn remove_lob(&self, id: &ResourceId) -> Option<Arc<LobResource>> {
        self.lobs.remove(id)
    }

    pub fn register_attribute(&self, attribute: Attribute) -> ResourceId {
        let id = ResourceId::new();
        self.attributes.insert(id, Arc::new(attribute));
        id
    }

    pub fn attribute(&self, id: &ResourceId) -> Result<Arc<Attribute>, ServerError> {
        self.attributes.get(id)
    }

    pub fn remove_attribute(&self, id: &ResourceId) -> Option<Arc<Attribute>> {
        self.attributes.remove(id)
    }

    pub fn counts(&self) -> ResourceCounts {
        ResourceCounts {
            statements: self.statements.len(),
            result_sets: self.result_sets.len(),
            lobs: self.lobs.len(),
            attributes: self.attributes.len(),
        }
    }

    /// Drop every registered resource. LOBs are failed first so readers
    /// blocked on an unfinished upload return.
    pub fn clear(&self, reason: &str) -> ResourceCounts {
        self.result_lobs().clear();
        let lobs = self.lobs.drain();
        for lob in &lobs {
            lob.fail(reason);
        }
        ResourceCounts {
            statements: self.statements.drain().len(),
            result_sets: self.result_sets.drain().len(),
            lobs: lobs.len(),
            attributes: self.attributes.drain().len(),
        }
    }
}

/// One entry of a statement batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEntry {
    Sql(String),
    Parameters(Vec<ParameterValue>),
}

/// Mutable statement state kept between calls.
#[derive(Debug, Clone)]
pub struct StatementState {
    pub max_rows: i64,
    pub fetch_size: i32,
    pub query_timeout_secs: i32,
    pub max_field_size: i32,
    pub poolable: bool,
    pub escape_processing: bool,
    /// Bound parameters by one-based index.
    pub parameters: BTreeMap<usize, ParameterValue>,
    pub batch: Vec<BatchEntry>,
    pub last_update_count: i64,
    pub last_result_set: Option<ResourceId>,
    pub closed: bool,
}

impl Default for StatementState {
    fn default() -> Self {
        Self {
            max_rows: 0,
            fetch_size: 0,
            query_timeout_secs: 0,
            max_field_size: 0,
            poolable: false,
            escape_processing: true,
            parameters: BTreeMap::new(),
            batch: Vec::new(),
            last_update_count: -1,
            last_result_set: None,
            closed: false,
        }
    }
}

/// A plain, prepared or callable statement.
pub struct StatementResource {
    id: ResourceId,
    kind: ResourceKind,
    sql: Option<String>,
    state: Mutex<StatementState>,
}

impl StatementResource {
    pub fn plain() -> Self {
        Self::with_kind(ResourceKind::Statement, None)
    }

    pub fn prepared(sql: impl Into<String>) -> Self {
        Self::with_kind(ResourceKind::PreparedStatement, Some(sql.into()))
    }

    pub fn callable(sql: impl Into<String>) -> Self {
        Self::with_kind(ResourceKind::CallableStatement, Some(sql.into()))
    }

    fn with_kind(kind: ResourceKind, sql: Option<String>) -> Self {
        Self {
            id: ResourceId::new(),
            kind,
            sql,
            state: Mutex::new(StatementState::default()),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// SQL fixed at prepare time; `None` for plain statements.
    pub fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    pub fn state(&self) -> MutexGuard<'_, StatementState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ensure_open(&self) -> Result<(), ServerError> {
        if self.state().closed {
            return Err(ServerError::resource_not_found(self.kind, self.id));
        }
        Ok(())
    }

    pub fn set_parameter(&self, index: usize, value: ParameterValue) -> Result<(), ServerError> {
        if index == 0 {
            return Err(ServerError::InvalidRequest(
                "parameter indexes start at 1".to_string(),
            ));
        }
        self.state().parameters.insert(index, value);
        Ok(())
    }

    /// Bound parameters in index order; a gap is an error.
    pub fn bound_parameters(&self) -> Result<Vec<ParameterValue>, ServerError> {
        let state = self.state();
        let mut values = Vec::with_capacity(state.parameters.len());
        for (position, (index, value)) in state.parameters.iter().enumerate() {
            if *index != position + 1 {
                return Err(ServerError::InvalidRequest(format!(
                    "parameter {} is not set",
                    position + 1
                )));
            }
            values.push(value.clone());
        }
        Ok(values)
    }
}

/// Column description served by result-set metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub label: String,
    pub name: String,
    pub type_name: &'static str,
    pub sql_type: i32,
    pub nullable: bool,
    pub precision: i32,
    pub scale: i32,
}

/// Detached copy of result-set metadata; stays valid after the cursor moves
/// or the result set closes.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSetMetaDataSnapshot {
    pub columns: Vec<ColumnMeta>,
}

impl ResultSetMetaDataSnapshot {
    pub fn from_schema(schema: &SchemaRef, capabilities: &Capabilities) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|field| {
                let (precision, scale) = precision_and_scale(field.data_type());
                ColumnMeta {
                    label: capabilities.column_label(field.name()),
                    name: field.name().clone(),
                    type_name: sql_type_name(field.data_type()),
                    sql_type: sql_type_code(field.data_type()),
                    nullable: field.is_nullable(),
                    precision,
                    scale,
                }
            })
            .collect();
        Self { columns }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Column by one-based index.
    pub fn column(&self, index: i64) -> Result<&ColumnMeta, ServerError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| self.columns.get(i))
            .ok_or_else(|| {
                ServerError::InvalidRequest(format!(
                    "column index {index} out of range 1..={}",
                    self.columns.len()
                ))
            })
    }

    pub fn labels(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.label.clone()).collect()
    }

    /// One-based index of a column label, compared case-insensitively.
    pub fn find_column(&self, label: &str) -> Result<usize, ServerError> {
        self.columns
            .iter()
            .position(|c| c.label.eq_ignore_ascii_case(label) || c.name.eq_ignore_ascii_case(label))
            .map(|i| i + 1)
            .ok_or_else(|| ServerError::InvalidRequest(format!("no column labelled {label:?}")))
    }
}

#[derive(Debug, Clone, Copy)]
struct CursorState {
    /// Rows already sent through row-block paging.
    delivered: usize,
    /// Scroll position: 0 before the first row, `rows + 1` after the last.
    position: usize,
    fetch_size: i32,
    closed: bool,
}

/// A materialised result set registered under a session.
pub struct ResultSetResource {
    id: ResourceId,
    statement: Option<ResourceId>,
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    /// Cumulative row count at the start of each batch.
    offsets: Vec<usize>,
    total_rows: usize,
    capabilities: Capabilities,
    metadata: ResultSetMetaDataSnapshot,
    /// Copy handed out by `describe` for drivers that lose metadata once
    /// the cursor moves.
    detached_metadata: Option<Arc<ResultSetMetaDataSnapshot>>,
    cursor: Mutex<CursorState>,
    was_null: AtomicBool,
}

impl ResultSetResource {
    pub fn new(
        result: QueryResult,
        statement: Option<ResourceId>,
        capabilities: &Capabilities,
        max_rows: i64,
    ) -> Self {
        let mut offsets = Vec::with_capacity(result.batches.len());
        let mut running = 0usize;
        for batch in &result.batches {
            offsets.push(running);
            running += batch.num_rows();
        }
        let total_rows = match usize::try_from(max_rows) {
            Ok(limit) if limit > 0 => running.min(limit),
            _ => running,
        };
        let metadata = ResultSetMetaDataSnapshot::from_schema(&result.schema, capabilities);
        let detached_metadata = (!capabilities.metadata_survives_cursor_advance)
            .then(|| Arc::new(metadata.clone()));
        Self {
            id: ResourceId::new(),
            statement,
            capabilities: *capabilities,
            metadata,
            detached_metadata,
            schema: result.schema,
            batches: result.batches,
            offsets,
            total_rows,
            cursor: Mutex::new(CursorState {
                delivered: 0,
                position: 0,
                fetch_size: 0,
                closed: false,
            }),
            was_null: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn statement(&self) -> Option<ResourceId> {
        self.statement
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn row_count(&self) -> usize {
        self.total_rows
    }

    pub fn column_count(&self) -> usize {
        self.schema.fields().len()
    }

    pub fn metadata(&self) -> &ResultSetMetaDataSnapshot {
        &self.metadata
    }

    /// Metadata handed to the client. Drivers whose metadata survives the
    /// cursor get a fresh read of the open result set; the others get the
    /// copy taken at execution, which stays readable after close.
    pub fn describe(&self) -> Result<Arc<ResultSetMetaDataSnapshot>, ServerError> {
        if let Some(detached) = &self.detached_metadata {
            return Ok(detached.clone());
        }
        self.ensure_open(&self.cursor())?;
        Ok(Arc::new(ResultSetMetaDataSnapshot::from_schema(
            &self.schema,
            &self.capabilities,
        )))
    }

    fn cursor(&self) -> MutexGuard<'_, CursorState> {
        self.cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self, cursor: &CursorState) -> Result<(), ServerError> {
        if cursor.closed {
            return Err(ServerError::resource_not_found(ResourceKind::ResultSet, self.id));
        }
        Ok(())
    }

    /// Reserve the next page of at most `size` rows for row-block delivery.
    /// Returns an empty range once every row has been delivered.
    pub fn next_page(&self, size: usize) -> Result<Range<usize>, ServerError> {
        let mut cursor = self.cursor();
        self.ensure_open(&cursor)?;
        let start = cursor.delivered;
        let end = start.saturating_add(size.max(1)).min(self.total_rows);
        cursor.delivered = end;
        Ok(start..end)
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor().delivered >= self.total_rows
    }

    /// Array and in-batch row of a zero-based (row, column) cell.
    pub fn cell(&self, row: usize, column: usize) -> Result<(ArrayRef, usize), ServerError> {
        if row >= self.total_rows {
            return Err(ServerError::InvalidRequest(format!("row {row} out of range")));
        }
        let batch_index = self
            .offsets
            .partition_point(|offset| *offset <= row)
            .saturating_sub(1);
        let batch = self
            .batches
            .get(batch_index)
            .ok_or_else(|| ServerError::Internal(format!("no batch holds row {row}")))?;
        let array = batch
            .columns()
            .get(column)
            .cloned()
            .ok_or_else(|| {
                ServerError::InvalidRequest(format!("column index {} out of range", column + 1))
            })?;
        Ok((array, row - self.offsets[batch_index]))
    }

    pub fn close(&self) {
        self.cursor().closed = true;
    }

    /// Record whether the last column read was SQL NULL.
    pub fn set_was_null(&self, was_null: bool) {
        self.was_null.store(was_null, Ordering::SeqCst);
    }

    pub fn was_null(&self) -> bool {
        self.was_null.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.cursor().closed
    }

    pub fn fetch_size(&self) -> i32 {
        self.cursor().fetch_size
    }

    pub fn set_fetch_size(&self, size: i32) -> Result<(), ServerError> {
        if size < 0 {
            return Err(ServerError::InvalidRequest(format!("negative fetch size {size}")));
        }
        self.cursor().fetch_size = size;
        Ok(())
    }

    /// Move the scroll cursor; true when it lands on a row.
    pub fn scroll(&self, motion: CursorMotion) -> Result<bool, ServerError> {
        let mut cursor = self.cursor();
        self.ensure_open(&cursor)?;
        let rows = self.total_rows as i64;
        let current = cursor.position as i64;
        let target = match motion {
            CursorMotion::Next => current + 1,
            CursorMotion::Previous => current - 1,
            CursorMotion::First => 1,
            CursorMotion::Last => rows,
            CursorMotion::BeforeFirst => 0,
            CursorMotion::AfterLast => rows + 1,
            CursorMotion::Absolute(n) if n >= 0 => n,
            CursorMotion::Absolute(n) => rows + 1 + n,
            CursorMotion::Relative(n) => current + n,
        };
        let clamped = target.clamp(0, rows + 1);
        cursor.position = clamped as usize;
        Ok(clamped >= 1 && clamped <= rows)
    }

    /// Zero-based row under the scroll cursor.
    pub fn current_row(&self) -> Result<usize, ServerError> {
        let cursor = self.cursor();
        self.ensure_open(&cursor)?;
        if cursor.position == 0 || cursor.position > self.total_rows {
            return Err(ServerError::InvalidRequest(
                "cursor is not positioned on a row".to_string(),
            ));
        }
        Ok(cursor.position - 1)
    }

    /// One-based row number under the scroll cursor, 0 when off the rows.
    pub fn row_number(&self) -> usize {
        let position = self.cursor().position;
        if position > self.total_rows {
            0
        } else {
            position
        }
    }

    pub fn position_flags(&self) -> PositionFlags {
        let position = self.cursor().position;
        let rows = self.total_rows;
        PositionFlags {
            before_first: rows > 0 && position == 0,
            after_last: rows > 0 && position > rows,
            first: rows > 0 && position == 1,
            last: rows > 0 && position == rows,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMotion {
    Next,
    Previous,
    First,
    Last,
    BeforeFirst,
    AfterLast,
    Absolute(i64),
    Relative(i64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionFlags {
    pub before_first: bool,
    pub after_last: bool,
    pub first: bool,
    pub last: bool,
}

/// Driver objects that are neither statements, result sets nor LOBs.
#[derive(Debug, Clone)]
pub enum Attribute {
    ResultSetMetaData(Arc<ResultSetMetaDataSnapshot>),
    ParameterMetaData { parameter_count: usize },
    DatabaseMetaData,
    Savepoint { id: i32, name: Option<String> },
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{anyhow, Result};
    use duckdb::arrow::array::Int32Array;
    use duckdb::arrow::datatypes::{DataType, Field, Schema};

    use super::*;
    use crate::protocol::LobType;

    fn result_of(batches: &[&[i32]]) -> Result<QueryResult> {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, true)]));
        let batches = batches
            .iter()
            .map(|values| {
                RecordBatch::try_new(
                    schema.clone(),
                    vec![Arc::new(Int32Array::from(values.to_vec())) as ArrayRef],
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let total_rows = batches.iter().map(RecordBatch::num_rows).sum();
        Ok(QueryResult {
            schema,
            batches,
            total_rows,
            total_bytes: 0,
        })
    }

    #[test]
    fn handles_resolve_only_in_their_own_arena() -> Result<()> {
        let mine = ResourceArena::new();
        let theirs = ResourceArena::new();
        let statement = mine.register_statement(StatementResource::prepared("SELECT 1"));

        assert!(mine.statement(&statement.id()).is_ok());
        let err = theirs
            .statement(&statement.id())
            .err()
            .ok_or_else(|| anyhow!("foreign handle resolved"))?;
        assert!(matches!(err, ServerError::ResourceNotFound { .. }));
        Ok(())
    }

    #[test]
    fn clear_drops_everything_and_fails_lobs() -> Result<()> {
        let arena = ResourceArena::new();
        arena.register_statement(StatementResource::plain());
        let lob = Arc::new(LobResource::for_upload(LobType::Blob));
        let lob_id = arena.register_lob(lob.clone());
        arena.register_attribute(Attribute::DatabaseMetaData);

        let counts = arena.clear("session terminated");
        assert_eq!(counts.total(), 3);
        assert_eq!(arena.counts().total(), 0);
        assert!(arena.lob(&lob_id).is_err());
        assert!(matches!(
            lob.write_block(1, b"x"),
            Err(ServerError::LobStream(_))
        ));
        Ok(())
    }

    #[test]
    fn paging_and_scrolling_are_independent() -> Result<()> {
        let rs = ResultSetResource::new(
            result_of(&[&[1, 2], &[3]])?,
            None,
            &Capabilities::default(),
            0,
        );
        assert_eq!(rs.next_page(2).map_err(|e| anyhow!(e.to_string()))?, 0..2);
        assert!(rs.scroll(CursorMotion::Last).map_err(|e| anyhow!(e.to_string()))?);
        assert_eq!(rs.current_row().map_err(|e| anyhow!(e.to_string()))?, 2);
        assert_eq!(rs.next_page(2).map_err(|e| anyhow!(e.to_string()))?, 2..3);
        assert!(rs.is_exhausted());
        assert!(rs.next_page(2).map_err(|e| anyhow!(e.to_string()))?.is_empty());

        let (array, local) = rs.cell(2, 0).map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(local, 0);
        assert_eq!(array.len(), 1);

        assert!(!rs.scroll(CursorMotion::Next).map_err(|e| anyhow!(e.to_string()))?);
        assert!(rs.position_flags().after_last);
        assert!(rs.scroll(CursorMotion::Absolute(-3)).map_err(|e| anyhow!(e.to_string()))?);
        assert_eq!(rs.row_number(), 1);
        Ok(())
    }

    #[test]
    fn max_rows_caps_the_result() -> Result<()> {
        let rs = ResultSetResource::new(result_of(&[&[1, 2, 3]])?, None, &Capabilities::default(), 2);
        assert_eq!(rs.row_count(), 2);
        assert_eq!(rs.metadata().labels(), vec!["ID".to_string()]);
        Ok(())
    }

    #[test]
    fn detached_metadata_outlives_the_cursor() -> Result<()> {
        let db2 = crate::capability::DatabaseKind::Db2.capabilities();
        let detached = ResultSetResource::new(result_of(&[&[1]])?, None, &db2, 0);
        let live = ResultSetResource::new(result_of(&[&[1]])?, None, &Capabilities::default(), 0);
        assert!(live.describe().is_ok());

        detached.close();
        live.close();
        let snapshot = detached.describe().map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(snapshot.labels(), vec!["ID".to_string()]);
        assert!(matches!(
            live.describe(),
            Err(ServerError::ResourceNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn result_lobs_are_released_with_their_result_set() -> Result<()> {
        let arena = ResourceArena::new();
        let rs = arena.register_result_set(ResultSetResource::new(
            result_of(&[&[1]])?,
            None,
            &Capabilities::default(),
            0,
        ));
        let view = arena.register_result_lob(
            rs.id(),
            Arc::new(LobResource::from_bytes(b"view".to_vec())),
        );
        let hydrated = arena.register_lob(Arc::new(LobResource::from_bytes(b"copy".to_vec())));

        assert!(arena.remove_result_set(&rs.id()).is_some());
        assert!(arena.lob(&view).is_err());
        assert!(arena.lob(&hydrated).is_ok());
        Ok(())
    }

    #[test]
    fn bound_parameters_must_be_contiguous() -> Result<()> {
        let statement = StatementResource::prepared("SELECT ?, ?");
        statement
            .set_parameter(2, ParameterValue::Int(2))
            .map_err(|e| anyhow!(e.to_string()))?;
        assert!(statement.bound_parameters().is_err());
        statement
            .set_parameter(1, ParameterValue::Int(1))
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(
            statement.bound_parameters().map_err(|e| anyhow!(e.to_string()))?,
            vec![ParameterValue::Int(1), ParameterValue::Int(2)]
        );
        Ok(())
    }
}
