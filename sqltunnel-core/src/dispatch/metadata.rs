use crate::engine::cells::{decode_cell, sql_types, Cell};
use crate::error::ServerError;
use crate::session::{
    ColumnMeta, ResultSetMetaDataSnapshot, ResultSetResource, Session, TRANSACTION_SERIALIZABLE,
};
use crate::value::ParameterValue;

use super::{
    arg, arg_i32, arg_i64, boolean, int, int_of, method, null, object, text, CallOutcome,
    MethodEntry, SavepointRef, Target,
};

type Args<'a> = &'a [ParameterValue];
type Outcome = Result<CallOutcome, ServerError>;
type Snapshot = ResultSetMetaDataSnapshot;

/// `ResultSetMetaData.columnNoNulls` / `columnNullable`.
const COLUMN_NO_NULLS: i32 = 0;
const COLUMN_NULLABLE: i32 = 1;
/// `ParameterMetaData.parameterNullableUnknown`.
const PARAMETER_NULLABLE_UNKNOWN: i32 = 2;
/// `ParameterMetaData.parameterModeIn`.
const PARAMETER_MODE_IN: i32 = 1;
const TYPE_FORWARD_ONLY: i64 = 1003;
const TYPE_SCROLL_INSENSITIVE: i64 = 1004;
const CONCUR_READ_ONLY: i64 = 1007;

// === ResultSetMetaData ===

/// `java.sql.ResultSetMetaData`, served from a detached snapshot.
pub(super) const RESULT_SET_METADATA: &[MethodEntry<ResultSetMetaDataSnapshot>] = &[
    method("getColumnCount", 0, column_count),
    method("getColumnLabel", 1, column_label),
    method("getColumnName", 1, column_name),
    method("getColumnType", 1, column_type),
    method("getColumnTypeName", 1, column_type_name),
    method("getColumnClassName", 1, column_class_name),
    method("getColumnDisplaySize", 1, column_display_size),
    method("getPrecision", 1, precision),
    method("getScale", 1, scale),
    method("isNullable", 1, is_nullable),
    method("isAutoIncrement", 1, column_false),
    method("isCaseSensitive", 1, is_case_sensitive),
    method("isSearchable", 1, column_true),
    method("isCurrency", 1, column_false),
    method("isSigned", 1, is_signed),
    method("isReadOnly", 1, column_true),
    method("isWritable", 1, column_false),
    method("isDefinitelyWritable", 1, column_false),
    method("getTableName", 1, column_empty),
    method("getSchemaName", 1, column_empty),
    method("getCatalogName", 1, column_empty),
];

fn column(snapshot: &Snapshot, args: Args) -> Result<ColumnMeta, ServerError> {
    snapshot.column(arg_i64(args, 0)?).cloned()
}

fn column_count(_: &Session, snapshot: &Snapshot, _: Args) -> Outcome {
    int_of(snapshot.column_count())
}

fn column_label(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    text(column(snapshot, args)?.label)
}

fn column_name(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    text(column(snapshot, args)?.name)
}

fn column_type(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    int(column(snapshot, args)?.sql_type)
}

fn column_type_name(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    text(column(snapshot, args)?.type_name)
}

fn column_class_name(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    let class = match column(snapshot, args)?.sql_type {
        sql_types::BOOLEAN => "java.lang.Boolean",
        sql_types::TINYINT => "java.lang.Byte",
        sql_types::SMALLINT => "java.lang.Short",
        sql_types::INTEGER => "java.lang.Integer",
        sql_types::BIGINT => "java.lang.Long",
        sql_types::REAL => "java.lang.Float",
        sql_types::DOUBLE => "java.lang.Double",
        sql_types::DECIMAL => "java.math.BigDecimal",
        sql_types::VARCHAR => "java.lang.String",
        sql_types::VARBINARY => "[B",
        sql_types::DATE => "java.sql.Date",
        sql_types::TIME => "java.sql.Time",
        sql_types::TIMESTAMP => "java.sql.Timestamp",
        _ => "java.lang.Object",
    };
    text(class)
}

fn column_display_size(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    let meta = column(snapshot, args)?;
    let label_width = i32::try_from(meta.label.chars().count()).unwrap_or(i32::MAX);
    int(meta.precision.max(label_width))
}

fn precision(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    int(column(snapshot, args)?.precision)
}

fn scale(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    int(column(snapshot, args)?.scale)
}

fn is_nullable(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    int(if column(snapshot, args)?.nullable {
        COLUMN_NULLABLE
    } else {
        COLUMN_NO_NULLS
    })
}

fn is_case_sensitive(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    boolean(column(snapshot, args)?.sql_type == sql_types::VARCHAR)
}

fn is_signed(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    let meta = column(snapshot, args)?;
    let signed = matches!(
        meta.sql_type,
        sql_types::TINYINT
            | sql_types::SMALLINT
            | sql_types::INTEGER
            | sql_types::BIGINT
            | sql_types::REAL
            | sql_types::DOUBLE
            | sql_types::DECIMAL
    ) && !meta.type_name.starts_with('U');
    boolean(signed)
}

fn column_true(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    column(snapshot, args)?;
    boolean(true)
}

fn column_false(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    column(snapshot, args)?;
    boolean(false)
}

fn column_empty(_: &Session, snapshot: &Snapshot, args: Args) -> Outcome {
    column(snapshot, args)?;
    text("")
}

// === ParameterMetaData ===

/// `java.sql.ParameterMetaData`. Only the count is known before binding.
pub(super) const PARAMETER_METADATA: &[MethodEntry<usize>] = &[
    method("getParameterCount", 0, parameter_count),
    method("getParameterType", 1, parameter_type),
    method("getParameterTypeName", 1, parameter_type_name),
    method("getParameterMode", 1, parameter_mode),
    method("isNullable", 1, parameter_nullable),
];

fn parameter_index(count: usize, args: Args) -> Result<(), ServerError> {
    let index = arg_i64(args, 0)?;
    match usize::try_from(index) {
        Ok(i) if i >= 1 && i <= count => Ok(()),
        _ => Err(ServerError::InvalidRequest(format!(
            "parameter index {index} out of range 1..={count}"
        ))),
    }
}

fn parameter_count(_: &Session, count: &usize, _: Args) -> Outcome {
    int_of(*count)
}

fn parameter_type(_: &Session, count: &usize, args: Args) -> Outcome {
    parameter_index(*count, args)?;
    int(sql_types::OTHER)
}

fn parameter_type_name(_: &Session, count: &usize, args: Args) -> Outcome {
    parameter_index(*count, args)?;
    text("UNKNOWN")
}

fn parameter_mode(_: &Session, count: &usize, args: Args) -> Outcome {
    parameter_index(*count, args)?;
    int(PARAMETER_MODE_IN)
}

fn parameter_nullable(_: &Session, count: &usize, args: Args) -> Outcome {
    parameter_index(*count, args)?;
    int(PARAMETER_NULLABLE_UNKNOWN)
}

// === Savepoint ===

pub(super) const SAVEPOINT: &[MethodEntry<SavepointRef>] = &[
    method("getSavepointId", 0, savepoint_id),
    method("getSavepointName", 0, savepoint_name),
];

fn savepoint_id(_: &Session, savepoint: &SavepointRef, _: Args) -> Outcome {
    int(savepoint.id)
}

fn savepoint_name(_: &Session, savepoint: &SavepointRef, _: Args) -> Outcome {
    match &savepoint.name {
        Some(name) => text(name.clone()),
        None => null(),
    }
}

// === DatabaseMetaData ===

/// `java.sql.DatabaseMetaData`. Catalog queries read `information_schema`
/// and come back as registered result sets.
pub(super) const DATABASE_METADATA: &[MethodEntry<()>] = &[
    method("getDatabaseProductName", 0, product_name),
    method("getDatabaseProductVersion", 0, product_version),
    method("getDriverName", 0, driver_name),
    method("getDriverVersion", 0, driver_version),
    method("getDriverMajorVersion", 0, driver_major_version),
    method("getDriverMinorVersion", 0, driver_minor_version),
    method("getJDBCMajorVersion", 0, jdbc_major_version),
    method("getJDBCMinorVersion", 0, jdbc_minor_version),
    method("getIdentifierQuoteString", 0, identifier_quote),
    method("getCatalogSeparator", 0, catalog_separator),
    method("getSearchStringEscape", 0, search_string_escape),
    method("getSQLKeywords", 0, sql_keywords),
    method("getCatalogTerm", 0, catalog_term),
    method("getSchemaTerm", 0, schema_term),
    method("getDefaultTransactionIsolation", 0, default_isolation),
    method("getMaxConnections", 0, max_connections),
    method("isReadOnly", 0, is_read_only),
    method("supportsTransactions", 0, yes),
    method("supportsBatchUpdates", 0, yes),
    method("supportsSavepoints", 0, no),
    method("supportsStoredProcedures", 0, no),
    method("supportsGetGeneratedKeys", 0, no),
    method("supportsMultipleResultSets", 0, no),
    method("supportsNamedParameters", 0, no),
    method("supportsOuterJoins", 0, yes),
    method("supportsFullOuterJoins", 0, yes),
    method("supportsUnion", 0, yes),
    method("supportsUnionAll", 0, yes),
    method("supportsGroupBy", 0, yes),
    method("supportsOrderByUnrelated", 0, yes),
    method("supportsSubqueriesInExists", 0, yes),
    method("supportsSubqueriesInIns", 0, yes),
    method("supportsMixedCaseIdentifiers", 0, no),
    method("supportsMixedCaseQuotedIdentifiers", 0, yes),
    method("supportsResultSetType", 1, supports_result_set_type),
    method("supportsResultSetConcurrency", 2, supports_result_set_concurrency),
    method("supportsTransactionIsolationLevel", 1, supports_isolation_level),
    method("nullsAreSortedAtEnd", 0, yes),
    method("nullsAreSortedHigh", 0, no),
    method("nullsAreSortedLow", 0, no),
    method("usesLocalFiles", 0, no),
    method("storesUpperCaseIdentifiers", 0, stores_upper_case),
    method("storesLowerCaseIdentifiers", 0, no),
    method("storesMixedCaseIdentifiers", 0, stores_mixed_case),
    method("doesMaxRowSizeIncludeBlobs", 0, no),
    method("allTablesAreSelectable", 0, yes),
    method("allProceduresAreCallable", 0, no),
    method("getTables", 4, get_tables),
    method("getColumns", 4, get_columns),
    method("getSchemas", 0, get_schemas),
    method("getSchemas", 2, get_schemas),
    method("getCatalogs", 0, get_catalogs),
    method("getTableTypes", 0, get_table_types),
    method("getPrimaryKeys", 3, get_primary_keys),
    method("getConnection", 0, get_connection),
];

fn yes(_: &Session, _: &(), _: Args) -> Outcome {
    boolean(true)
}

fn no(_: &Session, _: &(), _: Args) -> Outcome {
    boolean(false)
}

fn product_name(session: &Session, _: &(), _: Args) -> Outcome {
    text(session.pool().kind().product_name())
}

fn product_version(session: &Session, _: &(), _: Args) -> Outcome {
    let result = session.execute_query("SELECT version() AS version", &[])?;
    let rows = ResultSetResource::new(result, None, &session.capabilities(), 1);
    if rows.row_count() == 0 {
        return null();
    }
    let (array, row) = rows.cell(0, 0)?;
    match decode_cell(&array, row)? {
        Cell::Value(value) => Ok(CallOutcome::Value(value)),
        Cell::Binary(_) => null(),
    }
}

fn driver_name(_: &Session, _: &(), _: Args) -> Outcome {
    text(env!("CARGO_PKG_NAME"))
}

fn driver_version(_: &Session, _: &(), _: Args) -> Outcome {
    text(env!("CARGO_PKG_VERSION"))
}

fn driver_major_version(_: &Session, _: &(), _: Args) -> Outcome {
    int(env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0))
}

fn driver_minor_version(_: &Session, _: &(), _: Args) -> Outcome {
    int(env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0))
}

fn jdbc_major_version(_: &Session, _: &(), _: Args) -> Outcome {
    int(4)
}

fn jdbc_minor_version(_: &Session, _: &(), _: Args) -> Outcome {
    int(2)
}

fn identifier_quote(_: &Session, _: &(), _: Args) -> Outcome {
    text("\"")
}

fn catalog_separator(_: &Session, _: &(), _: Args) -> Outcome {
    text(".")
}

fn search_string_escape(_: &Session, _: &(), _: Args) -> Outcome {
    text("\\")
}

fn sql_keywords(_: &Session, _: &(), _: Args) -> Outcome {
    text("")
}

fn catalog_term(_: &Session, _: &(), _: Args) -> Outcome {
    text("database")
}

fn schema_term(_: &Session, _: &(), _: Args) -> Outcome {
    text("schema")
}

fn default_isolation(_: &Session, _: &(), _: Args) -> Outcome {
    int(TRANSACTION_SERIALIZABLE)
}

fn max_connections(session: &Session, _: &(), _: Args) -> Outcome {
    int(i32::try_from(session.pool().settings().max_size).unwrap_or(i32::MAX))
}

fn is_read_only(session: &Session, _: &(), _: Args) -> Outcome {
    boolean(session.connection_state().read_only)
}

fn supports_result_set_type(_: &Session, _: &(), args: Args) -> Outcome {
    let kind = arg_i64(args, 0)?;
    boolean(kind == TYPE_FORWARD_ONLY || kind == TYPE_SCROLL_INSENSITIVE)
}

fn supports_result_set_concurrency(_: &Session, _: &(), args: Args) -> Outcome {
    let kind = arg_i64(args, 0)?;
    let concurrency = arg_i64(args, 1)?;
    boolean(
        (kind == TYPE_FORWARD_ONLY || kind == TYPE_SCROLL_INSENSITIVE)
            && concurrency == CONCUR_READ_ONLY,
    )
}

fn supports_isolation_level(_: &Session, _: &(), args: Args) -> Outcome {
    boolean(arg_i32(args, 0)? == TRANSACTION_SERIALIZABLE)
}

fn stores_upper_case(session: &Session, _: &(), _: Args) -> Outcome {
    boolean(session.capabilities().upper_case_identifiers)
}

fn stores_mixed_case(session: &Session, _: &(), _: Args) -> Outcome {
    boolean(!session.capabilities().upper_case_identifiers)
}

fn get_connection(_: &Session, _: &(), _: Args) -> Outcome {
    object(Target::Connection)
}

/// Nullable text argument used as a filter; NULL means "any".
fn filter(args: Args, index: usize) -> Result<ParameterValue, ServerError> {
    Ok(match arg(args, index)?.render_text() {
        Some(value) => ParameterValue::Text(value),
        None => ParameterValue::Null(sql_types::VARCHAR),
    })
}

fn catalog_query(session: &Session, sql: &str, params: &[ParameterValue]) -> Outcome {
    let result = session.execute_query(sql, params)?;
    let result_set = ResultSetResource::new(result, None, &session.capabilities(), 0);
    let result_set = session.resources().register_result_set(result_set);
    object(Target::ResultSet(result_set))
}

const TABLES_SQL: &str = r#"
SELECT table_catalog AS "TABLE_CAT",
       table_schema AS "TABLE_SCHEM",
       table_name AS "TABLE_NAME",
       CASE table_type WHEN 'BASE TABLE' THEN 'TABLE' ELSE table_type END AS "TABLE_TYPE",
       CAST(NULL AS VARCHAR) AS "REMARKS"
FROM information_schema.tables
WHERE ($1 IS NULL OR table_catalog = $1)
  AND table_schema LIKE coalesce($2, '%')
  AND table_name LIKE coalesce($3, '%')
  AND ($4 IS NULL OR list_contains(
        string_split($4, ','),
        CASE table_type WHEN 'BASE TABLE' THEN 'TABLE' ELSE table_type END))
ORDER BY "TABLE_TYPE", "TABLE_CAT", "TABLE_SCHEM", "TABLE_NAME"
"#;

/// `getTables(catalog, schemaPattern, tableNamePattern, types)`; `types` is
/// a comma-separated list or NULL.
fn get_tables(session: &Session, _: &(), args: Args) -> Outcome {
    let params = [filter(args, 0)?, filter(args, 1)?, filter(args, 2)?, filter(args, 3)?];
    catalog_query(session, TABLES_SQL, &params)
}

fn columns_sql() -> String {
    format!(
        r#"
SELECT table_catalog AS "TABLE_CAT",
       table_schema AS "TABLE_SCHEM",
       table_name AS "TABLE_NAME",
       column_name AS "COLUMN_NAME",
       CASE
         WHEN data_type = 'BOOLEAN' THEN {boolean}
         WHEN data_type = 'TINYINT' THEN {tinyint}
         WHEN data_type = 'SMALLINT' THEN {smallint}
         WHEN data_type = 'INTEGER' THEN {integer}
         WHEN data_type = 'BIGINT' THEN {bigint}
         WHEN data_type IN ('FLOAT', 'REAL') THEN {real}
         WHEN data_type = 'DOUBLE' THEN {double}
         WHEN data_type LIKE 'DECIMAL%' THEN {decimal}
         WHEN data_type = 'VARCHAR' THEN {varchar}
         WHEN data_type = 'BLOB' THEN {varbinary}
         WHEN data_type = 'DATE' THEN {date}
         WHEN data_type LIKE 'TIME%' AND data_type NOT LIKE 'TIMESTAMP%' THEN {time}
         WHEN data_type LIKE 'TIMESTAMP%' THEN {timestamp}
         ELSE {other}
       END AS "DATA_TYPE",
       data_type AS "TYPE_NAME",
       coalesce(character_maximum_length, numeric_precision) AS "COLUMN_SIZE",
       numeric_scale AS "DECIMAL_DIGITS",
       CASE WHEN is_nullable = 'YES' THEN 1 ELSE 0 END AS "NULLABLE",
       CAST(NULL AS VARCHAR) AS "REMARKS",
       column_default AS "COLUMN_DEF",
       ordinal_position AS "ORDINAL_POSITION",
       is_nullable AS "IS_NULLABLE"
FROM information_schema.columns
WHERE ($1 IS NULL OR table_catalog = $1)
  AND table_schema LIKE coalesce($2, '%')
  AND table_name LIKE coalesce($3, '%')
  AND column_name LIKE coalesce($4, '%')
ORDER BY "TABLE_CAT", "TABLE_SCHEM", "TABLE_NAME", "ORDINAL_POSITION"
"#,
        boolean = sql_types::BOOLEAN,
        tinyint = sql_types::TINYINT,
        smallint = sql_types::SMALLINT,
        integer = sql_types::INTEGER,
        bigint = sql_types::BIGINT,
        real = sql_types::REAL,
        double = sql_types::DOUBLE,
        decimal = sql_types::DECIMAL,
        varchar = sql_types::VARCHAR,
        varbinary = sql_types::VARBINARY,
        date = sql_types::DATE,
        time = sql_types::TIME,
        timestamp = sql_types::TIMESTAMP,
        other = sql_types::OTHER,
    )
}

/// `getColumns(catalog, schemaPattern, tableNamePattern, columnNamePattern)`.
fn get_columns(session: &Session, _: &(), args: Args) -> Outcome {
    let params = [filter(args, 0)?, filter(args, 1)?, filter(args, 2)?, filter(args, 3)?];
    catalog_query(session, &columns_sql(), &params)
}

const SCHEMAS_SQL: &str = r#"
SELECT schema_name AS "TABLE_SCHEM", catalog_name AS "TABLE_CATALOG"
FROM information_schema.schemata
WHERE ($1 IS NULL OR catalog_name = $1)
  AND schema_name LIKE coalesce($2, '%')
ORDER BY "TABLE_CATALOG", "TABLE_SCHEM"
"#;

fn get_schemas(session: &Session, _: &(), args: Args) -> Outcome {
    let params = if args.is_empty() {
        [
            ParameterValue::Null(sql_types::VARCHAR),
            ParameterValue::Null(sql_types::VARCHAR),
        ]
    } else {
        [filter(args, 0)?, filter(args, 1)?]
    };
    catalog_query(session, SCHEMAS_SQL, &params)
}

fn get_catalogs(session: &Session, _: &(), _: Args) -> Outcome {
    catalog_query(
        session,
        r#"SELECT DISTINCT catalog_name AS "TABLE_CAT" FROM information_schema.schemata ORDER BY 1"#,
        &[],
    )
}

fn get_table_types(session: &Session, _: &(), _: Args) -> Outcome {
    catalog_query(
        session,
        r#"SELECT * FROM (VALUES ('LOCAL TEMPORARY'), ('TABLE'), ('VIEW')) AS t("TABLE_TYPE")"#,
        &[],
    )
}

const PRIMARY_KEYS_SQL: &str = r#"
SELECT database_name AS "TABLE_CAT",
       schema_name AS "TABLE_SCHEM",
       table_name AS "TABLE_NAME",
       unnest(constraint_column_names) AS "COLUMN_NAME",
       unnest(generate_series(1, len(constraint_column_names))) AS "KEY_SEQ",
       CAST(NULL AS VARCHAR) AS "PK_NAME"
FROM duckdb_constraints()
WHERE constraint_type = 'PRIMARY KEY'
  AND ($1 IS NULL OR database_name = $1)
  AND ($2 IS NULL OR schema_name = $2)
  AND table_name = $3
ORDER BY "COLUMN_NAME"
"#;

/// `getPrimaryKeys(catalog, schema, table)`.
fn get_primary_keys(session: &Session, _: &(), args: Args) -> Outcome {
    let params = [filter(args, 0)?, filter(args, 1)?, filter(args, 2)?];
    catalog_query(session, PRIMARY_KEYS_SQL, &params)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capability::Capabilities;
    use duckdb::arrow::datatypes::{DataType, Field, Schema};

    #[test]
    fn snapshot_columns_are_one_based() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let snapshot = ResultSetMetaDataSnapshot::from_schema(&schema, &Capabilities::default());
        assert!(snapshot.column(0).is_err());
        assert!(snapshot.column(3).is_err());
        assert_eq!(
            snapshot.column(2).map(|c| c.sql_type).ok(),
            Some(sql_types::VARCHAR)
        );
        assert!(!columns_sql().contains('{'));
    }
}
