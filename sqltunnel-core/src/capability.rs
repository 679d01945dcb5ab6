//! Per-database behaviour flags consulted by the row and LOB paths.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseKind {
    Db2,
    SqlServer,
    Oracle,
    Postgres,
    MySql,
    MariaDb,
    H2,
    DuckDb,
    Generic,
}

impl DatabaseKind {
    /// Detect the database family from a connection URL.
    pub fn from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        let scheme = lower.strip_prefix("jdbc:").unwrap_or(&lower);
        let prefixes: &[(&str, DatabaseKind)] = &[
            ("db2:", DatabaseKind::Db2),
            ("sqlserver:", DatabaseKind::SqlServer),
            ("oracle:", DatabaseKind::Oracle),
            ("postgresql:", DatabaseKind::Postgres),
            ("postgres:", DatabaseKind::Postgres),
            ("mysql:", DatabaseKind::MySql),
            ("mariadb:", DatabaseKind::MariaDb),
            ("h2:", DatabaseKind::H2),
            ("duckdb:", DatabaseKind::DuckDb),
        ];
        prefixes
            .iter()
            .find(|(prefix, _)| scheme.starts_with(prefix))
            .map(|(_, kind)| *kind)
            .unwrap_or(DatabaseKind::Generic)
    }

    pub fn capabilities(self) -> Capabilities {
        match self {
            DatabaseKind::Db2 => Capabilities {
                supports_cursor_lookahead: false,
                requires_eager_lob_hydration: true,
                metadata_survives_cursor_advance: false,
                binary_as_lob: true,
                upper_case_identifiers: true,
            },
            DatabaseKind::SqlServer => Capabilities {
                supports_cursor_lookahead: false,
                requires_eager_lob_hydration: true,
                metadata_survives_cursor_advance: true,
                binary_as_lob: true,
                upper_case_identifiers: false,
            },
            DatabaseKind::Postgres | DatabaseKind::MySql | DatabaseKind::MariaDb => Capabilities {
                binary_as_lob: false,
                upper_case_identifiers: false,
                ..Capabilities::default()
            },
            DatabaseKind::H2 => Capabilities {
                binary_as_lob: false,
                ..Capabilities::default()
            },
            DatabaseKind::DuckDb => Capabilities {
                upper_case_identifiers: false,
                ..Capabilities::default()
            },
            DatabaseKind::Oracle | DatabaseKind::Generic => Capabilities::default(),
        }
    }

    pub fn product_name(self) -> &'static str {
        match self {
            DatabaseKind::Db2 => "DB2",
            DatabaseKind::SqlServer => "Microsoft SQL Server",
            DatabaseKind::Oracle => "Oracle",
            DatabaseKind::Postgres => "PostgreSQL",
            DatabaseKind::MySql => "MySQL",
            DatabaseKind::MariaDb => "MariaDB",
            DatabaseKind::H2 => "H2",
            DatabaseKind::DuckDb | DatabaseKind::Generic => "DuckDB",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatabaseKind::Db2 => "db2",
            DatabaseKind::SqlServer => "sqlserver",
            DatabaseKind::Oracle => "oracle",
            DatabaseKind::Postgres => "postgresql",
            DatabaseKind::MySql => "mysql",
            DatabaseKind::MariaDb => "mariadb",
            DatabaseKind::H2 => "h2",
            DatabaseKind::DuckDb => "duckdb",
            DatabaseKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// What a database driver tolerates while a result set is being paged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Rows may be read ahead of the client; otherwise one row per block.
    pub supports_cursor_lookahead: bool,
    /// LOB cells must be copied out before the cursor moves.
    pub requires_eager_lob_hydration: bool,
    /// Result-set metadata stays readable after the cursor moves.
    pub metadata_survives_cursor_advance: bool,
    /// Large binary cells travel as LOB handles instead of inline bytes.
    pub binary_as_lob: bool,
    /// Unquoted identifiers fold to upper case, so lower-case column labels
    /// are reported in upper case.
    pub upper_case_identifiers: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_cursor_lookahead: true,
            requires_eager_lob_hydration: false,
            metadata_survives_cursor_advance: true,
            binary_as_lob: true,
            upper_case_identifiers: true,
        }
    }
}

impl Capabilities {
    /// Rows per block after applying the look-ahead restriction.
    pub fn block_size(&self, requested: usize) -> usize {
        if self.supports_cursor_lookahead {
            requested.max(1)
        } else {
            1
        }
    }

    /// Column label as reported to the client.
    pub fn column_label(&self, name: &str) -> String {
        if self.upper_case_identifiers && !name.chars().any(char::is_uppercase) {
            name.to_uppercase()
        } else {
            name.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_detection_handles_jdbc_prefix_and_case() {
        assert_eq!(DatabaseKind::from_url("jdbc:db2://h:50000/x"), DatabaseKind::Db2);
        assert_eq!(
            DatabaseKind::from_url("JDBC:SQLSERVER://h;databaseName=x"),
            DatabaseKind::SqlServer
        );
        assert_eq!(DatabaseKind::from_url("postgresql://h/db"), DatabaseKind::Postgres);
        assert_eq!(DatabaseKind::from_url("duckdb::memory:"), DatabaseKind::DuckDb);
        assert_eq!(DatabaseKind::from_url("db://host/db"), DatabaseKind::Generic);
    }

    #[test]
    fn fragile_drivers_fall_back_to_row_by_row() {
        let db2 = DatabaseKind::Db2.capabilities();
        assert!(!db2.supports_cursor_lookahead);
        assert!(db2.requires_eager_lob_hydration);
        assert!(!db2.metadata_survives_cursor_advance);
        assert_eq!(db2.block_size(100), 1);

        let sqlserver = DatabaseKind::SqlServer.capabilities();
        assert!(sqlserver.metadata_survives_cursor_advance);
        assert_eq!(sqlserver.block_size(50), 1);

        let generic = DatabaseKind::Generic.capabilities();
        assert_eq!(generic.block_size(100), 100);
        assert!(!DatabaseKind::Postgres.capabilities().binary_as_lob);
    }

    #[test]
    fn labels_fold_only_for_upper_case_databases() {
        let generic = DatabaseKind::Generic.capabilities();
        assert_eq!(generic.column_label("id"), "ID");
        assert_eq!(generic.column_label("MixedCase"), "MixedCase");
        assert_eq!(DatabaseKind::DuckDb.capabilities().column_label("id"), "id");
    }
}
