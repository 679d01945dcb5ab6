//! Lightweight SQL classification.
//!
//! SQL is forwarded to the engine verbatim; parsing only decides whether a
//! statement produces rows and whether it is transaction control that the
//! session must track.

use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionControl {
    Begin,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Produces a result set.
    Query,
    /// DDL or DML reporting an update count.
    Update,
    Transaction(TransactionControl),
}

impl StatementKind {
    /// Classify a SQL string. For multi-statement SQL the last statement
    /// decides. Text the generic dialect cannot parse falls back to its
    /// leading keyword.
    pub fn classify(sql: &str) -> Self {
        let dialect = GenericDialect {};
        match Parser::parse_sql(&dialect, sql) {
            Ok(statements) => match statements.last() {
                Some(statement) => Self::of_statement(statement),
                None => StatementKind::Update,
            },
            Err(_) => Self::from_keyword(sql),
        }
    }

    pub fn is_query(self) -> bool {
        self == StatementKind::Query
    }

    fn of_statement(statement: &Statement) -> Self {
        match statement {
            Statement::Query(_)
            | Statement::ShowTables { .. }
            | Statement::ShowColumns { .. }
            | Statement::ShowCreate { .. }
            | Statement::ShowVariable { .. }
            | Statement::ShowVariables { .. }
            | Statement::Explain { .. }
            | Statement::ExplainTable { .. }
            | Statement::Pragma { .. } => StatementKind::Query,
            Statement::StartTransaction { .. } => {
                StatementKind::Transaction(TransactionControl::Begin)
            }
            Statement::Commit { .. } => StatementKind::Transaction(TransactionControl::Commit),
            Statement::Rollback { savepoint: None, .. } => {
                StatementKind::Transaction(TransactionControl::Rollback)
            }
            _ => StatementKind::Update,
        }
    }

    fn from_keyword(sql: &str) -> Self {
        let keyword = leading_keyword(sql).to_ascii_uppercase();
        match keyword.as_str() {
            "SELECT" | "WITH" | "VALUES" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "PRAGMA"
            | "SUMMARIZE" | "FROM" | "TABLE" | "CALL" => StatementKind::Query,
            "BEGIN" | "START" => StatementKind::Transaction(TransactionControl::Begin),
            "COMMIT" | "END" => StatementKind::Transaction(TransactionControl::Commit),
            "ROLLBACK" | "ABORT" if !sql.to_ascii_uppercase().contains(" TO ") => {
                StatementKind::Transaction(TransactionControl::Rollback)
            }
            _ => StatementKind::Update,
        }
    }
}

/// First word of the statement, skipping whitespace, comments and parentheses.
fn leading_keyword(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            break;
        }
    }
    let end = rest
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(rest.len());
    &rest[..end]
}
