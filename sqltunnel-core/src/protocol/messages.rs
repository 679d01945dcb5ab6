//! Wire messages exchanged with the client driver.
//!
//! Messages are plain protobuf payloads carried inside Flight actions, tickets
//! and data frames. Tags are part of the wire contract; never renumber them.

use std::collections::HashMap;

use prost::Message;

/// Lifecycle of the transaction attached to a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum TransactionStatus {
    None = 0,
    Active = 1,
    Committed = 2,
    RolledBack = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum LobType {
    Unspecified = 0,
    Blob = 1,
    Clob = 2,
    BinaryStream = 3,
}

/// Interface family a `callResource` descriptor targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum ResourceType {
    Unspecified = 0,
    Connection = 1,
    Statement = 2,
    PreparedStatement = 3,
    CallableStatement = 4,
    ResultSet = 5,
    ResultSetMetaData = 6,
    DatabaseMetaData = 7,
    Lob = 8,
    Savepoint = 9,
    ParameterMetaData = 10,
}

/// Verb of a call descriptor. The method name is the verb prefix followed by
/// the resource name, so `Get` + `AutoCommit` resolves `getAutoCommit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum CallType {
    Call = 0,
    Set = 1,
    Get = 2,
    Is = 3,
    Supports = 4,
    Next = 5,
    Previous = 6,
    First = 7,
    Last = 8,
    BeforeFirst = 9,
    AfterLast = 10,
    Absolute = 11,
    Relative = 12,
    Close = 13,
    Add = 14,
    Clear = 15,
    Execute = 16,
    Was = 17,
    Release = 18,
    Rollback = 19,
    Commit = 20,
    Length = 21,
    Position = 22,
    Free = 23,
    Truncate = 24,
    Nulls = 25,
    Uses = 26,
    Stores = 27,
    All = 28,
    Does = 29,
    Find = 30,
}

impl CallType {
    pub fn prefix(self) -> &'static str {
        match self {
            CallType::Call => "",
            CallType::Set => "set",
            CallType::Get => "get",
            CallType::Is => "is",
            CallType::Supports => "supports",
            CallType::Next => "next",
            CallType::Previous => "previous",
            CallType::First => "first",
            CallType::Last => "last",
            CallType::BeforeFirst => "beforeFirst",
            CallType::AfterLast => "afterLast",
            CallType::Absolute => "absolute",
            CallType::Relative => "relative",
            CallType::Close => "close",
            CallType::Add => "add",
            CallType::Clear => "clear",
            CallType::Execute => "execute",
            CallType::Was => "was",
            CallType::Release => "release",
            CallType::Rollback => "rollback",
            CallType::Commit => "commit",
            CallType::Length => "length",
            CallType::Position => "position",
            CallType::Free => "free",
            CallType::Truncate => "truncate",
            CallType::Nulls => "nulls",
            CallType::Uses => "uses",
            CallType::Stores => "stores",
            CallType::All => "all",
            CallType::Does => "does",
            CallType::Find => "find",
        }
    }
}

/// Canonical error classes surfaced to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorKind {
    Unspecified = 0,
    Connection = 1,
    DataException = 2,
    SqlException = 3,
    SessionNotFound = 4,
    ResourceNotFound = 5,
    UnsupportedOperation = 6,
    LobStream = 7,
    InvalidRequest = 8,
    Internal = 9,
}

#[derive(Clone, PartialEq, Message)]
pub struct TransactionInfo {
    #[prost(string, tag = "1")]
    pub transaction_uuid: String,
    #[prost(enumeration = "TransactionStatus", tag = "2")]
    pub status: i32,
}

/// Session shell carried on every request. An empty `session_uuid` means the
/// call runs on a one-shot connection.
#[derive(Clone, PartialEq, Message)]
pub struct SessionInfo {
    #[prost(string, tag = "1")]
    pub session_uuid: String,
    #[prost(string, tag = "2")]
    pub conn_hash: String,
    #[prost(string, tag = "3")]
    pub client_uuid: String,
    #[prost(message, optional, tag = "4")]
    pub transaction: Option<TransactionInfo>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectRequest {
    #[prost(string, tag = "1")]
    pub url: String,
    #[prost(string, tag = "2")]
    pub user: String,
    #[prost(string, tag = "3")]
    pub password: String,
    #[prost(string, tag = "4")]
    pub client_uuid: String,
    #[prost(map = "string, string", tag = "5")]
    pub properties: HashMap<String, String>,
    /// Logical data source; distinct names get distinct pools for the same URL.
    #[prost(string, tag = "6")]
    pub datasource_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireValue {
    #[prost(
        oneof = "wire_value::Kind",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17"
    )]
    pub kind: Option<wire_value::Kind>,
}

pub mod wire_value {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(int32, tag = "1")]
        Int(i32),
        #[prost(int64, tag = "2")]
        Long(i64),
        #[prost(double, tag = "3")]
        Double(f64),
        #[prost(float, tag = "4")]
        Float(f32),
        #[prost(string, tag = "5")]
        Text(::prost::alloc::string::String),
        #[prost(bool, tag = "6")]
        Boolean(bool),
        /// Decimal rendered as its canonical string.
        #[prost(string, tag = "7")]
        Decimal(::prost::alloc::string::String),
        #[prost(bytes = "vec", tag = "8")]
        Bytes(::prost::alloc::vec::Vec<u8>),
        #[prost(int32, tag = "9")]
        Byte(i32),
        /// ISO-8601 `YYYY-MM-DD`.
        #[prost(string, tag = "10")]
        Date(::prost::alloc::string::String),
        /// ISO-8601 `HH:MM:SS[.ffffff]`.
        #[prost(string, tag = "11")]
        Time(::prost::alloc::string::String),
        /// ISO-8601 `YYYY-MM-DDTHH:MM:SS[.ffffff]`.
        #[prost(string, tag = "12")]
        Timestamp(::prost::alloc::string::String),
        #[prost(string, tag = "13")]
        BlobRef(::prost::alloc::string::String),
        #[prost(string, tag = "14")]
        ClobRef(::prost::alloc::string::String),
        #[prost(string, tag = "15")]
        BinaryStreamRef(::prost::alloc::string::String),
        /// SQL type code of the null.
        #[prost(int32, tag = "16")]
        Null(i32),
        #[prost(string, tag = "17")]
        Opaque(::prost::alloc::string::String),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct StatementRequest {
    #[prost(message, optional, tag = "1")]
    pub session: Option<SessionInfo>,
    #[prost(string, tag = "2")]
    pub sql: String,
    #[prost(message, repeated, tag = "3")]
    pub parameters: Vec<WireValue>,
    /// Previously registered statement to reuse, or empty.
    #[prost(string, tag = "4")]
    pub statement_uuid: String,
    #[prost(map = "string, string", tag = "5")]
    pub properties: HashMap<String, String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Row {
    #[prost(message, repeated, tag = "1")]
    pub values: Vec<WireValue>,
}

/// One bounded page of a result set. Labels are only set on the first block.
#[derive(Clone, PartialEq, Message)]
pub struct RowBlock {
    #[prost(string, repeated, tag = "1")]
    pub labels: Vec<String>,
    #[prost(message, repeated, tag = "2")]
    pub rows: Vec<Row>,
    #[prost(string, tag = "3")]
    pub result_set_uuid: String,
    /// No further rows follow this block.
    #[prost(bool, tag = "4")]
    pub last: bool,
    /// Zero-based index of the first row in this block.
    #[prost(int64, tag = "5")]
    pub row_offset: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct OpResult {
    #[prost(message, optional, tag = "1")]
    pub session: Option<SessionInfo>,
    #[prost(int64, tag = "2")]
    pub update_count: i64,
    #[prost(string, tag = "3")]
    pub statement_uuid: String,
    #[prost(message, optional, tag = "4")]
    pub rows: Option<RowBlock>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FetchRequest {
    #[prost(message, optional, tag = "1")]
    pub session: Option<SessionInfo>,
    #[prost(string, tag = "2")]
    pub result_set_uuid: String,
    /// Rows wanted; zero picks the server default.
    #[prost(int32, tag = "3")]
    pub size: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct LobDataBlock {
    #[prost(message, optional, tag = "1")]
    pub session: Option<SessionInfo>,
    #[prost(enumeration = "LobType", tag = "2")]
    pub lob_type: i32,
    /// Empty on the first upload block; the server assigns the handle.
    #[prost(string, tag = "3")]
    pub lob_uuid: String,
    /// One-based byte (Blob, stream) or character (Clob) position; -1 marks "no data".
    #[prost(int64, tag = "4")]
    pub position: i64,
    #[prost(bytes = "vec", tag = "5")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct LobReference {
    #[prost(message, optional, tag = "1")]
    pub session: Option<SessionInfo>,
    #[prost(string, tag = "2")]
    pub lob_uuid: String,
    #[prost(enumeration = "LobType", tag = "3")]
    pub lob_type: i32,
    #[prost(int64, tag = "4")]
    pub bytes_written: i64,
    /// Set on the final reference of an upload.
    #[prost(bool, tag = "5")]
    pub complete: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReadLobRequest {
    #[prost(message, optional, tag = "1")]
    pub reference: Option<LobReference>,
    /// One-based start position.
    #[prost(int64, tag = "2")]
    pub position: i64,
    /// Maximum units to read; zero or negative reads to the end.
    #[prost(int64, tag = "3")]
    pub length: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct CallTarget {
    #[prost(enumeration = "CallType", tag = "1")]
    pub call_type: i32,
    #[prost(string, tag = "2")]
    pub resource_name: String,
    #[prost(message, repeated, tag = "3")]
    pub params: Vec<WireValue>,
    #[prost(message, optional, boxed, tag = "4")]
    pub next_call: Option<Box<CallTarget>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CallResourceRequest {
    #[prost(message, optional, tag = "1")]
    pub session: Option<SessionInfo>,
    #[prost(enumeration = "ResourceType", tag = "2")]
    pub resource_type: i32,
    #[prost(string, tag = "3")]
    pub resource_uuid: String,
    #[prost(message, optional, tag = "4")]
    pub target: Option<CallTarget>,
    #[prost(map = "string, string", tag = "5")]
    pub properties: HashMap<String, String>,
    /// SQL for a prepared statement created lazily by this call.
    #[prost(string, tag = "6")]
    pub sql: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct CallResourceResponse {
    #[prost(message, optional, tag = "1")]
    pub session: Option<SessionInfo>,
    /// Handle of a resource created lazily by this call.
    #[prost(string, tag = "2")]
    pub resource_uuid: String,
    /// Handle of a resource returned by the call.
    #[prost(string, tag = "3")]
    pub result_uuid: String,
    #[prost(message, repeated, tag = "4")]
    pub values: Vec<WireValue>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SessionTerminationStatus {
    #[prost(bool, tag = "1")]
    pub terminated: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct ErrorResponse {
    #[prost(enumeration = "ErrorKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(string, tag = "3")]
    pub sql_state: String,
    #[prost(int32, tag = "4")]
    pub vendor_code: i32,
}
