//! Statement batch data models.
//!
//! A request carries a JSON array of `{"query": "...", "values": [...]}`
//! objects; a response is a JSON array of result objects. These types are the
//! typed form of both ends of that wire format.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// How every statement in a batch is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Independent statements, each producing its own result.
    Query,
    /// One all-or-nothing transaction producing one aggregate result.
    Update,
}

impl BatchMode {
    /// Map the HTTP `update` flag to a mode.
    pub fn from_update_flag(update: bool) -> Self {
        if update { Self::Update } else { Self::Query }
    }

    pub fn is_update(self) -> bool {
        matches!(self, Self::Update)
    }
}

impl std::fmt::Display for BatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// One statement of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementSpec {
    pub query_text: String,
    /// `None` marks a raw (non-parameterized) statement.
    pub parameters: Option<Vec<String>>,
}

impl StatementSpec {
    /// Create a raw statement.
    pub fn raw(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            parameters: None,
        }
    }

    /// Create a parameterized statement.
    pub fn prepared(query_text: impl Into<String>, parameters: Vec<String>) -> Self {
        Self {
            query_text: query_text.into(),
            parameters: Some(parameters),
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.parameters.is_some()
    }
}

/// A parsed request: mode plus ordered statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub mode: BatchMode,
    pub statements: Vec<StatementSpec>,
}

/// Wire shape of one incoming statement object.
#[derive(Debug, Deserialize)]
struct WireStatement {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    values: Option<Vec<JsonValue>>,
}

impl BatchRequest {
    /// Build a request from already-typed statements.
    pub fn new(mode: BatchMode, statements: Vec<StatementSpec>) -> Self {
        Self { mode, statements }
    }

    /// Parse the JSON statement array of a request.
    ///
    /// Fails with `MalformedRequest` on invalid JSON, an empty array, a
    /// missing or empty `query`, or a `values` entry that is not a scalar.
    /// Numbers and booleans in `values` are accepted and kept as their text.
    pub fn parse(json: &str, mode: BatchMode) -> DbResult<Self> {
        let wire: Vec<WireStatement> = serde_json::from_str(json)?;

        if wire.is_empty() {
            return Err(DbError::malformed("No queries specified"));
        }

        let statements = wire
            .into_iter()
            .enumerate()
            .map(|(idx, stmt)| {
                let query_text = stmt
                    .query
                    .filter(|q| !q.trim().is_empty())
                    .ok_or_else(|| {
                        DbError::malformed(format!("Query is missing (statement #{})", idx))
                    })?;

                let parameters = stmt
                    .values
                    .map(|values| {
                        values
                            .into_iter()
                            .enumerate()
                            .map(|(pos, value)| value_token(value, idx, pos))
                            .collect::<DbResult<Vec<_>>>()
                    })
                    .transpose()?;

                Ok(StatementSpec {
                    query_text,
                    parameters,
                })
            })
            .collect::<DbResult<Vec<_>>>()?;

        Ok(Self { mode, statements })
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

fn value_token(value: JsonValue, stmt_idx: usize, pos: usize) -> DbResult<String> {
    match value {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        JsonValue::Bool(b) => Ok(b.to_string()),
        other => Err(DbError::malformed(format!(
            "Unsupported value {} at position {} of statement #{}",
            other, pos, stmt_idx
        ))),
    }
}

/// Outcome of one statement (query mode) or of a whole batch (update mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementStatus {
    Success,
    Error,
}

/// One entry of a batch result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    pub status: StatementStatus,
    pub message: String,
    #[serde(rename = "cols")]
    pub columns: Vec<String>,
    pub types: Vec<String>,
    /// SQL NULL cells are `None` and serialize as JSON `null`.
    pub rows: Vec<Vec<Option<String>>>,
}

impl StatementResult {
    /// An empty success entry.
    pub fn success() -> Self {
        Self {
            status: StatementStatus::Success,
            message: String::new(),
            columns: Vec::new(),
            types: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// A success entry carrying a result set.
    pub fn with_rows(
        columns: Vec<String>,
        types: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    ) -> Self {
        Self {
            columns,
            types,
            rows,
            ..Self::success()
        }
    }

    /// An error entry; never carries row data.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: StatementStatus::Error,
            message: message.into(),
            ..Self::success()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StatementStatus::Success
    }
}

impl From<&DbError> for StatementResult {
    fn from(err: &DbError) -> Self {
        Self::error(err.to_string())
    }
}

/// Ordered results of one request.
pub type BatchResult = Vec<StatementResult>;

/// Encode a batch result as the response body.
pub fn encode_batch_result(results: &[StatementResult]) -> DbResult<String> {
    serde_json::to_string(results).map_err(|e| DbError::serialization(e.to_string()))
}

/// Response body for a request that failed before producing results.
pub fn error_body(message: &str) -> String {
    encode_batch_result(&[StatementResult::error(message)]).unwrap_or_else(|_| {
        r#"[{"status":"error","message":"Serialization error","cols":[],"types":[],"rows":[]}]"#
            .to_string()
    })
}
