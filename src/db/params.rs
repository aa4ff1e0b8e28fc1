//! Parameter inference and binding.
//!
//! Statement parameters arrive as strings. Before binding, each token is
//! classified: a token made only of ASCII digits binds as an integer, a
//! `digits.digits` token binds as a float, and anything else (including
//! negative numbers and integers too large for `i64`) binds as text.

use sqlx::Any;
use sqlx::any::AnyArguments;
use sqlx::query::Query;

/// A typed statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Classify a raw parameter token.
    pub fn infer(token: &str) -> Self {
        if is_digits(token) {
            if let Ok(v) = token.parse::<i64>() {
                return Self::Int(v);
            }
            return Self::Text(token.to_string());
        }

        if let Some((whole, frac)) = token.split_once('.') {
            if is_digits(whole) && is_digits(frac) {
                if let Ok(v) = token.parse::<f64>() {
                    return Self::Float(v);
                }
            }
        }

        Self::Text(token.to_string())
    }

    /// Classify every token of a statement.
    pub fn infer_all(tokens: &[String]) -> Vec<Self> {
        tokens.iter().map(|t| Self::infer(t)).collect()
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Bind one parameter to a query.
pub(crate) fn bind_param<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    param: &'q ParamValue,
) -> Query<'q, Any, AnyArguments<'q>> {
    match param {
        ParamValue::Int(v) => query.bind(*v),
        ParamValue::Float(v) => query.bind(*v),
        ParamValue::Text(v) => query.bind(v.as_str()),
    }
}

/// Bind parameters positionally, first token to the first placeholder.
pub(crate) fn bind_params<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    params: &'q [ParamValue],
) -> Query<'q, Any, AnyArguments<'q>> {
    params.iter().fold(query, bind_param)
}
