//! Column type classification and cell rendering.
//!
//! Every cell of a result set is rendered as a string (or `None` for SQL
//! NULL). Rendering is a two-phase affair:
//! 1. `TypeCategory` classifies the value's runtime type, falling back to the
//!    column's declared type
//! 2. a category-specific decoder extracts the value, and a generic decoder
//!    chain covers anything the first pick could not read

use sqlx::any::AnyRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Text,
    Binary,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    // "point" is a geometry type, not an integer
    if (lower.contains("int") && lower != "point") || lower.contains("serial") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "string" {
        return TypeCategory::Text;
    }

    // Dates, decimals and driver-specific types are read through the
    // generic decoder chain.
    TypeCategory::Unknown
}

/// Column names of a result set, in order.
pub fn column_names<C: Column>(columns: &[C]) -> Vec<String> {
    columns.iter().map(|c| c.name().to_string()).collect()
}

/// Declared type names of a result set, in order.
pub fn column_types<C: Column>(columns: &[C]) -> Vec<String> {
    columns
        .iter()
        .map(|c| c.type_info().name().to_string())
        .collect()
}

// =============================================================================
// Cell Rendering
// =============================================================================

/// Render binary data: UTF-8 text when valid, base64 otherwise.
pub fn decode_binary_value(bytes: &[u8]) -> String {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => STANDARD.encode(bytes),
    }
}

/// Render every cell of a row.
pub fn row_values(row: &AnyRow) -> Vec<Option<String>> {
    (0..row.len()).map(|idx| decode_cell(row, idx)).collect()
}

/// Render one cell; SQL NULL becomes `None`.
pub fn decode_cell(row: &AnyRow, idx: usize) -> Option<String> {
    let category = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return None,
        Ok(raw) => categorize_type(raw.type_info().name()),
        Err(_) => return None,
    };

    let category = match category {
        TypeCategory::Unknown => row
            .columns()
            .get(idx)
            .map(|c| categorize_type(c.type_info().name()))
            .unwrap_or(TypeCategory::Unknown),
        known => known,
    };

    let preferred = match category {
        TypeCategory::Integer => decode_integer(row, idx),
        TypeCategory::Float => decode_float(row, idx),
        TypeCategory::Boolean => decode_boolean(row, idx),
        TypeCategory::Binary => decode_binary(row, idx),
        TypeCategory::Text | TypeCategory::Unknown => decode_text(row, idx),
    };

    preferred.or_else(|| decode_any(row, idx))
}

fn decode_integer(row: &AnyRow, idx: usize) -> Option<String> {
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
        return Some(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
        return Some(v.to_string());
    }
    row.try_get::<Option<i16>, _>(idx)
        .ok()
        .flatten()
        .map(|v| v.to_string())
}

fn decode_float(row: &AnyRow, idx: usize) -> Option<String> {
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
        return Some(v.to_string());
    }
    row.try_get::<Option<f32>, _>(idx)
        .ok()
        .flatten()
        .map(|v| v.to_string())
}

fn decode_boolean(row: &AnyRow, idx: usize) -> Option<String> {
    row.try_get::<Option<bool>, _>(idx)
        .ok()
        .flatten()
        .map(|v| v.to_string())
}

fn decode_binary(row: &AnyRow, idx: usize) -> Option<String> {
    row.try_get::<Option<Vec<u8>>, _>(idx)
        .ok()
        .flatten()
        .map(|v| decode_binary_value(&v))
}

fn decode_text(row: &AnyRow, idx: usize) -> Option<String> {
    row.try_get::<Option<String>, _>(idx).ok().flatten()
}

fn decode_any(row: &AnyRow, idx: usize) -> Option<String> {
    decode_text(row, idx)
        .or_else(|| decode_integer(row, idx))
        .or_else(|| decode_float(row, idx))
        .or_else(|| decode_boolean(row, idx))
        .or_else(|| decode_binary(row, idx))
}
