//! Inbound payload to [`OperationRecord`].
//!
//! Structural problems (missing header fields, wrong container types) are
//! reported as parse-level errors and cause the message to be requeued.
//! Amounts that are not non-negative decimals are validation errors: the
//! operation is rejected with a `FAILED` result instead.

use serde_json::{Map, Value};
use tracing::debug;

use crate::mapping;
use crate::model::{
    parse_amount, InvalidAmount, LineItem, LinkedReference, Nature, OperationRecord, TotalError,
};

/// Suffix on the description that asks for validation and printing.
pub const FINALIZE_MARKER: &str = "/F";

/// File reference used when the payload carries none.
pub const DEFAULT_FILE_REFERENCE: &str = "rbt-apunte-arqueo";

pub type Result<T> = std::result::Result<T, TransformError>;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Operation payload is not a JSON object")]
    NotAnObject,

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Validation error: line item {index}: {source}")]
    InvalidAmount {
        index: usize,
        #[source]
        source: InvalidAmount,
    },

    #[error("Validation error: {0}")]
    TotalOutOfRange(TotalError),
}

impl TransformError {
    /// Business-level rejection (as opposed to a malformed message).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TransformError::InvalidAmount { .. } | TransformError::TotalOutOfRange(_)
        )
    }
}

/// Build the canonical record from a raw operation payload.
pub fn transform(raw: &Value) -> Result<OperationRecord> {
    let obj = raw.as_object().ok_or(TransformError::NotAnObject)?;

    let date = required_text(obj, "fecha")?;
    let cash_register_id = required_text(obj, "caja")?;
    let third_party_id = required_text(obj, "tercero")?;

    let (description, finalize_intent) = match extract_description(obj) {
        Some(text) => {
            let (text, finalize) = split_finalize_marker(&text);
            (Some(text), finalize)
        }
        None => (None, false),
    };

    let line_items = match obj.get("aplicaciones") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(index, item)| transform_line_item(index, item))
            .collect::<Result<Vec<_>>>()?,
        Some(_) => {
            return Err(TransformError::InvalidField {
                field: "aplicaciones",
                reason: "expected a list".to_string(),
            })
        }
    };

    let record = OperationRecord {
        date,
        cash_register_id,
        file_reference: optional_text(obj, "expediente")
            .unwrap_or_else(|| DEFAULT_FILE_REFERENCE.to_string()),
        third_party_id,
        nature: optional_text(obj, "naturaleza")
            .map(Nature::from)
            .unwrap_or_default(),
        description,
        finalize_intent,
        line_items,
        discounts: match obj.get("descuentos") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        },
        auxiliary_data: object_or_empty(obj.get("aux_data")),
        metadata: object_or_empty(obj.get("metadata")),
    };

    // Amounts are individually valid here; only the sum can still fail.
    record
        .expected_total()
        .map_err(TransformError::TotalOutOfRange)?;

    debug!(
        date = %record.date,
        cash_register = %record.cash_register_id,
        line_items = record.line_items.len(),
        finalize = record.finalize_intent,
        "Transformed operation record"
    );

    Ok(record)
}

/// Strip the finalize marker, returning the remaining text and whether the
/// marker was present.
pub fn split_finalize_marker(text: &str) -> (String, bool) {
    match text.strip_suffix(FINALIZE_MARKER) {
        Some(rest) => (rest.trim_end().to_string(), true),
        None => (text.to_string(), false),
    }
}

/// Coerce the polymorphic "contraido" value.
///
/// Booleans and integers are kept, floats are truncated to integers, and
/// anything else collapses to its truthiness.
pub fn coerce_linked_reference(value: &Value) -> LinkedReference {
    match value {
        Value::Bool(flag) => LinkedReference::Flag(*flag),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                LinkedReference::Reference(i)
            } else if let Some(u) = n.as_u64() {
                LinkedReference::Reference(i64::try_from(u).unwrap_or(i64::MAX))
            } else {
                LinkedReference::Reference(n.as_f64().map(|f| f.trunc() as i64).unwrap_or(0))
            }
        }
        other => LinkedReference::Flag(is_truthy(other)),
    }
}

/// Render an amount with a comma decimal separator, independent of locale.
///
/// Floats keep at least one fractional digit (`5000.0` renders `5000,0`).
pub fn render_amount(value: &Value) -> String {
    match value {
        Value::Number(n) if n.is_f64() => {
            let f = n.as_f64().unwrap_or_default();
            format!("{:?}", f).replace('.', ",")
        }
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.replace('.', ","),
        Value::Null => "0,0".to_string(),
        other => other.to_string(),
    }
}

fn transform_line_item(index: usize, raw: &Value) -> Result<LineItem> {
    let obj = raw.as_object().ok_or(TransformError::InvalidField {
        field: "aplicaciones",
        reason: format!("entry {} is not an object", index),
    })?;

    let code = obj.get("economica").map(stringify).unwrap_or_default();

    let amount = render_amount(obj.get("importe").unwrap_or(&Value::Null));
    parse_amount(&amount).map_err(|source| TransformError::InvalidAmount { index, source })?;

    let linked_reference = obj
        .get("contraido")
        .map(coerce_linked_reference)
        .unwrap_or_default();

    let ledger_code = mapping::map(&code).to_string();

    Ok(LineItem {
        code,
        amount,
        linked_reference,
        project: optional_text(obj, "proyecto").unwrap_or_default(),
        fiscal_year: optional_text(obj, "year").unwrap_or_default(),
        tax_base: obj.get("base_imponible").and_then(Value::as_f64).unwrap_or(0.0),
        tax_rate: obj.get("tipo").and_then(Value::as_f64).unwrap_or(0.0),
        ledger_subcode: optional_text(obj, "cuenta_pgp").unwrap_or_default(),
        ledger_code,
    })
}

fn extract_description(obj: &Map<String, Value>) -> Option<String> {
    obj.get("texto_sical")?
        .as_array()?
        .first()?
        .get("tcargo")?
        .as_str()
        .map(str::to_string)
}

fn required_text(obj: &Map<String, Value>, field: &'static str) -> Result<String> {
    optional_text(obj, field).ok_or(TransformError::MissingField(field))
}

fn optional_text(obj: &Map<String, Value>, field: &str) -> Option<String> {
    match obj.get(field)? {
        Value::Null | Value::Bool(false) => None,
        value => Some(stringify(value)),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn object_or_empty(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
