//! Canonical operation types.
//!
//! An [`OperationRecord`] is built once per inbound message by the
//! transformer and read by the duplicate detector and the orchestrator.
//! Field names on the wire keep the legacy application's vocabulary
//! (`partida`, `importe`, `cuenta`, ...), which is what the automation bridge
//! and the history store expect.

mod result;

pub use result::{format_duration, OperationResult, OperationStatus};

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Operation nature ("naturaleza").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Nature {
    /// "4"
    #[default]
    Expense,
    /// "5"
    Income,
    /// Anything else; carried through and logged, never entered.
    Other(String),
}

impl Nature {
    pub fn as_str(&self) -> &str {
        match self {
            Nature::Expense => "4",
            Nature::Income => "5",
            Nature::Other(raw) => raw,
        }
    }
}

impl From<String> for Nature {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "4" => Nature::Expense,
            "5" => Nature::Income,
            _ => Nature::Other(raw),
        }
    }
}

impl From<Nature> for String {
    fn from(nature: Nature) -> Self {
        nature.as_str().to_string()
    }
}

impl fmt::Display for Nature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link from a line item to a prior committed budget entry ("contraido").
///
/// Either a flag (`true` asks the legacy application for a new reference) or
/// the numeric identifier of an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkedReference {
    Flag(bool),
    Reference(i64),
}

impl LinkedReference {
    /// Truthiness: `false` and `0` mean "no linked reference".
    pub fn is_set(&self) -> bool {
        match self {
            LinkedReference::Flag(flag) => *flag,
            LinkedReference::Reference(id) => *id != 0,
        }
    }
}

impl Default for LinkedReference {
    fn default() -> Self {
        LinkedReference::Flag(false)
    }
}

/// Error returned when an amount string is not a non-negative decimal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid amount '{0}'")]
pub struct InvalidAmount(pub String);

/// Error computing the total of an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TotalError {
    #[error(transparent)]
    Invalid(#[from] InvalidAmount),

    #[error("line item amounts exceed the largest representable total")]
    Overflow,
}

/// Parse an amount written with a comma decimal separator.
pub fn parse_amount(raw: &str) -> Result<Decimal, InvalidAmount> {
    let normalized = raw.trim().replace(',', ".");
    match Decimal::from_str(&normalized) {
        Ok(value) if !value.is_sign_negative() || value.is_zero() => Ok(value),
        _ => Err(InvalidAmount(raw.to_string())),
    }
}

/// Render a decimal with a comma decimal separator.
pub fn format_amount(value: Decimal) -> String {
    value.to_string().replace('.', ",")
}

/// One budget line of an operation ("aplicacion").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(rename = "partida")]
    pub code: String,
    /// Comma-decimal amount, exactly as it will be typed.
    #[serde(rename = "importe")]
    pub amount: String,
    #[serde(rename = "contraido")]
    pub linked_reference: LinkedReference,
    #[serde(rename = "proyecto")]
    pub project: String,
    #[serde(rename = "year")]
    pub fiscal_year: String,
    #[serde(rename = "base_imponible")]
    pub tax_base: f64,
    #[serde(rename = "tipo")]
    pub tax_rate: f64,
    #[serde(rename = "cuenta_pgp")]
    pub ledger_subcode: String,
    #[serde(rename = "cuenta")]
    pub ledger_code: String,
}

impl LineItem {
    pub fn amount_value(&self) -> Result<Decimal, InvalidAmount> {
        parse_amount(&self.amount)
    }

    /// Only strictly positive lines are typed into the legacy form and
    /// counted in totals.
    pub fn is_positive(&self) -> Result<bool, InvalidAmount> {
        Ok(self.amount_value()? > Decimal::ZERO)
    }
}

/// Canonical operation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    #[serde(rename = "fecha")]
    pub date: String,
    #[serde(rename = "caja")]
    pub cash_register_id: String,
    #[serde(rename = "expediente")]
    pub file_reference: String,
    #[serde(rename = "tercero")]
    pub third_party_id: String,
    #[serde(rename = "naturaleza")]
    pub nature: Nature,
    #[serde(rename = "resumen")]
    pub description: Option<String>,
    pub finalize_intent: bool,
    #[serde(rename = "aplicaciones")]
    pub line_items: Vec<LineItem>,
    #[serde(rename = "descuentos")]
    pub discounts: Vec<Value>,
    #[serde(rename = "aux_data")]
    pub auxiliary_data: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

impl OperationRecord {
    /// Sum of every strictly positive line-item amount.
    pub fn expected_total(&self) -> Result<Decimal, TotalError> {
        self.line_items.iter().try_fold(Decimal::ZERO, |acc, item| {
            let amount = item.amount_value()?;
            if amount > Decimal::ZERO {
                acc.checked_add(amount).ok_or(TotalError::Overflow)
            } else {
                Ok(acc)
            }
        })
    }

    /// Number of lines that will actually be entered.
    pub fn positive_line_count(&self) -> usize {
        self.line_items
            .iter()
            .filter(|item| item.is_positive().unwrap_or(false))
            .count()
    }
}
