//! Budget line ("economica") to ledger account ("cuenta") mapping.
//!
//! The table is fixed at compile time. Unknown codes are not an error: they
//! map to [`DEFAULT_LEDGER_CODE`].

/// Ledger code assigned to any economic code missing from the table.
pub const DEFAULT_LEDGER_CODE: &str = "000";

/// A table entry: either a plain ledger account or a ledger account paired
/// with a secondary account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMapping {
    Single(&'static str),
    Pair {
        ledger: &'static str,
        secondary: &'static str,
    },
}

impl LedgerMapping {
    /// The primary ledger account.
    pub fn ledger_code(&self) -> &'static str {
        match self {
            LedgerMapping::Single(code) => code,
            LedgerMapping::Pair { ledger, .. } => ledger,
        }
    }

    /// The secondary account, when the entry carries one.
    pub fn secondary_code(&self) -> Option<&'static str> {
        match self {
            LedgerMapping::Single(_) => None,
            LedgerMapping::Pair { secondary, .. } => Some(secondary),
        }
    }
}

const LEDGER_TABLE: &[(&str, LedgerMapping)] = &[
    ("130", LedgerMapping::Single("727")),   // IAE
    ("300", LedgerMapping::Single("740")),   // water supply
    ("302", LedgerMapping::Single("740")),   // waste collection
    ("32900", LedgerMapping::Single("740")), // cemetery fees
    ("32901", LedgerMapping::Single("740")), // municipal pool
    ("32905", LedgerMapping::Single("740")), // municipal gym
    ("325", LedgerMapping::Single("740")),   // document issuing fees
    ("332", LedgerMapping::Single("742")),
    ("389", LedgerMapping::Single("775")), // refunds
    ("399", LedgerMapping::Single("777")), // other income
    ("42000", LedgerMapping::Single("7501")),
    ("45000", LedgerMapping::Single("7501")),
    (
        "45002",
        LedgerMapping::Pair {
            ledger: "9411",
            secondary: "24000014",
        },
    ),
    ("290", LedgerMapping::Single("733")),   // ICIO
    ("549", LedgerMapping::Single("776")),   // property rents
    ("20104", LedgerMapping::Single("561")), // works deposits
    ("30012", LedgerMapping::Single("554")),
    ("30016", LedgerMapping::Single("554")),
];

/// Look up the full table entry for an economic code.
pub fn lookup(code: &str) -> Option<LedgerMapping> {
    LEDGER_TABLE
        .iter()
        .find(|(key, _)| *key == code)
        .map(|(_, mapping)| *mapping)
}

/// Map an economic code to its primary ledger code.
pub fn map(code: &str) -> &'static str {
    lookup(code)
        .map(|m| m.ledger_code())
        .unwrap_or(DEFAULT_LEDGER_CODE)
}

/// Iterate over every mapped economic code.
pub fn known_codes() -> impl Iterator<Item = &'static str> {
    LEDGER_TABLE.iter().map(|(key, _)| *key)
}
