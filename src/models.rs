use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::money::Cents;

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub institution: Option<String>,
    pub currency: String,
}

/// One extracted row of a raw file. Created once during extraction and
/// immutable afterwards; ledger entries hold back-references to it.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub raw_file_id: i64,
    pub row_number: i64,
    pub fields: Vec<String>,
}

// ---------------------------------------------------------------------------
// Plan configuration (dialect / schema / transforms / validations)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    pub dialect: Dialect,
    pub schema: Vec<FieldSpec>,
    #[serde(default)]
    pub transforms: Vec<StepSpec>,
    #[serde(default)]
    pub validations: Vec<RuleSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dialect {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_true")]
    pub has_header: bool,
    #[serde(default)]
    pub skip_rows: usize,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

fn default_delimiter() -> char {
    ','
}

fn default_true() -> bool {
    true
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            has_header: default_true(),
            skip_rows: 0,
            encoding: default_encoding(),
        }
    }
}

/// Where a schema field reads from: a header name or a 0-based column index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Date,
    Cents,
    Integer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Canonical field name the engine sees: date, amount, action, quantity,
    /// balance, description, currency, type.
    pub name: String,
    pub column: ColumnRef,
    pub kind: FieldKind,
    /// Date input format, e.g. "%m/%d/%Y". Dates are stored as YYYY-MM-DD.
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub missing_tokens: Vec<String>,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Mapped rows
// ---------------------------------------------------------------------------

/// A typed value produced by schema mapping. Dates are ISO YYYY-MM-DD
/// strings so mapped rows serialize byte-identically across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum MappedValue {
    Text(String),
    Date(String),
    Cents(Cents),
    Integer(i64),
    Missing,
}

impl MappedValue {
    pub fn as_cents(&self) -> Option<Cents> {
        match self {
            MappedValue::Cents(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MappedValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, MappedValue::Missing)
    }
}

/// BTreeMap keeps key order stable, which keeps serialized rows and
/// therefore replay comparisons deterministic.
pub type MappedRow = BTreeMap<String, MappedValue>;

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Debit,
    Credit,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Debit => "debit",
            Side::Credit => "credit",
        }
    }

    pub fn from_str(s: &str) -> Option<Side> {
        match s {
            "debit" => Some(Side::Debit),
            "credit" => Some(Side::Credit),
            _ => None,
        }
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: i64,
    pub group_id: i64,
    pub date: String,
    pub side: Side,
    pub amount_cents: Cents,
    pub currency: String,
    pub txn_type: String,
    pub csv_amount_cents: Option<Cents>,
    pub amount_discrepancy_cents: Option<Cents>,
    pub flag: Option<String>,
    /// Lowest source row number backing this entry; orders the running
    /// balance within a date.
    pub row_number: i64,
    pub origin_run_id: Option<i64>,
    pub origin_delta_id: Option<i64>,
}

impl LedgerEntry {
    /// Signed contribution to the account balance: debits add, credits
    /// subtract.
    pub fn signed_amount(&self) -> Cents {
        match self.side {
            Side::Debit => self.amount_cents,
            Side::Credit => -self.amount_cents,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints and discrepancies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BalanceCheckpoint {
    pub id: i64,
    pub account_id: i64,
    pub date: String,
    pub row_number: i64,
    pub csv_balance_cents: Cents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Discrepancy {
    pub checkpoint: BalanceCheckpoint,
    pub expected_cents: Cents,
    pub calculated_cents: Cents,
    /// expected − calculated
    pub delta_cents: Cents,
    pub severity: Severity,
}
