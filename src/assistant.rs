use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{QuillError, Result};
use crate::models::{Discrepancy, Side};
use crate::money::Cents;

// ---------------------------------------------------------------------------
// Wire contract. The Assistant is an external advisory capability; its
// output is never trusted or executed directly. Responses are persisted
// verbatim and every fix is schema-validated and dry-run before any ledger
// mutation.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscrepancyContext {
    pub account_id: i64,
    pub checkpoint_date: String,
    pub checkpoint_row: i64,
    pub expected_cents: Cents,
    pub calculated_cents: Cents,
    pub delta_cents: Cents,
    pub severity: String,
}

impl DiscrepancyContext {
    pub fn from_discrepancy(d: &Discrepancy) -> Self {
        Self {
            account_id: d.checkpoint.account_id,
            checkpoint_date: d.checkpoint.date.clone(),
            checkpoint_row: d.checkpoint.row_number,
            expected_cents: d.expected_cents,
            calculated_cents: d.calculated_cents,
            delta_cents: d.delta_cents,
            severity: d.severity.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRow {
    pub source_row_id: i64,
    pub row_number: i64,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextCheckpoint {
    pub date: String,
    pub row_number: i64,
    pub csv_balance_cents: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub entry_id: i64,
    pub date: String,
    pub side: Side,
    pub amount_cents: Cents,
    pub txn_type: String,
    pub flag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationRequest {
    pub discrepancy: DiscrepancyContext,
    pub window_days: i64,
    pub source_rows: Vec<ContextRow>,
    pub checkpoints: Vec<ContextCheckpoint>,
    pub entries_in_range: Vec<ContextEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictedImpact {
    pub balance_change_cents: Cents,
    pub transactions_created: usize,
    pub checkpoints_resolved: usize,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixLeg {
    pub side: Side,
    pub amount_cents: Cents,
}

/// The only mutation shapes a fix may request. Free-form output is never
/// interpreted; anything outside this schema fails deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixAction {
    AddTransaction {
        date: String,
        #[serde(default)]
        txn_type: String,
        description: String,
        legs: Vec<FixLeg>,
        #[serde(default)]
        source_row_ids: Vec<i64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedFix {
    pub description: String,
    pub confidence: f64,
    #[serde(default)]
    pub assumptions: Vec<String>,
    pub predicted_impact: PredictedImpact,
    pub action: FixAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationResponse {
    pub hypothesis: String,
    pub evidence_analysis: String,
    #[serde(default)]
    pub proposed_fixes: Vec<ProposedFix>,
    #[serde(default)]
    pub uncertainties: Vec<String>,
}

pub trait Assistant {
    fn investigate(
        &self,
        request: &InvestigationRequest,
    ) -> std::result::Result<InvestigationResponse, String>;
}

/// Call the assistant under a hard wall-clock ceiling and check the response
/// shape. A timeout or malformed response is a recoverable failure of this
/// one investigation, never of the session.
pub fn investigate_checked(
    assistant: &dyn Assistant,
    request: &InvestigationRequest,
    timeout: Duration,
) -> Result<InvestigationResponse> {
    let started = Instant::now();
    let response = assistant
        .investigate(request)
        .map_err(QuillError::Assistant)?;
    if started.elapsed() > timeout {
        return Err(QuillError::Assistant(format!(
            "timed out after {}ms",
            timeout.as_millis()
        )));
    }
    if response.proposed_fixes.len() > 3 {
        return Err(QuillError::Assistant(format!(
            "response proposes {} fixes; at most 3 are allowed",
            response.proposed_fixes.len()
        )));
    }
    for fix in &response.proposed_fixes {
        if !fix.confidence.is_finite() || !(0.0..=1.0).contains(&fix.confidence) {
            return Err(QuillError::Assistant(format!(
                "fix confidence {} outside [0, 1]",
                fix.confidence
            )));
        }
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// File-backed assistant: pre-produced responses keyed by checkpoint date.
// Used by the CLI; its contents are as untrusted as any remote response.
// ---------------------------------------------------------------------------

pub struct FileAssistant {
    responses: HashMap<String, InvestigationResponse>,
}

impl FileAssistant {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let responses: HashMap<String, InvestigationResponse> = serde_json::from_str(&content)
            .map_err(|e| QuillError::Assistant(format!("cannot parse response file: {e}")))?;
        Ok(Self { responses })
    }
}

impl Assistant for FileAssistant {
    fn investigate(
        &self,
        request: &InvestigationRequest,
    ) -> std::result::Result<InvestigationResponse, String> {
        self.responses
            .get(&request.discrepancy.checkpoint_date)
            .cloned()
            .ok_or_else(|| {
                format!(
                    "no response for checkpoint {}",
                    request.discrepancy.checkpoint_date
                )
            })
    }
}
