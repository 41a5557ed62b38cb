use std::time::{Duration, Instant};

use regex::Regex;

use crate::error::{QuillError, Result};
use crate::models::{ColumnRef, FieldKind, FieldSpec, MappedRow, MappedValue, RuleSpec, SourceRow, StepSpec};
use crate::money::parse_cents;

// ---------------------------------------------------------------------------
// Schema mapping
// ---------------------------------------------------------------------------

fn resolve_column(column: &ColumnRef, headers: Option<&[String]>) -> Option<usize> {
    match column {
        ColumnRef::Index(i) => Some(*i),
        ColumnRef::Name(name) => headers?.iter().position(|h| h.eq_ignore_ascii_case(name)),
    }
}

fn schema_violation(field: &str, reason: impl Into<String>) -> QuillError {
    QuillError::SchemaViolation {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn parse_typed(spec: &FieldSpec, raw: &str) -> Result<MappedValue> {
    match spec.kind {
        FieldKind::Text => Ok(MappedValue::Text(raw.trim().to_string())),
        FieldKind::Date => {
            let format = spec.format.as_deref().unwrap_or("%Y-%m-%d");
            let date = chrono::NaiveDate::parse_from_str(raw.trim(), format)
                .map_err(|_| schema_violation(&spec.name, format!("'{raw}' is not a {format} date")))?;
            Ok(MappedValue::Date(date.format("%Y-%m-%d").to_string()))
        }
        FieldKind::Cents => parse_cents(raw)
            .map(MappedValue::Cents)
            .ok_or_else(|| schema_violation(&spec.name, format!("'{raw}' is not an amount"))),
        FieldKind::Integer => {
            let cleaned = raw.trim().replace(',', "");
            cleaned
                .parse::<i64>()
                .map(MappedValue::Integer)
                .map_err(|_| schema_violation(&spec.name, format!("'{raw}' is not an integer")))
        }
    }
}

/// Apply the schema descriptor to one source row: resolve each field's
/// column, honor missing-value tokens and defaults, and parse to the
/// declared type.
pub fn map_row(
    row: &SourceRow,
    headers: Option<&[String]>,
    schema: &[FieldSpec],
) -> Result<MappedRow> {
    let mut mapped = MappedRow::new();
    for spec in schema {
        let idx = resolve_column(&spec.column, headers).ok_or_else(|| {
            schema_violation(&spec.name, "column not present in file header")
        })?;
        let raw = row.fields.get(idx).map(|s| s.trim()).unwrap_or("");
        let is_missing = raw.is_empty() || spec.missing_tokens.iter().any(|t| t == raw);
        let effective = if is_missing { spec.default.as_deref().unwrap_or("") } else { raw };

        let value = if effective.is_empty() {
            if spec.required {
                return Err(schema_violation(&spec.name, "required field is missing"));
            }
            MappedValue::Missing
        } else {
            parse_typed(spec, effective)?
        };
        mapped.insert(spec.name.clone(), value);
    }
    Ok(mapped)
}

// ---------------------------------------------------------------------------
// Transform evaluation
// ---------------------------------------------------------------------------

/// External transform evaluator contract: pure, side-effect-free row
/// rewriting. Errors are plain strings; the adapter attaches step identity.
pub trait TransformEvaluator {
    fn evaluate(&self, row: &MappedRow, step: &StepSpec) -> std::result::Result<MappedRow, String>;
}

#[derive(Debug, Clone, Copy)]
pub struct StepQuota {
    pub max: Duration,
}

impl Default for StepQuota {
    fn default() -> Self {
        Self {
            max: Duration::from_millis(1_000),
        }
    }
}

impl StepQuota {
    pub fn from_millis(ms: u64) -> Self {
        Self {
            max: Duration::from_millis(ms),
        }
    }
}

fn value_kind(v: &MappedValue) -> &'static str {
    match v {
        MappedValue::Text(_) => "text",
        MappedValue::Date(_) => "date",
        MappedValue::Cents(_) => "cents",
        MappedValue::Integer(_) => "integer",
        MappedValue::Missing => "missing",
    }
}

/// Run every transform step over one row, enforcing the per-step quota and
/// rejecting outputs that drop or retype schema-declared fields. Returns the
/// transformed row and the names of the steps applied, in order.
pub fn apply_transforms(
    evaluator: &dyn TransformEvaluator,
    row: &MappedRow,
    steps: &[StepSpec],
    quota: StepQuota,
    schema: &[FieldSpec],
) -> Result<(MappedRow, Vec<String>)> {
    let mut current = row.clone();
    let mut applied = Vec::with_capacity(steps.len());
    for step in steps {
        let started = Instant::now();
        let out = evaluator.evaluate(&current, step).map_err(|reason| QuillError::Transform {
            step: step.name.clone(),
            reason,
        })?;
        if started.elapsed() > quota.max {
            return Err(QuillError::Transform {
                step: step.name.clone(),
                reason: format!("exceeded quota of {}ms", quota.max.as_millis()),
            });
        }
        for spec in schema {
            match out.get(&spec.name) {
                None => {
                    return Err(QuillError::Transform {
                        step: step.name.clone(),
                        reason: format!("output dropped schema field '{}'", spec.name),
                    });
                }
                Some(v) if !v.is_missing() => {
                    let expected = match spec.kind {
                        FieldKind::Text => "text",
                        FieldKind::Date => "date",
                        FieldKind::Cents => "cents",
                        FieldKind::Integer => "integer",
                    };
                    if value_kind(v) != expected {
                        return Err(QuillError::Transform {
                            step: step.name.clone(),
                            reason: format!(
                                "output retyped schema field '{}' to {}",
                                spec.name,
                                value_kind(v)
                            ),
                        });
                    }
                }
                Some(_) => {}
            }
        }
        current = out;
        applied.push(step.name.clone());
    }
    Ok((current, applied))
}

// ---------------------------------------------------------------------------
// Validation evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RowVerdict {
    pub row_number: i64,
    pub passed: bool,
    pub message: String,
}

/// External validation evaluator contract: batch verdicts over mapped rows.
pub trait ValidationEvaluator {
    fn evaluate(&self, rows: &[(i64, MappedRow)], rule: &RuleSpec) -> Vec<RowVerdict>;
}

// ---------------------------------------------------------------------------
// Builtin evaluators: a minimal step/rule vocabulary so the engine is
// operable without external evaluators. The step languages themselves stay
// external; anything unknown is an evaluator error, not a crash.
// ---------------------------------------------------------------------------

pub struct BuiltinEvaluator;

fn param_str<'a>(step_params: &'a serde_json::Value, key: &str) -> std::result::Result<&'a str, String> {
    step_params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing string param '{key}'"))
}

impl TransformEvaluator for BuiltinEvaluator {
    fn evaluate(&self, row: &MappedRow, step: &StepSpec) -> std::result::Result<MappedRow, String> {
        let mut out = row.clone();
        match step.kind.as_str() {
            "negate" => {
                let field = param_str(&step.params, "field")?;
                match out.get(field) {
                    Some(MappedValue::Cents(c)) => {
                        let c = *c;
                        out.insert(field.to_string(), MappedValue::Cents(-c));
                    }
                    Some(MappedValue::Missing) | None => {}
                    Some(other) => return Err(format!("cannot negate {} field", value_kind(other))),
                }
            }
            "absolute" => {
                let field = param_str(&step.params, "field")?;
                if let Some(MappedValue::Cents(c)) = out.get(field) {
                    let c = c.abs();
                    out.insert(field.to_string(), MappedValue::Cents(c));
                }
            }
            "copy" => {
                let from = param_str(&step.params, "from")?;
                let to = param_str(&step.params, "to")?;
                let value = row.get(from).cloned().unwrap_or(MappedValue::Missing);
                out.insert(to.to_string(), value);
            }
            "set_type" => {
                let value = param_str(&step.params, "value")?;
                out.insert("type".to_string(), MappedValue::Text(value.to_string()));
            }
            "default_currency" => {
                let value = param_str(&step.params, "value")?;
                let absent = matches!(out.get("currency"), None | Some(MappedValue::Missing));
                if absent {
                    out.insert("currency".to_string(), MappedValue::Text(value.to_string()));
                }
            }
            "strip_prefix" => {
                let field = param_str(&step.params, "field")?;
                let prefix = param_str(&step.params, "prefix")?;
                if let Some(MappedValue::Text(s)) = out.get(field) {
                    let stripped = s.strip_prefix(prefix).unwrap_or(s).trim().to_string();
                    out.insert(field.to_string(), MappedValue::Text(stripped));
                }
            }
            other => return Err(format!("unknown step kind '{other}'")),
        }
        Ok(out)
    }
}

impl ValidationEvaluator for BuiltinEvaluator {
    fn evaluate(&self, rows: &[(i64, MappedRow)], rule: &RuleSpec) -> Vec<RowVerdict> {
        rows.iter()
            .map(|(row_number, row)| {
                let (passed, message) = check_rule(row, rule);
                RowVerdict {
                    row_number: *row_number,
                    passed,
                    message,
                }
            })
            .collect()
    }
}

fn check_rule(row: &MappedRow, rule: &RuleSpec) -> (bool, String) {
    match rule.kind.as_str() {
        "require" => {
            let field = match rule.params.get("field").and_then(|v| v.as_str()) {
                Some(f) => f,
                None => return (false, "rule is missing param 'field'".to_string()),
            };
            match row.get(field) {
                Some(v) if !v.is_missing() => (true, String::new()),
                _ => (false, format!("field '{field}' is missing")),
            }
        }
        "pattern" => {
            let field = match rule.params.get("field").and_then(|v| v.as_str()) {
                Some(f) => f,
                None => return (false, "rule is missing param 'field'".to_string()),
            };
            let pattern = match rule.params.get("pattern").and_then(|v| v.as_str()) {
                Some(p) => p,
                None => return (false, "rule is missing param 'pattern'".to_string()),
            };
            let re = match Regex::new(pattern) {
                Ok(re) => re,
                Err(e) => return (false, format!("invalid pattern: {e}")),
            };
            match row.get(field) {
                Some(MappedValue::Text(s)) if re.is_match(s) => (true, String::new()),
                Some(MappedValue::Text(s)) => {
                    (false, format!("'{s}' does not match /{pattern}/"))
                }
                Some(MappedValue::Missing) | None => (true, String::new()),
                Some(other) => (false, format!("pattern rule on {} field", value_kind(other))),
            }
        }
        "range" => {
            let field = match rule.params.get("field").and_then(|v| v.as_str()) {
                Some(f) => f,
                None => return (false, "rule is missing param 'field'".to_string()),
            };
            let min = rule.params.get("min_cents").and_then(|v| v.as_i64()).unwrap_or(i64::MIN);
            let max = rule.params.get("max_cents").and_then(|v| v.as_i64()).unwrap_or(i64::MAX);
            match row.get(field) {
                Some(MappedValue::Cents(c)) if *c >= min && *c <= max => (true, String::new()),
                Some(MappedValue::Cents(c)) => {
                    (false, format!("{c} cents outside [{min}, {max}]"))
                }
                Some(MappedValue::Missing) | None => (true, String::new()),
                Some(other) => (false, format!("range rule on {} field", value_kind(other))),
            }
        }
        other => (false, format!("unknown rule kind '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnRef;

    fn field(name: &str, idx: usize, kind: FieldKind) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            column: ColumnRef::Index(idx),
            kind,
            format: None,
            required: false,
            missing_tokens: vec![],
            default: None,
        }
    }

    fn source_row(fields: &[&str]) -> SourceRow {
        SourceRow {
            raw_file_id: 1,
            row_number: 2,
            fields: fields.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_map_row_types() {
        let mut date = field("date", 0, FieldKind::Date);
        date.format = Some("%m/%d/%Y".to_string());
        let schema = vec![
            date,
            field("amount", 1, FieldKind::Cents),
            field("description", 2, FieldKind::Text),
            field("quantity", 3, FieldKind::Integer),
        ];
        let row = source_row(&["01/15/2025", "$1,234.56", "  ACME CORP  ", "3"]);
        let mapped = map_row(&row, None, &schema).unwrap();
        assert_eq!(mapped["date"], MappedValue::Date("2025-01-15".to_string()));
        assert_eq!(mapped["amount"], MappedValue::Cents(123456));
        assert_eq!(mapped["description"], MappedValue::Text("ACME CORP".to_string()));
        assert_eq!(mapped["quantity"], MappedValue::Integer(3));
    }

    #[test]
    fn test_map_row_by_header_name() {
        let schema = vec![FieldSpec {
            name: "amount".to_string(),
            column: ColumnRef::Name("Amount".to_string()),
            kind: FieldKind::Cents,
            format: None,
            required: true,
            missing_tokens: vec![],
            default: None,
        }];
        let headers = vec!["Date".to_string(), "Amount".to_string()];
        let row = source_row(&["01/15/2025", "9.99"]);
        let mapped = map_row(&row, Some(&headers), &schema).unwrap();
        assert_eq!(mapped["amount"], MappedValue::Cents(999));
    }

    #[test]
    fn test_map_row_missing_tokens_and_default() {
        let mut spec = field("quantity", 0, FieldKind::Integer);
        spec.missing_tokens = vec!["N/A".to_string()];
        spec.default = Some("0".to_string());
        let mapped = map_row(&source_row(&["N/A"]), None, &[spec.clone()]).unwrap();
        assert_eq!(mapped["quantity"], MappedValue::Integer(0));

        spec.default = None;
        let mapped = map_row(&source_row(&["N/A"]), None, &[spec]).unwrap();
        assert!(mapped["quantity"].is_missing());
    }

    #[test]
    fn test_map_row_required_missing_fails() {
        let mut spec = field("date", 0, FieldKind::Date);
        spec.required = true;
        let err = map_row(&source_row(&[""]), None, &[spec]).unwrap_err();
        assert!(matches!(err, QuillError::SchemaViolation { .. }));
    }

    #[test]
    fn test_map_row_bad_amount_fails() {
        let spec = field("amount", 0, FieldKind::Cents);
        let err = map_row(&source_row(&["twelve"]), None, &[spec]).unwrap_err();
        assert!(matches!(err, QuillError::SchemaViolation { .. }));
    }

    #[test]
    fn test_builtin_negate_and_copy() {
        let schema = vec![field("amount", 0, FieldKind::Cents)];
        let row = map_row(&source_row(&["50.00"]), None, &schema).unwrap();
        let steps = vec![
            StepSpec {
                name: "flip sign".to_string(),
                kind: "negate".to_string(),
                params: serde_json::json!({"field": "amount"}),
            },
            StepSpec {
                name: "keep original".to_string(),
                kind: "copy".to_string(),
                params: serde_json::json!({"from": "amount", "to": "computed_amount"}),
            },
        ];
        let (out, applied) =
            apply_transforms(&BuiltinEvaluator, &row, &steps, StepQuota::default(), &schema).unwrap();
        assert_eq!(out["amount"], MappedValue::Cents(-5000));
        assert_eq!(out["computed_amount"], MappedValue::Cents(-5000));
        assert_eq!(applied, vec!["flip sign", "keep original"]);
    }

    #[test]
    fn test_unknown_step_kind_is_transform_error() {
        let schema = vec![field("amount", 0, FieldKind::Cents)];
        let row = map_row(&source_row(&["1.00"]), None, &schema).unwrap();
        let steps = vec![StepSpec {
            name: "mystery".to_string(),
            kind: "frobnicate".to_string(),
            params: serde_json::Value::Null,
        }];
        let err =
            apply_transforms(&BuiltinEvaluator, &row, &steps, StepQuota::default(), &schema).unwrap_err();
        assert!(matches!(err, QuillError::Transform { .. }));
    }

    struct DroppingEvaluator;

    impl TransformEvaluator for DroppingEvaluator {
        fn evaluate(&self, _row: &MappedRow, _step: &StepSpec) -> std::result::Result<MappedRow, String> {
            Ok(MappedRow::new())
        }
    }

    #[test]
    fn test_output_dropping_schema_field_rejected() {
        let schema = vec![field("amount", 0, FieldKind::Cents)];
        let row = map_row(&source_row(&["1.00"]), None, &schema).unwrap();
        let steps = vec![StepSpec {
            name: "drop everything".to_string(),
            kind: "custom".to_string(),
            params: serde_json::Value::Null,
        }];
        let err =
            apply_transforms(&DroppingEvaluator, &row, &steps, StepQuota::default(), &schema).unwrap_err();
        assert!(matches!(err, QuillError::Transform { .. }));
    }

    struct SlowEvaluator;

    impl TransformEvaluator for SlowEvaluator {
        fn evaluate(&self, row: &MappedRow, _step: &StepSpec) -> std::result::Result<MappedRow, String> {
            std::thread::sleep(Duration::from_millis(25));
            Ok(row.clone())
        }
    }

    #[test]
    fn test_quota_overrun_is_transform_error() {
        let schema = vec![field("amount", 0, FieldKind::Cents)];
        let row = map_row(&source_row(&["1.00"]), None, &schema).unwrap();
        let steps = vec![StepSpec {
            name: "slow".to_string(),
            kind: "anything".to_string(),
            params: serde_json::Value::Null,
        }];
        let err = apply_transforms(
            &SlowEvaluator,
            &row,
            &steps,
            StepQuota {
                max: Duration::from_millis(1),
            },
            &schema,
        )
        .unwrap_err();
        match err {
            QuillError::Transform { reason, .. } => assert!(reason.contains("quota")),
            other => panic!("expected transform error, got {other:?}"),
        }
    }

    #[test]
    fn test_builtin_validation_rules() {
        let schema = vec![
            field("amount", 0, FieldKind::Cents),
            field("description", 1, FieldKind::Text),
        ];
        let row = map_row(&source_row(&["(12.00)", "WIRE FEE"]), None, &schema).unwrap();
        let rows = vec![(2i64, row)];

        let require = RuleSpec {
            name: "amount present".to_string(),
            kind: "require".to_string(),
            params: serde_json::json!({"field": "amount"}),
        };
        assert!(BuiltinEvaluator.evaluate(&rows, &require)[0].passed);

        let pattern = RuleSpec {
            name: "no test rows".to_string(),
            kind: "pattern".to_string(),
            params: serde_json::json!({"field": "description", "pattern": "^[A-Z ]+$"}),
        };
        assert!(BuiltinEvaluator.evaluate(&rows, &pattern)[0].passed);

        let range = RuleSpec {
            name: "sane amounts".to_string(),
            kind: "range".to_string(),
            params: serde_json::json!({"field": "amount", "min_cents": 0}),
        };
        let verdict = &BuiltinEvaluator.evaluate(&rows, &range)[0];
        assert!(!verdict.passed);
        assert!(verdict.message.contains("outside"));
    }
}
