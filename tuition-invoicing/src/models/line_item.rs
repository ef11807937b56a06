//! Line item model for tuition-invoicing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Identity of a line item inside an edit session.
///
/// Rows loaded from storage carry their database id; rows added during the
/// session get a local id until the commit assigns an authoritative one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum LineItemId {
    Pending(Uuid),
    Persisted(i64),
}

impl LineItemId {
    pub fn new_pending() -> Self {
        LineItemId::Pending(Uuid::new_v4())
    }

    pub fn persisted(&self) -> Option<i64> {
        match self {
            LineItemId::Persisted(id) => Some(*id),
            LineItemId::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, LineItemId::Pending(_))
    }
}

impl fmt::Display for LineItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineItemId::Pending(local) => write!(f, "pending:{}", local),
            LineItemId::Persisted(id) => write!(f, "{}", id),
        }
    }
}

/// Lesson length billed by a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LessonDuration {
    #[serde(rename = "30 min")]
    HalfHour,
    #[serde(rename = "45 min")]
    ThreeQuarterHour,
    #[serde(rename = "1 hour")]
    OneHour,
    #[serde(rename = "1.5 hours")]
    HourAndHalf,
    #[serde(rename = "2 hours")]
    TwoHours,
}

impl LessonDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            LessonDuration::HalfHour => "30 min",
            LessonDuration::ThreeQuarterHour => "45 min",
            LessonDuration::OneHour => "1 hour",
            LessonDuration::HourAndHalf => "1.5 hours",
            LessonDuration::TwoHours => "2 hours",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "30 min" => Some(LessonDuration::HalfHour),
            "45 min" => Some(LessonDuration::ThreeQuarterHour),
            "1 hour" => Some(LessonDuration::OneHour),
            "1.5 hours" => Some(LessonDuration::HourAndHalf),
            "2 hours" => Some(LessonDuration::TwoHours),
            _ => None,
        }
    }
}

/// One billable row of an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: LineItemId,
    pub description: String,
    /// Billing period label, e.g. "March 2024".
    pub period: String,
    /// Lessons (or hours) billed; may be fractional.
    pub lesson_count: Decimal,
    pub duration: Option<LessonDuration>,
    pub rate: Decimal,
    pub contract_id: Option<i64>,
    pub student_subject_id: Option<i64>,
}

impl LineItem {
    pub fn from_input(id: LineItemId, input: LineItemInput) -> Self {
        Self {
            id,
            description: input.description,
            period: input.period,
            lesson_count: input.lesson_count,
            duration: input.duration,
            rate: input.rate,
            contract_id: input.contract_id,
            student_subject_id: input.student_subject_id,
        }
    }

    /// Fields needed to create this row in storage.
    pub fn to_input(&self) -> LineItemInput {
        LineItemInput {
            description: self.description.clone(),
            period: self.period.clone(),
            lesson_count: self.lesson_count,
            duration: self.duration,
            rate: self.rate,
            contract_id: self.contract_id,
            student_subject_id: self.student_subject_id,
        }
    }
}

/// Persisted line item row.
#[derive(Debug, Clone, FromRow)]
pub struct LineItemRecord {
    pub line_item_id: i64,
    pub invoice_id: i64,
    pub description: String,
    pub period: String,
    pub lesson_count: Decimal,
    pub duration: Option<String>,
    pub rate: Decimal,
    pub contract_id: Option<i64>,
    pub student_subject_id: Option<i64>,
    pub created_utc: DateTime<Utc>,
}

impl From<LineItemRecord> for LineItem {
    fn from(record: LineItemRecord) -> Self {
        let duration = record.duration.as_deref().and_then(|label| {
            let parsed = LessonDuration::from_label(label);
            if parsed.is_none() {
                tracing::warn!(
                    line_item_id = record.line_item_id,
                    duration = %label,
                    "Unrecognised duration label, treating as unset"
                );
            }
            parsed
        });

        Self {
            id: LineItemId::Persisted(record.line_item_id),
            description: record.description,
            period: record.period,
            lesson_count: record.lesson_count,
            duration,
            rate: record.rate,
            contract_id: record.contract_id,
            student_subject_id: record.student_subject_id,
        }
    }
}

/// Input for creating a line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct LineItemInput {
    #[validate(custom(function = "not_blank"))]
    pub description: String,
    #[serde(default)]
    pub period: String,
    #[validate(custom(function = "non_negative"))]
    pub lesson_count: Decimal,
    #[serde(default)]
    pub duration: Option<LessonDuration>,
    #[validate(custom(function = "non_negative"))]
    pub rate: Decimal,
    #[serde(default)]
    pub contract_id: Option<i64>,
    #[serde(default)]
    pub student_subject_id: Option<i64>,
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("blank");
        err.message = Some("must not be empty".into());
        return Err(err);
    }
    Ok(())
}

fn non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        let mut err = ValidationError::new("negative");
        err.message = Some("must not be negative".into());
        return Err(err);
    }
    Ok(())
}

/// A tracked column of a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemField {
    Description,
    Period,
    LessonCount,
    Duration,
    Rate,
    ContractId,
    StudentSubjectId,
}

impl LineItemField {
    /// Every tracked field, in diff order.
    pub const ALL: [LineItemField; 7] = [
        LineItemField::Description,
        LineItemField::Period,
        LineItemField::LessonCount,
        LineItemField::Duration,
        LineItemField::Rate,
        LineItemField::ContractId,
        LineItemField::StudentSubjectId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LineItemField::Description => "description",
            LineItemField::Period => "period",
            LineItemField::LessonCount => "lesson_count",
            LineItemField::Duration => "duration",
            LineItemField::Rate => "rate",
            LineItemField::ContractId => "contract_id",
            LineItemField::StudentSubjectId => "student_subject_id",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.as_str() == name)
    }
}

/// New value for a single field of a line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FieldChange {
    Description(String),
    Period(String),
    LessonCount(Decimal),
    Duration(Option<LessonDuration>),
    Rate(Decimal),
    ContractId(Option<i64>),
    StudentSubjectId(Option<i64>),
}

impl FieldChange {
    pub fn field(&self) -> LineItemField {
        match self {
            FieldChange::Description(_) => LineItemField::Description,
            FieldChange::Period(_) => LineItemField::Period,
            FieldChange::LessonCount(_) => LineItemField::LessonCount,
            FieldChange::Duration(_) => LineItemField::Duration,
            FieldChange::Rate(_) => LineItemField::Rate,
            FieldChange::ContractId(_) => LineItemField::ContractId,
            FieldChange::StudentSubjectId(_) => LineItemField::StudentSubjectId,
        }
    }

    /// Current value of `field` on `item`.
    pub fn read(item: &LineItem, field: LineItemField) -> Self {
        match field {
            LineItemField::Description => FieldChange::Description(item.description.clone()),
            LineItemField::Period => FieldChange::Period(item.period.clone()),
            LineItemField::LessonCount => FieldChange::LessonCount(item.lesson_count),
            LineItemField::Duration => FieldChange::Duration(item.duration),
            LineItemField::Rate => FieldChange::Rate(item.rate),
            LineItemField::ContractId => FieldChange::ContractId(item.contract_id),
            LineItemField::StudentSubjectId => {
                FieldChange::StudentSubjectId(item.student_subject_id)
            }
        }
    }

    /// Coerce a raw form value into a change for `field`.
    ///
    /// Returns `None` when the value cannot be coerced to the field's type.
    /// Empty strings clear optional fields.
    pub fn parse(field: LineItemField, raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let optional_id = |s: &str| -> Option<Option<i64>> {
            if s.is_empty() {
                Some(None)
            } else {
                s.parse::<i64>().ok().map(Some)
            }
        };

        match field {
            LineItemField::Description => Some(FieldChange::Description(raw.to_string())),
            LineItemField::Period => Some(FieldChange::Period(raw.to_string())),
            LineItemField::LessonCount => Decimal::from_str(trimmed)
                .ok()
                .map(FieldChange::LessonCount),
            LineItemField::Duration => {
                if trimmed.is_empty() {
                    Some(FieldChange::Duration(None))
                } else {
                    LessonDuration::from_label(trimmed).map(|d| FieldChange::Duration(Some(d)))
                }
            }
            LineItemField::Rate => Decimal::from_str(trimmed).ok().map(FieldChange::Rate),
            LineItemField::ContractId => optional_id(trimmed).map(FieldChange::ContractId),
            LineItemField::StudentSubjectId => {
                optional_id(trimmed).map(FieldChange::StudentSubjectId)
            }
        }
    }

    pub fn apply(&self, item: &mut LineItem) {
        match self {
            FieldChange::Description(v) => item.description = v.clone(),
            FieldChange::Period(v) => item.period = v.clone(),
            FieldChange::LessonCount(v) => item.lesson_count = *v,
            FieldChange::Duration(v) => item.duration = *v,
            FieldChange::Rate(v) => item.rate = *v,
            FieldChange::ContractId(v) => item.contract_id = *v,
            FieldChange::StudentSubjectId(v) => item.student_subject_id = *v,
        }
    }

    /// Commit-time check of the value against the line item invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            FieldChange::Description(v) if v.trim().is_empty() => {
                Err("description must not be empty".to_string())
            }
            FieldChange::LessonCount(v) if v.is_sign_negative() && !v.is_zero() => {
                Err(format!("lesson_count must not be negative (got {})", v))
            }
            FieldChange::Rate(v) if v.is_sign_negative() && !v.is_zero() => {
                Err(format!("rate must not be negative (got {})", v))
            }
            _ => Ok(()),
        }
    }
}
