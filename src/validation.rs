// ✅ Record Validation - row-level quality rules for toll records
//
// Critical findings reject the row. Warnings are logged on the session and only
// reject the row in strict mode.

use crate::db::TollRecord;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

// ============================================================================
// VALIDATION RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Row cannot be stored
    Warning,  // Row is questionable
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn critical(field: &str, message: &str) -> Self {
        ValidationIssue {
            severity: Severity::Critical,
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    fn warning(field: &str, message: &str) -> Self {
        ValidationIssue {
            severity: Severity::Warning,
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn has_critical(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    pub fn critical(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Critical)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    /// Can the row be stored? In strict mode any warning is disqualifying.
    pub fn is_acceptable(&self, strict: bool) -> bool {
        if self.has_critical() {
            return false;
        }
        !strict || self.warnings().next().is_none()
    }

    /// `field: message; field: message` for the rejecting issues.
    pub fn describe(&self, strict: bool) -> String {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Critical || (strict && i.severity == Severity::Warning))
            .map(|i| format!("{}: {}", i.field, i.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn summary(&self) -> String {
        format!(
            "Issues: {} ({} critical, {} warnings)",
            self.issues.len(),
            self.critical().count(),
            self.warnings().count()
        )
    }
}

// ============================================================================
// RECORD VALIDATOR
// ============================================================================

pub struct RecordValidator {
    /// Usage dates after this day are rejected
    today: NaiveDate,
    /// Fares above this are flagged (a single passage never costs this much)
    max_plausible_amount: i64,
}

impl RecordValidator {
    pub fn new(today: NaiveDate) -> Self {
        RecordValidator {
            today,
            max_plausible_amount: 50_000,
        }
    }

    pub fn validate(&self, record: &TollRecord) -> ValidationReport {
        let mut issues = Vec::new();

        // Rule 1: identity fields present
        if record.vehicle_number.trim().is_empty() {
            issues.push(ValidationIssue::critical("vehicle_number", "vehicle number is required"));
        }
        if record.entry_ic.trim().is_empty() {
            issues.push(ValidationIssue::critical("entry_ic", "entry interchange is required"));
        }
        if record.exit_ic.trim().is_empty() {
            issues.push(ValidationIssue::critical("exit_ic", "exit interchange is required"));
        }

        // Rule 2: usage time parses
        if !is_valid_time(&record.usage_time) {
            issues.push(ValidationIssue::critical(
                "usage_time",
                &format!("unrecognized time {:?}", record.usage_time),
            ));
        }

        // Rule 3: not in the future
        if record.usage_date > self.today {
            issues.push(ValidationIssue::critical(
                "usage_date",
                &format!("{} is in the future", record.usage_date),
            ));
        }

        // Rule 4: amounts
        if record.toll_amount < 0 || record.discount_amount < 0 {
            issues.push(ValidationIssue::critical("toll_amount", "amounts cannot be negative"));
        } else {
            if record.toll_amount == 0 {
                issues.push(ValidationIssue::warning("toll_amount", "zero toll amount"));
            }
            if record.discount_amount > record.toll_amount {
                issues.push(ValidationIssue::warning(
                    "discount_amount",
                    "discount exceeds toll amount",
                ));
            }
            if record.toll_amount > self.max_plausible_amount {
                issues.push(ValidationIssue::warning(
                    "toll_amount",
                    &format!("unusually high toll amount {}", record.toll_amount),
                ));
            }
        }

        // Rule 5: soft checks
        if record.card_number.trim().is_empty() {
            issues.push(ValidationIssue::warning("card_number", "card number is missing"));
        }
        if !record.entry_ic.trim().is_empty()
            && record.entry_ic.trim() == record.exit_ic.trim()
        {
            issues.push(ValidationIssue::warning("exit_ic", "entry and exit are the same interchange"));
        }

        ValidationReport { issues }
    }
}

fn is_valid_time(value: &str) -> bool {
    let value = value.trim();
    ["%H:%M:%S", "%H:%M", "%H%M"]
        .iter()
        .any(|format| NaiveTime::parse_from_str(value, format).is_ok())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 1).unwrap()
    }

    fn create_valid_record() -> TollRecord {
        TollRecord::new(
            NaiveDate::from_ymd_opt(2024, 3, 14).unwrap(),
            "08:15",
            "Tokyo IC",
            "Atsugi IC",
            "品川 300 あ 12-34",
        )
        .with_card("1234")
        .with_amounts(1_320, 0)
        .with_usage_type("ETC")
    }

    #[test]
    fn test_valid_record_passes() {
        let report = RecordValidator::new(today()).validate(&create_valid_record());

        assert!(report.issues.is_empty(), "{}", report.summary());
        assert!(report.is_acceptable(true));
    }

    #[test]
    fn test_missing_vehicle_is_critical() {
        let mut record = create_valid_record();
        record.vehicle_number = "  ".to_string();

        let report = RecordValidator::new(today()).validate(&record);

        assert!(report.has_critical());
        assert!(!report.is_acceptable(false));
        assert_eq!(report.describe(false), "vehicle_number: vehicle number is required");
    }

    #[test]
    fn test_warnings_only_reject_in_strict_mode() {
        let mut record = create_valid_record();
        record.card_number = String::new();

        let report = RecordValidator::new(today()).validate(&record);

        assert!(!report.has_critical());
        assert_eq!(report.warnings().count(), 1);
        assert!(report.is_acceptable(false));
        assert!(!report.is_acceptable(true));
    }

    #[test]
    fn test_future_date_and_bad_time() {
        let mut record = create_valid_record();
        record.usage_date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        record.usage_time = "25:99".to_string();

        let report = RecordValidator::new(today()).validate(&record);

        assert_eq!(report.critical().count(), 2);
    }

    #[test]
    fn test_negative_amount() {
        let mut record = create_valid_record();
        record.toll_amount = -10;

        let report = RecordValidator::new(today()).validate(&record);

        assert!(report.issues.iter().any(|i| i.field == "toll_amount" && i.severity == Severity::Critical));
    }
}
