// 🔑 Hashing Engine - two-tier fingerprints for toll records
//
//   identity hash: date, time, entry IC, exit IC, vehicle, card
//                  → BLAKE3, first 8 bytes, 16 hex chars (duplicate detection)
//   content hash:  every business field incl. amounts and usage type
//                  → SHA-256, 64 hex chars (change detection)
//
// Amounts are deliberately outside the identity: a corrected fare must land on
// the same record instead of spawning a new one.

use crate::db::TollRecord;
use chrono::NaiveTime;
use serde::Serialize;
use sha2::{Digest, Sha256};

const IDENTITY_SEPARATOR: &str = "|";
const FULL_WIDTH_SPACE: char = '\u{3000}';

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Trim, map full-width spaces to ASCII, collapse runs of whitespace, lower-case.
pub fn normalize_text(value: &str) -> String {
    value
        .replace(FULL_WIDTH_SPACE, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonical `HH:MM:SS` for anything that parses as a time of day.
/// Unparseable input falls back to [`normalize_text`].
pub fn normalize_time(value: &str) -> String {
    let cleaned = normalize_text(value);
    for format in ["%H:%M:%S", "%H:%M", "%H%M"] {
        if let Ok(time) = NaiveTime::parse_from_str(&cleaned, format) {
            return time.format("%H:%M:%S").to_string();
        }
    }
    cleaned
}

// ============================================================================
// IDENTITY HASH
// ============================================================================

/// Fingerprint over the immutable identifying fields.
pub fn identity_hash(record: &TollRecord) -> String {
    let key = [
        record.usage_date.format("%Y-%m-%d").to_string(),
        normalize_time(&record.usage_time),
        normalize_text(&record.entry_ic),
        normalize_text(&record.exit_ic),
        normalize_text(&record.vehicle_number),
        normalize_text(&record.card_number),
    ]
    .join(IDENTITY_SEPARATOR);

    let digest = blake3::hash(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    format!("{:016x}", u64::from_be_bytes(head))
}

// ============================================================================
// CONTENT HASH
// ============================================================================

/// Canonical form of the business payload. Field order here is the wire order.
#[derive(Serialize)]
struct ContentView {
    usage_date: String,
    usage_time: String,
    entry_ic: String,
    exit_ic: String,
    vehicle_number: String,
    card_number: String,
    toll_amount: i64,
    discount_amount: i64,
    usage_type: String,
}

impl ContentView {
    fn of(record: &TollRecord) -> Self {
        ContentView {
            usage_date: record.usage_date.format("%Y-%m-%d").to_string(),
            usage_time: normalize_time(&record.usage_time),
            entry_ic: normalize_text(&record.entry_ic),
            exit_ic: normalize_text(&record.exit_ic),
            vehicle_number: normalize_text(&record.vehicle_number),
            card_number: normalize_text(&record.card_number),
            toll_amount: record.toll_amount,
            discount_amount: record.discount_amount,
            usage_type: normalize_text(&record.usage_type),
        }
    }
}

/// SHA-256 over the canonical business payload (ids, provenance and timestamps
/// excluded).
pub fn content_hash(record: &TollRecord) -> String {
    // Serializing a struct of strings and integers cannot fail.
    let canonical = serde_json::to_string(&ContentView::of(record)).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// FIELD DIFF
// ============================================================================

/// Business fields that differ between `old` and `new`, in canonical order.
pub fn compare_fields(old: &TollRecord, new: &TollRecord) -> Vec<&'static str> {
    let a = ContentView::of(old);
    let b = ContentView::of(new);
    let mut changed = Vec::new();

    if a.usage_date != b.usage_date {
        changed.push("usage_date");
    }
    if a.usage_time != b.usage_time {
        changed.push("usage_time");
    }
    if a.entry_ic != b.entry_ic {
        changed.push("entry_ic");
    }
    if a.exit_ic != b.exit_ic {
        changed.push("exit_ic");
    }
    if a.vehicle_number != b.vehicle_number {
        changed.push("vehicle_number");
    }
    if a.card_number != b.card_number {
        changed.push("card_number");
    }
    if a.toll_amount != b.toll_amount {
        changed.push("toll_amount");
    }
    if a.discount_amount != b.discount_amount {
        changed.push("discount_amount");
    }
    if a.usage_type != b.usage_type {
        changed.push("usage_type");
    }

    changed
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn create_test_record(amount: i64) -> TollRecord {
        TollRecord::new(
            NaiveDate::from_ymd_opt(2024, 3, 14).unwrap(),
            "08:15",
            "Tokyo IC",
            "Atsugi IC",
            "品川 300 あ 12-34",
        )
        .with_card("1234-5678-9012-3456")
        .with_amounts(amount, 0)
        .with_usage_type("ETC")
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Tokyo\u{3000}\u{3000}IC  "), "tokyo ic");
        assert_eq!(normalize_text("A\t B\nC"), "a b c");
    }

    #[test]
    fn test_normalize_time() {
        assert_eq!(normalize_time("8:05"), "08:05:00");
        assert_eq!(normalize_time("08:05:30"), "08:05:30");
        assert_eq!(normalize_time("0805"), "08:05:00");
        assert_eq!(normalize_time(" Late "), "late");
    }

    #[test]
    fn test_identity_hash_ignores_amount() {
        let a = create_test_record(1_320);
        let b = create_test_record(990);

        assert_eq!(identity_hash(&a), identity_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_identity_hash_format() {
        let hash = identity_hash(&create_test_record(1_320));
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_identity_hash_normalizes_whitespace_and_case() {
        let a = create_test_record(1_320);
        let mut b = a.clone();
        b.entry_ic = "  TOKYO\u{3000}IC ".to_string();
        b.usage_time = "8:15:00".to_string();

        assert_eq!(identity_hash(&a), identity_hash(&b));
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_identity_hash_changes_with_identity_fields() {
        let base = create_test_record(1_320);

        let mut other_vehicle = base.clone();
        other_vehicle.vehicle_number = "品川 300 あ 99-99".to_string();
        let mut other_card = base.clone();
        other_card.card_number = "9999".to_string();
        let mut other_exit = base.clone();
        other_exit.exit_ic = "Ebina IC".to_string();

        let h = identity_hash(&base);
        assert_ne!(h, identity_hash(&other_vehicle));
        assert_ne!(h, identity_hash(&other_card));
        assert_ne!(h, identity_hash(&other_exit));
    }

    #[test]
    fn test_content_hash_covers_every_business_field() {
        let base = create_test_record(1_320);
        let base_hash = content_hash(&base);

        let mutations: Vec<Box<dyn Fn(&mut TollRecord)>> = vec![
            Box::new(|r: &mut TollRecord| r.usage_date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()),
            Box::new(|r: &mut TollRecord| r.usage_time = "08:16".to_string()),
            Box::new(|r: &mut TollRecord| r.entry_ic = "Yokohama IC".to_string()),
            Box::new(|r: &mut TollRecord| r.exit_ic = "Ebina IC".to_string()),
            Box::new(|r: &mut TollRecord| r.vehicle_number = "other".to_string()),
            Box::new(|r: &mut TollRecord| r.card_number = "other".to_string()),
            Box::new(|r: &mut TollRecord| r.toll_amount += 10),
            Box::new(|r: &mut TollRecord| r.discount_amount = 100),
            Box::new(|r: &mut TollRecord| r.usage_type = "Cash".to_string()),
        ];

        for mutate in mutations {
            let mut changed = base.clone();
            mutate(&mut changed);
            assert_ne!(base_hash, content_hash(&changed));
        }
    }

    #[test]
    fn test_content_hash_ignores_ids_and_provenance() {
        let a = create_test_record(1_320);
        let mut b = a.clone();
        b.id = "rec-42".to_string();
        b.source_file = "april.csv".to_string();
        b.line_number = 99;
        b.version = 3;

        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn test_compare_fields_ordered() {
        let old = create_test_record(1_320);
        let mut new = old.clone();
        new.usage_type = "Cash".to_string();
        new.toll_amount = 990;

        assert_eq!(compare_fields(&old, &new), vec!["toll_amount", "usage_type"]);
        assert!(compare_fields(&old, &old).is_empty());
    }
}
