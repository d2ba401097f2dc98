// 🏗️ Parser Framework - ETC statement CSV → TollRecord
//
// A parser never fails on a single bad row: the row is reported in
// `ParseOutcome::errors` and parsing continues. Only an unusable file (no
// header, missing required columns) is an error.

use crate::db::TollRecord;
use crate::error::{EngineError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ============================================================================
// CORE TYPES
// ============================================================================

/// A row the parser could not turn into a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    pub line_number: usize,
    pub message: String,
    /// Original line for debugging
    pub raw_line: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub records: Vec<TollRecord>,
    pub errors: Vec<RowError>,
}

impl ParseOutcome {
    /// Rows seen, parsed or not.
    pub fn total_rows(&self) -> usize {
        self.records.len() + self.errors.len()
    }
}

/// TollParser - turns raw statement bytes into candidate records.
pub trait TollParser: Send + Sync {
    fn parse(&self, bytes: &[u8], source_file: &str) -> Result<ParseOutcome>;

    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "1.0"
    }
}

// ============================================================================
// COLUMN LAYOUT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Date,
    Time,
    EntryIc,
    ExitIc,
    Vehicle,
    Card,
    TollAmount,
    Discount,
    UsageType,
}

impl Column {
    const REQUIRED: [Column; 6] = [
        Column::Date,
        Column::Time,
        Column::EntryIc,
        Column::ExitIc,
        Column::Vehicle,
        Column::TollAmount,
    ];

    fn name(&self) -> &'static str {
        match self {
            Column::Date => "usage_date",
            Column::Time => "usage_time",
            Column::EntryIc => "entry_ic",
            Column::ExitIc => "exit_ic",
            Column::Vehicle => "vehicle_number",
            Column::Card => "card_number",
            Column::TollAmount => "toll_amount",
            Column::Discount => "discount_amount",
            Column::UsageType => "usage_type",
        }
    }

    /// Header spellings found on ETC meisai exports and our own CSV format.
    fn from_header(header: &str) -> Option<Column> {
        let header = header.trim().trim_start_matches('\u{feff}').to_lowercase();
        match header.as_str() {
            "usage_date" | "date" | "利用年月日" | "利用日" => Some(Column::Date),
            "usage_time" | "time" | "利用時刻" | "時刻" => Some(Column::Time),
            "entry_ic" | "entry" | "入口ic" | "入口" => Some(Column::EntryIc),
            "exit_ic" | "exit" | "出口ic" | "出口" => Some(Column::ExitIc),
            "vehicle_number" | "vehicle" | "車両番号" => Some(Column::Vehicle),
            "card_number" | "card" | "カード番号" | "etcカード番号" => Some(Column::Card),
            "toll_amount" | "amount" | "通行料金" | "料金" => Some(Column::TollAmount),
            "discount_amount" | "discount" | "割引額" | "割引" => Some(Column::Discount),
            "usage_type" | "type" | "利用区分" | "区分" => Some(Column::UsageType),
            _ => None,
        }
    }
}

struct Layout {
    columns: Vec<(Column, usize)>,
}

impl Layout {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self> {
        let mut columns: Vec<(Column, usize)> = Vec::new();
        for (idx, header) in headers.iter().enumerate() {
            if let Some(column) = Column::from_header(header) {
                if !columns.iter().any(|(c, _)| *c == column) {
                    columns.push((column, idx));
                }
            }
        }

        let missing: Vec<&str> = Column::REQUIRED
            .iter()
            .filter(|required| !columns.iter().any(|(c, _)| c == *required))
            .map(|c| c.name())
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::validation(
                "header",
                format!("missing required columns: {}", missing.join(", ")),
            ));
        }

        Ok(Layout { columns })
    }

    fn get<'r>(&self, row: &'r csv::StringRecord, column: Column) -> &'r str {
        self.columns
            .iter()
            .find(|(c, _)| *c == column)
            .and_then(|(_, idx)| row.get(*idx))
            .unwrap_or("")
    }
}

// ============================================================================
// FIELD PARSING
// ============================================================================

// Two-digit years first: `%Y` would happily read "24/03/14" as year 24.
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%y/%m/%d", "%Y/%m/%d"];

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
}

/// "1,320", "¥1,320", "1320円" → 1320. Empty → 0.
pub fn parse_amount(value: &str) -> Option<i64> {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|c| !matches!(*c, ',' | '円' | '¥' | '￥' | ' '))
        .collect();
    if cleaned.is_empty() {
        return Some(0);
    }
    cleaned.parse::<i64>().ok()
}

// ============================================================================
// ETC CSV PARSER
// ============================================================================

pub struct EtcCsvParser;

impl EtcCsvParser {
    pub fn new() -> Self {
        EtcCsvParser
    }

    fn parse_row(
        &self,
        layout: &Layout,
        row: &csv::StringRecord,
        source_file: &str,
        line_number: usize,
    ) -> std::result::Result<TollRecord, String> {
        let date_raw = layout.get(row, Column::Date);
        let usage_date =
            parse_date(date_raw).ok_or_else(|| format!("invalid usage_date {:?}", date_raw))?;

        let amount_raw = layout.get(row, Column::TollAmount);
        let toll_amount =
            parse_amount(amount_raw).ok_or_else(|| format!("invalid toll_amount {:?}", amount_raw))?;

        let discount_raw = layout.get(row, Column::Discount);
        let discount_amount = parse_amount(discount_raw)
            .ok_or_else(|| format!("invalid discount_amount {:?}", discount_raw))?;

        Ok(TollRecord::new(
            usage_date,
            layout.get(row, Column::Time).trim(),
            layout.get(row, Column::EntryIc).trim(),
            layout.get(row, Column::ExitIc).trim(),
            layout.get(row, Column::Vehicle).trim(),
        )
        .with_card(layout.get(row, Column::Card).trim())
        .with_amounts(toll_amount, discount_amount)
        .with_usage_type(layout.get(row, Column::UsageType).trim())
        .with_provenance("", source_file, line_number))
    }
}

impl Default for EtcCsvParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TollParser for EtcCsvParser {
    fn parse(&self, bytes: &[u8], source_file: &str) -> Result<ParseOutcome> {
        let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let headers = rdr
            .headers()
            .map_err(|e| EngineError::validation("header", e.to_string()))?
            .clone();
        let layout = Layout::from_headers(&headers)?;

        let mut outcome = ParseOutcome::default();
        for (idx, result) in rdr.records().enumerate() {
            // header is line 1
            let fallback_line = idx + 2;
            match result {
                Ok(row) => {
                    if row.iter().all(|field| field.is_empty()) {
                        continue;
                    }
                    let line_number = row
                        .position()
                        .map(|p| p.line() as usize)
                        .unwrap_or(fallback_line);
                    match self.parse_row(&layout, &row, source_file, line_number) {
                        Ok(record) => outcome.records.push(record),
                        Err(message) => outcome.errors.push(RowError {
                            line_number,
                            message,
                            raw_line: row.iter().collect::<Vec<_>>().join(","),
                        }),
                    }
                }
                Err(e) => outcome.errors.push(RowError {
                    line_number: e
                        .position()
                        .map(|p| p.line() as usize)
                        .unwrap_or(fallback_line),
                    message: format!("unreadable row: {}", e),
                    raw_line: String::new(),
                }),
            }
        }

        Ok(outcome)
    }

    fn name(&self) -> &str {
        "etc_csv"
    }
}

// ============================================================================
// TESTS
// ============================================================================
