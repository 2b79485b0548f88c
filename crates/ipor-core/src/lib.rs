//! Core domain model, company-name normalization, and field comparison.

use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "ipor-core";

/// Offset of Indian Standard Time from UTC, in seconds. Offer dates from
/// every source are calendar dates in this zone.
pub const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

/// Market board an offering lists on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Mainboard,
    Sme,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Mainboard => "mainboard",
            Category::Sme => "sme",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "mainboard" => Some(Category::Mainboard),
            "sme" => Some(Category::Sme),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One company's public offering as persisted in the `ipos` table.
///
/// `id` is assigned by the primary source and is the natural key. The four
/// date fields are write-once: a non-null persisted value is never
/// overwritten by a later sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpoRecord {
    pub id: i64,
    pub name: String,
    pub category: Category,
    pub details_ipo_id: Option<i64>,
    pub url_slug: Option<String>,
    pub status: Option<String>,
    pub subscription: Option<String>,
    pub gmp: Option<String>,
    pub price_band: Option<String>,
    pub offer_start_date: Option<NaiveDate>,
    pub offer_end_date: Option<NaiveDate>,
    pub allotment_date: Option<NaiveDate>,
    pub listing_date: Option<NaiveDate>,
    pub image_url: Option<String>,
}

/// Payload published to the notification sink for every inserted or updated
/// offering. Same shape for both cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpoEvent {
    pub id: i64,
    pub name: String,
    pub subscription: Option<String>,
    pub gmp: Option<String>,
    #[serde(rename = "priceBand")]
    pub price_band: Option<String>,
    #[serde(rename = "imageUrl")]
    pub image_url: Option<String>,
}

/// A typed column value carried through a [`FieldChange`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(Option<String>),
    Date(Option<NaiveDate>),
    BigInt(Option<i64>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(Some(v)) => f.write_str(v),
            FieldValue::Date(Some(v)) => write!(f, "{v}"),
            FieldValue::BigInt(Some(v)) => write!(f, "{v}"),
            _ => f.write_str("null"),
        }
    }
}

/// One field-level difference between an incoming and a persisted record.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub column: &'static str,
    pub old: FieldValue,
    pub new: FieldValue,
}

/// Ordered set of field differences for one record. Drives both the UPDATE
/// statement (only these columns are touched) and the per-record log lines.
pub type ChangeSet = Vec<FieldChange>;

/// Corporate/market boilerplate stripped from names before matching.
const NAME_STOPWORDS: [&str; 13] = [
    "ipo", "ltd", "limited", "pvt", "private", "co", "nse", "sme", "bse", "mainboard", "reit",
    "trust", "india",
];

/// Canonicalize a free-text company name into the key used to match records
/// across sources and against persisted rows.
///
/// Idempotent: `normalize_name(normalize_name(x)) == normalize_name(x)`.
pub fn normalize_name(raw: &str) -> String {
    let mut folded = String::with_capacity(raw.len());
    let mut paren_depth = 0u32;
    for ch in raw.chars() {
        match ch {
            '(' => paren_depth += 1,
            ')' if paren_depth > 0 => paren_depth -= 1,
            _ if paren_depth > 0 => {}
            _ => {
                for decomposed in ch.nfkd() {
                    if is_combining_mark(decomposed) {
                        continue;
                    }
                    match decomposed {
                        '\'' | '\u{2019}' | '\u{2018}' | '`' => {}
                        '&' => folded.push_str(" and "),
                        c if c.is_ascii_alphanumeric() => folded.push(c.to_ascii_lowercase()),
                        _ => folded.push(' '),
                    }
                }
            }
        }
    }
    folded
        .split_whitespace()
        .filter(|word| !NAME_STOPWORDS.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format a display name the way detail-page URLs expect it:
/// lowercase, alphanumeric words joined by dashes.
pub fn slug_for_url(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Parse a source-provided date string into an IST calendar date.
///
/// Instants (RFC 3339 or naive UTC datetimes) are shifted by +05:30 before
/// the calendar date is taken; bare dates are already local to the exchange
/// and are taken as-is. Returns `None` for anything unparsable.
pub fn parse_ist_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(instant) = DateTime::parse_from_rfc3339(trimmed) {
        let ist = FixedOffset::east_opt(IST_OFFSET_SECS)?;
        return Some(instant.with_timezone(&ist).date_naive());
    }

    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some((naive + Duration::seconds(i64::from(IST_OFFSET_SECS))).date());
        }
    }

    for fmt in [
        "%Y-%m-%d",
        "%d-%m-%Y",
        "%d/%m/%Y",
        "%b %d, %Y",
        "%d %b %Y",
        "%B %d, %Y",
        "%d %B %Y",
    ] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Some(date);
        }
    }

    None
}

/// True when a value is the absent sentinel: missing, empty, or "n/a".
pub fn is_absent(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(s) => {
            let trimmed = s.trim();
            trimmed.is_empty() || trimmed.eq_ignore_ascii_case("n/a")
        }
    }
}

/// Semantic equality between two scalar field values.
///
/// Three coercion tiers, in order: absent-equivalence (`None`/empty/"n/a"
/// all compare equal to each other), numeric (both parse as finite numbers),
/// and calendar date (both parse via [`parse_ist_date`]). Anything else is
/// trimmed string equality. This keeps pure type/format drift between syncs
/// ("1200" vs "1200.0", a raw datetime vs its canonical date) from showing
/// up as a field change.
pub fn values_equal(a: Option<&str>, b: Option<&str>) -> bool {
    let a_absent = is_absent(a);
    let b_absent = is_absent(b);
    if a_absent || b_absent {
        return a_absent && b_absent;
    }

    let a = a.unwrap_or_default().trim();
    let b = b.unwrap_or_default().trim();

    if let (Ok(x), Ok(y)) = (a.parse::<f64>(), b.parse::<f64>()) {
        if x.is_finite() && y.is_finite() {
            return x == y;
        }
    }

    match (parse_ist_date(a), parse_ist_date(b)) {
        (Some(da), Some(db)) => da == db,
        (None, None) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizer_collapses_legal_suffix_variants() {
        assert_eq!(normalize_name("Alpha Ltd."), "alpha");
        assert_eq!(normalize_name("ALPHA LIMITED"), "alpha");
        assert_eq!(normalize_name("Alpha (India) Pvt. Co."), "alpha");
    }

    #[test]
    fn normalizer_is_idempotent() {
        let inputs = [
            "D'Angelo & Sons (NSE SME) Ltd",
            "Crème Brûlée Foods IPO",
            "  Multi   Space   Industries  ",
        ];
        for input in inputs {
            let once = normalize_name(input);
            assert_eq!(normalize_name(&once), once, "input: {input}");
        }
    }

    #[test]
    fn normalizer_folds_diacritics_and_ampersands() {
        assert_eq!(normalize_name("Crème & Brûlée"), "creme and brulee");
        assert_eq!(normalize_name("D'Angelo\u{2019}s"), "dangelos");
    }

    #[test]
    fn normalizer_strips_stopwords_as_whole_words_only() {
        // "Coal" contains "co", "Indian" contains "india"; neither may be cut.
        assert_eq!(normalize_name("Indian Coal Co"), "indian coal");
    }

    #[test]
    fn slug_matches_detail_page_convention() {
        assert_eq!(slug_for_url("Beta Tech"), "beta-tech");
        assert_eq!(slug_for_url("A.B. Cotspin India"), "ab-cotspin-india");
    }

    #[test]
    fn ist_date_shifts_instants_across_midnight() {
        assert_eq!(
            parse_ist_date("2025-06-30T20:00:00Z"),
            NaiveDate::from_ymd_opt(2025, 7, 1)
        );
        assert_eq!(
            parse_ist_date("2025-06-30 20:00:00"),
            NaiveDate::from_ymd_opt(2025, 7, 1)
        );
    }

    #[test]
    fn ist_date_takes_bare_dates_verbatim() {
        assert_eq!(parse_ist_date("2025-06-01"), NaiveDate::from_ymd_opt(2025, 6, 1));
        assert_eq!(parse_ist_date("Jun 01, 2025"), NaiveDate::from_ymd_opt(2025, 6, 1));
        assert_eq!(parse_ist_date("not a date"), None);
        assert_eq!(parse_ist_date(""), None);
    }

    #[test]
    fn comparator_treats_numeric_drift_as_equal() {
        assert!(values_equal(Some("1200"), Some("1200.0")));
        assert!(values_equal(Some(" 4.20"), Some("4.2")));
        assert!(!values_equal(Some("4.2"), Some("4.3")));
    }

    #[test]
    fn comparator_canonicalizes_dates_before_comparing() {
        assert!(values_equal(Some("2025-06-01"), Some("Jun 01, 2025")));
        assert!(values_equal(Some("2025-06-30T20:00:00Z"), Some("2025-07-01")));
        assert!(!values_equal(Some("2025-06-01"), Some("2025-06-02")));
    }

    #[test]
    fn comparator_absent_tier_covers_null_empty_and_sentinel() {
        assert!(values_equal(None, Some("")));
        assert!(values_equal(Some("N/A"), None));
        assert!(values_equal(Some("n/a"), Some("  ")));
        assert!(!values_equal(Some("n/a"), Some("4.2")));
        assert!(!values_equal(None, Some("OPEN")));
    }

    #[test]
    fn comparator_falls_back_to_trimmed_strings() {
        assert!(values_equal(Some(" OPEN "), Some("OPEN")));
        assert!(!values_equal(Some("OPEN"), Some("CLOSED")));
    }

    #[test]
    fn category_round_trips_through_strings() {
        assert_eq!(Category::parse("mainboard"), Some(Category::Mainboard));
        assert_eq!(Category::parse("SME"), Some(Category::Sme));
        assert_eq!(Category::parse("bond"), None);
        assert_eq!(Category::Sme.as_str(), "sme");
    }
}
