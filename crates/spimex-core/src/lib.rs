//! Core domain model for the SPIMEX loader: trading results and the catalog schema.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed date interval `[start, end]` used to select bulletins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateRangeError {
    #[error("range start {start} is after range end {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DateRangeError> {
        if start > end {
            return Err(DateRangeError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// A discovered bulletin download: absolute URL plus the trade date embedded in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulletinLink {
    pub url: String,
    pub trade_date: NaiveDate,
}

impl BulletinLink {
    pub fn file_name(&self) -> String {
        bulletin_file_name(self.trade_date)
    }
}

/// Deterministic local file name for a trade date, e.g. `oil_xls_20240115.xls`.
pub fn bulletin_file_name(trade_date: NaiveDate) -> String {
    format!("oil_xls_{}.xls", trade_date.format("%Y%m%d"))
}

/// Sub-identifiers encoded positionally inside an exchange product id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductCodeParts {
    pub oil_id: String,
    pub delivery_basis_id: String,
    pub delivery_type_id: String,
}

impl ProductCodeParts {
    /// Chars 0..4 are the oil id, 4..7 the delivery basis, the last char the delivery type.
    /// Short codes produce short or empty parts.
    pub fn from_product_id(product_id: &str) -> Self {
        let chars: Vec<char> = product_id.chars().collect();
        let slice = |start: usize, end: usize| -> String {
            let end = end.min(chars.len());
            let start = start.min(end);
            chars[start..end].iter().collect()
        };
        Self {
            oil_id: slice(0, 4),
            delivery_basis_id: slice(4, 7),
            delivery_type_id: chars.last().map(|c| c.to_string()).unwrap_or_default(),
        }
    }
}

/// Normalized row of one bulletin, ready to be written to `spimex_trading_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingRecord {
    pub exchange_product_id: String,
    pub exchange_product_name: String,
    pub oil_id: String,
    pub delivery_basis_id: String,
    pub delivery_basis_name: String,
    pub delivery_type_id: String,
    pub volume: f64,
    pub total: f64,
    pub count: i32,
    pub date: NaiveDate,
    pub created_on: NaiveDateTime,
    pub updated_on: NaiveDateTime,
}

// Catalog/order schema. Ids are database-assigned serials.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genre {
    pub genre_id: i32,
    pub name_genre: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub author_id: i32,
    pub name_author: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct City {
    pub city_id: i32,
    pub name_city: String,
    pub days_delivery: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub client_id: i32,
    pub name_client: String,
    pub city_id: i32,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub book_id: i32,
    pub title: String,
    pub author_id: i32,
    pub genre_id: i32,
    pub price: f64,
    pub amount: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buy {
    pub buy_id: i32,
    pub buy_description: Option<String>,
    pub client_id: i32,
}

/// Purchase line item: a book and a quantity attached to a buy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyBook {
    pub buy_book_id: i32,
    pub buy_id: i32,
    pub book_id: i32,
    pub amount: i32,
}

/// Workflow stage a purchase passes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: i32,
    pub name_step: String,
}

/// Progress of one buy through one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyStep {
    pub buy_step_id: i32,
    pub buy_id: i32,
    pub step_id: i32,
    pub date_step_beg: NaiveDate,
    pub date_step_end: Option<NaiveDate>,
}

impl BuyStep {
    pub fn is_finished(&self) -> bool {
        self.date_step_end.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn product_id_slices_into_three_parts() {
        let parts = ProductCodeParts::from_product_id("A123BCD4");
        assert_eq!(parts.oil_id, "A123");
        assert_eq!(parts.delivery_basis_id, "BCD");
        assert_eq!(parts.delivery_type_id, "4");
    }

    #[test]
    fn short_product_id_does_not_panic() {
        let parts = ProductCodeParts::from_product_id("A1");
        assert_eq!(parts.oil_id, "A1");
        assert_eq!(parts.delivery_basis_id, "");
        assert_eq!(parts.delivery_type_id, "1");

        let empty = ProductCodeParts::from_product_id("");
        assert_eq!(empty.oil_id, "");
        assert_eq!(empty.delivery_type_id, "");
    }

    #[test]
    fn date_range_is_closed_on_both_ends() {
        let range = DateRange::new(ymd(2024, 1, 1), ymd(2024, 1, 31)).unwrap();
        assert!(range.contains(ymd(2024, 1, 1)));
        assert!(range.contains(ymd(2024, 1, 31)));
        assert!(!range.contains(ymd(2023, 12, 31)));
        assert!(!range.contains(ymd(2024, 2, 1)));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = DateRange::new(ymd(2024, 2, 1), ymd(2024, 1, 1)).unwrap_err();
        assert!(matches!(err, DateRangeError::Inverted { .. }));
    }

    #[test]
    fn single_day_range_contains_only_that_day() {
        let range = DateRange::single(ymd(2024, 3, 5));
        assert!(range.contains(ymd(2024, 3, 5)));
        assert!(!range.contains(ymd(2024, 3, 6)));
    }

    #[test]
    fn bulletin_file_name_is_derived_from_trade_date() {
        let link = BulletinLink {
            url: "https://spimex.com/upload/reports/oil_xls/oil_xls_20240115162000.xls".into(),
            trade_date: ymd(2024, 1, 15),
        };
        assert_eq!(link.file_name(), "oil_xls_20240115.xls");
    }

    #[test]
    fn buy_step_reports_finished_when_end_date_is_set() {
        let mut step = BuyStep {
            buy_step_id: 1,
            buy_id: 1,
            step_id: 2,
            date_step_beg: ymd(2024, 3, 1),
            date_step_end: None,
        };
        assert!(!step.is_finished());
        step.date_step_end = Some(ymd(2024, 3, 4));
        assert!(step.is_finished());
    }

    #[test]
    fn trading_record_serializes_dates_as_iso_strings() {
        let ts = ymd(2024, 1, 15).and_hms_opt(10, 0, 0).unwrap();
        let record = TradingRecord {
            exchange_product_id: "A100ANK060F".into(),
            exchange_product_name: "Бензин (АИ-100-К5)".into(),
            oil_id: "A100".into(),
            delivery_basis_id: "ANK".into(),
            delivery_basis_name: "Ангарск-группа станций".into(),
            delivery_type_id: "F".into(),
            volume: 60.0,
            total: 4_200_000.0,
            count: 1,
            date: ymd(2024, 1, 15),
            created_on: ts,
            updated_on: ts,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["date"], "2024-01-15");
        assert_eq!(value["created_on"], "2024-01-15T10:00:00");
    }
}
