//! Trading-result bulletin spreadsheets.
//!
//! A bulletin's first worksheet has a title block, the column headers on row 6
//! (0-based), a units row, and data from row 8 until the section ends. The
//! parser validates the headers, reads the first data block, and normalizes
//! each row into a [`TradingRecord`].

use std::io::Cursor;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto_from_rs, Data, Range, Reader};
use chrono::{NaiveDate, NaiveDateTime};
use spimex_core::{ProductCodeParts, TradingRecord};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const HEADER_ROW: usize = 6;
pub const FIRST_DATA_ROW: usize = 8;
const KEY_COLUMN: usize = 1;

const HEADER_KEY_PREFIX: &str = "код";
const TOTAL_ROW_PREFIX: &str = "итого";
const TOTAL_MARKER: &str = "итог";
const NO_TRADE_SENTINEL: &str = "-";

pub const PRODUCT_ID_HEADER: &str = "Код Инструмента";
pub const PRODUCT_NAME_HEADER: &str = "Наименование Инструмента";
pub const BASIS_NAME_HEADER: &str = "Базис поставки";
pub const VOLUME_HEADER: &str = "Объем Договоров в единицах измерения";
pub const TOTAL_HEADER: &str = "Обьем Договоров, руб.";
pub const COUNT_HEADER: &str = "Количество Договоров, шт.";

pub const REQUIRED_HEADERS: [&str; 6] = [
    PRODUCT_ID_HEADER,
    PRODUCT_NAME_HEADER,
    BASIS_NAME_HEADER,
    VOLUME_HEADER,
    TOTAL_HEADER,
    COUNT_HEADER,
];

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("cannot open workbook {path}: {message}")]
    Open { path: PathBuf, message: String },
    #[error("workbook {0} has no worksheets")]
    NoWorksheet(PathBuf),
    #[error("sheet has only {rows} rows, no header row")]
    TooShort { rows: usize },
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("no data rows after the header")]
    NoDataRows,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SheetCell {
    Empty,
    Text(String),
    Number(f64),
}

static EMPTY_CELL: SheetCell = SheetCell::Empty;

impl SheetCell {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Display form. Whole numbers render without a fractional part.
    pub fn as_text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(s) => s.clone(),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Self::Number(n) => n.to_string(),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.trim().is_empty(),
            Self::Number(_) => false,
        }
    }

    /// Numeric value with the bulletin's conventions: `-`, blanks and garbage are zero.
    pub fn to_number(&self) -> f64 {
        let value = match self {
            Self::Empty => 0.0,
            Self::Number(n) => *n,
            Self::Text(s) => {
                let trimmed = s.trim();
                if trimmed == NO_TRADE_SENTINEL {
                    0.0
                } else {
                    let compact: String = trimmed
                        .chars()
                        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
                        .collect();
                    compact.parse::<f64>().unwrap_or(0.0)
                }
            }
        };
        if value.is_finite() {
            value
        } else {
            0.0
        }
    }
}

impl From<&Data> for SheetCell {
    fn from(data: &Data) -> Self {
        match data {
            Data::Empty | Data::Error(_) => Self::Empty,
            Data::String(s) => Self::Text(s.clone()),
            Data::Float(f) => Self::Number(*f),
            Data::Int(i) => Self::Number(*i as f64),
            Data::Bool(b) => Self::Text(b.to_string()),
            other => Self::Text(other.to_string()),
        }
    }
}

/// Worksheet contents addressed by absolute (row, column) position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetGrid {
    rows: Vec<Vec<SheetCell>>,
}

impl SheetGrid {
    pub fn new(rows: Vec<Vec<SheetCell>>) -> Self {
        Self { rows }
    }

    /// calamine ranges start at the first used cell; pad so indices match the sheet.
    pub fn from_range(range: &Range<Data>) -> Self {
        let (start_row, start_col) = range
            .start()
            .map(|(r, c)| (r as usize, c as usize))
            .unwrap_or((0, 0));

        let mut rows = vec![Vec::new(); start_row];
        for row in range.rows() {
            let mut cells = vec![SheetCell::Empty; start_col];
            cells.extend(row.iter().map(SheetCell::from));
            rows.push(cells);
        }
        Self { rows }
    }

    /// Loads the first worksheet. The format is sniffed from the content, not the extension.
    pub fn load(path: &Path) -> Result<Self, SheetError> {
        let bytes = std::fs::read(path).map_err(|e| SheetError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes)).map_err(|e| SheetError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| SheetError::NoWorksheet(path.to_path_buf()))?
            .map_err(|e| SheetError::Open {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Ok(Self::from_range(&range))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cell(&self, row: usize, col: usize) -> &SheetCell {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&EMPTY_CELL)
    }
}

pub fn normalize_header(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Copy)]
struct ColumnMap {
    product_id: usize,
    product_name: usize,
    basis_name: usize,
    volume: usize,
    total: usize,
    count: usize,
}

fn map_columns(grid: &SheetGrid) -> Result<ColumnMap, SheetError> {
    let header_row = grid.rows.get(HEADER_ROW).map(Vec::as_slice).unwrap_or(&[]);
    let headers: Vec<(usize, String)> = header_row
        .iter()
        .enumerate()
        .skip(1)
        .map(|(col, cell)| (col, normalize_header(&cell.as_text())))
        .collect();
    let find = |label: &str| headers.iter().find(|(_, h)| h == label).map(|(c, _)| *c);

    let missing: Vec<String> = REQUIRED_HEADERS
        .iter()
        .filter(|label| find(label).is_none())
        .map(|label| label.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(SheetError::MissingColumns(missing));
    }

    let col = |label: &str| find(label).unwrap_or_default();
    Ok(ColumnMap {
        product_id: col(PRODUCT_ID_HEADER),
        product_name: col(PRODUCT_NAME_HEADER),
        basis_name: col(BASIS_NAME_HEADER),
        volume: col(VOLUME_HEADER),
        total: col(TOTAL_HEADER),
        count: col(COUNT_HEADER),
    })
}

fn ends_data_block(key: &str) -> bool {
    let lower = key.to_lowercase();
    key.is_empty() || lower.starts_with(HEADER_KEY_PREFIX) || lower.starts_with(TOTAL_ROW_PREFIX)
}

/// Normalizes the first data block of a bulletin grid.
pub fn parse_grid(
    grid: &SheetGrid,
    trade_date: NaiveDate,
    processed_at: NaiveDateTime,
) -> Result<Vec<TradingRecord>, SheetError> {
    if grid.len() <= HEADER_ROW {
        return Err(SheetError::TooShort { rows: grid.len() });
    }
    let columns = map_columns(grid)?;

    let mut block_rows = Vec::new();
    for row in FIRST_DATA_ROW..grid.len() {
        let key = grid.cell(row, KEY_COLUMN).as_text();
        if ends_data_block(key.trim()) {
            debug!(row = row + 1, key = key.trim(), "end of data block");
            break;
        }
        block_rows.push(row);
    }
    if block_rows.is_empty() {
        return Err(SheetError::NoDataRows);
    }

    let mut records = Vec::with_capacity(block_rows.len());
    for row in block_rows {
        let count = grid.cell(row, columns.count).to_number();
        if count <= 0.0 {
            continue;
        }
        let product_id = grid.cell(row, columns.product_id).as_text().trim().to_string();
        if product_id.to_lowercase().contains(TOTAL_MARKER) {
            continue;
        }
        let parts = ProductCodeParts::from_product_id(&product_id);
        records.push(TradingRecord {
            exchange_product_name: grid.cell(row, columns.product_name).as_text().trim().to_string(),
            delivery_basis_name: grid.cell(row, columns.basis_name).as_text().trim().to_string(),
            oil_id: parts.oil_id,
            delivery_basis_id: parts.delivery_basis_id,
            delivery_type_id: parts.delivery_type_id,
            exchange_product_id: product_id,
            volume: grid.cell(row, columns.volume).to_number(),
            total: grid.cell(row, columns.total).to_number(),
            count: count as i32,
            date: trade_date,
            created_on: processed_at,
            updated_on: processed_at,
        });
    }
    Ok(records)
}

/// Loads the first worksheet of `path` and parses it.
pub fn parse_bulletin(
    path: &Path,
    trade_date: NaiveDate,
    processed_at: NaiveDateTime,
) -> Result<Vec<TradingRecord>, SheetError> {
    let grid = SheetGrid::load(path)?;
    match parse_grid(&grid, trade_date, processed_at) {
        Ok(records) => {
            info!(path = %path.display(), records = records.len(), "bulletin parsed");
            Ok(records)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "bulletin rejected");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    fn processed_at() -> NaiveDateTime {
        trade_date().and_hms_opt(18, 30, 0).unwrap()
    }

    fn t(s: &str) -> SheetCell {
        SheetCell::text(s)
    }

    fn n(v: f64) -> SheetCell {
        SheetCell::Number(v)
    }

    fn header_row() -> Vec<SheetCell> {
        vec![
            SheetCell::Empty,
            t("Код\nИнструмента"),
            t("Наименование\nИнструмента"),
            t("Базис\nпоставки"),
            t("Объем\nДоговоров\nв единицах\nизмерения"),
            t("Обьем\nДоговоров,\nруб."),
            t("Изменение рыночной\nцены к цене\nпредыдущего дня"),
            t("Количество\nДоговоров,\nшт."),
        ]
    }

    fn data_row(id: &str, volume: SheetCell, total: SheetCell, count: SheetCell) -> Vec<SheetCell> {
        vec![
            SheetCell::Empty,
            t(id),
            t("Бензин (АИ-92-К5)"),
            t("ст. Аллагуват"),
            volume,
            total,
            t("-"),
            count,
        ]
    }

    fn grid_with(data: Vec<Vec<SheetCell>>) -> SheetGrid {
        let mut rows = vec![
            vec![],
            vec![SheetCell::Empty, t("Бюллетень по итогам торгов")],
            vec![SheetCell::Empty, t("Дата торгов: 15.01.2024")],
            vec![],
            vec![],
            vec![SheetCell::Empty, t("Единица измерения: Метрическая тонна")],
            header_row(),
            vec![SheetCell::Empty, t("1"), t("2"), t("3"), t("4"), t("5"), t("6"), t("7")],
        ];
        rows.extend(data);
        SheetGrid::new(rows)
    }

    #[test]
    fn reads_data_rows_until_blank_key() {
        let grid = grid_with(vec![
            data_row("A123BCD4", n(60.0), n(3_900_000.0), n(2.0)),
            data_row("A592ALG060F", n(120.0), n(7_440_000.0), n(3.0)),
            data_row("DTEZNNK060F", t("1 080"), t("65 000 000"), t("9")),
            vec![SheetCell::Empty, SheetCell::Empty],
            data_row("AFTERBLANK", n(1.0), n(1.0), n(1.0)),
        ]);

        let records = parse_grid(&grid, trade_date(), processed_at()).unwrap();

        assert_eq!(records.len(), 3);
        let first = &records[0];
        assert_eq!(first.exchange_product_id, "A123BCD4");
        assert_eq!(first.oil_id, "A123");
        assert_eq!(first.delivery_basis_id, "BCD");
        assert_eq!(first.delivery_type_id, "4");
        assert_eq!(first.exchange_product_name, "Бензин (АИ-92-К5)");
        assert_eq!(first.delivery_basis_name, "ст. Аллагуват");
        assert_eq!(first.count, 2);
        assert_eq!(first.date, trade_date());
        assert_eq!(first.created_on, processed_at());
        assert_eq!(first.updated_on, processed_at());

        assert_eq!(records[2].volume, 1080.0);
        assert_eq!(records[2].total, 65_000_000.0);
        assert_eq!(records[2].count, 9);
    }

    #[test]
    fn zero_count_and_total_rows_are_dropped() {
        let grid = grid_with(vec![
            data_row("A100ANK060F", n(60.0), n(100.0), n(1.0)),
            data_row("A100NVY060F", n(0.0), n(0.0), n(0.0)),
            data_row("A100STI060F", t("-"), t("-"), t("-")),
            data_row("Промежуточный итог", n(60.0), n(100.0), n(1.0)),
            data_row("A100UFM060F", n(5.0), n(50.0), n(1.0)),
        ]);

        let records = parse_grid(&grid, trade_date(), processed_at()).unwrap();

        let ids: Vec<_> = records.iter().map(|r| r.exchange_product_id.as_str()).collect();
        assert_eq!(ids, vec!["A100ANK060F", "A100UFM060F"]);
    }

    #[test]
    fn dash_sentinel_becomes_zero() {
        let grid = grid_with(vec![data_row("A100ANK060F", t("-"), t(" - "), n(4.0))]);

        let records = parse_grid(&grid, trade_date(), processed_at()).unwrap();

        assert_eq!(records[0].volume, 0.0);
        assert_eq!(records[0].total, 0.0);
        assert_eq!(records[0].count, 4);
    }

    #[test]
    fn unparseable_numbers_fall_back_to_zero() {
        assert_eq!(t("n/a").to_number(), 0.0);
        assert_eq!(t("NaN").to_number(), 0.0);
        assert_eq!(SheetCell::Empty.to_number(), 0.0);
        assert_eq!(t("12\u{a0}500").to_number(), 12_500.0);
    }

    #[test]
    fn summary_block_ends_the_data() {
        let grid = grid_with(vec![
            data_row("A100ANK060F", n(60.0), n(100.0), n(1.0)),
            data_row("Итого:", n(60.0), n(100.0), n(1.0)),
            data_row("A100UFM060F", n(5.0), n(50.0), n(1.0)),
        ]);

        let records = parse_grid(&grid, trade_date(), processed_at()).unwrap();

        assert_eq!(records.len(), 1);
    }

    #[test]
    fn repeated_header_ends_the_data() {
        let grid = grid_with(vec![
            data_row("A100ANK060F", n(60.0), n(100.0), n(1.0)),
            header_row(),
            data_row("A100UFM060F", n(5.0), n(50.0), n(1.0)),
        ]);

        let records = parse_grid(&grid, trade_date(), processed_at()).unwrap();

        assert_eq!(records.len(), 1);
    }

    #[test]
    fn missing_header_is_reported_by_name() {
        let mut grid = grid_with(vec![data_row("A100ANK060F", n(1.0), n(1.0), n(1.0))]);
        grid.rows[HEADER_ROW][3] = t("Базис");

        let err = parse_grid(&grid, trade_date(), processed_at()).unwrap_err();

        match err {
            SheetError::MissingColumns(cols) => assert_eq!(cols, vec![BASIS_NAME_HEADER.to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn short_sheet_is_rejected() {
        let grid = SheetGrid::new(vec![vec![t("title")]; 4]);
        let err = parse_grid(&grid, trade_date(), processed_at()).unwrap_err();
        assert!(matches!(err, SheetError::TooShort { rows: 4 }));
    }

    #[test]
    fn header_only_sheet_has_no_data() {
        let grid = grid_with(vec![vec![SheetCell::Empty, SheetCell::Empty]]);
        let err = parse_grid(&grid, trade_date(), processed_at()).unwrap_err();
        assert!(matches!(err, SheetError::NoDataRows));
    }

    #[test]
    fn all_rows_filtered_is_an_empty_success() {
        let grid = grid_with(vec![data_row("A100ANK060F", n(0.0), n(0.0), n(0.0))]);
        let records = parse_grid(&grid, trade_date(), processed_at()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn numeric_cells_render_without_trailing_zero() {
        assert_eq!(n(12.0).as_text(), "12");
        assert_eq!(n(12.5).as_text(), "12.5");
        assert_eq!(SheetCell::Empty.as_text(), "");
    }

    #[test]
    fn header_normalization_collapses_whitespace() {
        assert_eq!(
            normalize_header("  Объем\nДоговоров   в единицах\r\nизмерения "),
            VOLUME_HEADER
        );
    }
}
