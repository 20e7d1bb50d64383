//! CSV price-fixture loading for scenario tests.
//!
//! Read side only: parses a CSV file (or in-memory text) into
//! [`PriceBar`] values; callers hand the result to
//! `pmx_db::upsert_price_bar` for persistence.
//!
//! ## CSV column contract (header required, order-independent)
//!
//! | Column          | Type / example | Notes                |
//! |-----------------|----------------|----------------------|
//! | `instrument_id` | `AAPL.US`      |                      |
//! | `date`          | `2025-03-10`   | ISO calendar date    |
//! | `open`          | `182.34`       |                      |
//! | `high`          | `185.00`       |                      |
//! | `low`           | `181.00`       |                      |
//! | `close`         | `184.50`       |                      |
//! | `adj_close`     | `184.50`       |                      |
//! | `volume`        | `1000000`      | Integer ≥ 0          |

use std::fmt;
use std::io::Read;
use std::path::Path;

use pmx_schemas::PriceBar;

/// Errors produced by fixture CSV parsing.
#[derive(Debug)]
pub enum CsvFixtureError {
    Io(String),
    /// The header row is missing a required column.
    MissingHeader(String),
    /// A record field could not be parsed into the expected type.
    ParseField {
        row: usize,
        field: &'static str,
        raw: String,
    },
}

impl fmt::Display for CsvFixtureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsvFixtureError::Io(msg) => write!(f, "csv io error: {msg}"),
            CsvFixtureError::MissingHeader(col) => {
                write!(f, "csv missing required header column: '{col}'")
            }
            CsvFixtureError::ParseField { row, field, raw } => {
                write!(
                    f,
                    "csv row {row}: cannot parse field '{field}' from value '{raw}'"
                )
            }
        }
    }
}

impl std::error::Error for CsvFixtureError {}

const REQUIRED: &[&str] = &[
    "instrument_id",
    "date",
    "open",
    "high",
    "low",
    "close",
    "adj_close",
    "volume",
];

/// Parse price bars from a CSV file on disk.
pub fn load_price_csv(path: &Path) -> Result<Vec<PriceBar>, CsvFixtureError> {
    let file = std::fs::File::open(path).map_err(|e| CsvFixtureError::Io(e.to_string()))?;
    parse_price_csv(file)
}

/// Parse price bars from any reader (tests pass in-memory text).
pub fn parse_price_csv<R: Read>(reader: R) -> Result<Vec<PriceBar>, CsvFixtureError> {
    let mut rdr = csv::Reader::from_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|e| CsvFixtureError::Io(e.to_string()))?
        .clone();
    let col = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let mut idx = [0usize; 8];
    for (i, name) in REQUIRED.iter().enumerate() {
        idx[i] = col(name).ok_or_else(|| CsvFixtureError::MissingHeader(name.to_string()))?;
    }

    let mut out = Vec::new();
    for (row_no, record) in rdr.records().enumerate() {
        let record = record.map_err(|e| CsvFixtureError::Io(e.to_string()))?;
        let field = |i: usize| record.get(idx[i]).unwrap_or("").trim();

        let parse_f64 = |i: usize, name: &'static str| {
            field(i).parse::<f64>().map_err(|_| CsvFixtureError::ParseField {
                row: row_no + 2,
                field: name,
                raw: field(i).to_string(),
            })
        };

        out.push(PriceBar {
            instrument_id: field(0).to_string(),
            date: field(1).parse().map_err(|_| CsvFixtureError::ParseField {
                row: row_no + 2,
                field: "date",
                raw: field(1).to_string(),
            })?,
            open: parse_f64(2, "open")?,
            high: parse_f64(3, "high")?,
            low: parse_f64(4, "low")?,
            close: parse_f64(5, "close")?,
            adj_close: parse_f64(6, "adj_close")?,
            volume: field(7).parse().map_err(|_| CsvFixtureError::ParseField {
                row: row_no + 2,
                field: "volume",
                raw: field(7).to_string(),
            })?,
        });
    }
    Ok(out)
}
