use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// Decimal places for per-unit ratios on the state map.
pub const MAP_DECIMALS: u32 = 2;
/// Decimal places for summed measures and ratios on a state time series.
pub const SERIES_DECIMALS: u32 = 4;

pub const DEFAULT_PRODUCT: &str = "metFORMIN HCl ER Oral Tablet Extended Release 24 Hour 500 MG";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    pub product_id: i64,
    pub product: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Period {
    pub date_id: i64,
    pub year: i32,
    pub quarter: u8,
    pub formatted_date: String,
}

/// Representative month of a reporting quarter: Q1 Jan, Q2 Apr, Q3 Jul, Q4 Oct.
pub fn quarter_month(quarter: u8) -> Option<u32> {
    match quarter {
        1 => Some(1),
        2 => Some(4),
        3 => Some(7),
        4 => Some(10),
        _ => None,
    }
}

pub fn quarter_start(year: i32, quarter: u8) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, quarter_month(quarter)?, 1)
}

/// Rounds half away from zero.
pub fn round_to(v: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (v * factor).round() / factor
}

/// Summed utilization measures for one group (a state, or a period).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Totals {
    pub units: f64,
    pub rx_count: f64,
    pub total: f64,
    pub medicaid_reimbursed: f64,
    pub nadac: f64,
}

impl Totals {
    pub fn add(&mut self, other: &Totals) {
        self.units += other.units;
        self.rx_count += other.rx_count;
        self.total += other.total;
        self.medicaid_reimbursed += other.medicaid_reimbursed;
        self.nadac += other.nadac;
    }

    pub fn rounded(&self, places: u32) -> Totals {
        Totals {
            units: round_to(self.units, places),
            rx_count: round_to(self.rx_count, places),
            total: round_to(self.total, places),
            medicaid_reimbursed: round_to(self.medicaid_reimbursed, places),
            nadac: round_to(self.nadac, places),
        }
    }

    /// Derives the per-unit metrics from these sums. Ratios are `None` when
    /// there are no units to divide by.
    pub fn per_unit(&self, places: u32) -> PerUnit {
        PerUnit {
            markup_per_unit: ratio(self.total - self.nadac, self.units, places),
            payment_per_unit: ratio(self.total, self.units, places),
            nadac_per_unit: ratio(self.nadac, self.units, places),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerUnit {
    pub markup_per_unit: Option<f64>,
    pub payment_per_unit: Option<f64>,
    pub nadac_per_unit: Option<f64>,
}

fn ratio(numerator: f64, units: f64, places: u32) -> Option<f64> {
    if units == 0.0 || !units.is_finite() {
        return None;
    }
    let v = numerator / units;
    v.is_finite().then(|| round_to(v, places))
}

/// Which facility-status (FFSU) flags a query includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FfsuFilter {
    pub ffsu: bool,
    pub non_ffsu: bool,
}

impl Default for FfsuFilter {
    fn default() -> Self {
        Self::BOTH
    }
}

impl FfsuFilter {
    pub const BOTH: FfsuFilter = FfsuFilter {
        ffsu: true,
        non_ffsu: true,
    };
    pub const NONE: FfsuFilter = FfsuFilter {
        ffsu: false,
        non_ffsu: false,
    };

    pub fn is_empty(&self) -> bool {
        !self.ffsu && !self.non_ffsu
    }

    pub fn flags(&self) -> Vec<bool> {
        let mut out = Vec::with_capacity(2);
        if self.ffsu {
            out.push(true);
        }
        if self.non_ffsu {
            out.push(false);
        }
        out
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.flags()
            .into_iter()
            .map(|f| if f { "FFSU" } else { "Non-FFSU" })
            .collect()
    }

    /// Parses checklist selections (`FFSU`, `Non-FFSU`, or `true`/`false`).
    /// An empty selection is legal and matches nothing.
    pub fn from_labels<S: AsRef<str>>(items: &[S]) -> Result<Self, QueryError> {
        let mut out = Self::NONE;
        for item in items {
            let raw = item.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            match raw.to_ascii_lowercase().replace('_', "-").as_str() {
                "ffsu" | "true" => out.ffsu = true,
                "non-ffsu" | "nonffsu" | "false" => out.non_ffsu = true,
                _ => return Err(QueryError::UnknownFfsu(raw.to_string())),
            }
        }
        Ok(out)
    }

    /// SQL predicate over a BOOLEAN column. The literals come from this type,
    /// never from user input.
    pub fn sql_predicate(&self, column: &str) -> String {
        match (self.ffsu, self.non_ffsu) {
            (true, true) => format!("{column} IN (TRUE, FALSE)"),
            (true, false) => format!("{column} = TRUE"),
            (false, true) => format!("{column} = FALSE"),
            (false, false) => "FALSE".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    MarkupPerUnit,
    PaymentPerUnit,
    NadacPerUnit,
    Total,
    Nadac,
    MedicaidReimbursed,
    Units,
    RxCount,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::MarkupPerUnit,
        Metric::PaymentPerUnit,
        Metric::NadacPerUnit,
        Metric::Total,
        Metric::Nadac,
        Metric::MedicaidReimbursed,
        Metric::Units,
        Metric::RxCount,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Metric::MarkupPerUnit => "markup_per_unit",
            Metric::PaymentPerUnit => "payment_per_unit",
            Metric::NadacPerUnit => "nadac_per_unit",
            Metric::Total => "total",
            Metric::Nadac => "nadac",
            Metric::MedicaidReimbursed => "medicaid_reimbursed",
            Metric::Units => "units",
            Metric::RxCount => "rx_count",
        }
    }

    pub fn label(&self) -> String {
        title_case(self.key())
    }

    pub fn is_currency(&self) -> bool {
        !matches!(self, Metric::Units | Metric::RxCount)
    }

    pub fn value(&self, totals: &Totals, per_unit: &PerUnit) -> Option<f64> {
        match self {
            Metric::MarkupPerUnit => per_unit.markup_per_unit,
            Metric::PaymentPerUnit => per_unit.payment_per_unit,
            Metric::NadacPerUnit => per_unit.nadac_per_unit,
            Metric::Total => Some(totals.total),
            Metric::Nadac => Some(totals.nadac),
            Metric::MedicaidReimbursed => Some(totals.medicaid_reimbursed),
            Metric::Units => Some(totals.units),
            Metric::RxCount => Some(totals.rx_count),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Metric {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Metric::ALL
            .into_iter()
            .find(|m| m.key() == wanted)
            .ok_or_else(|| QueryError::UnknownMetric(s.to_string()))
    }
}

/// `markup_per_unit` -> `Markup Per Unit`.
pub fn title_case(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
