use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("No product named '{0}'")]
    UnknownProduct(String),

    #[error("No reporting period labelled '{0}'")]
    UnknownPeriod(String),

    #[error("Unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("Unknown facility filter '{0}'; expected FFSU or Non-FFSU")]
    UnknownFfsu(String),

    #[error("Invalid state code '{0}'; expected a two-letter abbreviation")]
    InvalidState(String),

    #[error("Period {date_id} has quarter {quarter}; expected 1-4")]
    InvalidQuarter { date_id: i64, quarter: i32 },

    #[error("DuckDB query failed: {0}")]
    Db(#[from] duckdb::Error),
}

impl QueryError {
    /// Lookups that miss are rendered as a placeholder, not an error status.
    pub fn is_lookup_miss(&self) -> bool {
        matches!(
            self,
            QueryError::UnknownProduct(_) | QueryError::UnknownPeriod(_)
        )
    }

    /// Request input that cannot be interpreted at all.
    pub fn is_bad_input(&self) -> bool {
        matches!(
            self,
            QueryError::UnknownMetric(_) | QueryError::UnknownFfsu(_) | QueryError::InvalidState(_)
        )
    }
}
