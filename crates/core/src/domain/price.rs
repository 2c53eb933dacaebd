use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One end-of-day bar as returned by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub trade_date: NaiveDate,
    pub close: f64,
    pub adj_close: Option<f64>,
    pub volume: Option<f64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObservationStatus {
    Ok,
    Error,
}

impl ObservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationStatus::Ok => "OK",
            ObservationStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(ObservationStatus::Ok),
            "ERROR" => Some(ObservationStatus::Error),
            _ => None,
        }
    }
}

/// One raw provider observation, keyed by (ticker, trade_date, provider).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPriceObservation {
    pub ticker: String,
    pub trade_date: NaiveDate,
    pub provider: String,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<f64>,
    pub currency: Option<String>,
    pub status: ObservationStatus,
    pub error: Option<String>,
}

impl RawPriceObservation {
    pub fn from_bar(ticker: &str, provider: &str, bar: &Bar) -> Self {
        Self {
            ticker: ticker.to_string(),
            trade_date: bar.trade_date,
            provider: provider.to_string(),
            close: Some(bar.close),
            adj_close: bar.adj_close,
            volume: bar.volume,
            currency: bar.currency.clone(),
            status: ObservationStatus::Ok,
            error: None,
        }
    }

    pub fn error_row(ticker: &str, provider: &str, trade_date: NaiveDate, error: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            trade_date,
            provider: provider.to_string(),
            close: None,
            adj_close: None,
            volume: None,
            currency: None,
            status: ObservationStatus::Error,
            error: Some(error.to_string()),
        }
    }

    /// Price this observation contributes to reconciliation, if any.
    pub fn usable_price(&self) -> Option<f64> {
        if self.status != ObservationStatus::Ok {
            return None;
        }
        self.adj_close.or(self.close)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceQuality {
    Real,
    Low,
    Imputed,
}

impl PriceQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceQuality::Real => "REAL",
            PriceQuality::Low => "LOW",
            PriceQuality::Imputed => "IMPUTED",
        }
    }
}

/// The single reconciled price per (ticker, trade_date).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalPrice {
    pub ticker: String,
    pub trade_date: NaiveDate,
    pub canon_close: f64,
    pub canon_adj_close: f64,
    pub chosen_provider: String,
    pub providers_ok: i32,
    pub divergence_pct: f64,
    pub quality: PriceQuality,
}
