use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One ranked-universe row, supplied by the external membership process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedConstituent {
    pub rank: i32,
    pub ticker: String,
    pub target_weight: f64,
}

/// Holdings persisted on a rebalance date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHolding {
    pub ticker: String,
    pub target_weight: f64,
    pub shares: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstituentDaily {
    pub trade_date: NaiveDate,
    pub ticker: String,
    pub shares: f64,
    pub price_used: f64,
    pub market_value: f64,
    pub weight: f64,
    pub price_quality: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionDaily {
    pub trade_date: NaiveDate,
    pub ticker: String,
    pub weight_prev: f64,
    pub ret_1d: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsDaily {
    pub trade_date: NaiveDate,
    pub level_tr: f64,
    pub ret_1d: Option<f64>,
    pub ret_5d: Option<f64>,
    pub ret_20d: Option<f64>,
    pub vol_20d: Option<f64>,
    pub max_drawdown_252d: Option<f64>,
    pub n_constituents: i32,
    pub n_imputed: i32,
    pub top5_weight: Option<f64>,
    pub herfindahl: Option<f64>,
}
