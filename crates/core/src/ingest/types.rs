use crate::domain::price::Bar;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

/// Result of one provider query. "No data available" is a successful empty
/// outcome, distinct from transport or data errors (those are the `Err` arm
/// of the surrounding `Result`).
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Bars(Vec<Bar>),
    Empty,
}

impl FetchOutcome {
    pub fn into_bars(self) -> Vec<Bar> {
        match self {
            FetchOutcome::Bars(bars) => bars,
            FetchOutcome::Empty => Vec::new(),
        }
    }
}

const NO_DATA_MARKER: &str = "no data is available";

#[derive(Debug, Clone, Deserialize)]
struct SeriesResponse {
    #[serde(default)]
    values: Vec<WireBar>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireBar {
    #[serde(default)]
    datetime: String,
    #[serde(default)]
    close: String,
    #[serde(default)]
    adj_close: String,
    #[serde(default)]
    volume: String,
    #[serde(default)]
    currency: String,
}

/// Parses a provider response body into a typed outcome. The explicit
/// "no data is available" error message is the only string-matched case;
/// every other error status is surfaced.
pub fn parse_series_body(body: &Value) -> Result<FetchOutcome> {
    if let Some(status) = body.get("status").and_then(Value::as_str) {
        if status.eq_ignore_ascii_case("error") {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if message.to_ascii_lowercase().contains(NO_DATA_MARKER) {
                return Ok(FetchOutcome::Empty);
            }
            anyhow::bail!("provider error response: {message}");
        }
    }

    let parsed = serde_json::from_value::<SeriesResponse>(body.clone())
        .context("failed to parse provider series response")?;

    let mut bars = Vec::with_capacity(parsed.values.len());
    for wire in &parsed.values {
        if let Some(bar) = bar_from_wire(wire) {
            bars.push(bar);
        }
    }

    // Ascending by date regardless of the requested order, so downstream
    // consumers never depend on the provider's sort.
    bars.sort_by_key(|b: &Bar| b.trade_date);

    if bars.is_empty() {
        return Ok(FetchOutcome::Empty);
    }
    Ok(FetchOutcome::Bars(bars))
}

fn bar_from_wire(wire: &WireBar) -> Option<Bar> {
    let date_part = wire.datetime.get(..10)?;
    let trade_date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    let close = parse_num(&wire.close)?;

    Some(Bar {
        trade_date,
        close,
        adj_close: parse_num(&wire.adj_close),
        volume: parse_num(&wire.volume),
        currency: {
            let c = wire.currency.trim();
            if c.is_empty() {
                None
            } else {
                Some(c.to_string())
            }
        },
    })
}

fn parse_num(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    t.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_values_ascending() {
        let body = json!({
            "values": [
                {"datetime": "2025-01-03", "close": "11.5", "volume": "100"},
                {"datetime": "2025-01-02", "close": "10.0", "adj_close": "10.0"}
            ],
            "meta": {"symbol": "XYZ"}
        });

        let out = parse_series_body(&body).unwrap();
        let bars = out.into_bars();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].trade_date, NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
        assert_eq!(bars[0].close, 10.0);
        assert_eq!(bars[0].adj_close, Some(10.0));
        assert_eq!(bars[1].close, 11.5);
        assert_eq!(bars[1].adj_close, None);
        assert_eq!(bars[1].volume, Some(100.0));
    }

    #[test]
    fn no_data_message_is_empty_not_error() {
        let body = json!({
            "status": "error",
            "message": "No data is available on the specified dates"
        });
        let out = parse_series_body(&body).unwrap();
        assert!(matches!(out, FetchOutcome::Empty));
    }

    #[test]
    fn other_error_messages_are_surfaced() {
        let body = json!({"status": "error", "message": "symbol not found"});
        let err = parse_series_body(&body).unwrap_err();
        assert!(err.to_string().contains("symbol not found"));
    }

    #[test]
    fn datetime_with_time_component_is_accepted() {
        let body = json!({
            "values": [{"datetime": "2025-01-02 00:00:00", "close": "10"}]
        });
        let bars = parse_series_body(&body).unwrap().into_bars();
        assert_eq!(bars[0].trade_date, NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
    }

    #[test]
    fn bars_without_close_are_skipped() {
        let body = json!({
            "values": [
                {"datetime": "2025-01-02", "close": ""},
                {"datetime": "2025-01-03", "close": "12.0"}
            ]
        });
        let bars = parse_series_body(&body).unwrap().into_bars();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 12.0);
    }
}
