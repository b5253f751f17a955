//! Lenient accessors for loosely typed exchange JSON.

use exgate_core::PriceLevel;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Render a string or number field as a string. Anything else is empty.
pub fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Read an integer that may be sent as a number or a numeric string.
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }
}

/// Convert epoch seconds (integer or fractional, number or string) to milliseconds.
pub fn secs_to_millis(value: &Value) -> i64 {
    let secs = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };
    secs.map(|s| (s * 1000.0).round() as i64).unwrap_or(0)
}

/// True when a decimal string or number is zero. Unparseable input is not zero.
pub fn is_zero_amount(value: &Value) -> bool {
    Decimal::from_str(&as_string(value))
        .map(|d| d.is_zero())
        .unwrap_or(false)
}

/// Read `[[price, qty], ...]`, ignoring malformed rows.
pub fn levels(value: &Value) -> Vec<PriceLevel> {
    value
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let row = row.as_array()?;
                    if row.len() < 2 {
                        return None;
                    }
                    Some([as_string(&row[0]), as_string(&row[1])])
                })
                .collect()
        })
        .unwrap_or_default()
}
