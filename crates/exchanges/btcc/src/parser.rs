//! Normalization of BTCC responses and pushes.

use crate::protocol::RpcFrame;
use exgate_core::*;
use exgate_exchanges_common::{as_i64, as_string, is_zero_amount, levels, order_book, secs_to_millis};
use serde_json::Value;
use tracing::debug;

const PLATFORM: Platform = Platform::Btcc;

/// Classify a decoded frame.
///
/// Responses carry the id of the request they answer. Pushes have no id and
/// name a method. Anything else is dropped.
pub fn parse_frame(frame: RpcFrame) -> Vec<Inbound> {
    if let Some(id) = frame.id {
        return vec![Inbound::Response {
            id,
            error: frame.error.map(|e| e.to_string()),
        }];
    }

    match (frame.method.as_deref(), frame.params) {
        (Some(method), Some(params)) => parse_push(method, &params)
            .into_iter()
            .map(Inbound::Message)
            .collect(),
        (Some(method), None) => {
            debug!(method, "Dropping BTCC push without params");
            Vec::new()
        }
        (None, _) => match frame.error {
            Some(err) => vec![Inbound::Message(NormalizedMessage::error(
                Some(PLATFORM),
                err.to_string(),
            ))],
            None => Vec::new(),
        },
    }
}

fn parse_push(method: &str, params: &Value) -> Vec<NormalizedMessage> {
    match method {
        "kline.update" => parse_klines(params),
        "depth.update" => parse_depth(params).into_iter().collect(),
        "deals.update" => parse_deals(params).into_iter().collect(),
        "state.update" => parse_states(params),
        "order.update" => parse_order(params).into_iter().collect(),
        "asset.update" => parse_assets(params).into_iter().collect(),
        other => {
            debug!(method = other, "Dropping unhandled BTCC push");
            Vec::new()
        }
    }
}

/// Rows of `[time, open, close, high, low, volume, amount, symbol]`.
fn parse_klines(params: &Value) -> Vec<NormalizedMessage> {
    let Some(rows) = params.as_array() else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let row = row.as_array()?;
            if row.len() < 8 {
                return None;
            }
            let kline = KlineData {
                time: secs_to_millis(&row[0]),
                interval: None,
                open: as_string(&row[1]),
                close: as_string(&row[2]),
                high: as_string(&row[3]),
                low: as_string(&row[4]),
                volume: as_string(&row[5]),
                amount: as_string(&row[6]),
            };
            Some(NormalizedMessage::new(
                MessageType::Kline,
                PLATFORM,
                as_string(&row[7]),
                kline,
            ))
        })
        .collect()
}

/// `[clean, {"asks": [...], "bids": [...]}, symbol]`
fn parse_depth(params: &Value) -> Option<NormalizedMessage> {
    let snapshot = params.get(0)?.as_bool().unwrap_or(false);
    let book = params.get(1)?;
    let symbol = params.get(2).map(as_string).unwrap_or_default();
    let data = order_book(snapshot, levels(&book["bids"]), levels(&book["asks"]));
    Some(NormalizedMessage::new(
        MessageType::Orderbook,
        PLATFORM,
        symbol,
        data,
    ))
}

/// `[symbol, [{"id", "time", "price", "amount", "type"}, ...]]`
fn parse_deals(params: &Value) -> Option<NormalizedMessage> {
    let symbol = as_string(params.get(0)?);
    let trades: Vec<TradeData> = params
        .get(1)?
        .as_array()?
        .iter()
        .map(|deal| TradeData {
            id: as_string(&deal["id"]),
            price: as_string(&deal["price"]),
            amount: as_string(&deal["amount"]),
            side: as_string(&deal["type"]).to_ascii_uppercase(),
            time: secs_to_millis(&deal["time"]),
        })
        .collect();
    Some(NormalizedMessage::new(
        MessageType::Trades,
        PLATFORM,
        symbol,
        trades,
    ))
}

/// `[{"BTCUSDT": {"last", "open", "high", "low", "volume", "deal"}}]`
fn parse_states(params: &Value) -> Vec<NormalizedMessage> {
    let Some(markets) = params.get(0).and_then(Value::as_object) else {
        return Vec::new();
    };
    markets
        .iter()
        .map(|(symbol, s)| {
            let state = StateData {
                last: as_string(&s["last"]),
                open: as_string(&s["open"]),
                high: as_string(&s["high"]),
                low: as_string(&s["low"]),
                volume: as_string(&s["volume"]),
                amount: as_string(&s["deal"]),
            };
            NormalizedMessage::new(MessageType::State, PLATFORM, symbol.clone(), state)
        })
        .collect()
}

pub fn side_name(code: i64) -> &'static str {
    match code {
        1 => "SELL",
        2 => "BUY",
        _ => "UNKNOWN",
    }
}

pub fn order_type_name(code: i64) -> &'static str {
    match code {
        1 => "LIMIT",
        2 => "MARKET",
        _ => "UNKNOWN",
    }
}

/// Event 1 = placed, 2 = updated, 3 = finished (filled or cancelled).
fn order_status(event: i64, order: &Value) -> &'static str {
    match event {
        1 => "NEW",
        2 => "PARTIALLY_FILLED",
        3 if is_zero_amount(&order["left"]) => "FILLED",
        3 => "CANCELED",
        _ => "UNKNOWN",
    }
}

/// `[event, {order}]`
fn parse_order(params: &Value) -> Option<NormalizedMessage> {
    let event = as_i64(params.get(0)?).unwrap_or(0);
    let order = params.get(1)?;
    let data = OrderData {
        order_id: as_string(&order["id"]),
        side: side_name(as_i64(&order["side"]).unwrap_or(0)).to_string(),
        order_type: order_type_name(as_i64(&order["type"]).unwrap_or(0)).to_string(),
        status: order_status(event, order).to_string(),
        price: as_string(&order["price"]),
        amount: as_string(&order["amount"]),
        filled: as_string(&order["deal_stock"]),
        create_time: secs_to_millis(&order["ctime"]),
        update_time: secs_to_millis(&order["mtime"]),
    };
    Some(NormalizedMessage::new(
        MessageType::Order,
        PLATFORM,
        as_string(&order["market"]),
        data,
    ))
}

/// `[{"BTC": {"available", "frozen"}}]`
fn parse_assets(params: &Value) -> Option<NormalizedMessage> {
    let balances: AssetData = params
        .get(0)?
        .as_object()?
        .iter()
        .map(|(currency, b)| {
            let frozen = b.get("frozen").or_else(|| b.get("freeze"));
            (
                currency.clone(),
                AssetBalance {
                    available: as_string(&b["available"]),
                    frozen: frozen.map(as_string).unwrap_or_default(),
                },
            )
        })
        .collect();
    Some(NormalizedMessage::new(
        MessageType::Asset,
        PLATFORM,
        "",
        balances,
    ))
}
