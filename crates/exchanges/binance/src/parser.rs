//! Normalization of Binance stream payloads.

use crate::streams::symbol_of;
use exgate_core::*;
use exgate_exchanges_common::{as_i64, as_string, levels, order_book};
use serde_json::Value;
use tracing::debug;

const PLATFORM: Platform = Platform::Binance;

/// Decode one JSON frame from either the combined public stream or the user-data stream.
pub fn parse_value(value: &Value) -> Vec<Inbound> {
    // Combined stream envelope: {"stream": "...", "data": {...}}
    if let (Some(stream), Some(data)) = (
        value.get("stream").and_then(Value::as_str),
        value.get("data"),
    ) {
        return parse_event(data, Some(stream))
            .map(Inbound::Message)
            .into_iter()
            .collect();
    }

    if value.get("e").is_some() {
        return parse_event(value, None)
            .map(Inbound::Message)
            .into_iter()
            .collect();
    }

    // {"code": -1121, "msg": "Invalid symbol."}
    if let Some(msg) = value.get("msg").and_then(Value::as_str) {
        let code = value.get("code").map(as_string).unwrap_or_default();
        return vec![Inbound::Message(NormalizedMessage::error(
            Some(PLATFORM),
            format!("{} (code {})", msg, code),
        ))];
    }

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let error = value
            .get("error")
            .filter(|e| !e.is_null())
            .map(|e| e.get("msg").map(as_string).unwrap_or_else(|| e.to_string()));
        return vec![Inbound::Response { id, error }];
    }

    Vec::new()
}

fn parse_event(data: &Value, stream: Option<&str>) -> Option<NormalizedMessage> {
    let event = data.get("e").and_then(Value::as_str).unwrap_or_default();
    match event {
        "kline" => parse_kline(data),
        "trade" => parse_trade(data),
        "24hrTicker" => parse_ticker(data),
        "depthUpdate" => {
            let book = order_book(false, levels(&data["b"]), levels(&data["a"]));
            Some(NormalizedMessage::new(
                MessageType::Orderbook,
                PLATFORM,
                as_string(&data["s"]),
                book,
            ))
        }
        "executionReport" => parse_execution_report(data),
        "outboundAccountPosition" => parse_account_position(data),
        "" if data.get("bids").is_some() => {
            // Partial book depth snapshots carry no event type or symbol.
            let symbol = stream.map(symbol_of).unwrap_or_default();
            let book = order_book(true, levels(&data["bids"]), levels(&data["asks"]));
            Some(NormalizedMessage::new(
                MessageType::Orderbook,
                PLATFORM,
                symbol,
                book,
            ))
        }
        other => {
            debug!(event = other, "Dropping unhandled Binance event");
            None
        }
    }
}

fn parse_kline(data: &Value) -> Option<NormalizedMessage> {
    let k = data.get("k")?;
    let kline = KlineData {
        time: as_i64(&k["t"]).unwrap_or(0),
        interval: k.get("i").and_then(Value::as_str).map(str::to_string),
        open: as_string(&k["o"]),
        close: as_string(&k["c"]),
        high: as_string(&k["h"]),
        low: as_string(&k["l"]),
        volume: as_string(&k["v"]),
        amount: as_string(&k["q"]),
    };
    let symbol = k
        .get("s")
        .or_else(|| data.get("s"))
        .map(as_string)
        .unwrap_or_default();
    Some(NormalizedMessage::new(
        MessageType::Kline,
        PLATFORM,
        symbol,
        kline,
    ))
}

fn parse_trade(data: &Value) -> Option<NormalizedMessage> {
    // `m` is true when the buyer was the maker, i.e. the taker sold.
    let side = if data["m"].as_bool().unwrap_or(false) {
        "SELL"
    } else {
        "BUY"
    };
    let trade = TradeData {
        id: as_string(&data["t"]),
        price: as_string(&data["p"]),
        amount: as_string(&data["q"]),
        side: side.to_string(),
        time: as_i64(&data["T"]).unwrap_or(0),
    };
    Some(NormalizedMessage::new(
        MessageType::Trades,
        PLATFORM,
        as_string(&data["s"]),
        vec![trade],
    ))
}

fn parse_ticker(data: &Value) -> Option<NormalizedMessage> {
    let state = StateData {
        last: as_string(&data["c"]),
        open: as_string(&data["o"]),
        high: as_string(&data["h"]),
        low: as_string(&data["l"]),
        volume: as_string(&data["v"]),
        amount: as_string(&data["q"]),
    };
    Some(NormalizedMessage::new(
        MessageType::State,
        PLATFORM,
        as_string(&data["s"]),
        state,
    ))
}

fn parse_execution_report(data: &Value) -> Option<NormalizedMessage> {
    let order = OrderData {
        order_id: as_string(&data["i"]),
        side: as_string(&data["S"]),
        order_type: as_string(&data["o"]),
        status: as_string(&data["X"]),
        price: as_string(&data["p"]),
        amount: as_string(&data["q"]),
        filled: as_string(&data["z"]),
        create_time: as_i64(&data["O"]).unwrap_or(0),
        update_time: as_i64(&data["T"])
            .or_else(|| as_i64(&data["E"]))
            .unwrap_or(0),
    };
    Some(NormalizedMessage::new(
        MessageType::Order,
        PLATFORM,
        as_string(&data["s"]),
        order,
    ))
}

fn parse_account_position(data: &Value) -> Option<NormalizedMessage> {
    let balances: AssetData = data["B"]
        .as_array()?
        .iter()
        .map(|b| {
            (
                as_string(&b["a"]),
                AssetBalance {
                    available: as_string(&b["f"]),
                    frozen: as_string(&b["l"]),
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn single(value: Value) -> NormalizedMessage {
        let mut out = parse_value(&value);
        assert_eq!(out.len(), 1, "expected one item from {}", value);
        match out.remove(0) {
            Inbound::Message(msg) => msg,
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_combined_kline() {
        let msg = single(json!({
            "stream": "btcusdt@kline_1m",
            "data": {
                "e": "kline", "E": 1700000060000u64, "s": "BTCUSDT",
                "k": {
                    "t": 1700000000000u64, "T": 1700000059999u64, "s": "BTCUSDT", "i": "1m",
                    "o": "100", "c": "105", "h": "106", "l": "99", "v": "10", "q": "1000",
                    "x": false
                }
            }
        }));
        assert_eq!(msg.kind, MessageType::Kline);
        assert_eq!(msg.symbol, "BTCUSDT");
        assert_eq!(msg.platform, "binance");
        assert_eq!(msg.data["open"], "100");
        assert_eq!(msg.data["close"], "105");
        assert_eq!(msg.data["amount"], "1000");
        assert_eq!(msg.data["time"], 1_700_000_000_000i64);
        assert_eq!(msg.data["interval"], "1m");
    }

    #[test]
    fn test_partial_depth_snapshot() {
        let msg = single(json!({
            "stream": "ethusdt@depth5@100ms",
            "data": {
                "lastUpdateId": 160,
                "bids": [["2000.10", "1.5"], ["2000.00", "2"]],
                "asks": [["2000.35", "0.4"]]
            }
        }));
        assert_eq!(msg.kind, MessageType::Orderbook);
        assert_eq!(msg.symbol, "ETHUSDT");
        assert_eq!(msg.data["snapshot"], true);
        assert_eq!(msg.data["bestBid"], json!(["2000.10", "1.5"]));
        assert_eq!(msg.data["bestAsk"], json!(["2000.35", "0.4"]));
        assert_eq!(msg.data["spread"], "0.25000000");
    }

    #[test]
    fn test_depth_update_is_delta() {
        let msg = single(json!({
            "e": "depthUpdate", "s": "BTCUSDT",
            "b": [["100", "1"]], "a": []
        }));
        assert_eq!(msg.data["snapshot"], false);
        assert!(msg.data.get("spread").is_none());
    }

    #[test]
    fn test_trade_side() {
        let msg = single(json!({
            "stream": "btcusdt@trade",
            "data": {"e": "trade", "s": "BTCUSDT", "t": 12345, "p": "101.5", "q": "0.2",
                     "T": 1700000000123u64, "m": true}
        }));
        assert_eq!(msg.kind, MessageType::Trades);
        assert_eq!(msg.data[0]["side"], "SELL");
        assert_eq!(msg.data[0]["id"], "12345");
        assert_eq!(msg.data[0]["time"], 1_700_000_000_123i64);
    }

    #[test]
    fn test_execution_report() {
        let msg = single(json!({
            "e": "executionReport", "E": 1700000000500u64, "s": "BTCUSDT",
            "S": "BUY", "o": "LIMIT", "X": "NEW", "i": 4293153,
            "p": "100.00", "q": "1.000", "z": "0.000",
            "O": 1700000000000u64, "T": 1700000000400u64
        }));
        assert_eq!(msg.kind, MessageType::Order);
        assert_eq!(msg.symbol, "BTCUSDT");
        assert_eq!(msg.data["orderId"], "4293153");
        assert_eq!(msg.data["side"], "BUY");
        assert_eq!(msg.data["orderType"], "LIMIT");
        assert_eq!(msg.data["createTime"], 1_700_000_000_000i64);
        assert_eq!(msg.data["updateTime"], 1_700_000_000_400i64);
    }

    #[test]
    fn test_account_position() {
        let msg = single(json!({
            "e": "outboundAccountPosition", "E": 1,
            "B": [{"a": "BTC", "f": "1.5", "l": "0.5"}, {"a": "USDT", "f": "10", "l": "0"}]
        }));
        assert_eq!(msg.kind, MessageType::Asset);
        assert_eq!(msg.data["BTC"]["available"], "1.5");
        assert_eq!(msg.data["BTC"]["frozen"], "0.5");
    }

    #[test]
    fn test_error_frame() {
        let msg = single(json!({"code": -1121, "msg": "Invalid symbol."}));
        assert_eq!(msg.kind, MessageType::Error);
        assert_eq!(msg.error.as_deref(), Some("Invalid symbol. (code -1121)"));
    }

    #[test]
    fn test_unknown_event_dropped() {
        assert!(parse_value(&json!({"e": "listStatus", "s": "BTCUSDT"})).is_empty());
        assert!(parse_value(&json!({"foo": "bar"})).is_empty());
    }
}
