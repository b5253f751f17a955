use exgate_core::{AdapterError, Endpoints, StreamType, SubscriptionKey};

/// Kline intervals accepted by the stream API.
pub const INTERVALS: [&str; 16] = [
    "1s", "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w",
    "1M",
];

/// Partial book depths accepted by the stream API.
pub const DEPTHS: [&str; 3] = ["5", "10", "20"];

pub const DEFAULT_INTERVAL: &str = "1m";
pub const DEFAULT_DEPTH: &str = "20";

pub fn format_key(
    stream: StreamType,
    symbol: &str,
    param: Option<&str>,
) -> Result<SubscriptionKey, AdapterError> {
    let symbol = symbol.trim().to_ascii_uppercase();
    let needs_symbol = !matches!(stream, StreamType::Asset | StreamType::Orders);
    if needs_symbol && symbol.is_empty() {
        return Err(AdapterError::InvalidSymbol(format!(
            "{} requires a symbol",
            stream
        )));
    }

    let param = match stream {
        StreamType::Kline => {
            let interval = param.unwrap_or(DEFAULT_INTERVAL);
            if !INTERVALS.contains(&interval) {
                return Err(AdapterError::InvalidInterval(interval.to_string()));
            }
            Some(interval.to_string())
        }
        StreamType::Orderbook => {
            let depth = param.unwrap_or(DEFAULT_DEPTH);
            if !DEPTHS.contains(&depth) {
                return Err(AdapterError::UnsupportedStream(format!(
                    "order book depth {}",
                    depth
                )));
            }
            Some(depth.to_string())
        }
        _ => None,
    };

    let symbol = if stream == StreamType::Asset {
        String::new()
    } else {
        symbol
    };
    Ok(SubscriptionKey::new(stream, symbol, param))
}

/// Stream name for a public key, e.g. `btcusdt@kline_1m`. Private keys have none.
pub fn stream_name(key: &SubscriptionKey) -> Option<String> {
    let symbol = key.symbol.to_ascii_lowercase();
    match key.stream {
        StreamType::Kline => Some(format!(
            "{}@kline_{}",
            symbol,
            key.param.as_deref().unwrap_or(DEFAULT_INTERVAL)
        )),
        StreamType::Orderbook => Some(format!(
            "{}@depth{}@100ms",
            symbol,
            key.param.as_deref().unwrap_or(DEFAULT_DEPTH)
        )),
        StreamType::Trades => Some(format!("{}@trade", symbol)),
        StreamType::State => Some(format!("{}@ticker", symbol)),
        StreamType::Orders | StreamType::Asset => None,
    }
}

/// Combined-stream URL carrying every active stream.
pub fn combined_url(endpoints: &Endpoints, streams: &[String]) -> String {
    format!(
        "{}/stream?streams={}",
        endpoints.ws_url.trim_end_matches('/'),
        streams.join("/")
    )
}

/// User-data stream URL for a listen key.
pub fn user_stream_url(endpoints: &Endpoints, listen_key: &str) -> String {
    format!("{}/ws/{}", endpoints.ws_url.trim_end_matches('/'), listen_key)
}

/// Upper-cased symbol prefix of a stream name.
pub fn symbol_of(stream: &str) -> String {
    stream
        .split('@')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use exgate_core::Platform;

    #[test]
    fn test_format_key_defaults() {
        let key = format_key(StreamType::Kline, " btcusdt ", None).unwrap();
        assert_eq!(key.to_string(), "kline:BTCUSDT:1m");

        let key = format_key(StreamType::Orderbook, "ethusdt", None).unwrap();
        assert_eq!(key.to_string(), "orderbook:ETHUSDT:20");

        let key = format_key(StreamType::Asset, "ignored", None).unwrap();
        assert_eq!(key.to_string(), "asset");
    }

    #[test]
    fn test_format_key_rejects() {
        assert!(matches!(
            format_key(StreamType::Kline, "BTCUSDT", Some("7m")),
            Err(AdapterError::InvalidInterval(_))
        ));
        assert!(format_key(StreamType::Orderbook, "BTCUSDT", Some("50")).is_err());
        assert!(format_key(StreamType::Trades, "", None).is_err());
    }

    #[test]
    fn test_stream_names_and_url() {
        let kline = format_key(StreamType::Kline, "BTCUSDT", Some("5m")).unwrap();
        let book = format_key(StreamType::Orderbook, "BTCUSDT", Some("10")).unwrap();
        let orders = format_key(StreamType::Orders, "BTCUSDT", None).unwrap();

        let names: Vec<String> = [&kline, &book, &orders]
            .iter()
            .filter_map(|k| stream_name(k))
            .collect();
        assert_eq!(names, vec!["btcusdt@kline_5m", "btcusdt@depth10@100ms"]);

        let endpoints = Platform::Binance.default_endpoints(false);
        assert_eq!(
            combined_url(&endpoints, &names),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@kline_5m/btcusdt@depth10@100ms"
        );
        assert_eq!(
            user_stream_url(&endpoints, "abc"),
            "wss://stream.binance.com:9443/ws/abc"
        );
        assert_eq!(symbol_of("btcusdt@depth20@100ms"), "BTCUSDT");
    }
}
