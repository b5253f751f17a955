use exgate_core::{OrderBookData, PriceLevel};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Top-of-book figures derived from raw level arrays.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BookSummary {
    pub best_bid: Option<PriceLevel>,
    pub best_ask: Option<PriceLevel>,
    /// `best_ask - best_bid` with 8 decimal places.
    pub spread: Option<String>,
}

/// Compute best bid/ask and spread.
///
/// Levels arrive best-first from every supported exchange, so the first
/// entry of each side is the top of book. The spread is absent when either
/// side is empty or a price does not parse.
pub fn summarize_book(bids: &[PriceLevel], asks: &[PriceLevel]) -> BookSummary {
    let best_bid = bids.first().cloned();
    let best_ask = asks.first().cloned();

    let spread = match (&best_bid, &best_ask) {
        (Some(bid), Some(ask)) => {
            match (Decimal::from_str(&bid[0]), Decimal::from_str(&ask[0])) {
                (Ok(bid), Ok(ask)) => {
                    let mut spread = (ask - bid).round_dp(8);
                    spread.rescale(8);
                    Some(spread.to_string())
                }
                _ => None,
            }
        }
        _ => None,
    };

    BookSummary {
        best_bid,
        best_ask,
        spread,
    }
}

/// Assemble an order-book payload, filling in the top-of-book summary.
pub fn order_book(snapshot: bool, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> OrderBookData {
    let summary = summarize_book(&bids, &asks);
    OrderBookData {
        snapshot,
        bids,
        asks,
        best_bid: summary.best_bid,
        best_ask: summary.best_ask,
        spread: summary.spread,
    }
}
