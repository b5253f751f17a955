//! Helpers shared by the exchange adapters.

pub mod book;
pub mod codec;
pub mod fields;

pub use book::{order_book, summarize_book, BookSummary};
pub use codec::{hex_lower, inflate_raw, sha256_hex};
pub use fields::{as_i64, as_string, is_zero_amount, levels, secs_to_millis};
