pub mod candle;
pub mod types;
