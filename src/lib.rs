pub mod candle;
pub mod constants;
pub mod data;
pub mod error;
pub mod history;
pub mod normalize;
pub mod types;
pub mod utils;

#[cfg(test)]
mod test_fixtures;
