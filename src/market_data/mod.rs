pub mod cache;

pub use cache::{MarketDataCache, SeriesKey};
