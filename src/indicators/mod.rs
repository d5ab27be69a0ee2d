// Indicator math consumed by target migration and trailing stops
pub mod atr;
pub mod moving_average;

pub use atr::{calculate_atr, calculate_atr_series};
pub use moving_average::{calculate_ema, calculate_sma};
