use serde::{Deserialize, Serialize};

/// What happens to the stop when a progressive target is confirmed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    /// Stop moves to the entry price
    Breakeven,
    /// Stop moves just inside the last confirmed target
    PreviousTarget,
    /// Stop follows the trailing-stop calculation
    Trailing,
}

/// Risk and behavior configuration for one account.
///
/// Every field falls back to its default when absent from the loaded
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    /// Percent of balance risked per trade
    pub account_risk_percent: f64,
    pub max_concurrent_trades: usize,
    pub allow_mixed_directions: bool,
    /// Cap on position value as percent of balance
    pub max_position_size_percent: f64,
    pub use_trailing_stop: bool,
    pub trailing_stop_atr_multiple: f64,
    /// Fallback trailing distance when no ATR series is available
    pub trailing_stop_min_distance_percent: f64,
    /// Default target multiple of the entry risk
    pub reward_risk_ratio: f64,
    pub use_progressive_targeting: bool,
    pub target_hit_stop_policy: StopPolicy,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            account_risk_percent: 1.0,
            max_concurrent_trades: 3,
            allow_mixed_directions: false,
            max_position_size_percent: 20.0,
            use_trailing_stop: true,
            trailing_stop_atr_multiple: 2.0,
            trailing_stop_min_distance_percent: 1.5,
            reward_risk_ratio: 2.0,
            use_progressive_targeting: true,
            target_hit_stop_policy: StopPolicy::Breakeven,
        }
    }
}

impl RiskSettings {
    /// Fraction of balance risked for a signal with the given risk factor
    pub fn risk_fraction(&self, risk_factor: f64) -> f64 {
        (self.account_risk_percent / 100.0) * risk_factor.clamp(0.0, 1.0)
    }

    /// Maximum position value for the given balance
    pub fn max_position_value(&self, balance: f64) -> f64 {
        balance * self.max_position_size_percent / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let settings = RiskSettings::default();
        assert!(settings.account_risk_percent > 0.0);
        assert!(settings.max_concurrent_trades > 0);
        assert!(settings.reward_risk_ratio >= 1.0);
        assert_eq!(settings.target_hit_stop_policy, StopPolicy::Breakeven);
    }

    #[test]
    fn test_risk_fraction_clamps_factor() {
        let settings = RiskSettings::default();
        assert_eq!(settings.risk_fraction(1.0), 0.01);
        assert_eq!(settings.risk_fraction(0.5), 0.005);
        // Out-of-range factors are clamped, not rejected
        assert_eq!(settings.risk_fraction(2.0), 0.01);
        assert_eq!(settings.risk_fraction(-1.0), 0.0);
    }

    #[test]
    fn test_max_position_value() {
        let settings = RiskSettings::default();
        assert_eq!(settings.max_position_value(10000.0), 2000.0);
    }

    #[test]
    fn test_stop_policy_serde() {
        let json = serde_json::to_string(&StopPolicy::PreviousTarget).unwrap();
        assert_eq!(json, "\"previous_target\"");
        let policy: StopPolicy = serde_json::from_str("\"breakeven\"").unwrap();
        assert_eq!(policy, StopPolicy::Breakeven);
    }
}
