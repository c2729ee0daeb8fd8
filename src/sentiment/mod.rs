//! Sentiment Modulator: composes weighted signal components into a single
//! score that gates and sizes order placement. Grounded in this codebase's
//! existing composite-confidence pattern (weighted average over present
//! signals, missing components dropped from both sides of the ratio).

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Raw component inputs available for a symbol at a point in time. Any field
/// left `None` drops out of both the numerator and denominator of the
/// weighted average - never silently treated as neutral.
#[derive(Debug, Clone, Default)]
pub struct SentimentSnapshot {
    pub fear_greed: Option<f64>,
    pub news: Option<f64>,
    pub ai_analysis: Option<f64>,
    pub on_chain: Option<f64>,
    pub candlestick_pattern: Option<f64>,
    pub neural_net: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Modulation {
    pub score: f64,
    pub skip_buys: bool,
    pub skip_sells: bool,
    pub size_multiplier: f64,
    pub dip_buyer_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulationResult {
    pub modulation: Modulation,
    pub recommendation: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ModulatorThresholds {
    pub skip_buys_at: Decimal,
    pub skip_sells_at: Decimal,
}

impl Default for ModulatorThresholds {
    fn default() -> Self {
        Self { skip_buys_at: Decimal::new(75, 0), skip_sells_at: Decimal::new(25, 0) }
    }
}

#[async_trait]
pub trait SentimentModulator: Send + Sync {
    async fn modulate(&self, symbol: &str, snapshot: &SentimentSnapshot) -> ModulationResult;
}

/// Component weights, summing to 1.0 across whichever components are present
/// for a given snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ComponentWeights {
    pub fear_greed: f64,
    pub news: f64,
    pub ai_analysis: f64,
    pub on_chain: f64,
    pub candlestick_pattern: f64,
    pub neural_net: f64,
}

impl Default for ComponentWeights {
    fn default() -> Self {
        Self { fear_greed: 0.30, news: 0.25, ai_analysis: 0.20, on_chain: 0.15, candlestick_pattern: 0.05, neural_net: 0.05 }
    }
}

pub struct WeightedAverageModulator {
    weights: ComponentWeights,
    thresholds: ModulatorThresholds,
}

impl WeightedAverageModulator {
    pub fn new(weights: ComponentWeights, thresholds: ModulatorThresholds) -> Self {
        Self { weights, thresholds }
    }

    fn compose_score(&self, snapshot: &SentimentSnapshot) -> f64 {
        let components: [(Option<f64>, f64); 6] = [
            (snapshot.fear_greed, self.weights.fear_greed),
            (snapshot.news, self.weights.news),
            (snapshot.ai_analysis, self.weights.ai_analysis),
            (snapshot.on_chain, self.weights.on_chain),
            (snapshot.candlestick_pattern, self.weights.candlestick_pattern),
            (snapshot.neural_net, self.weights.neural_net),
        ];

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (value, weight) in components {
            if let Some(v) = value {
                numerator += v * weight;
                denominator += weight;
            }
        }
        if denominator <= 0.0 {
            50.0
        } else {
            (numerator / denominator).clamp(0.0, 100.0)
        }
    }

    fn size_multiplier(score: f64) -> f64 {
        if score <= 25.0 {
            1.4
        } else if score <= 40.0 {
            1.2
        } else if score <= 50.0 {
            1.1
        } else if score <= 55.0 {
            1.0
        } else if score <= 65.0 {
            0.9
        } else if score <= 75.0 {
            0.6
        } else {
            0.5
        }
    }

    fn dip_buyer_multiplier(score: f64) -> f64 {
        // Mirrors size_multiplier's shape but with a wider range: deep fear
        // should invite a larger dip-buy than a plain grid refill would.
        if score <= 25.0 {
            2.0
        } else if score <= 50.0 {
            1.3
        } else if score <= 75.0 {
            0.7
        } else {
            0.25
        }
    }
}

#[async_trait]
impl SentimentModulator for WeightedAverageModulator {
    async fn modulate(&self, symbol: &str, snapshot: &SentimentSnapshot) -> ModulationResult {
        let score = self.compose_score(snapshot);
        let score_dec = Decimal::try_from(score).unwrap_or_default();
        let skip_buys = score_dec >= self.thresholds.skip_buys_at;
        let skip_sells = score_dec <= self.thresholds.skip_sells_at;

        let modulation = Modulation {
            score,
            skip_buys,
            skip_sells,
            size_multiplier: Self::size_multiplier(score),
            dip_buyer_multiplier: Self::dip_buyer_multiplier(score),
        };

        let recommendation = if skip_buys {
            format!("{symbol}: sentiment extended ({score:.1}); skipping new buys")
        } else if skip_sells {
            format!("{symbol}: sentiment depressed ({score:.1}); skipping new sells")
        } else {
            format!("{symbol}: sentiment neutral ({score:.1}); sizing at {:.2}x", modulation.size_multiplier)
        };

        ModulationResult { modulation, recommendation }
    }
}

/// Supplies the raw snapshot a modulator composes into a score. The actual
/// fear/greed, news, and LLM fetchers are external collaborators outside this
/// crate's scope; this trait is the seam the Grid Engine calls through, so a
/// concrete feed can be plugged in without touching engine code.
#[async_trait]
pub trait SentimentSource: Send + Sync {
    async fn snapshot(&self, symbol: &str) -> SentimentSnapshot;
}

/// Default source when no sentiment feeds are configured: always neutral.
pub struct NoSentimentSource;

#[async_trait]
impl SentimentSource for NoSentimentSource {
    async fn snapshot(&self, _symbol: &str) -> SentimentSnapshot {
        SentimentSnapshot::default()
    }
}

/// Pass-through modulator used when no sentiment sources are configured.
pub struct DisabledModulator;

#[async_trait]
impl SentimentModulator for DisabledModulator {
    async fn modulate(&self, symbol: &str, _snapshot: &SentimentSnapshot) -> ModulationResult {
        ModulationResult {
            modulation: Modulation { score: 50.0, skip_buys: false, skip_sells: false, size_multiplier: 1.0, dip_buyer_multiplier: 1.0 },
            recommendation: format!("{symbol}: sentiment disabled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_modulator_is_pure_pass_through() {
        let result = DisabledModulator.modulate("BTC/USD", &SentimentSnapshot::default()).await;
        assert_eq!(result.modulation.score, 50.0);
        assert!(!result.modulation.skip_buys);
        assert!(!result.modulation.skip_sells);
        assert_eq!(result.modulation.size_multiplier, 1.0);
    }

    #[tokio::test]
    async fn missing_components_drop_from_both_sides_of_the_average() {
        let modulator = WeightedAverageModulator::new(ComponentWeights::default(), ModulatorThresholds::default());
        let only_fear_greed = SentimentSnapshot { fear_greed: Some(80.0), ..Default::default() };
        let result = modulator.modulate("BTC/USD", &only_fear_greed).await;
        assert!((result.modulation.score - 80.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn high_score_skips_buys_not_sells() {
        let modulator = WeightedAverageModulator::new(ComponentWeights::default(), ModulatorThresholds::default());
        let snapshot = SentimentSnapshot { fear_greed: Some(90.0), news: Some(85.0), ..Default::default() };
        let result = modulator.modulate("BTC/USD", &snapshot).await;
        assert!(result.modulation.skip_buys);
        assert!(!result.modulation.skip_sells);
    }

    #[tokio::test]
    async fn low_score_skips_sells_not_buys() {
        let modulator = WeightedAverageModulator::new(ComponentWeights::default(), ModulatorThresholds::default());
        let snapshot = SentimentSnapshot { fear_greed: Some(10.0), news: Some(15.0), ..Default::default() };
        let result = modulator.modulate("BTC/USD", &snapshot).await;
        assert!(result.modulation.skip_sells);
        assert!(!result.modulation.skip_buys);
    }

    #[test]
    fn sizing_table_matches_score_bands() {
        assert_eq!(WeightedAverageModulator::size_multiplier(10.0), 1.4);
        assert_eq!(WeightedAverageModulator::size_multiplier(35.0), 1.2);
        assert_eq!(WeightedAverageModulator::size_multiplier(45.0), 1.1);
        assert_eq!(WeightedAverageModulator::size_multiplier(52.0), 1.0);
        assert_eq!(WeightedAverageModulator::size_multiplier(60.0), 0.9);
        assert_eq!(WeightedAverageModulator::size_multiplier(70.0), 0.6);
        assert_eq!(WeightedAverageModulator::size_multiplier(90.0), 0.5);
    }
}
