//! Trend/exhaustion scorer: continuous scores derived from closed
//! footprint bars, blended with the live tape aggregate.
//!
//! The emitted field set is the contract; the weights are tunable
//! configuration. Heuristics: delta imbalance (signed aggressor dominance
//! per bar), absorption (delta near zero on above-average volume), and
//! exhaustion (a strongly imbalanced bar followed by a flip).

use crate::worker::{Worker, WorkerCtx};
use async_trait::async_trait;
use common::config::TrendWeights;
use common::schema::{
    ExhaustionScore, FootprintBar, Instrument, RuleReversal, StreamRecord, TapeAggregate,
    TrendScore,
};
use common::streams;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::VecDeque;

/// Impulses summed into trend power.
const POWER_WINDOW: usize = 10;
/// Bars kept for the rolling volume average.
const VOLUME_WINDOW: usize = 20;
/// |imbalance| above this marks a bar as strongly directional.
const STRONG_IMBALANCE: f64 = 0.6;
/// Bars ahead the reversal signal speaks about.
const REVERSAL_HORIZON_BARS: u32 = 3;

#[derive(Debug, Clone, Copy)]
struct BarStats {
    imbalance: f64,
    volume: f64,
}

/// Per-bar score computation, pure for tests.
#[derive(Debug, Default)]
pub struct Scorer {
    history: VecDeque<BarStats>,
    impulses: VecDeque<f64>,
    last_power: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct BarScores {
    pub delta_imbalance: f64,
    pub absorption: f64,
    pub exhaustion: f64,
    pub score_impulse: f64,
    pub trend_power: f64,
    pub trend_power_delta: f64,
}

impl Scorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one closed bar (optionally blended with the tape's 1m window)
    /// into the score series.
    pub fn score_bar(
        &mut self,
        bar: &FootprintBar,
        tape_imbalance: Option<f64>,
        weights: &TrendWeights,
    ) -> BarScores {
        let volume: f64 = bar
            .levels
            .iter()
            .map(|l| (l.vol_bid + l.vol_ask).to_f64().unwrap_or(0.0))
            .sum();
        let delta: f64 = bar
            .levels
            .iter()
            .map(|l| l.delta.to_f64().unwrap_or(0.0))
            .sum();
        let bar_imbalance = if volume > 0.0 { delta / volume } else { 0.0 };
        let delta_imbalance = match tape_imbalance {
            Some(tape) => 0.5 * (bar_imbalance + tape),
            None => bar_imbalance,
        };

        let avg_volume = if self.history.is_empty() {
            volume
        } else {
            self.history.iter().map(|b| b.volume).sum::<f64>() / self.history.len() as f64
        };

        // Absorption: heavy volume that moved the needle very little.
        let absorption = if volume > 0.0 && avg_volume > 0.0 && volume >= avg_volume {
            (1.0 - delta_imbalance.abs()).clamp(0.0, 1.0)
        } else {
            0.0
        };

        // Exhaustion: a strong push whose follow-through flips or fades.
        let prev = self.history.back().copied();
        let exhaustion = match prev {
            Some(prev)
                if prev.imbalance.abs() >= STRONG_IMBALANCE
                    && prev.imbalance.signum() != delta_imbalance.signum() =>
            {
                (prev.imbalance.abs() - delta_imbalance.abs()).clamp(0.0, 1.0)
            }
            _ => 0.0,
        };

        let prev_sign = prev.map(|p| p.imbalance.signum()).unwrap_or(0.0);
        let score_impulse = 100.0
            * (weights.delta * delta_imbalance * (1.0 - weights.absorption * absorption)
                - weights.exhaustion * exhaustion * prev_sign);

        self.impulses.push_back(score_impulse);
        while self.impulses.len() > POWER_WINDOW {
            self.impulses.pop_front();
        }
        let trend_power: f64 = self.impulses.iter().sum();
        let trend_power_delta = trend_power - self.last_power;
        self.last_power = trend_power;

        self.history.push_back(BarStats {
            imbalance: delta_imbalance,
            volume,
        });
        while self.history.len() > VOLUME_WINDOW {
            self.history.pop_front();
        }

        BarScores {
            delta_imbalance,
            absorption,
            exhaustion,
            score_impulse,
            trend_power,
            trend_power_delta,
        }
    }
}

pub struct TrendWorker {
    instrument: Instrument,
    scorer: Scorer,
}

impl TrendWorker {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            scorer: Scorer::new(),
        }
    }
}

#[async_trait]
impl Worker for TrendWorker {
    fn kind(&self) -> &'static str {
        "trend"
    }

    fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn streams(&self) -> Vec<String> {
        vec![streams::footprint(
            self.instrument.exchange,
            &self.instrument.symbol,
        )]
    }

    async fn on_record(&mut self, ctx: &WorkerCtx, record: &StreamRecord) -> anyhow::Result<()> {
        let bar = match record {
            StreamRecord::FootprintBar(bar) => bar,
            _ => return Ok(()),
        };
        let (ex, sym) = (self.instrument.exchange, self.instrument.symbol.as_str());

        let tape: Option<TapeAggregate> = ctx.broker.kv_get(&streams::tape(ex, sym)).await?;
        let tape_imbalance = tape.and_then(|t| {
            let w = t.windows.get("1m")?;
            let total = w.buy_vol + w.sell_vol;
            if total > Decimal::ZERO {
                (w.delta / total).to_f64()
            } else {
                None
            }
        });

        let scores = self
            .scorer
            .score_bar(bar, tape_imbalance, &ctx.config.trend_weights);
        let ts = bar.end;

        ctx.emit(
            &streams::scores_trend(ex, sym),
            &StreamRecord::TrendScore(TrendScore {
                exchange: ex,
                symbol: sym.to_string(),
                ts,
                delta_imbalance: scores.delta_imbalance,
                absorption: scores.absorption,
                score_impulse: scores.score_impulse,
                trend_power: scores.trend_power,
                trend_power_delta: scores.trend_power_delta,
            }),
            streams::SCORES_MAXLEN,
        )
        .await?;

        ctx.emit(
            &streams::scores_exhaustion(ex, sym),
            &StreamRecord::ExhaustionScore(ExhaustionScore {
                exchange: ex,
                symbol: sym.to_string(),
                ts,
                exhaustion_score: scores.exhaustion,
                absorption_score: scores.absorption,
            }),
            streams::SCORES_MAXLEN,
        )
        .await?;

        // Price span of the bar bounds the expected move.
        let (low, high) = bar
            .levels
            .iter()
            .fold((None::<Decimal>, None::<Decimal>), |(lo, hi), l| {
                (
                    Some(lo.map_or(l.price, |v| v.min(l.price))),
                    Some(hi.map_or(l.price, |v| v.max(l.price))),
                )
            });
        let prob = (0.6 * scores.exhaustion + 0.4 * scores.absorption).clamp(0.0, 1.0);
        ctx.emit(
            &streams::signals_rule_reversal(ex, sym),
            &StreamRecord::RuleReversal(RuleReversal {
                exchange: ex,
                symbol: sym.to_string(),
                ts,
                prob_reversal_rule: prob,
                reversal_horizon_bars: REVERSAL_HORIZON_BARS,
                expected_move_range: [low.unwrap_or_default(), high.unwrap_or_default()],
            }),
            streams::SCORES_MAXLEN,
        )
        .await?;

        Ok(())
    }
}
