//! Millisecond Bar Synthesis
//!
//! Fixed-width time bucketing over an unbounded trade stream. One bucket is
//! open per wanted `(symbol, interval)`; a bar is emitted only when a trade
//! lands in a strictly newer bucket. Nothing here looks at the wall clock.
//!
//! Trades whose bucket key is older than the open bucket are folded into the
//! open bucket and counted as late; emitted bars are never revised.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

use rust_decimal::Decimal;

use crate::domain::streaming::{SYNTHESIZED_BAR_MARKER, SynthesizedBar, Trade};
use crate::domain::subscription::ANY_SYMBOL;

/// Bucket key of a timestamp: `floor(timestamp / interval)`.
#[must_use]
pub fn bucket_key(timestamp: i64, interval: u64) -> i64 {
    let width = i64::try_from(interval.max(1)).unwrap_or(i64::MAX);
    timestamp.div_euclid(width)
}

fn bucket_start(key: i64, interval: u64) -> i64 {
    let width = i64::try_from(interval.max(1)).unwrap_or(i64::MAX);
    key.saturating_mul(width)
}

// =============================================================================
// Interest
// =============================================================================

/// Which `(symbol, interval)` pairs downstream sessions currently want.
///
/// A symbol of `*` applies its intervals to every symbol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarInterest {
    by_symbol: HashMap<String, BTreeSet<u64>>,
}

impl BarInterest {
    /// Create an empty interest set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record interest in bars of `interval` ms for `symbol`. Zero is ignored.
    pub fn insert(&mut self, symbol: impl Into<String>, interval: u64) {
        if interval == 0 {
            return;
        }
        self.by_symbol.entry(symbol.into()).or_default().insert(interval);
    }

    /// Whether bars of `interval` are wanted for `symbol`.
    #[must_use]
    pub fn wants(&self, symbol: &str, interval: u64) -> bool {
        [symbol, ANY_SYMBOL].iter().any(|s| {
            self.by_symbol
                .get(*s)
                .is_some_and(|intervals| intervals.contains(&interval))
        })
    }

    /// Intervals wanted for `symbol`, ascending and de-duplicated.
    #[must_use]
    pub fn intervals_for(&self, symbol: &str) -> BTreeSet<u64> {
        let mut intervals = self.by_symbol.get(symbol).cloned().unwrap_or_default();
        if symbol != ANY_SYMBOL
            && let Some(any) = self.by_symbol.get(ANY_SYMBOL)
        {
            intervals.extend(any);
        }
        intervals
    }

    /// Whether nothing is wanted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }

    /// Number of `(symbol, interval)` pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_symbol.values().map(BTreeSet::len).sum()
    }
}

impl<'a> FromIterator<(&'a str, u64)> for BarInterest {
    fn from_iter<I: IntoIterator<Item = (&'a str, u64)>>(iter: I) -> Self {
        let mut interest = Self::new();
        for (symbol, interval) in iter {
            interest.insert(symbol, interval);
        }
        interest
    }
}

// =============================================================================
// Bucket
// =============================================================================

/// One in-progress bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationBucket {
    interval: u64,
    key: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: u64,
    trade_count: u64,
}

impl AggregationBucket {
    fn seed(interval: u64, key: i64, trade: &Trade) -> Self {
        Self {
            interval,
            key,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.size,
            trade_count: 1,
        }
    }

    fn apply(&mut self, trade: &Trade) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.volume = self.volume.saturating_add(trade.size);
        self.trade_count += 1;
    }

    /// Bucket key (`floor(start / interval)`).
    #[must_use]
    pub const fn key(&self) -> i64 {
        self.key
    }

    /// Window start in epoch milliseconds.
    #[must_use]
    pub fn start(&self) -> i64 {
        bucket_start(self.key, self.interval)
    }

    /// Exclusive window end in epoch milliseconds.
    #[must_use]
    pub fn end(&self) -> i64 {
        let width = i64::try_from(self.interval).unwrap_or(i64::MAX);
        self.start().saturating_add(width)
    }

    /// Cumulative volume.
    #[must_use]
    pub const fn volume(&self) -> u64 {
        self.volume
    }

    /// Trades folded in so far.
    #[must_use]
    pub const fn trade_count(&self) -> u64 {
        self.trade_count
    }

    /// Snapshot the bucket as a bar for `symbol`.
    #[must_use]
    pub fn to_bar(&self, symbol: &str) -> SynthesizedBar {
        SynthesizedBar {
            marker: SYNTHESIZED_BAR_MARKER.to_string(),
            interval: self.interval,
            symbol: symbol.to_string(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            trade_count: self.trade_count,
            start: self.start(),
            end: self.end(),
        }
    }
}

// =============================================================================
// Aggregator
// =============================================================================

/// Bars closed by one trade plus late-trade bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TradeOutcome {
    /// Bars completed by this trade, one per interval at most.
    pub bars: Vec<SynthesizedBar>,
    /// Intervals for which the trade was older than the open bucket.
    pub late: u32,
}

/// Bucket arena keyed by `(symbol, interval)`.
#[derive(Debug, Default)]
pub struct BarAggregator {
    interest: BarInterest,
    buckets: HashMap<String, HashMap<u64, AggregationBucket>>,
}

impl BarAggregator {
    /// Create an aggregator with no interest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the wanted pairs, dropping buckets nobody wants anymore.
    ///
    /// Dropped buckets are discarded without being emitted.
    pub fn set_interest(&mut self, interest: BarInterest) {
        self.buckets.retain(|symbol, per_interval| {
            per_interval.retain(|interval, _| interest.wants(symbol, *interval));
            !per_interval.is_empty()
        });
        self.interest = interest;
    }

    /// Current interest.
    #[must_use]
    pub const fn interest(&self) -> &BarInterest {
        &self.interest
    }

    /// Fold one trade into every wanted bucket for its symbol.
    pub fn on_trade(&mut self, trade: &Trade) -> TradeOutcome {
        let mut outcome = TradeOutcome::default();

        let intervals = self.interest.intervals_for(&trade.symbol);
        if intervals.is_empty() {
            return outcome;
        }

        if !self.buckets.contains_key(trade.symbol.as_str()) {
            self.buckets.insert(trade.symbol.clone(), HashMap::new());
        }
        let Some(per_interval) = self.buckets.get_mut(trade.symbol.as_str()) else {
            return outcome;
        };

        for interval in intervals {
            let key = bucket_key(trade.timestamp, interval);
            match per_interval.entry(interval) {
                Entry::Vacant(slot) => {
                    slot.insert(AggregationBucket::seed(interval, key, trade));
                }
                Entry::Occupied(slot) => {
                    let bucket = slot.into_mut();
                    if key > bucket.key {
                        outcome.bars.push(bucket.to_bar(&trade.symbol));
                        *bucket = AggregationBucket::seed(interval, key, trade);
                    } else {
                        if key < bucket.key {
                            outcome.late += 1;
                        }
                        bucket.apply(trade);
                    }
                }
            }
        }

        outcome
    }

    /// Open bucket for a pair, if any.
    #[must_use]
    pub fn bucket(&self, symbol: &str, interval: u64) -> Option<&AggregationBucket> {
        self.buckets.get(symbol).and_then(|b| b.get(&interval))
    }

    /// Number of open buckets.
    #[must_use]
    pub fn open_buckets(&self) -> usize {
        self.buckets.values().map(HashMap::len).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================
