//! Subscription Management Types
//!
//! Domain types for tracking client subscriptions to market data streams.
//!
//! # Design
//!
//! The registry tracks:
//! - Which sessions hold each spec, indexed by `(class, symbol)` so routing
//!   an envelope costs O(matching sessions)
//! - Which specs each session holds, for cleanup on disconnect
//! - The minimal upstream subscription strings for the non-bar and bar links
//!
//! Every mutation recomputes the upstream strings and reports only the
//! strings that changed, so callers resubscribe upstream exactly when needed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::domain::streaming::{EventClass, RoutingKey};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a client session.
pub type SessionId = u64;

/// Symbol placeholder meaning "every symbol of this class".
pub const ANY_SYMBOL: &str = "*";

/// A parsed `(event-class, symbol)` subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionSpec {
    class: EventClass,
    symbol: String,
}

impl SubscriptionSpec {
    /// Create a spec for a class and symbol.
    #[must_use]
    pub fn new(class: EventClass, symbol: impl Into<String>) -> Self {
        if class == EventClass::Wildcard {
            return Self::wildcard();
        }
        Self {
            class,
            symbol: symbol.into(),
        }
    }

    /// The global wildcard spec (`*`).
    #[must_use]
    pub fn wildcard() -> Self {
        Self {
            class: EventClass::Wildcard,
            symbol: ANY_SYMBOL.to_string(),
        }
    }

    /// Event class of this spec.
    #[must_use]
    pub const fn class(&self) -> EventClass {
        self.class
    }

    /// Symbol of this spec (`*` for wildcards).
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Whether the spec is served by the bar upstream.
    #[must_use]
    pub const fn is_bar(&self) -> bool {
        self.class.is_bar()
    }

    /// Whether this is the global wildcard.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.class == EventClass::Wildcard
    }
}

impl fmt::Display for SubscriptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            f.write_str(ANY_SYMBOL)
        } else {
            write!(f, "{}.{}", self.class, self.symbol)
        }
    }
}

/// Reasons a single subscription spec is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecParseError {
    /// Spec was empty after trimming.
    #[error("empty subscription spec")]
    Empty,

    /// No `.` separating class and symbol.
    #[error("missing symbol in '{0}'")]
    MissingSymbol(String),

    /// Class prefix is not a known event class.
    #[error("unknown event class '{0}'")]
    UnknownClass(String),

    /// Millisecond interval of zero.
    #[error("millisecond interval must be positive")]
    ZeroInterval,

    /// Symbol contains characters that cannot appear in a spec list.
    #[error("invalid symbol '{0}'")]
    InvalidSymbol(String),
}

impl FromStr for SubscriptionSpec {
    type Err = SpecParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SpecParseError::Empty);
        }
        if raw == ANY_SYMBOL {
            return Ok(Self::wildcard());
        }

        let (prefix, symbol) = raw
            .split_once('.')
            .ok_or_else(|| SpecParseError::MissingSymbol(raw.to_string()))?;

        let class = parse_class(prefix)?;

        if symbol.is_empty() {
            return Err(SpecParseError::MissingSymbol(raw.to_string()));
        }
        if symbol.chars().any(|c| c.is_whitespace() || c == ',') {
            return Err(SpecParseError::InvalidSymbol(symbol.to_string()));
        }

        Ok(Self::new(class, symbol))
    }
}

fn parse_class(prefix: &str) -> Result<EventClass, SpecParseError> {
    if let Some(class) = EventClass::from_vendor_code(prefix) {
        return Ok(class);
    }

    let digits = prefix
        .strip_suffix("Ms")
        .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| SpecParseError::UnknownClass(prefix.to_string()))?;

    let interval: u64 = digits
        .parse()
        .map_err(|_| SpecParseError::UnknownClass(prefix.to_string()))?;

    if interval == 0 {
        return Err(SpecParseError::ZeroInterval);
    }

    Ok(EventClass::MillisecondBar(interval))
}

/// Result of parsing a comma-separated spec list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSpecs {
    /// Valid specs, de-duplicated, in request order.
    pub accepted: Vec<SubscriptionSpec>,
    /// Rejected entries with the reason each was skipped.
    pub rejected: Vec<(String, SpecParseError)>,
}

impl ParsedSpecs {
    /// Accepted specs joined back into canonical wire form.
    #[must_use]
    pub fn accepted_params(&self) -> String {
        join_specs(&self.accepted)
    }
}

/// Parse a comma-separated list of specs, skipping invalid entries.
///
/// Blank entries (including an empty list) are ignored without being
/// reported as rejected.
#[must_use]
pub fn parse_spec_list(params: &str) -> ParsedSpecs {
    let mut parsed = ParsedSpecs::default();
    let mut seen = HashSet::new();

    for raw in params.split(',') {
        if raw.trim().is_empty() {
            continue;
        }
        match raw.parse::<SubscriptionSpec>() {
            Ok(spec) => {
                if seen.insert(spec.clone()) {
                    parsed.accepted.push(spec);
                }
            }
            Err(e) => parsed.rejected.push((raw.trim().to_string(), e)),
        }
    }

    parsed
}

/// Join specs into the comma-separated wire form.
#[must_use]
pub fn join_specs(specs: &[SubscriptionSpec]) -> String {
    specs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// Upstream Subscriptions
// =============================================================================

/// Minimal subscription sets each upstream link must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamSubscriptions {
    /// Specs requested from the ticks upstream.
    pub non_bar: BTreeSet<String>,
    /// Specs requested from the bars upstream.
    pub bar: BTreeSet<String>,
}

impl UpstreamSubscriptions {
    /// Non-bar subscription string.
    #[must_use]
    pub fn non_bar_params(&self) -> String {
        join_set(&self.non_bar)
    }

    /// Bar subscription string.
    #[must_use]
    pub fn bar_params(&self) -> String {
        join_set(&self.bar)
    }
}

/// Join a spec set into the comma-separated wire form.
#[must_use]
pub fn join_set(specs: &BTreeSet<String>) -> String {
    specs.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// Upstream strings that changed after a registry mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// New non-bar set, if it changed.
    pub non_bar: Option<BTreeSet<String>>,
    /// New bar set, if it changed.
    pub bar: Option<BTreeSet<String>>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.non_bar.is_none() && self.bar.is_none()
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Single source of truth for which session wants which envelopes.
///
/// The registry itself is not synchronized; owners wrap it in a lock so a
/// mutation and the resulting upstream resubscribe happen atomically.
///
/// # Example
///
/// ```rust
/// use market_stream_mux::domain::subscription::{SubscriptionRegistry, parse_spec_list};
///
/// let mut registry = SubscriptionRegistry::new();
///
/// let specs = parse_spec_list("T.AAPL,500Ms.AAPL").accepted;
/// let changes = registry.subscribe(1, &specs);
/// assert_eq!(changes.non_bar.unwrap().into_iter().collect::<Vec<_>>(), ["T.AAPL"]);
/// assert_eq!(changes.bar.unwrap().into_iter().collect::<Vec<_>>(), ["500Ms.AAPL"]);
///
/// // Session 2 overlaps on T.AAPL: nothing changes upstream
/// let changes = registry.subscribe(2, &parse_spec_list("T.AAPL").accepted);
/// assert!(changes.is_empty());
///
/// // Session 1 leaves; 500Ms.AAPL loses its last holder
/// let changes = registry.remove_session(1);
/// assert!(changes.non_bar.is_none());
/// assert!(changes.bar.unwrap().is_empty());
/// ```
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SubscriptionRegistry {
    /// class -> symbol -> holders
    index: HashMap<EventClass, HashMap<String, HashSet<SessionId>>>,
    by_session: HashMap<SessionId, HashSet<SubscriptionSpec>>,
    upstream: UpstreamSubscriptions,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add specs for a session. Specs already held are no-ops.
    pub fn subscribe(&mut self, session: SessionId, specs: &[SubscriptionSpec]) -> SubscriptionChanges {
        if specs.is_empty() {
            return SubscriptionChanges::default();
        }

        let held = self.by_session.entry(session).or_default();
        for spec in specs {
            if held.insert(spec.clone()) {
                self.index
                    .entry(spec.class)
                    .or_default()
                    .entry(spec.symbol.clone())
                    .or_default()
                    .insert(session);
            }
        }

        self.recompute()
    }

    /// Remove specs from a session. Specs never held are ignored.
    pub fn unsubscribe(
        &mut self,
        session: SessionId,
        specs: &[SubscriptionSpec],
    ) -> SubscriptionChanges {
        let Some(held) = self.by_session.get_mut(&session) else {
            return SubscriptionChanges::default();
        };

        let mut removed = Vec::new();
        for spec in specs {
            if held.remove(spec) {
                removed.push(spec);
            }
        }
        if held.is_empty() {
            self.by_session.remove(&session);
        }

        for spec in removed {
            self.release(session, spec);
        }

        self.recompute()
    }

    /// Remove every spec a session holds.
    pub fn remove_session(&mut self, session: SessionId) -> SubscriptionChanges {
        let Some(held) = self.by_session.remove(&session) else {
            return SubscriptionChanges::default();
        };

        for spec in &held {
            self.release(session, spec);
        }

        self.recompute()
    }

    fn release(&mut self, session: SessionId, spec: &SubscriptionSpec) {
        let Some(symbols) = self.index.get_mut(&spec.class) else {
            return;
        };
        if let Some(holders) = symbols.get_mut(&spec.symbol) {
            holders.remove(&session);
            if holders.is_empty() {
                symbols.remove(&spec.symbol);
            }
        }
        if symbols.is_empty() {
            self.index.remove(&spec.class);
        }
    }

    /// Sessions that should receive an envelope with this routing key.
    ///
    /// Yields exact holders, per-class wildcard holders and, unless the
    /// envelope is a millisecond bar, global wildcard holders. A session
    /// holding several matching specs is yielded once per match.
    pub fn recipients<'a>(&'a self, key: RoutingKey<'_>) -> impl Iterator<Item = SessionId> + 'a {
        let exact = self.holders(key.class, key.symbol);
        let class_wide = if key.symbol == ANY_SYMBOL {
            None
        } else {
            self.holders(key.class, ANY_SYMBOL)
        };
        let global = if key.class.is_millisecond() || key.class == EventClass::Wildcard {
            None
        } else {
            self.holders(EventClass::Wildcard, ANY_SYMBOL)
        };

        exact
            .into_iter()
            .chain(class_wide)
            .chain(global)
            .flatten()
            .copied()
    }

    /// Sessions holding exactly this `(class, symbol)` spec.
    #[must_use]
    pub fn holders(&self, class: EventClass, symbol: &str) -> Option<&HashSet<SessionId>> {
        self.index.get(&class).and_then(|symbols| symbols.get(symbol))
    }

    /// Whether any session holds the spec.
    #[must_use]
    pub fn contains(&self, spec: &SubscriptionSpec) -> bool {
        self.holders(spec.class, &spec.symbol).is_some()
    }

    /// Specs held by a session, sorted.
    #[must_use]
    pub fn specs_for(&self, session: SessionId) -> Vec<SubscriptionSpec> {
        let mut specs: Vec<_> = self
            .by_session
            .get(&session)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        specs.sort();
        specs
    }

    /// `(symbol, interval)` pairs requested as millisecond bars.
    pub fn millisecond_interest(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.index.iter().flat_map(|(class, symbols)| {
            let interval = match class {
                EventClass::MillisecondBar(interval) => Some(*interval),
                _ => None,
            };
            interval
                .into_iter()
                .flat_map(move |iv| symbols.keys().map(move |s| (s.as_str(), iv)))
        })
    }

    /// Current minimal upstream subscriptions.
    #[must_use]
    pub const fn upstream(&self) -> &UpstreamSubscriptions {
        &self.upstream
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            session_count: self.by_session.len(),
            spec_count: self.index.values().map(HashMap::len).sum(),
            wildcard_sessions: self
                .holders(EventClass::Wildcard, ANY_SYMBOL)
                .map_or(0, HashSet::len),
        }
    }

    fn recompute(&mut self) -> SubscriptionChanges {
        let next = self.compute_upstream();
        let mut changes = SubscriptionChanges::default();

        if next.non_bar != self.upstream.non_bar {
            changes.non_bar = Some(next.non_bar.clone());
        }
        if next.bar != self.upstream.bar {
            changes.bar = Some(next.bar.clone());
        }

        self.upstream = next;
        changes
    }

    fn compute_upstream(&self) -> UpstreamSubscriptions {
        let global = self.index.contains_key(&EventClass::Wildcard);

        let mut covered: HashSet<EventClass> = self
            .index
            .iter()
            .filter(|(_, symbols)| symbols.contains_key(ANY_SYMBOL))
            .map(|(class, _)| *class)
            .collect();
        if global {
            covered.extend(EventClass::NON_BAR_WILDCARD);
            covered.extend(EventClass::BAR_WILDCARD);
        }

        let mut upstream = UpstreamSubscriptions::default();

        for (class, symbols) in &self.index {
            if *class == EventClass::Wildcard {
                continue;
            }
            let target = if class.is_bar() {
                &mut upstream.bar
            } else {
                &mut upstream.non_bar
            };
            for symbol in symbols.keys() {
                if symbol != ANY_SYMBOL && covered.contains(class) {
                    continue;
                }
                target.insert(format!("{class}.{symbol}"));
            }
        }

        if global {
            for class in EventClass::NON_BAR_WILDCARD {
                upstream.non_bar.insert(format!("{class}.{ANY_SYMBOL}"));
            }
            for class in EventClass::BAR_WILDCARD {
                upstream.bar.insert(format!("{class}.{ANY_SYMBOL}"));
            }
        }

        upstream
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Sessions holding at least one spec.
    pub session_count: usize,
    /// Distinct specs held.
    pub spec_count: usize,
    /// Sessions holding the global wildcard.
    pub wildcard_sessions: usize,
}

// =============================================================================
// Tests
// =============================================================================
