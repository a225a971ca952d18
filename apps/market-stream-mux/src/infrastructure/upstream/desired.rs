//! Desired Subscription Channels
//!
//! `watch`-backed [`UpstreamPort`]: the router writes the latest minimal set,
//! each link wakes up and reconciles. Intermediate values may be skipped,
//! which is fine because only the latest set matters.

use std::collections::BTreeSet;

use tokio::sync::watch;

use crate::application::ports::{UpstreamPort, UpstreamTarget};

/// Desired subscription sets for the router's two links.
#[derive(Debug)]
pub struct DesiredSubscriptions {
    ticks: watch::Sender<BTreeSet<String>>,
    bars: watch::Sender<BTreeSet<String>>,
}

impl DesiredSubscriptions {
    /// Create both channels, initially empty.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ticks: watch::Sender::new(BTreeSet::new()),
            bars: watch::Sender::new(BTreeSet::new()),
        }
    }

    /// Receiver for one link.
    #[must_use]
    pub fn subscribe(&self, target: UpstreamTarget) -> watch::Receiver<BTreeSet<String>> {
        self.sender(target).subscribe()
    }

    /// Latest desired set for one link.
    #[must_use]
    pub fn current(&self, target: UpstreamTarget) -> BTreeSet<String> {
        self.sender(target).borrow().clone()
    }

    const fn sender(&self, target: UpstreamTarget) -> &watch::Sender<BTreeSet<String>> {
        match target {
            UpstreamTarget::Ticks => &self.ticks,
            UpstreamTarget::Bars => &self.bars,
        }
    }
}

impl Default for DesiredSubscriptions {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamPort for DesiredSubscriptions {
    fn request_subscription(&self, target: UpstreamTarget, specs: &BTreeSet<String>) {
        self.sender(target).send_replace(specs.clone());
    }
}

/// Receiver pinned to a fixed subscription, for links whose set never
/// changes (the vendor link, the bar tier's ingress link).
#[must_use]
pub fn fixed(params: &str) -> (watch::Sender<BTreeSet<String>>, watch::Receiver<BTreeSet<String>>) {
    let specs = params
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect();
    watch::channel(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_wakes_link_receiver() {
        let desired = DesiredSubscriptions::new();
        let mut rx = desired.subscribe(UpstreamTarget::Bars);

        let specs: BTreeSet<String> = ["500Ms.AAPL".to_string()].into();
        desired.request_subscription(UpstreamTarget::Bars, &specs);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), specs);
        assert!(desired.current(UpstreamTarget::Ticks).is_empty());
    }

    #[test]
    fn fixed_parses_params() {
        let (_tx, rx) = fixed("T.*, A.*,,AM.*");
        assert_eq!(rx.borrow().len(), 3);
        assert!(rx.borrow().contains("A.*"));
    }
}
