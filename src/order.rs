//! Deterministic zone ordering.
//!
//! Zones are served by priority tier (highest first), then by daily target
//! (largest first) so long-running zones start early in the window, and
//! finally by name so the order never depends on map iteration.

use crate::config::ZoneConfig;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Compare two zones for scheduling order.
pub fn compare(a: (&str, &ZoneConfig), b: (&str, &ZoneConfig)) -> Ordering {
    b.1.priority
        .cmp(&a.1.priority)
        .then_with(|| b.1.minutes.cmp(&a.1.minutes))
        .then_with(|| a.0.cmp(b.0))
}

/// Zone names sorted into scheduling order.
pub fn zone_order(zones: &BTreeMap<String, ZoneConfig>) -> Vec<String> {
    let mut all: Vec<(&str, &ZoneConfig)> = zones.iter().map(|(n, z)| (n.as_str(), z)).collect();
    all.sort_by(|a, b| compare(*a, *b));
    all.into_iter().map(|(n, _)| n.to_string()).collect()
}
