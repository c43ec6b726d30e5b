use std::collections::BTreeMap;
use std::time::Duration;

use crate::modbus::types::{AddressRange, PublishMode, RegisterType};

/// One register range a network should poll. `refresh` is `None` while the
/// poll only shapes a group (a slave poll_group without its own cadence);
/// merging with an object poll picks the shortest configured refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollDef {
    pub slave_id: u8,
    pub range: AddressRange,
    pub refresh: Option<Duration>,
    pub publish_mode: PublishMode,
}

impl PollDef {
    pub fn new(slave_id: u8, range: AddressRange, refresh: Option<Duration>) -> Self {
        PollDef {
            slave_id,
            range,
            refresh,
            publish_mode: PublishMode::default(),
        }
    }

    pub fn is_same_as(&self, other: &PollDef) -> bool {
        self.slave_id == other.slave_id && self.range == other.range
    }

    /// Fold `other` into this poll: enclosing range, shortest refresh,
    /// most-reporting publish mode.
    pub fn merge(&mut self, other: &PollDef) {
        self.range.merge(&other.range);
        match (self.refresh, other.refresh) {
            (None, r) => self.refresh = r,
            (Some(mine), Some(theirs)) if theirs < mine => {
                log::debug!(
                    "setting refresh {}ms on merged poll {}.{}",
                    theirs.as_millis(),
                    self.slave_id,
                    self.range.first
                );
                self.refresh = Some(theirs);
            }
            _ => {}
        }
        self.publish_mode = self.publish_mode.most_reporting(other.publish_mode);
    }
}

/// The set of polls for one Modbus network, built up from object state
/// trees and slave poll groups before being handed to the network worker.
#[derive(Debug, Clone)]
pub struct PollSpec {
    pub network: String,
    pub polls: Vec<PollDef>,
}

impl PollSpec {
    pub fn new(network: impl Into<String>) -> Self {
        PollSpec {
            network: network.into(),
            polls: Vec::new(),
        }
    }

    /// Fold a poll into the specification. Any existing polls on the same
    /// slave whose ranges overlap the new one are removed and replaced by a
    /// single enclosing poll carrying the shortest refresh among them.
    pub fn merge(&mut self, poll: PollDef) {
        let mut overlapped: Vec<PollDef> = Vec::new();
        self.polls.retain(|existing| {
            if existing.slave_id == poll.slave_id && existing.range.overlaps(&poll.range) {
                overlapped.push(existing.clone());
                false
            } else {
                true
            }
        });

        if overlapped.is_empty() {
            log::debug!(
                "adding poll {}.{} refresh={:?} on network {}",
                poll.slave_id,
                poll.range,
                poll.refresh,
                self.network
            );
            self.polls.push(poll);
        } else {
            self.polls.push(poll);
            let merged = self.polls.last_mut().unwrap();
            for old in &overlapped {
                merged.merge(old);
            }
        }
    }

    pub fn merge_all(&mut self, polls: impl IntoIterator<Item = PollDef>) {
        for poll in polls {
            self.merge(poll);
        }
    }

    /// Fuse consecutive same-type ranges per `(slave, type)` into single
    /// polls so one bus transaction covers them. Overlap-free but
    /// non-consecutive ranges stay split so each keeps its declared refresh.
    pub fn group(&mut self) {
        let mut buckets: BTreeMap<(u8, RegisterType), Vec<PollDef>> = BTreeMap::new();
        for poll in self.polls.drain(..) {
            buckets
                .entry((poll.slave_id, poll.range.reg_type))
                .or_default()
                .push(poll);
        }

        for (_, mut group) in buckets {
            group.sort_by_key(|p| p.range.first);
            let mut iter = group.into_iter();
            let mut current = match iter.next() {
                Some(first) => first,
                None => continue,
            };
            for next in iter {
                if current.range.is_consecutive_of(&next.range) || current.range.overlaps(&next.range)
                {
                    current.merge(&next);
                } else {
                    self.polls.push(current);
                    current = next;
                }
            }
            self.polls.push(current);
        }
    }

    /// Shortest refresh across the whole specification, used for the
    /// watchdog default watch period.
    pub fn min_refresh(&self) -> Option<Duration> {
        self.polls.iter().filter_map(|p| p.refresh).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll(slave: u8, first: u16, count: u16, refresh_ms: u64) -> PollDef {
        PollDef::new(
            slave,
            AddressRange::new(first, count, RegisterType::Holding).unwrap(),
            Some(Duration::from_millis(refresh_ms)),
        )
    }

    #[test]
    fn merge_keeps_disjoint_polls_apart() {
        let mut spec = PollSpec::new("net");
        spec.merge(poll(1, 1, 2, 100));
        spec.merge(poll(1, 10, 2, 100));
        assert_eq!(spec.polls.len(), 2);
    }

    #[test]
    fn merge_folds_overlapping_polls() {
        let mut spec = PollSpec::new("net");
        spec.merge(poll(1, 1, 4, 100));
        spec.merge(poll(1, 3, 4, 50));
        assert_eq!(spec.polls.len(), 1);
        let merged = &spec.polls[0];
        assert_eq!(merged.range.first, 1);
        assert_eq!(merged.range.last(), 6);
        assert_eq!(merged.refresh, Some(Duration::from_millis(50)));
    }

    #[test]
    fn merge_ignores_other_slaves() {
        let mut spec = PollSpec::new("net");
        spec.merge(poll(1, 1, 4, 100));
        spec.merge(poll(2, 1, 4, 100));
        assert_eq!(spec.polls.len(), 2);
    }

    #[test]
    fn merge_folds_multiple_overlappers_with_min_refresh() {
        let mut spec = PollSpec::new("net");
        spec.merge(poll(1, 1, 2, 100));
        spec.merge(poll(1, 5, 2, 30));
        // spans both existing polls
        spec.merge(poll(1, 2, 4, 70));
        assert_eq!(spec.polls.len(), 1);
        let merged = &spec.polls[0];
        assert_eq!(merged.range.first, 1);
        assert_eq!(merged.range.last(), 6);
        assert_eq!(merged.refresh, Some(Duration::from_millis(30)));
    }

    #[test]
    fn merge_treats_missing_refresh_as_infinite() {
        let mut spec = PollSpec::new("net");
        spec.merge(PollDef::new(
            1,
            AddressRange::new(1, 8, RegisterType::Holding).unwrap(),
            None,
        ));
        spec.merge(poll(1, 2, 2, 500));
        assert_eq!(spec.polls.len(), 1);
        assert_eq!(spec.polls[0].refresh, Some(Duration::from_millis(500)));
    }

    #[test]
    fn no_overlaps_after_merge() {
        let mut spec = PollSpec::new("net");
        for first in [1u16, 3, 2, 9, 8, 20] {
            spec.merge(poll(1, first, 3, 100));
        }
        for (i, a) in spec.polls.iter().enumerate() {
            for b in spec.polls.iter().skip(i + 1) {
                assert!(
                    !(a.slave_id == b.slave_id && a.range.overlaps(&b.range)),
                    "{a:?} overlaps {b:?}"
                );
            }
        }
    }

    #[test]
    fn group_fuses_consecutive_ranges() {
        let mut spec = PollSpec::new("net");
        spec.merge(poll(1, 1, 2, 100));
        spec.merge(poll(1, 3, 2, 50));
        spec.group();
        assert_eq!(spec.polls.len(), 1);
        assert_eq!(spec.polls[0].range.first, 1);
        assert_eq!(spec.polls[0].range.count, 4);
        assert_eq!(spec.polls[0].refresh, Some(Duration::from_millis(50)));
    }

    #[test]
    fn group_does_not_fuse_gaps() {
        let mut spec = PollSpec::new("net");
        spec.merge(poll(1, 1, 2, 100));
        spec.merge(poll(1, 5, 2, 100));
        spec.group();
        assert_eq!(spec.polls.len(), 2);
    }

    #[test]
    fn group_partitions_by_slave_and_type() {
        let mut spec = PollSpec::new("net");
        spec.merge(poll(1, 1, 2, 100));
        spec.merge(poll(2, 3, 2, 100));
        spec.merge(PollDef::new(
            1,
            AddressRange::new(3, 2, RegisterType::Input).unwrap(),
            Some(Duration::from_millis(100)),
        ));
        spec.group();
        assert_eq!(spec.polls.len(), 3);
    }

    #[test]
    fn group_preserves_most_reporting_publish_mode() {
        let mut spec = PollSpec::new("net");
        let mut a = poll(1, 1, 2, 100);
        a.publish_mode = PublishMode::Once;
        let mut b = poll(1, 3, 2, 100);
        b.publish_mode = PublishMode::EveryPoll;
        spec.merge(a);
        spec.merge(b);
        spec.group();
        assert_eq!(spec.polls.len(), 1);
        assert_eq!(spec.polls[0].publish_mode, PublishMode::EveryPoll);
    }

    #[test]
    fn min_refresh_over_spec() {
        let mut spec = PollSpec::new("net");
        spec.merge(poll(1, 1, 2, 100));
        spec.merge(poll(2, 1, 2, 40));
        assert_eq!(spec.min_refresh(), Some(Duration::from_millis(40)));
    }
}
