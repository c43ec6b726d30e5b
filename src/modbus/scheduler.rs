use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::modbus::poll::{PollId, PollStore};
use crate::modbus::types::PublishMode;

/// Decides which polls are due at a given instant and how long the worker
/// may sleep until the next one. Holds handles only; poll state lives in
/// the store.
#[derive(Debug, Default)]
pub struct Scheduler {
    registers: BTreeMap<u8, Vec<PollId>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler::default()
    }

    pub fn set_poll_specification(&mut self, registers: BTreeMap<u8, Vec<PollId>>) {
        self.registers = registers;
    }

    pub fn poll_specification(&self) -> &BTreeMap<u8, Vec<PollId>> {
        &self.registers
    }

    pub fn has_registers(&self) -> bool {
        self.registers.values().any(|list| !list.is_empty())
    }

    /// Returns the per-slave map of polls due now and the smallest positive
    /// time until a remaining poll becomes due (`Duration::MAX` when none
    /// exists, including when every poll is already due).
    ///
    /// A `once` poll that has been read successfully is never returned
    /// again; a poll whose last read failed stays on its normal cadence.
    pub fn registers_due(
        &self,
        store: &PollStore,
        now: Instant,
    ) -> (BTreeMap<u8, Vec<PollId>>, Duration) {
        let mut due: BTreeMap<u8, Vec<PollId>> = BTreeMap::new();
        let mut wait = Duration::MAX;

        for (&slave_id, ids) in &self.registers {
            for &id in ids {
                let poll = store.get(id);
                let refresh = match poll.refresh {
                    Some(refresh) => refresh,
                    // range-shaping polls without a cadence are only read
                    // during the initial poll
                    None => continue,
                };

                if poll.publish_mode == PublishMode::Once && poll.last_read_ok {
                    continue;
                }

                // due polls are returned with a clamped due_in of zero and
                // do not bound the wait; only time still left to run does
                match poll.last_read {
                    None => {
                        due.entry(slave_id).or_default().push(id);
                    }
                    Some(last_read) => {
                        let elapsed = now.saturating_duration_since(last_read);
                        if elapsed >= refresh {
                            log::trace!(
                                "register {}.{} due, last read {}ms ago",
                                slave_id,
                                poll.range.first,
                                elapsed.as_millis()
                            );
                            due.entry(slave_id).or_default().push(id);
                        } else {
                            let due_in = refresh - elapsed;
                            if due_in < wait {
                                wait = due_in;
                            }
                        }
                    }
                }
            }
        }

        (due, wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::poll::RegisterPoll;
    use crate::modbus::pollspec::PollDef;
    use crate::modbus::types::{AddressRange, RegisterType};

    fn setup(
        refresh_ms: &[u64],
    ) -> (Scheduler, PollStore, Vec<PollId>) {
        let mut store = PollStore::new();
        let mut ids = Vec::new();
        for (i, &ms) in refresh_ms.iter().enumerate() {
            let id = store.insert(RegisterPoll::from_def(&PollDef::new(
                1,
                AddressRange::new(i as u16 * 10, 1, RegisterType::Holding).unwrap(),
                Some(Duration::from_millis(ms)),
            )));
            ids.push(id);
        }
        let mut scheduler = Scheduler::new();
        scheduler.set_poll_specification(store.by_slave());
        (scheduler, store, ids)
    }

    #[test]
    fn never_read_polls_are_due_immediately() {
        let (scheduler, store, ids) = setup(&[100, 200]);
        let (due, wait) = scheduler.registers_due(&store, Instant::now());
        assert_eq!(due[&1], ids);
        // every poll is due, so no positive due_in bounds the wait
        assert_eq!(wait, Duration::MAX);
    }

    #[test]
    fn fresh_polls_are_not_due() {
        let (scheduler, mut store, ids) = setup(&[100, 200]);
        let now = Instant::now();
        for &id in &ids {
            let poll = store.get_mut(id);
            poll.last_read = Some(now);
            poll.last_read_ok = true;
        }
        let (due, wait) = scheduler.registers_due(&store, now);
        assert!(due.is_empty());
        assert!(wait <= Duration::from_millis(100));
        assert!(wait > Duration::from_millis(50));
    }

    #[test]
    fn stale_poll_is_due_with_wait_from_the_other() {
        let (scheduler, mut store, ids) = setup(&[100, 200]);
        let now = Instant::now();
        store.get_mut(ids[0]).last_read = Some(now - Duration::from_millis(150));
        store.get_mut(ids[1]).last_read = Some(now);
        let (due, wait) = scheduler.registers_due(&store, now);
        assert_eq!(due[&1], vec![ids[0]]);
        // the due poll does not bound the wait; only the fresh one does
        assert_eq!(wait, Duration::from_millis(200));
    }

    #[test]
    fn once_poll_is_dropped_after_successful_read() {
        let (mut scheduler, mut store, ids) = setup(&[100]);
        store.get_mut(ids[0]).publish_mode = PublishMode::Once;
        scheduler.set_poll_specification(store.by_slave());

        let now = Instant::now();
        let (due, _) = scheduler.registers_due(&store, now);
        assert_eq!(due[&1], vec![ids[0]]);

        // successful read removes it from scheduling entirely
        {
            let poll = store.get_mut(ids[0]);
            poll.last_read = Some(now);
            poll.last_read_ok = true;
        }
        let later = now + Duration::from_secs(5);
        let (due, wait) = scheduler.registers_due(&store, later);
        assert!(due.is_empty());
        assert_eq!(wait, Duration::MAX);
    }

    #[test]
    fn failed_once_poll_is_retried_on_cadence() {
        let (mut scheduler, mut store, ids) = setup(&[100]);
        store.get_mut(ids[0]).publish_mode = PublishMode::Once;
        scheduler.set_poll_specification(store.by_slave());

        let now = Instant::now();
        {
            let poll = store.get_mut(ids[0]);
            poll.last_read = Some(now - Duration::from_millis(200));
            poll.last_read_ok = false;
        }
        let (due, _) = scheduler.registers_due(&store, now);
        assert_eq!(due[&1], vec![ids[0]]);
    }

    #[test]
    fn polls_without_refresh_are_never_scheduled() {
        let mut store = PollStore::new();
        store.insert(RegisterPoll::from_def(&PollDef::new(
            1,
            AddressRange::new(0, 8, RegisterType::Holding).unwrap(),
            None,
        )));
        let mut scheduler = Scheduler::new();
        scheduler.set_poll_specification(store.by_slave());
        let (due, wait) = scheduler.registers_due(&store, Instant::now());
        assert!(due.is_empty());
        assert_eq!(wait, Duration::MAX);
    }
}
