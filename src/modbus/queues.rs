use std::collections::VecDeque;
use std::time::Duration;

use crate::modbus::poll::{PollId, PollStore, RegisterWrite};
use crate::modbus::types::CommandDelay;

/// A command the executor can issue on the bus: either a poll handle into
/// the store or an owned pending write.
#[derive(Debug)]
pub enum Command {
    Poll(PollId),
    Write(RegisterWrite),
}

impl Command {
    pub fn slave_id(&self, store: &PollStore) -> u8 {
        match self {
            Command::Poll(id) => store.get(*id).slave_id,
            Command::Write(w) => w.slave_id,
        }
    }

    pub fn first_register(&self, store: &PollStore) -> u16 {
        match self {
            Command::Poll(id) => store.get(*id).range.first,
            Command::Write(w) => w.range.first,
        }
    }

    pub fn effective_delay(&self, store: &PollStore, first_touch: bool) -> CommandDelay {
        match self {
            Command::Poll(id) => store.get(*id).effective_delay(first_touch),
            Command::Write(w) => w.effective_delay(first_touch),
        }
    }

    pub fn is_poll(&self) -> bool {
        matches!(self, Command::Poll(_))
    }
}

/// Per-slave FIFOs of due polls and pending writes. A fairness toggle makes
/// `pop_next` alternate between the two queues so writes interleave with
/// reads on a busy slave.
#[derive(Debug)]
pub struct RequestQueues {
    pub poll_queue: VecDeque<PollId>,
    pub write_queue: VecDeque<RegisterWrite>,
    pop_from_poll: bool,
}

impl Default for RequestQueues {
    fn default() -> Self {
        RequestQueues {
            poll_queue: VecDeque::new(),
            write_queue: VecDeque::new(),
            pop_from_poll: true,
        }
    }
}

impl RequestQueues {
    /// Append polls not already queued. A handle that is still waiting for
    /// service is left alone.
    pub fn add_polls(&mut self, polls: &[PollId]) {
        for id in polls {
            if !self.poll_queue.contains(id) {
                self.poll_queue.push_back(*id);
            }
        }
    }

    pub fn add_write(&mut self, write: RegisterWrite) {
        self.write_queue.push_back(write);
    }

    pub fn is_empty(&self) -> bool {
        self.poll_queue.is_empty() && self.write_queue.is_empty()
    }

    /// Find the largest delay among queued polls that fits into the given
    /// silence period: the best candidate to consume silence that has
    /// already passed. Zero short-circuits (something can run right now);
    /// `None` means no queued poll fits.
    ///
    /// With `ignore_first_read` the first-command delays are not considered;
    /// the executor sets it for the slave it is already talking to.
    pub fn find_for_silence(
        &self,
        store: &PollStore,
        period: Duration,
        ignore_first_read: bool,
    ) -> Option<Duration> {
        let mut best: Option<Duration> = None;
        for id in &self.poll_queue {
            let poll = store.get(*id);
            let mut consider = |delay: Duration| -> bool {
                if delay.is_zero() {
                    return true;
                }
                if delay <= period && best.map_or(true, |b| delay > b) {
                    best = Some(delay);
                }
                false
            };
            if consider(poll.delay_before_command.duration) {
                return Some(Duration::ZERO);
            }
            if !ignore_first_read && consider(poll.delay_before_first_command.duration) {
                return Some(Duration::ZERO);
            }
        }
        best
    }

    /// Remove and return the poll elected by `find_for_silence`, falling
    /// back to `pop_next` when no delayed poll matches.
    pub fn pop_first_with_delay(
        &mut self,
        store: &PollStore,
        period: Duration,
        ignore_first_read: bool,
    ) -> Option<Command> {
        let target = match self.find_for_silence(store, period, ignore_first_read) {
            Some(delay) => delay,
            None => return self.pop_next(),
        };

        let position = self.poll_queue.iter().position(|id| {
            let poll = store.get(*id);
            poll.delay_before_command.duration == target
                || (!ignore_first_read && poll.delay_before_first_command.duration == target)
        });

        match position {
            Some(idx) => self.poll_queue.remove(idx).map(Command::Poll),
            None => self.pop_next(),
        }
    }

    /// Alternately pop from the poll and write queues.
    pub fn pop_next(&mut self) -> Option<Command> {
        let command = if self.pop_from_poll {
            match self.poll_queue.pop_front() {
                Some(id) => Some(Command::Poll(id)),
                None => self.write_queue.pop_front().map(Command::Write),
            }
        } else {
            match self.write_queue.pop_front() {
                Some(w) => Some(Command::Write(w)),
                None => self.poll_queue.pop_front().map(Command::Poll),
            }
        };
        if command.is_some() {
            self.pop_from_poll = !self.pop_from_poll;
        }
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::poll::{RegisterPoll, SlaveConfig};
    use crate::modbus::pollspec::PollDef;
    use crate::modbus::types::{AddressRange, RegisterType};

    fn add_poll(store: &mut PollStore, first: u16) -> PollId {
        store.insert(RegisterPoll::from_def(&PollDef::new(
            1,
            AddressRange::new(first, 1, RegisterType::Holding).unwrap(),
            Some(Duration::from_millis(100)),
        )))
    }

    fn add_poll_delayed(store: &mut PollStore, first: u16, delay_ms: u64) -> PollId {
        let id = add_poll(store, first);
        store.get_mut(id).delay_before_command =
            CommandDelay::every_time(Duration::from_millis(delay_ms));
        id
    }

    fn add_poll_first_delayed(store: &mut PollStore, first: u16, delay_ms: u64) -> PollId {
        let id = add_poll(store, first);
        store.get_mut(id).delay_before_first_command =
            CommandDelay::on_slave_change(Duration::from_millis(delay_ms));
        id
    }

    #[test]
    fn add_polls_ignores_duplicates() {
        let mut store = PollStore::new();
        let id = add_poll(&mut store, 1);
        let mut queues = RequestQueues::default();
        queues.add_polls(&[id]);
        queues.add_polls(&[id]);
        assert_eq!(queues.poll_queue.len(), 1);
    }

    #[test]
    fn add_polls_appends_new_handles() {
        let mut store = PollStore::new();
        let a = add_poll(&mut store, 1);
        let b = add_poll(&mut store, 2);
        let c = add_poll(&mut store, 3);
        let mut queues = RequestQueues::default();
        queues.add_polls(&[a]);
        queues.add_polls(&[b, c]);
        assert_eq!(queues.poll_queue.len(), 3);
    }

    #[test]
    fn find_for_silence_returns_best_fit() {
        let mut store = PollStore::new();
        let a = add_poll_delayed(&mut store, 1, 50);
        let b = add_poll_delayed(&mut store, 2, 100);
        let mut queues = RequestQueues::default();
        queues.add_polls(&[a, b]);

        // both fit into 100ms of silence, the larger consumes it best
        assert_eq!(
            queues.find_for_silence(&store, Duration::from_millis(100), true),
            Some(Duration::from_millis(100))
        );
        // only the 50ms delay fits into 60ms of silence
        assert_eq!(
            queues.find_for_silence(&store, Duration::from_millis(60), true),
            Some(Duration::from_millis(50))
        );
        // nothing fits
        assert_eq!(
            queues.find_for_silence(&store, Duration::from_millis(10), true),
            None
        );
    }

    #[test]
    fn find_for_silence_short_circuits_on_zero_delay() {
        let mut store = PollStore::new();
        let a = add_poll_delayed(&mut store, 1, 50);
        let b = add_poll(&mut store, 2);
        let mut queues = RequestQueues::default();
        queues.add_polls(&[a, b]);
        assert_eq!(
            queues.find_for_silence(&store, Duration::from_millis(100), true),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn find_for_silence_skips_first_command_delays_when_ignored() {
        let mut store = PollStore::new();
        let a = add_poll_delayed(&mut store, 1, 50);
        let b = add_poll_first_delayed(&mut store, 2, 100);
        let mut queues = RequestQueues::default();
        queues.add_polls(&[a, b]);

        // with first-command delays ignored the poll behind `b` looks
        // delay-free, which short-circuits the election
        assert_eq!(
            queues.find_for_silence(&store, Duration::from_millis(100), true),
            Some(Duration::ZERO)
        );
        assert_eq!(
            queues.find_for_silence(&store, Duration::from_millis(100), false),
            Some(Duration::from_millis(100))
        );
    }

    #[test]
    fn pop_first_with_delay_pops_elected_poll() {
        let mut store = PollStore::new();
        let a = add_poll_delayed(&mut store, 1, 50);
        let b = add_poll_delayed(&mut store, 2, 100);
        let mut queues = RequestQueues::default();
        queues.add_polls(&[a, b]);

        let cmd = queues
            .pop_first_with_delay(&store, Duration::from_millis(100), true)
            .unwrap();
        assert_eq!(cmd.first_register(&store), 2);
        assert_eq!(queues.poll_queue.len(), 1);
    }

    #[test]
    fn pop_first_with_delay_falls_back_to_pop_next() {
        let mut store = PollStore::new();
        let a = add_poll_delayed(&mut store, 1, 50);
        let mut queues = RequestQueues::default();
        queues.add_polls(&[a]);

        // silence too short for any delayed poll
        let cmd = queues
            .pop_first_with_delay(&store, Duration::from_millis(10), true)
            .unwrap();
        assert_eq!(cmd.first_register(&store), 1);
        assert!(queues.is_empty());
    }

    #[test]
    fn pop_next_alternates_between_polls_and_writes() {
        let mut store = PollStore::new();
        let a = add_poll(&mut store, 1);
        let b = add_poll(&mut store, 2);
        let mut queues = RequestQueues::default();
        queues.add_polls(&[a, b]);
        let write = |reg: u16| {
            RegisterWrite::new(
                1,
                AddressRange::new(reg, 1, RegisterType::Holding).unwrap(),
                vec![1],
            )
        };
        queues.add_write(write(10));
        queues.add_write(write(11));

        let order: Vec<bool> = std::iter::from_fn(|| queues.pop_next())
            .map(|c| c.is_poll())
            .collect();
        assert_eq!(order, vec![true, false, true, false]);
    }

    #[test]
    fn pop_next_drains_remaining_queue() {
        let mut store = PollStore::new();
        let a = add_poll(&mut store, 1);
        let mut queues = RequestQueues::default();
        queues.add_polls(&[a]);
        queues.add_write(RegisterWrite::new(
            1,
            AddressRange::new(5, 1, RegisterType::Holding).unwrap(),
            vec![1],
        ));
        assert!(queues.pop_next().unwrap().is_poll());
        assert!(!queues.pop_next().unwrap().is_poll());
        assert!(queues.pop_next().is_none());
    }

    #[test]
    fn write_delay_comes_from_slave_config() {
        let mut write = RegisterWrite::new(
            3,
            AddressRange::new(5, 1, RegisterType::Holding).unwrap(),
            vec![1],
        );
        write.apply_slave_config(&SlaveConfig {
            address: 3,
            delay_before_command: Duration::from_millis(7),
            write_retries: 2,
            ..SlaveConfig::default()
        });
        assert_eq!(
            write.effective_delay(false),
            CommandDelay::every_time(Duration::from_millis(7))
        );
        assert_eq!(write.max_write_retries, 2);
    }
}
