use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use flume::Sender;

use crate::modbus::messages::{RegisterValues, WorkerEvent};
use crate::modbus::poll::{
    PollId, PollStore, RegisterWrite, DEFAULT_READ_ERROR_COUNT, DURATION_BETWEEN_LOG_ERROR,
};
use crate::modbus::queues::{Command, RequestQueues};
use crate::modbus::transport::Transport;
use crate::modbus::types::PublishMode;

/// Upper bound of consecutive commands issued to a slave that has only
/// writes queued, so a flood of writes cannot starve other slaves.
pub const WRITE_BATCH_SIZE: usize = 10;

/// Outcome of the command issued by the last `execute_next` step; consumed
/// by the watchdog.
#[derive(Debug, Clone, Copy)]
pub struct ExecutedCommand {
    pub slave_id: u8,
    pub register: u16,
    pub is_poll: bool,
    pub ok: bool,
}

/// Single-threaded command pump for one network. Owns the per-slave request
/// queues and advances one bus transaction per call, honoring silence
/// requirements and slave fairness, and emitting change events.
pub struct Executor {
    events: Sender<WorkerEvent>,

    slave_queues: BTreeMap<u8, RequestQueues>,
    current_slave: Option<u8>,
    last_slave: Option<u8>,
    waiting: Option<Command>,
    /// True when `waiting` was freshly popped rather than kept for retry.
    fresh_command: bool,

    commands_left: usize,
    max_read_retries: u16,
    read_retries_left: u16,
    max_write_retries: u16,
    write_retries_left: u16,

    last_command_time: Option<Instant>,
    initial_poll: bool,
    initial_poll_start: Option<Instant>,
    last_result: Option<ExecutedCommand>,
}

impl Executor {
    pub fn new(events: Sender<WorkerEvent>) -> Self {
        Executor {
            events,
            slave_queues: BTreeMap::new(),
            current_slave: None,
            last_slave: None,
            waiting: None,
            fresh_command: false,
            commands_left: 0,
            max_read_retries: 0,
            read_retries_left: 0,
            max_write_retries: 0,
            write_retries_left: 0,
            last_command_time: None,
            initial_poll: false,
            initial_poll_start: None,
            last_result: None,
        }
    }

    /// Install every poll as due and switch to initial-poll mode: change
    /// detection is bypassed until each poll has been read once.
    pub fn setup_initial_poll(
        &mut self,
        registers: &BTreeMap<u8, Vec<PollId>>,
        store: &PollStore,
    ) {
        if self.initial_poll && !self.poll_done() {
            log::debug!("initial poll already in progress");
            return;
        }
        log::debug!("starting initial poll");
        self.add_polls(registers, store, true);
    }

    pub fn is_initial_poll(&self) -> bool {
        self.initial_poll
    }

    /// Merge due polls into the queues. When the executor was idle, elect
    /// the next command: across all slaves, the queue whose best-fit delay
    /// consumes accumulated silence with the least enforced wait wins; a
    /// zero-delay candidate stops the search.
    pub fn add_polls(
        &mut self,
        registers: &BTreeMap<u8, Vec<PollId>>,
        store: &PollStore,
        initial: bool,
    ) {
        let was_idle = self.all_done();

        if self.initial_poll && !self.poll_done() {
            log::error!("cannot add polls before the initial poll is finished");
            return;
        }

        if initial {
            self.initial_poll = true;
            self.initial_poll_start = Some(Instant::now());
        }

        let mut first_added: Option<u8> = None;
        for (&slave_id, ids) in registers {
            let queue = self.slave_queues.entry(slave_id).or_default();
            queue.add_polls(ids);
            if !ids.is_empty() && first_added.is_none() {
                first_added = Some(slave_id);
            }
        }

        // already mid-stream or nothing new to do
        if !was_idle {
            return;
        }
        let first = match first_added {
            Some(slave_id) => slave_id,
            None => return,
        };
        self.current_slave = Some(first);

        let silence = self.silence();
        log::trace!(
            "starting election for silence period {}ms",
            silence.as_millis()
        );
        debug_assert!(self.waiting.is_none());

        let mut best: Option<(u8, Duration, bool)> = None;
        for (&slave_id, queue) in &self.slave_queues {
            let ignore_first_read = slave_id == first;
            if let Some(delay) = queue.find_for_silence(store, silence, ignore_first_read) {
                if best.map_or(true, |(_, d, _)| delay < d) {
                    best = Some((slave_id, delay, ignore_first_read));
                    if delay.is_zero() {
                        break;
                    }
                }
            }
        }

        match best {
            Some((slave_id, delay, ignore_first_read)) => {
                self.current_slave = Some(slave_id);
                self.waiting = self
                    .slave_queues
                    .get_mut(&slave_id)
                    .and_then(|q| q.pop_first_with_delay(store, silence, ignore_first_read));
                log::trace!(
                    "elected next command on slave {slave_id}, delay={}ms",
                    delay.as_millis()
                );
            }
            None => {
                // only delays too large to fit: start from the first queue
                self.waiting = self
                    .slave_queues
                    .get_mut(&first)
                    .and_then(|q| q.pop_next());
            }
        }
        self.fresh_command = self.waiting.is_some();
        self.reset_commands_counter();
    }

    pub fn add_write(&mut self, write: RegisterWrite) {
        let slave_id = write.slave_id;
        self.slave_queues
            .entry(slave_id)
            .or_default()
            .add_write(write);
        if self.current_slave.is_none() {
            self.current_slave = self.slave_queues.keys().next().copied();
            self.reset_commands_counter();
        }
    }

    /// Advance one step. Returns how long the worker should sleep before
    /// calling again: the residual silence requirement of the next command,
    /// zero right after a command was issued, or `Duration::MAX` when every
    /// queue is drained.
    pub fn execute_next(&mut self, store: &mut PollStore, transport: &mut dyn Transport) -> Duration {
        self.last_result = None;
        let wait = self.execute_step(store, transport);

        if self.initial_poll && self.poll_done() {
            match self.initial_poll_start {
                Some(start) if self.current_slave.is_some() => {
                    log::info!("initial poll done in {}ms", start.elapsed().as_millis())
                }
                _ => log::info!("nothing to do for initial poll"),
            }
            self.initial_poll = false;
        }

        wait
    }

    fn execute_step(&mut self, store: &mut PollStore, transport: &mut dyn Transport) -> Duration {
        if self.waiting.is_some() {
            if let Some(wait) = self.waiting_command_delay(store) {
                return wait;
            }
            self.send_command(store, transport);
        } else {
            let current = match self.current_slave {
                Some(slave_id) => slave_id,
                None => return Duration::MAX,
            };

            let must_rotate = self.commands_left == 0
                || self
                    .slave_queues
                    .get(&current)
                    .map_or(true, |q| q.is_empty());
            if must_rotate {
                match self.next_non_empty_slave(current) {
                    Some(next) => {
                        self.current_slave = Some(next);
                        self.waiting = self
                            .slave_queues
                            .get_mut(&next)
                            .and_then(|q| q.pop_next());
                        self.fresh_command = self.waiting.is_some();
                        self.reset_commands_counter();
                    }
                    None => return Duration::MAX,
                }
            } else {
                self.waiting = self
                    .slave_queues
                    .get_mut(&current)
                    .and_then(|q| q.pop_next());
                self.fresh_command = self.waiting.is_some();
            }

            if self.waiting.is_some() {
                if let Some(wait) = self.waiting_command_delay(store) {
                    log::trace!("next command needs {}ms of silence", wait.as_millis());
                    return wait;
                }
                self.send_command(store, transport);
            }
        }

        Duration::ZERO
    }

    /// Residual delay the waiting command still has to honor, if any.
    fn waiting_command_delay(&self, store: &PollStore) -> Option<Duration> {
        let command = self.waiting.as_ref()?;
        let slave_id = command.slave_id(store);
        let first_touch = self.last_slave.map_or(true, |last| last != slave_id);
        let delay = command.effective_delay(store, first_touch);
        if !delay.applies(self.last_slave, slave_id) {
            return None;
        }
        let silence = self.silence();
        if silence >= delay.duration {
            return None;
        }
        Some(delay.duration - silence)
    }

    fn send_command(&mut self, store: &mut PollStore, transport: &mut dyn Transport) {
        let mut command = match self.waiting.take() {
            Some(command) => command,
            None => return,
        };

        if self.fresh_command {
            match &command {
                Command::Poll(id) => {
                    self.max_read_retries = store.get(*id).max_read_retries;
                    self.read_retries_left = self.max_read_retries;
                }
                Command::Write(w) => {
                    self.max_write_retries = w.max_write_retries;
                    self.write_retries_left = self.max_write_retries;
                }
            }
        }

        let mut retry = false;
        let result = match &mut command {
            Command::Poll(id) => {
                let id = *id;
                let force =
                    self.initial_poll || store.get(id).publish_mode == PublishMode::EveryPoll;
                self.poll_registers(store, transport, id, force);
                let poll = store.get(id);
                if poll.last_read_ok {
                    self.read_retries_left = self.max_read_retries;
                } else if self.read_retries_left > 0 {
                    retry = true;
                    self.read_retries_left -= 1;
                }
                ExecutedCommand {
                    slave_id: poll.slave_id,
                    register: poll.range.first,
                    is_poll: true,
                    ok: poll.last_read_ok,
                }
            }
            Command::Write(write) => {
                let ok = self.write_registers(store, transport, write);
                self.last_command_time = Some(Instant::now());
                if ok {
                    self.write_retries_left = self.max_write_retries;
                } else if self.write_retries_left > 0 {
                    retry = true;
                    self.write_retries_left -= 1;
                }
                ExecutedCommand {
                    slave_id: write.slave_id,
                    register: write.range.first,
                    is_poll: false,
                    ok,
                }
            }
        };

        self.last_slave = Some(result.slave_id);
        self.last_result = Some(result);
        self.fresh_command = false;

        if retry {
            // keep the command for the next step
            self.waiting = Some(command);
        } else {
            self.commands_left = self.commands_left.saturating_sub(1);
        }
    }

    fn poll_registers(
        &mut self,
        store: &mut PollStore,
        transport: &mut dyn Transport,
        id: PollId,
        force_send: bool,
    ) {
        let (slave_id, range) = {
            let poll = store.get(id);
            (poll.slave_id, poll.range)
        };
        let start = Instant::now();
        match transport.read(slave_id, &range) {
            Ok(new_values) => {
                log::trace!(
                    "register {slave_id}.{} polled in {}ms",
                    range.first,
                    start.elapsed().as_millis()
                );
                let poll = store.get_mut(id);
                poll.last_read_ok = true;
                if poll.last_values != new_values || force_send || poll.read_errors != 0 {
                    if poll.read_errors != 0 {
                        log::debug!(
                            "register {slave_id}.{} read ok after {} error(s)",
                            range.first,
                            poll.read_errors
                        );
                    }
                    poll.last_values = new_values.clone();
                    poll.read_errors = 0;
                    self.send_event(WorkerEvent::RegisterValues(RegisterValues {
                        slave_id,
                        range,
                        values: new_values,
                        command_id: None,
                    }));
                }
            }
            Err(e) => self.handle_read_error(store, id, &e.to_string()),
        }
        // updated regardless of outcome so a permanently failing register
        // keeps its cadence instead of hot-looping
        let now = Instant::now();
        store.get_mut(id).last_read = Some(now);
        self.last_command_time = Some(now);
    }

    fn handle_read_error(&mut self, store: &mut PollStore, id: PollId, message: &str) {
        let now = Instant::now();
        let poll = store.get_mut(id);
        poll.read_errors += 1;
        poll.last_read_ok = false;

        // one log line per suppression window, not one per failure
        let log_now = poll.read_errors == 1
            || poll
                .first_error_time
                .map_or(true, |t| now.duration_since(t) > DURATION_BETWEEN_LOG_ERROR);
        if log_now {
            log::error!(
                "{} error(s) when reading register {}.{}, last error: {message}",
                poll.read_errors,
                poll.slave_id,
                poll.range.first
            );
            poll.first_error_time = Some(now);
        }

        if poll.read_errors >= DEFAULT_READ_ERROR_COUNT {
            let (slave_id, range) = (poll.slave_id, poll.range);
            self.send_event(WorkerEvent::RegisterReadFailed { slave_id, range });
        }
    }

    fn write_registers(
        &self,
        store: &mut PollStore,
        transport: &mut dyn Transport,
        write: &RegisterWrite,
    ) -> bool {
        let start = Instant::now();
        match transport.write(write.slave_id, &write.range, &write.values) {
            Ok(()) => {
                log::debug!(
                    "register {}.{} written in {}ms",
                    write.slave_id,
                    write.range.first,
                    start.elapsed().as_millis()
                );
                store.apply_written_values(write.slave_id, &write.range, &write.values);
                self.send_event(WorkerEvent::RegisterValues(RegisterValues {
                    slave_id: write.slave_id,
                    range: write.range,
                    values: write.values.clone(),
                    command_id: write.command_id,
                }));
                true
            }
            Err(e) => {
                log::error!(
                    "error writing register {}.{}: {e}",
                    write.slave_id,
                    write.range.first
                );
                self.send_event(WorkerEvent::RegisterWriteFailed {
                    slave_id: write.slave_id,
                    range: write.range,
                });
                false
            }
        }
    }

    /// Next slave with queued work, cycling after `current` and falling
    /// back to `current` itself when everything else is drained.
    fn next_non_empty_slave(&self, current: u8) -> Option<u8> {
        let keys: Vec<u8> = self.slave_queues.keys().copied().collect();
        let start = keys.iter().position(|&k| k == current)?;
        for offset in 1..keys.len() {
            let candidate = keys[(start + offset) % keys.len()];
            if !self.slave_queues[&candidate].is_empty() {
                return Some(candidate);
            }
        }
        if !self.slave_queues[&current].is_empty() {
            Some(current)
        } else {
            None
        }
    }

    fn reset_commands_counter(&mut self) {
        let current = match self.current_slave {
            Some(slave_id) => slave_id,
            None => return,
        };
        if let Some(queue) = self.slave_queues.get(&current) {
            self.commands_left = if queue.poll_queue.is_empty() {
                WRITE_BATCH_SIZE
            } else {
                queue.poll_queue.len() * 2
            };
        }
    }

    fn silence(&self) -> Duration {
        self.last_command_time
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX)
    }

    fn send_event(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            log::debug!("event channel closed, dropping event");
        }
    }

    pub fn all_done(&self) -> bool {
        self.waiting.is_none() && self.slave_queues.values().all(|q| q.is_empty())
    }

    pub fn poll_done(&self) -> bool {
        if matches!(self.waiting, Some(Command::Poll(_))) {
            return false;
        }
        self.slave_queues.values().all(|q| q.poll_queue.is_empty())
    }

    /// The command executed by the last `execute_next` step, if it issued
    /// one.
    pub fn last_command(&self) -> Option<&ExecutedCommand> {
        self.last_result.as_ref()
    }

    pub fn commands_left(&self) -> usize {
        self.commands_left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::poll::{RegisterPoll, SlaveConfig};
    use crate::modbus::pollspec::PollDef;
    use crate::modbus::testing::{BusOp, MockTransport};
    use crate::modbus::types::{AddressRange, RegisterType};
    use flume::Receiver;

    struct Fixture {
        executor: Executor,
        store: PollStore,
        transport: MockTransport,
        events: Receiver<WorkerEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, rx) = flume::unbounded();
            Fixture {
                executor: Executor::new(tx),
                store: PollStore::new(),
                transport: MockTransport::new(),
                events: rx,
            }
        }

        fn add_poll(&mut self, slave_id: u8, first: u16, count: u16) -> PollId {
            self.store.insert(RegisterPoll::from_def(&PollDef::new(
                slave_id,
                AddressRange::new(first, count, RegisterType::Holding).unwrap(),
                Some(Duration::from_millis(100)),
            )))
        }

        fn step(&mut self) -> Duration {
            self.executor
                .execute_next(&mut self.store, &mut self.transport)
        }

        fn setup_initial(&mut self) {
            let map = self.store.by_slave();
            self.executor.setup_initial_poll(&map, &self.store);
        }

        fn drain_events(&self) -> Vec<WorkerEvent> {
            self.events.try_iter().collect()
        }
    }

    #[test]
    fn returns_max_for_empty_register_set() {
        let mut f = Fixture::new();
        f.setup_initial();
        assert_eq!(f.step(), Duration::MAX);
        assert!(f.executor.all_done());
    }

    #[test]
    fn initial_poll_reads_single_register_immediately() {
        let mut f = Fixture::new();
        f.transport.set_register(1, RegisterType::Holding, 1, 5);
        let id = f.add_poll(1, 1, 1);
        f.setup_initial();

        assert_eq!(f.step(), Duration::ZERO);
        assert_eq!(f.store.get(id).last_values, vec![5]);
        assert!(f.executor.all_done());

        let events = f.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            WorkerEvent::RegisterValues(v) => assert_eq!(v.values, vec![5]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn initial_poll_covers_multiple_slaves() {
        let mut f = Fixture::new();
        f.transport.set_register(1, RegisterType::Holding, 1, 5);
        f.transport.set_register(2, RegisterType::Holding, 20, 60);
        let a = f.add_poll(1, 1, 1);
        let b = f.add_poll(2, 20, 1);
        f.setup_initial();

        assert_eq!(f.step(), Duration::ZERO);
        assert!(!f.executor.all_done());
        assert_eq!(f.step(), Duration::ZERO);
        assert!(f.executor.all_done());
        assert!(!f.executor.is_initial_poll());
        assert_eq!(f.store.get(a).last_values, vec![5]);
        assert_eq!(f.store.get(b).last_values, vec![60]);
    }

    #[test]
    fn unchanged_values_do_not_emit_after_initial_poll() {
        let mut f = Fixture::new();
        f.transport.set_register(1, RegisterType::Holding, 1, 5);
        f.add_poll(1, 1, 1);
        f.setup_initial();
        f.step();
        f.drain_events();

        let map = f.store.by_slave();
        f.executor.add_polls(&map, &f.store, false);
        f.step();
        assert!(f.drain_events().is_empty(), "no event for unchanged value");

        // changed value emits again
        f.transport.set_register(1, RegisterType::Holding, 1, 6);
        let map = f.store.by_slave();
        f.executor.add_polls(&map, &f.store, false);
        f.step();
        let events = f.drain_events();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn every_poll_mode_emits_unchanged_values() {
        let mut f = Fixture::new();
        f.transport.set_register(1, RegisterType::Holding, 1, 5);
        let id = f.add_poll(1, 1, 1);
        f.store.get_mut(id).publish_mode = PublishMode::EveryPoll;
        f.setup_initial();
        f.step();
        f.drain_events();

        let map = f.store.by_slave();
        f.executor.add_polls(&map, &f.store, false);
        f.step();
        assert_eq!(f.drain_events().len(), 1);
    }

    #[test]
    fn read_failure_emits_after_threshold() {
        let mut f = Fixture::new();
        let id = f.add_poll(1, 1, 1);
        f.transport.fail_reads(1, RegisterType::Holding, 1, 100);
        f.setup_initial();

        for _ in 0..DEFAULT_READ_ERROR_COUNT - 1 {
            f.step();
            let map = f.store.by_slave();
            f.executor.add_polls(&map, &f.store, false);
        }
        assert!(f.drain_events().is_empty());

        f.step();
        let events = f.drain_events();
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::RegisterReadFailed { .. })
        ));
        assert_eq!(f.store.get(id).read_errors, DEFAULT_READ_ERROR_COUNT);
    }

    #[test]
    fn recovery_after_read_errors_emits_values() {
        let mut f = Fixture::new();
        f.transport.set_register(1, RegisterType::Holding, 1, 5);
        let id = f.add_poll(1, 1, 1);
        f.setup_initial();
        f.step();
        f.drain_events();

        f.transport.fail_reads(1, RegisterType::Holding, 1, 1);
        let map = f.store.by_slave();
        f.executor.add_polls(&map, &f.store, false);
        f.step();
        assert!(!f.store.get(id).last_read_ok);

        // same value as before the failure still emits, flagging recovery
        let map = f.store.by_slave();
        f.executor.add_polls(&map, &f.store, false);
        f.step();
        let events = f.drain_events();
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::RegisterValues(_))
        ));
        assert_eq!(f.store.get(id).read_errors, 0);
    }

    #[test]
    fn failed_poll_retries_before_moving_on() {
        let mut f = Fixture::new();
        let id = f.add_poll(1, 1, 1);
        f.store.get_mut(id).max_read_retries = 2;
        f.add_poll(2, 1, 1);
        f.transport.fail_reads(1, RegisterType::Holding, 1, 100);
        f.setup_initial();

        // first slave: initial attempt + 2 retries before rotation
        f.step();
        f.step();
        f.step();
        f.step();
        let reads: Vec<u8> = f
            .transport
            .operations()
            .iter()
            .map(|op| match op {
                BusOp::Read { slave_id, .. } => *slave_id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(reads, vec![1, 1, 1, 2]);
    }

    #[test]
    fn write_success_confirms_with_values() {
        let mut f = Fixture::new();
        let range = AddressRange::new(5, 2, RegisterType::Holding).unwrap();
        let mut write = RegisterWrite::new(1, range, vec![2, 1]);
        write.command_id = Some(7);
        f.executor.add_write(write);

        assert_eq!(f.step(), Duration::ZERO);
        let events = f.drain_events();
        match &events[0] {
            WorkerEvent::RegisterValues(v) => {
                assert_eq!(v.values, vec![2, 1]);
                assert_eq!(v.command_id, Some(7));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(f.transport.register(1, RegisterType::Holding, 5), Some(2));
        assert_eq!(f.transport.register(1, RegisterType::Holding, 6), Some(1));
        assert!(f.executor.all_done());
    }

    #[test]
    fn write_success_updates_covering_poll_values() {
        let mut f = Fixture::new();
        f.transport.set_register(1, RegisterType::Holding, 5, 9);
        let id = f.add_poll(1, 5, 1);
        f.setup_initial();
        f.step();
        f.drain_events();

        let range = AddressRange::new(5, 1, RegisterType::Holding).unwrap();
        f.executor.add_write(RegisterWrite::new(1, range, vec![42]));
        f.step();
        f.drain_events();
        assert_eq!(f.store.get(id).last_values, vec![42]);

        // the next poll sees the written value as unchanged
        let map = f.store.by_slave();
        f.executor.add_polls(&map, &f.store, false);
        f.step();
        assert!(f.drain_events().is_empty());
    }

    #[test]
    fn failed_write_retries_then_drops() {
        let mut f = Fixture::new();
        let range = AddressRange::new(5, 1, RegisterType::Holding).unwrap();
        let mut write = RegisterWrite::new(1, range, vec![1]);
        write.max_write_retries = 2;
        f.transport.fail_writes(1, RegisterType::Holding, 5, 100);
        f.executor.add_write(write);

        f.step();
        f.step();
        f.step();
        assert!(f.executor.all_done(), "write dropped after retries");
        let failures = f
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, WorkerEvent::RegisterWriteFailed { .. }))
            .count();
        assert_eq!(failures, 3);
        // a fourth step has nothing left to do
        assert_eq!(f.step(), Duration::MAX);
    }

    #[test]
    fn writes_interleave_with_polls_on_same_slave() {
        let mut f = Fixture::new();
        f.add_poll(1, 1, 1);
        f.add_poll(1, 10, 1);
        f.setup_initial();
        let range = AddressRange::new(20, 1, RegisterType::Holding).unwrap();
        f.executor.add_write(RegisterWrite::new(1, range, vec![1]));

        f.step();
        f.step();
        f.step();
        let kinds: Vec<bool> = f
            .transport
            .operations()
            .iter()
            .map(|op| matches!(op, BusOp::Read { .. }))
            .collect();
        assert_eq!(kinds, vec![true, false, true]);
    }

    #[test]
    fn every_time_delay_is_honored_between_commands() {
        let mut f = Fixture::new();
        f.transport.set_register(1, RegisterType::Holding, 1, 5);
        let id = f.add_poll(1, 1, 1);
        f.store.get_mut(id).apply_slave_config(&SlaveConfig {
            address: 1,
            delay_before_command: Duration::from_millis(50),
            ..SlaveConfig::default()
        });
        f.setup_initial();

        // no silence requirement on the very first command
        assert_eq!(f.step(), Duration::ZERO);

        let map = f.store.by_slave();
        f.executor.add_polls(&map, &f.store, false);
        let wait = f.step();
        assert!(wait > Duration::from_millis(40), "wait was {wait:?}");
        assert!(!f.executor.all_done());

        // insufficient sleep still leaves a residue
        std::thread::sleep(Duration::from_millis(20));
        let wait = f.step();
        assert!(wait > Duration::ZERO);
        assert!(wait < Duration::from_millis(40));

        std::thread::sleep(wait + Duration::from_millis(1));
        assert_eq!(f.step(), Duration::ZERO);
        assert!(f.executor.all_done());
    }

    #[test]
    fn on_slave_change_delay_applies_only_across_slaves() {
        let mut f = Fixture::new();
        let a = f.add_poll(1, 1, 1);
        f.add_poll(1, 10, 1);
        let b = f.add_poll(2, 1, 1);
        for id in [a, b] {
            f.store.get_mut(id).apply_slave_config(&SlaveConfig {
                address: 0,
                delay_before_first_command: Duration::from_millis(50),
                ..SlaveConfig::default()
            });
        }
        f.setup_initial();

        // slave 1 register 1: first command ever, silence is infinite
        assert_eq!(f.step(), Duration::ZERO);
        // slave 1 register 10: same slave, no first-command delay
        assert_eq!(f.step(), Duration::ZERO);
        // slave 2: slave change enforces the delay
        let wait = f.step();
        assert!(wait > Duration::from_millis(40), "wait was {wait:?}");
        std::thread::sleep(wait + Duration::from_millis(1));
        assert_eq!(f.step(), Duration::ZERO);
        assert!(f.executor.all_done());
    }

    #[test]
    fn write_batch_size_limits_consecutive_writes() {
        let mut f = Fixture::new();
        let range = AddressRange::new(1, 1, RegisterType::Holding).unwrap();
        for _ in 0..WRITE_BATCH_SIZE + 2 {
            f.executor
                .add_write(RegisterWrite::new(1, range, vec![1]));
        }
        f.add_poll(2, 1, 1);
        let map: BTreeMap<u8, Vec<PollId>> =
            [(2u8, f.store.by_slave()[&2].clone())].into_iter().collect();
        f.executor.add_polls(&map, &f.store, false);

        let mut slave_order = Vec::new();
        loop {
            let wait = f.step();
            if wait == Duration::MAX {
                break;
            }
            if let Some(cmd) = f.executor.last_command() {
                slave_order.push(cmd.slave_id);
            }
        }
        // the poll on slave 2 ran before the write backlog drained
        let poll_pos = slave_order.iter().position(|&s| s == 2).unwrap();
        assert!(poll_pos <= WRITE_BATCH_SIZE);
        assert_eq!(
            slave_order.iter().filter(|&&s| s == 1).count(),
            WRITE_BATCH_SIZE + 2
        );
    }

    #[test]
    fn poll_done_tracks_outstanding_polls() {
        let mut f = Fixture::new();
        f.add_poll(1, 1, 1);
        f.setup_initial();
        assert!(!f.executor.poll_done());
        f.step();
        assert!(f.executor.poll_done());

        let range = AddressRange::new(1, 1, RegisterType::Holding).unwrap();
        f.executor.add_write(RegisterWrite::new(1, range, vec![1]));
        assert!(f.executor.poll_done());
        assert!(!f.executor.all_done());
    }
}
