use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::modbus::pollspec::PollDef;
use crate::modbus::types::{AddressRange, CommandDelay, PublishMode};

/// Read-error events propagate after this many consecutive failures.
pub const DEFAULT_READ_ERROR_COUNT: u32 = 3;
/// Repeated read errors for one poll are logged at most once per window.
pub const DURATION_BETWEEN_LOG_ERROR: Duration = Duration::from_secs(5 * 60);

/// Copyable handle into the worker's poll store. MQTT-side code and the
/// request queues carry these instead of owning references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PollId(pub usize);

/// Runtime state of one poll group, owned exclusively by its network worker.
#[derive(Debug, Clone)]
pub struct RegisterPoll {
    pub slave_id: u8,
    pub range: AddressRange,
    pub refresh: Option<Duration>,
    pub publish_mode: PublishMode,

    pub last_values: Vec<u16>,
    pub last_read: Option<Instant>,
    pub last_read_ok: bool,
    pub read_errors: u32,
    pub first_error_time: Option<Instant>,

    pub delay_before_command: CommandDelay,
    pub delay_before_first_command: CommandDelay,
    pub max_read_retries: u16,
}

impl RegisterPoll {
    pub fn from_def(def: &PollDef) -> Self {
        RegisterPoll {
            slave_id: def.slave_id,
            range: def.range,
            refresh: def.refresh,
            publish_mode: def.publish_mode,
            last_values: vec![0; usize::from(def.range.count)],
            last_read: None,
            last_read_ok: false,
            read_errors: 0,
            first_error_time: None,
            delay_before_command: CommandDelay::NONE,
            delay_before_first_command: CommandDelay::NONE,
            max_read_retries: 0,
        }
    }

    pub fn apply_slave_config(&mut self, config: &SlaveConfig) {
        self.delay_before_command = CommandDelay::every_time(config.delay_before_command);
        self.delay_before_first_command =
            CommandDelay::on_slave_change(config.delay_before_first_command);
        self.max_read_retries = config.read_retries;
    }

    /// The delay to honor before issuing this poll. The first command to a
    /// slave since (re)connect uses the first-command delay when one is set.
    pub fn effective_delay(&self, first_touch: bool) -> CommandDelay {
        if first_touch && !self.delay_before_first_command.is_zero() {
            self.delay_before_first_command
        } else {
            self.delay_before_command
        }
    }
}

/// A pending write popped from an MQTT command, destroyed after success or
/// final retry exhaustion.
#[derive(Debug, Clone)]
pub struct RegisterWrite {
    pub slave_id: u8,
    pub range: AddressRange,
    pub values: Vec<u16>,
    /// Echoed on the confirmation event for command correlation.
    pub command_id: Option<u64>,
    pub delay_before_command: CommandDelay,
    pub delay_before_first_command: CommandDelay,
    pub max_write_retries: u16,
}

impl RegisterWrite {
    pub fn new(slave_id: u8, range: AddressRange, values: Vec<u16>) -> Self {
        RegisterWrite {
            slave_id,
            range,
            values,
            command_id: None,
            delay_before_command: CommandDelay::NONE,
            delay_before_first_command: CommandDelay::NONE,
            max_write_retries: 0,
        }
    }

    pub fn apply_slave_config(&mut self, config: &SlaveConfig) {
        self.delay_before_command = CommandDelay::every_time(config.delay_before_command);
        self.delay_before_first_command =
            CommandDelay::on_slave_change(config.delay_before_first_command);
        self.max_write_retries = config.write_retries;
    }

    pub fn effective_delay(&self, first_touch: bool) -> CommandDelay {
        if first_touch && !self.delay_before_first_command.is_zero() {
            self.delay_before_first_command
        } else {
            self.delay_before_command
        }
    }
}

/// Timing and retry overrides for one slave, folded from network defaults
/// and the per-slave configuration section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaveConfig {
    pub address: u8,
    pub name: Option<String>,
    pub delay_before_command: Duration,
    pub delay_before_first_command: Duration,
    pub read_retries: u16,
    pub write_retries: u16,
}

/// The authoritative list of polls for one network. Everything else refers
/// to entries through `PollId` handles.
#[derive(Debug, Default)]
pub struct PollStore {
    polls: Vec<RegisterPoll>,
}

impl PollStore {
    pub fn new() -> Self {
        PollStore { polls: Vec::new() }
    }

    pub fn insert(&mut self, poll: RegisterPoll) -> PollId {
        self.polls.push(poll);
        PollId(self.polls.len() - 1)
    }

    pub fn get(&self, id: PollId) -> &RegisterPoll {
        &self.polls[id.0]
    }

    pub fn get_mut(&mut self, id: PollId) -> &mut RegisterPoll {
        &mut self.polls[id.0]
    }

    pub fn len(&self) -> usize {
        self.polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = PollId> + '_ {
        (0..self.polls.len()).map(PollId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PollId, &RegisterPoll)> {
        self.polls.iter().enumerate().map(|(i, p)| (PollId(i), p))
    }

    /// Poll handles grouped per slave, the shape both the scheduler and the
    /// executor consume.
    pub fn by_slave(&self) -> BTreeMap<u8, Vec<PollId>> {
        let mut map: BTreeMap<u8, Vec<PollId>> = BTreeMap::new();
        for (id, poll) in self.iter() {
            map.entry(poll.slave_id).or_default().push(id);
        }
        map
    }

    /// After a successful write, refresh the cached values of polls covering
    /// the written registers so the next poll does not re-emit them as a
    /// change.
    pub fn apply_written_values(&mut self, slave_id: u8, range: &AddressRange, values: &[u16]) {
        let now = Instant::now();
        for poll in &mut self.polls {
            if poll.slave_id != slave_id || !poll.range.overlaps(range) {
                continue;
            }
            let first = poll.range.first.max(range.first);
            let last = poll.range.last().min(range.last());
            for number in first..=last {
                let poll_idx = usize::from(number - poll.range.first);
                let write_idx = usize::from(number - range.first);
                poll.last_values[poll_idx] = values[write_idx];
            }
            if poll.last_read.is_some() {
                poll.last_read = Some(now);
            }
        }
    }

    pub fn min_refresh(&self) -> Option<Duration> {
        self.polls.iter().filter_map(|p| p.refresh).min()
    }
}
