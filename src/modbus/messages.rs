use crate::modbus::poll::{RegisterWrite, SlaveConfig};
use crate::modbus::pollspec::PollDef;
use crate::modbus::types::AddressRange;

/// Control messages from the main thread to a network worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Per-slave delays and retry caps; must arrive before the poll
    /// specification to take effect on existing polls.
    SlaveConfig(SlaveConfig),
    /// Grouped polls for this network, installed once at startup.
    PollSpecification(Vec<PollDef>),
    /// A register write derived from an MQTT command message.
    Write(RegisterWrite),
    /// Broker connectivity; polling is paused while the broker is down.
    MqttState(bool),
    Shutdown,
}

/// A successful read or write confirmation, addressed by register range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterValues {
    pub slave_id: u8,
    pub range: AddressRange,
    pub values: Vec<u16>,
    /// Present on write confirmations, echoing the originating command.
    pub command_id: Option<u64>,
}

/// Events from a network worker to the main thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    RegisterValues(RegisterValues),
    RegisterReadFailed { slave_id: u8, range: AddressRange },
    RegisterWriteFailed { slave_id: u8, range: AddressRange },
    NetworkState(bool),
}
