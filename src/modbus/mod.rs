//! The Modbus side of the bridge: typed register ranges, the poll-spec
//! builder, per-network scheduling and execution, and the worker thread
//! that owns one transport.

pub mod executor;
pub mod messages;
pub mod poll;
pub mod pollspec;
pub mod queues;
pub mod scheduler;
#[doc(hidden)]
pub mod testing;
pub mod transport;
pub mod types;
pub mod watchdog;
pub mod worker;
