//! modbridge — a bidirectional bridge between Modbus fieldbuses (RTU over
//! serial, TCP over IP) and an MQTT broker.
//!
//! One worker thread per Modbus network polls registers on a schedule and
//! turns changed values into MQTT publishes; command messages flow the
//! other way and become register writes. All cross-thread traffic runs
//! over bounded flume channels; the main thread multiplexes worker events,
//! broker events, and signals.

pub mod boot;
pub mod bridge;
pub mod config;
pub mod conv;
pub mod error;
pub mod modbus;
pub mod mqtt;
pub mod signal;
