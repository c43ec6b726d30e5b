//! The MQTT side of the bridge: the object model mapping register state to
//! topics, payload formatting, and the broker client.

pub mod client;
pub mod object;
pub mod payload;
