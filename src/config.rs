//! Declarative configuration: broker, Modbus networks with their slaves
//! and poll groups, and the MQTT objects mapping registers to topics.
//!
//! Register identifiers accept `network.slave.number` with decimal
//! (1-based) or `0x` hex (0-based) addresses; `${network}`,
//! `${slave_address}` and `${slave_name}` placeholders expand in topic
//! strings.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::{BridgeError, Result};
use crate::modbus::poll::SlaveConfig;
use crate::modbus::pollspec::PollDef;
use crate::modbus::transport::{
    RtuRtsMode, RtuSerialMode, RtuSettings, TcpSettings,
};
use crate::modbus::types::{AddressRange, PublishMode, RegisterType};
use crate::mqtt::client::BrokerSettings;

const MAX_RESPONSE_TIMEOUT_MS: u64 = 999;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default, rename = "network")]
    pub networks: Vec<NetworkSection>,
    #[serde(default, rename = "object")]
    pub objects: Vec<ObjectSection>,
}

impl Config {
    pub fn from_str(source: &str) -> Result<Config> {
        let config: Config = toml::from_str(source)
            .map_err(|e| BridgeError::config(format!("{e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Config::from_str(&source)
    }

    fn validate(&self) -> Result<()> {
        if self.networks.is_empty() {
            return Err(BridgeError::config("no modbus networks configured"));
        }
        for (i, network) in self.networks.iter().enumerate() {
            network.validate()?;
            if self.networks[..i].iter().any(|n| n.name == network.name) {
                return Err(BridgeError::config(format!(
                    "duplicate network name '{}'",
                    network.name
                )));
            }
        }
        if self.objects.is_empty() {
            return Err(BridgeError::config("no mqtt objects configured"));
        }
        for object in &self.objects {
            object.validate(self)?;
        }
        Ok(())
    }

    pub fn network(&self, name: &str) -> Option<&NetworkSection> {
        self.networks.iter().find(|n| n.name == name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttSection {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_client_id() -> String {
    "modbridge".into()
}

fn default_host() -> String {
    "localhost".into()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keepalive_secs() -> u64 {
    60
}

impl Default for MqttSection {
    fn default() -> Self {
        MqttSection {
            client_id: default_client_id(),
            host: default_host(),
            port: default_mqtt_port(),
            keepalive_secs: default_keepalive_secs(),
            username: None,
            password: None,
        }
    }
}

impl MqttSection {
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            keepalive: Duration::from_secs(self.keepalive_secs),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSection {
    pub name: String,

    // RTU
    pub device: Option<String>,
    pub baud: Option<u32>,
    pub parity: Option<String>,
    #[serde(default = "default_data_bit")]
    pub data_bit: u8,
    #[serde(default = "default_stop_bit")]
    pub stop_bit: u8,
    pub rtu_serial_mode: Option<String>,
    pub rtu_rts_mode: Option<String>,
    #[serde(default)]
    pub rtu_rts_delay_us: u32,

    // TCP
    pub address: Option<String>,
    pub port: Option<u16>,

    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default)]
    pub response_data_timeout_ms: u64,

    #[serde(default)]
    pub delay_before_command_ms: u64,
    #[serde(default)]
    pub delay_before_first_command_ms: u64,
    #[serde(default = "default_read_retries")]
    pub read_retries: u16,
    #[serde(default = "default_write_retries")]
    pub write_retries: u16,

    pub watchdog: Option<WatchdogSection>,

    #[serde(default, rename = "slave")]
    pub slaves: Vec<SlaveSection>,
}

fn default_data_bit() -> u8 {
    8
}

fn default_stop_bit() -> u8 {
    1
}

fn default_response_timeout_ms() -> u64 {
    500
}

fn default_read_retries() -> u16 {
    1
}

fn default_write_retries() -> u16 {
    2
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchdogSection {
    pub watch_period_ms: Option<u64>,
}

/// Resolved transport parameters for one network.
#[derive(Debug, Clone)]
pub enum TransportSettings {
    Rtu(RtuSettings),
    Tcp(TcpSettings),
}

impl NetworkSection {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BridgeError::config("network name is an empty string"));
        }
        if self.response_timeout_ms > MAX_RESPONSE_TIMEOUT_MS {
            return Err(BridgeError::config(format!(
                "network '{}': response_timeout_ms must be in range 0-{MAX_RESPONSE_TIMEOUT_MS}",
                self.name
            )));
        }
        if self.response_data_timeout_ms > MAX_RESPONSE_TIMEOUT_MS {
            return Err(BridgeError::config(format!(
                "network '{}': response_data_timeout_ms must be in range 0-{MAX_RESPONSE_TIMEOUT_MS}",
                self.name
            )));
        }
        self.transport_settings()?;
        for slave in &self.slaves {
            slave.parse_addresses()?;
        }
        Ok(())
    }

    pub fn transport_settings(&self) -> Result<TransportSettings> {
        match (&self.device, &self.address) {
            (Some(device), None) => {
                let baud = self.baud.ok_or_else(|| {
                    BridgeError::config(format!("network '{}': missing 'baud'", self.name))
                })?;
                let parity = self.parity.as_deref().unwrap_or("N");
                if parity.len() != 1 || !"NEO".contains(parity) {
                    return Err(BridgeError::config(format!(
                        "network '{}': parity must be one of N, E, O",
                        self.name
                    )));
                }
                let serial_mode = match self.rtu_serial_mode.as_deref() {
                    None => RtuSerialMode::Unspecified,
                    Some("rs232") => RtuSerialMode::Rs232,
                    Some("rs485") => RtuSerialMode::Rs485,
                    Some(other) => {
                        return Err(BridgeError::config(format!(
                            "network '{}': unknown rtu_serial_mode '{other}'",
                            self.name
                        )))
                    }
                };
                let rts_mode = match self.rtu_rts_mode.as_deref() {
                    None | Some("none") => RtuRtsMode::None,
                    Some("up") => RtuRtsMode::Up,
                    Some("down") => RtuRtsMode::Down,
                    Some(other) => {
                        return Err(BridgeError::config(format!(
                            "network '{}': unknown rtu_rts_mode '{other}'",
                            self.name
                        )))
                    }
                };
                Ok(TransportSettings::Rtu(RtuSettings {
                    device: device.clone(),
                    baud,
                    parity: parity.chars().next().unwrap_or('N'),
                    data_bit: self.data_bit,
                    stop_bit: self.stop_bit,
                    serial_mode,
                    rts_mode,
                    rts_delay_us: self.rtu_rts_delay_us,
                    response_timeout: Duration::from_millis(self.response_timeout_ms),
                    response_data_timeout: Duration::from_millis(self.response_data_timeout_ms),
                }))
            }
            (None, Some(address)) => {
                let port = self.port.ok_or_else(|| {
                    BridgeError::config(format!("network '{}': missing 'port'", self.name))
                })?;
                Ok(TransportSettings::Tcp(TcpSettings {
                    address: address.clone(),
                    port,
                    response_timeout: Duration::from_millis(self.response_timeout_ms),
                }))
            }
            (Some(_), Some(_)) => Err(BridgeError::config(format!(
                "network '{}': both 'device' and 'address' given",
                self.name
            ))),
            (None, None) => Err(BridgeError::config(format!(
                "network '{}': cannot determine type, missing 'device' or 'address'",
                self.name
            ))),
        }
    }

    pub fn watch_period(&self) -> Option<Duration> {
        self.watchdog
            .as_ref()
            .and_then(|w| w.watch_period_ms)
            .map(Duration::from_millis)
    }

    /// Network-level timing defaults applied to slaves without overrides.
    pub fn default_slave_config(&self) -> SlaveConfig {
        SlaveConfig {
            address: 0,
            name: None,
            delay_before_command: Duration::from_millis(self.delay_before_command_ms),
            delay_before_first_command: Duration::from_millis(self.delay_before_first_command_ms),
            read_retries: self.read_retries,
            write_retries: self.write_retries,
        }
    }

    /// Per-slave configs with network defaults folded in, address ranges
    /// expanded to one entry per address.
    pub fn slave_configs(&self) -> Result<Vec<SlaveConfig>> {
        let mut configs = Vec::new();
        for slave in &self.slaves {
            for address in slave.parse_addresses()? {
                let defaults = self.default_slave_config();
                configs.push(SlaveConfig {
                    address,
                    name: slave.name.clone(),
                    delay_before_command: slave
                        .delay_before_command_ms
                        .map(Duration::from_millis)
                        .unwrap_or(defaults.delay_before_command),
                    delay_before_first_command: slave
                        .delay_before_first_command_ms
                        .map(Duration::from_millis)
                        .unwrap_or(defaults.delay_before_first_command),
                    read_retries: slave.read_retries.unwrap_or(defaults.read_retries),
                    write_retries: slave.write_retries.unwrap_or(defaults.write_retries),
                });
            }
        }
        Ok(configs)
    }

    /// Poll groups declared on slaves, as cadence-free polls that shape the
    /// ranges the network reads in one transaction.
    pub fn poll_group_defs(&self) -> Result<Vec<PollDef>> {
        let mut defs = Vec::new();
        for slave in &self.slaves {
            for address in slave.parse_addresses()? {
                for group in &slave.poll_groups {
                    let number = decimal_register_number(group.register).map_err(|e| {
                        BridgeError::config(format!(
                            "network '{}' slave {address}: {e}",
                            self.name
                        ))
                    })?;
                    defs.push(PollDef::new(
                        address,
                        AddressRange::new(number, group.count, group.register_type)?,
                        None,
                    ));
                }
            }
        }
        Ok(defs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AddressSpec {
    Number(u8),
    Range(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlaveSection {
    pub address: AddressSpec,
    pub name: Option<String>,
    pub delay_before_command_ms: Option<u64>,
    pub delay_before_first_command_ms: Option<u64>,
    pub read_retries: Option<u16>,
    pub write_retries: Option<u16>,
    #[serde(default, rename = "poll_group")]
    pub poll_groups: Vec<PollGroupSection>,
}

impl SlaveSection {
    pub fn parse_addresses(&self) -> Result<Vec<u8>> {
        match &self.address {
            AddressSpec::Number(address) => Ok(vec![*address]),
            AddressSpec::Range(spec) => {
                let parse = |s: &str| {
                    s.trim().parse::<u8>().map_err(|_| {
                        BridgeError::config(format!("invalid slave address '{spec}'"))
                    })
                };
                match spec.split_once('-') {
                    Some((from, to)) => {
                        let from = parse(from)?;
                        let to = parse(to)?;
                        if from > to {
                            return Err(BridgeError::config(format!(
                                "slave address range '{spec}' is reversed"
                            )));
                        }
                        Ok((from..=to).collect())
                    }
                    None => Ok(vec![parse(spec)?]),
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollGroupSection {
    pub register: u16,
    #[serde(default = "default_register_type")]
    pub register_type: RegisterType,
    #[serde(default = "default_count")]
    pub count: u16,
}

fn default_register_type() -> RegisterType {
    RegisterType::Holding
}

fn default_count() -> u16 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectSection {
    pub topic: String,
    pub network: Option<String>,
    pub slave: Option<u8>,
    pub refresh_ms: Option<u64>,
    #[serde(default)]
    pub publish_mode: PublishMode,
    #[serde(default)]
    pub retain: bool,
    pub state: Option<DataNodeSection>,
    pub availability: Option<DataNodeSection>,
    #[serde(default, rename = "command")]
    pub commands: Vec<CommandSection>,
}

fn default_refresh_ms() -> u64 {
    5000
}

impl ObjectSection {
    fn validate(&self, config: &Config) -> Result<()> {
        if self.topic.is_empty() {
            return Err(BridgeError::config("object topic is an empty string"));
        }
        if self.state.is_none() && self.commands.is_empty() {
            return Err(BridgeError::config(format!(
                "object '{}': needs a state section or commands",
                self.topic
            )));
        }
        if let Some(network) = &self.network {
            if config.network(network).is_none() {
                return Err(BridgeError::config(format!(
                    "object '{}': unknown network '{network}'",
                    self.topic
                )));
            }
        }
        for command in &self.commands {
            if let Some(payload_type) = &command.payload_type {
                if payload_type != "string" {
                    return Err(BridgeError::config(format!(
                        "object '{}': unknown payload type '{payload_type}'",
                        self.topic
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_millis(self.refresh_ms.unwrap_or_else(default_refresh_ms))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RegisterRef {
    Number(i64),
    Name(String),
}

impl RegisterRef {
    pub fn as_spec(&self) -> String {
        match self {
            RegisterRef::Number(n) => n.to_string(),
            RegisterRef::Name(s) => s.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataNodeSection {
    pub name: Option<String>,
    pub register: Option<RegisterRef>,
    pub register_type: Option<RegisterType>,
    pub count: Option<u16>,
    pub converter: Option<String>,
    pub refresh_ms: Option<u64>,
    pub available_value: Option<i64>,
    #[serde(default)]
    pub registers: Vec<DataNodeSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSection {
    pub name: String,
    pub register: RegisterRef,
    pub register_type: Option<RegisterType>,
    pub count: Option<u16>,
    pub converter: Option<String>,
    pub payload_type: Option<String>,
}

/// Parsed `network.slave.number` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRegisterIdent {
    pub network: String,
    pub slave_id: u8,
    pub number: u16,
}

/// Decimal register specs are 1-based, hex specs 0-based.
fn decimal_register_number(number: u16) -> Result<u16> {
    number
        .checked_sub(1)
        .ok_or_else(|| BridgeError::config("decimal register numbers are 1-based"))
}

pub fn parse_register_ident(
    spec: &str,
    default_network: Option<&str>,
    default_slave: Option<u8>,
) -> Result<ParsedRegisterIdent> {
    let re = Regex::new(r"^([a-zA-Z][a-zA-Z0-9_]*\.)?([0-9]+\.)?((0[xX])?[0-9a-fA-F]+)$")
        .expect("static regex");
    let spec = spec.trim();
    let captures = re
        .captures(spec)
        .ok_or_else(|| BridgeError::config(format!("invalid register specification '{spec}'")))?;

    let network = match captures.get(1) {
        Some(m) => m.as_str().trim_end_matches('.').to_string(),
        None => default_network
            .map(str::to_string)
            .ok_or_else(|| {
                BridgeError::config(format!("unknown network in register spec '{spec}'"))
            })?,
    };

    let slave_id = match captures.get(2) {
        Some(m) => m
            .as_str()
            .trim_end_matches('.')
            .parse::<u8>()
            .map_err(|_| BridgeError::config(format!("invalid slave id in '{spec}'")))?,
        None => default_slave.ok_or_else(|| {
            BridgeError::config(format!("unknown slave id in register spec '{spec}'"))
        })?,
    };

    let number_str = captures.get(3).map(|m| m.as_str()).unwrap_or_default();
    let number = if let Some(hex) = number_str
        .strip_prefix("0x")
        .or_else(|| number_str.strip_prefix("0X"))
    {
        u16::from_str_radix(hex, 16)
            .map_err(|_| BridgeError::config(format!("invalid register number in '{spec}'")))?
    } else {
        let decimal = number_str
            .parse::<u16>()
            .map_err(|_| BridgeError::config(format!("invalid register number in '{spec}'")))?;
        decimal_register_number(decimal)
            .map_err(|_| BridgeError::config(format!("register number in '{spec}' must be >= 1")))?
    };

    Ok(ParsedRegisterIdent {
        network,
        slave_id,
        number,
    })
}

/// Expand `${network}`, `${slave_address}` and `${slave_name}` in a topic
/// string. Unresolved placeholders are a configuration error.
pub fn expand_topic(
    topic: &str,
    network: Option<&str>,
    slave_address: Option<u8>,
    slave_name: Option<&str>,
) -> Result<String> {
    let mut expanded = topic.to_string();
    if let Some(network) = network {
        expanded = expanded.replace("${network}", network);
    }
    if let Some(address) = slave_address {
        expanded = expanded.replace("${slave_address}", &address.to_string());
    }
    if let Some(name) = slave_name {
        expanded = expanded.replace("${slave_name}", name);
    }
    if let Some(start) = expanded.find("${") {
        let end = expanded[start..].find('}').map(|e| start + e + 1);
        let placeholder = &expanded[start..end.unwrap_or(expanded.len())];
        return Err(BridgeError::config(format!(
            "unresolved placeholder '{placeholder}' in topic '{topic}'"
        )));
    }
    Ok(expanded)
}
