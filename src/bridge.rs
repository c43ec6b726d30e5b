use std::collections::BTreeMap;
use std::sync::Arc;

use flume::Receiver;

use crate::config::{
    expand_topic, parse_register_ident, Config, DataNodeSection, ObjectSection, TransportSettings,
};
use crate::conv::std_conv::DefaultCommandConverter;
use crate::conv::{Converter, ConverterRegistry, MqttValue};
use crate::error::{BridgeError, Result};
use crate::modbus::messages::{RegisterValues, WorkerCommand, WorkerEvent};
use crate::modbus::poll::RegisterWrite;
use crate::modbus::pollspec::{PollDef, PollSpec};
use crate::modbus::transport::{RtuTransport, TcpTransport, Transport};
use crate::modbus::types::{AddressRange, PublishMode, RegisterType};
use crate::modbus::worker::{spawn_worker, NetworkHandle};
use crate::mqtt::client::{MqttConnection, MqttEvent};
use crate::mqtt::object::{AvailableFlag, DataNode, MqttObject, NodeTree, RegisterIdent};
use crate::mqtt::payload;

/// A subscribed command topic bound to a register write target.
pub struct CommandBinding {
    pub topic: String,
    pub network: String,
    pub slave_id: u8,
    pub range: AddressRange,
    pub converter: Option<Arc<dyn Converter>>,
    pub id: u64,
}

/// Everything derived from the object configuration: the MQTT object tree,
/// command bindings, and the per-network poll specifications.
pub struct ObjectModel {
    pub objects: Vec<MqttObject>,
    pub commands: Vec<CommandBinding>,
    pub specs: BTreeMap<String, PollSpec>,
}

impl std::fmt::Debug for ObjectModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectModel")
            .field("objects", &self.objects.len())
            .field("commands", &self.commands.len())
            .field("specs", &self.specs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The main-thread side of the daemon: owns the MQTT connection and the
/// object model, fans worker events out to topic publishes, and routes
/// command messages back to the right network worker.
pub struct Bridge {
    objects: Vec<MqttObject>,
    commands: Vec<CommandBinding>,
    networks: Vec<NetworkHandle>,
    mqtt: MqttConnection,
    mqtt_up: bool,
}

enum MainEvent {
    Worker(usize, WorkerEvent),
    Mqtt(MqttEvent),
    Signal(i32),
    ChannelClosed,
}

impl Bridge {
    pub fn build(config: &Config) -> Result<Bridge> {
        let registry = ConverterRegistry::with_builtins();
        let model = build_object_model(config, &registry)?;

        let mut networks = Vec::new();
        for network in &config.networks {
            let transport: Box<dyn Transport> = match network.transport_settings()? {
                TransportSettings::Rtu(settings) => Box::new(RtuTransport::new(settings)),
                TransportSettings::Tcp(settings) => Box::new(TcpTransport::new(settings)),
            };
            let handle = spawn_worker(
                network.name.clone(),
                transport,
                network.watch_period(),
                network.default_slave_config(),
            );
            for slave in network.slave_configs()? {
                handle.send(WorkerCommand::SlaveConfig(slave));
            }
            let spec = &model.specs[&network.name];
            if spec.polls.is_empty() {
                log::warn!(
                    "no registers to poll for [{}], network will only serve writes",
                    network.name
                );
            }
            log::debug!(
                "sending register specification to modbus thread for network {}",
                network.name
            );
            handle.send(WorkerCommand::PollSpecification(spec.polls.clone()));
            networks.push(handle);
        }

        let mqtt = MqttConnection::open(&config.mqtt.broker_settings())?;

        Ok(Bridge {
            objects: model.objects,
            commands: model.commands,
            networks,
            mqtt,
            mqtt_up: false,
        })
    }

    /// Block on worker events, broker events, and signals until shutdown.
    pub fn run(&mut self, signals: &Receiver<i32>) {
        log::debug!("entering main loop");
        loop {
            let event = {
                let mut selector = flume::Selector::new();
                for (index, handle) in self.networks.iter().enumerate() {
                    selector = selector.recv(&handle.events, move |result| match result {
                        Ok(event) => MainEvent::Worker(index, event),
                        Err(_) => MainEvent::ChannelClosed,
                    });
                }
                selector = selector.recv(&self.mqtt.events, |result| match result {
                    Ok(event) => MainEvent::Mqtt(event),
                    Err(_) => MainEvent::ChannelClosed,
                });
                selector = selector.recv(signals, |result| match result {
                    Ok(signal) => MainEvent::Signal(signal),
                    Err(_) => MainEvent::ChannelClosed,
                });
                selector.wait()
            };

            match event {
                MainEvent::Worker(index, event) => {
                    let network = self.networks[index].name.clone();
                    self.process_worker_event(&network, event);
                }
                MainEvent::Mqtt(event) => self.process_mqtt_event(event),
                MainEvent::Signal(libc::SIGHUP) => {
                    log::info!("got SIGHUP, reload is not supported yet, ignoring");
                }
                MainEvent::Signal(signal) => {
                    log::info!("got signal {signal}, exiting");
                    break;
                }
                MainEvent::ChannelClosed => {
                    log::error!("internal channel closed unexpectedly, exiting");
                    break;
                }
            }
        }
        self.shutdown();
    }

    fn process_worker_event(&mut self, network: &str, event: WorkerEvent) {
        match event {
            WorkerEvent::RegisterValues(values) => self.process_register_values(network, &values),
            WorkerEvent::RegisterReadFailed { slave_id, range }
            | WorkerEvent::RegisterWriteFailed { slave_id, range } => {
                self.process_operation_failed(network, slave_id, &range)
            }
            WorkerEvent::NetworkState(up) => self.process_network_state(network, up),
        }
    }

    fn process_register_values(&mut self, network: &str, data: &RegisterValues) {
        if !self.mqtt_up {
            // retained messages catch subscribers up after reconnect
            return;
        }
        for object in &mut self.objects {
            if !object.has_register_in(network, data.slave_id, &data.range) {
                continue;
            }
            let old_avail = object.available_flag();
            let changed = object.update_values(network, data);
            let new_avail = object.available_flag();

            let force = object.publish_mode == PublishMode::EveryPoll;
            if (changed || force) && new_avail == AvailableFlag::True {
                publish_state(&self.mqtt, object);
            }
            if old_avail != new_avail {
                publish_availability(&self.mqtt, object);
            }
        }
    }

    fn process_operation_failed(&mut self, network: &str, slave_id: u8, range: &AddressRange) {
        for object in &mut self.objects {
            if !object.has_register_in(network, slave_id, range) {
                continue;
            }
            let old_avail = object.available_flag();
            object.update_read_failed(network, slave_id, range);
            if self.mqtt_up && old_avail != object.available_flag() {
                publish_availability(&self.mqtt, object);
            }
        }
    }

    fn process_network_state(&mut self, network: &str, up: bool) {
        log::info!("modbus network {network} is {}", if up { "up" } else { "down" });
        for object in &mut self.objects {
            let old_avail = object.available_flag();
            object.set_network_state(network, up);
            if self.mqtt_up && old_avail != object.available_flag() {
                publish_availability(&self.mqtt, object);
            }
        }
    }

    fn process_mqtt_event(&mut self, event: MqttEvent) {
        match event {
            MqttEvent::Connected => {
                self.mqtt_up = true;
                for command in &self.commands {
                    if let Err(e) = self.mqtt.subscribe(&command.topic) {
                        log::error!("{e}");
                    }
                }
                // a restarted broker lost everything it had; push current
                // state and availability back out
                self.publish_all();
                self.broadcast_mqtt_state(true);
            }
            MqttEvent::Disconnected => {
                if self.mqtt_up {
                    self.mqtt_up = false;
                    self.broadcast_mqtt_state(false);
                }
            }
            MqttEvent::Message { topic, payload } => self.process_command(&topic, &payload),
        }
    }

    fn process_command(&mut self, topic: &str, payload: &[u8]) {
        let binding = match self.commands.iter().find(|c| c.topic == topic) {
            Some(binding) => binding,
            None => {
                log::error!("no command for topic {topic}, dropping message");
                return;
            }
        };

        let value = MqttValue::Text(String::from_utf8_lossy(payload).into_owned());
        let converted = match &binding.converter {
            Some(converter) => converter.to_modbus(&value, binding.range.count),
            None => DefaultCommandConverter.to_modbus(&value, binding.range.count),
        };
        let values = match converted {
            Ok(values) => values,
            Err(e) => {
                log::error!("converter error for {topic}: {e}");
                return;
            }
        };
        if values.len() != usize::from(binding.range.count) {
            log::error!(
                "conversion for {topic} produced {} register values, need {}",
                values.len(),
                binding.range.count
            );
            return;
        }

        let handle = match self.networks.iter().find(|h| h.name == binding.network) {
            Some(handle) => handle,
            None => {
                log::error!(
                    "modbus network {} not found for command {topic}, dropping message",
                    binding.network
                );
                return;
            }
        };
        let mut write = RegisterWrite::new(binding.slave_id, binding.range, values);
        write.command_id = Some(binding.id);
        handle.send(WorkerCommand::Write(write));
    }

    fn publish_all(&self) {
        for object in &self.objects {
            if object.available_flag() == AvailableFlag::True {
                publish_state(&self.mqtt, object);
            }
            publish_availability(&self.mqtt, object);
        }
    }

    fn broadcast_mqtt_state(&self, up: bool) {
        for handle in &self.networks {
            handle.send(WorkerCommand::MqttState(up));
        }
    }

    fn shutdown(&mut self) {
        log::info!("stopping modbus clients");
        for handle in &mut self.networks {
            handle.stop();
        }
        if self.mqtt_up {
            log::info!("publishing availability 0 for all objects");
            for object in &self.objects {
                if let Err(e) = self.mqtt.publish(object.availability_topic(), b"0", true) {
                    log::debug!("{e}");
                }
            }
        }
        self.mqtt.disconnect();
        log::info!("shutdown finished");
    }
}

fn publish_state(mqtt: &MqttConnection, object: &MqttObject) {
    if object.state.nodes.is_empty() {
        // command-only object, nothing to report
        return;
    }
    let message = match payload::generate(&object.state) {
        Ok(message) => message,
        Err(e) => {
            log::error!("cannot format state for {}: {e}", object.topic());
            return;
        }
    };
    log::debug!("publish on topic {}: {message}", object.state_topic());
    if let Err(e) = mqtt.publish(object.state_topic(), message.as_bytes(), object.retain) {
        log::error!("{e}");
    }
}

fn publish_availability(mqtt: &MqttConnection, object: &MqttObject) {
    let payload = match object.available_flag() {
        AvailableFlag::NotSet => return,
        AvailableFlag::True => b"1",
        AvailableFlag::False => b"0",
    };
    log::debug!(
        "publish on topic {}: {}",
        object.availability_topic(),
        payload[0] as char
    );
    if let Err(e) = mqtt.publish(object.availability_topic(), payload, true) {
        log::error!("{e}");
    }
}

/// Translate the object configuration into MQTT objects, command bindings,
/// and per-network poll specifications.
pub fn build_object_model(config: &Config, registry: &ConverterRegistry) -> Result<ObjectModel> {
    let mut specs: BTreeMap<String, PollSpec> = BTreeMap::new();
    for network in &config.networks {
        let mut spec = PollSpec::new(network.name.clone());
        spec.merge_all(network.poll_group_defs()?);
        specs.insert(network.name.clone(), spec);
    }

    let single_network = if config.networks.len() == 1 {
        Some(config.networks[0].name.clone())
    } else {
        None
    };

    let mut objects = Vec::new();
    let mut commands = Vec::new();
    for section in &config.objects {
        let default_network = section
            .network
            .clone()
            .or_else(|| single_network.clone());

        let slave_name = default_network
            .as_deref()
            .and_then(|name| config.network(name))
            .and_then(|network| {
                let address = section.slave?;
                network
                    .slave_configs()
                    .ok()?
                    .into_iter()
                    .find(|s| s.address == address)
                    .and_then(|s| s.name)
            });
        let topic = expand_topic(
            &section.topic,
            default_network.as_deref(),
            section.slave,
            slave_name.as_deref(),
        )?;

        let mut object = MqttObject::new(topic.clone());
        object.retain = section.retain;
        object.publish_mode = section.publish_mode;

        let mut builder = NodeBuilder {
            config,
            registry,
            specs: &mut specs,
            default_network: default_network.as_deref(),
            default_slave: section.slave,
            object: section,
        };

        if let Some(state) = &section.state {
            object.state = NodeTree::new(vec![builder.build_node(state)?]);
        }
        if let Some(availability) = &section.availability {
            object.availability.tree = NodeTree::new(vec![builder.build_node(availability)?]);
            object.availability.available_value = availability.available_value.unwrap_or(1);
        }

        for command in &section.commands {
            let ident = parse_register_ident(
                &command.register.as_spec(),
                default_network.as_deref(),
                section.slave,
            )?;
            ensure_known_network(config, &ident.network, &topic)?;
            let reg_type = command.register_type.unwrap_or(RegisterType::Holding);
            if !reg_type.is_writable() {
                return Err(BridgeError::config(format!(
                    "object '{topic}': command '{}' targets read-only register type {reg_type}",
                    command.name
                )));
            }
            let range = AddressRange::new(ident.number, command.count.unwrap_or(1), reg_type)?;
            let converter = command
                .converter
                .as_deref()
                .map(|spec| registry.create(spec))
                .transpose()?;
            commands.push(CommandBinding {
                topic: format!("{topic}/{}", command.name),
                network: ident.network,
                slave_id: ident.slave_id,
                range,
                converter,
                id: commands.len() as u64,
            });
        }

        objects.push(object);
    }

    for spec in specs.values_mut() {
        spec.group();
    }

    Ok(ObjectModel {
        objects,
        commands,
        specs,
    })
}

fn ensure_known_network(config: &Config, network: &str, topic: &str) -> Result<()> {
    if config.network(network).is_none() {
        return Err(BridgeError::config(format!(
            "object '{topic}': unknown network '{network}' in register specification"
        )));
    }
    Ok(())
}

struct NodeBuilder<'a> {
    config: &'a Config,
    registry: &'a ConverterRegistry,
    specs: &'a mut BTreeMap<String, PollSpec>,
    default_network: Option<&'a str>,
    default_slave: Option<u8>,
    object: &'a ObjectSection,
}

impl NodeBuilder<'_> {
    fn build_node(&mut self, section: &DataNodeSection) -> Result<DataNode> {
        let converter = section
            .converter
            .as_deref()
            .map(|spec| self.registry.create(spec))
            .transpose()?;

        let node = if !section.registers.is_empty() {
            if section.register.is_some() {
                return Err(BridgeError::config(
                    "a data node cannot have both 'register' and 'registers'",
                ));
            }
            let mut children = Vec::with_capacity(section.registers.len());
            for child in &section.registers {
                children.push(self.build_node(child)?);
            }
            let named = children.iter().filter(|c| !c.is_unnamed()).count();
            if named != 0 && named != children.len() {
                return Err(BridgeError::config(
                    "child data nodes must be either all named or all unnamed",
                ));
            }
            DataNode::composite(children)
        } else {
            let register = section.register.as_ref().ok_or_else(|| {
                BridgeError::config("a data node needs a 'register' or child 'registers'")
            })?;
            let ident = parse_register_ident(
                &register.as_spec(),
                self.default_network,
                self.default_slave,
            )?;
            ensure_known_network(self.config, &ident.network, &self.object.topic)?;
            let reg_type = section.register_type.unwrap_or(RegisterType::Holding);
            let count = section.count.unwrap_or(1);
            let range = AddressRange::new(ident.number, count, reg_type)?;

            let refresh = section
                .refresh_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or_else(|| self.object.refresh());
            let mut def = PollDef::new(ident.slave_id, range, Some(refresh));
            def.publish_mode = self.object.publish_mode;
            self.specs
                .get_mut(&ident.network)
                .expect("network presence checked above")
                .merge(def);

            if count == 1 {
                DataNode::scalar(RegisterIdent {
                    network: ident.network,
                    slave_id: ident.slave_id,
                    number: ident.number,
                    reg_type,
                })
            } else {
                // a multi-register leaf becomes a run of unnamed scalars,
                // usually collapsed back to one value by its converter
                let scalars = (0..count)
                    .map(|offset| {
                        DataNode::scalar(RegisterIdent {
                            network: ident.network.clone(),
                            slave_id: ident.slave_id,
                            number: ident.number + offset,
                            reg_type,
                        })
                    })
                    .collect();
                DataNode::composite(scalars)
            }
        };

        let mut node = node;
        if let Some(converter) = converter {
            node = node.with_converter(converter);
        }
        if let Some(name) = &section.name {
            node = node.with_name(name.clone());
        }
        Ok(node)
    }
}
