use std::sync::Arc;

use crate::conv::{ConversionError, Converter, MqttValue};
use crate::modbus::messages::RegisterValues;
use crate::modbus::types::{AddressRange, PublishMode, RegisterType};

/// Tri-valued availability attached to each MQTT object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailableFlag {
    NotSet,
    False,
    True,
}

/// Identity of one register on one network, the key MQTT-side state is
/// updated by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterIdent {
    pub network: String,
    pub slave_id: u8,
    pub number: u16,
    pub reg_type: RegisterType,
}

impl RegisterIdent {
    pub fn as_range(&self) -> AddressRange {
        AddressRange::single(self.number, self.reg_type)
    }
}

#[derive(Debug, Clone, Copy)]
struct RegisterSlot {
    value: Option<u16>,
    read_ok: bool,
}

impl Default for RegisterSlot {
    fn default() -> Self {
        RegisterSlot {
            value: None,
            read_ok: true,
        }
    }
}

enum NodeKind {
    Scalar {
        ident: RegisterIdent,
        slot: RegisterSlot,
    },
    Composite {
        children: Vec<DataNode>,
    },
}

/// One node of an object's state or availability tree: either a single
/// register or an ordered list of child nodes, optionally converted.
pub struct DataNode {
    name: Option<String>,
    converter: Option<Arc<dyn Converter>>,
    kind: NodeKind,
}

impl DataNode {
    pub fn scalar(ident: RegisterIdent) -> Self {
        DataNode {
            name: None,
            converter: None,
            kind: NodeKind::Scalar {
                ident,
                slot: RegisterSlot::default(),
            },
        }
    }

    pub fn composite(children: Vec<DataNode>) -> Self {
        DataNode {
            name: None,
            converter: None,
            kind: NodeKind::Composite { children },
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_unnamed(&self) -> bool {
        self.name.is_none()
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, NodeKind::Scalar { .. })
    }

    pub fn has_converter(&self) -> bool {
        self.converter.is_some()
    }

    pub fn children(&self) -> &[DataNode] {
        match &self.kind {
            NodeKind::Composite { children } => children,
            NodeKind::Scalar { .. } => &[],
        }
    }

    pub fn update_values(&mut self, network: &str, data: &RegisterValues) -> bool {
        match &mut self.kind {
            NodeKind::Composite { children } => {
                let mut changed = false;
                for child in children {
                    if child.update_values(network, data) {
                        changed = true;
                    }
                }
                changed
            }
            NodeKind::Scalar { ident, slot } => {
                if ident.network != network
                    || ident.slave_id != data.slave_id
                    || ident.reg_type != data.range.reg_type
                    || !data.range.contains(ident.number)
                {
                    return false;
                }
                let value = data.values[usize::from(ident.number - data.range.first)];
                let changed = slot.value != Some(value);
                slot.value = Some(value);
                slot.read_ok = true;
                changed
            }
        }
    }

    pub fn update_read_failed(
        &mut self,
        network: &str,
        slave_id: u8,
        range: &AddressRange,
    ) -> bool {
        match &mut self.kind {
            NodeKind::Composite { children } => {
                let mut changed = false;
                for child in children {
                    if child.update_read_failed(network, slave_id, range) {
                        changed = true;
                    }
                }
                changed
            }
            NodeKind::Scalar { ident, slot } => {
                if ident.network != network
                    || ident.slave_id != slave_id
                    || ident.reg_type != range.reg_type
                    || !range.contains(ident.number)
                {
                    return false;
                }
                slot.read_ok = false;
                true
            }
        }
    }

    pub fn set_network_state(&mut self, network: &str, up: bool) -> bool {
        match &mut self.kind {
            NodeKind::Composite { children } => {
                let mut changed = false;
                for child in children {
                    if child.set_network_state(network, up) {
                        changed = true;
                    }
                }
                changed
            }
            NodeKind::Scalar { ident, slot } => {
                if ident.network != network || slot.read_ok == up {
                    return false;
                }
                slot.read_ok = up;
                true
            }
        }
    }

    pub fn has_register_in(&self, network: &str, slave_id: u8, range: &AddressRange) -> bool {
        match &self.kind {
            NodeKind::Composite { children } => children
                .iter()
                .any(|child| child.has_register_in(network, slave_id, range)),
            NodeKind::Scalar { ident, .. } => {
                ident.network == network
                    && ident.slave_id == slave_id
                    && range.overlaps(&ident.as_range())
            }
        }
    }

    pub fn has_all_values(&self) -> bool {
        match &self.kind {
            NodeKind::Composite { children } => children.iter().all(DataNode::has_all_values),
            NodeKind::Scalar { slot, .. } => slot.value.is_some(),
        }
    }

    pub fn is_polling(&self) -> bool {
        match &self.kind {
            NodeKind::Composite { children } => children.iter().all(DataNode::is_polling),
            NodeKind::Scalar { slot, .. } => slot.read_ok,
        }
    }

    fn raw_values(&self, out: &mut Vec<u16>) {
        match &self.kind {
            NodeKind::Composite { children } => {
                for child in children {
                    child.raw_values(out);
                }
            }
            NodeKind::Scalar { slot, .. } => out.push(slot.value.unwrap_or(0)),
        }
    }

    pub fn converted_value(&self) -> Result<MqttValue, ConversionError> {
        match &self.converter {
            Some(converter) => {
                let mut raw = Vec::new();
                self.raw_values(&mut raw);
                converter.to_mqtt(&raw)
            }
            None => match &self.kind {
                NodeKind::Scalar { slot, .. } => {
                    Ok(MqttValue::from_register(slot.value.unwrap_or(0)))
                }
                NodeKind::Composite { .. } => Err(ConversionError::new(
                    "composite node without a converter has no scalar value",
                )),
            },
        }
    }
}

/// An ordered list of data nodes; both the state tree and the availability
/// tree of an object have this shape.
#[derive(Default)]
pub struct NodeTree {
    pub nodes: Vec<DataNode>,
}

impl NodeTree {
    pub fn new(nodes: Vec<DataNode>) -> Self {
        NodeTree { nodes }
    }

    pub fn update_values(&mut self, network: &str, data: &RegisterValues) -> bool {
        let mut changed = false;
        for node in &mut self.nodes {
            if node.update_values(network, data) {
                changed = true;
            }
        }
        changed
    }

    pub fn update_read_failed(&mut self, network: &str, slave_id: u8, range: &AddressRange) -> bool {
        let mut changed = false;
        for node in &mut self.nodes {
            if node.update_read_failed(network, slave_id, range) {
                changed = true;
            }
        }
        changed
    }

    pub fn set_network_state(&mut self, network: &str, up: bool) -> bool {
        let mut changed = false;
        for node in &mut self.nodes {
            if node.set_network_state(network, up) {
                changed = true;
            }
        }
        changed
    }

    pub fn has_register_in(&self, network: &str, slave_id: u8, range: &AddressRange) -> bool {
        self.nodes
            .iter()
            .any(|node| node.has_register_in(network, slave_id, range))
    }

    pub fn has_all_values(&self) -> bool {
        self.nodes.iter().all(DataNode::has_all_values)
    }

    pub fn is_polling(&self) -> bool {
        self.nodes.iter().all(DataNode::is_polling)
    }
}

/// Availability tree with the constant its converted reading must equal
/// for the object to count as available.
pub struct Availability {
    pub tree: NodeTree,
    pub available_value: i64,
}

impl Default for Availability {
    fn default() -> Self {
        Availability {
            tree: NodeTree::default(),
            available_value: 1,
        }
    }
}

impl Availability {
    fn flag(&self) -> AvailableFlag {
        // no availability registers: state data is trusted as-is
        if self.tree.nodes.is_empty() {
            return AvailableFlag::True;
        }
        if !self.tree.has_all_values() || !self.tree.is_polling() {
            return AvailableFlag::NotSet;
        }
        match self.tree.nodes[0].converted_value().and_then(|v| v.as_i64()) {
            Ok(value) if value == self.available_value => AvailableFlag::True,
            Ok(_) => AvailableFlag::False,
            Err(e) => {
                log::error!("availability conversion failed: {e}");
                AvailableFlag::False
            }
        }
    }
}

/// One MQTT object: a topic prefix, a state tree, and an optional
/// availability tree.
pub struct MqttObject {
    topic: String,
    state_topic: String,
    availability_topic: String,
    pub state: NodeTree,
    pub availability: Availability,
    available: AvailableFlag,
    pub retain: bool,
    pub publish_mode: PublishMode,
}

impl MqttObject {
    pub fn new(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        MqttObject {
            state_topic: format!("{topic}/state"),
            availability_topic: format!("{topic}/availability"),
            topic,
            state: NodeTree::default(),
            availability: Availability::default(),
            available: AvailableFlag::NotSet,
            retain: false,
            publish_mode: PublishMode::OnChange,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state_topic(&self) -> &str {
        &self.state_topic
    }

    pub fn availability_topic(&self) -> &str {
        &self.availability_topic
    }

    pub fn available_flag(&self) -> AvailableFlag {
        self.available
    }

    pub fn has_register_in(&self, network: &str, slave_id: u8, range: &AddressRange) -> bool {
        self.state.has_register_in(network, slave_id, range)
            || self.availability.tree.has_register_in(network, slave_id, range)
    }

    pub fn update_values(&mut self, network: &str, data: &RegisterValues) -> bool {
        let state_changed = self.state.update_values(network, data);
        let avail_changed = self.availability.tree.update_values(network, data);
        self.update_availability_flag();
        state_changed || avail_changed
    }

    pub fn update_read_failed(&mut self, network: &str, slave_id: u8, range: &AddressRange) -> bool {
        let state_changed = self.state.update_read_failed(network, slave_id, range);
        let avail_changed = self
            .availability
            .tree
            .update_read_failed(network, slave_id, range);
        self.update_availability_flag();
        state_changed || avail_changed
    }

    pub fn set_network_state(&mut self, network: &str, up: bool) -> bool {
        let state_changed = self.state.set_network_state(network, up);
        let avail_changed = self.availability.tree.set_network_state(network, up);
        self.update_availability_flag();
        state_changed || avail_changed
    }

    fn update_availability_flag(&mut self) {
        // failing reads invalidate state data even when the availability
        // registers themselves still answer
        self.available = if !self.availability.tree.is_polling() || !self.state.is_polling() {
            AvailableFlag::False
        } else if !self.availability.tree.has_all_values() || !self.state.has_all_values() {
            AvailableFlag::NotSet
        } else {
            self.availability.flag()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(number: u16) -> RegisterIdent {
        RegisterIdent {
            network: "net".into(),
            slave_id: 1,
            number,
            reg_type: RegisterType::Holding,
        }
    }

    fn values(first: u16, values: Vec<u16>) -> RegisterValues {
        RegisterValues {
            slave_id: 1,
            range: AddressRange::new(first, values.len() as u16, RegisterType::Holding).unwrap(),
            values,
            command_id: None,
        }
    }

    fn object_with_register(number: u16) -> MqttObject {
        let mut object = MqttObject::new("test");
        object.state = NodeTree::new(vec![DataNode::scalar(ident(number))]);
        object
    }

    #[test]
    fn availability_is_not_set_before_first_read() {
        let object = object_with_register(2);
        assert_eq!(object.available_flag(), AvailableFlag::NotSet);
    }

    #[test]
    fn successful_read_makes_object_available() {
        let mut object = object_with_register(2);
        let changed = object.update_values("net", &values(2, vec![10]));
        assert!(changed);
        assert_eq!(object.available_flag(), AvailableFlag::True);
    }

    #[test]
    fn update_ignores_foreign_networks_and_slaves() {
        let mut object = object_with_register(2);
        assert!(!object.update_values("other", &values(2, vec![10])));
        let mut data = values(2, vec![10]);
        data.slave_id = 9;
        assert!(!object.update_values("net", &data));
        assert_eq!(object.available_flag(), AvailableFlag::NotSet);
    }

    #[test]
    fn group_read_updates_register_inside_range() {
        let mut object = object_with_register(4);
        assert!(object.update_values("net", &values(2, vec![1, 2, 3, 4, 5])));
        assert_eq!(
            object.state.nodes[0].converted_value().unwrap(),
            MqttValue::Int(3)
        );
    }

    #[test]
    fn unchanged_value_reports_no_change() {
        let mut object = object_with_register(2);
        assert!(object.update_values("net", &values(2, vec![10])));
        assert!(!object.update_values("net", &values(2, vec![10])));
    }

    #[test]
    fn read_failure_flips_availability() {
        let mut object = object_with_register(2);
        object.update_values("net", &values(2, vec![10]));
        let range = AddressRange::new(2, 1, RegisterType::Holding).unwrap();
        assert!(object.update_read_failed("net", 1, &range));
        assert_eq!(object.available_flag(), AvailableFlag::False);

        // recovery restores availability
        object.update_values("net", &values(2, vec![10]));
        assert_eq!(object.available_flag(), AvailableFlag::True);
    }

    #[test]
    fn network_down_flips_availability() {
        let mut object = object_with_register(2);
        object.update_values("net", &values(2, vec![10]));
        assert!(object.set_network_state("net", false));
        assert_eq!(object.available_flag(), AvailableFlag::False);
        assert!(!object.set_network_state("other", false));
    }

    #[test]
    fn availability_register_compares_against_available_value() {
        let mut object = object_with_register(2);
        object.availability.tree = NodeTree::new(vec![DataNode::scalar(ident(100))]);
        object.availability.available_value = 1;

        object.update_values("net", &values(2, vec![10]));
        assert_eq!(
            object.available_flag(),
            AvailableFlag::NotSet,
            "availability register not read yet"
        );

        object.update_values("net", &values(100, vec![1]));
        assert_eq!(object.available_flag(), AvailableFlag::True);

        object.update_values("net", &values(100, vec![0]));
        assert_eq!(object.available_flag(), AvailableFlag::False);
    }

    #[test]
    fn composite_tracks_all_children() {
        let mut object = MqttObject::new("test");
        object.state = NodeTree::new(vec![DataNode::composite(vec![
            DataNode::scalar(ident(1)).with_name("a"),
            DataNode::scalar(ident(2)).with_name("b"),
        ])]);

        object.update_values("net", &values(1, vec![5]));
        assert_eq!(object.available_flag(), AvailableFlag::NotSet);
        object.update_values("net", &values(2, vec![6]));
        assert_eq!(object.available_flag(), AvailableFlag::True);

        let range = AddressRange::new(2, 1, RegisterType::Holding).unwrap();
        object.update_read_failed("net", 1, &range);
        assert_eq!(object.available_flag(), AvailableFlag::False);
    }

    #[test]
    fn has_register_in_covers_both_trees() {
        let mut object = object_with_register(2);
        object.availability.tree = NodeTree::new(vec![DataNode::scalar(ident(50))]);
        let range = AddressRange::new(50, 1, RegisterType::Holding).unwrap();
        assert!(object.has_register_in("net", 1, &range));
        let range = AddressRange::new(51, 1, RegisterType::Holding).unwrap();
        assert!(!object.has_register_in("net", 1, &range));
    }
}
