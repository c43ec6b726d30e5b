//! State payload formatting: a single unnamed scalar serializes as a bare
//! value, composites with named children as a JSON object, unnamed
//! children as a JSON array.

use serde_json::{Map, Value as JsonValue};

use crate::conv::ConversionError;
use crate::mqtt::object::{DataNode, NodeTree};

pub fn generate(state: &NodeTree) -> Result<String, ConversionError> {
    if state.nodes.len() == 1 {
        let single = &state.nodes[0];
        if single.is_unnamed() && (single.is_scalar() || single.has_converter()) {
            return Ok(single.converted_value()?.to_payload_string());
        }
    }
    nodes_to_json(&state.nodes).map(|v| v.to_string())
}

fn node_to_json(node: &DataNode) -> Result<JsonValue, ConversionError> {
    if node.is_scalar() || node.has_converter() {
        Ok(node.converted_value()?.to_json())
    } else {
        nodes_to_json(node.children())
    }
}

fn nodes_to_json(nodes: &[DataNode]) -> Result<JsonValue, ConversionError> {
    let named = nodes.first().map_or(false, |n| !n.is_unnamed());
    if named {
        let mut map = Map::new();
        for node in nodes {
            let key = node.name().ok_or_else(|| {
                ConversionError::new("mixed named and unnamed nodes in one composite")
            })?;
            map.insert(key.to_string(), node_to_json(node)?);
        }
        Ok(JsonValue::Object(map))
    } else {
        let mut list = Vec::with_capacity(nodes.len());
        for node in nodes {
            list.push(node_to_json(node)?);
        }
        Ok(JsonValue::Array(list))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv::ConverterRegistry;
    use crate::modbus::messages::RegisterValues;
    use crate::modbus::types::{AddressRange, RegisterType};
    use crate::mqtt::object::{DataNode, RegisterIdent};

    fn ident(number: u16) -> RegisterIdent {
        RegisterIdent {
            network: "net".into(),
            slave_id: 1,
            number,
            reg_type: RegisterType::Holding,
        }
    }

    fn fill(tree: &mut NodeTree, first: u16, values: Vec<u16>) {
        let data = RegisterValues {
            slave_id: 1,
            range: AddressRange::new(first, values.len() as u16, RegisterType::Holding).unwrap(),
            values,
            command_id: None,
        };
        tree.update_values("net", &data);
    }

    #[test]
    fn single_unnamed_scalar_is_bare_value() {
        let mut tree = NodeTree::new(vec![DataNode::scalar(ident(1))]);
        fill(&mut tree, 1, vec![32456]);
        assert_eq!(generate(&tree).unwrap(), "32456");
    }

    #[test]
    fn named_scalars_serialize_as_object() {
        let mut tree = NodeTree::new(vec![
            DataNode::scalar(ident(1)).with_name("temp"),
            DataNode::scalar(ident(2)).with_name("hum"),
        ]);
        fill(&mut tree, 1, vec![21, 64]);
        assert_eq!(generate(&tree).unwrap(), r#"{"temp":21,"hum":64}"#);
    }

    #[test]
    fn unnamed_scalars_serialize_as_array() {
        let mut tree = NodeTree::new(vec![
            DataNode::scalar(ident(1)),
            DataNode::scalar(ident(2)),
        ]);
        fill(&mut tree, 1, vec![1, 2]);
        assert_eq!(generate(&tree).unwrap(), "[1,2]");
    }

    #[test]
    fn converter_composite_is_bare_value() {
        let registry = ConverterRegistry::with_builtins();
        let node = DataNode::composite(vec![
            DataNode::scalar(ident(1)),
            DataNode::scalar(ident(2)),
        ])
        .with_converter(registry.create("int32").unwrap());
        let mut tree = NodeTree::new(vec![node]);
        fill(&mut tree, 1, vec![2, 1]);
        assert_eq!(generate(&tree).unwrap(), "131073");
    }

    #[test]
    fn nested_composites_recurse() {
        let inner = DataNode::composite(vec![
            DataNode::scalar(ident(1)),
            DataNode::scalar(ident(2)),
        ])
        .with_name("values");
        let mut tree = NodeTree::new(vec![
            inner,
            DataNode::scalar(ident(3)).with_name("status"),
        ]);
        fill(&mut tree, 1, vec![5, 6, 1]);
        assert_eq!(generate(&tree).unwrap(), r#"{"values":[5,6],"status":1}"#);
    }
}
