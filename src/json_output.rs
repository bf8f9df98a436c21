use serde_json::{Map, Value};

use crate::model::xml::{XmlElement, XmlNode};

/// JSON for a run of nodes: a single value keeps its type, anything else becomes text.
fn content_to_json(nodes: &[XmlNode]) -> Value {
    match nodes {
        [] => Value::Null,
        [XmlNode::Value(value)] => value.to_json_value(),
        _ => {
            let mut text = String::new();
            for node in nodes {
                match node {
                    XmlNode::Value(value) => text.push_str(&value.to_string()),
                    XmlNode::CData(data) => text.push_str(data),
                    XmlNode::CharRef(c) => {
                        text.push(char::from_u32(u32::from(*c)).unwrap_or(char::REPLACEMENT_CHARACTER))
                    }
                    XmlNode::EntityRef(name) => match name.as_str() {
                        "amp" => text.push('&'),
                        "lt" => text.push('<'),
                        "gt" => text.push('>'),
                        "quot" => text.push('"'),
                        "apos" => text.push('\''),
                        other => {
                            text.push('&');
                            text.push_str(other);
                            text.push(';');
                        }
                    },
                    _ => {}
                }
            }
            Value::String(text)
        }
    }
}

fn insert_or_append(map: &mut Map<String, Value>, key: String, value: Value) {
    match map.get_mut(&key) {
        Some(Value::Array(existing)) => existing.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(key, value);
        }
    }
}

fn element_to_json(element: &XmlElement) -> Value {
    let has_child_elements = element.child_elements().next().is_some();
    let has_unresolved = element
        .children
        .iter()
        .any(|c| matches!(c, XmlNode::TemplateInstance(_)));

    if element.attributes.is_empty() && !has_child_elements && !has_unresolved {
        return content_to_json(&element.children);
    }

    let mut map = Map::new();

    if !element.attributes.is_empty() {
        let mut attributes = Map::new();
        for attribute in &element.attributes {
            attributes.insert(attribute.name.clone(), content_to_json(&attribute.value));
        }
        map.insert("#attributes".to_owned(), Value::Object(attributes));
    }

    let mut text = Vec::new();
    for child in &element.children {
        match child {
            XmlNode::Element(e) => {
                // <Data Name="TargetUserName">bob</Data> becomes "TargetUserName": "bob".
                let named = (e.name == "Data")
                    .then(|| e.attribute("Name"))
                    .flatten()
                    .map(|name| name.text())
                    .filter(|name| !name.is_empty());
                match named {
                    Some(name) => insert_or_append(&mut map, name, content_to_json(&e.children)),
                    None => insert_or_append(&mut map, e.name.clone(), element_to_json(e)),
                }
            }
            XmlNode::TemplateInstance(unresolved) => insert_or_append(
                &mut map,
                "#unresolved_template".to_owned(),
                serde_json::json!({
                    "offset": unresolved.template_offset,
                    "values": unresolved.values.iter().map(|v| v.to_json_value()).collect::<Vec<_>>(),
                }),
            ),
            other => text.push(other.clone()),
        }
    }

    if !text.is_empty() {
        map.insert("#text".to_owned(), content_to_json(&text));
    }

    Value::Object(map)
}

/// Render a decoded tree as JSON, keyed by element names.
pub fn nodes_to_json(nodes: &[XmlNode]) -> Value {
    let mut map = Map::new();
    for node in nodes {
        if let XmlNode::Element(element) = node {
            insert_or_append(&mut map, element.name.clone(), element_to_json(element));
        }
    }
    Value::Object(map)
}
