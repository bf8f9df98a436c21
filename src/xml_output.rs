use quick_xml::Writer;
use quick_xml::events::{BytesCData, BytesEnd, BytesPI, BytesStart, BytesText, Event};

use crate::err::{EvtxError, Result};
use crate::model::xml::{XmlElement, XmlNode};

enum Step<'a> {
    Node(&'a XmlNode),
    End(&'a str),
}

fn xml_error(e: impl std::fmt::Display) -> EvtxError {
    EvtxError::XmlOutputError {
        message: e.to_string(),
    }
}

fn start_tag(element: &XmlElement) -> BytesStart<'_> {
    let mut start = BytesStart::new(element.name.as_str());
    for attribute in &element.attributes {
        start.push_attribute((attribute.name.as_str(), attribute.text().as_str()));
    }
    start
}

/// Render a decoded tree as XML text.
pub fn nodes_to_xml_string(nodes: &[XmlNode], indent: bool) -> Result<String> {
    let mut writer = if indent {
        Writer::new_with_indent(Vec::new(), b' ', 2)
    } else {
        Writer::new(Vec::new())
    };

    let mut stack: Vec<Step<'_>> = nodes.iter().rev().map(Step::Node).collect();

    while let Some(step) = stack.pop() {
        let event = match step {
            Step::End(name) => Event::End(BytesEnd::new(name)),
            Step::Node(XmlNode::Element(element)) => {
                if element.children.is_empty() {
                    Event::Empty(start_tag(element))
                } else {
                    stack.push(Step::End(&element.name));
                    stack.extend(element.children.iter().rev().map(Step::Node));
                    Event::Start(start_tag(element))
                }
            }
            Step::Node(XmlNode::Value(value)) => {
                let text = value.to_string();
                if text.is_empty() {
                    continue;
                }
                Event::Text(BytesText::new(&text).into_owned())
            }
            Step::Node(XmlNode::CData(text)) => Event::CData(BytesCData::new(text.as_str())),
            Step::Node(XmlNode::CharRef(c)) => {
                Event::Text(BytesText::from_escaped(format!("&#{c};")))
            }
            Step::Node(XmlNode::EntityRef(name)) => {
                Event::Text(BytesText::from_escaped(format!("&{name};")))
            }
            Step::Node(XmlNode::ProcessingInstruction(pi)) => {
                let content = if pi.data.is_empty() {
                    pi.target.clone()
                } else {
                    format!("{} {}", pi.target, pi.data)
                };
                Event::PI(BytesPI::new(content))
            }
            Step::Node(XmlNode::TemplateInstance(unresolved)) => {
                let values: Vec<String> = unresolved.values.iter().map(|v| v.to_string()).collect();
                Event::Comment(BytesText::new(&format!(
                    " unresolved template at offset {}: [{}] ",
                    unresolved.template_offset,
                    values.join(", ")
                ))
                .into_owned())
            }
            // Only template definitions hold placeholders.
            Step::Node(XmlNode::Placeholder(_)) => continue,
        };

        writer.write_event(event).map_err(xml_error)?;
    }

    String::from_utf8(writer.into_inner()).map_err(xml_error)
}
