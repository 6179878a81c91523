//! Typed-property reply codec and schema-free deserialization.
//!
//! SCVMM cmdlet replies arrive as `ConvertTo-Xml -as String` output: an
//! `<Objects>` wrapper around `<Object>` elements whose `<Property>`
//! children carry `Name` / `Type` attributes and either scalar text or
//! further nested properties. [`decode_xml`] turns the payload into a
//! [`PropertyNode`] tree; [`deserialize`] walks that tree into nested
//! records, lists and coerced scalars without any schema knowledge.

use crate::error::{ScvmmError, ScvmmResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

// ─── Tree Model ──────────────────────────────────────────────────────

/// One node of the manager's typed-property serialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyNode {
    /// The `Name` attribute; absent on repeated collection members.
    pub name: Option<String>,
    /// The declared .NET type (`System.String`, `System.Boolean`, …).
    pub type_tag: Option<String>,
    /// Scalar payload of a leaf node.
    pub text: Option<String>,
    pub children: Vec<PropertyNode>,
}

/// A deserialized reply value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Named properties in declaration order.
    Record(Vec<(String, PropertyValue)>),
    /// Repeated unnamed siblings in declaration order.
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Look up a record entry by name.
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        match self {
            PropertyValue::Record(entries) => {
                entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }
}

// ─── XML Codec ───────────────────────────────────────────────────────

/// Parse a `ConvertTo-Xml -as String` payload into its `<Object>` roots.
///
/// The outer `<Objects>` wrapper is discarded. Fails with a `Codec`
/// error when the payload is not well-formed XML.
pub fn decode_xml(raw: &str) -> ScvmmResult<Vec<PropertyNode>> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text(true);

    let mut roots: Vec<PropertyNode> = Vec::new();
    let mut stack: Vec<PropertyNode> = Vec::new();
    let mut saw_element = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                saw_element = true;
                if is_wrapper(e, &stack) {
                    continue;
                }
                stack.push(node_from_element(e)?);
            }
            Ok(Event::Empty(ref e)) => {
                saw_element = true;
                if is_wrapper(e, &stack) {
                    continue;
                }
                let node = node_from_element(e)?;
                attach(&mut stack, &mut roots, node);
            }
            Ok(Event::Text(ref t)) => {
                if let Some(top) = stack.last_mut() {
                    let text = t.unescape().map_err(|e| {
                        ScvmmError::codec(format!("Invalid text content in reply: {}", e))
                    })?;
                    match top.text {
                        Some(ref mut existing) => existing.push_str(&text),
                        None => top.text = Some(text.into_owned()),
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Objects" {
                    continue;
                }
                if let Some(node) = stack.pop() {
                    attach(&mut stack, &mut roots, node);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ScvmmError::codec(format!("Malformed XML reply: {}", e)));
            }
        }
    }

    if !stack.is_empty() {
        return Err(ScvmmError::codec("Truncated XML reply: unclosed elements"));
    }
    if !saw_element {
        return Err(ScvmmError::codec("Reply contains no XML document"));
    }

    Ok(roots)
}

fn is_wrapper(e: &BytesStart<'_>, stack: &[PropertyNode]) -> bool {
    stack.is_empty() && e.name().as_ref() == b"Objects"
}

fn node_from_element(e: &BytesStart<'_>) -> ScvmmResult<PropertyNode> {
    let mut node = PropertyNode::default();
    for attr in e.attributes() {
        let attr = attr
            .map_err(|err| ScvmmError::codec(format!("Invalid attribute in reply: {}", err)))?;
        let value = attr
            .unescape_value()
            .map_err(|err| ScvmmError::codec(format!("Invalid attribute value: {}", err)))?;
        match attr.key.as_ref() {
            b"Name" => node.name = Some(value.into_owned()),
            b"Type" => node.type_tag = Some(value.into_owned()),
            _ => {}
        }
    }
    Ok(node)
}

fn attach(stack: &mut [PropertyNode], roots: &mut Vec<PropertyNode>, node: PropertyNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => roots.push(node),
    }
}

/// Collect the text of every `Name`-matching property directly under the
/// given objects — the single-field extraction used by list commands.
pub fn property_text(objects: &[PropertyNode], name: &str) -> Vec<String> {
    objects
        .iter()
        .flat_map(|o| o.children.iter())
        .filter(|p| p.name.as_deref() == Some(name))
        .filter_map(|p| p.text.clone())
        .collect()
}

// ─── Deserializer ────────────────────────────────────────────────────

/// Deserialize a typed-property node into a nested value.
///
/// Unrecognized *data* never fails; only structural violations do.
pub fn deserialize(node: &PropertyNode) -> ScvmmResult<PropertyValue> {
    if node.children.is_empty() {
        return coerce_scalar(node);
    }

    if let Some(ref text) = node.text {
        if !text.trim().is_empty() {
            return Err(ScvmmError::malformed_tree(format!(
                "Node '{}' carries both text and child properties",
                node.name.as_deref().unwrap_or("<unnamed>")
            )));
        }
    }
    if is_scalar_type(node.type_tag.as_deref()) {
        return Err(ScvmmError::malformed_tree(format!(
            "Scalar-typed node '{}' ({}) has child properties",
            node.name.as_deref().unwrap_or("<unnamed>"),
            node.type_tag.as_deref().unwrap_or(""),
        )));
    }

    if node.children.iter().any(|c| c.name.is_some()) {
        // Named children form a record; duplicate names overwrite in
        // place so the last declaration wins.
        let mut entries: Vec<(String, PropertyValue)> = Vec::new();
        for child in &node.children {
            let name = child.name.clone().ok_or_else(|| {
                ScvmmError::malformed_tree("Unnamed property among named siblings")
            })?;
            let value = deserialize(child)?;
            match entries.iter_mut().find(|(n, _)| *n == name) {
                Some(entry) => entry.1 = value,
                None => entries.push((name, value)),
            }
        }
        Ok(PropertyValue::Record(entries))
    } else {
        let items = node
            .children
            .iter()
            .map(deserialize)
            .collect::<ScvmmResult<Vec<_>>>()?;
        Ok(PropertyValue::List(items))
    }
}

fn is_scalar_type(type_tag: Option<&str>) -> bool {
    match type_tag {
        Some(t) => {
            t == "System.Boolean" || t.starts_with("System.Int") || t.starts_with("System.UInt")
        }
        None => false,
    }
}

fn coerce_scalar(node: &PropertyNode) -> ScvmmResult<PropertyValue> {
    let type_tag = match node.type_tag {
        Some(ref t) => t,
        None => return Ok(PropertyValue::Null),
    };
    let text = match node.text {
        Some(ref t) => t,
        None => return Ok(PropertyValue::Null),
    };

    if type_tag == "System.Boolean" {
        Ok(PropertyValue::Bool(text.trim().eq_ignore_ascii_case("true")))
    } else if type_tag.starts_with("System.Int") || type_tag.starts_with("System.UInt") {
        text.trim()
            .parse::<i64>()
            .map(PropertyValue::Int)
            .map_err(|_| {
                ScvmmError::parse(format!(
                    "Non-numeric text '{}' for {} property '{}'",
                    text.trim(),
                    type_tag,
                    node.name.as_deref().unwrap_or("<unnamed>"),
                ))
            })
    } else if type_tag == "System.String" && text.trim().eq_ignore_ascii_case("none") {
        // The manager writes the literal string "None" for absent values.
        Ok(PropertyValue::Null)
    } else {
        Ok(PropertyValue::Str(text.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScvmmErrorKind;

    fn leaf(name: &str, type_tag: &str, text: &str) -> PropertyNode {
        PropertyNode {
            name: Some(name.to_string()),
            type_tag: Some(type_tag.to_string()),
            text: Some(text.to_string()),
            children: Vec::new(),
        }
    }

    /// Re-serialize a deserialized value back into a node tree.
    fn to_node(name: Option<&str>, value: &PropertyValue) -> PropertyNode {
        let mut node = PropertyNode {
            name: name.map(str::to_string),
            ..Default::default()
        };
        match value {
            PropertyValue::Null => {}
            PropertyValue::Bool(b) => {
                node.type_tag = Some("System.Boolean".to_string());
                node.text = Some(b.to_string());
            }
            PropertyValue::Int(n) => {
                node.type_tag = Some("System.Int64".to_string());
                node.text = Some(n.to_string());
            }
            PropertyValue::Str(s) => {
                node.type_tag = Some("System.String".to_string());
                node.text = Some(s.clone());
            }
            PropertyValue::Record(entries) => {
                node.type_tag = Some("System.Management.Automation.PSCustomObject".to_string());
                for (n, v) in entries {
                    node.children.push(to_node(Some(n), v));
                }
            }
            PropertyValue::List(items) => {
                node.type_tag = Some("System.Object[]".to_string());
                for v in items {
                    node.children.push(to_node(None, v));
                }
            }
        }
        node
    }

    // ── Scalar coercion ──────────────────────────────────────────────

    #[test]
    fn test_boolean_coercion_is_case_insensitive() {
        assert_eq!(
            deserialize(&leaf("X", "System.Boolean", " TRUE ")).unwrap(),
            PropertyValue::Bool(true)
        );
        assert_eq!(
            deserialize(&leaf("X", "System.Boolean", "false")).unwrap(),
            PropertyValue::Bool(false)
        );
        assert_eq!(
            deserialize(&leaf("X", "System.Boolean", "yes")).unwrap(),
            PropertyValue::Bool(false)
        );
    }

    #[test]
    fn test_integer_coercion() {
        assert_eq!(
            deserialize(&leaf("N", "System.Int32", "42")).unwrap(),
            PropertyValue::Int(42)
        );
        assert_eq!(
            deserialize(&leaf("N", "System.Int64", "-7")).unwrap(),
            PropertyValue::Int(-7)
        );
        assert_eq!(
            deserialize(&leaf("N", "System.UInt16", "8080")).unwrap(),
            PropertyValue::Int(8080)
        );
    }

    #[test]
    fn test_integer_parse_failure() {
        let err = deserialize(&leaf("N", "System.Int32", "lots")).unwrap_err();
        assert_eq!(err.kind, ScvmmErrorKind::ParseError);
    }

    #[test]
    fn test_none_sentinel_becomes_null() {
        assert_eq!(
            deserialize(&leaf("S", "System.String", "None")).unwrap(),
            PropertyValue::Null
        );
        assert_eq!(
            deserialize(&leaf("S", "System.String", "  none  ")).unwrap(),
            PropertyValue::Null
        );
    }

    #[test]
    fn test_empty_string_is_distinct_from_null() {
        assert_eq!(
            deserialize(&leaf("S", "System.String", "")).unwrap(),
            PropertyValue::Str(String::new())
        );
    }

    #[test]
    fn test_string_passes_through_verbatim() {
        assert_eq!(
            deserialize(&leaf("S", "System.String", "Nonexistent")).unwrap(),
            PropertyValue::Str("Nonexistent".to_string())
        );
    }

    #[test]
    fn test_missing_type_or_text_is_null() {
        let untyped = PropertyNode {
            name: Some("X".to_string()),
            text: Some("whatever".to_string()),
            ..Default::default()
        };
        assert_eq!(deserialize(&untyped).unwrap(), PropertyValue::Null);

        let textless = PropertyNode {
            name: Some("X".to_string()),
            type_tag: Some("System.String".to_string()),
            ..Default::default()
        };
        assert_eq!(deserialize(&textless).unwrap(), PropertyValue::Null);
    }

    // ── Containers ───────────────────────────────────────────────────

    #[test]
    fn test_record_preserves_order() {
        let node = PropertyNode {
            name: Some("VM".to_string()),
            children: vec![
                leaf("Zeta", "System.String", "z"),
                leaf("Alpha", "System.String", "a"),
                leaf("Mid", "System.Int32", "1"),
            ],
            ..Default::default()
        };
        let value = deserialize(&node).unwrap();
        match value {
            PropertyValue::Record(entries) => {
                let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["Zeta", "Alpha", "Mid"]);
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_names_last_write_wins() {
        let node = PropertyNode {
            children: vec![
                leaf("Name", "System.String", "first"),
                leaf("Other", "System.Int32", "1"),
                leaf("Name", "System.String", "second"),
            ],
            ..Default::default()
        };
        let value = deserialize(&node).unwrap();
        assert_eq!(value.get("Name").and_then(|v| v.as_str()), Some("second"));
        match value {
            PropertyValue::Record(entries) => assert_eq!(entries.len(), 2),
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_unnamed_children_form_list() {
        let node = PropertyNode {
            name: Some("VirtualDVDDrives".to_string()),
            type_tag: Some("System.Object[]".to_string()),
            children: vec![
                PropertyNode {
                    type_tag: Some("System.String".to_string()),
                    text: Some("drive-1".to_string()),
                    ..Default::default()
                },
                PropertyNode {
                    type_tag: Some("System.String".to_string()),
                    text: Some("None".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(
            deserialize(&node).unwrap(),
            PropertyValue::List(vec![
                PropertyValue::Str("drive-1".to_string()),
                PropertyValue::Null,
            ])
        );
    }

    #[test]
    fn test_nested_record_in_record() {
        let node = PropertyNode {
            children: vec![
                leaf("Name", "System.String", "vm01"),
                PropertyNode {
                    name: Some("Hardware".to_string()),
                    children: vec![
                        leaf("CPUCount", "System.Int32", "4"),
                        leaf("DynamicMemory", "System.Boolean", "True"),
                    ],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let value = deserialize(&node).unwrap();
        let hardware = value.get("Hardware").expect("nested record");
        assert_eq!(hardware.get("CPUCount").and_then(|v| v.as_int()), Some(4));
        assert_eq!(
            hardware.get("DynamicMemory").and_then(|v| v.as_bool()),
            Some(true)
        );
    }

    #[test]
    fn test_scalar_type_with_children_is_malformed() {
        let node = PropertyNode {
            name: Some("X".to_string()),
            type_tag: Some("System.Boolean".to_string()),
            children: vec![leaf("Y", "System.String", "v")],
            ..Default::default()
        };
        let err = deserialize(&node).unwrap_err();
        assert_eq!(err.kind, ScvmmErrorKind::MalformedTree);
    }

    #[test]
    fn test_text_alongside_children_is_malformed() {
        let node = PropertyNode {
            name: Some("X".to_string()),
            text: Some("stray".to_string()),
            children: vec![leaf("Y", "System.String", "v")],
            ..Default::default()
        };
        let err = deserialize(&node).unwrap_err();
        assert_eq!(err.kind, ScvmmErrorKind::MalformedTree);
    }

    #[test]
    fn test_roundtrip_reproduces_structure_and_order() {
        let node = PropertyNode {
            children: vec![
                leaf("Name", "System.String", "vm01"),
                leaf("CPUCount", "System.Int32", "2"),
                leaf("VMId", "System.String", "None"),
                PropertyNode {
                    name: Some("Drives".to_string()),
                    children: vec![
                        PropertyNode {
                            type_tag: Some("System.String".to_string()),
                            text: Some("C:".to_string()),
                            ..Default::default()
                        },
                        PropertyNode {
                            type_tag: Some("System.Int64".to_string()),
                            text: Some("9".to_string()),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let first = deserialize(&node).unwrap();
        let second = deserialize(&to_node(None, &first)).unwrap();
        assert_eq!(first, second);
    }

    // ── XML codec ────────────────────────────────────────────────────

    #[test]
    fn test_decode_xml_discards_wrapper() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<Objects>
  <Object Type="System.Management.Automation.PSCustomObject">
    <Property Name="Name" Type="System.String">vm01</Property>
    <Property Name="StatusString" Type="System.String">Running</Property>
  </Object>
  <Object Type="System.Management.Automation.PSCustomObject">
    <Property Name="Name" Type="System.String">vm02</Property>
    <Property Name="StatusString" Type="System.String">PowerOff</Property>
  </Object>
</Objects>"#;
        let objects = decode_xml(xml).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(property_text(&objects, "Name"), vec!["vm01", "vm02"]);
        assert_eq!(
            property_text(&objects, "StatusString"),
            vec!["Running", "PowerOff"]
        );
    }

    #[test]
    fn test_decode_xml_nested_properties() {
        let xml = r#"<Objects>
  <Object Type="Microsoft.SystemCenter.VirtualMachineManager.VM">
    <Property Name="Name" Type="System.String">vm01</Property>
    <Property Name="VirtualDVDDrives" Type="System.Object[]">
      <Property Type="System.String">dvd-0</Property>
      <Property Type="System.String">dvd-1</Property>
    </Property>
  </Object>
</Objects>"#;
        let objects = decode_xml(xml).unwrap();
        let value = deserialize(&objects[0]).unwrap();
        assert_eq!(
            value.get("VirtualDVDDrives").unwrap(),
            &PropertyValue::List(vec![
                PropertyValue::Str("dvd-0".to_string()),
                PropertyValue::Str("dvd-1".to_string()),
            ])
        );
    }

    #[test]
    fn test_decode_xml_empty_wrapper() {
        let objects = decode_xml("<Objects />").unwrap();
        assert!(objects.is_empty());
    }

    #[test]
    fn test_decode_xml_rejects_garbage() {
        assert_eq!(
            decode_xml("").unwrap_err().kind,
            ScvmmErrorKind::Codec
        );
        assert_eq!(
            decode_xml("<Objects><Object></Objects>").unwrap_err().kind,
            ScvmmErrorKind::Codec
        );
    }

    #[test]
    fn test_decode_xml_unescapes_entities() {
        let xml = r#"<Objects>
  <Object>
    <Property Name="Notes" Type="System.String">a &amp; b &lt;ok&gt;</Property>
  </Object>
</Objects>"#;
        let objects = decode_xml(xml).unwrap();
        assert_eq!(property_text(&objects, "Notes"), vec!["a & b <ok>"]);
    }
}
