//! D-Bus introspection data.
//!
//! Parses the standard introspection XML into a model of nodes, interfaces,
//! methods, signals and properties, and serializes it back. Round trips are
//! stable modulo whitespace.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::InvalidIntrospectionError;
use crate::signature::parse_single_type;
use crate::validators::{is_interface_name_valid, is_member_name_valid};

const DOCTYPE: &str = "node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\" \
     \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\"";

const EMITS_CHANGED_ANNOTATION: &str = "org.freedesktop.DBus.Property.EmitsChangedSignal";

type ParseResult<T> = std::result::Result<T, InvalidIntrospectionError>;

fn xml_err(e: impl std::fmt::Display) -> InvalidIntrospectionError {
    InvalidIntrospectionError(e.to_string())
}

/// Direction of a method argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Property access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    fn as_str(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "readwrite",
        }
    }

    pub fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Values of the EmitsChangedSignal property annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitsChangedSignal {
    #[default]
    True,
    Invalidates,
    Const,
    False,
}

impl EmitsChangedSignal {
    fn as_str(self) -> &'static str {
        match self {
            EmitsChangedSignal::True => "true",
            EmitsChangedSignal::Invalidates => "invalidates",
            EmitsChangedSignal::Const => "const",
            EmitsChangedSignal::False => "false",
        }
    }
}

/// One method or signal argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    pub name: Option<String>,
    pub direction: Direction,
    /// A single complete type.
    pub signature: String,
}

impl Arg {
    pub fn new(name: Option<&str>, direction: Direction, signature: &str) -> ParseResult<Arg> {
        parse_single_type(signature)
            .map_err(|e| InvalidIntrospectionError(format!("invalid arg type: {e}")))?;
        Ok(Arg {
            name: name.map(str::to_string),
            direction,
            signature: signature.to_string(),
        })
    }
}

/// A method with its ordered in and out arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Method {
    pub name: String,
    pub in_args: Vec<Arg>,
    pub out_args: Vec<Arg>,
}

impl Method {
    /// Concatenated signature of the in arguments.
    pub fn in_signature(&self) -> String {
        self.in_args.iter().map(|a| a.signature.as_str()).collect()
    }

    /// Concatenated signature of the out arguments.
    pub fn out_signature(&self) -> String {
        self.out_args.iter().map(|a| a.signature.as_str()).collect()
    }
}

/// A signal with its ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signal {
    pub name: String,
    pub args: Vec<Arg>,
}

impl Signal {
    pub fn signature(&self) -> String {
        self.args.iter().map(|a| a.signature.as_str()).collect()
    }
}

/// A property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    /// A single complete type.
    pub signature: String,
    pub access: Access,
    pub emits_changed: EmitsChangedSignal,
}

/// An interface: methods, signals and properties.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Interface {
    pub name: String,
    pub methods: Vec<Method>,
    pub signals: Vec<Signal>,
    pub properties: Vec<Property>,
}

impl Interface {
    pub fn new(name: &str) -> ParseResult<Interface> {
        if !is_interface_name_valid(name) {
            return Err(InvalidIntrospectionError(format!(
                "invalid interface name: {name:?}"
            )));
        }
        Ok(Interface {
            name: name.to_string(),
            ..Interface::default()
        })
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn signal(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// An introspection node: interfaces plus child nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    /// Present on child nodes (a relative path segment); usually absent on
    /// the root.
    pub name: Option<String>,
    pub interfaces: Vec<Interface>,
    pub nodes: Vec<Node>,
}

impl Node {
    /// Look up an interface by name.
    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Parse introspection XML. The root element must be `<node>`.
    pub fn from_xml(xml: &str) -> ParseResult<Node> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Decl(_)
                | Event::DocType(_)
                | Event::Comment(_)
                | Event::PI(_)
                | Event::Text(_) => continue,
                Event::Start(e) if e.name().as_ref() == b"node" => {
                    return parse_node(&mut reader, &e, true);
                }
                Event::Empty(e) if e.name().as_ref() == b"node" => {
                    return node_shell(&e, true);
                }
                Event::Eof => {
                    return Err(InvalidIntrospectionError(
                        "no root <node> element".into(),
                    ))
                }
                _ => {
                    return Err(InvalidIntrospectionError(
                        "root element must be <node>".into(),
                    ))
                }
            }
        }
    }

    /// Serialize to introspection XML with the standard DOCTYPE header.
    pub fn to_xml(&self) -> String {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::DocType(BytesText::from_escaped(DOCTYPE)))
            .and_then(|_| write_node(&mut writer, self))
            .expect("writing to a Vec cannot fail");
        let bytes = writer.into_inner();
        String::from_utf8(bytes).expect("writer emits UTF-8")
    }
}

fn attr(e: &BytesStart<'_>, key: &str) -> ParseResult<Option<String>> {
    for attribute in e.attributes() {
        let attribute = attribute.map_err(xml_err)?;
        if attribute.key.as_ref() == key.as_bytes() {
            let value = attribute.unescape_value().map_err(xml_err)?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn required_attr(e: &BytesStart<'_>, key: &str, context: &str) -> ParseResult<String> {
    attr(e, key)?.ok_or_else(|| {
        InvalidIntrospectionError(format!("{context} is missing the {key:?} attribute"))
    })
}

fn node_shell(e: &BytesStart<'_>, is_root: bool) -> ParseResult<Node> {
    let name = attr(e, "name")?;
    if !is_root {
        match &name {
            Some(name) if !name.is_empty() && !name.contains('/') => {}
            _ => {
                return Err(InvalidIntrospectionError(
                    "child node requires a relative name".into(),
                ))
            }
        }
    }
    Ok(Node {
        name,
        ..Node::default()
    })
}

fn parse_node(reader: &mut Reader<&[u8]>, start: &BytesStart<'_>, is_root: bool) -> ParseResult<Node> {
    let mut node = node_shell(start, is_root)?;
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => match e.name().as_ref() {
                b"interface" => {
                    node.interfaces.push(parse_interface(reader, &e)?);
                }
                b"node" => {
                    node.nodes.push(parse_node(reader, &e, false)?);
                }
                _ => {
                    reader.read_to_end(e.name()).map_err(xml_err)?;
                }
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"interface" => {
                    node.interfaces
                        .push(Interface::new(&required_attr(&e, "name", "interface")?)?);
                }
                b"node" => {
                    node.nodes.push(node_shell(&e, false)?);
                }
                _ => {}
            },
            Event::End(_) => return Ok(node),
            Event::Eof => {
                return Err(InvalidIntrospectionError("unclosed <node> element".into()))
            }
            _ => {}
        }
    }
}

fn parse_interface(reader: &mut Reader<&[u8]>, start: &BytesStart<'_>) -> ParseResult<Interface> {
    let mut interface = Interface::new(&required_attr(start, "name", "interface")?)?;
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => match e.name().as_ref() {
                b"method" => interface.methods.push(parse_method(reader, &e)?),
                b"signal" => interface.signals.push(parse_signal(reader, &e)?),
                b"property" => interface.properties.push(parse_property(reader, &e, false)?),
                _ => {
                    reader.read_to_end(e.name()).map_err(xml_err)?;
                }
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"method" => interface.methods.push(Method {
                    name: member_name(&e, "method")?,
                    ..Method::default()
                }),
                b"signal" => interface.signals.push(Signal {
                    name: member_name(&e, "signal")?,
                    ..Signal::default()
                }),
                b"property" => interface.properties.push(parse_property(reader, &e, true)?),
                _ => {}
            },
            Event::End(_) => return Ok(interface),
            Event::Eof => {
                return Err(InvalidIntrospectionError(
                    "unclosed <interface> element".into(),
                ))
            }
            _ => {}
        }
    }
}

fn member_name(e: &BytesStart<'_>, context: &str) -> ParseResult<String> {
    let name = required_attr(e, "name", context)?;
    if !is_member_name_valid(&name) {
        return Err(InvalidIntrospectionError(format!(
            "invalid {context} name: {name:?}"
        )));
    }
    Ok(name)
}

fn parse_method(reader: &mut Reader<&[u8]>, start: &BytesStart<'_>) -> ParseResult<Method> {
    let mut method = Method {
        name: member_name(start, "method")?,
        ..Method::default()
    };
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) | Event::Empty(e) => {
                if e.name().as_ref() == b"arg" {
                    let direction = match attr(&e, "direction")?.as_deref() {
                        None | Some("in") => Direction::In,
                        Some("out") => Direction::Out,
                        Some(other) => {
                            return Err(InvalidIntrospectionError(format!(
                                "invalid method arg direction: {other:?}"
                            )))
                        }
                    };
                    let arg = Arg::new(
                        attr(&e, "name")?.as_deref(),
                        direction,
                        &required_attr(&e, "type", "arg")?,
                    )?;
                    match direction {
                        Direction::In => method.in_args.push(arg),
                        Direction::Out => method.out_args.push(arg),
                    }
                }
            }
            Event::End(e) if e.name().as_ref() == b"method" => return Ok(method),
            Event::End(_) => {}
            Event::Eof => {
                return Err(InvalidIntrospectionError("unclosed <method> element".into()))
            }
            _ => {}
        }
    }
}

fn parse_signal(reader: &mut Reader<&[u8]>, start: &BytesStart<'_>) -> ParseResult<Signal> {
    let mut signal = Signal {
        name: member_name(start, "signal")?,
        ..Signal::default()
    };
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) | Event::Empty(e) => {
                if e.name().as_ref() == b"arg" {
                    match attr(&e, "direction")?.as_deref() {
                        None | Some("out") => {}
                        Some(other) => {
                            return Err(InvalidIntrospectionError(format!(
                                "invalid signal arg direction: {other:?}"
                            )))
                        }
                    }
                    signal.args.push(Arg::new(
                        attr(&e, "name")?.as_deref(),
                        Direction::Out,
                        &required_attr(&e, "type", "arg")?,
                    )?);
                }
            }
            Event::End(e) if e.name().as_ref() == b"signal" => return Ok(signal),
            Event::End(_) => {}
            Event::Eof => {
                return Err(InvalidIntrospectionError("unclosed <signal> element".into()))
            }
            _ => {}
        }
    }
}

fn parse_property(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    empty: bool,
) -> ParseResult<Property> {
    let name = member_name(start, "property")?;
    let signature = required_attr(start, "type", "property")?;
    parse_single_type(&signature)
        .map_err(|e| InvalidIntrospectionError(format!("invalid property type: {e}")))?;
    let access = match required_attr(start, "access", "property")?.as_str() {
        "read" => Access::Read,
        "write" => Access::Write,
        "readwrite" => Access::ReadWrite,
        other => {
            return Err(InvalidIntrospectionError(format!(
                "invalid property access: {other:?}"
            )))
        }
    };
    let mut emits_changed = EmitsChangedSignal::default();

    if !empty {
        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(e) | Event::Empty(e) => {
                    if e.name().as_ref() == b"annotation"
                        && attr(&e, "name")?.as_deref() == Some(EMITS_CHANGED_ANNOTATION)
                    {
                        emits_changed = match attr(&e, "value")?.as_deref() {
                            Some("true") | None => EmitsChangedSignal::True,
                            Some("invalidates") => EmitsChangedSignal::Invalidates,
                            Some("const") => EmitsChangedSignal::Const,
                            Some("false") => EmitsChangedSignal::False,
                            Some(other) => {
                                return Err(InvalidIntrospectionError(format!(
                                    "invalid EmitsChangedSignal value: {other:?}"
                                )))
                            }
                        };
                    }
                }
                Event::End(e) if e.name().as_ref() == b"property" => break,
                Event::End(_) => {}
                Event::Eof => {
                    return Err(InvalidIntrospectionError(
                        "unclosed <property> element".into(),
                    ))
                }
                _ => {}
            }
        }
    }

    Ok(Property {
        name,
        signature,
        access,
        emits_changed,
    })
}

type WriteResult = std::io::Result<()>;

fn write_node(writer: &mut Writer<Vec<u8>>, node: &Node) -> WriteResult {
    let mut start = BytesStart::new("node");
    if let Some(name) = &node.name {
        start.push_attribute(("name", name.as_str()));
    }
    if node.interfaces.is_empty() && node.nodes.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }
    writer.write_event(Event::Start(start))?;
    for interface in &node.interfaces {
        write_interface(writer, interface)?;
    }
    for child in &node.nodes {
        write_node(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new("node")))
}

fn write_arg(writer: &mut Writer<Vec<u8>>, arg: &Arg, with_direction: bool) -> WriteResult {
    let mut start = BytesStart::new("arg");
    if let Some(name) = &arg.name {
        start.push_attribute(("name", name.as_str()));
    }
    start.push_attribute(("type", arg.signature.as_str()));
    if with_direction {
        let direction = match arg.direction {
            Direction::In => "in",
            Direction::Out => "out",
        };
        start.push_attribute(("direction", direction));
    }
    writer.write_event(Event::Empty(start))
}

fn write_interface(writer: &mut Writer<Vec<u8>>, interface: &Interface) -> WriteResult {
    let mut start = BytesStart::new("interface");
    start.push_attribute(("name", interface.name.as_str()));
    writer.write_event(Event::Start(start))?;

    for method in &interface.methods {
        let mut start = BytesStart::new("method");
        start.push_attribute(("name", method.name.as_str()));
        if method.in_args.is_empty() && method.out_args.is_empty() {
            writer.write_event(Event::Empty(start))?;
            continue;
        }
        writer.write_event(Event::Start(start))?;
        for arg in method.in_args.iter().chain(&method.out_args) {
            write_arg(writer, arg, true)?;
        }
        writer.write_event(Event::End(BytesEnd::new("method")))?;
    }

    for signal in &interface.signals {
        let mut start = BytesStart::new("signal");
        start.push_attribute(("name", signal.name.as_str()));
        if signal.args.is_empty() {
            writer.write_event(Event::Empty(start))?;
            continue;
        }
        writer.write_event(Event::Start(start))?;
        for arg in &signal.args {
            write_arg(writer, arg, false)?;
        }
        writer.write_event(Event::End(BytesEnd::new("signal")))?;
    }

    for property in &interface.properties {
        let mut start = BytesStart::new("property");
        start.push_attribute(("name", property.name.as_str()));
        start.push_attribute(("type", property.signature.as_str()));
        start.push_attribute(("access", property.access.as_str()));
        if property.emits_changed == EmitsChangedSignal::default() {
            writer.write_event(Event::Empty(start))?;
        } else {
            writer.write_event(Event::Start(start))?;
            let mut annotation = BytesStart::new("annotation");
            annotation.push_attribute(("name", EMITS_CHANGED_ANNOTATION));
            annotation.push_attribute(("value", property.emits_changed.as_str()));
            writer.write_event(Event::Empty(annotation))?;
            writer.write_event(Event::End(BytesEnd::new("property")))?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new("interface")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"<?xml version="1.0"?>
<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="com.example.Frobber">
    <method name="Frob">
      <arg name="input" type="s" direction="in"/>
      <arg name="output" type="as" direction="out"/>
    </method>
    <signal name="Frobbed">
      <arg name="count" type="u"/>
    </signal>
    <property name="Level" type="i" access="readwrite"/>
    <property name="Serial" type="s" access="read">
      <annotation name="org.freedesktop.DBus.Property.EmitsChangedSignal" value="const"/>
    </property>
  </interface>
  <node name="child"/>
</node>"#;

    #[test]
    fn test_parse_example() {
        let node = Node::from_xml(EXAMPLE).unwrap();
        let iface = node.interface("com.example.Frobber").unwrap();

        let method = iface.method("Frob").unwrap();
        assert_eq!(method.in_signature(), "s");
        assert_eq!(method.out_signature(), "as");
        assert_eq!(method.in_args[0].name.as_deref(), Some("input"));

        let signal = iface.signal("Frobbed").unwrap();
        assert_eq!(signal.signature(), "u");

        let level = iface.property("Level").unwrap();
        assert_eq!(level.access, Access::ReadWrite);
        assert_eq!(level.emits_changed, EmitsChangedSignal::True);

        let serial = iface.property("Serial").unwrap();
        assert_eq!(serial.access, Access::Read);
        assert_eq!(serial.emits_changed, EmitsChangedSignal::Const);

        assert_eq!(node.nodes.len(), 1);
        assert_eq!(node.nodes[0].name.as_deref(), Some("child"));
    }

    #[test]
    fn test_round_trip() {
        let node = Node::from_xml(EXAMPLE).unwrap();
        let reparsed = Node::from_xml(&node.to_xml()).unwrap();
        assert_eq!(node, reparsed);
    }

    #[test]
    fn test_schema_violations() {
        assert!(Node::from_xml("<interface name='a.b'/>").is_err());
        assert!(Node::from_xml("<node><interface/></node>").is_err());
        assert!(Node::from_xml("<node><interface name='nodots'/></node>").is_err());
        assert!(Node::from_xml(
            "<node><interface name='a.b'><method name='M'><arg type='!!'/></method></interface></node>"
        )
        .is_err());
        assert!(Node::from_xml(
            "<node><interface name='a.b'><method name='M'><arg type='s' direction='sideways'/></method></interface></node>"
        )
        .is_err());
        assert!(Node::from_xml(
            "<node><interface name='a.b'><property name='P' type='s' access='admin'/></interface></node>"
        )
        .is_err());
        assert!(Node::from_xml("<node><node/></node>").is_err());
    }

    #[test]
    fn test_unknown_elements_ignored() {
        let xml = "<node><interface name='a.b'><method name='M'>\
                   <annotation name='x' value='y'/></method></interface><garbage/></node>";
        let node = Node::from_xml(xml).unwrap();
        assert!(node.interface("a.b").unwrap().method("M").is_some());
    }
}
