//! Envelope and value serialization.
//!
//! Elements are emitted with a prefix when qualified or when their namespace
//! differs from the enclosing message namespace. Under encoded use each
//! element carries `xsi:type` (explicit annotation first, runtime kind as
//! fallback) and array parents carry `soap-enc:arrayType`.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::EncodeError;
use crate::message::{SoapHeaders, SoapMessage, Use};
use crate::namespaces::{self, PrefixMap, SoapVersion};
use crate::value::SoapValue;

/// Serialize a complete envelope: XML declaration, `soap:Envelope` with the
/// standard namespace declarations, optional `soap:Header`, and the method
/// element (or `soap:Fault`) inside `soap:Body`.
pub fn write_envelope(
    message: &SoapMessage,
    headers: &SoapHeaders,
    version: SoapVersion,
    message_namespace: &str,
) -> Result<Vec<u8>, EncodeError> {
    let mut writer = Writer::new(Vec::new());
    let mut prefixes = PrefixMap::standard(version, message_namespace);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut envelope = BytesStart::new("soap:Envelope");
    envelope.push_attribute(("xmlns:soap", version.envelope_namespace()));
    envelope.push_attribute(("xmlns:soap-enc", version.encoding_namespace()));
    envelope.push_attribute(("xmlns:xsd", namespaces::XML_SCHEMA_2001));
    envelope.push_attribute(("xmlns:xsi", namespaces::XML_SCHEMA_INSTANCE_2001));
    writer.write_event(Event::Start(envelope))?;

    if !headers.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("soap:Header")))?;
        for header in headers {
            if header.name().is_empty() {
                // Wrapper block: its children are the actual header elements.
                for child in header.arguments().iter() {
                    write_value(
                        &mut writer,
                        &mut prefixes,
                        child,
                        header.use_mode(),
                        message_namespace,
                        false,
                    )?;
                }
            } else {
                write_value(
                    &mut writer,
                    &mut prefixes,
                    header,
                    header.use_mode(),
                    message_namespace,
                    false,
                )?;
            }
        }
        writer.write_event(Event::End(BytesEnd::new("soap:Header")))?;
    }

    writer.write_event(Event::Start(BytesStart::new("soap:Body")))?;
    if message.is_fault() {
        write_fault(&mut writer, message, version)?;
    } else {
        write_method_element(&mut writer, &mut prefixes, message, message_namespace)?;
    }
    writer.write_event(Event::End(BytesEnd::new("soap:Body")))?;

    writer.write_event(Event::End(BytesEnd::new("soap:Envelope")))?;
    Ok(writer.into_inner())
}

/// The method element is always qualified in the message namespace, with
/// `xmlns:n1` declared on the element itself.
fn write_method_element(
    writer: &mut Writer<Vec<u8>>,
    prefixes: &mut PrefixMap,
    message: &SoapMessage,
    message_namespace: &str,
) -> Result<(), EncodeError> {
    let ns = message.namespace_uri().unwrap_or(message_namespace);
    // No namespace at all: the element stays unqualified.
    let name = if ns.is_empty() {
        message.name().to_owned()
    } else {
        let (prefix, _) = prefixes.resolve_or_allocate(ns);
        format!("{prefix}:{}", message.name())
    };

    let mut start = BytesStart::new(name.clone());
    if !ns.is_empty() {
        let (prefix, _) = prefixes.resolve_or_allocate(ns);
        start.push_attribute((format!("xmlns:{prefix}").as_str(), ns));
    }
    write_annotations(&mut start, prefixes, message, message.use_mode())?;
    writer.write_event(Event::Start(start))?;
    write_contents(writer, prefixes, message, message.use_mode(), ns)?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn write_fault(
    writer: &mut Writer<Vec<u8>>,
    message: &SoapMessage,
    version: SoapVersion,
) -> Result<(), EncodeError> {
    let args = message.arguments();
    let code = args.child("faultcode").value().to_display_string();
    let string = args.child("faultstring").value().to_display_string();
    let actor = args.child("faultactor").value().to_display_string();
    let detail = args.child("detail").value().to_display_string();

    writer.write_event(Event::Start(BytesStart::new("soap:Fault")))?;
    match version {
        SoapVersion::Soap11 => {
            write_text_element(writer, "faultcode", &code)?;
            write_text_element(writer, "faultstring", &string)?;
            if !actor.is_empty() {
                write_text_element(writer, "faultactor", &actor)?;
            }
            if !detail.is_empty() {
                write_text_element(writer, "detail", &detail)?;
            }
        }
        SoapVersion::Soap12 => {
            writer.write_event(Event::Start(BytesStart::new("soap:Code")))?;
            write_text_element(writer, "soap:Value", &code)?;
            writer.write_event(Event::End(BytesEnd::new("soap:Code")))?;
            writer.write_event(Event::Start(BytesStart::new("soap:Reason")))?;
            write_text_element(writer, "soap:Text", &string)?;
            writer.write_event(Event::End(BytesEnd::new("soap:Reason")))?;
            if !actor.is_empty() {
                write_text_element(writer, "soap:Role", &actor)?;
            }
            if !detail.is_empty() {
                write_text_element(writer, "soap:Detail", &detail)?;
            }
        }
    }
    writer.write_event(Event::End(BytesEnd::new("soap:Fault")))?;
    Ok(())
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
) -> Result<(), EncodeError> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Serialize one value subtree as a standalone document with the standard
/// namespaces declared on the root element.
pub fn value_to_xml(value: &SoapValue, use_mode: Use, message_namespace: &str) -> Vec<u8> {
    let mut writer = Writer::new(Vec::new());
    let mut prefixes = PrefixMap::standard(SoapVersion::Soap11, message_namespace);
    // Writing into a Vec cannot fail; keep the surface infallible.
    let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));
    let _ = write_value(
        &mut writer,
        &mut prefixes,
        value,
        use_mode,
        message_namespace,
        false,
    );
    writer.into_inner()
}

fn write_value(
    writer: &mut Writer<Vec<u8>>,
    prefixes: &mut PrefixMap,
    value: &SoapValue,
    use_mode: Use,
    message_namespace: &str,
    force_qualified: bool,
) -> Result<(), EncodeError> {
    let mut force = force_qualified;
    if let Some(ns) = value.namespace_uri() {
        if ns != message_namespace {
            force = true;
        }
    }

    let mut fresh_decl: Option<(String, String)> = None;
    let ns = value.namespace_uri().unwrap_or(message_namespace);
    let name = if (value.is_qualified() || force) && !ns.is_empty() {
        let (prefix, fresh) = prefixes.resolve_or_allocate(ns);
        if fresh {
            fresh_decl = Some((format!("xmlns:{prefix}"), ns.to_owned()));
        }
        format!("{prefix}:{}", value.name())
    } else {
        value.name().to_owned()
    };

    let mut start = BytesStart::new(name.clone());
    if let Some((attr, ns)) = &fresh_decl {
        start.push_attribute((attr.as_str(), ns.as_str()));
    }
    write_annotations(&mut start, prefixes, value, use_mode)?;

    let text = value
        .value()
        .to_text(value.type_ns(), value.type_name())
        .filter(|t| !t.is_empty());

    if value.child_values().is_empty() && text.is_none() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    write_contents_inner(writer, prefixes, value, use_mode, message_namespace, force)?;
    if let Some(text) = text {
        writer.write_event(Event::Text(BytesText::new(&text)))?;
    }
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Namespace declarations, `xsi:nil`, `xsi:type`, `soap-enc:arrayType` and
/// plain attributes, pushed onto the element's start tag.
fn write_annotations(
    start: &mut BytesStart<'_>,
    prefixes: &mut PrefixMap,
    value: &SoapValue,
    use_mode: Use,
) -> Result<(), EncodeError> {
    for decl in value.namespace_declarations() {
        if decl.prefix.is_empty() {
            start.push_attribute(("xmlns", decl.uri.as_str()));
        } else {
            start.push_attribute((format!("xmlns:{}", decl.prefix).as_str(), decl.uri.as_str()));
        }
    }

    if value.is_nil() && value.is_nillable() {
        start.push_attribute(("xsi:nil", "true"));
    }

    if use_mode == Use::Encoded {
        let type_attr = match (value.type_ns(), value.type_name()) {
            (Some(ns), Some(name)) => {
                let (qname, fresh_prefix) = prefixes.resolve_qname(ns, name);
                if let Some(prefix) = fresh_prefix {
                    start.push_attribute((format!("xmlns:{prefix}").as_str(), ns));
                }
                Some(qname)
            }
            _ => value.value().xsd_type().map(|t| format!("xsd:{t}")),
        };
        if let Some(t) = type_attr {
            start.push_attribute(("xsi:type", t.as_str()));
        }

        if let Some((array_ns, array_name)) = value.child_values().array_type() {
            let (qname, fresh_prefix) = prefixes.resolve_qname(array_ns, array_name);
            if let Some(prefix) = fresh_prefix {
                start.push_attribute((format!("xmlns:{prefix}").as_str(), array_ns));
            }
            let count = value.child_values().len();
            start.push_attribute(("soap-enc:arrayType", format!("{qname}[{count}]").as_str()));
        }
    }

    for attr in value.child_values().attributes() {
        let attr_text = attr
            .value()
            .to_text(attr.type_ns(), attr.type_name())
            .unwrap_or_default();
        if attr.is_qualified() {
            if let Some(ns) = attr.namespace_uri() {
                let (prefix, fresh) = prefixes.resolve_or_allocate(ns);
                if fresh {
                    start.push_attribute((format!("xmlns:{prefix}").as_str(), ns));
                }
                start.push_attribute((
                    format!("{prefix}:{}", attr.name()).as_str(),
                    attr_text.as_str(),
                ));
                continue;
            }
        }
        start.push_attribute((attr.name(), attr_text.as_str()));
    }
    Ok(())
}

fn write_contents(
    writer: &mut Writer<Vec<u8>>,
    prefixes: &mut PrefixMap,
    value: &SoapValue,
    use_mode: Use,
    message_namespace: &str,
) -> Result<(), EncodeError> {
    write_contents_inner(writer, prefixes, value, use_mode, message_namespace, false)?;
    if let Some(text) = value
        .value()
        .to_text(value.type_ns(), value.type_name())
        .filter(|t| !t.is_empty())
    {
        writer.write_event(Event::Text(BytesText::new(&text)))?;
    }
    Ok(())
}

fn write_contents_inner(
    writer: &mut Writer<Vec<u8>>,
    prefixes: &mut PrefixMap,
    value: &SoapValue,
    use_mode: Use,
    message_namespace: &str,
    force_qualified: bool,
) -> Result<(), EncodeError> {
    for child in value.child_values().iter() {
        write_value(
            writer,
            prefixes,
            child,
            use_mode,
            message_namespace,
            force_qualified,
        )?;
    }
    Ok(())
}
