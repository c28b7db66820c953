//! Envelope and value deserialization.
//!
//! A prefix scope stack resolves element and attribute namespaces against
//! the nearest declaration. Whitespace-only text between element children is
//! dropped; mixed content stays on the parent. Unknown `xsi:type`
//! annotations are preserved verbatim on the decoded value.

use base64::Engine as _;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

use crate::datetime::{self, XsdDateTime};
use crate::error::DecodeError;
use crate::message::{SoapHeaders, SoapMessage};
use crate::namespaces::{self, SoapVersion};
use crate::value::{NamespaceDeclaration, SoapValue, ValueKind};

/// A decoded envelope: the method message, the header blocks, and the SOAP
/// version detected from the envelope namespace.
#[derive(Debug, Clone)]
pub struct ParsedEnvelope {
    pub message: SoapMessage,
    pub headers: SoapHeaders,
    pub version: SoapVersion,
}

struct EnvelopeParser<'a> {
    reader: Reader<&'a [u8]>,
    buf: Vec<u8>,
    // Stack of xmlns scopes; each frame holds the declarations of one open
    // element. `None` prefix is the default namespace.
    scopes: Vec<Vec<(Option<String>, String)>>,
}

/// Parse a complete SOAP envelope.
pub fn parse_envelope(data: &[u8]) -> Result<ParsedEnvelope, DecodeError> {
    let mut reader = Reader::from_reader(data);
    reader.expand_empty_elements(true);
    let mut parser = EnvelopeParser {
        reader,
        buf: Vec::new(),
        scopes: Vec::new(),
    };
    parser.parse()
}

impl<'a> EnvelopeParser<'a> {
    fn parse(&mut self) -> Result<ParsedEnvelope, DecodeError> {
        let envelope = loop {
            match self.next_event()? {
                Event::Start(e) => break e.to_owned(),
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) => continue,
                Event::Text(t) => {
                    let text = self.unescape_text(&t)?;
                    if text.trim().is_empty() {
                        continue;
                    }
                    return Err(self.err("text before envelope"));
                }
                Event::Eof => return Err(self.err("empty document")),
                _ => return Err(self.err("expected soap:Envelope")),
            }
        };

        self.push_scope(&envelope)?;
        let (_, envelope_prefix) = split_qname(envelope.name().0);
        let envelope_ns = self
            .resolve(envelope_prefix.as_deref())
            .ok_or_else(|| self.err("envelope element has no namespace"))?;
        let version = SoapVersion::from_envelope_namespace(&envelope_ns)
            .ok_or_else(|| DecodeError::envelope(format!("not a SOAP envelope: {envelope_ns}")))?;

        let mut headers = SoapHeaders::new();
        let mut message: Option<SoapMessage> = None;

        loop {
            match self.next_event()? {
                Event::Start(e) => {
                    let e = e.to_owned();
                    let (local, _) = split_qname(e.name().0);
                    match local.as_str() {
                        "Header" => {
                            self.push_scope(&e)?;
                            headers = self.parse_header_blocks()?;
                            self.scopes.pop();
                        }
                        "Body" => {
                            self.push_scope(&e)?;
                            message = Some(self.parse_body(version)?);
                            self.scopes.pop();
                        }
                        _ => {
                            // Tolerate unknown envelope children.
                            let e = e.clone();
                            self.push_scope(&e)?;
                            let _ = self.parse_element(&e)?;
                        }
                    }
                }
                Event::End(_) => break,
                Event::Text(_) | Event::Comment(_) => continue,
                Event::Eof => return Err(self.err("unexpected end of document")),
                _ => continue,
            }
        }

        let message = message.ok_or_else(|| DecodeError::envelope("envelope has no body"))?;
        Ok(ParsedEnvelope {
            message,
            headers,
            version,
        })
    }

    fn parse_header_blocks(&mut self) -> Result<SoapHeaders, DecodeError> {
        let mut headers = SoapHeaders::new();
        loop {
            match self.next_event()? {
                Event::Start(e) => {
                    let e = e.to_owned();
                    self.push_scope(&e)?;
                    let value = self.parse_element(&e)?;
                    headers.push(SoapMessage::from_value(value));
                }
                Event::End(_) => return Ok(headers),
                Event::Text(_) | Event::Comment(_) => continue,
                Event::Eof => return Err(self.err("unexpected end of document in header")),
                _ => continue,
            }
        }
    }

    fn parse_body(&mut self, version: SoapVersion) -> Result<SoapMessage, DecodeError> {
        let mut message: Option<SoapMessage> = None;
        loop {
            match self.next_event()? {
                Event::Start(e) => {
                    let e = e.to_owned();
                    self.push_scope(&e)?;
                    let env_decls = self.flattened_scope();
                    let (local, _) = split_qname(e.name().0);
                    let mut value = self.parse_element(&e)?;
                    if message.is_none() {
                        value.set_environment_namespace_declarations(env_decls);
                        let mut msg = SoapMessage::from_value(value);
                        if local == "Fault" {
                            normalize_fault(&mut msg, version);
                        }
                        message = Some(msg);
                    } else {
                        warn!("ignoring extra element in soap:Body");
                    }
                }
                Event::End(_) => break,
                Event::Text(_) | Event::Comment(_) => continue,
                Event::Eof => return Err(self.err("unexpected end of document in body")),
                _ => continue,
            }
        }
        message.ok_or_else(|| DecodeError::envelope("soap:Body is empty"))
    }

    /// Parse the element whose `Start` tag has already been consumed and
    /// whose xmlns declarations are already on the scope stack. Consumes up
    /// to and including the matching `End`, then pops the scope.
    fn parse_element(&mut self, start: &BytesStart<'static>) -> Result<SoapValue, DecodeError> {
        let (local, prefix) = split_qname(start.name().0);
        let mut value = SoapValue::new(&local, ValueKind::Null);
        if let Some(ns) = self.resolve(prefix.as_deref()) {
            value.set_namespace_uri(&ns);
            if prefix.is_some() {
                value.set_qualified(true);
            }
        }

        for (prefix, uri) in self.scopes.last().cloned().unwrap_or_default() {
            value.add_namespace_declaration(NamespaceDeclaration {
                prefix: prefix.unwrap_or_default(),
                uri,
            });
        }

        let mut explicit_type: Option<(Option<String>, String)> = None;
        for attr in start.attributes() {
            let attr = attr.map_err(|e| self.err(e.to_string()))?;
            let key = attr.key.0.to_vec();
            if key == b"xmlns" || key.starts_with(b"xmlns:") {
                continue;
            }
            let (attr_local, attr_prefix) = split_qname(&key);
            let attr_ns = attr_prefix.as_deref().and_then(|p| self.resolve(Some(p)));
            let text = attr
                .unescape_value()
                .map_err(|e| self.err(e.to_string()))?
                .into_owned();

            match (attr_ns.as_deref(), attr_local.as_str()) {
                (
                    Some(namespaces::XML_SCHEMA_INSTANCE_1999)
                    | Some(namespaces::XML_SCHEMA_INSTANCE_2001),
                    "type",
                ) => {
                    let (type_local, type_prefix) = split_qname(text.as_bytes());
                    let type_ns = self.resolve(type_prefix.as_deref());
                    explicit_type = Some((type_ns, type_local));
                }
                (
                    Some(namespaces::XML_SCHEMA_INSTANCE_1999)
                    | Some(namespaces::XML_SCHEMA_INSTANCE_2001),
                    "nil",
                ) => {
                    if text == "true" || text == "1" {
                        value.set_nillable(true);
                    }
                }
                (Some(namespaces::SOAP_ENCODING_11) | Some(namespaces::SOAP_ENCODING_12), "arrayType") => {
                    if let Some((array_ns, array_local)) = self.parse_array_type(&text) {
                        value
                            .child_values_mut()
                            .set_array_type(&array_ns, &array_local);
                    }
                }
                _ => {
                    let mut attr_value = SoapValue::new(&attr_local, text);
                    if let Some(ns) = attr_ns {
                        attr_value.set_namespace_uri(&ns);
                        attr_value.set_qualified(true);
                    }
                    value.child_values_mut().attributes_mut().push(attr_value);
                }
            }
        }

        let mut text_content = String::new();
        loop {
            match self.next_event()? {
                Event::Start(e) => {
                    let e = e.to_owned();
                    self.push_scope(&e)?;
                    let child = self.parse_element(&e)?;
                    value.child_values_mut().push(child);
                }
                Event::Text(t) => {
                    text_content.push_str(&self.unescape_text(&t)?);
                }
                Event::CData(c) => {
                    text_content.push_str(&String::from_utf8_lossy(c.as_ref()));
                }
                Event::End(_) => break,
                Event::Comment(_) | Event::PI(_) => continue,
                Event::Eof => return Err(self.err("unexpected end of document")),
                _ => continue,
            }
        }
        self.scopes.pop();

        // Whitespace between child elements is formatting, not content.
        if !value.child_values().is_empty() && text_content.trim().is_empty() {
            text_content.clear();
        }

        if let Some((type_ns, type_name)) = &explicit_type {
            if let Some(ns) = type_ns {
                value.set_type(ns, type_name);
            } else {
                value.set_type("", type_name);
            }
        }

        if !text_content.is_empty() {
            value.set_value(text_to_kind(
                explicit_type
                    .as_ref()
                    .map(|(ns, name)| (ns.as_deref(), name.as_str())),
                text_content,
            )?);
        }

        Ok(value)
    }

    /// `prefix:local[N]` (or `local[N]`) from a `soap-enc:arrayType` value.
    fn parse_array_type(&self, text: &str) -> Option<(String, String)> {
        let qname = text.split('[').next()?;
        let (local, prefix) = split_qname(qname.as_bytes());
        let ns = self.resolve(prefix.as_deref()).unwrap_or_default();
        Some((ns, local))
    }

    fn next_event(&mut self) -> Result<Event<'static>, DecodeError> {
        self.buf.clear();
        let pos = self.position();
        match self.reader.read_event_into(&mut self.buf) {
            Ok(event) => Ok(event.into_owned()),
            Err(e) => Err(DecodeError::malformed(e.to_string(), pos)),
        }
    }

    fn unescape_text(&self, text: &quick_xml::events::BytesText<'_>) -> Result<String, DecodeError> {
        text.unescape()
            .map(|t| t.into_owned())
            .map_err(|e| self.err(e.to_string()))
    }

    fn push_scope(&mut self, start: &BytesStart<'_>) -> Result<(), DecodeError> {
        let mut decls = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| self.err(e.to_string()))?;
            let key = attr.key.0;
            let uri = String::from_utf8_lossy(&attr.value).into_owned();
            if key == b"xmlns" {
                decls.push((None, uri));
            } else if let Some(prefix) = key.strip_prefix(b"xmlns:") {
                decls.push((Some(String::from_utf8_lossy(prefix).into_owned()), uri));
            }
        }
        self.scopes.push(decls);
        Ok(())
    }

    fn resolve(&self, prefix: Option<&str>) -> Option<String> {
        for scope in self.scopes.iter().rev() {
            for (p, uri) in scope {
                if p.as_deref() == prefix {
                    return Some(uri.clone());
                }
            }
        }
        None
    }

    fn flattened_scope(&self) -> Vec<NamespaceDeclaration> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for scope in self.scopes.iter().rev() {
            for (p, uri) in scope {
                let key = p.clone().unwrap_or_default();
                if seen.insert(key.clone()) {
                    out.push(NamespaceDeclaration {
                        prefix: key,
                        uri: uri.clone(),
                    });
                }
            }
        }
        out
    }

    fn position(&self) -> u64 {
        self.reader.buffer_position() as u64
    }

    fn err(&self, message: impl Into<String>) -> DecodeError {
        DecodeError::malformed(message, self.position())
    }
}

fn split_qname(raw: &[u8]) -> (String, Option<String>) {
    let raw = String::from_utf8_lossy(raw);
    match raw.split_once(':') {
        Some((prefix, local)) => (local.to_owned(), Some(prefix.to_owned())),
        None => (raw.into_owned(), None),
    }
}

/// Map SOAP 1.2 `Code/Value` + `Reason/Text` fault structure onto the
/// uniform `faultcode`/`faultstring` children, so callers see one shape.
fn normalize_fault(message: &mut SoapMessage, version: SoapVersion) {
    message.set_fault_flag(true);
    if version != SoapVersion::Soap12 {
        return;
    }
    let code = message
        .arguments()
        .child("Code")
        .child_values()
        .child("Value")
        .value()
        .to_display_string();
    let reason = message
        .arguments()
        .child("Reason")
        .child_values()
        .child("Text")
        .value()
        .to_display_string();
    let detail = message
        .arguments()
        .child("Detail")
        .value()
        .to_display_string();
    if !code.is_empty() || !reason.is_empty() {
        let actor = message.arguments().child("Role").value().to_display_string();
        message.set_fault(&code, &reason, &actor, &detail);
    }
}

/// Convert element text into a typed value according to its `xsi:type`.
/// Unknown types (or foreign namespaces) stay textual, with the annotation
/// preserved on the value by the caller.
fn text_to_kind(
    xsd_type: Option<(Option<&str>, &str)>,
    text: String,
) -> Result<ValueKind, DecodeError> {
    let Some((type_ns, type_name)) = xsd_type else {
        return Ok(ValueKind::String(text));
    };
    let is_schema = matches!(
        type_ns,
        Some(namespaces::XML_SCHEMA_1999) | Some(namespaces::XML_SCHEMA_2001) | None
    );
    if !is_schema {
        return Ok(ValueKind::String(text));
    }

    match type_name {
        "string" | "normalizedString" | "token" | "anyURI" | "QName" | "language" => {
            Ok(ValueKind::String(text))
        }
        "base64Binary" => base64::engine::general_purpose::STANDARD
            .decode(text.trim())
            .map(ValueKind::Bytes)
            .map_err(|_| DecodeError::numeric(text, "base64Binary")),
        "hexBinary" => decode_hex(text.trim())
            .map(ValueKind::Bytes)
            .ok_or_else(|| DecodeError::numeric(text, "hexBinary")),
        "int" | "integer" | "long" | "short" | "byte" | "negativeInteger" | "nonPositiveInteger" => {
            text.trim()
                .parse()
                .map(ValueKind::Int)
                .map_err(|_| DecodeError::numeric(text, type_name.to_owned()))
        }
        "unsignedInt" | "unsignedLong" | "unsignedShort" | "unsignedByte" | "positiveInteger"
        | "nonNegativeInteger" => text
            .trim()
            .parse()
            .map(ValueKind::UInt)
            .map_err(|_| DecodeError::numeric(text, type_name.to_owned())),
        "boolean" => match text.trim() {
            "true" | "1" => Ok(ValueKind::Bool(true)),
            "false" | "0" => Ok(ValueKind::Bool(false)),
            _ => Err(DecodeError::numeric(text, "boolean")),
        },
        "float" => text
            .trim()
            .parse()
            .map(ValueKind::Float)
            .map_err(|_| DecodeError::numeric(text, "float")),
        "double" | "decimal" => text
            .trim()
            .parse()
            .map(ValueKind::Double)
            .map_err(|_| DecodeError::numeric(text, "double")),
        "date" => datetime::parse_date(text.trim()).map(ValueKind::Date),
        "time" => datetime::parse_time(text.trim()).map(ValueKind::Time),
        "dateTime" => XsdDateTime::parse(text.trim()).map(ValueKind::DateTime),
        _ => Ok(ValueKind::String(text)),
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}
