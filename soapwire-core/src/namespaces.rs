//! Well-known namespace URIs and the prefix table used while writing
//! envelopes.

use std::collections::HashMap;

pub const SOAP_ENVELOPE_11: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_ENVELOPE_12: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const SOAP_ENCODING_11: &str = "http://schemas.xmlsoap.org/soap/encoding/";
pub const SOAP_ENCODING_12: &str = "http://www.w3.org/2003/05/soap-encoding";
pub const XML_SCHEMA_1999: &str = "http://www.w3.org/1999/XMLSchema";
pub const XML_SCHEMA_2001: &str = "http://www.w3.org/2001/XMLSchema";
pub const XML_SCHEMA_INSTANCE_1999: &str = "http://www.w3.org/1999/XMLSchema-instance";
pub const XML_SCHEMA_INSTANCE_2001: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// SOAP protocol version. Selects the envelope and encoding namespaces, the
/// response content type, and how the action string travels (header vs
/// content-type parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SoapVersion {
    #[default]
    Soap11,
    Soap12,
}

impl SoapVersion {
    pub fn envelope_namespace(self) -> &'static str {
        match self {
            SoapVersion::Soap11 => SOAP_ENVELOPE_11,
            SoapVersion::Soap12 => SOAP_ENVELOPE_12,
        }
    }

    pub fn encoding_namespace(self) -> &'static str {
        match self {
            SoapVersion::Soap11 => SOAP_ENCODING_11,
            SoapVersion::Soap12 => SOAP_ENCODING_12,
        }
    }

    /// Content type of responses (and client requests) for this version.
    pub fn content_type(self) -> &'static str {
        match self {
            SoapVersion::Soap11 => "text/xml",
            SoapVersion::Soap12 => "application/soap+xml; charset=utf-8",
        }
    }

    /// Identify the version from an envelope namespace URI.
    pub fn from_envelope_namespace(ns: &str) -> Option<Self> {
        match ns {
            SOAP_ENVELOPE_11 => Some(SoapVersion::Soap11),
            SOAP_ENVELOPE_12 => Some(SoapVersion::Soap12),
            _ => None,
        }
    }
}

/// Namespace-to-prefix table scoped to one envelope being written.
///
/// The standard prefixes (`soap`, `soap-enc`, `xsd`, `xsi`) plus `n1` for
/// the message namespace are pre-registered; further namespaces get `n2`,
/// `n3`, ... allocated on demand.
#[derive(Debug, Default)]
pub struct PrefixMap {
    prefixes: HashMap<String, String>,
    next_numbered: u32,
}

impl PrefixMap {
    pub fn standard(version: SoapVersion, message_namespace: &str) -> Self {
        let mut map = PrefixMap {
            prefixes: HashMap::new(),
            next_numbered: 2,
        };
        map.insert(version.envelope_namespace(), "soap");
        map.insert(version.encoding_namespace(), "soap-enc");
        map.insert(XML_SCHEMA_2001, "xsd");
        map.insert(XML_SCHEMA_INSTANCE_2001, "xsi");
        if !message_namespace.is_empty() {
            map.insert(message_namespace, "n1");
        }
        map
    }

    pub fn insert(&mut self, namespace: &str, prefix: &str) {
        self.prefixes.insert(namespace.to_owned(), prefix.to_owned());
    }

    pub fn prefix_for(&self, namespace: &str) -> Option<&str> {
        self.prefixes.get(namespace).map(String::as_str)
    }

    /// Prefix for `namespace`, allocating `n2`, `n3`, ... if it has none.
    /// Returns `(prefix, newly_allocated)`; a newly allocated prefix must be
    /// declared with `xmlns:` on the element being written.
    pub fn resolve_or_allocate(&mut self, namespace: &str) -> (String, bool) {
        if let Some(p) = self.prefixes.get(namespace) {
            return (p.clone(), false);
        }
        let prefix = format!("n{}", self.next_numbered);
        self.next_numbered += 1;
        self.prefixes.insert(namespace.to_owned(), prefix.clone());
        (prefix, true)
    }

    /// `prefix:local` for a qualified name, e.g. an `xsi:type` value.
    pub fn resolve_qname(&mut self, namespace: &str, local: &str) -> (String, Option<String>) {
        let (prefix, fresh) = self.resolve_or_allocate(namespace);
        let qname = format!("{prefix}:{local}");
        (qname, fresh.then(|| prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_namespaces() {
        assert_eq!(
            SoapVersion::Soap11.envelope_namespace(),
            "http://schemas.xmlsoap.org/soap/envelope/"
        );
        assert_eq!(
            SoapVersion::Soap12.envelope_namespace(),
            "http://www.w3.org/2003/05/soap-envelope"
        );
        assert_eq!(
            SoapVersion::from_envelope_namespace(SOAP_ENVELOPE_12),
            Some(SoapVersion::Soap12)
        );
        assert_eq!(SoapVersion::from_envelope_namespace("http://nope"), None);
    }

    #[test]
    fn test_prefix_allocation() {
        let mut map = PrefixMap::standard(SoapVersion::Soap11, "http://www.kdab.com/xml/MyWsdl/");
        assert_eq!(map.prefix_for("http://www.kdab.com/xml/MyWsdl/"), Some("n1"));
        assert_eq!(map.prefix_for(XML_SCHEMA_2001), Some("xsd"));

        let (p, fresh) = map.resolve_or_allocate("http://foo");
        assert_eq!(p, "n2");
        assert!(fresh);
        let (p, fresh) = map.resolve_or_allocate("http://foo");
        assert_eq!(p, "n2");
        assert!(!fresh);
    }
}
