//! The SOAP value tree.
//!
//! A `SoapValue` is one named node: a typed text value, child elements,
//! attributes, namespace bookkeeping and the `qualified`/`nillable` flags.
//! Values are plain `Clone` data; copying a subtree is always safe.

use chrono::{NaiveDate, NaiveTime};

use crate::datetime::{self, XsdDateTime};
use crate::namespaces;

/// The typed payload of a value node.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ValueKind {
    #[default]
    Null,
    String(String),
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(XsdDateTime),
}

impl ValueKind {
    pub fn is_null(&self) -> bool {
        matches!(self, ValueKind::Null)
    }

    /// Wire text for this value. `None` for null. Binary honors the
    /// `hexBinary` xsd type, defaulting to Base64 like the schema types do.
    pub fn to_text(&self, type_ns: Option<&str>, type_name: Option<&str>) -> Option<String> {
        use base64::Engine as _;
        match self {
            ValueKind::Null => None,
            ValueKind::String(s) => Some(s.clone()),
            ValueKind::Bool(b) => Some(b.to_string()),
            ValueKind::Int(i) => Some(i.to_string()),
            ValueKind::UInt(u) => Some(u.to_string()),
            ValueKind::Float(f) => Some(f.to_string()),
            ValueKind::Double(d) => Some(d.to_string()),
            ValueKind::Bytes(data) => {
                let is_schema_ns = matches!(
                    type_ns,
                    Some(namespaces::XML_SCHEMA_1999) | Some(namespaces::XML_SCHEMA_2001)
                );
                if is_schema_ns && type_name == Some("hexBinary") {
                    Some(data.iter().map(|b| format!("{b:02x}")).collect())
                } else {
                    Some(base64::engine::general_purpose::STANDARD.encode(data))
                }
            }
            ValueKind::Date(d) => Some(datetime::date_to_text(*d)),
            ValueKind::Time(t) => Some(datetime::time_to_text(*t)),
            ValueKind::DateTime(dt) => Some(dt.to_date_string()),
        }
    }

    /// The xsd type local name inferred from the runtime kind, for encoded
    /// use when no explicit type annotation was set.
    pub fn xsd_type(&self) -> Option<&'static str> {
        match self {
            ValueKind::Null => None,
            ValueKind::String(_) => Some("string"),
            ValueKind::Bool(_) => Some("boolean"),
            ValueKind::Int(_) => Some("int"),
            ValueKind::UInt(_) => Some("unsignedInt"),
            ValueKind::Float(_) => Some("float"),
            ValueKind::Double(_) => Some("double"),
            ValueKind::Bytes(_) => Some("base64Binary"),
            ValueKind::Date(_) => Some("date"),
            ValueKind::Time(_) => Some("time"),
            ValueKind::DateTime(_) => Some("dateTime"),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ValueKind::String(s) => Some(s),
            _ => None,
        }
    }

    /// Lossy text view used by callers that treat everything as a string.
    pub fn to_display_string(&self) -> String {
        self.to_text(None, None).unwrap_or_default()
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ValueKind::Int(i) => Some(*i),
            ValueKind::UInt(u) => i64::try_from(*u).ok(),
            ValueKind::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ValueKind::Double(d) => Some(*d),
            ValueKind::Float(f) => Some(f64::from(*f)),
            ValueKind::Int(i) => Some(*i as f64),
            ValueKind::UInt(u) => Some(*u as f64),
            ValueKind::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ValueKind::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for ValueKind {
    fn from(s: &str) -> Self {
        ValueKind::String(s.to_owned())
    }
}

impl From<String> for ValueKind {
    fn from(s: String) -> Self {
        ValueKind::String(s)
    }
}

impl From<bool> for ValueKind {
    fn from(b: bool) -> Self {
        ValueKind::Bool(b)
    }
}

impl From<i32> for ValueKind {
    fn from(i: i32) -> Self {
        ValueKind::Int(i64::from(i))
    }
}

impl From<i64> for ValueKind {
    fn from(i: i64) -> Self {
        ValueKind::Int(i)
    }
}

impl From<u64> for ValueKind {
    fn from(u: u64) -> Self {
        ValueKind::UInt(u)
    }
}

impl From<f32> for ValueKind {
    fn from(f: f32) -> Self {
        ValueKind::Float(f)
    }
}

impl From<f64> for ValueKind {
    fn from(d: f64) -> Self {
        ValueKind::Double(d)
    }
}

impl From<Vec<u8>> for ValueKind {
    fn from(b: Vec<u8>) -> Self {
        ValueKind::Bytes(b)
    }
}

impl From<XsdDateTime> for ValueKind {
    fn from(dt: XsdDateTime) -> Self {
        ValueKind::DateTime(dt)
    }
}

/// One `xmlns` declaration: an empty prefix means the default namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDeclaration {
    pub prefix: String,
    pub uri: String,
}

/// Ordered child elements of a value, plus its attributes and the
/// SOAP-encoded array type used only by the serializer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SoapValueList {
    values: Vec<SoapValue>,
    attributes: Vec<SoapValue>,
    array_type: Option<(String, String)>,
}

impl SoapValueList {
    pub fn new() -> Self {
        SoapValueList::default()
    }

    /// First child with the given name, or a null value.
    pub fn child(&self, name: &str) -> SoapValue {
        self.values
            .iter()
            .find(|v| v.name() == name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_argument(&mut self, name: &str, value: impl Into<ValueKind>) {
        self.values.push(SoapValue::new(name, value));
    }

    pub fn attributes(&self) -> &[SoapValue] {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Vec<SoapValue> {
        &mut self.attributes
    }

    pub fn set_array_type(&mut self, namespace: &str, type_name: &str) {
        self.array_type = Some((namespace.to_owned(), type_name.to_owned()));
    }

    pub fn array_type(&self) -> Option<(&str, &str)> {
        self.array_type
            .as_ref()
            .map(|(ns, n)| (ns.as_str(), n.as_str()))
    }
}

impl std::ops::Deref for SoapValueList {
    type Target = Vec<SoapValue>;

    fn deref(&self) -> &Self::Target {
        &self.values
    }
}

impl std::ops::DerefMut for SoapValueList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.values
    }
}

impl FromIterator<SoapValue> for SoapValueList {
    fn from_iter<I: IntoIterator<Item = SoapValue>>(iter: I) -> Self {
        SoapValueList {
            values: iter.into_iter().collect(),
            ..Default::default()
        }
    }
}

/// A named, typed node in a SOAP message.
#[derive(Debug, Clone, Default)]
pub struct SoapValue {
    name: String,
    namespace: Option<String>,
    kind: ValueKind,
    type_ns: Option<String>,
    type_name: Option<String>,
    children: SoapValueList,
    local_ns_decls: Vec<NamespaceDeclaration>,
    env_ns_decls: Vec<NamespaceDeclaration>,
    qualified: bool,
    nillable: bool,
}

impl SoapValue {
    pub fn new(name: &str, value: impl Into<ValueKind>) -> Self {
        SoapValue {
            name: name.to_owned(),
            kind: value.into(),
            ..Default::default()
        }
    }

    pub fn with_type(
        name: &str,
        value: impl Into<ValueKind>,
        type_ns: &str,
        type_name: &str,
    ) -> Self {
        SoapValue {
            name: name.to_owned(),
            kind: value.into(),
            type_ns: Some(type_ns.to_owned()),
            type_name: Some(type_name.to_owned()),
            ..Default::default()
        }
    }

    /// Nil: no text value, no children, no attributes.
    pub fn is_nil(&self) -> bool {
        self.kind.is_null() && self.children.is_empty() && self.children.attributes().is_empty()
    }

    /// Null: nameless and nil — the "absent" value.
    pub fn is_null(&self) -> bool {
        self.name.is_empty() && self.is_nil()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
    }

    pub fn namespace_uri(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn set_namespace_uri(&mut self, ns: &str) {
        self.namespace = Some(ns.to_owned());
    }

    pub fn value(&self) -> &ValueKind {
        &self.kind
    }

    pub fn set_value(&mut self, value: impl Into<ValueKind>) {
        self.kind = value.into();
    }

    pub fn is_qualified(&self) -> bool {
        self.qualified
    }

    pub fn set_qualified(&mut self, qualified: bool) {
        self.qualified = qualified;
    }

    pub fn is_nillable(&self) -> bool {
        self.nillable
    }

    pub fn set_nillable(&mut self, nillable: bool) {
        self.nillable = nillable;
    }

    pub fn set_type(&mut self, namespace: &str, type_name: &str) {
        self.type_ns = Some(namespace.to_owned());
        self.type_name = Some(type_name.to_owned());
    }

    pub fn type_ns(&self) -> Option<&str> {
        self.type_ns.as_deref()
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub fn child_values(&self) -> &SoapValueList {
        &self.children
    }

    pub fn child_values_mut(&mut self) -> &mut SoapValueList {
        &mut self.children
    }

    pub fn add_namespace_declaration(&mut self, decl: NamespaceDeclaration) {
        self.local_ns_decls.push(decl);
    }

    pub fn namespace_declarations(&self) -> &[NamespaceDeclaration] {
        &self.local_ns_decls
    }

    pub fn set_environment_namespace_declarations(&mut self, decls: Vec<NamespaceDeclaration>) {
        self.env_ns_decls = decls;
    }

    pub fn environment_namespace_declarations(&self) -> &[NamespaceDeclaration] {
        &self.env_ns_decls
    }

    /// Expand a whitespace-separated text value into sibling values, one per
    /// token, each inheriting this value's name and type. Used for xsd list
    /// types.
    pub fn split(&self) -> SoapValueList {
        let text = self.kind.to_display_string();
        text.split_whitespace()
            .map(|part| {
                let mut v = self.clone();
                v.set_value(part);
                v
            })
            .collect()
    }

    /// Serialize this single value as a standalone XML document.
    pub fn to_xml(&self, use_mode: crate::message::Use, message_namespace: &str) -> Vec<u8> {
        crate::xml::writer::value_to_xml(self, use_mode, message_namespace)
    }
}

// Namespace bookkeeping is prefix-dependent; two trees that differ only in
// declarations or prefix choice are the same value.
impl PartialEq for SoapValue {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.namespace == other.namespace
            && self.kind == other.kind
            && self.type_ns == other.type_ns
            && self.type_name == other.type_name
            && self.children == other.children
            && self.qualified == other.qualified
            && self.nillable == other.nillable
    }
}
