//! Messages: a value tree whose children are the method arguments, plus the
//! fault state and the SOAP header list.

use crate::value::{SoapValue, SoapValueList, ValueKind};

/// Whether SOAP section-5 encoding annotations (`xsi:type`,
/// `soap-enc:arrayType`) are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Use {
    #[default]
    Literal,
    Encoded,
}

/// Dotted fault codes used by the dispatcher and by handlers.
pub mod fault_codes {
    pub const CLIENT_DATA: &str = "Client.Data";
    pub const METHOD_NOT_FOUND: &str = "Server.MethodNotFound";
    pub const REQUIRED_ARGUMENT_MISSING: &str = "Server.RequiredArgumentMissing";
    pub const INTERNAL_ERROR: &str = "Server.InternalError";
    pub const UNKNOWN_SOAP_ACTION: &str = "Server.UnknownSoapAction";
    pub const TIMEOUT: &str = "Server.Timeout";
}

/// An RPC message: the wrapped value's name is the method name and its
/// children are the arguments. Faults are stored as the conventional
/// `faultcode`/`faultstring`/`faultactor`/`detail` children with the fault
/// flag set; the writer renders them version-appropriately.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SoapMessage {
    value: SoapValue,
    use_mode: Use,
    is_fault: bool,
}

impl SoapMessage {
    pub fn new() -> Self {
        SoapMessage::default()
    }

    pub fn from_value(value: SoapValue) -> Self {
        SoapMessage {
            value,
            ..Default::default()
        }
    }

    pub fn use_mode(&self) -> Use {
        self.use_mode
    }

    pub fn set_use_mode(&mut self, use_mode: Use) {
        self.use_mode = use_mode;
    }

    pub fn is_fault(&self) -> bool {
        self.is_fault
    }

    pub fn set_fault_flag(&mut self, fault: bool) {
        self.is_fault = fault;
    }

    /// Arguments of the call (or fault fields, for a fault message).
    pub fn arguments(&self) -> &SoapValueList {
        self.value.child_values()
    }

    pub fn arguments_mut(&mut self) -> &mut SoapValueList {
        self.value.child_values_mut()
    }

    pub fn add_argument(&mut self, name: &str, value: impl Into<ValueKind>) {
        self.value.child_values_mut().add_argument(name, value);
    }

    /// Turn this message into a fault. Empty `actor`/`detail` are omitted.
    pub fn set_fault(&mut self, code: &str, string: &str, actor: &str, detail: &str) {
        self.is_fault = true;
        let children = self.value.child_values_mut();
        children.clear();
        children.add_argument("faultcode", code);
        children.add_argument("faultstring", string);
        if !actor.is_empty() {
            children.add_argument("faultactor", actor);
        }
        if !detail.is_empty() {
            children.add_argument("detail", detail);
        }
    }

    pub fn fault_code(&self) -> String {
        self.arguments().child("faultcode").value().to_display_string()
    }

    /// Human-readable fault summary, e.g.
    /// `Fault code Client.Data: Empty employee name (SomeActor). Error detail: ...`
    pub fn fault_as_string(&self) -> String {
        let args = self.arguments();
        let code = args.child("faultcode").value().to_display_string();
        let string = args.child("faultstring").value().to_display_string();
        let actor = args.child("faultactor").value().to_display_string();
        let detail = args.child("detail").value().to_display_string();

        let mut out = format!("Fault code {code}: {string}");
        if !actor.is_empty() {
            out.push_str(&format!(" ({actor})"));
        }
        if !detail.is_empty() {
            out.push_str(&format!(". Error detail: {detail}"));
        }
        out
    }
}

impl std::ops::Deref for SoapMessage {
    type Target = SoapValue;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl std::ops::DerefMut for SoapMessage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

/// SOAP header blocks attached to a message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SoapHeaders(Vec<SoapMessage>);

impl SoapHeaders {
    pub fn new() -> Self {
        SoapHeaders::default()
    }

    pub fn push(&mut self, header: SoapMessage) {
        self.0.push(header);
    }

    /// Look up a header element by name across all header blocks. A header
    /// block's children are searched, so both `<h:foo>` blocks and wrapper
    /// blocks containing `<foo>` resolve.
    pub fn header(&self, name: &str) -> SoapValue {
        self.header_impl(name, None)
    }

    pub fn header_with_ns(&self, name: &str, namespace: &str) -> SoapValue {
        self.header_impl(name, Some(namespace))
    }

    fn header_impl(&self, name: &str, namespace: Option<&str>) -> SoapValue {
        let ns_matches =
            |v: &SoapValue| namespace.is_none() || v.namespace_uri() == namespace;
        for block in &self.0 {
            if block.name() == name && ns_matches(block) {
                return (**block).clone();
            }
            for child in block.arguments().iter() {
                if child.name() == name && ns_matches(child) {
                    return child.clone();
                }
            }
        }
        SoapValue::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SoapMessage> {
        self.0.iter()
    }
}

impl FromIterator<SoapMessage> for SoapHeaders {
    fn from_iter<I: IntoIterator<Item = SoapMessage>>(iter: I) -> Self {
        SoapHeaders(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a SoapHeaders {
    type Item = &'a SoapMessage;
    type IntoIter = std::slice::Iter<'a, SoapMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
