// SOAP value model, XML codec and fault model.
//
// A SOAP message is a named tree of typed values. This crate owns the tree
// (`SoapValue`, `SoapValueList`), the message wrapper with its fault state
// (`SoapMessage`, `SoapHeaders`), the xsd text codecs, and the streaming
// XML reader/writer that turn messages into envelopes and back.

pub mod datetime;
pub mod error;
pub mod message;
pub mod namespaces;
pub mod value;
pub mod xml;

pub use datetime::XsdDateTime;
pub use error::{DecodeError, EncodeError};
pub use message::{fault_codes, SoapHeaders, SoapMessage, Use};
pub use namespaces::SoapVersion;
pub use value::{NamespaceDeclaration, SoapValue, SoapValueList, ValueKind};
pub use xml::reader::{parse_envelope, ParsedEnvelope};
pub use xml::writer::{value_to_xml, write_envelope};
