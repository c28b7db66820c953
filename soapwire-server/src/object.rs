//! The service-object surface.
//!
//! A server object is created per connection by the factory and owns the
//! SOAP handler. The optional interfaces (auth, raw XML, custom verbs) are
//! modeled as capabilities the object opts into; the dispatcher queries
//! them at routing time.

use std::path::PathBuf;

use async_trait::async_trait;
use soapwire_core::{fault_codes, SoapHeaders, SoapMessage};
use soapwire_transport::Headers;

use crate::auth::Credentials;

/// Error type handlers may bubble up with `?`; the dispatcher translates it
/// into a `Server.InternalError` fault.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Per-call context handed to the SOAP handler: what arrived, and what the
/// handler wants attached to the response.
#[derive(Debug)]
pub struct RequestContext {
    soap_action: String,
    http_headers: Headers,
    path: String,
    request_soap_headers: SoapHeaders,
    response_soap_headers: SoapHeaders,
    response_namespace: Option<String>,
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl RequestContext {
    pub(crate) fn new(
        soap_action: String,
        http_headers: Headers,
        path: String,
        request_soap_headers: SoapHeaders,
        cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        RequestContext {
            soap_action,
            http_headers,
            path,
            request_soap_headers,
            response_soap_headers: SoapHeaders::new(),
            response_namespace: None,
            cancelled,
        }
    }

    /// The SOAP action of this call: the `SoapAction` header (1.1) or the
    /// `action` content-type parameter (1.2), without surrounding quotes.
    pub fn soap_action(&self) -> &str {
        &self.soap_action
    }

    /// Raw HTTP request headers.
    pub fn http_headers(&self) -> &Headers {
        &self.http_headers
    }

    /// Normalized request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// SOAP headers that arrived with the request.
    pub fn request_headers(&self) -> &SoapHeaders {
        &self.request_soap_headers
    }

    /// Attach SOAP headers to the response envelope.
    pub fn set_response_headers(&mut self, headers: SoapHeaders) {
        self.response_soap_headers = headers;
    }

    pub fn response_headers(&self) -> &SoapHeaders {
        &self.response_soap_headers
    }

    /// Override the namespace of the response element; defaults to the
    /// namespace the request arrived in.
    pub fn set_response_namespace(&mut self, namespace: &str) {
        self.response_namespace = Some(namespace.to_owned());
    }

    pub fn response_namespace(&self) -> Option<&str> {
        self.response_namespace.as_deref()
    }

    /// True once the peer closed its socket. Cooperative handlers may poll
    /// this and abandon expensive work; the framework never interrupts a
    /// running handler.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// A file the object wants served for a GET request: the on-disk location
/// and the content type. The server checks readability and existence before
/// streaming it.
#[derive(Debug, Clone)]
pub struct FileResponse {
    pub path: PathBuf,
    pub content_type: String,
}

impl FileResponse {
    pub fn new(path: impl Into<PathBuf>, content_type: &str) -> Self {
        FileResponse {
            path: path.into(),
            content_type: content_type.to_owned(),
        }
    }
}

/// Authentication predicate, consulted uniformly for SOAP, file and
/// custom-verb routes.
pub trait AuthValidator: Send {
    fn validate_authentication(&mut self, credentials: &Credentials, path: &str) -> bool;
}

/// Streaming consumer for raw POST bodies. When `new_request` accepts, body
/// chunks are pushed as they arrive off the wire and `end_request` produces
/// the complete HTTP response to send verbatim.
pub trait RawXmlHandler: Send {
    fn new_request(&mut self, verb: &str, headers: &Headers) -> bool;
    fn process_xml(&mut self, chunk: &[u8]);
    fn end_request(&mut self) -> Vec<u8>;
}

/// Handler for HTTP verbs outside GET/POST. Returning `Some` means handled;
/// the bytes are sent as the complete response.
pub trait CustomVerbHandler: Send {
    fn process_custom_verb(
        &mut self,
        verb: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Option<Vec<u8>>;
}

/// A service object: one per connection, owning the handler methods.
#[async_trait]
pub trait ServerObject: Send + Sync {
    /// Handle one SOAP call. The request's name is the method; set a value
    /// (and optionally a name) on `response`, or a fault. Leaving the
    /// response untouched makes the dispatcher answer `Server.MethodNotFound`.
    async fn process_request(
        &mut self,
        request: &SoapMessage,
        response: &mut SoapMessage,
        ctx: &mut RequestContext,
    ) -> Result<(), HandlerError>;

    /// Map a GET path to a file, or `None` for 404.
    fn process_file_request(&mut self, _path: &str) -> Option<FileResponse> {
        None
    }

    /// Static headers added to every HTTP response on this connection.
    fn additional_response_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Accept or reject the action string before the handler runs; rejecting
    /// produces a `Server.UnknownSoapAction` fault.
    fn validate_soap_action(&self, _action: &str, _method: &str) -> bool {
        true
    }

    fn auth_validator(&mut self) -> Option<&mut dyn AuthValidator> {
        None
    }

    fn raw_xml_handler(&mut self) -> Option<&mut dyn RawXmlHandler> {
        None
    }

    fn custom_verb_handler(&mut self) -> Option<&mut dyn CustomVerbHandler> {
        None
    }
}

/// Creates the service object for each accepted connection.
pub trait ServerObjectFactory: Send + Sync {
    fn create(&self) -> Box<dyn ServerObject>;
}

impl<F> ServerObjectFactory for F
where
    F: Fn() -> Box<dyn ServerObject> + Send + Sync,
{
    fn create(&self) -> Box<dyn ServerObject> {
        self()
    }
}

/// Fill `response` with the conventional fault for missing required
/// arguments: the faultstring is the comma-joined list of missing names.
pub fn fault_missing_arguments(response: &mut SoapMessage, missing: &[&str]) {
    response.set_fault(
        fault_codes::REQUIRED_ARGUMENT_MISSING,
        &missing.join(","),
        "",
        "",
    );
}

/// Assemble a complete `200 OK` HTTP response around an XML payload, for
/// raw-XML handlers that produce their own envelope bytes.
pub fn raw_xml_response(xml: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n",
        xml.len()
    )
    .into_bytes();
    out.extend_from_slice(xml);
    out
}
