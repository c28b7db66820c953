//! The SOAP client.

use std::time::Duration;

use reqwest::Client as HttpClient;
use soapwire_core::{
    parse_envelope, write_envelope, DecodeError, EncodeError, SoapHeaders, SoapMessage,
    SoapVersion,
};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP error {status}")]
    Http { status: u16 },

    #[error("{}", .0.fault_as_string())]
    Fault(SoapMessage),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

impl ClientError {
    /// The fault message, when the server answered with a SOAP fault.
    pub fn fault(&self) -> Option<&SoapMessage> {
        match self {
            ClientError::Fault(message) => Some(message),
            _ => None,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// URL of the SOAP endpoint.
    pub endpoint: String,
    /// Namespace of the method elements this client sends.
    pub message_namespace: String,
    pub version: SoapVersion,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: &str, message_namespace: &str) -> Self {
        ClientConfig {
            endpoint: endpoint.to_owned(),
            message_namespace: message_namespace.to_owned(),
            version: SoapVersion::Soap11,
            timeout: Duration::from_secs(30),
        }
    }
}

/// A successful call: the response message plus the SOAP headers that came
/// with it.
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub message: SoapMessage,
    pub headers: SoapHeaders,
}

pub struct SoapClient {
    config: ClientConfig,
    http: HttpClient,
    auth: Option<(String, String)>,
    persistent_headers: SoapHeaders,
}

impl SoapClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = HttpClient::builder().timeout(config.timeout).build()?;
        Ok(SoapClient {
            config,
            http,
            auth: None,
            persistent_headers: SoapHeaders::new(),
        })
    }

    pub fn new_with_endpoint(endpoint: &str, message_namespace: &str) -> Result<Self, ClientError> {
        Self::new(ClientConfig::new(endpoint, message_namespace))
    }

    /// Basic credentials sent with every request.
    pub fn set_authentication(&mut self, user: &str, password: &str) {
        self.auth = Some((user.to_owned(), password.to_owned()));
    }

    pub fn set_soap_version(&mut self, version: SoapVersion) {
        self.config.version = version;
    }

    /// SOAP headers attached to every call, merged before per-call headers.
    pub fn set_persistent_headers(&mut self, headers: SoapHeaders) {
        self.persistent_headers = headers;
    }

    /// The action used when a call does not name one explicitly:
    /// message namespace followed by the method name.
    pub fn default_soap_action(&self, method: &str) -> String {
        format!("{}{}", self.config.message_namespace, method)
    }

    /// Invoke `method` with the given arguments. Faults come back as
    /// `ClientError::Fault` carrying the decoded fault message.
    pub async fn call(
        &self,
        method: &str,
        mut message: SoapMessage,
        soap_action: Option<&str>,
        request_headers: SoapHeaders,
    ) -> Result<CallResponse, ClientError> {
        message.set_name(method);
        message.set_namespace_uri(&self.config.message_namespace);

        let action = soap_action
            .map(str::to_owned)
            .unwrap_or_else(|| self.default_soap_action(method));
        let headers: SoapHeaders = self
            .persistent_headers
            .iter()
            .chain(request_headers.iter())
            .cloned()
            .collect();
        let body = write_envelope(
            &message,
            &headers,
            self.config.version,
            &self.config.message_namespace,
        )?;
        trace!("request envelope: {}", String::from_utf8_lossy(&body));

        let mut request = self.http.post(&self.config.endpoint).body(body);
        request = match self.config.version {
            SoapVersion::Soap11 => request
                .header("Content-Type", "text/xml;charset=utf-8")
                .header("SoapAction", format!("\"{action}\"")),
            SoapVersion::Soap12 => request.header(
                "Content-Type",
                format!("application/soap+xml;charset=utf-8;action={action}"),
            ),
        };
        if let Some((user, password)) = &self.auth {
            request = request.basic_auth(user, Some(password));
        }

        debug!("calling {method} on {}", self.config.endpoint);
        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        trace!("response envelope: {}", String::from_utf8_lossy(&bytes));

        if !status.is_success() {
            // Fault bodies can ride on error statuses; prefer the fault.
            if let Ok(parsed) = parse_envelope(&bytes) {
                if parsed.message.is_fault() {
                    return Err(ClientError::Fault(parsed.message));
                }
            }
            return Err(ClientError::Http {
                status: status.as_u16(),
            });
        }

        let parsed = parse_envelope(&bytes)?;
        if parsed.message.is_fault() {
            return Err(ClientError::Fault(parsed.message));
        }
        Ok(CallResponse {
            message: parsed.message,
            headers: parsed.headers,
        })
    }

    /// Fire-and-forget variant: delivery is confirmed, the response body is
    /// discarded.
    pub async fn call_no_reply(
        &self,
        method: &str,
        message: SoapMessage,
        soap_action: Option<&str>,
    ) -> Result<(), ClientError> {
        match self.call(method, message, soap_action, SoapHeaders::new()).await {
            Ok(_) | Err(ClientError::Fault(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
