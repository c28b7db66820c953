// SOAP server runtime.
//
// A `Server` listens on a TCP port, admits connections against a live
// connection budget, and hands each accepted socket either to its own
// listener loop or to a bounded `SoapThreadPool`. Each connection runs a
// per-socket state machine that frames HTTP/1.1, routes to SOAP dispatch,
// file download, raw-XML streaming or a custom verb handler, and enforces
// authentication and path safety uniformly.

pub mod auth;
pub mod logging;
pub mod object;
pub mod path;
pub mod pool;
pub mod server;
mod socket;

pub use auth::{parse_authorization, Credentials, DigestCredentials};
pub use logging::{LogLevel, ServerLogger};
pub use object::{
    fault_missing_arguments, raw_xml_response, AuthValidator, CustomVerbHandler, FileResponse,
    HandlerError, RawXmlHandler, RequestContext, ServerObject, ServerObjectFactory,
};
pub use path::{normalize_path, PathError};
pub use pool::SoapThreadPool;
pub use server::{Server, ServerConfig, ServerError};
