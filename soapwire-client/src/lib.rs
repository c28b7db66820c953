// Async SOAP client.
//
// Formulates request envelopes through the core writer, posts them over
// HTTP, correlates the response envelope and surfaces faults as structured
// errors. Synchronous callers block on the future with their runtime of
// choice.

pub mod client;

pub use client::{CallResponse, ClientConfig, ClientError, SoapClient};
