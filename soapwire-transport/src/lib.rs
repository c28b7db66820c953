// Incremental HTTP/1.1 request framing.
//
// The framer is sans-io: callers feed it bytes in whatever fragments the
// socket produced and drain typed events. Fixed-length and chunked bodies
// (including trailers) are both delivered as a stream of chunks, so the
// dispatcher chooses buffering or streaming per request.

pub mod error;
pub mod framer;
pub mod headers;
pub mod response;

pub use error::FrameError;
pub use framer::{FrameEvent, RequestFramer, RequestHead};
pub use headers::Headers;
pub use response::Response;
