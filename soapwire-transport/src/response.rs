//! HTTP response assembly. Responses always carry `Content-Length`; the
//! server never emits chunked responses.

use crate::headers::Headers;

#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: Headers,
    body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn ok(content_type: &str, body: Vec<u8>) -> Self {
        let mut response = Response::new(200);
        response.headers.set("Content-Type", content_type);
        response.body = body;
        response
    }

    pub fn bad_request() -> Self {
        Response::new(400)
    }

    pub fn unauthorized(realm: &str) -> Self {
        let mut response = Response::new(401);
        response
            .headers
            .set("WWW-Authenticate", &format!("Basic realm=\"{realm}\""));
        response
    }

    pub fn forbidden() -> Self {
        Response::new(403)
    }

    pub fn not_found() -> Self {
        Response::new(404)
    }

    pub fn method_not_allowed() -> Self {
        Response::new(405)
    }

    pub fn internal_error() -> Self {
        Response::new(500)
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.add(name, value);
        self
    }

    /// Serialize status line, headers and body. `Content-Length` is always
    /// written from the actual body size.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, status_text(self.status)).as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "",
    }
}
