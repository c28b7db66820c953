//! Per-connection state machine and request dispatcher.
//!
//! Each accepted socket runs `handle_connection` on its assigned thread.
//! One request is in flight at a time; responses go out in arrival order.
//! Once a response has begun, any failure closes the connection rather than
//! emitting a second response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use soapwire_core::{
    fault_codes, parse_envelope, write_envelope, SoapMessage, SoapVersion,
};
use soapwire_transport::{FrameError, FrameEvent, Headers, RequestFramer, RequestHead, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::auth::{parse_authorization, Credentials};
use crate::object::{RequestContext, ServerObject};
use crate::path::normalize_path;
use crate::server::{RuntimeSettings, SharedState};

const READ_BUF_SIZE: usize = 8 * 1024;
const MAX_BUFFERED_BODY: usize = 64 * 1024 * 1024;
const AUTH_REALM: &str = "SOAP server";

#[derive(Debug)]
enum ConnError {
    Frame(FrameError),
    Io(std::io::Error),
    Closed,
}

impl From<FrameError> for ConnError {
    fn from(e: FrameError) -> Self {
        ConnError::Frame(e)
    }
}

impl From<std::io::Error> for ConnError {
    fn from(e: std::io::Error) -> Self {
        ConnError::Io(e)
    }
}

/// Drive one connection to completion. The service object lives exactly as
/// long as the socket.
pub(crate) async fn handle_connection<S>(stream: S, shared: Arc<SharedState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut object = shared.factory.create();
    let mut framer = RequestFramer::new();
    let mut read_buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let head = match read_head(&mut rd, &mut framer, &mut read_buf).await {
            Ok(Some(head)) => head,
            Ok(None) => return,
            Err(ConnError::Frame(e)) => {
                debug!("malformed request: {e}");
                let _ = wr.write_all(&Response::bad_request().to_bytes()).await;
                return;
            }
            Err(_) => return,
        };

        if shared.suspended.load(Ordering::SeqCst) {
            // A suspended server answers nothing, even on kept-alive
            // connections; the client must reconnect after resume.
            return;
        }

        let keep_alive = match handle_request(
            &mut rd,
            &mut wr,
            &mut framer,
            &mut read_buf,
            head,
            object.as_mut(),
            &shared,
        )
        .await
        {
            Ok(keep_alive) => keep_alive,
            Err(ConnError::Frame(e)) => {
                debug!("malformed request body: {e}");
                let _ = wr.write_all(&Response::bad_request().to_bytes()).await;
                return;
            }
            Err(_) => return,
        };

        if !keep_alive {
            return;
        }

        let rest = framer.take_remainder();
        framer = RequestFramer::new();
        if !rest.is_empty() {
            framer.feed(&rest);
        }
    }
}

async fn read_head<R: AsyncRead + Unpin>(
    rd: &mut R,
    framer: &mut RequestFramer,
    buf: &mut [u8],
) -> Result<Option<RequestHead>, ConnError> {
    loop {
        if let Some(event) = framer.next_event()? {
            match event {
                FrameEvent::Request(head) => return Ok(Some(head)),
                // Body events cannot precede the head.
                _ => continue,
            }
        }
        let n = rd.read(buf).await?;
        if n == 0 {
            return Ok(None);
        }
        framer.feed(&buf[..n]);
    }
}

async fn next_frame_event<R: AsyncRead + Unpin>(
    rd: &mut R,
    framer: &mut RequestFramer,
    buf: &mut [u8],
) -> Result<FrameEvent, ConnError> {
    loop {
        if let Some(event) = framer.next_event()? {
            return Ok(event);
        }
        let n = rd.read(buf).await?;
        if n == 0 {
            return Err(ConnError::Closed);
        }
        framer.feed(&buf[..n]);
    }
}

async fn drain_body<R: AsyncRead + Unpin>(
    rd: &mut R,
    framer: &mut RequestFramer,
    buf: &mut [u8],
) -> Result<(), ConnError> {
    if framer.is_done() {
        return Ok(());
    }
    loop {
        match next_frame_event(rd, framer, buf).await? {
            FrameEvent::End { .. } => return Ok(()),
            _ => continue,
        }
    }
}

async fn read_body_buffered<R: AsyncRead + Unpin>(
    rd: &mut R,
    framer: &mut RequestFramer,
    buf: &mut [u8],
) -> Result<Vec<u8>, ConnError> {
    let mut body = Vec::new();
    loop {
        match next_frame_event(rd, framer, buf).await? {
            FrameEvent::BodyChunk(chunk) => {
                if body.len() + chunk.len() > MAX_BUFFERED_BODY {
                    return Err(ConnError::Frame(FrameError::BodyTooLarge(MAX_BUFFERED_BODY)));
                }
                body.extend_from_slice(&chunk);
            }
            FrameEvent::End { .. } => return Ok(body),
            FrameEvent::Request(_) => continue,
        }
    }
}

/// Returns whether the connection may be reused for another request.
async fn handle_request<R, W>(
    rd: &mut R,
    wr: &mut W,
    framer: &mut RequestFramer,
    buf: &mut [u8],
    head: RequestHead,
    object: &mut dyn ServerObject,
    shared: &Arc<SharedState>,
) -> Result<bool, ConnError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let settings = shared.settings_snapshot();

    let normalized = match normalize_path(&head.target) {
        Ok(path) => path,
        Err(_) => {
            drain_body(rd, framer, buf).await?;
            respond(wr, Response::forbidden(), object).await?;
            return Ok(true);
        }
    };

    if let Some(validator) = object.auth_validator() {
        let credentials = head
            .headers
            .get("authorization")
            .and_then(parse_authorization)
            .unwrap_or(Credentials::Anonymous);
        if !validator.validate_authentication(&credentials, &normalized) {
            drain_body(rd, framer, buf).await?;
            respond(wr, Response::unauthorized(AUTH_REALM), object).await?;
            return Ok(true);
        }
    }

    let content_type = head
        .headers
        .get("content-type")
        .unwrap_or("")
        .to_ascii_lowercase();
    let is_soap_content = content_type.starts_with("text/xml")
        || content_type.starts_with("application/soap+xml");

    if head.method == "POST" && is_soap_content && normalized == settings.path {
        if let Some(raw) = object.raw_xml_handler() {
            if raw.new_request(&head.method, &head.headers) {
                loop {
                    match next_frame_event(rd, framer, buf).await? {
                        FrameEvent::BodyChunk(chunk) => raw.process_xml(&chunk),
                        FrameEvent::End { .. } => break,
                        FrameEvent::Request(_) => continue,
                    }
                }
                let bytes = raw.end_request();
                wr.write_all(&bytes).await?;
                wr.flush().await?;
                return Ok(true);
            }
        }

        let body = read_body_buffered(rd, framer, buf).await?;
        let (response, keep_alive) =
            dispatch_soap(rd, framer, object, &body, &head, &normalized, shared, &settings).await;
        if let Some(response) = response {
            respond(wr, response, object).await?;
        }
        return Ok(keep_alive);
    }

    if head.method == "POST" && is_soap_content {
        // Well-formed SOAP POST to the wrong path.
        let body = read_body_buffered(rd, framer, buf).await?;
        warn!("Invalid path: \"{normalized}\"");
        let response = invalid_path_fault(&body, &normalized, shared);
        respond(wr, response, object).await?;
        return Ok(true);
    }

    if head.method == "GET" {
        drain_body(rd, framer, buf).await?;
        return serve_get(wr, object, &normalized, &settings).await;
    }

    let body = read_body_buffered(rd, framer, buf).await?;
    if let Some(handler) = object.custom_verb_handler() {
        if let Some(bytes) = handler.process_custom_verb(&head.method, &body, &head.headers) {
            wr.write_all(&bytes).await?;
            wr.flush().await?;
            return Ok(true);
        }
    }
    warn!("Unknown HTTP request: \"{}\"", head.method);
    respond(wr, Response::method_not_allowed(), object).await?;
    Ok(true)
}

async fn serve_get<W: AsyncWrite + Unpin>(
    wr: &mut W,
    object: &mut dyn ServerObject,
    path: &str,
    settings: &RuntimeSettings,
) -> Result<bool, ConnError> {
    if let Some((disk_path, url_path)) = &settings.wsdl {
        if path == url_path {
            return send_file(wr, object, disk_path, "text/xml").await;
        }
    }
    match object.process_file_request(path) {
        Some(file) => send_file(wr, object, &file.path, &file.content_type).await,
        None => {
            respond(wr, Response::not_found(), object).await?;
            Ok(true)
        }
    }
}

async fn send_file<W: AsyncWrite + Unpin>(
    wr: &mut W,
    object: &dyn ServerObject,
    disk_path: &std::path::Path,
    content_type: &str,
) -> Result<bool, ConnError> {
    let metadata = match tokio::fs::metadata(disk_path).await {
        Ok(m) if m.is_file() => m,
        _ => {
            respond(wr, Response::not_found(), object).await?;
            return Ok(true);
        }
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o400 == 0 {
            respond(wr, Response::forbidden(), object).await?;
            return Ok(true);
        }
    }

    let mut file = match tokio::fs::File::open(disk_path).await {
        Ok(f) => f,
        Err(_) => {
            respond(wr, Response::not_found(), object).await?;
            return Ok(true);
        }
    };

    let mut header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n",
        metadata.len()
    );
    for (name, value) in object.additional_response_headers() {
        header.push_str(&format!("{name}: {value}\r\n"));
    }
    header.push_str("\r\n");
    wr.write_all(header.as_bytes()).await?;
    tokio::io::copy(&mut file, wr).await?;
    wr.flush().await?;
    Ok(true)
}

async fn respond<W: AsyncWrite + Unpin>(
    wr: &mut W,
    mut response: Response,
    object: &dyn ServerObject,
) -> Result<(), ConnError> {
    for (name, value) in object.additional_response_headers() {
        response.add_header(&name, &value);
    }
    wr.write_all(&response.to_bytes()).await?;
    wr.flush().await?;
    Ok(())
}

/// The action string: `SoapAction` header for 1.1, the `action` content-type
/// parameter for 1.2, quotes stripped either way.
fn extract_soap_action(headers: &Headers, version: SoapVersion) -> String {
    let from_header = headers.get("soapaction").unwrap_or("");
    let raw = match version {
        SoapVersion::Soap11 if !from_header.is_empty() => from_header.to_owned(),
        _ => headers
            .get("content-type")
            .and_then(|ct| {
                ct.split(';')
                    .map(str::trim)
                    .find_map(|part| part.strip_prefix("action="))
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| from_header.to_owned()),
    };
    raw.trim().trim_matches('"').to_owned()
}

fn fault_response(
    fault: &SoapMessage,
    version: SoapVersion,
    message_namespace: &str,
) -> Response {
    match write_envelope(fault, &Default::default(), version, message_namespace) {
        Ok(xml) => Response::ok(version.content_type(), xml),
        Err(e) => {
            warn!("failed to serialize fault envelope: {e}");
            Response::internal_error()
        }
    }
}

fn invalid_path_fault(body: &[u8], path: &str, shared: &Arc<SharedState>) -> Response {
    let (method, version) = match parse_envelope(body) {
        Ok(parsed) => (parsed.message.name().to_owned(), parsed.version),
        Err(_) => ("unknown".to_owned(), SoapVersion::Soap11),
    };
    let mut fault = SoapMessage::new();
    fault.set_fault(
        fault_codes::CLIENT_DATA,
        &format!("Method {method} not found in path {path}"),
        "",
        "",
    );
    shared.logger.log_fault(&method, &fault);
    fault_response(&fault, version, "")
}

enum HandlerOutcome {
    Finished(Result<(), crate::object::HandlerError>),
    TimedOut,
}

/// Run the SOAP handler while watching the read half: a peer close flips
/// the cooperative cancellation flag, and any pipelined bytes are carried
/// over into the framer for the next request.
async fn run_handler<R: AsyncRead + Unpin>(
    rd: &mut R,
    object: &mut dyn ServerObject,
    request: &SoapMessage,
    response: &mut SoapMessage,
    ctx: &mut RequestContext,
    timeout: Option<Duration>,
    cancelled: &Arc<AtomicBool>,
    carry: &mut Vec<u8>,
) -> HandlerOutcome {
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    let mut fut = object.process_request(request, response, ctx);
    let mut probe = [0u8; 1024];
    loop {
        tokio::select! {
            result = &mut fut => return HandlerOutcome::Finished(result),
            _ = sleep_until_opt(deadline) => return HandlerOutcome::TimedOut,
            read = rd.read(&mut probe), if !cancelled.load(Ordering::Relaxed) => {
                match read {
                    Ok(0) | Err(_) => cancelled.store(true, Ordering::Relaxed),
                    Ok(n) => carry.extend_from_slice(&probe[..n]),
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// SOAP dispatch: parse the envelope, consult the action validator, run the
/// handler, name the response element, and serialize the reply envelope.
#[allow(clippy::too_many_arguments)]
async fn dispatch_soap<R: AsyncRead + Unpin>(
    rd: &mut R,
    framer: &mut RequestFramer,
    object: &mut dyn ServerObject,
    body: &[u8],
    head: &RequestHead,
    path: &str,
    shared: &Arc<SharedState>,
    settings: &RuntimeSettings,
) -> (Option<Response>, bool) {
    let parsed = match parse_envelope(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            let mut fault = SoapMessage::new();
            fault.set_fault(fault_codes::CLIENT_DATA, &format!("XML error: {e}"), "", "");
            shared.logger.log_fault("unknown", &fault);
            return (Some(fault_response(&fault, SoapVersion::Soap11, "")), true);
        }
    };

    let version = parsed.version;
    let request_msg = parsed.message;
    let method_name = request_msg.name().to_owned();
    let message_ns = request_msg.namespace_uri().unwrap_or("").to_owned();
    let soap_action = extract_soap_action(&head.headers, version);

    let cancelled = Arc::new(AtomicBool::new(false));
    let mut ctx = RequestContext::new(
        soap_action.clone(),
        head.headers.clone(),
        path.to_owned(),
        parsed.headers,
        cancelled.clone(),
    );
    let mut response_msg = SoapMessage::new();
    response_msg.set_use_mode(request_msg.use_mode());

    let mut keep_alive = true;
    if !object.validate_soap_action(&soap_action, &method_name) {
        debug!("rejected soap action {soap_action:?} for {method_name}");
        response_msg.set_fault(
            fault_codes::UNKNOWN_SOAP_ACTION,
            "Unknown soap action",
            "",
            &soap_action,
        );
    } else {
        let mut carry = Vec::new();
        let outcome = run_handler(
            rd,
            object,
            &request_msg,
            &mut response_msg,
            &mut ctx,
            settings.request_timeout,
            &cancelled,
            &mut carry,
        )
        .await;
        if !carry.is_empty() {
            framer.feed(&carry);
        }
        match outcome {
            HandlerOutcome::Finished(Ok(())) => {}
            HandlerOutcome::Finished(Err(e)) => {
                response_msg.set_fault(fault_codes::INTERNAL_ERROR, &e.to_string(), "", "");
            }
            HandlerOutcome::TimedOut => {
                response_msg.set_fault(fault_codes::TIMEOUT, "Operation timed out", "", "");
                keep_alive = false;
            }
        }
    }

    if cancelled.load(Ordering::Relaxed) {
        // Peer is gone; discard the response silently.
        return (None, false);
    }

    if !response_msg.is_fault() && response_msg.is_null() {
        response_msg.set_fault(
            fault_codes::METHOD_NOT_FOUND,
            &format!("{method_name} not found"),
            "",
            "",
        );
    }

    if response_msg.is_fault() {
        shared.logger.log_fault(&method_name, &response_msg);
    } else {
        shared.logger.log_call(&method_name);
        response_msg.set_name(&format!("{method_name}Response"));
    }

    let response_ns = ctx
        .response_namespace()
        .unwrap_or(&message_ns)
        .to_owned();
    let response = fault_or_reply_envelope(&response_msg, &ctx, version, &response_ns);
    (Some(response), keep_alive)
}

fn fault_or_reply_envelope(
    message: &SoapMessage,
    ctx: &RequestContext,
    version: SoapVersion,
    namespace: &str,
) -> Response {
    match write_envelope(message, ctx.response_headers(), version, namespace) {
        Ok(xml) => Response::ok(version.content_type(), xml),
        Err(e) => {
            warn!("failed to serialize response envelope: {e}");
            Response::internal_error()
        }
    }
}
