//! End-to-end server tests: a country service modeled on a real WSDL
//! service, exercised through the client crate and through raw sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use soapwire_client::{ClientError, SoapClient};
use soapwire_core::{namespaces, SoapHeaders, SoapMessage, SoapValue, SoapVersion};
use soapwire_server::{
    fault_missing_arguments, raw_xml_response, AuthValidator, Credentials, CustomVerbHandler,
    FileResponse, HandlerError, LogLevel, RawXmlHandler, RequestContext, Server, ServerConfig,
    ServerObject, SoapThreadPool,
};

const WSDL_NS: &str = "http://www.kdab.com/xml/MyWsdl/";
const LONG_EMPLOYEE_NAME: &str =
    "This is a long string in order to test chunking in this test";

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn raw_country_message(employee_name: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         xmlns:soap-enc=\"http://schemas.xmlsoap.org/soap/encoding/\" \
         xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\" \
         xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">\
         <soap:Body><n1:getEmployeeCountry xmlns:n1=\"{WSDL_NS}\">\
         <employeeName>{employee_name}</employeeName>\
         </n1:getEmployeeCountry></soap:Body></soap:Envelope>"
    )
}

/// Observation hooks injected into every test object.
#[derive(Default)]
struct Observed {
    threads: Mutex<Vec<std::thread::ThreadId>>,
    thread_names: Mutex<Vec<String>>,
}

struct CountryObject {
    require_auth: bool,
    use_raw_xml: bool,
    raw_valid: bool,
    assembled: Vec<u8>,
    file_dir: Option<std::path::PathBuf>,
}

impl CountryObject {
    fn new() -> Self {
        CountryObject {
            require_auth: false,
            use_raw_xml: false,
            raw_valid: false,
            assembled: Vec::new(),
            file_dir: None,
        }
    }
}

#[async_trait]
impl ServerObject for CountryObject {
    async fn process_request(
        &mut self,
        request: &SoapMessage,
        response: &mut SoapMessage,
        ctx: &mut RequestContext,
    ) -> Result<(), HandlerError> {
        ctx.set_response_namespace(WSDL_NS);
        match request.name() {
            "getEmployeeCountry" => {
                let employee_name = request
                    .arguments()
                    .child("employeeName")
                    .value()
                    .to_display_string();
                if employee_name.is_empty() {
                    response.set_fault(
                        "Client.Data",
                        "Empty employee name",
                        "CountryServerObject",
                        "Employee name must not be empty",
                    );
                    return Ok(());
                }
                if employee_name == "Slow" {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                response.add_argument("employeeCountry", format!("{employee_name} France"));
            }
            "getStuff" => {
                let args = request.arguments();
                let foo = args.child("foo");
                let bar = args.child("bar");
                let date_time = args.child("dateTime");
                let mut missing = Vec::new();
                if foo.is_null() {
                    missing.push("foo");
                }
                if bar.is_null() {
                    missing.push("bar");
                }
                if date_time.is_null() {
                    missing.push("dateTime");
                }
                if !missing.is_empty() {
                    fault_missing_arguments(response, &missing);
                    return Ok(());
                }
                let foo = foo.value().as_f64().ok_or("foo is not a number")?;
                let bar = bar.value().as_f64().ok_or("bar is not a number")?;
                let millis = soapwire_core::XsdDateTime::parse(
                    &date_time.value().to_display_string(),
                )?
                .timestamp_millis();
                let result = foo + bar + millis as f64 / 1000.0;

                let header1 = ctx.request_headers().header("header1");
                if header1.value().as_str() == Some("headerValue") {
                    let mut header2 = SoapMessage::new();
                    let mut value = SoapValue::new("header2", "responseHeader");
                    value.set_namespace_uri("http://foo");
                    header2.arguments_mut().push(value);
                    let mut headers = SoapHeaders::new();
                    headers.push(header2);
                    ctx.set_response_headers(headers);
                }
                response.set_value(result);
            }
            "hexBinaryTest" => {
                let args = request.arguments();
                let input1 = base64::engine::general_purpose::STANDARD
                    .decode(args.child("a").value().to_display_string())?;
                let input2 = hex_decode(&args.child("b").value().to_display_string())
                    .ok_or("b is not hex")?;
                let mut combined = input1;
                combined.extend_from_slice(&input2);
                response.set_value(combined);
            }
            _ => {}
        }
        Ok(())
    }

    fn process_file_request(&mut self, path: &str) -> Option<FileResponse> {
        assert!(!path.contains(".."), "traversal reached the file handler");
        if path == "/path/to/file_download.txt" {
            let dir = self.file_dir.clone()?;
            return Some(FileResponse::new(dir.join("file_download.txt"), "text/plain"));
        }
        None
    }

    fn additional_response_headers(&self) -> Vec<(String, String)> {
        vec![
            ("Access-Control-Allow-Origin".into(), "*".into()),
            ("Access-Control-Allow-Headers".into(), "Content-Type".into()),
        ]
    }

    fn validate_soap_action(&self, action: &str, method: &str) -> bool {
        match method {
            "getEmployeeCountry" => action == format!("{WSDL_NS}getEmployeeCountry"),
            "getStuff" => action == "MySoapAction",
            "hexBinaryTest" => action == "ActionHex",
            _ => true,
        }
    }

    fn auth_validator(&mut self) -> Option<&mut dyn AuthValidator> {
        if self.require_auth {
            Some(self)
        } else {
            None
        }
    }

    fn raw_xml_handler(&mut self) -> Option<&mut dyn RawXmlHandler> {
        if self.use_raw_xml {
            Some(self)
        } else {
            None
        }
    }

    fn custom_verb_handler(&mut self) -> Option<&mut dyn CustomVerbHandler> {
        Some(self)
    }
}

impl AuthValidator for CountryObject {
    fn validate_authentication(&mut self, credentials: &Credentials, path: &str) -> bool {
        if !self.require_auth {
            return true;
        }
        if path != "/" && path != "/path/to/file_download.txt" {
            return false;
        }
        matches!(
            credentials,
            Credentials::Basic { user, password } if user == "kdab" && password == "pass42"
        )
    }
}

impl RawXmlHandler for CountryObject {
    fn new_request(&mut self, verb: &str, headers: &soapwire_transport::Headers) -> bool {
        if verb != "POST" {
            return false;
        }
        self.raw_valid = headers.contains("content-type") && headers.contains("soapaction");
        self.assembled.clear();
        true
    }

    fn process_xml(&mut self, chunk: &[u8]) {
        self.assembled.extend_from_slice(chunk);
    }

    fn end_request(&mut self) -> Vec<u8> {
        let expected = raw_country_message(LONG_EMPLOYEE_NAME);
        if self.raw_valid && self.assembled == expected.as_bytes() {
            let reply = format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">\
                 <soap:Body><n1:getEmployeeCountryResponse xmlns:n1=\"{WSDL_NS}\">\
                 <employeeCountry>{LONG_EMPLOYEE_NAME} France</employeeCountry>\
                 </n1:getEmployeeCountryResponse></soap:Body></soap:Envelope>"
            );
            raw_xml_response(reply.as_bytes())
        } else {
            b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n".to_vec()
        }
    }
}

impl CustomVerbHandler for CountryObject {
    fn process_custom_verb(
        &mut self,
        verb: &str,
        _body: &[u8],
        _headers: &soapwire_transport::Headers,
    ) -> Option<Vec<u8>> {
        if verb == "PULL" {
            Some(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello world".to_vec())
        } else {
            None
        }
    }
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

struct TestServer {
    server: Server,
    _observed: Arc<Observed>,
}

fn start_server(configure: impl Fn(&mut CountryObject) + Send + Sync + 'static) -> TestServer {
    start_server_with(ServerConfig::default(), None, configure)
}

fn start_server_with(
    config: ServerConfig,
    pool: Option<Arc<SoapThreadPool>>,
    configure: impl Fn(&mut CountryObject) + Send + Sync + 'static,
) -> TestServer {
    let observed = Arc::new(Observed::default());
    let hooks = observed.clone();
    let factory = move || {
        hooks
            .threads
            .lock()
            .unwrap()
            .push(std::thread::current().id());
        hooks.thread_names.lock().unwrap().push(
            std::thread::current()
                .name()
                .unwrap_or_default()
                .to_owned(),
        );
        let mut object = CountryObject::new();
        configure(&mut object);
        Box::new(object) as Box<dyn ServerObject>
    };
    let server = Server::new(config, factory);
    if let Some(pool) = pool {
        server.set_thread_pool(pool);
    }
    server.listen().unwrap();
    TestServer {
        server,
        _observed: observed,
    }
}

fn country_client(server: &Server) -> SoapClient {
    SoapClient::new_with_endpoint(&server.endpoint().unwrap(), WSDL_NS).unwrap()
}

fn country_message(name: &str) -> SoapMessage {
    let mut message = SoapMessage::new();
    message.add_argument("employeeName", name);
    message
}

fn call_country(client: &SoapClient, name: &str) -> Result<String, ClientError> {
    runtime().block_on(async {
        let response = client
            .call("getEmployeeCountry", country_message(name), None, SoapHeaders::new())
            .await?;
        Ok(response
            .message
            .arguments()
            .child("employeeCountry")
            .value()
            .to_display_string())
    })
}

/// Send raw bytes over a fresh socket, optionally in pieces, and return the
/// whole response.
fn raw_request(port: u16, request: &[u8], piece_size: usize) -> Vec<u8> {
    let mut socket = TcpStream::connect(("127.0.0.1", port)).unwrap();
    for piece in request.chunks(piece_size.max(1)) {
        // Writes may fail when the server rejects the connection; the
        // caller sees that as an empty response.
        if socket.write_all(piece).and_then(|()| socket.flush()).is_err() {
            break;
        }
    }
    socket
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match socket.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                response.extend_from_slice(&buf[..n]);
                if response_complete(&response) {
                    break;
                }
            }
        }
    }
    response
}

/// A response is complete once Content-Length bytes of body arrived.
fn response_complete(response: &[u8]) -> bool {
    let text = String::from_utf8_lossy(response);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    response.len() >= header_end + 4 + content_length
}

#[test]
fn test_basic_call() {
    let ts = start_server(|_| {});
    let client = country_client(&ts.server);
    let country = call_country(&client, "David Ä Faure").unwrap();
    assert_eq!(country, "David Ä Faure France");
    assert!(ts.server.total_connection_count() >= 1);
    ts.server.stop();
}

#[test]
fn test_method_not_found() {
    let ts = start_server(|_| {});
    let client = country_client(&ts.server);
    let err = runtime()
        .block_on(client.call(
            "doesNotExist",
            SoapMessage::new(),
            None,
            SoapHeaders::new(),
        ))
        .unwrap_err();
    let fault = err.fault().expect("expected a fault");
    assert_eq!(
        fault.arguments().child("faultcode").value().as_str(),
        Some("Server.MethodNotFound")
    );
    assert_eq!(
        fault.arguments().child("faultstring").value().as_str(),
        Some("doesNotExist not found")
    );
    ts.server.stop();
}

#[test]
fn test_missing_params() {
    let ts = start_server(|_| {});
    let client = country_client(&ts.server);
    let mut message = SoapMessage::new();
    message.add_argument("foo", 4);
    let err = runtime()
        .block_on(client.call("getStuff", message, Some("MySoapAction"), SoapHeaders::new()))
        .unwrap_err();
    let fault = err.fault().expect("expected a fault");
    assert_eq!(
        fault.fault_as_string(),
        "Fault code Server.RequiredArgumentMissing: bar,dateTime"
    );
    ts.server.stop();
}

#[test]
fn test_server_fault() {
    let ts = start_server(|_| {});
    let client = country_client(&ts.server);
    let err = call_country(&client, "").unwrap_err();
    let fault = err.fault().expect("expected a fault");
    assert_eq!(
        fault.arguments().child("faultcode").value().as_str(),
        Some("Client.Data")
    );
    assert_eq!(
        fault.fault_as_string(),
        "Fault code Client.Data: Empty employee name (CountryServerObject). \
         Error detail: Employee name must not be empty"
    );
    ts.server.stop();
}

#[test]
fn test_unknown_soap_action() {
    let ts = start_server(|_| {});
    let client = country_client(&ts.server);
    let err = runtime()
        .block_on(client.call(
            "getEmployeeCountry",
            country_message("David"),
            Some("WrongAction"),
            SoapHeaders::new(),
        ))
        .unwrap_err();
    let fault = err.fault().expect("expected a fault");
    assert_eq!(
        fault.arguments().child("faultcode").value().as_str(),
        Some("Server.UnknownSoapAction")
    );
    ts.server.stop();
}

#[test]
fn test_param_types_and_response_headers() {
    let ts = start_server(|_| {});
    let client = country_client(&ts.server);

    let mut message = SoapMessage::new();
    message.add_argument("foo", 4);
    message.add_argument("bar", 3.2f32);
    message.add_argument(
        "dateTime",
        soapwire_core::XsdDateTime::from_timestamp_millis(123456789).unwrap(),
    );

    let mut header1 = SoapMessage::new();
    header1.add_argument("header1", "headerValue");
    let mut headers = SoapHeaders::new();
    headers.push(header1);

    let response = runtime()
        .block_on(client.call("getStuff", message, Some("MySoapAction"), headers))
        .unwrap();
    let value = response.message.value().as_f64().unwrap();
    assert!((value - (4.0 + 3.2f32 as f64 + 123456.789)).abs() < 1e-6);
    assert_eq!(
        response
            .headers
            .header_with_ns("header2", "http://foo")
            .value()
            .as_str(),
        Some("responseHeader")
    );
    ts.server.stop();
}

#[test]
fn test_hex_binary_soap12() {
    let ts = start_server(|_| {});
    let mut client = country_client(&ts.server);
    client.set_soap_version(SoapVersion::Soap12);

    let mut message = SoapMessage::new();
    message.arguments_mut().push(SoapValue::with_type(
        "a",
        b"KD".to_vec(),
        namespaces::XML_SCHEMA_2001,
        "base64Binary",
    ));
    message.arguments_mut().push(SoapValue::with_type(
        "b",
        b"Soap".to_vec(),
        namespaces::XML_SCHEMA_2001,
        "hexBinary",
    ));

    let response = runtime()
        .block_on(client.call("hexBinaryTest", message, Some("ActionHex"), SoapHeaders::new()))
        .unwrap();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(response.message.value().to_display_string())
        .unwrap();
    assert_eq!(decoded, b"KDSoap");
    ts.server.stop();
}

#[test]
fn test_post_with_fragmented_socket_writes() {
    for piece_size in [1000, 100, 50, 20, 10] {
        let ts = start_server(|_| {});
        let port = ts.server.server_port();
        let body = raw_country_message(LONG_EMPLOYEE_NAME);
        let request = format!(
            "POST / HTTP/1.1\r\n\
             SoapAction: {WSDL_NS}getEmployeeCountry\r\n\
             Content-Type: text/xml;charset=utf-8\r\n\
             Content-Length: {}\r\n\
             Host: 127.0.0.1:12345\r\n\r\n{body}",
            body.len()
        );
        let response = raw_request(port, request.as_bytes(), piece_size);
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(
            text.contains(&format!("{LONG_EMPLOYEE_NAME} France")),
            "piece_size={piece_size}: {text}"
        );
        ts.server.stop();
    }
}

fn chunked_request_bytes(with_trailers: bool) -> Vec<u8> {
    let body = raw_country_message(LONG_EMPLOYEE_NAME);
    let mut request = format!(
        "POST / HTTP/1.1\r\n\
         SoapAction: {WSDL_NS}getEmployeeCountry\r\n\
         Content-Type: text/xml;charset=utf-8\r\n\
         Transfer-Encoding: chunked\r\n\
         Host: 127.0.0.1:12345\r\n\r\n"
    )
    .into_bytes();
    for chunk in body.as_bytes().chunks(10) {
        request.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        request.extend_from_slice(chunk);
        request.extend_from_slice(b"\r\n");
    }
    if with_trailers {
        request.extend_from_slice(b"0\r\nIgnore: me\r\n\r\n");
    } else {
        request.extend_from_slice(b"0\r\n\r\n");
    }
    request
}

#[test]
fn test_chunked_transfer_encoding() {
    for with_trailers in [false, true] {
        for use_raw_xml in [false, true] {
            let ts = start_server(move |o| o.use_raw_xml = use_raw_xml);
            let port = ts.server.server_port();
            let request = chunked_request_bytes(with_trailers);
            // Fragment the wire bytes as well.
            let response = raw_request(port, &request, 7);
            let text = String::from_utf8_lossy(&response);
            assert!(
                text.starts_with("HTTP/1.1 200 OK\r\n"),
                "trailers={with_trailers} raw={use_raw_xml}: {text}"
            );
            assert!(text.contains(&format!("{LONG_EMPLOYEE_NAME} France")));
            ts.server.stop();
        }
    }
}

#[test]
fn test_file_download_and_traversal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("file_download.txt"), "Hello world").unwrap();
    let file_dir = dir.path().to_path_buf();

    let ts = start_server(move |o| o.file_dir = Some(file_dir.clone()));
    let port = ts.server.server_port();

    let get = |path: &str| {
        let request = format!(
            "GET {path} HTTP/1.1\r\nContent-Length: 0\r\nHost: 127.0.0.1:12345\r\n\r\n"
        );
        let response = raw_request(port, request.as_bytes(), 4096);
        String::from_utf8_lossy(&response).into_owned()
    };

    let cases = [
        ("/path/to/file_download.txt", "200 OK"),
        ("/nonexistent.txt", "404 Not Found"),
        ("/subdir/../other/../path/to/file_download.txt", "200 OK"),
        ("/subdir/../other//../path//to/file_download.txt", "200 OK"),
        ("../../path/to/file_download.txt", "403 Forbidden"),
        ("/../path/to/file_download.txt", "403 Forbidden"),
        ("//../path/to/file_download.txt", "403 Forbidden"),
        ("///../path/to/file_download.txt", "403 Forbidden"),
        ("//path/to/file_download.txt", "200 OK"),
        ("///path/to/file_download.txt", "200 OK"),
        ("/?query=../../path/to/file_download.txt", "404 Not Found"),
        ("?query=/../path/to/file_download.txt", "403 Forbidden"),
        ("#/../../../path/to/file_download.txt", "403 Forbidden"),
        ("#/path/to/file_download.txt", "403 Forbidden"),
        // Query and fragment are stripped before the file handler runs.
        ("/path/to/file_download.txt?a=b&c=d", "200 OK"),
    ];
    for (path, expected) in cases {
        let response = get(path);
        let first_line = response.lines().next().unwrap_or_default().to_owned();
        assert_eq!(first_line, format!("HTTP/1.1 {expected}"), "path: {path}");
        if expected == "200 OK" {
            assert!(response.ends_with("Hello world"), "path: {path}");
        }
    }
    ts.server.stop();
}

#[cfg(unix)]
#[test]
fn test_unreadable_file_forbidden() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("file_download.txt");
    std::fs::write(&file_path, "Hello world").unwrap();
    std::fs::set_permissions(&file_path, std::fs::Permissions::from_mode(0o200)).unwrap();
    let file_dir = dir.path().to_path_buf();

    let ts = start_server(move |o| o.file_dir = Some(file_dir.clone()));
    let request = b"GET /path/to/file_download.txt HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
    let response = raw_request(ts.server.server_port(), request, 4096);
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 403 Forbidden"));

    std::fs::set_permissions(&file_path, std::fs::Permissions::from_mode(0o644)).unwrap();
    ts.server.stop();
}

#[test]
fn test_wsdl_file() {
    let dir = tempfile::tempdir().unwrap();
    let wsdl_path = dir.path().join("foo.wsdl");
    std::fs::write(&wsdl_path, "Hello world").unwrap();

    let ts = start_server(|_| {});
    ts.server.set_wsdl_file(&wsdl_path, "/path/to/file.wsdl");

    let request = b"GET /path/to/file.wsdl HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
    let response = raw_request(ts.server.server_port(), request, 4096);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("Hello world"));
    ts.server.stop();
}

#[test]
fn test_auth() {
    let ts = start_server(|o| o.require_auth = true);

    let mut client = country_client(&ts.server);
    client.set_authentication("kdab", "pass42");
    assert_eq!(call_country(&client, "David").unwrap(), "David France");

    let mut client = country_client(&ts.server);
    client.set_authentication("kdab", "invalid");
    match call_country(&client, "David").unwrap_err() {
        ClientError::Http { status } => assert_eq!(status, 401),
        other => panic!("expected 401, got {other:?}"),
    }

    // No credentials at all.
    let client = country_client(&ts.server);
    match call_country(&client, "David").unwrap_err() {
        ClientError::Http { status } => assert_eq!(status, 401),
        other => panic!("expected 401, got {other:?}"),
    }
    ts.server.stop();
}

#[test]
fn test_file_download_auth() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("file_download.txt"), "Hello world").unwrap();
    let file_dir = dir.path().to_path_buf();

    let ts = start_server(move |o| {
        o.require_auth = true;
        o.file_dir = Some(file_dir.clone());
    });
    let port = ts.server.server_port();

    let authorized = base64::engine::general_purpose::STANDARD.encode("kdab:pass42");
    let request = format!(
        "GET /path/to/file_download.txt HTTP/1.1\r\nAuthorization: Basic {authorized}\r\nContent-Length: 0\r\n\r\n"
    );
    let response = raw_request(port, request.as_bytes(), 4096);
    assert!(String::from_utf8_lossy(&response).ends_with("Hello world"));

    let wrong = base64::engine::general_purpose::STANDARD.encode("kdab:invalid");
    let request = format!(
        "GET /path/to/file_download.txt HTTP/1.1\r\nAuthorization: Basic {wrong}\r\nContent-Length: 0\r\n\r\n"
    );
    let response = raw_request(port, request.as_bytes(), 4096);
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 401 Unauthorized"));
    ts.server.stop();
}

#[test]
fn test_custom_verb() {
    let ts = start_server(|_| {});
    let port = ts.server.server_port();

    let response = raw_request(port, b"PULL / HTTP/1.1\r\nContent-Length: 0\r\n\r\n", 4096);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("Hello world"));

    let response = raw_request(port, b"UNKNOWN / HTTP/1.1\r\nContent-Length: 0\r\n\r\n", 4096);
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 405 Method Not Allowed"));
    ts.server.stop();
}

#[test]
fn test_custom_verb_with_auth() {
    let ts = start_server(|o| o.require_auth = true);
    let port = ts.server.server_port();

    let response = raw_request(port, b"PULL / HTTP/1.1\r\nContent-Length: 0\r\n\r\n", 4096);
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 401 Unauthorized"));

    let authorized = base64::engine::general_purpose::STANDARD.encode("kdab:pass42");
    let request =
        format!("PULL / HTTP/1.1\r\nAuthorization: Basic {authorized}\r\nContent-Length: 0\r\n\r\n");
    let response = raw_request(port, request.as_bytes(), 4096);
    assert!(String::from_utf8_lossy(&response).ends_with("Hello world"));
    ts.server.stop();
}

#[test]
fn test_get_on_soap_path_fails() {
    let ts = start_server(|_| {});
    let response = raw_request(
        ts.server.server_port(),
        b"GET / HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
        4096,
    );
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 404 Not Found"));
    ts.server.stop();
}

#[test]
fn test_head_fails() {
    let ts = start_server(|_| {});
    let response = raw_request(
        ts.server.server_port(),
        b"HEAD / HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
        4096,
    );
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 405 Method Not Allowed"));
    ts.server.stop();
}

#[test]
fn test_additional_response_headers() {
    let ts = start_server(|_| {});
    let body = raw_country_message("David");
    let request = format!(
        "POST / HTTP/1.1\r\nSoapAction: {WSDL_NS}getEmployeeCountry\r\n\
         Content-Type: text/xml;charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    let response = raw_request(ts.server.server_port(), request.as_bytes(), 4096);
    let text = String::from_utf8_lossy(&response);
    assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
    assert!(text.contains("Access-Control-Allow-Headers: Content-Type\r\n"));
    assert!(text.contains("Content-Type: text/xml\r\n"));
    ts.server.stop();
}

#[test]
fn test_soap12_content_type_action() {
    let ts = start_server(|_| {});
    let body = raw_country_message("David Ä Faure").replace(
        "http://schemas.xmlsoap.org/soap/envelope/",
        "http://www.w3.org/2003/05/soap-envelope",
    );
    let request = format!(
        "POST / HTTP/1.1\r\n\
         Content-Type: application/soap+xml; charset=utf-8; action=\"{WSDL_NS}getEmployeeCountry\"\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    );
    let response = raw_request(ts.server.server_port(), request.as_bytes(), 4096);
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.contains("Content-Type: application/soap+xml; charset=utf-8\r\n"));
    assert!(text.contains("David Ä Faure France"));
    ts.server.stop();
}

#[test]
fn test_set_path() {
    let config = ServerConfig {
        path: "/foo".to_string(),
        ..Default::default()
    };
    let ts = start_server_with(config, None, |_| {});
    assert!(ts.server.endpoint().unwrap().ends_with("/foo"));

    let client =
        SoapClient::new_with_endpoint(&ts.server.endpoint().unwrap(), WSDL_NS).unwrap();
    assert_eq!(call_country(&client, "David").unwrap(), "David France");

    let bad_endpoint = ts.server.endpoint().unwrap().replace("/foo", "/bar");
    let client = SoapClient::new_with_endpoint(&bad_endpoint, WSDL_NS).unwrap();
    let err = call_country(&client, "David").unwrap_err();
    let fault = err.fault().expect("expected a fault");
    assert_eq!(
        fault.arguments().child("faultcode").value().as_str(),
        Some("Client.Data")
    );
    assert_eq!(
        fault.arguments().child("faultstring").value().as_str(),
        Some("Method getEmployeeCountry not found in path /bar")
    );
    ts.server.stop();
}

#[test]
fn test_logging() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("output.log");

    let ts = start_server(|_| {});
    ts.server.set_log_file_name(&log_path).unwrap();
    assert_eq!(ts.server.log_file_name(), Some(log_path.clone()));
    ts.server.set_log_level(LogLevel::Every);

    let client = country_client(&ts.server);
    call_country(&client, "David").unwrap();
    let _ = call_country(&client, "");
    ts.server.flush_log_file();

    let mut expected: Vec<String> = vec![
        "CALL getEmployeeCountry".into(),
        "FAULT getEmployeeCountry -- Fault code Client.Data: Empty employee name \
         (CountryServerObject). Error detail: Employee name must not be empty"
            .into(),
    ];
    compare_lines(&expected, &log_path);

    ts.server.set_log_level(LogLevel::None);
    call_country(&client, "David").unwrap();
    let _ = call_country(&client, "");
    ts.server.flush_log_file();
    compare_lines(&expected, &log_path);

    ts.server.set_log_level(LogLevel::Faults);
    call_country(&client, "David").unwrap();
    let _ = call_country(&client, "");
    ts.server.flush_log_file();
    expected.push(
        "FAULT getEmployeeCountry -- Fault code Client.Data: Empty employee name \
         (CountryServerObject). Error detail: Employee name must not be empty"
            .into(),
    );
    compare_lines(&expected, &log_path);

    ts.server.stop();
}

fn compare_lines(expected: &[String], path: &std::path::Path) {
    let text = std::fs::read_to_string(path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), expected.len(), "log: {text}");
    for (line, suffix) in lines.iter().zip(expected) {
        assert!(
            line.ends_with(suffix.as_str()),
            "line {line:?} does not end with {suffix:?}"
        );
    }
}

#[test]
fn test_too_many_connections() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("connections.log");

    let ts = start_server(|_| {});
    ts.server.set_log_file_name(&log_path).unwrap();
    ts.server.set_log_level(LogLevel::Faults);
    ts.server.set_max_connections(2);
    let port = ts.server.server_port();

    let body = raw_country_message("Slow");
    let request = format!(
        "POST / HTTP/1.1\r\nSoapAction: {WSDL_NS}getEmployeeCountry\r\n\
         Content-Type: text/xml;charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let request = request.clone();
            std::thread::spawn(move || {
                let response = raw_request(port, request.as_bytes(), 4096);
                String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200 OK")
            })
        })
        .collect();
    let results: Vec<bool> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    let succeeded = results.iter().filter(|ok| **ok).count();
    assert_eq!(succeeded, 2, "results: {results:?}");

    ts.server.flush_log_file();
    let log = std::fs::read_to_string(&log_path).unwrap();
    let rejected = log
        .lines()
        .filter(|l| l.ends_with("ERROR Too many connections (2), incoming connection rejected"))
        .count();
    assert_eq!(rejected, 2, "log: {log}");
    ts.server.stop();
}

#[test]
fn test_thread_pool_basic() {
    let pool = Arc::new(SoapThreadPool::new(6));
    let ts = start_server_with(ServerConfig::default(), Some(pool), |_| {});
    let client = country_client(&ts.server);
    assert_eq!(call_country(&client, "David").unwrap(), "David France");

    let names = ts._observed.thread_names.lock().unwrap();
    assert!(!names.is_empty());
    assert!(
        names.iter().all(|n| n.starts_with("soap-worker-")),
        "objects created on {names:?}"
    );
    ts.server.stop();
}

#[test]
fn test_multiple_threads_spread_and_reuse() {
    let pool = Arc::new(SoapThreadPool::new(3));
    let ts = start_server_with(ServerConfig::default(), Some(pool), |_| {});
    let port = ts.server.server_port();

    let body = raw_country_message("Slow");
    let request = Arc::new(format!(
        "POST / HTTP/1.1\r\nSoapAction: {WSDL_NS}getEmployeeCountry\r\n\
         Content-Type: text/xml;charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    ));

    let burst = |n: usize| {
        let workers: Vec<_> = (0..n)
            .map(|_| {
                let request = request.clone();
                std::thread::spawn(move || {
                    let response = raw_request(port, request.as_bytes(), 4096);
                    assert!(
                        String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200 OK"),
                        "{}",
                        String::from_utf8_lossy(&response)
                    );
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    };

    burst(5);
    let first_round: std::collections::HashSet<_> = ts
        ._observed
        .threads
        .lock()
        .unwrap()
        .iter()
        .copied()
        .collect();
    assert_eq!(first_round.len(), 3, "expected all 3 workers used");

    // A second burst reuses the same workers instead of growing.
    burst(5);
    let all_threads: std::collections::HashSet<_> = ts
        ._observed
        .threads
        .lock()
        .unwrap()
        .iter()
        .copied()
        .collect();
    assert_eq!(all_threads, first_round);
    ts.server.stop();
}

#[test]
fn test_suspend_and_resume() {
    let pool = Arc::new(SoapThreadPool::new(6));
    let ts = start_server_with(ServerConfig::default(), Some(pool), |_| {});
    let port = ts.server.server_port();

    let client = country_client(&ts.server);
    assert_eq!(call_country(&client, "David").unwrap(), "David France");

    ts.server.suspend().unwrap();
    assert_eq!(ts.server.endpoint(), None);

    // A fresh connection is refused outright.
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
    // A new call from the existing client fails too.
    assert!(call_country(&client, "David").is_err());

    ts.server.resume().unwrap();
    assert_eq!(ts.server.server_port(), port);
    assert_eq!(call_country(&client, "David").unwrap(), "David France");

    // resume() without suspend() warns and is a no-op.
    ts.server.resume().unwrap();
    assert_eq!(call_country(&client, "David").unwrap(), "David France");
    ts.server.stop();
}

#[test]
fn test_suspend_under_load() {
    let pool = Arc::new(SoapThreadPool::new(5));
    let ts = start_server_with(ServerConfig::default(), Some(pool), |_| {});
    let endpoint = ts.server.endpoint().unwrap();
    let stop_flag = Arc::new(AtomicBool::new(false));

    let clients: Vec<_> = (0..8)
        .map(|_| {
            let endpoint = endpoint.clone();
            let stop_flag = stop_flag.clone();
            std::thread::spawn(move || {
                let rt = runtime();
                let client = SoapClient::new_with_endpoint(&endpoint, WSDL_NS).unwrap();
                let mut successes = 0usize;
                while !stop_flag.load(Ordering::Relaxed) {
                    let result = rt.block_on(client.call(
                        "getEmployeeCountry",
                        country_message("David"),
                        None,
                        SoapHeaders::new(),
                    ));
                    // Errors are expected while suspended.
                    if result.is_ok() {
                        successes += 1;
                    }
                }
                successes
            })
        })
        .collect();

    for _ in 0..3 {
        std::thread::sleep(Duration::from_millis(100));
        ts.server.suspend().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        ts.server.resume().unwrap();
    }
    stop_flag.store(true, Ordering::Relaxed);

    let total: usize = clients.into_iter().map(|c| c.join().unwrap()).sum();
    assert!(total > 0, "no call ever succeeded under suspend/resume load");

    // The server still works after the churn.
    let client = country_client(&ts.server);
    assert_eq!(call_country(&client, "David").unwrap(), "David France");
    ts.server.stop();
}

#[test]
fn test_request_timeout() {
    let config = ServerConfig {
        request_timeout: Some(Duration::from_millis(30)),
        ..Default::default()
    };
    let ts = start_server_with(config, None, |_| {});
    let client = country_client(&ts.server);
    let err = call_country(&client, "Slow").unwrap_err();
    let fault = err.fault().expect("expected a fault");
    assert_eq!(
        fault.arguments().child("faultcode").value().as_str(),
        Some("Server.Timeout")
    );
    assert_eq!(
        fault.arguments().child("faultstring").value().as_str(),
        Some("Operation timed out")
    );
    ts.server.stop();
}

#[test]
fn test_connection_count_returns_to_zero() {
    let ts = start_server(|_| {});
    let port = ts.server.server_port();
    let response = raw_request(port, b"GET /none HTTP/1.1\r\nContent-Length: 0\r\n\r\n", 4096);
    assert!(!response.is_empty());

    // The socket is closed on our side; wait for the server to notice.
    let mut live = ts.server.connection_count();
    for _ in 0..100 {
        if live == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
        live = ts.server.connection_count();
    }
    assert_eq!(live, 0);
    assert_eq!(ts.server.total_connection_count(), 1);
    ts.server.stop();
}
