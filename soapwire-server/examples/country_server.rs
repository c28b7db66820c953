//! A minimal country-lookup service: one SOAP method, answered on port 8090.
//!
//! Try it with the `country_client` example from the client crate, or:
//!
//! ```sh
//! curl -s -X POST http://127.0.0.1:8090/ \
//!   -H 'Content-Type: text/xml' \
//!   -H 'SoapAction: http://www.kdab.com/xml/MyWsdl/getEmployeeCountry' \
//!   --data @request.xml
//! ```

use async_trait::async_trait;
use soapwire_core::SoapMessage;
use soapwire_server::{
    HandlerError, LogLevel, RequestContext, Server, ServerConfig, ServerObject,
};

const WSDL_NS: &str = "http://www.kdab.com/xml/MyWsdl/";

struct CountryObject;

#[async_trait]
impl ServerObject for CountryObject {
    async fn process_request(
        &mut self,
        request: &SoapMessage,
        response: &mut SoapMessage,
        ctx: &mut RequestContext,
    ) -> Result<(), HandlerError> {
        ctx.set_response_namespace(WSDL_NS);
        if request.name() == "getEmployeeCountry" {
            let name = request
                .arguments()
                .child("employeeName")
                .value()
                .to_display_string();
            if name.is_empty() {
                response.set_fault("Client.Data", "Empty employee name", "", "");
                return Ok(());
            }
            response.add_argument("employeeCountry", format!("{name} France"));
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("soapwire=debug,info")),
        )
        .init();

    let config = ServerConfig {
        port: 8090,
        ..Default::default()
    };
    let server = Server::new(config, || Box::new(CountryObject) as Box<dyn ServerObject>);
    server.set_log_level(LogLevel::Every);
    server.listen()?;
    println!(
        "country server listening on {}",
        server.endpoint().unwrap_or_default()
    );

    loop {
        std::thread::park();
    }
}
