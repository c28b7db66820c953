//! Calls the `country_server` example from the server crate.

use soapwire_client::SoapClient;
use soapwire_core::{SoapHeaders, SoapMessage};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let client = SoapClient::new_with_endpoint(
        "http://127.0.0.1:8090/",
        "http://www.kdab.com/xml/MyWsdl/",
    )?;

    let mut message = SoapMessage::new();
    message.add_argument("employeeName", "David Faure");

    let response = client
        .call("getEmployeeCountry", message, None, SoapHeaders::new())
        .await?;
    println!(
        "employeeCountry = {}",
        response
            .message
            .arguments()
            .child("employeeCountry")
            .value()
            .to_display_string()
    );
    Ok(())
}
