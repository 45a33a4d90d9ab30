//! Control endpoints served on the proxy's own API host.
//!
//! Requests whose hostname equals the configured API host never leave the
//! proxy. The handler plugin gets first refusal; after that the only
//! built-in endpoint is `/cert.crt`, which serves the PEM-encoded root CA
//! for client installation. Everything else is a 404. API responses always
//! close the connection.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::{header, Response, StatusCode};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http1;
use crate::session::Session;

const CA_CERT_PATH: &str = "/cert.crt";

const NOT_FOUND_TEMPLATE: &str = r#"<!DOCTYPE HTML PUBLIC "-
<html>
  <head><title>Clash ManInTheMiddle Proxy Services - 404 Not Found</title></head>
  <body><h1>Not Found</h1><p>The requested URL %s was not found on this server.</p></body>
</html>
"#;

/// Serves a request addressed to the API host and returns once the response
/// is written; the caller closes the connection.
pub(crate) async fn handle_api_request(
    session: &mut Session,
    config: &ProxyConfig,
) -> Result<(), ProxyError> {
    if let Some(handler) = &config.handler {
        match handler.handle_api_request(session).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) => return Err(ProxyError::Handler(format!("{err:#}"))),
        }
    }

    let path = session.request.uri().path().to_owned();
    let response = match &config.cert_config {
        Some(factory) if path.to_lowercase() == CA_CERT_PATH => {
            let pem = pem_encode_certificate(&factory.ca_certificate_der());
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/x-x509-ca-cert")
                .header(header::CONNECTION, "close")
                .body(Bytes::from(pem))
                .unwrap()
        }
        _ => {
            let body = NOT_FOUND_TEMPLATE.replace("%s", &path);
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header(header::CONTENT_TYPE, "text/html;charset=utf-8")
                .header(header::CONNECTION, "close")
                .body(Bytes::from(body))
                .unwrap()
        }
    };

    // Written directly, bypassing the keep-alive writer: `Connection: close`
    // must survive and no keep-alive headers belong here.
    session.response = Some(response);
    let (conn, response) = session.conn_and_response();
    http1::write_response(conn, response.expect("api response set"))
        .await
        .map_err(ProxyError::ClientWrite)
}

/// PEM-encodes a DER certificate as a single `CERTIFICATE` block.
fn pem_encode_certificate(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::with_capacity(encoded.len() + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).expect("base64 output is ascii"));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_round_trips_der() {
        let der: Vec<u8> = (0u8..=255).cycle().take(700).collect();
        let pem = pem_encode_certificate(&der);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));

        let base64: String = pem
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .collect();
        assert!(pem.lines().all(|line| line.len() <= 64));
        assert_eq!(STANDARD.decode(base64).unwrap(), der);
    }

    #[test]
    fn not_found_template_interpolates_path() {
        let body = NOT_FOUND_TEMPLATE.replace("%s", "/missing");
        assert!(body.contains("The requested URL /missing was not found"));
    }
}
