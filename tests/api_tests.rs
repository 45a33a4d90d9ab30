//! Control endpoint tests: CA download and the API 404 fallback.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::AsyncWriteExt;

use common::*;
use middleman::{CertificateAuthority, CertificateFactory, ProxyConfig, ProxyHandler, Session};

#[tokio::test]
async fn ca_download_serves_pem_of_root_certificate() {
    let authority = Arc::new(CertificateAuthority::generate("middleman test ca").unwrap());
    let ca_der = authority.ca_certificate_der();
    let config = ProxyConfig::new(API_HOST)
        .with_cert_config(Arc::clone(&authority) as Arc<dyn CertificateFactory>);
    let mut p = spawn_session(config, None);

    let request = format!("GET http://{API_HOST}/cert.crt HTTP/1.1\r\nHost: {API_HOST}\r\n\r\n");
    p.client.write_all(request.as_bytes()).await.unwrap();

    let (head, body) = read_response(&mut p.client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");
    assert!(has_header(&head, "content-type", "application/x-x509-ca-cert"));
    assert!(has_header(&head, "connection", "close"));
    // No keep-alive advertisement on API responses.
    assert!(!has_header(&head, "connection", "keep-alive"));

    // The body PEM-decodes to exactly the CA's DER bytes.
    let pem = String::from_utf8(body).unwrap();
    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    let base64: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    assert_eq!(STANDARD.decode(base64).unwrap(), ca_der);
    assert_eq!(pem.matches("BEGIN CERTIFICATE").count(), 1);

    // The connection closes after an API response.
    expect_eof(&mut p.client).await;
}

#[tokio::test]
async fn ca_download_path_is_case_insensitive() {
    let authority = Arc::new(CertificateAuthority::generate("middleman test ca").unwrap());
    let config = ProxyConfig::new(API_HOST)
        .with_cert_config(authority as Arc<dyn CertificateFactory>);
    let mut p = spawn_session(config, None);

    let request = format!("GET http://{API_HOST}/CERT.CRT HTTP/1.1\r\nHost: {API_HOST}\r\n\r\n");
    p.client.write_all(request.as_bytes()).await.unwrap();

    let (head, _) = read_response(&mut p.client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");
}

#[tokio::test]
async fn unknown_api_path_returns_404_with_path_in_body() {
    let mut p = spawn_session(ProxyConfig::new(API_HOST), None);

    let request = format!("GET http://{API_HOST}/nope HTTP/1.1\r\nHost: {API_HOST}\r\n\r\n");
    p.client.write_all(request.as_bytes()).await.unwrap();

    let (head, body) = read_response(&mut p.client).await;
    assert!(head.starts_with("HTTP/1.1 404"), "head: {head}");
    assert!(has_header(&head, "content-type", "text/html;charset=utf-8"));
    assert!(has_header(&head, "connection", "close"));

    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("The requested URL /nope was not found on this server."));
    assert!(body.contains("Clash ManInTheMiddle Proxy Services - 404 Not Found"));

    expect_eof(&mut p.client).await;
}

#[tokio::test]
async fn cert_endpoint_without_cert_config_is_404() {
    let mut p = spawn_session(ProxyConfig::new(API_HOST), None);

    let request = format!("GET http://{API_HOST}/cert.crt HTTP/1.1\r\nHost: {API_HOST}\r\n\r\n");
    p.client.write_all(request.as_bytes()).await.unwrap();

    let (head, _) = read_response(&mut p.client).await;
    assert!(head.starts_with("HTTP/1.1 404"), "head: {head}");
}

#[tokio::test]
async fn api_host_matches_with_explicit_port() {
    // Port is stripped before comparing against the API host.
    let mut p = spawn_session(ProxyConfig::new(API_HOST), None);

    let request =
        format!("GET http://{API_HOST}:8080/x HTTP/1.1\r\nHost: {API_HOST}:8080\r\n\r\n");
    p.client.write_all(request.as_bytes()).await.unwrap();

    let (head, _) = read_response(&mut p.client).await;
    assert!(head.starts_with("HTTP/1.1 404"), "head: {head}");
    assert!(p.upstream.requests.lock().await.is_empty());
}

struct ApiTakeoverHandler;

#[async_trait]
impl ProxyHandler for ApiTakeoverHandler {
    async fn handle_api_request(&self, session: &mut Session) -> anyhow::Result<bool> {
        // A takeover writes its own response through the session stream.
        let body = b"taken over";
        let head = format!(
            "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        session.stream_mut().write_all(head.as_bytes()).await?;
        session.stream_mut().write_all(body).await?;
        Ok(true)
    }
}

#[tokio::test]
async fn handler_can_take_over_api_requests() {
    let config = ProxyConfig::new(API_HOST)
        .with_handler(Arc::new(ApiTakeoverHandler) as Arc<dyn ProxyHandler>);
    let mut p = spawn_session(config, None);

    let request = format!("GET http://{API_HOST}/custom HTTP/1.1\r\nHost: {API_HOST}\r\n\r\n");
    p.client.write_all(request.as_bytes()).await.unwrap();

    let (head, body) = read_response(&mut p.client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");
    assert_eq!(body, b"taken over");
    expect_eof(&mut p.client).await;
}
