//! Certificate pinning and hostname verification at connect time.

mod helpers;

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use kestrel::dns::StaticDns;
use kestrel::{CertificatePinner, Error, Protocol, Request};

use helpers::{
    test_certificate, test_client_builder, LoopbackSocketFactory, MockCodecFactory,
    MockTlsConnector, ScriptedResponse,
};

fn sha256_pin(spki: &[u8]) -> String {
    format!("sha256/{}", BASE64.encode(Sha256::digest(spki)))
}

#[tokio::test]
async fn matching_pin_admits_the_connection() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(ScriptedResponse::new(200));
    let certificate = test_certificate(b"real-key", &["h.example"]);
    let pinner = CertificatePinner::builder()
        .add("h.example", &sha256_pin(b"real-key"))
        .unwrap()
        .build();
    let client = test_client_builder(&codecs)
        .protocols(vec![Protocol::Http11])
        .tls_connector(MockTlsConnector::new(certificate, None))
        .certificate_pinner(pinner)
        .build()
        .unwrap();

    let response = client
        .new_call(Request::get("https://h.example/").unwrap())
        .execute()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn pin_mismatch_fails_without_retry_or_pooling() {
    let codecs = MockCodecFactory::new();
    let certificate = test_certificate(b"attacker-key", &["h.example"]);
    let pinner = CertificatePinner::builder()
        .add("h.example", &sha256_pin(b"expected-key"))
        .unwrap()
        .build();
    let sockets = LoopbackSocketFactory::new();
    let client = test_client_builder(&codecs)
        .dns(Arc::new(StaticDns::new(vec![
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        ])))
        .socket_factory(Arc::clone(&sockets) as Arc<dyn kestrel::transport::SocketFactory>)
        .protocols(vec![Protocol::Http11])
        .tls_connector(MockTlsConnector::new(certificate, None))
        .certificate_pinner(pinner)
        .build()
        .unwrap();

    let error = client
        .new_call(Request::get("https://h.example/").unwrap())
        .execute()
        .await
        .unwrap_err();

    // The pinning failure is identity rejection: no second route, no
    // pooled connection, no response.
    match error.root() {
        Error::RouteFailure { last, .. } => {
            assert!(matches!(last.as_ref(), Error::TlsPinning(_)), "{last}");
        }
        other => panic!("expected a route failure, got {other}"),
    }
    assert_eq!(sockets.attempt_count(), 1);
    assert_eq!(client.connection_pool().connection_count(), 0);
    assert!(codecs.seen_requests().is_empty());
}

#[tokio::test]
async fn unverified_hostname_fails_the_connect() {
    let codecs = MockCodecFactory::new();
    let certificate = test_certificate(b"any-key", &["other.example"]);
    let client = test_client_builder(&codecs)
        .protocols(vec![Protocol::Http11])
        .tls_connector(MockTlsConnector::new(certificate, None))
        .build()
        .unwrap();

    let error = client
        .new_call(Request::get("https://h.example/").unwrap())
        .execute()
        .await
        .unwrap_err();
    match error.root() {
        Error::RouteFailure { last, .. } => {
            assert!(matches!(last.as_ref(), Error::PeerUnverified { .. }));
        }
        other => panic!("expected a route failure, got {other}"),
    }
}

#[tokio::test]
async fn https_without_tls_connector_is_a_configuration_error() {
    let codecs = MockCodecFactory::new();
    let client = test_client_builder(&codecs).build().unwrap();
    let error = client
        .new_call(Request::get("https://h.example/").unwrap())
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(error.root(), Error::Tls(_)));
}
