//! Connection reuse, idle eviction, route fallback, and HTTP/2
//! coalescing with 421 recovery.

mod helpers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use kestrel::connect::ConnectionPool;
use kestrel::dns::StaticDns;
use kestrel::{HttpClient, Protocol, Request};

use helpers::{
    test_certificate, test_client_builder, FaultySocketFactory, LoopbackSocketFactory,
    MockCodecFactory, MockTlsConnector, ScriptedResponse,
};

#[tokio::test]
async fn sequential_calls_reuse_the_pooled_connection() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(ScriptedResponse::new(200).body(&b"one"[..]));
    codecs.enqueue(ScriptedResponse::new(200).body(&b"two"[..]));
    let sockets = LoopbackSocketFactory::new();
    let client = test_client_builder(&codecs)
        .socket_factory(Arc::clone(&sockets) as Arc<dyn kestrel::transport::SocketFactory>)
        .build()
        .unwrap();

    for _ in 0..2 {
        client
            .new_call(Request::get("http://h.example/a").unwrap())
            .execute()
            .await
            .unwrap()
            .into_body()
            .bytes()
            .await
            .unwrap();
    }

    // Two exchanges, one socket.
    assert_eq!(codecs.codecs_created(), 2);
    assert_eq!(sockets.attempt_count(), 1);
    assert_eq!(client.connection_pool().connection_count(), 1);
}

#[tokio::test]
async fn idle_connections_are_evicted_after_keep_alive() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(ScriptedResponse::new(200));
    // A long keep-alive parks the background task; cleanup passes are
    // driven by hand with a clock far in the future.
    let pool = ConnectionPool::with_tunables(5, Duration::from_secs(60));
    let client = test_client_builder(&codecs)
        .connection_pool(pool.clone())
        .build()
        .unwrap();

    client
        .new_call(Request::get("http://h.example/a").unwrap())
        .execute()
        .await
        .unwrap()
        .into_body()
        .bytes()
        .await
        .unwrap();
    assert_eq!(pool.idle_connection_count(), 1);

    // Not yet expired: the pass reports when to look again.
    let wait = pool.cleanup(Instant::now()).expect("next wake time");
    assert!(wait <= Duration::from_secs(60));
    assert_eq!(pool.connection_count(), 1);

    let wait = pool.cleanup(Instant::now() + Duration::from_secs(120));
    assert_eq!(wait, Some(Duration::ZERO));
    assert_eq!(pool.connection_count(), 0);
    assert_eq!(pool.cleanup(Instant::now()), None);
}

#[tokio::test]
async fn leaked_response_body_is_noticed_by_cleanup() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(ScriptedResponse::new(200).body(&b"never read"[..]));
    let pool = ConnectionPool::with_tunables(5, Duration::from_secs(60));
    let client = test_client_builder(&codecs)
        .connection_pool(pool.clone())
        .build()
        .unwrap();

    let response = client
        .new_call(Request::get("http://h.example/leaky").unwrap())
        .execute()
        .await
        .unwrap();
    // The call handle is gone, the body was never closed: the connection
    // still carries a dead call reference.
    std::mem::forget(response);
    assert_eq!(pool.connection_count(), 1);

    // The sweep attributes the leak and ages the connection out.
    let wait = pool.cleanup(Instant::now());
    assert_eq!(wait, Some(Duration::ZERO));
    assert_eq!(pool.connection_count(), 0);
}

#[tokio::test]
async fn connect_failure_falls_back_to_the_next_route() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(ScriptedResponse::new(200).body(&b"ok"[..]));
    let sockets = FaultySocketFactory::refusing(&["10.0.0.1:80"]);
    let client = test_client_builder(&codecs)
        .dns(Arc::new(StaticDns::new(vec![
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        ])))
        .socket_factory(Arc::clone(&sockets) as Arc<dyn kestrel::transport::SocketFactory>)
        .build()
        .unwrap();

    let response = client
        .new_call(Request::get("http://h.example/a").unwrap())
        .execute()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let attempts = sockets.attempts.lock().unwrap().clone();
    assert_eq!(
        attempts,
        vec!["10.0.0.1:80".parse().unwrap(), "10.0.0.2:80".parse().unwrap()]
    );
}

#[tokio::test]
async fn retries_exhaust_when_every_route_fails() {
    let codecs = MockCodecFactory::new();
    let sockets = FaultySocketFactory::refusing(&["10.0.0.1:80", "10.0.0.2:80"]);
    let client = test_client_builder(&codecs)
        .dns(Arc::new(StaticDns::new(vec![
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        ])))
        .socket_factory(Arc::clone(&sockets) as Arc<dyn kestrel::transport::SocketFactory>)
        .build()
        .unwrap();

    let error = client
        .new_call(Request::get("http://h.example/a").unwrap())
        .execute()
        .await
        .unwrap_err();
    assert!(error.is_route_failure());
    assert_eq!(sockets.attempt_count(), 2);
}

fn coalescing_client(codecs: &Arc<MockCodecFactory>) -> HttpClient {
    let certificate = test_certificate(b"shared-key", &["a.example", "b.example"]);
    test_client_builder(codecs)
        .protocols(vec![Protocol::H2, Protocol::Http11])
        .tls_connector(MockTlsConnector::new(certificate, Some(Protocol::H2)))
        .build()
        .unwrap()
}

#[tokio::test]
async fn coalesces_hosts_sharing_an_address_and_certificate() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(ScriptedResponse::new(200).h2());
    codecs.enqueue(ScriptedResponse::new(200).h2());
    let client = coalescing_client(&codecs);

    for host in ["a.example", "b.example"] {
        client
            .new_call(Request::get(format!("https://{host}/")).unwrap())
            .execute()
            .await
            .unwrap()
            .into_body()
            .bytes()
            .await
            .unwrap();
    }

    // One TLS connection carried both hosts.
    assert_eq!(client.connection_pool().connection_count(), 1);
    assert_eq!(codecs.codecs_created(), 2);
}

#[tokio::test]
async fn misdirected_421_stops_coalescing_and_retries() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(ScriptedResponse::new(200).h2());
    codecs.enqueue(ScriptedResponse::new(421).h2());
    codecs.enqueue(ScriptedResponse::new(200).h2().body(&b"direct"[..]));
    let client = coalescing_client(&codecs);

    client
        .new_call(Request::get("https://a.example/").unwrap())
        .execute()
        .await
        .unwrap()
        .into_body()
        .bytes()
        .await
        .unwrap();

    let response = client
        .new_call(Request::get("https://b.example/").unwrap())
        .execute()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let prior = response.prior_response().expect("prior 421");
    assert_eq!(prior.status(), 421);
    assert_eq!(response.into_body().text().await.unwrap(), "direct");

    // The retry went out on its own connection.
    assert_eq!(client.connection_pool().connection_count(), 2);
    assert_eq!(codecs.codecs_created(), 3);
}

#[tokio::test]
async fn response_protocol_reflects_alpn() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(ScriptedResponse::new(200).h2());
    let client = coalescing_client(&codecs);
    let response = client
        .new_call(Request::get("https://a.example/").unwrap())
        .execute()
        .await
        .unwrap();
    assert_eq!(response.protocol(), Protocol::H2);
    assert!(response.handshake().is_some());
}
