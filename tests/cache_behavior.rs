//! The cache interceptor end to end: hits, misses, revalidation, and
//! the only-if-cached short circuit.

mod helpers;

use kestrel::cache::{Cache, CacheControl};
use kestrel::headers::format_http_date;
use kestrel::Request;

use helpers::{test_client_builder, MockCodecFactory, ScriptedResponse};

fn http_date_now() -> String {
    format_http_date(chrono::Utc::now())
}

#[tokio::test]
async fn fresh_entry_is_served_without_network() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(
        ScriptedResponse::new(200)
            .header("cache-control", "max-age=60")
            .header("date", &http_date_now())
            .body(&b"cached payload"[..]),
    );
    let client = test_client_builder(&codecs)
        .cache(Cache::in_memory())
        .build()
        .unwrap();
    let cache = client.cache().unwrap().clone();

    // First fetch populates the cache when the body is drained.
    let first = client
        .new_call(Request::get("http://h.example/doc").unwrap())
        .execute()
        .await
        .unwrap();
    assert_eq!(first.into_body().text().await.unwrap(), "cached payload");

    // Second fetch never touches a codec.
    let second = client
        .new_call(Request::get("http://h.example/doc").unwrap())
        .execute()
        .await
        .unwrap();
    assert!(second.cache_response().is_some());
    assert!(second.network_response().is_none());
    assert_eq!(second.into_body().text().await.unwrap(), "cached payload");

    assert_eq!(codecs.codecs_created(), 1);
    assert_eq!(cache.request_count(), 2);
    assert_eq!(cache.network_count(), 1);
    assert_eq!(cache.hit_count(), 1);
}

#[tokio::test]
async fn stale_entry_revalidates_with_etag_and_merges_headers() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(
        ScriptedResponse::new(200)
            .header("cache-control", "max-age=0")
            .header("etag", "\"v1\"")
            .header("date", &http_date_now())
            .header("x-version", "one")
            .body(&b"entity v1"[..]),
    );
    codecs.enqueue(
        ScriptedResponse::new(304)
            .header("cache-control", "max-age=60")
            .header("x-version", "two"),
    );
    let client = test_client_builder(&codecs)
        .cache(Cache::in_memory())
        .build()
        .unwrap();
    let cache = client.cache().unwrap().clone();

    client
        .new_call(Request::get("http://h.example/doc").unwrap())
        .execute()
        .await
        .unwrap()
        .into_body()
        .bytes()
        .await
        .unwrap();

    let revalidated = client
        .new_call(Request::get("http://h.example/doc").unwrap())
        .execute()
        .await
        .unwrap();

    // The conditional request carried the stored validator.
    let sent = codecs.seen_requests();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].header("if-none-match"), Some("\"v1\""));

    // Merged result: stored entity, refreshed metadata.
    assert_eq!(revalidated.status(), 200);
    assert_eq!(revalidated.header("cache-control"), Some("max-age=60"));
    assert_eq!(revalidated.header("x-version"), Some("two"));
    assert!(revalidated.network_response().is_some());
    assert!(revalidated.cache_response().is_some());
    assert_eq!(revalidated.into_body().text().await.unwrap(), "entity v1");

    assert_eq!(cache.request_count(), 2);
    assert_eq!(cache.network_count(), 2);
    assert_eq!(cache.hit_count(), 1);
}

#[tokio::test]
async fn only_if_cached_without_entry_synthesizes_504() {
    let codecs = MockCodecFactory::new();
    let client = test_client_builder(&codecs)
        .cache(Cache::in_memory())
        .build()
        .unwrap();

    let request = Request::builder()
        .url("http://h.example/missing")
        .unwrap()
        .cache_control(&CacheControl::force_cache())
        .unwrap()
        .build()
        .unwrap();
    let response = client.new_call(request).execute().await.unwrap();
    assert_eq!(response.status(), 504);
    assert!(codecs.seen_requests().is_empty());
}

#[tokio::test]
async fn no_store_responses_are_not_cached() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(
        ScriptedResponse::new(200)
            .header("cache-control", "no-store")
            .body(&b"secret"[..]),
    );
    codecs.enqueue(ScriptedResponse::new(200).body(&b"fresh"[..]));
    let client = test_client_builder(&codecs)
        .cache(Cache::in_memory())
        .build()
        .unwrap();

    client
        .new_call(Request::get("http://h.example/private").unwrap())
        .execute()
        .await
        .unwrap()
        .into_body()
        .bytes()
        .await
        .unwrap();
    let second = client
        .new_call(Request::get("http://h.example/private").unwrap())
        .execute()
        .await
        .unwrap();
    assert_eq!(second.into_body().text().await.unwrap(), "fresh");
    assert_eq!(codecs.codecs_created(), 2);
}

#[tokio::test]
async fn unsafe_method_invalidates_cached_entry() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(
        ScriptedResponse::new(200)
            .header("cache-control", "max-age=60")
            .header("date", &http_date_now())
            .body(&b"v1"[..]),
    );
    codecs.enqueue(ScriptedResponse::new(204));
    codecs.enqueue(
        ScriptedResponse::new(200)
            .header("cache-control", "max-age=60")
            .body(&b"v2"[..]),
    );
    let client = test_client_builder(&codecs)
        .cache(Cache::in_memory())
        .build()
        .unwrap();

    client
        .new_call(Request::get("http://h.example/doc").unwrap())
        .execute()
        .await
        .unwrap()
        .into_body()
        .bytes()
        .await
        .unwrap();

    // DELETE purges the stored entry.
    let delete = Request::builder()
        .url("http://h.example/doc")
        .unwrap()
        .method(http::Method::DELETE)
        .build()
        .unwrap();
    client.new_call(delete).execute().await.unwrap();

    let after = client
        .new_call(Request::get("http://h.example/doc").unwrap())
        .execute()
        .await
        .unwrap();
    assert_eq!(after.into_body().text().await.unwrap(), "v2");
    assert_eq!(codecs.codecs_created(), 3);
}
