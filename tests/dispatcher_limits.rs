//! Dispatcher scheduling: global and per-host limits, idle callback,
//! and cancellation fan-out.

mod helpers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kestrel::dispatcher::Dispatcher;
use kestrel::{Error, Request};

use helpers::{
    test_client_builder, wait_until, ChannelCallback, MockCodecFactory, ScriptedResponse,
};

#[tokio::test]
async fn per_host_limit_admits_two_of_three() {
    let codecs = MockCodecFactory::new();
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    for _ in 0..3 {
        codecs.enqueue(ScriptedResponse::new(200).gated(gate.clone()));
    }
    let dispatcher = Dispatcher::new();
    dispatcher.set_max_requests_per_host(2);
    let client = test_client_builder(&codecs)
        .dispatcher(dispatcher)
        .build()
        .unwrap();
    let (callback, mut events) = ChannelCallback::new();

    for _ in 0..3 {
        client
            .new_call(Request::get("http://h.example/a").unwrap())
            .enqueue(callback.clone())
            .unwrap();
    }

    // Two admitted, one left waiting; the per-host counter holds at 2.
    let dispatcher = client.dispatcher().clone();
    {
        let d = dispatcher.clone();
        wait_until(move || d.running_count() == 2).await;
    }
    assert_eq!(dispatcher.queued_count(), 1);

    // Finishing one promotes the third.
    gate.add_permits(1);
    assert_eq!(events.recv().await.unwrap().unwrap(), 200);
    {
        let d = dispatcher.clone();
        wait_until(move || d.queued_count() == 0).await;
    }
    assert!(dispatcher.running_count() <= 2);

    gate.add_permits(2);
    assert_eq!(events.recv().await.unwrap().unwrap(), 200);
    assert_eq!(events.recv().await.unwrap().unwrap(), 200);
    {
        let d = dispatcher.clone();
        wait_until(move || d.running_count() == 0).await;
    }
}

#[tokio::test]
async fn global_limit_blocks_all_later_calls() {
    let codecs = MockCodecFactory::new();
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    for _ in 0..3 {
        codecs.enqueue(ScriptedResponse::new(200).gated(gate.clone()));
    }
    let dispatcher = Dispatcher::new();
    dispatcher.set_max_requests(2);
    let client = test_client_builder(&codecs)
        .dispatcher(dispatcher)
        .build()
        .unwrap();
    let (callback, mut events) = ChannelCallback::new();

    // Three different hosts: only the global limit is in play.
    for host in ["a.example", "b.example", "c.example"] {
        client
            .new_call(Request::get(format!("http://{host}/")).unwrap())
            .enqueue(callback.clone())
            .unwrap();
    }

    let dispatcher = client.dispatcher().clone();
    {
        let d = dispatcher.clone();
        wait_until(move || d.running_count() == 2).await;
    }
    assert_eq!(dispatcher.queued_count(), 1);

    gate.add_permits(3);
    for _ in 0..3 {
        assert_eq!(events.recv().await.unwrap().unwrap(), 200);
    }
}

#[tokio::test]
async fn idle_callback_fires_when_drained() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(ScriptedResponse::new(200));
    let client = test_client_builder(&codecs).build().unwrap();

    let idle = Arc::new(AtomicBool::new(false));
    let idle_flag = Arc::clone(&idle);
    client
        .dispatcher()
        .set_idle_callback(Some(Arc::new(move || {
            idle_flag.store(true, Ordering::Release);
        })));

    let (callback, mut events) = ChannelCallback::new();
    client
        .new_call(Request::get("http://h.example/").unwrap())
        .enqueue(callback)
        .unwrap();
    assert_eq!(events.recv().await.unwrap().unwrap(), 200);
    wait_until(move || idle.load(Ordering::Acquire)).await;
}

#[tokio::test]
async fn cancel_all_fails_queued_and_running() {
    let codecs = MockCodecFactory::new();
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    codecs.enqueue(ScriptedResponse::new(200).gated(gate.clone()));
    let client = test_client_builder(&codecs).build().unwrap();
    let (callback, mut events) = ChannelCallback::new();

    let call = client.new_call(Request::get("http://h.example/").unwrap());
    call.enqueue(callback).unwrap();
    {
        let d = client.dispatcher().clone();
        wait_until(move || d.running_count() == 1).await;
    }

    client.dispatcher().cancel_all();
    let outcome = events.recv().await.unwrap();
    assert!(outcome.is_err());
    assert!(call.is_canceled());
    // Exactly one terminal event.
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn enqueue_twice_is_rejected() {
    let codecs = MockCodecFactory::new();
    codecs.enqueue(ScriptedResponse::new(200));
    let client = test_client_builder(&codecs).build().unwrap();
    let (callback, mut events) = ChannelCallback::new();

    let call = client.new_call(Request::get("http://h.example/").unwrap());
    call.enqueue(callback.clone()).unwrap();
    assert!(matches!(
        call.enqueue(callback),
        Err(Error::Protocol(_))
    ));
    assert_eq!(events.recv().await.unwrap().unwrap(), 200);
}
