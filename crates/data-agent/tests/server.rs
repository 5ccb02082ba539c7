//! Lifecycle of the self-expiring server.

mod common;

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::routing::get;
use knitfab_data_agent::{Bind, Endpoint, ServerConfig, StopReason, start};
use tokio_util::sync::CancellationToken;

use common::{collect, json, send};

/// An endpoint that answers `GET /` with "ok" after `delay`.
fn slow_endpoint(delay: Duration) -> Endpoint {
    Endpoint::new(
        Method::GET,
        "/",
        get(move || async move {
            tokio::time::sleep(delay).await;
            "ok"
        }),
    )
}

fn request(path: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn binds_an_ephemeral_port() {
    let cancel = CancellationToken::new();
    let server = start(
        cancel.clone(),
        Bind::LocalPort(0),
        slow_endpoint(Duration::ZERO),
        ServerConfig::default().silent(),
    )
    .await
    .unwrap();
    assert_ne!(server.port, 0);

    cancel.cancel();
    assert_eq!(server.stopped.await.unwrap().unwrap(), StopReason::Cancelled);
}

#[tokio::test]
async fn request_before_deadline_is_served_even_if_handler_outlives_it() {
    let config = ServerConfig::default()
        .with_deadline(Duration::from_millis(300))
        .with_graceful_period(Duration::from_secs(1));
    let server = start(
        CancellationToken::new(),
        Bind::LocalPort(0),
        slow_endpoint(Duration::from_millis(600)),
        config,
    )
    .await
    .unwrap();

    let response = send(server.port, request("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let (body, _) = collect(response).await;
    assert_eq!(&body[..], b"ok");

    let stopped = tokio::time::timeout(Duration::from_secs(5), server.stopped)
        .await
        .expect("server stops after serving");
    assert_eq!(stopped.unwrap().unwrap(), StopReason::Served);
}

#[tokio::test]
async fn accepts_only_one_request() {
    let config = ServerConfig::default()
        .with_deadline(Duration::from_secs(5))
        .with_graceful_period(Duration::from_secs(2));
    let server = start(
        CancellationToken::new(),
        Bind::LocalPort(0),
        slow_endpoint(Duration::from_millis(300)),
        config,
    )
    .await
    .unwrap();
    let port = server.port;

    let first = tokio::spawn(send(port, request("/")));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = send(port, request("/")).await.unwrap();
    assert_eq!(second.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(second).await["message"]["reason"], "not found");

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    collect(first).await;

    assert_eq!(server.stopped.await.unwrap().unwrap(), StopReason::Served);
}

#[tokio::test]
async fn other_paths_do_not_use_up_the_server() {
    let server = start(
        CancellationToken::new(),
        Bind::LocalPort(0),
        slow_endpoint(Duration::ZERO),
        ServerConfig::default().with_deadline(Duration::from_secs(5)),
    )
    .await
    .unwrap();

    let stray = send(server.port, request("/elsewhere")).await.unwrap();
    assert_eq!(stray.status(), StatusCode::NOT_FOUND);

    let response = send(server.port, request("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    collect(response).await;

    assert_eq!(server.stopped.await.unwrap().unwrap(), StopReason::Served);
}

#[tokio::test]
async fn stops_when_no_request_arrives_before_deadline() {
    let config = ServerConfig::default()
        .with_deadline(Duration::from_millis(100))
        .with_graceful_period(Duration::ZERO);
    let server = start(
        CancellationToken::new(),
        Bind::LocalPort(0),
        slow_endpoint(Duration::ZERO),
        config,
    )
    .await
    .unwrap();
    let port = server.port;

    let stopped = tokio::time::timeout(Duration::from_secs(5), server.stopped)
        .await
        .expect("server expires");
    assert_eq!(stopped.unwrap().unwrap(), StopReason::Expired);

    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn stops_promptly_when_cancelled() {
    let cancel = CancellationToken::new();
    let server = start(
        cancel.clone(),
        Bind::LocalPort(0),
        slow_endpoint(Duration::ZERO),
        ServerConfig::default().with_deadline(Duration::from_secs(3600)),
    )
    .await
    .unwrap();

    let before = Instant::now();
    cancel.cancel();
    let stopped = tokio::time::timeout(Duration::from_secs(5), server.stopped)
        .await
        .expect("server stops on cancel");
    assert_eq!(stopped.unwrap().unwrap(), StopReason::Cancelled);
    assert!(before.elapsed() < Duration::from_secs(5));
}
