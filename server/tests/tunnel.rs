//! End-to-end tests: edge, real agent and a local service on loopback.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::header::HOST;
use tokio_tungstenite::tungstenite::Message;
use tunnel_client::AgentError;
use tunnel_server::error::NO_REGISTRATION;

mod common;
use common::*;

/// The next data or close frame from a caller-side socket.
async fn next_frame(socket: &mut Socket) -> Option<Message> {
    loop {
        let frame = tokio::time::timeout(TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for a frame");
        match frame {
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(message)) => return Some(message),
            Some(Err(_)) | None => return None,
        }
    }
}

#[tokio::test]
async fn get_is_served_by_the_registered_agent() {
    let edge = start_edge().await;
    let local = start_local_service().await;
    let _agent = start_agent(edge, local.addr, "a.example").await;

    let response = http_client()
        .get(format!("http://{edge}/hello"))
        .header(HOST, "a.example")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-upstream"], "local");
    assert_eq!(response.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn unregistered_host_gets_503() {
    let edge = start_edge().await;
    let local = start_local_service().await;
    let _agent = start_agent(edge, local.addr, "a.example").await;

    let response = http_client()
        .get(format!("http://{edge}/hello"))
        .header(HOST, "unregistered.example")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(response.text().await.unwrap(), NO_REGISTRATION);
}

#[tokio::test]
async fn host_with_port_matches_the_bare_domain() {
    let edge = start_edge().await;
    let local = start_local_service().await;
    let _agent = start_agent(edge, local.addr, "a.example").await;

    let response = http_client()
        .get(format!("http://{edge}/hello"))
        .header(HOST, "a.example:8000")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn request_and_response_bodies_round_trip_unmodified() {
    let edge = start_edge().await;
    let local = start_local_service().await;
    let _agent = start_agent(edge, local.addr, "a.example").await;
    let body: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();

    let response = http_client()
        .post(format!("http://{edge}/echo"))
        .header(HOST, "a.example")
        .body(body.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let echoed = response.bytes().await.unwrap();
    assert_eq!(echoed.len(), body.len());
    assert!(echoed.as_ref() == body.as_slice());
}

#[tokio::test]
async fn path_and_query_are_preserved() {
    let edge = start_edge().await;
    let local = start_local_service().await;
    let _agent = start_agent(edge, local.addr, "a.example").await;

    let response = http_client()
        .get(format!("http://{edge}/uri?x=1&y=two"))
        .header(HOST, "a.example")
        .send()
        .await
        .unwrap();

    assert_eq!(response.text().await.unwrap(), "/uri?x=1&y=two");
}

#[tokio::test]
async fn no_content_response_has_no_body() {
    let edge = start_edge().await;
    let local = start_local_service().await;
    let _agent = start_agent(edge, local.addr, "a.example").await;

    let response = http_client()
        .delete(format!("http://{edge}/empty"))
        .header(HOST, "a.example")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 204);
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_local_service_gets_503() {
    let edge = start_edge().await;
    let _agent = start_agent(edge, unused_addr().await, "a.example").await;

    let response = http_client()
        .get(format!("http://{edge}/hello"))
        .header(HOST, "a.example")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    assert!(response.text().await.unwrap().starts_with("Connection closed"));
}

#[tokio::test]
async fn websocket_frames_are_relayed_both_ways() {
    let edge = start_edge().await;
    let local = start_local_service().await;
    let _agent = start_agent(edge, local.addr, "a.example").await;

    let mut socket = open_socket(edge, "a.example", "/ws").await;

    socket.send(Message::Text("hi".into())).await.unwrap();
    assert_eq!(next_frame(&mut socket).await, Some(Message::Text("hi".into())));

    socket.send(Message::Binary(vec![0, 1, 2, 255].into())).await.unwrap();
    assert_eq!(
        next_frame(&mut socket).await,
        Some(Message::Binary(vec![0, 1, 2, 255].into()))
    );

    // Closing the caller's socket closes the local one.
    socket.close(None).await.unwrap();
    tokio::time::timeout(TIMEOUT, local.closed.notified())
        .await
        .expect("local socket should close");
}

#[tokio::test]
async fn local_websocket_close_reaches_the_caller() {
    let edge = start_edge().await;
    let local = start_local_service().await;
    let _agent = start_agent(edge, local.addr, "a.example").await;

    let mut socket = open_socket(edge, "a.example", "/ws-bye").await;

    assert_eq!(next_frame(&mut socket).await, Some(Message::Text("bye".into())));
    match next_frame(&mut socket).await {
        Some(Message::Close(_)) | None => {}
        other => panic!("expected the socket to close, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_requests_share_one_agent() {
    let edge = start_edge().await;
    let local = start_local_service().await;
    let _agent = start_agent(edge, local.addr, "a.example").await;
    let client = http_client();

    let requests = (0..20).map(|i| {
        let client = client.clone();
        async move {
            let response = client
                .post(format!("http://{edge}/echo"))
                .header(HOST, "a.example")
                .body(format!("request {i}"))
                .send()
                .await
                .unwrap();
            (i, response.text().await.unwrap())
        }
    });

    for (i, body) in futures::future::join_all(requests).await {
        assert_eq!(body, format!("request {i}"));
    }
}

#[tokio::test]
async fn invalid_api_key_is_rejected_and_disconnected() {
    let edge = start_edge().await;
    let local = start_local_service().await;

    let mut connection = tunnel_client::connect(&agent_config(edge, local.addr, "a.example", "wrong"))
        .await
        .unwrap();
    match connection.registered().await {
        Err(AgentError::Rejected(message)) => assert_eq!(message, "Invalid API key"),
        other => panic!("expected a rejection, got {other:?}"),
    }
    tokio::time::timeout(TIMEOUT, connection.closed())
        .await
        .expect("edge should close the connection");
    wait_for_domains(edge, |domains| domains.is_empty()).await;
}

#[tokio::test]
async fn run_stops_on_rejection() {
    let edge = start_edge().await;
    let local = start_local_service().await;

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        tunnel_client::run(agent_config(edge, local.addr, "a.example", "wrong")),
    )
    .await
    .expect("run should return after a rejection");

    assert!(matches!(result, Err(AgentError::Rejected(_))));
}
