//! End-to-end tests over a real listener.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use host_router::config::OriginPolicy;
use host_router::http::websocket::Frame;
use host_router::http::RequestContext;
use host_router::observability::AccessRecord;
use host_router::routing::{HttpMethod, Route, RouteTable};

mod common;

fn reply(ctx: &mut RequestContext, body: &str) -> Result<(), host_router::BoxError> {
    ctx.create_response().text(body.to_string()).send();
    Ok(())
}

#[tokio::test]
async fn echo_template_and_trailing_slash() {
    let server = common::start_server(common::test_config(OriginPolicy::Localhost)).await;
    server
        .registry
        .register(HttpMethod::Get, "/echo/{word}", |ctx: &mut RequestContext| {
            let word = ctx.path_param("word").unwrap_or_default().to_string();
            reply(ctx, &word)
        }, None)
        .unwrap();

    let client = common::client();
    let response = client.get(server.url("/echo/hello")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.text().await.unwrap(), "hello");

    let response = client.get(server.url("/echo/hello/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client.post(server.url("/echo/hello")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn earlier_registration_wins() {
    let server = common::start_server(common::test_config(OriginPolicy::Localhost)).await;
    server
        .registry
        .register(HttpMethod::Get, Route::Regex("^/users/.*$".into()), |ctx: &mut RequestContext| {
            reply(ctx, "catch-all")
        }, None)
        .unwrap();
    server
        .registry
        .register(HttpMethod::Get, "/users/{id}", |ctx: &mut RequestContext| {
            reply(ctx, "by-id")
        }, None)
        .unwrap();

    let client = common::client();
    let body = client
        .get(server.url("/users/7"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "catch-all");

    server
        .registry
        .remove_by_pattern(HttpMethod::Get, "^/users/.*$")
        .unwrap();
    let body = client
        .get(server.url("/users/7"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "by-id");
}

#[tokio::test]
async fn internal_redirect_serves_target() {
    let server = common::start_server(common::test_config(OriginPolicy::Localhost)).await;
    RouteTable::new()
        .get("/old", |ctx: &mut RequestContext| {
            ctx.schedule_internal_redirect("/new?from=old");
            Ok(())
        })
        .get("/new", |ctx: &mut RequestContext| {
            let from = ctx.query("from").unwrap_or("-").to_string();
            let original = ctx.original_path().to_string();
            reply(ctx, &format!("{from}:{original}"))
        })
        .install(&server.registry)
        .unwrap();

    let response = common::client().get(server.url("/old")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "old:/old");
}

#[tokio::test]
async fn handler_reaches_owning_thread() {
    let server = common::start_server(common::test_config(OriginPolicy::Localhost)).await;
    let dispatcher = Arc::clone(&server.dispatcher);
    server
        .registry
        .register(HttpMethod::Get, "/owner", move |ctx: &mut RequestContext| {
            let probe = Arc::clone(&dispatcher);
            let on_owner = dispatcher.execute_sync(move || Ok(probe.is_owning_thread()))?;
            reply(ctx, if on_owner { "owner" } else { "elsewhere" })
        }, None)
        .unwrap();

    let body = common::client()
        .get(server.url("/owner"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "owner");
}

#[tokio::test]
async fn failing_handler_is_500() {
    let server = common::start_server(common::test_config(OriginPolicy::Localhost)).await;
    server
        .registry
        .register(HttpMethod::Put, "/broken", |_: &mut RequestContext| {
            Err("database unavailable".into())
        }, None)
        .unwrap();

    let response = common::client().put(server.url("/broken")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

fn echo_frames(frame: Frame) -> Result<(), host_router::BoxError> {
    if let Some(text) = frame.text() {
        frame.session().send_text(format!("echo:{text}"));
    }
    Ok(())
}

fn ignore_frames(_: Frame) -> Result<(), host_router::BoxError> {
    Ok(())
}

#[tokio::test]
async fn websocket_echo_from_localhost() {
    let server = common::start_server(common::test_config(OriginPolicy::Localhost)).await;
    server
        .registry
        .register_websocket_endpoint("/ws", Arc::new(echo_frames), None)
        .unwrap();

    let mut request = server.ws_url("/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "http://localhost:3000".parse().unwrap());
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    socket.send(Message::text("ping")).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.to_text().unwrap(), "echo:ping");
}

#[tokio::test]
async fn accepted_handshake_is_access_logged() {
    let records = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&records);
    let server = common::start_server_with(
        common::test_config(OriginPolicy::AllowAll),
        move |pipeline| {
            pipeline.with_access_log(Arc::new(move |record: &AccessRecord| {
                seen.lock().unwrap().push((record.path.clone(), record.status));
            }))
        },
    )
    .await;
    server
        .registry
        .register_websocket_endpoint("/ws", Arc::new(echo_frames), None)
        .unwrap();

    let (_socket, response) = tokio_tungstenite::connect_async(server.ws_url("/ws"))
        .await
        .unwrap();
    assert_eq!(response.status(), 101);
    assert_eq!(*records.lock().unwrap(), vec![("/ws".to_string(), 101)]);
}

#[tokio::test]
async fn websocket_foreign_origin_is_refused() {
    let server = common::start_server(common::test_config(OriginPolicy::Localhost)).await;
    server
        .registry
        .register_websocket_endpoint("/ws", Arc::new(echo_frames), None)
        .unwrap();

    let mut request = server.ws_url("/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "http://evil.example".parse().unwrap());
    match tokio_tungstenite::connect_async(request).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 403),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }
}

#[tokio::test]
async fn websocket_endpoint_rejects_plain_http() {
    let server = common::start_server(common::test_config(OriginPolicy::AllowAll)).await;
    server
        .registry
        .register_websocket_endpoint("/ws", Arc::new(echo_frames), None)
        .unwrap();

    let response = common::client().get(server.url("/ws")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
}

#[tokio::test]
async fn broadcast_reaches_every_session() {
    let server = common::start_server(common::test_config(OriginPolicy::AllowAll)).await;
    let ws_id = server
        .registry
        .register_websocket_endpoint("/feed", Arc::new(ignore_frames), None)
        .unwrap();

    let (mut first, _) = tokio_tungstenite::connect_async(server.ws_url("/feed"))
        .await
        .unwrap();
    let (mut second, _) = tokio_tungstenite::connect_async(server.ws_url("/feed"))
        .await
        .unwrap();

    let sessions = Arc::clone(&server.sessions);
    assert!(common::wait_for(|| sessions.session_count(ws_id) == 2, Duration::from_secs(5)).await);
    assert_eq!(server.sessions.broadcast(ws_id, "tick"), 2);

    for socket in [&mut first, &mut second] {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message.to_text().unwrap(), "tick");
    }

    first.close(None).await.unwrap();
    assert!(common::wait_for(|| sessions.session_count(ws_id) == 1, Duration::from_secs(5)).await);
}
