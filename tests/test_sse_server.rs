mod common;

use anyhow::Result;
use serde_json::{Value, json};

use common::{greeter::greeter, init, next_event, spawn_sse_reader};
use mcp_gateway::{McpGateway, Properties};

#[tokio::test]
async fn test_legacy_sse_round_trip() -> Result<()> {
    init();
    let gateway = McpGateway::new(greeter)
        .with_sse("/sse", "/message")
        .serve("127.0.0.1:0".parse()?)
        .await?;
    let base = format!("http://{}", gateway.bind);
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/sse"))
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let mut events = spawn_sse_reader(response);

    // the first event names the POST endpoint for this session
    let endpoint = next_event(&mut events).await?;
    assert_eq!(endpoint.event.as_deref(), Some("endpoint"));
    assert!(endpoint.data.contains("sessionId="));
    let post_url = format!("{base}{}", endpoint.data);

    let response = client
        .post(&post_url)
        .header("Content-Type", "application/json")
        .body(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}).to_string())
        .send()
        .await?;
    assert_eq!(response.status(), 202);

    let message = next_event(&mut events).await?;
    assert_eq!(message.event.as_deref(), Some("message"));
    let body = message.json()?;
    assert_eq!(body["id"], 1);
    assert!(body["result"]["protocolVersion"].is_string());

    let response = client
        .post(&post_url)
        .header("Content-Type", "application/json")
        .body(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string())
        .send()
        .await?;
    assert_eq!(response.status(), 202);

    let response = client
        .post(&post_url)
        .header("Content-Type", "application/json")
        .body(
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": {"name": "greet", "arguments": {"name": "X"}},
            })
            .to_string(),
        )
        .send()
        .await?;
    assert_eq!(response.status(), 202);

    let message = next_event(&mut events).await?;
    let body = message.json()?;
    assert_eq!(body["id"], 2);
    assert_eq!(body["result"]["content"][0]["text"], "Hello, X!");

    gateway.cancel();
    Ok(())
}

#[tokio::test]
async fn test_properties_propagate_over_sse() -> Result<()> {
    use std::future::IntoFuture;

    init();
    // stand-in for an auth layer: stamp caller claims on every request
    let (router, _service) = McpGateway::new(greeter)
        .with_sse("/sse", "/message")
        .build();
    let router = router.layer(axum::middleware::from_fn(
        |mut request: axum::extract::Request, next: axum::middleware::Next| async move {
            let mut properties = Properties::default();
            properties.insert("user", json!("alice"));
            request.extensions_mut().insert(properties);
            next.run(request).await
        },
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    tokio::spawn(axum::serve(listener, router).into_future());

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{base}/sse"))
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    let mut events = spawn_sse_reader(response);
    let endpoint = next_event(&mut events).await?;
    let post_url = format!("{base}{}", endpoint.data);

    let response = client
        .post(&post_url)
        .header("Content-Type", "application/json")
        .body(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}).to_string())
        .send()
        .await?;
    assert_eq!(response.status(), 202);
    next_event(&mut events).await?;

    let response = client
        .post(&post_url)
        .header("Content-Type", "application/json")
        .body(
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": {"name": "whoami", "arguments": {}},
            })
            .to_string(),
        )
        .send()
        .await?;
    assert_eq!(response.status(), 202);

    let body = next_event(&mut events).await?.json()?;
    assert_eq!(body["result"]["content"][0]["text"], "alice");

    Ok(())
}

#[tokio::test]
async fn test_post_to_unknown_session_is_404() -> Result<()> {
    init();
    let gateway = McpGateway::new(greeter)
        .with_sse("/sse", "/message")
        .serve("127.0.0.1:0".parse()?)
        .await?;
    let client = reqwest::Client::new();

    let response = client
        .post(format!(
            "http://{}/message?sessionId=not-a-session",
            gateway.bind
        ))
        .header("Content-Type", "application/json")
        .body(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string())
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    gateway.cancel();
    Ok(())
}

#[tokio::test]
async fn test_request_before_initialize_errors_on_stream() -> Result<()> {
    init();
    let gateway = McpGateway::new(greeter)
        .with_sse("/sse", "/message")
        .serve("127.0.0.1:0".parse()?)
        .await?;
    let base = format!("http://{}", gateway.bind);
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/sse"))
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    let mut events = spawn_sse_reader(response);
    let endpoint = next_event(&mut events).await?;
    let post_url = format!("{base}{}", endpoint.data);

    let response = client
        .post(&post_url)
        .header("Content-Type", "application/json")
        .body(json!({"jsonrpc": "2.0", "id": 5, "method": "ping"}).to_string())
        .send()
        .await?;
    assert_eq!(response.status(), 202);

    let message = next_event(&mut events).await?;
    let body = message.json()?;
    assert_eq!(body["id"], 5);
    assert_eq!(body["error"]["code"], -32001);

    gateway.cancel();
    Ok(())
}

#[tokio::test]
async fn test_post_with_invalid_body_rejected() -> Result<()> {
    init();
    let gateway = McpGateway::new(greeter)
        .with_sse("/sse", "/message")
        .serve("127.0.0.1:0".parse()?)
        .await?;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/message?sessionId=whatever", gateway.bind))
        .header("Content-Type", "application/json")
        .body("{oops")
        .send()
        .await?;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], -32700);

    gateway.cancel();
    Ok(())
}
