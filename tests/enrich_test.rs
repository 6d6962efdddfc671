use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use sf_sync::config;
use sf_sync::enrich::model::LookupReply;
use sf_sync::enrich::{DesktopClient, EnrichError, PositionLookup};

/// Canned-response HTTP stub: one response per connection, in order. The
/// first request line of every connection is reported on the channel so
/// tests can assert how many calls happened and to which paths.
async fn spawn_stub(responses: Vec<String>) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        for response in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let request = read_request(&mut socket).await;
            let first_line = request.lines().next().unwrap_or_default().to_string();
            let _ = tx.send(first_line);
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (format!("http://{addr}"), rx)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let Ok(n) = socket.read(&mut chunk).await else {
            break;
        };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn token_ok() -> String {
    http_response("200 OK", &json!({"access_token": "tok-1"}).to_string())
}

fn desktop_config(base: &str) -> config::Desktop {
    config::Desktop {
        oauth_url: format!("{base}/oauth2/token"),
        client_id: "cid".into(),
        client_secret: "secret".into(),
        api_base: base.to_string(),
        verify_ssl: true,
    }
}

fn client(base: &str) -> DesktopClient {
    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    DesktopClient::new(http, &desktop_config(base))
}

#[tokio::test]
async fn missing_cto_maps_to_not_found() {
    let (base, mut calls) = spawn_stub(vec![
        token_ok(),
        http_response("404 Not Found", r#"{"detail": "cto not found"}"#),
    ])
    .await;

    let mut client = client(&base);
    let reply = client.positions("CX-9999", "ZZZ").await.unwrap();
    assert!(matches!(reply, LookupReply::NotFound));

    assert!(calls.recv().await.unwrap().starts_with("POST /oauth2/token"));
    let get = calls.recv().await.unwrap();
    assert!(get.starts_with("GET /resource-inventory/v1/ctos/CX-9999/positions?group=ZZZ"));
}

#[tokio::test]
async fn expired_token_is_refreshed_once_and_the_call_retried_once() {
    let positions = json!([
        {"port_number": 4, "status": "Conectado",
         "last_connection_start": "12/08/2025 - 10:30:05",
         "last_connection_stop": null}
    ]);
    let (base, mut calls) = spawn_stub(vec![
        token_ok(),
        http_response("401 Unauthorized", "{}"),
        token_ok(),
        http_response("200 OK", &positions.to_string()),
    ])
    .await;

    let mut client = client(&base);
    let reply = client.positions("CX-1", "ABC").await.unwrap();

    let list = match reply {
        LookupReply::Positions(list) => list,
        other => panic!("wrong reply: {other:?}"),
    };
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].port_number, Some(4));
    assert_eq!(list[0].status.as_deref(), Some("Conectado"));

    // token, GET (401), token again, GET retry
    let mut seen = Vec::new();
    while let Ok(line) = calls.try_recv() {
        seen.push(line);
    }
    assert_eq!(seen.len(), 4);
    assert!(seen[0].starts_with("POST /oauth2/token"));
    assert!(seen[1].starts_with("GET /resource-inventory"));
    assert!(seen[2].starts_with("POST /oauth2/token"));
    assert!(seen[3].starts_with("GET /resource-inventory"));
}

#[tokio::test]
async fn second_unauthorized_becomes_auth_denied_not_a_loop() {
    let (base, mut calls) = spawn_stub(vec![
        token_ok(),
        http_response("401 Unauthorized", "{}"),
        token_ok(),
        http_response("401 Unauthorized", "{}"),
    ])
    .await;

    let mut client = client(&base);
    let reply = client.positions("CX-1", "ABC").await.unwrap();
    match reply {
        LookupReply::AuthDenied { status } => assert_eq!(status.as_u16(), 401),
        other => panic!("wrong reply: {other:?}"),
    }

    let mut seen = 0;
    while calls.try_recv().is_ok() {
        seen += 1;
    }
    assert_eq!(seen, 4);
}

#[tokio::test]
async fn rejected_token_exchange_is_an_error() {
    let (base, _calls) = spawn_stub(vec![http_response(
        "400 Bad Request",
        r#"{"error": "invalid_client"}"#,
    )])
    .await;

    let mut client = client(&base);
    let err = client.positions("CX-1", "ABC").await.unwrap_err();
    match err {
        EnrichError::Token { status, body } => {
            assert_eq!(status.as_u16(), 400);
            assert!(body.contains("invalid_client"));
        }
        other => panic!("wrong error: {other}"),
    }
}
