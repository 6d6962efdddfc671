use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use sf_sync::config;
use sf_sync::retry::RetryPolicy;
use sf_sync::salesforce::{authenticate, QueryPages, RecordSource, Session, SfError};

/// One-shot HTTP stub: serves the canned responses in order, one per
/// connection, then stops accepting.
async fn spawn_stub(responses: Vec<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for response in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            read_request(&mut socket).await;
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{addr}")
}

/// Drain one request: headers, then as many body bytes as Content-Length
/// announces.
async fn read_request(socket: &mut tokio::net::TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let Ok(n) = socket.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
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
                return;
            }
        }
    }
}

fn http_200(body: &str) -> String {
    http_response("200 OK", body)
}

fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn sf_config(domain: &str) -> config::Salesforce {
    config::Salesforce {
        domain: domain.to_string(),
        client_id: "cid".into(),
        client_secret: "secret".into(),
        username: "user@example.com".into(),
        password: "pw".into(),
        api_version: "65.0".into(),
    }
}

#[tokio::test]
async fn authenticate_prefers_server_instance_url() {
    let token = json!({
        "access_token": "tok-123",
        "instance_url": "https://regional.example.com/"
    });
    let base = spawn_stub(vec![http_200(&token.to_string())]).await;

    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    let session = authenticate(&http, &sf_config(&base)).await.unwrap();

    assert_eq!(session.access_token, "tok-123");
    assert_eq!(session.instance_url, "https://regional.example.com");
    assert_eq!(session.bearer(), "Bearer tok-123");
}

#[tokio::test]
async fn authenticate_surfaces_status_and_body() {
    let body = json!({"error": "invalid_grant", "error_description": "authentication failure"});
    let base = spawn_stub(vec![http_response("400 Bad Request", &body.to_string())]).await;

    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    let err = authenticate(&http, &sf_config(&base)).await.unwrap_err();

    match err {
        SfError::Auth { status, body } => {
            assert_eq!(status.as_u16(), 400);
            assert!(body.contains("invalid_grant"));
        }
        other => panic!("wrong error: {other}"),
    }
}

#[tokio::test]
async fn query_pages_follow_the_continuation_cursor() {
    let page1 = json!({
        "totalSize": 3,
        "done": false,
        "nextRecordsUrl": "/services/data/v65.0/query/01g-2000",
        "records": [{"Id": "a"}, {"Id": "b"}]
    });
    let page2 = json!({
        "totalSize": 3,
        "done": true,
        "records": [{"Id": "c"}]
    });
    let base = spawn_stub(vec![
        http_200(&page1.to_string()),
        http_200(&page2.to_string()),
    ])
    .await;

    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    let session = Session {
        access_token: "tok".into(),
        instance_url: base,
    };
    let mut pages = QueryPages::new(http, session, "65.0", "SELECT Id FROM Thing");

    let first = pages.next_page().await.unwrap().unwrap();
    assert_eq!(first.len(), 2);
    let second = pages.next_page().await.unwrap().unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0]["Id"], "c");
    assert!(pages.next_page().await.unwrap().is_none());
    // Exhausted streams stay exhausted.
    assert!(pages.next_page().await.unwrap().is_none());
}

#[tokio::test]
async fn query_aborts_on_client_error_without_retry() {
    let base = spawn_stub(vec![http_response(
        "400 Bad Request",
        r#"[{"message": "unexpected token", "errorCode": "MALFORMED_QUERY"}]"#,
    )])
    .await;

    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    let session = Session {
        access_token: "tok".into(),
        instance_url: base,
    };
    let mut pages = QueryPages::with_retry(
        http,
        session,
        "65.0",
        "SELECT bogus FROM Thing",
        RetryPolicy::with_max_attempts(3),
    );

    match pages.next_page().await.unwrap_err() {
        SfError::Api { status, body } => {
            assert_eq!(status.as_u16(), 400);
            assert!(body.contains("MALFORMED_QUERY"));
        }
        other => panic!("wrong error: {other}"),
    }
}
