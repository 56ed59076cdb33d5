//! Integration tests for the `custody serve` HTTP API.
//!
//! Each test starts the server as a child process on a unique port,
//! makes HTTP requests, and verifies the responses.

use std::io::Read;
use std::net::TcpStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

/// Atomic port counter to avoid port conflicts between parallel tests.
/// Base port is derived from process ID so separate test binaries don't
/// collide on the same port range.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);
static PORT_INIT: std::sync::Once = std::sync::Once::new();

fn next_port() -> u16 {
    PORT_INIT.call_once(|| {
        let base = 20000 + (std::process::id() as u16 % 20000);
        NEXT_PORT.store(base, Ordering::SeqCst);
    });
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// Write a config with a static master holding `refs` (all approved).
fn write_config(dir: &Path, refs: &[&str]) -> std::path::PathBuf {
    let shipments: Vec<Value> = refs
        .iter()
        .map(|r| {
            serde_json::json!({
                "external_ref": r,
                "status": "approved",
                "document_date": "2025-01-10",
                "category": "retail",
            })
        })
        .collect();
    std::fs::write(
        dir.join("shipments.json"),
        serde_json::to_string(&shipments).unwrap(),
    )
    .unwrap();

    let path = dir.join("custody.toml");
    std::fs::write(
        &path,
        "[master]\nkind = \"static\"\npath = \"shipments.json\"\n\n[eligibility]\nstatuses = [\"approved\"]\n",
    )
    .unwrap();
    path
}

/// Server child process; killed on drop.
struct Server {
    child: Child,
    port: u16,
    _dir: TempDir,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

/// Helper: start `custody serve` on a fresh port with the given master refs.
fn start_server(refs: &[&str]) -> Server {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), refs);
    let port = next_port();

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_custody"));
    cmd.arg("serve")
        .arg("--config")
        .arg(&config)
        .arg("--port")
        .arg(port.to_string());
    // Output is not inspected; discard it so a full pipe never blocks the server
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());

    let child = cmd.spawn().expect("failed to start custody serve");
    // Wait for server to be ready by polling the port
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Server {
        child,
        port,
        _dir: dir,
    }
}

fn send(port: u16, request: String) -> (u16, String) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    std::io::Write::write_all(&mut stream, request.as_bytes()).expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);

    parse_http_response(&response)
}

/// Helper: make a simple HTTP GET request and return (status, body).
fn http_get(port: u16, path: &str) -> (u16, String) {
    send(
        port,
        format!(
            "GET {} HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n\r\n",
            path, port
        ),
    )
}

/// Helper: make a simple HTTP POST request and return (status, body).
fn http_post(port: u16, path: &str, body: &str) -> (u16, String) {
    send(
        port,
        format!(
            "POST {} HTTP/1.1\r\nHost: localhost:{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            path, port, body.len(), body
        ),
    )
}

/// Parse an HTTP response into (status_code, body).
fn parse_http_response(response: &str) -> (u16, String) {
    let parts: Vec<&str> = response.splitn(2, "\r\n\r\n").collect();
    let headers = parts.first().unwrap_or(&"").to_string();
    let body = parts.get(1).unwrap_or(&"").to_string();

    let status = headers
        .lines()
        .next()
        .unwrap_or("")
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    let body = if headers
        .to_ascii_lowercase()
        .contains("transfer-encoding: chunked")
    {
        decode_chunked(&body)
    } else {
        body
    };

    (status, body)
}

/// Decode chunked transfer encoding.
fn decode_chunked(data: &str) -> String {
    let mut result = String::new();
    let mut remaining = data;

    while let Some(line_end) = remaining.find("\r\n") {
        let size = match usize::from_str_radix(remaining[..line_end].trim(), 16) {
            Ok(s) => s,
            Err(_) => break,
        };
        if size == 0 {
            break;
        }
        let chunk_start = line_end + 2;
        let chunk_end = chunk_start + size;
        if chunk_end > remaining.len() {
            result.push_str(&remaining[chunk_start..]);
            break;
        }
        result.push_str(&remaining[chunk_start..chunk_end]);
        remaining = remaining.get(chunk_end + 2..).unwrap_or("");
    }

    result
}

fn json(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|e| panic!("invalid JSON ({}): {}", e, body))
}

fn actor(user_id: &str, role: &str) -> Value {
    serde_json::json!({ "user_id": user_id, "role": role })
}

/// Hand `refs` over into the entry stage as the delivery desk.
fn handover_entry(port: u16, refs: &[&str]) -> Value {
    let body = serde_json::json!({
        "actor": actor("d-1", "delivery"),
        "refs": refs,
        "target": 2,
    });
    let (status, body) = http_post(port, "/handover", &body.to_string());
    assert_eq!(status, 200, "handover failed: {}", body);
    json(&body)
}

#[test]
fn health_returns_200_with_version() {
    let server = start_server(&[]);
    let (status, body) = http_get(server.port, "/health");
    assert_eq!(status, 200);
    let v = json(&body);
    assert_eq!(v["status"], "ok");
    assert!(v["version"].is_string());
}

#[test]
fn unknown_route_returns_404_json() {
    let server = start_server(&[]);
    let (status, body) = http_get(server.port, "/nope");
    assert_eq!(status, 404);
    assert_eq!(json(&body)["error"], "not found");
}

#[test]
fn stages_lists_default_pipeline() {
    let server = start_server(&[]);
    let (status, body) = http_get(server.port, "/stages");
    assert_eq!(status, 200);
    let v = json(&body);
    assert_eq!(v["entry_checkpoint"], 2);
    let stages = v["stages"].as_array().unwrap();
    assert_eq!(stages.len(), 12);
    assert_eq!(stages[0]["from"], "delivery");
    assert_eq!(stages[0]["acting"], "hub");
    assert_eq!(stages[2]["captures_assignment"], true);
}

#[test]
fn handover_then_bundle_acceptance_receives_bundle() {
    let server = start_server(&["SJ-A", "SJ-B", "SJ-C"]);
    let port = server.port;

    let (status, body) = http_get(port, "/shipments/eligible");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["shipments"].as_array().unwrap().len(), 3);

    let handed = handover_entry(port, &["SJ-A", "SJ-B"]);
    assert_eq!(handed["inserted_count"], 2);
    assert_eq!(handed["bundle"]["document_number"], "HG000001");
    let bundle_id = handed["bundle"]["bundle_id"].as_str().unwrap().to_string();
    let tracking_id = handed["tracking_ids"][0].as_str().unwrap().to_string();

    let (_, body) = http_get(port, "/shipments/eligible");
    let eligible = json(&body);
    let refs: Vec<&str> = eligible["shipments"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["external_ref"].as_str().unwrap())
        .collect();
    assert_eq!(refs, vec!["SJ-C"]);

    let (status, body) = http_get(port, "/shipments/outstanding/hub");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["shipments"].as_array().unwrap().len(), 2);

    let accept = serde_json::json!({
        "actor": actor("user42", "hub"),
        "checkpoint": 2,
        "target": { "bundles": [bundle_id] },
    });
    let (status, body) = http_post(port, "/accept", &accept.to_string());
    assert_eq!(status, 200, "{}", body);
    let accepted = json(&body);
    assert_eq!(accepted["accepted_count"], 2);
    assert_eq!(accepted["stale_count"], 0);
    assert_eq!(accepted["received_bundles"].as_array().unwrap().len(), 1);

    let (status, body) = http_get(port, &format!("/bundles/{}", bundle_id));
    assert_eq!(status, 200);
    let view = json(&body);
    assert_eq!(view["bundle"]["received_by"], "user42");
    assert_eq!(view["members"].as_array().unwrap().len(), 2);

    let (status, body) = http_get(port, "/bundles?checkpoint=2");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["bundles"].as_array().unwrap().len(), 1);

    let (status, body) = http_get(port, &format!("/shipments/{}/progress", tracking_id));
    assert_eq!(status, 200);
    let progress = json(&body)["progress"].as_array().unwrap().clone();
    let types: Vec<&str> = progress
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["HANDOVER", "ACCEPTANCE"]);
}

#[test]
fn entry_cancellation_over_http() {
    let server = start_server(&["SJ-A"]);
    let port = server.port;
    let handed = handover_entry(port, &["SJ-A"]);
    let tracking_id = handed["tracking_ids"][0].as_str().unwrap().to_string();
    let body = |user: &str, role: &str| serde_json::json!({ "actor": actor(user, role) }).to_string();

    let (status, resp) = http_post(
        port,
        &format!("/shipments/{}/cancel", tracking_id),
        &body("d-1", "delivery"),
    );
    assert_eq!(status, 200, "{}", resp);
    assert_eq!(json(&resp)["cancel_requested"], true);

    let (status, _) = http_post(
        port,
        &format!("/shipments/{}/cancel/confirm", tracking_id),
        &body("d-1", "delivery"),
    );
    assert_eq!(status, 403);

    let (status, resp) = http_post(
        port,
        &format!("/shipments/{}/cancel/confirm", tracking_id),
        &body("hub-1", "hub"),
    );
    assert_eq!(status, 200, "{}", resp);
    assert_eq!(json(&resp)["resolution"]["kind"], "removed");

    let (status, _) = http_get(port, &format!("/shipments/{}/progress", tracking_id));
    assert_eq!(status, 404);

    let (status, _) = http_post(
        port,
        &format!("/shipments/{}/cancel", tracking_id),
        &body("d-1", "delivery"),
    );
    assert_eq!(status, 404);
}

#[test]
fn workflow_errors_map_to_status_codes() {
    let server = start_server(&["SJ-A"]);
    let port = server.port;

    let wrong_actor = serde_json::json!({
        "actor": actor("drv-1", "driver"),
        "refs": ["SJ-A"],
        "target": 2,
    });
    let (status, body) = http_post(port, "/handover", &wrong_actor.to_string());
    assert_eq!(status, 403);
    assert!(json(&body)["error"].is_string());

    let empty = serde_json::json!({
        "actor": actor("hub-1", "hub"),
        "checkpoint": 2,
        "target": { "shipments": [] },
    });
    let (status, _) = http_post(port, "/accept", &empty.to_string());
    assert_eq!(status, 400);

    let (status, body) = http_post(port, "/handover", r#"{"target": 2}"#);
    assert_eq!(status, 400);
    assert!(json(&body)["error"]
        .as_str()
        .unwrap()
        .contains("invalid request body"));

    let (status, _) = http_get(port, "/shipments/outstanding/captain");
    assert_eq!(status, 400);

    let (status, _) = http_get(port, "/bundles/bundle-99");
    assert_eq!(status, 404);

    let (status, _) = http_get(port, "/bundles?checkpoint=42");
    assert_eq!(status, 400);
}

#[test]
fn document_callback_attaches_once() {
    let server = start_server(&["SJ-A"]);
    let port = server.port;
    let handed = handover_entry(port, &["SJ-A"]);
    let bundle_id = handed["bundle"]["bundle_id"].as_str().unwrap().to_string();

    let accept = serde_json::json!({
        "actor": actor("hub-1", "hub"),
        "checkpoint": 2,
        "target": { "shipments": ["SJ-A"] },
    });
    let (status, _) = http_post(port, "/accept", &accept.to_string());
    assert_eq!(status, 200);

    let path = format!("/bundles/{}/document", bundle_id);
    let (status, body) = http_post(port, &path, r#"{"attachment_ref": "docs/HG000001.pdf"}"#);
    assert_eq!(status, 200, "{}", body);
    assert_eq!(json(&body)["attached"], true);

    let (status, body) = http_post(port, &path, r#"{"attachment_ref": "docs/other.pdf"}"#);
    assert_eq!(status, 200);
    assert_eq!(json(&body)["attached"], false);

    let (_, body) = http_get(port, &format!("/bundles/{}", bundle_id));
    assert_eq!(json(&body)["bundle"]["attachment_ref"], "docs/HG000001.pdf");

    let (status, body) = http_post(port, "/attachments/retry", "{}");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["attached"].as_array().unwrap().len(), 0);
}
