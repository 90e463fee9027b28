//! MCP test server binary for integration tests
//!
//! A minimal MCP server speaking newline-delimited JSON over stdin/stdout
//! (the stdio transport protocol). Used exclusively by integration tests to
//! exercise the manager without a real external MCP server.
//!
//! # Handled Methods
//!
//! - `initialize` -- responds with protocol version `2025-11-25` and
//!   capabilities `{tools, logging}`.
//! - `notifications/initialized` -- acknowledged silently.
//! - `tools/list` -- three tools: `echo` (reflects `{text}`), `ask_age`
//!   (issues an `elicitation/create` request and returns the answer), and
//!   `crash` (exits the process immediately, simulating an external kill).
//! - `tools/call` -- dispatches to the tool implementations.
//! - `ping`, `logging/setLevel` -- empty results.
//! - All other methods -- JSON-RPC `-32601 Method not found`.
//!
//! Command-line arguments are ignored; tests pass a `--marker <uuid>`
//! argument so they can find (and assert the absence of) the child process
//! by scanning the process table.

use std::io::{self, BufRead, Write};

fn main() {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut lines = stdin.lock().lines();
    let mut next_server_request_id: u64 = 9000;

    while let Some(Ok(line)) = lines.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                let response = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": "Parse error" }
                });
                let _ = writeln!(out, "{}", response);
                let _ = out.flush();
                continue;
            }
        };

        let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let id = request.get("id").cloned().unwrap_or(serde_json::Value::Null);

        // Notifications are consumed silently.
        if method.starts_with("notifications/") {
            continue;
        }

        let response = match method {
            "initialize" => handle_initialize(&id),
            "tools/list" => handle_tools_list(&id),
            "tools/call" => {
                handle_tools_call(&id, &request, &mut lines, &mut out, &mut next_server_request_id)
            }
            "ping" => empty_result(&id),
            "logging/setLevel" => empty_result(&id),
            _ => make_error(&id, -32601, &format!("Method not found: {}", method)),
        };

        let serialized = match serde_json::to_string(&response) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("mcp_test_server: failed to serialize response: {}", e);
                continue;
            }
        };
        if writeln!(out, "{}", serialized).is_err() {
            break;
        }
        if out.flush().is_err() {
            break;
        }
    }
}

fn handle_initialize(id: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": "2025-11-25",
            "capabilities": {
                "tools": {},
                "logging": {}
            },
            "serverInfo": {
                "name": "mcp-test-server",
                "version": "0.1.0"
            }
        }
    })
}

fn handle_tools_list(id: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "tools": [
                {
                    "name": "echo",
                    "description": "Echoes input",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "text": { "type": "string" } }
                    }
                },
                {
                    "name": "ask_age",
                    "description": "Asks the user for their age via elicitation",
                    "inputSchema": { "type": "object", "properties": {} }
                },
                {
                    "name": "crash",
                    "description": "Exits the server process immediately",
                    "inputSchema": { "type": "object", "properties": {} }
                }
            ]
        }
    })
}

fn handle_tools_call(
    id: &serde_json::Value,
    request: &serde_json::Value,
    lines: &mut impl Iterator<Item = io::Result<String>>,
    out: &mut impl Write,
    next_server_request_id: &mut u64,
) -> serde_json::Value {
    let params = request.get("params").cloned().unwrap_or(serde_json::Value::Null);
    let tool_name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");

    match tool_name {
        "echo" => {
            let text = params
                .get("arguments")
                .and_then(|a| a.get("text"))
                .and_then(|t| t.as_str())
                .unwrap_or("");
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "content": [{ "type": "text", "text": text }],
                    "isError": false
                }
            })
        }
        "ask_age" => handle_ask_age(id, lines, out, next_server_request_id),
        "crash" => {
            // Simulates the subprocess being killed externally.
            std::process::exit(1);
        }
        other => make_error(id, -32602, &format!("Unknown tool: {}", other)),
    }
}

/// Issue an `elicitation/create` request to the client and block until the
/// matching response arrives, then answer the original tool call.
fn handle_ask_age(
    call_id: &serde_json::Value,
    lines: &mut impl Iterator<Item = io::Result<String>>,
    out: &mut impl Write,
    next_server_request_id: &mut u64,
) -> serde_json::Value {
    let request_id = *next_server_request_id;
    *next_server_request_id += 1;

    let elicitation = serde_json::json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "method": "elicitation/create",
        "params": {
            "message": "How old are you?",
            "requestedSchema": {
                "type": "object",
                "properties": { "age": { "type": "integer" } },
                "required": ["age"]
            }
        }
    });
    if writeln!(out, "{}", elicitation).is_err() || out.flush().is_err() {
        return make_error(call_id, -32603, "failed to send elicitation");
    }

    // Read frames until the client answers our request. The client sends
    // nothing else on this connection while the tool call is blocked.
    for line in lines {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(frame) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            continue;
        };
        if frame.get("id").and_then(|v| v.as_u64()) != Some(request_id) {
            continue;
        }

        let result = frame.get("result").cloned().unwrap_or(serde_json::Value::Null);
        let action = result.get("action").and_then(|a| a.as_str()).unwrap_or("cancel");
        if action != "accept" {
            return serde_json::json!({
                "jsonrpc": "2.0",
                "id": call_id,
                "result": {
                    "content": [{ "type": "text", "text": "elicitation declined" }],
                    "isError": true
                }
            });
        }

        let content = result.get("content").cloned().unwrap_or(serde_json::Value::Null);
        return serde_json::json!({
            "jsonrpc": "2.0",
            "id": call_id,
            "result": {
                "content": [{ "type": "text", "text": content.to_string() }],
                "structuredContent": content,
                "isError": false
            }
        });
    }

    make_error(call_id, -32603, "stdin closed while awaiting elicitation response")
}

fn empty_result(id: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} })
}

fn make_error(id: &serde_json::Value, code: i32, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}
