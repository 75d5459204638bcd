//! Scriptable stdio MCP server used by the integration tests.
//!
//! Tools: `echo` answers with its `msg` argument, `env` with the value of
//! the environment variable named by its `name` argument, `crash` exits with
//! code 3 without answering, `hang` never answers, anything else answers
//! with an error. The unlisted `stall` tool stops reading stdin altogether.
//! With `--framing header` the server exits with code 2 on the first
//! line-framed input, like a server that only speaks Content-Length.

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::time::Duration;
use toolbridge_mcp::framing::{encode_frame, FrameDecoder, Framing};

#[derive(Clone, Copy, ValueEnum)]
enum FramingArg {
    Line,
    Header,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Line => Framing::Line,
            FramingArg::Header => Framing::Header,
        }
    }
}

#[derive(Parser)]
#[command(name = "mock-mcp-server")]
#[command(about = "Stdio MCP server with scriptable failure modes", long_about = None)]
struct Options {
    /// Wire framing to speak
    #[arg(long, value_enum, default_value = "line")]
    framing: FramingArg,

    /// Tools advertised by tools/list
    #[arg(long, value_delimiter = ',', default_values = ["echo", "env", "crash", "hang"])]
    tools: Vec<String>,

    /// Stay alive after `exit` and stdin EOF
    #[arg(long)]
    linger: bool,

    /// Ignore SIGTERM so only SIGKILL stops the process
    #[arg(long)]
    ignore_sigterm: bool,

    /// Exit with code 4 on `initialize`
    #[arg(long)]
    fail_handshake: bool,

    /// Write a non-UTF-8 line to stderr at startup, then keep writing
    #[arg(long)]
    noisy_stderr: bool,
}

fn send(framing: Framing, message: &Value) {
    let frame = match encode_frame(framing, message) {
        Ok(frame) => frame,
        Err(e) => {
            eprintln!("mock-mcp-server: encode failed: {}", e);
            return;
        }
    };
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(&frame);
    let _ = stdout.flush();
}

fn handle(options: &Options, message: &Value) {
    let framing = Framing::from(options.framing);
    let Some(method) = message.get("method").and_then(Value::as_str) else {
        return;
    };
    let Some(id) = message.get("id").cloned() else {
        if method == "exit" && !options.linger {
            std::process::exit(0);
        }
        return;
    };

    let reply = |result: Value| json!({"jsonrpc": "2.0", "id": id, "result": result});
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    match method {
        "initialize" if options.fail_handshake => std::process::exit(4),
        "initialize" => send(
            framing,
            &reply(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "mock-mcp-server", "version": "0.1.0"}
            })),
        ),
        "tools/list" => {
            let tools: Vec<Value> = options
                .tools
                .iter()
                .filter(|name| !name.is_empty())
                .map(|name| {
                    json!({
                        "name": name,
                        "description": format!("Mock tool {}", name),
                        "inputSchema": {
                            "type": "object",
                            "properties": {"msg": {"type": "string"}}
                        }
                    })
                })
                .collect();
            send(framing, &reply(json!({ "tools": tools })));
        }
        "tools/call" => match params["name"].as_str().unwrap_or("") {
            "echo" => {
                let msg = params["arguments"]["msg"].as_str().unwrap_or("").to_string();
                send(
                    framing,
                    &reply(json!({
                        "content": [{"type": "text", "text": msg}],
                        "received": params
                    })),
                );
            }
            "env" => {
                let name = params["arguments"]["name"].as_str().unwrap_or("");
                let value = std::env::var(name).unwrap_or_default();
                send(framing, &reply(json!({"content": [{"type": "text", "text": value}]})));
            }
            "crash" => std::process::exit(3),
            "hang" => {}
            // Never returns, so stdin is never read again.
            "stall" => loop {
                std::thread::sleep(Duration::from_secs(60));
            },
            other => send(
                framing,
                &json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32602, "message": format!("Unknown tool: {}", other)}
                }),
            ),
        },
        "shutdown" => send(framing, &reply(Value::Null)),
        _ => send(
            framing,
            &json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "Method not found"}
            }),
        ),
    }
}

#[cfg(unix)]
fn ignore_sigterm() {
    // SAFETY: installing SIG_IGN has no preconditions.
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_sigterm() {}

/// `eprintln!` panics once the reading end of stderr is gone, so a client
/// that stops draining the pipe takes the server down.
fn write_noisy_stderr() {
    let _ = std::io::stderr().write_all(b"\xff\xfe not utf-8\n");
    std::thread::sleep(Duration::from_millis(200));
    eprintln!("mock-mcp-server: still logging after a binary line");
}

fn main() {
    let options = Options::parse();
    let framing = Framing::from(options.framing);

    if options.ignore_sigterm {
        ignore_sigterm();
    }
    if options.noisy_stderr {
        write_noisy_stderr();
    }

    eprintln!("mock-mcp-server starting ({} framing)", framing);

    let mut decoder = FrameDecoder::new(framing);
    let mut stdin = std::io::stdin().lock();
    let mut chunk = [0u8; 4096];
    let mut seen_input = false;

    loop {
        let n = match stdin.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        if framing == Framing::Header && !seen_input {
            if let Some(&first) = chunk[..n].iter().find(|b| !b.is_ascii_whitespace()) {
                seen_input = true;
                if first == b'{' {
                    eprintln!("mock-mcp-server: expected Content-Length framing");
                    std::process::exit(2);
                }
            }
        }

        decoder.feed(&chunk[..n]);
        while let Some(frame) = decoder.next_frame() {
            match frame {
                Ok(message) => handle(&options, &message),
                Err(e) => eprintln!("mock-mcp-server: bad frame: {}", e),
            }
        }
    }

    if options.linger {
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    }
}
