//! Demo calculator tool provider speaking newline-delimited JSON-RPC over
//! stdio.
//!
//! Besides arithmetic it exposes `crash` (exits the process) and `sleep`
//! (delays its reply), which make restart and timeout behavior observable.
//! If `CALC_PROVIDER_GATE` names a path, `initialize` is refused until that
//! file exists.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

fn main() -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                eprintln!("calc-provider: bad frame: {err}");
                continue;
            }
        };
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let reply = match handle(method, &params) {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message}
            }),
        };
        serde_json::to_writer(&mut stdout, &reply)?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
    }
    Ok(())
}

fn handle(method: &str, params: &Value) -> Result<Value, (i32, String)> {
    match method {
        "initialize" => {
            if let Ok(gate) = std::env::var("CALC_PROVIDER_GATE") {
                if !Path::new(&gate).exists() {
                    return Err((-32000, "not ready".to_string()));
                }
            }
            Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "calc-provider", "version": env!("CARGO_PKG_VERSION")}
            }))
        }
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({"tools": catalog()})),
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            // Accept arguments either flat or nested under `input`.
            let arguments = match arguments.get("input") {
                Some(input) if input.is_object() => input.clone(),
                _ => arguments,
            };
            Ok(match call(name, &arguments) {
                Ok(text) => json!({"content": [{"type": "text", "text": text}], "isError": false}),
                Err(text) => json!({"content": [{"type": "text", "text": text}], "isError": true}),
            })
        }
        other => Err((-32601, format!("method not found: {other}"))),
    }
}

fn binary(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        }
    })
}

fn catalog() -> Vec<Value> {
    vec![
        binary("add", "Add two numbers"),
        binary("subtract", "Subtract b from a"),
        binary("multiply", "Multiply two numbers"),
        binary("divide", "Divide a by b"),
        json!({
            "name": "strings_to_chars_to_int",
            "description": "ASCII codes of the characters in a string",
            "inputSchema": {"type": "object", "properties": {"string": {"type": "string"}}}
        }),
        json!({
            "name": "int_list_to_exponential_sum",
            "description": "Sum of e raised to each integer",
            "inputSchema": {"type": "object", "properties": {"int_list": {"type": "array"}}}
        }),
        json!({
            "name": "sleep",
            "description": "Wait for the given number of milliseconds",
            "inputSchema": {"type": "object", "properties": {"ms": {"type": "integer"}}}
        }),
        json!({
            "name": "crash",
            "description": "Exit the provider process",
            "inputSchema": {"type": "object"}
        }),
    ]
}

fn number(arguments: &Value, key: &str) -> Result<f64, String> {
    arguments
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("missing numeric argument: {key}"))
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn call(name: &str, arguments: &Value) -> Result<String, String> {
    match name {
        "add" => Ok(format_number(number(arguments, "a")? + number(arguments, "b")?)),
        "subtract" => Ok(format_number(number(arguments, "a")? - number(arguments, "b")?)),
        "multiply" => Ok(format_number(number(arguments, "a")? * number(arguments, "b")?)),
        "divide" => {
            let b = number(arguments, "b")?;
            if b == 0.0 {
                return Err("division by zero".to_string());
            }
            Ok(format_number(number(arguments, "a")? / b))
        }
        "strings_to_chars_to_int" => {
            let text = arguments
                .get("string")
                .and_then(Value::as_str)
                .ok_or("missing string argument: string")?;
            Ok(Value::from(text.chars().map(|c| c as u32).collect::<Vec<_>>()).to_string())
        }
        "int_list_to_exponential_sum" => {
            let list = arguments
                .get("int_list")
                .and_then(Value::as_array)
                .ok_or("missing list argument: int_list")?;
            let sum: f64 = list.iter().filter_map(Value::as_f64).map(f64::exp).sum();
            Ok(sum.to_string())
        }
        "sleep" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
            thread::sleep(Duration::from_millis(ms));
            Ok("slept".to_string())
        }
        "crash" => std::process::exit(3),
        other => Err(format!("unknown tool: {other}")),
    }
}
