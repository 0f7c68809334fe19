//! Demo Echo: minimal Keel extension.
//!
//! Build with: `cargo build --target wasm32-unknown-unknown --release`
//! Then copy `target/wasm32-unknown-unknown/release/demo_echo.wasm` next to
//! `extension.toml` and run `keel ext install .`.

use serde_json::{Value, json};
use std::alloc::{Layout, alloc};

/// Allocate memory in the guest for the host to write into.
#[unsafe(no_mangle)]
pub extern "C" fn keel_malloc(size: u32) -> u32 {
    match Layout::from_size_align(size as usize, 1) {
        Ok(layout) => unsafe { alloc(layout) as u32 },
        Err(_) => 0,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn keel_name() -> u64 {
    write_json(&json!("demo"))
}

/// Declare what the host should register on our behalf.
#[unsafe(no_mangle)]
pub extern "C" fn keel_activate() -> u64 {
    write_json(&json!({
        "commands": [
            { "name": "demo-echo", "description": "Echo arguments back" }
        ],
        "hooks": []
    }))
}

/// Returns a packed u64: (result_ptr << 32) | result_len
#[unsafe(no_mangle)]
pub extern "C" fn keel_invoke(ptr: u32, len: u32) -> u64 {
    let input_bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, len as usize) };
    let input: Value = match serde_json::from_slice(input_bytes) {
        Ok(v) => v,
        Err(e) => return write_json(&json!({ "error": format!("bad input: {e}") })),
    };

    let result = match input["command"].as_str().unwrap_or("") {
        "demo-echo" => {
            let words: Vec<&str> = input["args"]
                .as_array()
                .map(|args| args.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            json!({ "result": words.join(" "), "data": { "count": words.len() } })
        }
        other => json!({ "error": format!("unknown command: {other}") }),
    };
    write_json(&result)
}

fn write_json(value: &Value) -> u64 {
    let json = value.to_string();
    let bytes = json.as_bytes();
    let Ok(layout) = Layout::from_size_align(bytes.len().max(1), 1) else {
        return 0;
    };
    let ptr = unsafe { alloc(layout) };
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
    ((ptr as u64) << 32) | (bytes.len() as u64)
}
