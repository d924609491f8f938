//! JSON output for CLI commands
//!
//! - One JSON object per command on stdout
//! - `{"status": "ok", "data": ...}` or `{"status": "error", "code", "message"}`

use std::io::{self, Write};

use serde_json::{json, Value};

use super::errors::CliResult;

/// Build the success envelope.
pub fn response_envelope(data: Value) -> Value {
    json!({
        "status": "ok",
        "data": data
    })
}

/// Build the error envelope.
pub fn error_envelope(code: &str, message: &str) -> Value {
    json!({
        "status": "error",
        "code": code,
        "message": message
    })
}

fn write_line(value: &Value) -> CliResult<()> {
    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    write_line(&response_envelope(data))
}

/// Write an error response to stdout
pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    write_line(&error_envelope(code, message))
}
