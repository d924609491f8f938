//! Incremental splitter for a streamed JSON array
//!
//! Bytes arrive in arbitrary chunks. Everything before the first `[` that
//! is outside a string is skipped, so both a bare array and an object such
//! as `{"results": [...], "last_seq": 9}` yield the array's elements. Each
//! element is handed out as soon as it closes; anything after the closing
//! `]` is ignored.
//!
//! Only the bytes of the element being scanned are buffered.

use serde_json::Value;

use super::errors::{ReplicationError, ReplicationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    BeforeArray,
    Between,
    InElement,
    AfterArray,
}

/// Splits a byte stream containing a JSON array into its elements.
#[derive(Debug)]
pub struct JsonArrayStream {
    buffer: Vec<u8>,
    phase: Phase,
    scanned: usize,
    element_start: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Default for JsonArrayStream {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonArrayStream {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            phase: Phase::BeforeArray,
            scanned: 0,
            element_start: 0,
            depth: 0,
            in_string: false,
            escaped: false,
        }
    }

    /// True once the opening `[` has been seen.
    pub fn has_started(&self) -> bool {
        self.phase != Phase::BeforeArray
    }

    /// True once the closing `]` has been seen.
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::AfterArray
    }

    /// Consume a chunk and return the elements it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> ReplicationResult<Vec<Value>> {
        if self.is_finished() {
            return Ok(Vec::new());
        }
        self.buffer.extend_from_slice(chunk);

        let mut elements = Vec::new();
        while self.scanned < self.buffer.len() && !self.is_finished() {
            let byte = self.buffer[self.scanned];
            let position = self.scanned;
            self.scanned += 1;

            match self.phase {
                Phase::BeforeArray => {
                    if self.step_string(byte) {
                        continue;
                    }
                    if byte == b'[' {
                        self.phase = Phase::Between;
                    }
                }
                Phase::Between => match byte {
                    b' ' | b'\t' | b'\r' | b'\n' | b',' => {}
                    b']' => self.phase = Phase::AfterArray,
                    _ => {
                        self.phase = Phase::InElement;
                        self.element_start = position;
                        self.depth = 0;
                        self.scanned = position;
                    }
                },
                Phase::InElement => {
                    if self.step_string(byte) {
                        continue;
                    }
                    match byte {
                        b'{' | b'[' => self.depth += 1,
                        b'}' | b']' if self.depth == 0 => {
                            // Closing bracket of the array ends a scalar element.
                            elements.push(self.parse_element(position)?);
                            self.phase = Phase::AfterArray;
                        }
                        b'}' | b']' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                elements.push(self.parse_element(position + 1)?);
                                self.phase = Phase::Between;
                            }
                        }
                        b',' if self.depth == 0 => {
                            elements.push(self.parse_element(position)?);
                            self.phase = Phase::Between;
                        }
                        _ => {}
                    }
                }
                Phase::AfterArray => {}
            }
        }

        self.compact();
        Ok(elements)
    }

    /// Track string state; returns true if `byte` was inside a string
    /// literal or opened one.
    fn step_string(&mut self, byte: u8) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
            return true;
        }
        if byte == b'"' {
            self.in_string = true;
            return true;
        }
        false
    }

    fn parse_element(&self, end: usize) -> ReplicationResult<Value> {
        let slice = &self.buffer[self.element_start..end];
        serde_json::from_slice(slice)
            .map_err(|e| ReplicationError::malformed(format!("invalid JSON in change feed: {}", e)))
    }

    /// Drop bytes no longer needed.
    fn compact(&mut self) {
        let keep_from = match self.phase {
            Phase::InElement => self.element_start,
            _ => self.scanned,
        };
        if keep_from == 0 {
            return;
        }
        self.buffer.drain(..keep_from);
        self.scanned -= keep_from;
        if self.phase == Phase::InElement {
            self.element_start = 0;
        }
    }
}
