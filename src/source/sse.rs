//! Incremental decoder for `text/event-stream` bodies.
//!
//! Bytes arrive in arbitrary chunks from the HTTP body. The decoder buffers
//! partial lines across chunks, applies the event-stream field rules, and
//! hands back every frame completed by the chunk.

use crate::pipeline::PipelineError;

/// Longest line accepted before the stream is treated as malformed.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// `event:` field, if the upstream named the event.
    pub event: Option<String>,
    /// Last `id:` field seen on the stream.
    pub id: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

impl Frame {
    /// Build an unnamed frame carrying `data`.
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct SseDecoder {
    line: Vec<u8>,
    max_line: usize,
    /// Set when the previous chunk ended on `\r`, so a leading `\n` is
    /// part of the same line terminator.
    pending_cr: bool,
    data: String,
    has_data: bool,
    event: Option<String>,
    last_id: Option<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that rejects lines longer than `max_line` bytes.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            line: Vec::new(),
            max_line,
            pending_cr: false,
            data: String::new(),
            has_data: false,
            event: None,
            last_id: None,
        }
    }

    /// Feed one body chunk, returning the frames it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, PipelineError> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }

            match byte {
                b'\n' => self.finish_line(&mut frames)?,
                b'\r' => {
                    self.pending_cr = true;
                    self.finish_line(&mut frames)?;
                }
                _ => {
                    if self.line.len() >= self.max_line {
                        return Err(PipelineError::MalformedPayload {
                            reason: format!(
                                "event stream line exceeds {} bytes",
                                self.max_line
                            ),
                        });
                    }
                    self.line.push(byte);
                }
            }
        }

        Ok(frames)
    }

    fn finish_line(&mut self, frames: &mut Vec<Frame>) -> Result<(), PipelineError> {
        let raw = std::mem::take(&mut self.line);

        if raw.is_empty() {
            if let Some(frame) = self.dispatch() {
                frames.push(frame);
            }
            return Ok(());
        }

        let line = String::from_utf8(raw).map_err(|e| PipelineError::MalformedPayload {
            reason: format!("event stream line is not UTF-8: {e}"),
        })?;

        // Comment / heartbeat.
        if line.starts_with(':') {
            return Ok(());
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };

        match field {
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.event = Some(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.last_id = Some(value.to_string());
                }
            }
            // `retry` only matters to reconnecting clients.
            _ => {}
        }

        Ok(())
    }

    fn dispatch(&mut self) -> Option<Frame> {
        let event = self.event.take();
        if !std::mem::take(&mut self.has_data) {
            return None;
        }

        Some(Frame {
            event: event.filter(|e| !e.is_empty()),
            id: self.last_id.clone().filter(|id| !id.is_empty()),
            data: std::mem::take(&mut self.data),
        })
    }
}
