//! SSE frame splitting shared by all stream paths.
//!
//! Frames are separated by either `\n\n` or `\r\n\r\n`; a partial frame at
//! the end of a read is held in the buffer until its separator arrives.

/// Incremental SSE frame splitter.
#[derive(Debug, Default)]
pub struct SseFrameBuffer {
    buffer: String,
}

impl SseFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete frame it unlocked, without
    /// their trailing separators. Invalid UTF-8 at a chunk boundary is
    /// replaced; upstream SSE is ASCII-framed so separators survive.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        loop {
            let lf = self.buffer.find("\n\n");
            let crlf = self.buffer.find("\r\n\r\n");

            let (index, len) = match (lf, crlf) {
                (Some(l), Some(c)) if c < l => (c, 4),
                (Some(l), _) => (l, 2),
                (None, Some(c)) => (c, 4),
                (None, None) => break,
            };

            let frame = self.buffer[..index].to_string();
            self.buffer.drain(..index + len);
            frames.push(frame);
        }
        frames
    }

    /// Drain whatever is left after the upstream stream ends.
    pub fn take_remaining(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let trimmed = rest.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Extract the payloads of every `data:` line in a frame, normalizing CRLF.
pub fn data_lines(frame: &str) -> Vec<&str> {
    frame
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|payload| payload.strip_prefix(' ').unwrap_or(payload))
        .collect()
}

/// Extract the `event:` name of a frame, when present.
pub fn event_name(frame: &str) -> Option<&str> {
    frame
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .find_map(|line| line.strip_prefix("event:"))
        .map(|name| name.trim())
}

/// Format an outbound OpenAI-shaped SSE frame.
pub fn format_data_frame(payload: &str) -> Vec<u8> {
    format!("data: {}\n\n", payload).into_bytes()
}

/// The canonical terminator on the OpenAI-shaped side.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";
