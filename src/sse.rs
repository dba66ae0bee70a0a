//! Incremental decoder for `data: {json}` event streams.

/// Decodes a server-sent-events-style body into JSON event payloads.
///
/// Bytes arrive in arbitrary chunk boundaries: a single event may span
/// several chunks and one chunk may carry several events. Only complete
/// lines (terminated by `\n`) are parsed; a partial trailing line is
/// carried over to the next [`feed`](SseDecoder::feed) call. Lines without
/// a `data:` prefix (comments, keep-alives, blank separators) are ignored.
///
/// The literal `data: [DONE]` line marks the end of the stream: leftover
/// buffered bytes are discarded and every later chunk is ignored. Closing
/// the underlying connection is the caller's business.
///
/// One decoder instance serves exactly one response body.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consumes one chunk and returns the payload of every complete
    /// `data:` line it unlocked, in arrival order.
    ///
    /// Malformed JSON on a `data:` line is a hard error; the sentinel is
    /// the only non-JSON payload accepted.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<serde_json::Value>, serde_json::Error> {
        let mut events = Vec::new();
        if self.done {
            log::debug!("ignoring {} bytes after stream sentinel", chunk.len());
            return Ok(events);
        }
        self.buffer.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..].iter().position(|&b| b == b'\n') {
            let line_end = consumed + offset;
            let line = self.buffer[consumed..line_end].trim_ascii();
            consumed = line_end + 1;

            let Some(data) = line.strip_prefix(b"data:") else {
                continue;
            };
            let data = data.trim_ascii();
            if data == b"[DONE]" {
                log::debug!("stream finished with [DONE]");
                self.done = true;
                self.buffer.clear();
                return Ok(events);
            }
            events.push(serde_json::from_slice(data)?);
        }
        self.buffer.drain(..consumed);
        Ok(events)
    }
}
