//! Plain-text streaming of model output.
//!
//! Converts a stream of response chunks into the byte stream written to the
//! HTTP body: every chunk with text becomes `"<text> "`, chunks without text
//! are skipped, and an upstream failure after the response has started is
//! written as a final `❗ Server error: ...` frame.

use std::convert::Infallible;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use tracing::{info, warn};

use crate::error::server_error_text;
use crate::genai::client::ChunkStream;

/// Render one chunk's text as it appears in the body.
pub fn fragment(text: &str) -> Bytes {
    let mut out = String::with_capacity(text.len() + 1);
    out.push_str(text);
    out.push(' ');
    Bytes::from(out)
}

/// Convert an upstream chunk stream into body frames.
///
/// The returned stream ends after the upstream ends or after the first
/// upstream error, whichever comes first.
pub fn chunks_to_text_stream(
    chunks: ChunkStream,
    request_id: String,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    stream::unfold(Some((chunks, 0usize)), move |state| {
        let request_id = request_id.clone();
        async move {
            let (mut chunks, mut emitted) = state?;
            loop {
                match chunks.next().await {
                    Some(Ok(chunk)) => {
                        // Chunks with no text (usage-only, finish markers) are skipped.
                        if let Some(text) = chunk.text() {
                            emitted += 1;
                            return Some((Ok(fragment(&text)), Some((chunks, emitted))));
                        }
                    }
                    Some(Err(e)) => {
                        warn!(request_id, fragments = emitted, error = %e, "Upstream stream failed");
                        return Some((Ok(Bytes::from(server_error_text(&e))), None));
                    }
                    None => {
                        info!(request_id, fragments = emitted, "Generation complete");
                        return None;
                    }
                }
            }
        }
    })
}
