use serde::Deserialize;

use relay_core::GenerationError;

/// One server-sent event: optional `event:` name plus its joined `data:` lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// What a single upstream `data:` payload means for the fragment stream.
#[derive(Debug)]
pub enum ChunkDelta {
    Text(String),
    /// Role-only or empty deltas, usage frames, keep-alives.
    Skip,
    Done,
    Error(GenerationError),
}

/// Parse raw SSE text into frames. Comment lines (`:`) are ignored and
/// multi-line `data:` values are joined with `\n`.
pub fn parse_sse_lines(raw: &str) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    let mut event: Option<String> = None;
    let mut data: Vec<String> = Vec::new();

    let mut flush = |event: &mut Option<String>, data: &mut Vec<String>| {
        if !data.is_empty() || event.is_some() {
            frames.push(SseFrame {
                event: event.take(),
                data: data.join("\n"),
            });
            data.clear();
        }
    };

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            flush(&mut event, &mut data);
        } else if line.starts_with(':') {
            continue;
        } else if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }

    // Trailing frame without a blank line
    flush(&mut event, &mut data);
    frames
}

/// Interpret one `chat.completion.chunk` payload.
pub fn parse_chunk(data: &str) -> ChunkDelta {
    let data = data.trim();
    if data == "[DONE]" {
        return ChunkDelta::Done;
    }
    if data.is_empty() {
        return ChunkDelta::Skip;
    }

    let chunk: ChunkPayload = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            return ChunkDelta::Error(GenerationError::StreamInterrupted(format!(
                "malformed chunk: {e}"
            )))
        }
    };

    if let Some(err) = chunk.error {
        return ChunkDelta::Error(GenerationError::Engine(err.message));
    }

    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|t| !t.is_empty())
        .map(ChunkDelta::Text)
        .unwrap_or(ChunkDelta::Skip)
}

// --- Deserialization types for OpenAI-style chunks ---

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ChunkError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDeltaPayload,
}

#[derive(Default, Deserialize)]
struct ChunkDeltaPayload {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkError {
    message: String,
}
