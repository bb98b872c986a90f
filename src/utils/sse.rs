use futures_util::stream::{self, BoxStream};
use futures_util::TryStreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::{GatewayError, Result};

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

async fn next_line<R>(reader: &mut R, out: &mut Vec<u8>, max_bytes: usize) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    out.clear();
    loop {
        let buf = reader
            .fill_buf()
            .await
            .map_err(|err| GatewayError::Internal(format!("failed to read event stream: {err}")))?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }

        let newline = buf.iter().position(|byte| *byte == b'\n');
        let take = newline.map(|pos| pos + 1).unwrap_or(buf.len());
        if out.len().saturating_add(take) > max_bytes {
            return Err(GatewayError::Internal(format!(
                "event stream line exceeds {max_bytes} bytes"
            )));
        }

        out.extend_from_slice(&buf[..take]);
        reader.consume(take);
        if newline.is_some() {
            return Ok(true);
        }
    }
}

/// Reads the next complete SSE event and returns its joined `data:` payload.
/// Returns `None` at end of stream or on the `[DONE]` sentinel.
async fn next_event<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    event: &mut String,
    limits: SseLimits,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    event.clear();

    loop {
        if !next_line(reader, line, limits.max_line_bytes).await? {
            if event.is_empty() {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(event)));
        }

        let text = std::str::from_utf8(line)
            .map_err(|err| GatewayError::Internal(format!("event stream is not UTF-8: {err}")))?;
        let text = text.trim_end_matches(['\r', '\n']);

        if text.is_empty() {
            if event.is_empty() {
                continue;
            }
            if event == "[DONE]" {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(event)));
        }

        let Some(data) = text.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim_start();

        let separator = usize::from(!event.is_empty());
        if event.len().saturating_add(separator).saturating_add(data.len()) > limits.max_event_bytes
        {
            return Err(GatewayError::Internal(format!(
                "event stream event exceeds {} bytes",
                limits.max_event_bytes
            )));
        }
        if separator == 1 {
            event.push('\n');
        }
        event.push_str(data);
    }
}

pub fn sse_data_stream_from_reader<R>(reader: R, limits: SseLimits) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        (reader, Vec::<u8>::new(), String::new(), limits),
        |(mut reader, mut line, mut event, limits)| async move {
            match next_event(&mut reader, &mut line, &mut event, limits).await? {
                Some(data) => Ok(Some((data, (reader, line, event, limits)))),
                None => Ok(None),
            }
        },
    ))
}

pub fn sse_data_stream(response: reqwest::Response) -> BoxStream<'static, Result<String>> {
    let bytes = response.bytes_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(bytes);
    sse_data_stream_from_reader(tokio::io::BufReader::new(reader), SseLimits::default())
}
