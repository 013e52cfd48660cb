//! Watch body decoding: a byte stream of concatenated or newline-separated
//! JSON objects into typed frames.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::transport::KubeError;

/// One event delivered by a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub event_type: String,
    pub object: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchFrame {
    Event(WatchEvent),
    Bookmark,
    /// `ERROR` event or a bare `Status` object; the stream is finished.
    Error(Value),
}

struct DecodeState<S> {
    inner: S,
    buf: BytesMut,
    scan: FrameScanner,
    done: bool,
}

enum Scan {
    /// The first `n` bytes hold one complete object or array.
    Complete(usize),
    /// More input is needed.
    Partial,
    /// The next value is not an object or array; leave it to the parser.
    Other,
}

/// Tracks bracket depth across chunks so each byte is examined once while a
/// frame is still arriving.
#[derive(Debug, Default)]
struct FrameScanner {
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl FrameScanner {
    fn scan(&mut self, buf: &[u8]) -> Scan {
        for (i, &b) in buf.iter().enumerate().skip(self.pos) {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' if self.depth > 0 => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        *self = Self::default();
                        return Scan::Complete(i + 1);
                    }
                }
                _ if self.depth > 0 || b.is_ascii_whitespace() => {}
                _ => {
                    *self = Self::default();
                    return Scan::Other;
                }
            }
        }
        self.pos = buf.len();
        Scan::Partial
    }
}

/// Decode a raw watch body. The stream ends after the first error item.
pub fn decode_frames<S, E>(stream: S) -> impl Stream<Item = Result<WatchFrame, KubeError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: std::fmt::Display + Send,
{
    let state = DecodeState { inner: stream, buf: BytesMut::new(), scan: FrameScanner::default(), done: false };
    futures::stream::unfold(state, |mut st| async move {
        loop {
            if st.done && st.buf.is_empty() {
                return None;
            }
            match next_value(&mut st.buf, &mut st.scan) {
                Ok(Some(v)) => return Some((classify_frame(v), st)),
                Ok(None) => {}
                Err(e) => {
                    st.done = true;
                    st.buf.clear();
                    return Some((Err(e), st));
                }
            }
            if st.done {
                let truncated = !st.buf.iter().all(|b| b.is_ascii_whitespace());
                st.buf.clear();
                if truncated {
                    return Some((Err(KubeError::Decode("truncated watch frame".into())), st));
                }
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    st.done = true;
                    st.buf.clear();
                    return Some((Err(KubeError::Transport(e.to_string())), st));
                }
                None => st.done = true,
            }
        }
    })
}

// Pops one complete JSON value off the front of `buf`, if there is one.
fn next_value(buf: &mut BytesMut, scan: &mut FrameScanner) -> Result<Option<Value>, KubeError> {
    let end = match scan.scan(&buf[..]) {
        Scan::Partial => return Ok(None),
        Scan::Complete(n) => Some(n),
        Scan::Other => None,
    };
    let (value, used) = {
        let frame = match end {
            Some(n) => &buf[..n],
            None => &buf[..],
        };
        let mut it = serde_json::Deserializer::from_slice(frame).into_iter::<Value>();
        match it.next() {
            Some(Ok(v)) => (Some(v), it.byte_offset()),
            Some(Err(e)) if e.is_eof() && end.is_none() => (None, 0),
            Some(Err(e)) => return Err(KubeError::Decode(e.to_string())),
            None => (None, buf.len()),
        }
    };
    let _ = buf.split_to(used);
    Ok(value)
}

fn classify_frame(mut v: Value) -> Result<WatchFrame, KubeError> {
    let event_type = v.get("type").and_then(Value::as_str).map(str::to_string);
    match event_type.as_deref() {
        Some("BOOKMARK") => Ok(WatchFrame::Bookmark),
        Some("ERROR") => Ok(WatchFrame::Error(v.get_mut("object").map(Value::take).unwrap_or(Value::Null))),
        Some(t) if v.get("object").is_some() => {
            let object = v.get_mut("object").map(Value::take).unwrap_or(Value::Null);
            Ok(WatchFrame::Event(WatchEvent { event_type: t.to_string(), object }))
        }
        _ if v.get("kind").and_then(Value::as_str) == Some("Status") => Ok(WatchFrame::Error(v)),
        _ => Err(KubeError::Decode(format!("unexpected watch frame: {}", v))),
    }
}
