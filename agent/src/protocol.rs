/// Framing for the virtio serial port channel.
///
/// The sender writes a version header once when the port is opened, then one
/// JSON object per change, each terminated by [`MSG_DELIMITER`]. Writes are
/// split into [`CHUNK_SIZE`] pieces because the port drops oversized writes.
/// A stream without a header is the version 1 protocol, where every read is
/// one whole message.
use serde::{Deserialize, Serialize};

use crate::event::ChangeEvent;

pub const PROTO_VERSION: u32 = 2;
pub const HEADER_PREFIX: &str = ":FC_PR:";
pub const MSG_DELIMITER: &str = ":FC_MSG_END_DATA:";
pub const CHUNK_SIZE: usize = 2048;

/// One change as it travels over the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub ns: String,
    pub data: String,
}

/// Header written once per opened stream, e.g. `:FC_PR:2:`.
pub fn header() -> String {
    format!("{HEADER_PREFIX}{PROTO_VERSION}:")
}

/// Serializes `event` as a delimited frame.
pub fn encode(event: &ChangeEvent) -> serde_json::Result<Vec<u8>> {
    let message = WireMessage {
        ns: event.namespace().as_str().to_string(),
        data: event.payload().to_string(),
    };
    let mut frame = serde_json::to_vec(&message)?;
    frame.extend_from_slice(MSG_DELIMITER.as_bytes());
    Ok(frame)
}

/// Incremental decoder for the receiving side.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    version: Option<u32>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protocol version detected so far, if any data has been seen.
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// Feeds raw bytes and returns every complete message now available.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        if self.version.is_none() && !self.detect_version() {
            return Vec::new();
        }

        match self.version {
            Some(1) => {
                let data = std::mem::take(&mut self.buffer);
                if data.is_empty() {
                    Vec::new()
                } else {
                    vec![String::from_utf8_lossy(&data).into_owned()]
                }
            }
            _ => self.split_frames(),
        }
    }

    /// Returns false while the buffer is too short to tell.
    fn detect_version(&mut self) -> bool {
        let prefix = HEADER_PREFIX.as_bytes();
        if self.buffer.len() < prefix.len() {
            if prefix.starts_with(&self.buffer) {
                return false;
            }
            self.version = Some(1);
            return true;
        }
        if !self.buffer.starts_with(prefix) {
            self.version = Some(1);
            return true;
        }

        let rest = &self.buffer[prefix.len()..];
        let Some(end) = rest.iter().position(|b| *b == b':') else {
            return false;
        };
        let version = std::str::from_utf8(&rest[..end])
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(PROTO_VERSION);
        tracing::debug!(version, "stream protocol detected");
        self.version = Some(version);
        self.buffer.drain(..prefix.len() + end + 1);
        true
    }

    fn split_frames(&mut self) -> Vec<String> {
        let delim = MSG_DELIMITER.as_bytes();
        let prefix = HEADER_PREFIX.as_bytes();
        let mut messages = Vec::new();
        loop {
            let frame_end = find(&self.buffer, delim);

            // A sender that reopened the port starts over with a new header.
            // Whatever precedes it is the tail of an abandoned write.
            if let Some(start) = find(&self.buffer, prefix) {
                if frame_end.map_or(true, |end| start < end) {
                    let rest = &self.buffer[start + prefix.len()..];
                    let Some(colon) = rest.iter().position(|b| *b == b':') else {
                        break;
                    };
                    if start > 0 {
                        tracing::warn!(discarded = start, "stream restarted mid-frame");
                    }
                    self.buffer.drain(..start + prefix.len() + colon + 1);
                    continue;
                }
            }

            let Some(pos) = frame_end else {
                break;
            };
            let frame: Vec<u8> = self.buffer.drain(..pos + delim.len()).take(pos).collect();
            if !frame.is_empty() {
                messages.push(String::from_utf8_lossy(&frame).into_owned());
            }
        }
        messages
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Namespace;

    #[test]
    fn header_carries_version() {
        assert_eq!(header(), ":FC_PR:2:");
    }

    #[test]
    fn encode_wraps_namespace_and_payload() {
        let event = ChangeEvent::new(Namespace::OnlineAccounts, "{}");
        let frame = encode(&event).unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert!(text.ends_with(MSG_DELIMITER));
        let json = text.trim_end_matches(MSG_DELIMITER);
        let msg: WireMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.ns, "org.gnome.online-accounts");
        assert_eq!(msg.data, "{}");
    }

    #[test]
    fn decoder_reads_framed_stream() {
        let mut dec = StreamDecoder::new();
        let mut stream = header().into_bytes();
        stream.extend(encode(&ChangeEvent::new(Namespace::Firefox, "a")).unwrap());
        stream.extend(encode(&ChangeEvent::new(Namespace::Firefox, "b")).unwrap());
        let msgs = dec.feed(&stream);
        assert_eq!(dec.version(), Some(2));
        assert_eq!(msgs.len(), 2);
        let first: WireMessage = serde_json::from_str(&msgs[0]).unwrap();
        assert_eq!(first.data, "a");
    }

    #[test]
    fn decoder_buffers_partial_frames_across_chunks() {
        let mut dec = StreamDecoder::new();
        let mut stream = header().into_bytes();
        stream.extend(encode(&ChangeEvent::new(Namespace::Firefox, "x".repeat(5000))).unwrap());

        let mut out = Vec::new();
        for chunk in stream.chunks(7) {
            out.extend(dec.feed(chunk));
        }
        assert_eq!(out.len(), 1);
        let msg: WireMessage = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(msg.data.len(), 5000);
    }

    #[test]
    fn decoder_resyncs_on_header_after_partial_frame() {
        let frame = encode(&ChangeEvent::new(Namespace::Firefox, r#"{"key":"k"}"#)).unwrap();
        let mut stream = header().into_bytes();
        stream.extend_from_slice(&frame[..10]);
        stream.extend(header().into_bytes());
        stream.extend_from_slice(&frame);

        let mut dec = StreamDecoder::new();
        let msgs = dec.feed(&stream);
        assert_eq!(msgs.len(), 1);
        let msg: WireMessage = serde_json::from_str(&msgs[0]).unwrap();
        assert_eq!(msg.ns, "org.mozilla.firefox");
        assert_eq!(msg.data, r#"{"key":"k"}"#);
    }

    #[test]
    fn decoder_resyncs_when_restart_arrives_in_pieces() {
        let frame = encode(&ChangeEvent::new(Namespace::Firefox, "retried")).unwrap();
        let mut stream = header().into_bytes();
        stream.extend_from_slice(&frame[..5]);
        stream.extend(header().into_bytes());
        stream.extend_from_slice(&frame);

        let mut dec = StreamDecoder::new();
        let mut out = Vec::new();
        for chunk in stream.chunks(3) {
            out.extend(dec.feed(chunk));
        }
        assert_eq!(out.len(), 1);
        let msg: WireMessage = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(msg.data, "retried");
    }

    #[test]
    fn decoder_waits_for_complete_header() {
        let mut dec = StreamDecoder::new();
        assert!(dec.feed(b":FC_").is_empty());
        assert_eq!(dec.version(), None);
        assert!(dec.feed(b"PR:2").is_empty());
        assert_eq!(dec.version(), None);
        assert!(dec.feed(b":").is_empty());
        assert_eq!(dec.version(), Some(2));
    }

    #[test]
    fn decoder_without_header_is_version_one() {
        let mut dec = StreamDecoder::new();
        let msgs = dec.feed(br#"{"ns":"org.mozilla.firefox","data":"{}"}"#);
        assert_eq!(dec.version(), Some(1));
        assert_eq!(msgs.len(), 1);
        assert_eq!(dec.feed(b"second").len(), 1);
    }

    #[test]
    fn decoder_skips_empty_frames() {
        let mut dec = StreamDecoder::new();
        let mut stream = header().into_bytes();
        stream.extend_from_slice(MSG_DELIMITER.as_bytes());
        stream.extend_from_slice(b"m");
        stream.extend_from_slice(MSG_DELIMITER.as_bytes());
        assert_eq!(dec.feed(&stream), vec!["m".to_string()]);
    }
}
