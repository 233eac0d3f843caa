//! Output scrubbing applied at ingestion.
//!
//! Removes bytes that would otherwise be echoed back into the shell by the
//! browser terminal: NUL padding, device-attribute replies (`ESC[?1;2c`,
//! `ESC[>0;276;0c`) and OSC 10/11 colour replies (`ESC]11;rgb:...`). tmux
//! emits these while a client attaches and they show up as garbage at the
//! prompt. The matching queries (`ESC[c`, `ESC[>c`, `ESC]11;?`) pass through.

use bytes::Bytes;
use regex::bytes::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

/// Longest trailing fragment held back waiting for the next chunk
const MAX_PENDING: usize = 64;

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"(?-u)\x00",
            r"|\x1b\[\?[0-9;]+c",
            r"|\x1b\[>[0-9]*;[0-9;]*c",
            r"|\x1b\]1[01];rgb:[0-9a-fA-F/]*(?:\x07|\x1b\\)",
        ))
        .expect("scrub pattern is valid")
    })
}

/// Per-terminal scrubber
///
/// A reply split across two reads is reassembled: a trailing fragment that
/// could still turn into one is kept and prefixed to the next chunk.
#[derive(Debug, Default)]
pub struct OutputScrubber {
    pending: Vec<u8>,
}

impl OutputScrubber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scrub(&mut self, chunk: Bytes) -> Bytes {
        let data = if self.pending.is_empty() {
            chunk
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(&chunk);
            Bytes::from(joined)
        };
        let split = partial_reply_start(&data).unwrap_or(data.len());
        self.pending.extend_from_slice(&data[split..]);
        scrub_complete(data.slice(..split))
    }

    /// Release the held-back fragment as is.
    pub fn flush(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.pending))
    }
}

fn scrub_complete(chunk: Bytes) -> Bytes {
    match pattern().replace_all(&chunk, &b""[..]) {
        Cow::Borrowed(_) => chunk,
        Cow::Owned(cleaned) => Bytes::from(cleaned),
    }
}

fn partial_reply_start(data: &[u8]) -> Option<usize> {
    let window = data.len().saturating_sub(MAX_PENDING);
    (window..data.len()).find(|&i| data[i] == 0x1b && is_reply_prefix(&data[i..]))
}

/// `tail` starts with ESC and is an unfinished reply.
fn is_reply_prefix(tail: &[u8]) -> bool {
    match tail {
        [0x1b] | [0x1b, b'['] => true,
        [0x1b, b'[', b'?' | b'>', params @ ..] => {
            params.iter().all(|b| b.is_ascii_digit() || *b == b';')
        }
        [0x1b, b']', body @ ..] => is_colour_reply_prefix(body),
        _ => false,
    }
}

fn is_colour_reply_prefix(body: &[u8]) -> bool {
    const HEADS: [&[u8]; 2] = [b"10;rgb:", b"11;rgb:"];
    let head_len = body.len().min(HEADS[0].len());
    let (head, spec) = body.split_at(head_len);
    if !HEADS.iter().any(|h| h.starts_with(head)) {
        return false;
    }
    let spec = spec.strip_suffix(b"\x1b").unwrap_or(spec);
    spec.iter().all(|b| b.is_ascii_hexdigit() || *b == b'/')
}
