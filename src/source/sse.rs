use bytes::{Buf, BytesMut};

/// Incremental `text/event-stream` decoder. Yields the joined `data:` payload of each
/// complete event; comments, `event:`/`id:`/`retry:` fields and empty events are skipped.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: BytesMut,
    data: Vec<u8>,
    has_data: bool,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.is_empty() {
                if self.has_data {
                    payloads.push(std::mem::take(&mut self.data));
                    self.has_data = false;
                }
                continue;
            }
            if line[0] == b':' {
                continue;
            }

            let (field, mut value) = match line.iter().position(|b| *b == b':') {
                Some(colon) => {
                    let mut value = line.split_off(colon);
                    value.advance(1);
                    (line, value)
                }
                None => (line, BytesMut::new()),
            };
            if value.first() == Some(&b' ') {
                value.advance(1);
            }
            if &field[..] == b"data" {
                if self.has_data {
                    self.data.push(b'\n');
                }
                self.data.extend_from_slice(&value);
                self.has_data = true;
            }
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let out = decoder.push(b":1}\n\ndata: second\n\n");
        assert_eq!(out, vec![b"{\"a\":1}".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn joins_multiline_data_and_skips_comments() {
        let mut decoder = SseDecoder::new();
        let out = decoder.push(b": keepalive\r\nevent: update\r\ndata: one\r\ndata:two\r\n\r\n\r\n");
        assert_eq!(out, vec![b"one\ntwo".to_vec()]);
    }
}
