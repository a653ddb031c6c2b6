/// Splits a byte stream into newline-terminated frames.
///
/// Bytes after the last newline stay buffered until the rest of the frame
/// arrives. Frames are decoded lossily as UTF-8 with the line ending trimmed.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\n', '\r']);
            if !text.trim().is_empty() {
                frames.push(text.to_string());
            }
        }
        frames
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}
