use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// One inbound read from a peer's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line with its line ending removed. Never empty.
    Line(String),
    /// The peer sent more than the configured limit without a newline.
    TooLong,
    /// Orderly close: the stream hit EOF.
    Eof,
}

/// Splits a byte stream into newline-terminated lines of at most `limit`
/// bytes, not counting the `\n`.
///
/// Partial lines are kept in the reader between calls, so
/// [`next_frame`](Self::next_frame) can be raced in `select!` and dropped
/// without losing bytes.
pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    limit: usize,
    discarding: bool,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R, limit: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            limit,
            discarding: false,
        }
    }

    /// Reads the next non-blank line.
    ///
    /// Invalid UTF-8 is replaced rather than rejected. A trailing fragment
    /// before EOF still counts as a line; the following call returns
    /// [`Frame::Eof`]. After [`Frame::TooLong`] the rest of that line is
    /// skipped.
    pub async fn next_frame(&mut self) -> io::Result<Frame> {
        loop {
            // One byte past the limit tells an overlong line from one that fits exactly.
            let room = (self.limit + 1).saturating_sub(self.buf.len()) as u64;
            let bytes = (&mut self.reader)
                .take(room)
                .read_until(b'\n', &mut self.buf)
                .await?;
            let terminated = self.buf.last() == Some(&b'\n');

            if self.discarding {
                self.buf.clear();
                if bytes == 0 {
                    return Ok(Frame::Eof);
                }
                self.discarding = !terminated;
                continue;
            }

            if !terminated {
                if self.buf.len() > self.limit {
                    self.buf.clear();
                    self.discarding = true;
                    return Ok(Frame::TooLong);
                }
                if self.buf.is_empty() {
                    return Ok(Frame::Eof);
                }
            }

            let raw = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&raw);
            let trimmed = line.trim_end_matches(LINE_ENDINGS);
            if trimmed.is_empty() {
                continue;
            }

            return Ok(Frame::Line(trimmed.to_string()));
        }
    }
}

/// Writes `text` followed by a newline and flushes.
pub async fn write_line<W>(writer: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut encoded = Vec::with_capacity(text.len() + 1);
    encoded.extend_from_slice(text.trim_end_matches(LINE_ENDINGS).as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{io::BufReader, select, time::sleep};

    use super::*;

    async fn frames_from(input: &[u8], limit: usize) -> Vec<Frame> {
        let mut lines = LineReader::new(BufReader::new(input), limit);
        let mut frames = Vec::new();
        loop {
            let frame = lines.next_frame().await.expect("read frame");
            let done = matches!(frame, Frame::Eof | Frame::TooLong);
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    #[tokio::test]
    async fn coalesced_lines_are_split() {
        let frames = frames_from(b"A: hello\nA: second\r\n", 64).await;
        assert_eq!(
            frames,
            vec![
                Frame::Line("A: hello".into()),
                Frame::Line("A: second".into()),
                Frame::Eof,
            ]
        );
    }

    #[tokio::test]
    async fn blank_lines_are_skipped_and_trailing_fragment_is_kept() {
        let frames = frames_from(b"\n\r\nlast words", 64).await;
        assert_eq!(frames, vec![Frame::Line("last words".into()), Frame::Eof]);
    }

    #[tokio::test]
    async fn split_writes_are_reassembled() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut lines = LineReader::new(BufReader::new(server), 64);

        client.write_all(b"B: par").await.expect("first half");
        let pending = tokio::spawn(async move { lines.next_frame().await });
        client.write_all(b"tial\n").await.expect("second half");

        let frame = pending.await.expect("join").expect("read");
        assert_eq!(frame, Frame::Line("B: partial".into()));
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let frames = frames_from(b"0123456789abcdef\n", 8).await;
        assert_eq!(frames, vec![Frame::TooLong]);
    }

    #[tokio::test]
    async fn partial_line_survives_a_cancelled_read() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut lines = LineReader::new(BufReader::new(server), 64);

        client.write_all(b"B: par").await.expect("first half");
        select! {
            frame = lines.next_frame() => panic!("no full line yet, got {frame:?}"),
            _ = sleep(Duration::from_millis(50)) => {}
        }

        client.write_all(b"tial\n").await.expect("second half");
        let frame = lines.next_frame().await.expect("read");
        assert_eq!(frame, Frame::Line("B: partial".into()));
    }

    #[tokio::test]
    async fn line_exactly_at_limit_is_accepted() {
        let frames = frames_from(b"12345678\n", 8).await;
        assert_eq!(frames, vec![Frame::Line("12345678".into()), Frame::Eof]);
    }

    #[tokio::test]
    async fn unterminated_final_line_at_limit_is_delivered() {
        let frames = frames_from(b"12345678", 8).await;
        assert_eq!(frames, vec![Frame::Line("12345678".into()), Frame::Eof]);
    }

    #[tokio::test]
    async fn reading_resumes_after_an_oversized_line() {
        let mut lines = LineReader::new(BufReader::new(&b"0123456789abcdef\nok\n"[..]), 8);
        assert_eq!(lines.next_frame().await.expect("read"), Frame::TooLong);
        assert_eq!(
            lines.next_frame().await.expect("read"),
            Frame::Line("ok".into())
        );
        assert_eq!(lines.next_frame().await.expect("read"), Frame::Eof);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let frames = frames_from(b"caf\xff\n", 16).await;
        assert_eq!(frames[0], Frame::Line("caf\u{fffd}".into()));
    }

    #[tokio::test]
    async fn write_line_appends_a_single_newline() {
        let (mut writer, reader) = tokio::io::duplex(64);
        write_line(&mut writer, "C: hi\n").await.expect("write");
        drop(writer);

        let mut received = String::new();
        BufReader::new(reader)
            .read_to_string(&mut received)
            .await
            .expect("read back");
        assert_eq!(received, "C: hi\n");
    }
}
