//! Newline-framed channel over async byte streams

use crate::ProtocolError;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Maximum line length before the reader splits a line (1MB)
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Type-erased read half used once a stream has been handed to a session
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased write half used once a stream has been handed to a session
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reading side of the line channel
pub struct LineReader<R> {
    /// Underlying byte stream
    reader: R,
    /// Bytes received but not yet returned as a line
    read_buf: BytesMut,
    /// Longest line returned before a forced split
    max_line_length: usize,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a new line reader with the default line limit
    pub fn new(reader: R) -> Self {
        Self::with_max_line_length(reader, MAX_LINE_LENGTH)
    }

    /// Create a new line reader with a custom line limit
    pub fn with_max_line_length(reader: R, max_line_length: usize) -> Self {
        Self {
            reader,
            read_buf: BytesMut::with_capacity(8192),
            max_line_length: max_line_length.max(1),
        }
    }

    /// Wait for the next complete line.
    ///
    /// Leading and trailing whitespace is trimmed. End of stream and I/O
    /// failures both surface as [`ProtocolError::ConnectionLost`], including
    /// an end of stream in the middle of a line.
    ///
    /// This method is cancel safe: dropping the future never loses bytes,
    /// which lets callers race it against a cancellation token.
    pub async fn receive_line(&mut self) -> Result<String, ProtocolError> {
        loop {
            if let Some(line) = self.try_decode_line() {
                return Ok(line);
            }

            self.read_buf.reserve(8192);
            let n = self
                .reader
                .read_buf(&mut self.read_buf)
                .await
                .map_err(ProtocolError::lost)?;

            if n == 0 {
                return Err(ProtocolError::ConnectionLost(
                    "peer closed the connection".to_string(),
                ));
            }
        }
    }

    /// Try to take one line out of the internal buffer.
    ///
    /// A line longer than the limit comes out in pieces of at most the
    /// limit, cut on character boundaries.
    pub fn try_decode_line(&mut self) -> Option<String> {
        let window = self.read_buf.len().min(self.max_line_length + 1);
        let raw = match self.read_buf[..window].iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let mut raw = self.read_buf.split_to(pos + 1);
                raw.truncate(pos);
                raw
            }
            None if self.read_buf.len() > self.max_line_length => {
                let at = split_point(&self.read_buf, self.max_line_length);
                self.read_buf.split_to(at)
            }
            None => return None,
        };

        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }

    /// Number of buffered bytes not yet returned
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }
}

/// Where to cut an overlong line: at most `max` bytes, without splitting a
/// UTF-8 sequence. Moves past `max` only if a single sequence is longer.
fn split_point(buf: &[u8], max: usize) -> usize {
    let is_continuation = |b: u8| b & 0b1100_0000 == 0b1000_0000;
    let mut at = max;
    while at > 0 && at < buf.len() && is_continuation(buf[at]) {
        at -= 1;
    }
    if at == 0 {
        at = max;
        while at < buf.len() && is_continuation(buf[at]) {
            at += 1;
        }
    }
    at
}

/// Writing side of the line channel
pub struct LineWriter<W> {
    writer: W,
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Create a new line writer
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one line followed by a newline and flush it immediately
    pub async fn send_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        if line.contains('\n') {
            return Err(ProtocolError::EmbeddedNewline);
        }

        let mut buf = BytesMut::with_capacity(line.len() + 1);
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');

        self.writer.write_all(&buf).await.map_err(ProtocolError::lost)?;
        self.writer.flush().await.map_err(ProtocolError::lost)?;
        Ok(())
    }

    /// Shut down the write direction of the stream
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.writer.shutdown().await.map_err(ProtocolError::lost)
    }
}

/// Split a duplex stream into a line reader and a line writer
pub fn split<S>(stream: S, max_line_length: usize) -> (LineReader<ReadHalf<S>>, LineWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        LineReader::with_max_line_length(read_half, max_line_length),
        LineWriter::new(write_half),
    )
}

/// Split a duplex stream into type-erased halves
pub fn split_boxed<S>(stream: S, max_line_length: usize) -> (LineReader<BoxedReader>, LineWriter<BoxedWriter>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        LineReader::with_max_line_length(Box::new(read_half) as BoxedReader, max_line_length),
        LineWriter::new(Box::new(write_half) as BoxedWriter),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_receive_lines_in_order() {
        let mock = Builder::new().read(b"PING\nexit\n").build();
        let mut reader = LineReader::new(mock);

        assert_eq!(reader.receive_line().await.unwrap(), "PING");
        assert_eq!(reader.receive_line().await.unwrap(), "exit");
    }

    #[tokio::test]
    async fn test_receive_line_trims_whitespace() {
        let mock = Builder::new().read(b"  ls -la \r\n").build();
        let mut reader = LineReader::new(mock);

        assert_eq!(reader.receive_line().await.unwrap(), "ls -la");
    }

    #[tokio::test]
    async fn test_line_split_across_reads() {
        let mock = Builder::new().read(b"ec").read(b"ho h").read(b"i\n").build();
        let mut reader = LineReader::new(mock);

        assert_eq!(reader.receive_line().await.unwrap(), "echo hi");
        assert_eq!(reader.buffer_size(), 0);
    }

    #[tokio::test]
    async fn test_end_of_stream_is_connection_lost() {
        let mock = Builder::new().read(b"PONG\n").build();
        let mut reader = LineReader::new(mock);

        assert_eq!(reader.receive_line().await.unwrap(), "PONG");
        let err = reader.receive_line().await.unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn test_partial_line_at_end_of_stream_is_connection_lost() {
        let mock = Builder::new().read(b"half a li").build();
        let mut reader = LineReader::new(mock);

        assert!(reader.receive_line().await.unwrap_err().is_connection_lost());
    }

    #[tokio::test]
    async fn test_read_error_is_connection_lost() {
        let mock = Builder::new()
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut reader = LineReader::new(mock);

        let err = reader.receive_line().await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionLost(msg) if msg.contains("reset")));
    }

    #[tokio::test]
    async fn test_overlong_line_is_split() {
        let mock = Builder::new().read(b"abcdefgh\n").build();
        let mut reader = LineReader::with_max_line_length(mock, 5);

        assert_eq!(reader.receive_line().await.unwrap(), "abcde");
        assert_eq!(reader.receive_line().await.unwrap(), "fgh");
    }

    #[tokio::test]
    async fn test_overlong_line_keeps_multibyte_chars_whole() {
        let mock = Builder::new().read("abcé€xyz\n".as_bytes()).build();
        let mut reader = LineReader::with_max_line_length(mock, 4);

        let mut pieces = Vec::new();
        loop {
            let piece = reader.receive_line().await.unwrap();
            pieces.push(piece);
            if reader.buffer_size() == 0 {
                break;
            }
        }
        assert!(pieces.iter().all(|p| !p.contains('\u{FFFD}')));
        assert_eq!(pieces.concat(), "abcé€xyz");
        assert_eq!(pieces[0], "abc");
    }

    #[test]
    fn test_split_point_moves_forward_past_a_long_sequence() {
        assert_eq!(split_point("€abc".as_bytes(), 1), 3);
        assert_eq!(split_point("ab€".as_bytes(), 3), 2);
        assert_eq!(split_point(b"abcdef", 4), 4);
    }

    #[tokio::test]
    async fn test_send_line_appends_newline() {
        let mock = Builder::new().write(b"PONG\n").build();
        let mut writer = LineWriter::new(mock);

        writer.send_line("PONG").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_line_rejects_embedded_newline() {
        let mock = Builder::new().build();
        let mut writer = LineWriter::new(mock);

        let err = writer.send_line("ls\nrm -rf /").await.unwrap_err();
        assert!(matches!(err, ProtocolError::EmbeddedNewline));
    }

    #[tokio::test]
    async fn test_send_line_write_error_is_connection_lost() {
        let mock = Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken"))
            .build();
        let mut writer = LineWriter::new(mock);

        assert!(writer.send_line("PING").await.unwrap_err().is_connection_lost());
    }

    #[tokio::test]
    async fn test_split_over_duplex() {
        let (local, remote) = tokio::io::duplex(64);
        let (_local_reader, mut local_writer) = split(local, MAX_LINE_LENGTH);
        let (mut remote_reader, _remote_writer) = split_boxed(remote, MAX_LINE_LENGTH);

        local_writer.send_line("SYSTEM_INFO:").await.unwrap();
        assert_eq!(remote_reader.receive_line().await.unwrap(), "SYSTEM_INFO:");
    }

    #[tokio::test]
    async fn test_receive_line_is_cancel_safe() {
        let (local, remote) = tokio::io::duplex(64);
        let (mut reader, _writer) = split(local, MAX_LINE_LENGTH);
        let (_remote_reader, mut remote_writer) = split(remote, MAX_LINE_LENGTH);

        // Abandon a pending read, then make sure nothing written afterwards is lost
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            reader.receive_line(),
        )
        .await;
        assert!(pending.is_err());

        remote_writer.send_line("still here").await.unwrap();
        assert_eq!(reader.receive_line().await.unwrap(), "still here");
    }

    proptest! {
        #[test]
        fn test_lines_survive_any_chunking(
            lines in prop::collection::vec("[a-zA-Z0-9 _./-]{0,40}", 1..20),
            chunk in 1usize..16,
        ) {
            let mut payload = Vec::new();
            for line in &lines {
                payload.extend_from_slice(line.as_bytes());
                payload.push(b'\n');
            }

            let mut builder = Builder::new();
            for piece in payload.chunks(chunk) {
                builder.read(piece);
            }
            let mock = builder.build();
            let count = lines.len();

            let received = tokio_test::block_on(async move {
                let mut reader = LineReader::new(mock);
                let mut out = Vec::new();
                for _ in 0..count {
                    out.push(reader.receive_line().await.unwrap());
                }
                out
            });

            let expected: Vec<String> = lines.iter().map(|l| l.trim().to_string()).collect();
            prop_assert_eq!(received, expected);
        }
    }
}
