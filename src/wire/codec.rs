// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Newline-delimited JSON framing over an async byte stream.
//!
//! One [`Encoder`] and one [`Decoder`] per connection. Neither is safe to
//! share between concurrent callers without external synchronization.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};

use super::error::{WireError, WireResult};

/// Frame delimiter.
const DELIMITER: u8 = b'\n';

/// Writes one JSON record per line and flushes after each.
pub struct Encoder<W> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> Encoder<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Serialize `msg`, append the delimiter, and flush.
    pub async fn encode<T: Serialize>(&mut self, msg: &T) -> WireResult<()> {
        let mut line =
            serde_json::to_vec(msg).map_err(|e| WireError::Serialization(e.to_string()))?;
        line.push(DELIMITER);
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the underlying writer.
    pub async fn shutdown(&mut self) -> WireResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Unwrap the writer. Everything encoded so far has been flushed to it.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

/// Reads one JSON record per line.
///
/// Bytes of a partially received line are kept in `buf` between calls, so
/// a `decode` future may be dropped (for example by losing a
/// `tokio::select!` race) without losing input.
pub struct Decoder<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    /// Wrap a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Read and deserialize the next record. Cancel safe.
    ///
    /// Returns [`WireError::StreamClosed`] at end of stream and
    /// [`WireError::Malformed`] for a line that is not valid UTF-8 JSON; the
    /// decoder stays usable after a malformed line. Blank lines are skipped.
    pub async fn decode<T: DeserializeOwned>(&mut self) -> WireResult<T> {
        loop {
            let n = self.reader.read_until(DELIMITER, &mut self.buf).await?;
            if n == 0 && self.buf.is_empty() {
                return Err(WireError::StreamClosed);
            }
            // A final line without a delimiter is parsed once EOF is confirmed.
            if n != 0 && self.buf.last() != Some(&DELIMITER) {
                continue;
            }

            let line = std::mem::take(&mut self.buf);
            let record = line.trim_ascii();
            if record.is_empty() {
                continue;
            }

            return serde_json::from_slice(record).map_err(|e| WireError::Malformed(e.to_string()));
        }
    }
}

/// Split a duplex stream into a decoder and an encoder.
pub fn framed<S>(stream: S) -> (Decoder<ReadHalf<S>>, Encoder<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (Decoder::new(read_half), Encoder::new(write_half))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::TaskStatus;
    use crate::wire::{MessageType, WireMessage};
    use std::collections::HashMap;

    async fn roundtrip(msg: &WireMessage) -> WireMessage {
        let (client, server) = tokio::io::duplex(4096);
        let mut encoder = Encoder::new(client);
        let mut decoder = Decoder::new(server);

        encoder.encode(msg).await.unwrap();
        decoder.decode().await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_every_type() {
        let mut labels = HashMap::new();
        labels.insert("gpu".to_string(), "a100".to_string());

        let messages = vec![
            WireMessage::new(MessageType::Heartbeat),
            WireMessage::register("worker", "1.2.3")
                .with_node_id("n1")
                .with_token("tok")
                .with_labels(labels),
            WireMessage::register_ack("n1"),
            WireMessage::heartbeat("n1"),
            WireMessage {
                cluster: Some("prod".to_string()),
                namespace: Some("default".to_string()),
                description: Some("Writes code".to_string()),
                model: Some("claude-sonnet-4-20250514".to_string()),
                skills: Some(vec!["rust".to_string(), "go".to_string()]),
                ..WireMessage::agent_register("coder").with_agent_id("a1")
            },
            WireMessage::agent_unregister("a1"),
            WireMessage::task("t1", "coder", "line one\nline two"),
            WireMessage::task_result("t1", TaskStatus::Failed).with_error("boom"),
            WireMessage::error("bad things"),
        ];

        for msg in &messages {
            assert_eq!(&roundtrip(msg).await, msg);
        }
    }

    #[tokio::test]
    async fn test_encoded_line_has_single_delimiter() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut encoder = Encoder::new(client);
        encoder
            .encode(&WireMessage::task("t1", "a", "multi\nline\nprompt"))
            .await
            .unwrap();
        drop(encoder);

        let mut raw = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut raw)
            .await
            .unwrap();
        assert_eq!(raw.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(raw.last(), Some(&b'\n'));
    }

    #[tokio::test]
    async fn test_end_of_stream_is_stream_closed() {
        let mut decoder = Decoder::new(&b""[..]);
        let err = decoder.decode::<WireMessage>().await.unwrap_err();
        assert!(err.is_stream_closed());
    }

    #[tokio::test]
    async fn test_malformed_line_then_recovers() {
        let input = b"not json\n{\"type\":\"heartbeat\",\"node_id\":\"n1\"}\n";
        let mut decoder = Decoder::new(&input[..]);

        let err = decoder.decode::<WireMessage>().await.unwrap_err();
        assert!(matches!(err, WireError::Malformed(_)));

        let msg: WireMessage = decoder.decode().await.unwrap();
        assert_eq!(msg, WireMessage::heartbeat("n1"));

        let err = decoder.decode::<WireMessage>().await.unwrap_err();
        assert!(err.is_stream_closed());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_malformed_and_recovers() {
        let mut input = b"{\"type\":\"error\",\"error\":\"\xff\xfe\"}\n\xc3\x28\n".to_vec();
        input.extend_from_slice(b"{\"type\":\"heartbeat\",\"node_id\":\"n1\"}\n");
        let mut decoder = Decoder::new(&input[..]);

        for _ in 0..2 {
            let err = decoder.decode::<WireMessage>().await.unwrap_err();
            assert!(matches!(err, WireError::Malformed(_)));
        }
        let msg: WireMessage = decoder.decode().await.unwrap();
        assert_eq!(msg, WireMessage::heartbeat("n1"));
    }

    #[tokio::test]
    async fn test_cancelled_decode_keeps_partial_line() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut decoder = Decoder::new(server);

        let mut line = serde_json::to_vec(&WireMessage::task("t1", "coder", "hello")).unwrap();
        line.push(b'\n');
        let (head, tail) = line.split_at(line.len() / 2);

        client.write_all(head).await.unwrap();
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(30),
            decoder.decode::<WireMessage>(),
        )
        .await;
        assert!(pending.is_err());

        client.write_all(tail).await.unwrap();
        let msg: WireMessage = decoder.decode().await.unwrap();
        assert_eq!(msg, WireMessage::task("t1", "coder", "hello"));
    }

    #[tokio::test]
    async fn test_final_line_without_delimiter() {
        let mut decoder = Decoder::new(&b"{\"type\":\"heartbeat\",\"node_id\":\"n1\"}"[..]);
        let msg: WireMessage = decoder.decode().await.unwrap();
        assert_eq!(msg, WireMessage::heartbeat("n1"));
        assert!(decoder.decode::<WireMessage>().await.unwrap_err().is_stream_closed());
    }

    #[tokio::test]
    async fn test_blank_lines_skipped() {
        let input = b"\n\n{\"type\":\"error\",\"error\":\"x\"}\n";
        let mut decoder = Decoder::new(&input[..]);
        let msg: WireMessage = decoder.decode().await.unwrap();
        assert!(msg.is_error());
    }

    #[tokio::test]
    async fn test_framed_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let (_a_rx, mut a_tx) = framed(a);
        let (mut b_rx, _b_tx) = framed(b);

        a_tx.encode(&WireMessage::register_ack("n9")).await.unwrap();
        let msg: WireMessage = b_rx.decode().await.unwrap();
        assert_eq!(msg.node_id.as_deref(), Some("n9"));
    }
}
