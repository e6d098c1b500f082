//! Wire format of the sayerd RPC.
//!
//! Every message is one JSON event on a single line. An `audio` event is
//! followed by exactly `payload_length` raw bytes:
//!
//! ```text
//! -> {"type":"speak","data":{"role":"Jenny","text":"hello"}}
//! <- {"type":"audio","data":{"format":"mp3","payload_length":5}}
//! <- AUDIO
//! ```

use crate::backends::Speech;
use crate::error::{Result, SayerError};
use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Longest accepted event line, newline included.
pub const MAX_EVENT_BYTES: u64 = 64 * 1024;
/// Largest audio payload a client will accept.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Event {
    Speak { role: String, text: String },
    Audio { format: String, payload_length: usize },
    Error { kind: String, message: String },
    Describe,
    Info { backend: String, version: String },
    Ping,
    Pong,
}

impl Event {
    pub fn failure(err: &SayerError) -> Self {
        Event::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Speak { .. } => "speak",
            Event::Audio { .. } => "audio",
            Event::Error { .. } => "error",
            Event::Describe => "describe",
            Event::Info { .. } => "info",
            Event::Ping => "ping",
            Event::Pong => "pong",
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Reads one event line as raw bytes, newline included. `Ok(None)` means the
/// peer closed the connection cleanly.
///
/// A line longer than [`MAX_EVENT_BYTES`] is discarded up to its newline before
/// the error is returned, so the next call starts at the next event.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut frame = Vec::new();
    let n = (&mut *reader)
        .take(MAX_EVENT_BYTES)
        .read_until(b'\n', &mut frame)
        .await?;

    if n == 0 {
        return Ok(None);
    }
    if frame.last() != Some(&b'\n') {
        if n as u64 >= MAX_EVENT_BYTES {
            skip_line(reader).await?;
            return Err(SayerError::Protocol("event line too long".to_string()));
        }
        return Err(SayerError::Protocol(
            "connection closed in the middle of an event".to_string(),
        ));
    }
    Ok(Some(frame))
}

/// Like [`read_frame`], for peers that must speak UTF-8.
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    match read_frame(reader).await? {
        Some(frame) => Ok(Some(decode_line(frame)?)),
        None => Ok(None),
    }
}

pub fn decode_line(frame: Vec<u8>) -> Result<String> {
    String::from_utf8(frame).map_err(|_| SayerError::Protocol("event is not valid UTF-8".to_string()))
}

/// Consumes input up to and including the next newline, or to EOF.
async fn skip_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<()> {
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|b| *b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(());
            }
            None => {
                let n = buf.len();
                reader.consume(n);
            }
        }
    }
}

pub async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    if len > MAX_PAYLOAD_BYTES {
        return Err(SayerError::Protocol(format!(
            "payload of {} bytes exceeds the {} byte limit",
            len, MAX_PAYLOAD_BYTES
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn write_event<W: AsyncWrite + Unpin>(
    writer: &mut W,
    event: &Event,
    payload: &[u8],
) -> Result<()> {
    let mut header = serde_json::to_vec(event)?;
    header.push(b'\n');

    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// What a server reports about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    pub backend: String,
    pub version: String,
}

/// Client side of the protocol. Calls on one client are sequential.
pub struct SayerClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SayerClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn speak(&mut self, role: &str, text: &str) -> Result<Speech> {
        let request = Event::Speak {
            role: role.to_string(),
            text: text.to_string(),
        };
        match self.call(&request).await? {
            Event::Audio {
                format,
                payload_length,
            } => {
                let audio = read_payload(&mut self.reader, payload_length).await?;
                Ok(Speech { format, audio })
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn describe(&mut self) -> Result<ServerInfo> {
        match self.call(&Event::Describe).await? {
            Event::Info { backend, version } => Ok(ServerInfo { backend, version }),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        match self.call(&Event::Ping).await? {
            Event::Pong => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn call(&mut self, request: &Event) -> Result<Event> {
        write_event(&mut self.writer, request, &[]).await?;
        let line = read_line(&mut self.reader)
            .await?
            .ok_or_else(|| SayerError::Protocol("server closed the connection".to_string()))?;

        match Event::parse(&line)? {
            Event::Error { kind, message } => Err(SayerError::Remote { kind, message }),
            event => Ok(event),
        }
    }
}

fn unexpected(event: &Event) -> SayerError {
    SayerError::Protocol(format!("unexpected {} event", event.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_shapes() {
        let ping = serde_json::to_string(&Event::Ping).unwrap();
        assert_eq!(ping, r#"{"type":"ping"}"#);

        let speak = Event::parse(r#"{"type":"speak","data":{"role":"Jenny","text":"hi"}}"#).unwrap();
        assert_eq!(
            speak,
            Event::Speak {
                role: "Jenny".to_string(),
                text: "hi".to_string()
            }
        );

        assert_eq!(Event::parse("{\"type\":\"describe\"}\n").unwrap(), Event::Describe);
        assert!(Event::parse(r#"{"type":"sing"}"#).is_err());
    }

    #[test]
    fn test_failure_carries_kind() {
        let event = Event::failure(&SayerError::UnknownRole("Bob".to_string()));
        assert_eq!(
            event,
            Event::Error {
                kind: "unknown_role".to_string(),
                message: "unknown role: Bob".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_audio_payload_follows_header() {
        let (mut client, server) = tokio::io::duplex(1024);
        let event = Event::Audio {
            format: "mp3".to_string(),
            payload_length: 5,
        };
        write_event(&mut client, &event, b"AUDIO").await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let line = read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(Event::parse(&line).unwrap(), event);
        assert_eq!(read_payload(&mut reader, 5).await.unwrap(), b"AUDIO".to_vec());
        assert!(read_line(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overlong_line_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let junk = vec![b'x'; MAX_EVENT_BYTES as usize + 10];
            let _ = client.write_all(&junk).await;
        });

        let mut reader = BufReader::new(server);
        let err = read_line(&mut reader).await.unwrap_err();
        assert!(matches!(err, SayerError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_overlong_line_is_skipped() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut junk = vec![b'x'; MAX_EVENT_BYTES as usize * 2];
            junk.extend_from_slice(b"\n{\"type\":\"ping\"}\n");
            let _ = client.write_all(&junk).await;
        });

        let mut reader = BufReader::new(server);
        assert!(matches!(
            read_line(&mut reader).await,
            Err(SayerError::Protocol(_))
        ));
        let line = read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(Event::parse(&line).unwrap(), Event::Ping);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"\xff\xfe\n{\"type\":\"ping\"}\n").await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert!(decode_line(frame).is_err());
        let line = read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(Event::parse(&line).unwrap(), Event::Ping);
    }

    #[tokio::test]
    async fn test_truncated_line_rejected() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(br#"{"type":"pi"#).await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        assert!(read_line(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_payload_limit() {
        let (_client, server) = tokio::io::duplex(16);
        let mut reader = BufReader::new(server);
        assert!(read_payload(&mut reader, MAX_PAYLOAD_BYTES + 1).await.is_err());
    }
}
