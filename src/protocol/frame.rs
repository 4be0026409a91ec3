use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::protocol::Envelope;

pub(crate) const HEAD_LEN: usize = 4;
/// Sanity cap; anything larger is a protocol violation, not a real envelope.
pub(crate) const MAX_FRAME_LEN: usize = 1 << 20;

/// Split a lobby connection into framed halves.
pub fn framed(stream: TcpStream) -> (FramedReader, FramedWriter) {
    let (read, write) = stream.into_split();
    (
        FramedReader {
            read,
            buf: BytesMut::with_capacity(4096),
        },
        FramedWriter { write },
    )
}

/// Length-prefixed envelope reader.
///
/// Buffers partial frames across reads; cancelling `read_envelope` at an await
/// point never loses data already pulled off the socket.
pub struct FramedReader {
    read: OwnedReadHalf,
    buf: BytesMut,
}

impl FramedReader {
    pub async fn read_envelope(&mut self) -> Result<Envelope> {
        loop {
            if self.buf.len() >= HEAD_LEN {
                let mut head = [0u8; HEAD_LEN];
                head.copy_from_slice(&self.buf[..HEAD_LEN]);
                let len = u32::from_le_bytes(head) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(Error::Oversize {
                        len,
                        cap: MAX_FRAME_LEN,
                    });
                }
                if self.buf.len() >= HEAD_LEN + len {
                    self.buf.advance(HEAD_LEN);
                    let payload = self.buf.split_to(len);
                    return Envelope::decode(&payload);
                }
            }
            let n = self.read.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(Error::Closed);
            }
        }
    }
}

pub struct FramedWriter {
    write: OwnedWriteHalf,
}

impl FramedWriter {
    pub async fn write_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        let payload = envelope.encode()?;
        let head = (payload.len() as u32).to_le_bytes();
        self.write.write_all(&head).await?;
        self.write.write_all(&payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    use crate::protocol::frame::framed;
    use crate::protocol::Envelope;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn round_trip() {
        let (client, server) = pair().await;
        let (_r, mut writer) = framed(client);
        let (mut reader, _w) = framed(server);
        let envelope = Envelope::new("GameState", vec!["Lobby".into()]);
        writer.write_envelope(&envelope).await.unwrap();
        assert_eq!(reader.read_envelope().await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn partial_frame_resumes() {
        let (mut client, server) = pair().await;
        let (mut reader, _w) = framed(server);
        let payload = br#"{"command":"pong","args":[]}"#;
        let head = (payload.len() as u32).to_le_bytes();
        // Dribble the frame in three writes, splitting the length prefix.
        client.write_all(&head[..2]).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        client.write_all(&head[2..]).await.unwrap();
        client.write_all(&payload[..7]).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        client.write_all(&payload[7..]).await.unwrap();
        let envelope = reader.read_envelope().await.unwrap();
        assert_eq!(envelope.command, "pong");
    }

    #[tokio::test]
    async fn oversize_frame_rejected() {
        let (mut client, server) = pair().await;
        let (mut reader, _w) = framed(server);
        client.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        assert!(reader.read_envelope().await.is_err());
    }

    #[tokio::test]
    async fn two_frames_one_write() {
        let (mut client, server) = pair().await;
        let (mut reader, _w) = framed(server);
        let mut bytes = Vec::new();
        for command in ["ping", "pong"] {
            let payload = Envelope::new(command, vec![]).encode().unwrap();
            bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&payload);
        }
        client.write_all(&bytes).await.unwrap();
        assert_eq!(reader.read_envelope().await.unwrap().command, "ping");
        assert_eq!(reader.read_envelope().await.unwrap().command, "pong");
    }
}
