//! Session layer: reliable frame delivery over a raw byte stream.
//!
//! The session owns the transport and a receive buffer. Outgoing frames are
//! retransmitted until the stub acknowledges them; incoming bytes are
//! accumulated until one complete `$...#hh` frame can be cut from the front
//! of the buffer. Every blocking read races the cancellation scope.

use rsp_proto::codec::{ACK, END, NACK, START};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, timeout};
use tracing::{debug, trace, warn};

use crate::cancel::Scope;
use crate::{Config, Error, Result};

/// Bytes requested from the transport per read.
const READ_CHUNK: usize = 1024;

/// Upper bound on unconsumed received bytes.
const MAX_BUFFER: usize = 64 * 1024;

/// Reliable, cancellable frame transport.
#[derive(Debug)]
pub struct Session<S> {
    /// The underlying byte stream.
    stream: S,
    /// Received bytes not yet consumed.
    buffer: Vec<u8>,
    /// Cancellation scope raced by every blocking read.
    scope: Scope,
    /// Transmissions per frame before giving up.
    max_attempts: u32,
    /// Wait for `+`/`-` after each transmission.
    ack_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Wraps `stream` using the limits from `config`.
    pub fn new(stream: S, config: &Config) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            scope: Scope::new(),
            max_attempts: config.max_attempts,
            ack_timeout: config.ack_timeout,
        }
    }

    /// The cancellation scope shared with [`Canceller`](crate::Canceller)s.
    pub(crate) const fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Sends `frame` and waits for the stub to acknowledge it.
    ///
    /// A `-` reply or silence longer than the acknowledgement timeout
    /// triggers a retransmission. After `max_attempts` transmissions the
    /// send fails with [`Error::ProtocolViolation`].
    pub async fn write(&mut self, frame: &[u8]) -> Result<()> {
        for attempt in 1..=self.max_attempts {
            self.stream.write_all(frame).await?;
            self.stream.flush().await?;

            match timeout(self.ack_timeout, self.read_control()).await {
                Ok(Ok(ACK)) => {
                    trace!(attempt, "frame acknowledged");
                    return Ok(());
                }
                Ok(Ok(_)) => warn!(attempt, "stub rejected frame; retransmitting"),
                Ok(Err(e)) => return Err(e),
                Err(_) => warn!(attempt, timeout = ?self.ack_timeout, "no acknowledgement; retransmitting"),
            }
        }

        warn!(attempts = self.max_attempts, "giving up on frame");
        Err(Error::ProtocolViolation {
            operation: "send",
            attempts: self.max_attempts,
        })
    }

    /// Writes a single unframed byte that expects no acknowledgement.
    pub async fn write_control(&mut self, byte: u8) -> Result<()> {
        self.stream.write_all(&[byte]).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Blocks until one complete frame is buffered, then removes it.
    ///
    /// A `$` inside an unterminated frame abandons the partial frame and
    /// resynchronises on the new one. The returned bytes are not validated;
    /// that is the codec's job.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(frame) = take_frame(&mut self.buffer) {
                debug!(frame = %String::from_utf8_lossy(&frame), "received frame");
                return Ok(frame);
            }
            self.fill().await?;
        }
    }

    /// Blocks for exactly one byte.
    pub async fn read_byte(&mut self) -> Result<u8> {
        if self.buffer.is_empty() {
            self.fill().await?;
        }
        Ok(self.buffer.remove(0))
    }

    /// Flushes and closes the write half of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Waits for an acknowledgement or rejection.
    ///
    /// Frames that arrive first stay buffered for [`read_frame`](Self::read_frame).
    async fn read_control(&mut self) -> Result<u8> {
        loop {
            if let Some(byte) = take_control(&mut self.buffer) {
                return Ok(byte);
            }
            self.fill().await?;
        }
    }

    /// Appends whatever the transport has ready, blocking if it has nothing.
    async fn fill(&mut self) -> Result<()> {
        let cancelled = self.scope.cancelled();
        let mut chunk = [0u8; READ_CHUNK];
        let read = tokio::select! {
            biased;
            () = cancelled => return Err(Error::Cancelled),
            read = self.stream.read(&mut chunk) => read?,
        };
        if read == 0 {
            return Err(Error::Closed);
        }
        self.buffer.extend_from_slice(&chunk[..read]);

        if self.buffer.len() > MAX_BUFFER {
            let keep_from = self
                .buffer
                .iter()
                .rposition(|&b| b == START)
                .filter(|&start| self.buffer.len() - start <= MAX_BUFFER)
                .unwrap_or(self.buffer.len());
            warn!(dropped = keep_from, "receive buffer full without a frame end; discarding");
            self.buffer.drain(..keep_from);
        }
        Ok(())
    }
}

/// Removes the first `+` or `-` that is not part of a frame.
///
/// Noise in front of it is dropped. Complete and partial frames are left in
/// place.
fn take_control(buffer: &mut Vec<u8>) -> Option<u8> {
    let mut i = 0;
    while i < buffer.len() {
        match buffer[i] {
            byte @ (ACK | NACK) => {
                buffer.remove(i);
                return Some(byte);
            }
            START => {
                let rest = &buffer[i + 1..];
                match rest.iter().position(|&b| b == START || b == END) {
                    Some(offset) if rest[offset] == END => i += 1 + offset + 3,
                    Some(offset) => i += 1 + offset,
                    None => return None,
                }
            }
            byte => {
                trace!(byte, "skipping noise while awaiting acknowledgement");
                buffer.remove(i);
            }
        }
    }
    None
}

/// Cuts the first complete frame out of `buffer`.
///
/// Consumed bytes are removed whether or not the frame turns out to be
/// valid. Bytes in front of the last `$` preceding the terminator are
/// noise or an abandoned partial frame and are dropped with it.
fn take_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    loop {
        let end = buffer.iter().position(|&b| b == END)?;
        let trailer = buffer.get(end + 1..end + 3)?;

        if let Some(offset) = trailer.iter().position(|&b| b == START) {
            let restart = end + 1 + offset;
            debug!(dropped = restart, "frame truncated by a new start; resynchronising");
            buffer.drain(..restart);
            continue;
        }

        let start = buffer[..end]
            .iter()
            .rposition(|&b| b == START)
            .unwrap_or(0);
        if start > 0 {
            trace!(skipped = start, "discarding bytes before frame start");
        }
        let frame = buffer[start..end + 3].to_vec();
        buffer.drain(..end + 3);
        return Some(frame);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rsp_proto::codec::frame;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    use super::*;
    use crate::cancel::Canceller;

    fn session(config: &Config) -> (Session<DuplexStream>, DuplexStream) {
        let (client, stub) = duplex(4096);
        (Session::new(client, config), stub)
    }

    #[test]
    fn take_frame_needs_full_trailer() {
        let mut buffer = b"$S05#b".to_vec();
        assert_eq!(take_frame(&mut buffer), None);
        buffer.push(b'8');
        assert_eq!(take_frame(&mut buffer).unwrap(), b"$S05#b8");
        assert!(buffer.is_empty());
    }

    #[test]
    fn take_frame_leaves_following_bytes() {
        let mut buffer = b"+$OK#9a$S05".to_vec();
        assert_eq!(take_frame(&mut buffer).unwrap(), b"$OK#9a");
        assert_eq!(buffer, b"$S05");
        assert_eq!(take_frame(&mut buffer), None);
    }

    #[test]
    fn take_frame_resynchronises_on_new_start() {
        let mut buffer = b"$S0$OK#9a".to_vec();
        assert_eq!(take_frame(&mut buffer).unwrap(), b"$OK#9a");

        let mut buffer = b"$S05#$OK#9a".to_vec();
        assert_eq!(take_frame(&mut buffer).unwrap(), b"$OK#9a");
        assert!(buffer.is_empty());
    }

    #[test]
    fn take_frame_hands_over_frames_without_start() {
        let mut buffer = b"OK#9a".to_vec();
        assert_eq!(take_frame(&mut buffer).unwrap(), b"OK#9a");
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn read_frame_reassembles_partial_reads() {
        let (mut session, mut stub) = session(&Config::default());
        let reader = tokio::spawn(async move {
            let frame = session.read_frame().await.unwrap();
            (session, frame)
        });

        for piece in [&b"$dec"[..], b"afbad#", b"1", b"a"] {
            stub.write_all(piece).await.unwrap();
            tokio::task::yield_now().await;
        }

        let (_session, frame) = reader.await.unwrap();
        assert_eq!(frame, frame_of("decafbad"));
    }

    #[tokio::test]
    async fn write_retransmits_after_nack() {
        let (mut session, mut stub) = session(&Config::default());
        stub.write_all(b"-+").await.unwrap();

        session.write(b"$?#3f").await.unwrap();

        let mut sent = [0u8; 10];
        stub.read_exact(&mut sent).await.unwrap();
        assert_eq!(&sent, b"$?#3f$?#3f");
    }

    #[test]
    fn take_control_skips_frames_and_noise() {
        let mut buffer = b"\r\n$T05#b9+$S02#b5".to_vec();
        assert_eq!(take_control(&mut buffer), Some(ACK));
        assert_eq!(buffer, b"$T05#b9$S02#b5");

        let mut buffer = b"$qSupported:multiprocess+#c6-".to_vec();
        assert_eq!(take_control(&mut buffer), Some(NACK));
        assert_eq!(buffer, b"$qSupported:multiprocess+#c6");

        let mut buffer = b"x$S0".to_vec();
        assert_eq!(take_control(&mut buffer), None);
        assert_eq!(buffer, b"$S0");
    }

    #[tokio::test]
    async fn frame_before_ack_stays_buffered() {
        let (mut session, mut stub) = session(&Config::default());
        stub.write_all(&frame_of("T05thread:01;")).await.unwrap();
        stub.write_all(b"+").await.unwrap();

        session.write(b"$?#3f").await.unwrap();
        assert_eq!(session.read_frame().await.unwrap(), frame_of("T05thread:01;"));
    }

    #[tokio::test]
    async fn unterminated_stream_does_not_grow_the_buffer() {
        let (mut session, mut stub) = session(&Config::default());
        let writer = tokio::spawn(async move {
            stub.write_all(&vec![b'a'; 3 * MAX_BUFFER]).await.unwrap();
            stub.write_all(b"$S0").await.unwrap();
        });

        loop {
            match session.fill().await {
                Ok(()) => assert!(session.buffer.len() <= MAX_BUFFER),
                Err(e) => {
                    assert!(matches!(e, Error::Closed), "{e}");
                    break;
                }
            }
        }
        writer.await.unwrap();
        assert!(session.buffer.ends_with(b"$S0"));
    }

    #[tokio::test]
    async fn write_skips_noise_before_ack() {
        let (mut session, mut stub) = session(&Config::default());
        stub.write_all(b"\r\n+$S05#b8").await.unwrap();

        session.write(b"$?#3f").await.unwrap();
        assert_eq!(session.read_frame().await.unwrap(), b"$S05#b8");
    }

    #[tokio::test(start_paused = true)]
    async fn write_gives_up_after_max_attempts() {
        let (mut session, mut stub) = session(&Config::default());

        let err = session.write(b"$c#63").await.unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation {
                operation: "send",
                attempts: 10
            }
        ));

        let mut sent = vec![0u8; 50];
        stub.read_exact(&mut sent).await.unwrap();
        assert_eq!(sent, b"$c#63".repeat(10));
    }

    #[tokio::test]
    async fn closed_stream_is_reported() {
        let (mut session, stub) = session(&Config::default());
        drop(stub);
        assert!(matches!(session.read_frame().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn read_byte_prefers_buffered_bytes() {
        let (mut session, mut stub) = session(&Config::default());
        stub.write_all(b"+-").await.unwrap();
        assert_eq!(session.read_byte().await.unwrap(), ACK);
        assert_eq!(session.read_byte().await.unwrap(), NACK);
    }

    #[tokio::test]
    async fn cancellation_keeps_buffered_bytes() {
        let config = Config::default();
        let (mut session, mut stub) = session(&config);
        let canceller = Canceller::new(session.scope().clone(), config.cancel_grace);

        stub.write_all(b"$S0").await.unwrap();
        let mut pending = Box::pin(session.read_frame());
        let waited = tokio::time::timeout(Duration::from_millis(10), &mut pending).await;
        assert!(waited.is_err(), "partial frame must not be delivered");

        let outcome = canceller.cancel_read(pending).await.unwrap();
        assert_eq!(outcome, None);

        stub.write_all(b"5#b8").await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), session.read_frame())
            .await
            .expect("scope re-armed")
            .unwrap();
        assert_eq!(frame, b"$S05#b8");
    }

    fn frame_of(payload: &str) -> Vec<u8> {
        frame(payload.as_bytes())
    }
}
