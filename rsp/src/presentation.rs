//! Presentation layer: command/reply exchanges on top of a [`Session`].
//!
//! An exchange is one command sent plus the one reply it produces. The
//! command travels inside the [`Exchange`] value returned by
//! [`Presentation::send_command`], which is the only way to ask for its
//! reply, so a reply can never be decoded without the command that gives
//! it meaning.

use rsp_proto::codec::{ACK, INTERRUPT, NACK};
use rsp_proto::{Command, FrameError, HaltReason, Response, StopReply};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::cancel::Canceller;
use crate::session::Session;
use crate::{Config, Error, Result};

/// Progress of the current exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Phase {
    /// No exchange has started.
    Idle,
    /// The command was acknowledged by the stub.
    Sent,
    /// Waiting for the reply frame.
    AwaitingReply,
    /// A reply was decoded and acknowledged.
    Delivered,
    /// The retry budget ran out.
    Violated,
}

/// A command that the stub has acknowledged and whose reply is pending.
#[derive(Debug)]
#[must_use = "the reply of an exchange must be received"]
pub struct Exchange<C> {
    /// The command, kept as the context for decoding its reply.
    command: C,
}

impl<C: Command> Exchange<C> {
    /// The command that opened this exchange.
    pub const fn command(&self) -> &C {
        &self.command
    }
}

/// Command/reply coordination over one session.
#[derive(Debug)]
pub struct Presentation<S> {
    /// The reliable frame transport.
    session: Session<S>,
    /// State of the current exchange.
    phase: Phase,
    /// Receive attempts per reply.
    max_attempts: u32,
    /// Unwind bound handed to cancellers.
    cancel_grace: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Presentation<S> {
    /// Wraps `stream` in a session configured by `config`.
    pub fn new(stream: S, config: &Config) -> Self {
        Self {
            session: Session::new(stream, config),
            phase: Phase::Idle,
            max_attempts: config.max_attempts,
            cancel_grace: config.cancel_grace,
        }
    }

    /// State of the current exchange.
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns a handle that can cancel a pending reply wait.
    pub fn canceller(&self) -> Canceller {
        Canceller::new(self.session.scope().clone(), self.cancel_grace)
    }

    /// Sends `command` and waits for the stub to acknowledge it.
    ///
    /// Fails with [`Error::ProtocolViolation`] when the stub never
    /// acknowledges; the connection remains usable.
    pub async fn send_command<C: Command>(&mut self, command: C) -> Result<Exchange<C>> {
        let frame = rsp_proto::encode(&command);
        debug!(frame = %String::from_utf8_lossy(&frame), "sending command");

        match self.session.write(&frame).await {
            Ok(()) => {
                self.phase = Phase::Sent;
                Ok(Exchange { command })
            }
            Err(e) => {
                if matches!(e, Error::ProtocolViolation { .. }) {
                    self.phase = Phase::Violated;
                }
                Err(e)
            }
        }
    }

    /// Receives and decodes the reply of `exchange`.
    ///
    /// Frames that fail to decode are rejected with `-` and the receive is
    /// retried, up to `max_attempts` frames in total. An `Exx` or empty reply
    /// is acknowledged and then reported as [`Error::Target`] or
    /// [`Error::Unsupported`].
    pub async fn receive_reply<C: Command>(&mut self, exchange: &Exchange<C>) -> Result<C::Reply> {
        let command = &exchange.command;
        let response = self
            .receive(|frame| rsp_proto::decode(frame, command))
            .await?;

        match response {
            Response::Reply(reply) => Ok(reply),
            Response::Error(code) => Err(Error::Target { code }),
            Response::Unsupported => Err(Error::Unsupported {
                opcode: command.opcode(),
            }),
        }
    }

    /// Sends `command` and returns its decoded reply.
    pub async fn exchange<C: Command>(&mut self, command: C) -> Result<C::Reply> {
        let exchange = self.send_command(command).await?;
        self.receive_reply(&exchange).await
    }

    /// Sends the out-of-band interrupt byte and returns the stop reply.
    ///
    /// The byte is written unframed and is not acknowledged; the stub answers
    /// with an ordinary stop reply frame.
    pub async fn send_interrupt(&mut self) -> Result<StopReply> {
        debug!("sending interrupt");
        self.session.write_control(INTERRUPT).await?;
        self.phase = Phase::Sent;
        self.receive_reply(&Exchange {
            command: HaltReason,
        })
        .await
    }

    /// Rejects the last received frame, asking the stub to send it again.
    pub async fn send_nack(&mut self) -> Result<()> {
        self.session.write_control(NACK).await
    }

    /// Closes the connection.
    pub async fn close(mut self) -> Result<()> {
        self.session.shutdown().await
    }

    /// Runs receive cycles until `decode` accepts a frame.
    async fn receive<R>(
        &mut self,
        decode: impl Fn(&[u8]) -> std::result::Result<Response<R>, FrameError>,
    ) -> Result<Response<R>> {
        self.phase = Phase::AwaitingReply;

        for attempt in 1..=self.max_attempts {
            let frame = self.session.read_frame().await?;
            match decode(&frame) {
                Ok(response) => {
                    self.session.write_control(ACK).await?;
                    self.phase = Phase::Delivered;
                    return Ok(response);
                }
                Err(error) => {
                    warn!(attempt, %error, "rejecting frame");
                    self.session.write_control(NACK).await?;
                }
            }
        }

        self.phase = Phase::Violated;
        warn!(attempts = self.max_attempts, "no valid reply");
        Err(Error::ProtocolViolation {
            operation: "receive",
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use rsp_proto::codec::frame;
    use rsp_proto::{Continue, ReadMemory, ReadRegister, Register, WriteMemory};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    use super::*;

    fn presentation() -> (Presentation<DuplexStream>, DuplexStream) {
        let (client, stub) = duplex(4096);
        (Presentation::new(client, &Config::default()), stub)
    }

    async fn expect_sent(stub: &mut DuplexStream, expected: &[u8]) {
        let mut sent = vec![0u8; expected.len()];
        stub.read_exact(&mut sent).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&sent),
            String::from_utf8_lossy(expected)
        );
    }

    #[tokio::test]
    async fn reads_sixteen_bytes_of_memory() {
        let (mut pres, mut stub) = presentation();
        let hex = "000102030405060708090a0b0c0d0e0f";
        stub.write_all(b"+").await.unwrap();
        stub.write_all(&frame(hex.as_bytes())).await.unwrap();

        let exchange = pres
            .send_command(ReadMemory::new(0x0200_0000, 16))
            .await
            .unwrap();
        assert_eq!(pres.phase(), Phase::Sent);
        let data = pres.receive_reply(&exchange).await.unwrap();

        assert_eq!(data, (0u8..16).collect::<Vec<_>>());
        assert_eq!(pres.phase(), Phase::Delivered);

        let mut expected = frame(b"m2000000,10");
        expected.push(b'+');
        expect_sent(&mut stub, &expected).await;
    }

    #[tokio::test]
    async fn corrupted_frame_is_nacked_then_valid_one_acked() {
        let (mut pres, mut stub) = presentation();
        stub.write_all(b"+$S05#00").await.unwrap();
        stub.write_all(&frame(b"S05")).await.unwrap();

        let reply = pres.exchange(Continue::default()).await.unwrap();
        assert_eq!(reply, StopReply::Signal(5));

        expect_sent(&mut stub, b"$c#63-+").await;
    }

    #[tokio::test]
    async fn undecodable_payload_is_nacked() {
        let (mut pres, mut stub) = presentation();
        stub.write_all(b"+").await.unwrap();
        stub.write_all(&frame(b"xyz")).await.unwrap();
        stub.write_all(&frame(b"dead")).await.unwrap();

        let data = pres.exchange(ReadMemory::new(0, 2)).await.unwrap();
        assert_eq!(data, [0xde, 0xad]);

        let mut expected = frame(b"m0,2");
        expected.extend_from_slice(b"-+");
        expect_sent(&mut stub, &expected).await;
    }

    #[tokio::test]
    async fn gives_up_after_ten_bad_frames() {
        let (mut pres, mut stub) = presentation();
        stub.write_all(b"+").await.unwrap();
        for _ in 0..10 {
            stub.write_all(b"$S05#00").await.unwrap();
        }

        let err = pres.exchange(HaltReason).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation {
                operation: "receive",
                attempts: 10
            }
        ));
        assert_eq!(pres.phase(), Phase::Violated);

        let mut expected = b"$?#3f".to_vec();
        expected.extend_from_slice(&[NACK; 10]);
        expect_sent(&mut stub, &expected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_continue_violates_but_keeps_connection() {
        let (mut pres, mut stub) = presentation();

        let err = pres.send_command(Continue::default()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation {
                operation: "send",
                attempts: 10
            }
        ));
        assert_eq!(pres.phase(), Phase::Violated);
        expect_sent(&mut stub, &b"$c#63".repeat(10)).await;

        stub.write_all(b"+").await.unwrap();
        stub.write_all(&frame(b"S02")).await.unwrap();
        let reply = pres.exchange(HaltReason).await.unwrap();
        assert_eq!(reply, StopReply::Signal(2));
    }

    #[tokio::test]
    async fn error_reply_is_acknowledged_and_surfaced() {
        let (mut pres, mut stub) = presentation();
        stub.write_all(b"+").await.unwrap();
        stub.write_all(&frame(b"E0e")).await.unwrap();

        let err = pres
            .exchange(WriteMemory::new(0, vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Target { code: 0x0e }));

        let mut expected = frame(b"M0,1:01");
        expected.push(ACK);
        expect_sent(&mut stub, &expected).await;
    }

    #[tokio::test]
    async fn empty_reply_means_unsupported() {
        let (mut pres, mut stub) = presentation();
        stub.write_all(b"+").await.unwrap();
        stub.write_all(&frame(b"")).await.unwrap();

        let err = pres.exchange(ReadRegister::new(3)).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported { opcode: "p" }));
    }

    #[tokio::test]
    async fn register_reply_is_command_specific() {
        let (mut pres, mut stub) = presentation();
        stub.write_all(b"+").await.unwrap();
        stub.write_all(&frame(b"xxxxxxxx")).await.unwrap();

        let register = pres.exchange(ReadRegister::new(3)).await.unwrap();
        assert_eq!(register, Register::Unavailable);
    }

    #[tokio::test]
    async fn interrupt_is_unframed_and_unacknowledged() {
        let (mut pres, mut stub) = presentation();
        stub.write_all(&frame(b"T02thread:01;")).await.unwrap();

        let reply = pres.send_interrupt().await.unwrap();
        assert_eq!(reply.signal(), Some(2));

        expect_sent(&mut stub, &[INTERRUPT, ACK]).await;
    }

    #[tokio::test]
    async fn explicit_nack_is_a_single_byte() {
        let (mut pres, mut stub) = presentation();
        pres.send_nack().await.unwrap();
        expect_sent(&mut stub, b"-").await;
    }

    #[tokio::test]
    async fn cancelled_wait_leaves_connection_reusable() {
        let (mut pres, mut stub) = presentation();
        let canceller = pres.canceller();
        stub.write_all(b"+").await.unwrap();

        let mut pending = Box::pin(pres.exchange(Continue::default()));
        let waited = tokio::time::timeout(Duration::from_millis(10), &mut pending).await;
        assert!(waited.is_err(), "no reply has been sent yet");

        let outcome = canceller.cancel_read(pending).await.unwrap();
        assert_eq!(outcome, None);
        assert_eq!(pres.phase(), Phase::AwaitingReply);

        expect_sent(&mut stub, b"$c#63").await;
        stub.write_all(&frame(b"S05")).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(1), pres.send_interrupt())
            .await
            .expect("scope re-armed")
            .unwrap();
        assert_eq!(reply, StopReply::Signal(5));
    }

    #[tokio::test]
    async fn frame_ahead_of_ack_is_answered() {
        let (mut pres, mut stub) = presentation();
        stub.write_all(&frame(b"T05thread:01;")).await.unwrap();
        stub.write_all(b"+").await.unwrap();
        stub.write_all(&frame(b"S02")).await.unwrap();

        let reply = pres.exchange(HaltReason).await.unwrap();
        assert_eq!(reply.signal(), Some(5));
        expect_sent(&mut stub, b"$?#3f+").await;

        stub.write_all(b"+").await.unwrap();
        let reply = pres.exchange(HaltReason).await.unwrap();
        assert_eq!(reply, StopReply::Signal(2));
        expect_sent(&mut stub, b"$?#3f+").await;
    }

    #[tokio::test]
    async fn pending_read_is_cancelled_from_another_task() {
        let (mut pres, mut stub) = presentation();
        let canceller = pres.canceller();
        stub.write_all(b"+").await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(async move {
            let reply = pres.exchange(Continue::default()).await;
            tx.send(pres).unwrap();
            reply
        });
        expect_sent(&mut stub, b"$c#63").await;
        tokio::task::yield_now().await;
        assert!(!task.is_finished(), "no reply has been sent yet");

        let outcome = canceller
            .cancel_read(async { task.await.expect("exchange task panicked") })
            .await
            .unwrap();
        assert_eq!(outcome, None);

        let mut pres = rx.await.unwrap();
        assert_eq!(pres.phase(), Phase::AwaitingReply);
        stub.write_all(b"+").await.unwrap();
        stub.write_all(&frame(b"S05")).await.unwrap();
        let reply = pres.exchange(HaltReason).await.unwrap();
        assert_eq!(reply, StopReply::Signal(5));
    }

    #[tokio::test]
    async fn cancelling_a_completed_read_is_a_no_op() {
        let (mut pres, mut stub) = presentation();
        let canceller = pres.canceller();
        stub.write_all(b"+").await.unwrap();
        stub.write_all(&frame(b"S05")).await.unwrap();

        let task = tokio::spawn(async move {
            let reply = pres.exchange(HaltReason).await;
            reply.map(|reply| (pres, reply))
        });
        while !task.is_finished() {
            tokio::task::yield_now().await;
        }

        let outcome = canceller
            .cancel_read(async { task.await.expect("exchange task panicked") })
            .await
            .unwrap();
        let (mut pres, reply) = outcome.expect("completed read is handed back");
        assert_eq!(reply, StopReply::Signal(5));

        stub.write_all(b"+").await.unwrap();
        stub.write_all(&frame(b"S09")).await.unwrap();
        let reply = pres.exchange(HaltReason).await.unwrap();
        assert_eq!(reply, StopReply::Signal(9));
    }
}
