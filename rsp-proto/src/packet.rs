//! Command packets and the replies they produce.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_till, take_till1, take_while_m_n};
use nom::character::complete::{char, hex_digit1};
use nom::combinator::{all_consuming, map, map_res, opt};
use nom::multi::many0;
use nom::sequence::{preceded, separated_pair, terminated};
use nom::{IResult, Parser};
use serde::Serialize;

use crate::codec::FrameError;

/// A request understood by a debug stub.
///
/// The reply to a command is interpreted by that command: the codec never
/// guesses the meaning of a payload on its own. New command/reply pairs plug
/// in by implementing this trait.
pub trait Command {
    /// Decoded form of a successful reply.
    type Reply;

    /// Leading payload characters identifying the command.
    fn opcode(&self) -> &'static str;

    /// Formats the arguments that follow the opcode.
    fn arguments(&self) -> String {
        String::new()
    }

    /// Interprets the payload of a reply to this command.
    fn parse_reply(&self, payload: &[u8]) -> Result<Self::Reply, FrameError>;

    /// Canonical unescaped payload: opcode followed by its arguments.
    fn payload(&self) -> String {
        format!("{}{}", self.opcode(), self.arguments())
    }
}

/// Generic reply envelope, checked before the command's own rule applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response<R> {
    /// The command's reply.
    Reply(R),
    /// `Exx`: the stub reported an error code.
    Error(u8),
    /// Empty payload: the stub does not implement the command.
    Unsupported,
}

impl<R> Response<R> {
    /// Classifies `payload`, deferring to `rule` for ordinary replies.
    pub fn parse(
        payload: &[u8],
        rule: impl FnOnce(&[u8]) -> Result<R, FrameError>,
    ) -> Result<Self, FrameError> {
        match payload {
            [] => Ok(Self::Unsupported),
            [b'E', hi, lo] if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                let code = hex::decode([*hi, *lo]).map_err(payload_error)?;
                Ok(Self::Error(code[0]))
            }
            _ => rule(payload).map(Self::Reply),
        }
    }
}

/// Why the target stopped, as reported by `S`, `T`, `W` and `X` replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum StopReply {
    /// `Sxx`: stopped by a signal.
    Signal(u8),
    /// `Txx n:r;...`: stopped by a signal, with extra stop information.
    Stopped {
        /// Signal number.
        signal: u8,
        /// `name:value` pairs, in wire order.
        info: Vec<(String, String)>,
    },
    /// `Wxx`: the process exited with a status.
    Exited(u8),
    /// `Xxx`: the process was terminated by a signal.
    Terminated(u8),
}

impl StopReply {
    /// Parses a stop reply payload.
    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(payload).map_err(payload_error)?;
        stop_reply(text)
            .map(|(_, reply)| reply)
            .map_err(payload_error)
    }

    /// Signal number carried by the reply, if the target is still alive.
    pub const fn signal(&self) -> Option<u8> {
        match self {
            Self::Signal(signal) | Self::Stopped { signal, .. } => Some(*signal),
            Self::Exited(_) | Self::Terminated(_) => None,
        }
    }
}

/// Value of a single register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum Register {
    /// Raw register bytes in target order.
    Value(Vec<u8>),
    /// The stub cannot read the register (`xx...`).
    Unavailable,
}

/// `m addr,length`: read target memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ReadMemory {
    /// Start address.
    pub addr: u64,
    /// Number of bytes.
    pub length: u64,
}

impl ReadMemory {
    /// Creates a read of `length` bytes at `addr`.
    pub const fn new(addr: u64, length: u64) -> Self {
        Self { addr, length }
    }
}

impl Command for ReadMemory {
    type Reply = Vec<u8>;

    fn opcode(&self) -> &'static str {
        "m"
    }

    fn arguments(&self) -> String {
        format!("{:x},{:x}", self.addr, self.length)
    }

    fn parse_reply(&self, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        hex::decode(payload).map_err(payload_error)
    }
}

/// `M addr,length:XX...`: write target memory.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct WriteMemory {
    /// Start address.
    pub addr: u64,
    /// Bytes to store.
    pub data: Vec<u8>,
}

impl WriteMemory {
    /// Creates a write of `data` at `addr`.
    pub const fn new(addr: u64, data: Vec<u8>) -> Self {
        Self { addr, data }
    }
}

impl Command for WriteMemory {
    type Reply = ();

    fn opcode(&self) -> &'static str {
        "M"
    }

    fn arguments(&self) -> String {
        format!(
            "{:x},{:x}:{}",
            self.addr,
            self.data.len(),
            hex::encode(&self.data)
        )
    }

    fn parse_reply(&self, payload: &[u8]) -> Result<(), FrameError> {
        expect_ok(payload)
    }
}

/// `g`: read all general registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadRegisters;

impl Command for ReadRegisters {
    type Reply = Vec<u8>;

    fn opcode(&self) -> &'static str {
        "g"
    }

    fn parse_reply(&self, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        hex::decode(payload).map_err(payload_error)
    }
}

/// `p n`: read one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ReadRegister {
    /// Architecture-specific register number.
    pub number: u32,
}

impl ReadRegister {
    /// Creates a read of register `number`.
    pub const fn new(number: u32) -> Self {
        Self { number }
    }
}

impl Command for ReadRegister {
    type Reply = Register;

    fn opcode(&self) -> &'static str {
        "p"
    }

    fn arguments(&self) -> String {
        format!("{:x}", self.number)
    }

    fn parse_reply(&self, payload: &[u8]) -> Result<Register, FrameError> {
        if payload.iter().all(|&b| b == b'x') {
            return Ok(Register::Unavailable);
        }
        hex::decode(payload)
            .map(Register::Value)
            .map_err(payload_error)
    }
}

/// `P n=XX...`: write one register.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct WriteRegister {
    /// Architecture-specific register number.
    pub number: u32,
    /// Raw value in target order.
    pub value: Vec<u8>,
}

impl WriteRegister {
    /// Creates a write of `value` into register `number`.
    pub const fn new(number: u32, value: Vec<u8>) -> Self {
        Self { number, value }
    }
}

impl Command for WriteRegister {
    type Reply = ();

    fn opcode(&self) -> &'static str {
        "P"
    }

    fn arguments(&self) -> String {
        format!("{:x}={}", self.number, hex::encode(&self.value))
    }

    fn parse_reply(&self, payload: &[u8]) -> Result<(), FrameError> {
        expect_ok(payload)
    }
}

/// `c [addr]`: resume execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Continue {
    /// Address to resume at; the current PC when `None`.
    pub addr: Option<u64>,
}

impl Continue {
    /// Resumes at `addr` instead of the current PC.
    pub const fn at(addr: u64) -> Self {
        Self { addr: Some(addr) }
    }
}

impl Command for Continue {
    type Reply = StopReply;

    fn opcode(&self) -> &'static str {
        "c"
    }

    fn arguments(&self) -> String {
        self.addr.map(|a| format!("{a:x}")).unwrap_or_default()
    }

    fn parse_reply(&self, payload: &[u8]) -> Result<StopReply, FrameError> {
        StopReply::parse(payload)
    }
}

/// `s [addr]`: execute a single instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Step {
    /// Address to step from; the current PC when `None`.
    pub addr: Option<u64>,
}

impl Step {
    /// Steps from `addr` instead of the current PC.
    pub const fn at(addr: u64) -> Self {
        Self { addr: Some(addr) }
    }
}

impl Command for Step {
    type Reply = StopReply;

    fn opcode(&self) -> &'static str {
        "s"
    }

    fn arguments(&self) -> String {
        self.addr.map(|a| format!("{a:x}")).unwrap_or_default()
    }

    fn parse_reply(&self, payload: &[u8]) -> Result<StopReply, FrameError> {
        StopReply::parse(payload)
    }
}

/// `?`: ask why the target halted.
///
/// Also the interpretation context for the reply to an interrupt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HaltReason;

impl Command for HaltReason {
    type Reply = StopReply;

    fn opcode(&self) -> &'static str {
        "?"
    }

    fn parse_reply(&self, payload: &[u8]) -> Result<StopReply, FrameError> {
        StopReply::parse(payload)
    }
}

/// `D`: detach from the target, letting it run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Detach;

impl Command for Detach {
    type Reply = ();

    fn opcode(&self) -> &'static str {
        "D"
    }

    fn parse_reply(&self, payload: &[u8]) -> Result<(), FrameError> {
        expect_ok(payload)
    }
}

/// Accepts only the literal `OK` reply.
fn expect_ok(payload: &[u8]) -> Result<(), FrameError> {
    if payload == b"OK" {
        Ok(())
    } else {
        Err(FrameError::Payload(format!(
            "expected OK, got {:?}",
            String::from_utf8_lossy(payload)
        )))
    }
}

/// Wraps any parse failure as a payload error.
#[allow(clippy::needless_pass_by_value)]
fn payload_error(e: impl ToString) -> FrameError {
    FrameError::Payload(e.to_string())
}

/// Two hex digits as a byte.
fn hex_u8(input: &str) -> IResult<&str, u8> {
    map_res(
        take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        |s| u8::from_str_radix(s, 16),
    )
    .parse(input)
}

/// One `name:value;` stop information field.
fn stop_field(input: &str) -> IResult<&str, (String, String)> {
    map(
        terminated(
            separated_pair(
                take_till1(|c: char| c == ':'),
                char(':'),
                take_till(|c: char| c == ';'),
            ),
            char(';'),
        ),
        |(name, value): (&str, &str)| (name.to_owned(), value.to_owned()),
    )
    .parse(input)
}

/// Any of the four stop reply forms. `W` and `X` may carry a trailing
/// `;process:pid` suffix, which is ignored.
fn stop_reply(input: &str) -> IResult<&str, StopReply> {
    alt((
        all_consuming(map(preceded(char('S'), hex_u8), StopReply::Signal)),
        all_consuming(map(
            (preceded(char('T'), hex_u8), many0(stop_field)),
            |(signal, info)| StopReply::Stopped { signal, info },
        )),
        all_consuming(map(
            terminated(preceded(char('W'), hex_u8), process_suffix),
            StopReply::Exited,
        )),
        all_consuming(map(
            terminated(preceded(char('X'), hex_u8), process_suffix),
            StopReply::Terminated,
        )),
    ))
    .parse(input)
}

/// Optional `;process:pid` suffix of `W` and `X` replies.
fn process_suffix(input: &str) -> IResult<&str, Option<&str>> {
    opt(preceded(tag(";process:"), hex_digit1)).parse(input)
}
