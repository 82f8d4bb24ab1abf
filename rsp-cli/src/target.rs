//! Subcommand handlers that talk to the stub and print replies.

use anyhow::{Context, Result};
use rsp::{Client, Register, StopReply};
use serde_json::json;

use crate::OutputFormat;

/// Bytes per hexdump line.
const DUMP_WIDTH: usize = 16;

pub async fn read_memory(
    client: &mut Client,
    address: u64,
    length: u64,
    format: OutputFormat,
) -> Result<()> {
    let data = client
        .read_memory(address, length)
        .await
        .with_context(|| format!("read {length} bytes at {address:#x}"))?;
    match format {
        OutputFormat::Json => print_json(&json!({
            "address": address,
            "data": hex::encode(&data),
        })),
        OutputFormat::Table => {
            print!("{}", hexdump(address, &data));
            Ok(())
        }
    }
}

pub async fn write_memory(client: &mut Client, address: u64, data: &str) -> Result<()> {
    let bytes = hex::decode(data).context("memory contents must be hex")?;
    let len = bytes.len();
    client
        .write_memory(address, bytes)
        .await
        .with_context(|| format!("write {len} bytes at {address:#x}"))?;
    eprintln!("wrote {len} bytes at {address:#x}");
    Ok(())
}

pub async fn registers(client: &mut Client, format: OutputFormat) -> Result<()> {
    let block = client.read_registers().await.context("read registers")?;
    match format {
        OutputFormat::Json => print_json(&json!({ "registers": hex::encode(&block) })),
        OutputFormat::Table => {
            print!("{}", hexdump(0, &block));
            Ok(())
        }
    }
}

pub async fn register(client: &mut Client, number: u32, format: OutputFormat) -> Result<()> {
    let register = client
        .read_register(number)
        .await
        .with_context(|| format!("read register {number}"))?;
    let value = match register {
        Register::Value(bytes) => Some(hex::encode(bytes)),
        _ => None,
    };
    match format {
        OutputFormat::Json => print_json(&json!({ "number": number, "value": value })),
        OutputFormat::Table => {
            println!("r{number:<4} {}", value.as_deref().unwrap_or("<unavailable>"));
            Ok(())
        }
    }
}

pub async fn set_register(client: &mut Client, number: u32, value: &str) -> Result<()> {
    let bytes = hex::decode(value).context("register value must be hex")?;
    client
        .write_register(number, bytes)
        .await
        .with_context(|| format!("write register {number}"))?;
    eprintln!("wrote register {number}");
    Ok(())
}

pub async fn halt_reason(client: &mut Client, format: OutputFormat) -> Result<()> {
    let stop = client.halt_reason().await.context("query halt reason")?;
    print_stop(&stop, format)
}

/// Continues until the target stops on its own or Ctrl-C interrupts it.
pub async fn resume(client: &mut Client, at: Option<u64>, format: OutputFormat) -> Result<()> {
    let canceller = client.canceller()?;
    let stopped = {
        let mut pending = Box::pin(client.resume(at));
        let finished = tokio::select! {
            reply = &mut pending => Some(reply),
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for Ctrl-C")?;
                None
            }
        };
        match finished {
            Some(reply) => Some(reply.context("continue")?),
            None => canceller.cancel_read(pending).await?,
        }
    };
    let stop = match stopped {
        Some(stop) => stop,
        None => {
            eprintln!("interrupting target");
            client.interrupt().await.context("interrupt")?
        }
    };
    print_stop(&stop, format)
}

pub async fn step(client: &mut Client, at: Option<u64>, format: OutputFormat) -> Result<()> {
    let stop = client.step(at).await.context("step")?;
    print_stop(&stop, format)
}

pub async fn interrupt(client: &mut Client, format: OutputFormat) -> Result<()> {
    let stop = client.interrupt().await.context("interrupt")?;
    print_stop(&stop, format)
}

pub async fn detach(client: &mut Client) -> Result<()> {
    client.detach().await.context("detach")?;
    eprintln!("detached");
    Ok(())
}

fn print_stop(stop: &StopReply, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(stop),
        OutputFormat::Table => {
            println!("{}", describe_stop(stop));
            Ok(())
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn describe_stop(stop: &StopReply) -> String {
    match stop {
        StopReply::Signal(signal) => format!("stopped: signal {signal}"),
        StopReply::Stopped { signal, info } => {
            let mut line = format!("stopped: signal {signal}");
            for (name, value) in info {
                line.push_str(&format!("  {name}={value}"));
            }
            line
        }
        StopReply::Exited(status) => format!("exited: status {status}"),
        StopReply::Terminated(signal) => format!("terminated: signal {signal}"),
        other => format!("{other:?}"),
    }
}

fn hexdump(base: u64, data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(DUMP_WIDTH).enumerate() {
        let offset = base.wrapping_add((row * DUMP_WIDTH) as u64);
        let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        out.push_str(&format!(
            "{offset:08x}  {:<width$}  {ascii}\n",
            bytes.join(" "),
            width = DUMP_WIDTH * 3 - 1
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hexdump_rows() {
        let data: Vec<u8> = (0x41..0x41 + 18).collect();
        let dump = hexdump(0x0200_0000, &data);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("02000000  41 42 43"));
        assert!(lines[0].ends_with("ABCDEFGHIJKLMNOP"));
        assert!(lines[1].starts_with("02000010  51 52"));
        assert!(lines[1].ends_with("QR"));
    }

    #[test]
    fn hexdump_masks_unprintable_bytes() {
        let dump = hexdump(0, &[0x00, b'a', 0xff]);
        assert!(dump.trim_end().ends_with(".a."));
    }

    #[test]
    fn describes_stops() {
        assert_eq!(describe_stop(&StopReply::Signal(5)), "stopped: signal 5");
        assert_eq!(describe_stop(&StopReply::Exited(0)), "exited: status 0");
        let stop = StopReply::Stopped {
            signal: 5,
            info: vec![("thread".into(), "01".into())],
        };
        assert_eq!(describe_stop(&stop), "stopped: signal 5  thread=01");
    }
}
