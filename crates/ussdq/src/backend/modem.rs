//! GSM modem backend speaking AT commands over a serial port.
//!
//! One modem (or one modem port) per SIM slot. A dial is a single
//! `AT+CUSD=1,"<code>",15` request answered by an unsolicited `+CUSD:` report.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_serial::SerialPortBuilderExt;

use super::{ExecutionBackend, ExecutionError};

/// Data coding scheme sent with requests (GSM 7-bit default alphabet).
const DCS_GSM7: u8 = 15;

#[derive(Debug, Clone)]
pub struct ModemBackend {
    ports: BTreeMap<u32, PathBuf>,
    baud_rate: u32,
}

impl ModemBackend {
    pub fn new(ports: BTreeMap<u32, PathBuf>, baud_rate: u32) -> Self {
        Self { ports, baud_rate }
    }
}

#[async_trait]
impl ExecutionBackend for ModemBackend {
    async fn execute(&self, code: &str, sim_slot: u32) -> Result<String, ExecutionError> {
        let path = self
            .ports
            .get(&sim_slot)
            .ok_or(ExecutionError::UnknownSlot(sim_slot))?;

        log::debug!("Opening modem {} for SIM {}", path.display(), sim_slot);
        let stream = tokio_serial::new(path.to_string_lossy(), self.baud_rate)
            .open_native_async()
            .map_err(|e| {
                ExecutionError::Modem(format!("failed to open modem {}: {}", path.display(), e))
            })?;

        run_session(stream, code).await
    }

    fn name(&self) -> &'static str {
        "modem"
    }
}

/// A parsed `+CUSD:` unsolicited result.
#[derive(Debug, PartialEq, Eq)]
struct CusdReport {
    status: u8,
    text: Option<String>,
}

fn parse_cusd(body: &str) -> Result<CusdReport, ExecutionError> {
    let body = body.trim();
    let (status, rest) = match body.split_once(',') {
        Some((status, rest)) => (status, Some(rest.trim())),
        None => (body, None),
    };
    let status: u8 = status
        .trim()
        .parse()
        .map_err(|_| ExecutionError::Modem(format!("malformed +CUSD report: {}", body)))?;

    let text = rest.and_then(|rest| {
        let rest = rest.strip_prefix('"')?;
        let end = rest.rfind('"')?;
        Some(rest[..end].to_string())
    });

    Ok(CusdReport { status, text })
}

fn quotes_balanced(s: &str) -> bool {
    s.matches('"').count() % 2 == 0
}

/// Runs one USSD request over an open modem stream.
pub async fn run_session<S>(stream: S, code: &str) -> Result<String, ExecutionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    let request = format!("AT+CUSD=1,\"{}\",{}\r", code, DCS_GSM7);
    writer.write_all(request.as_bytes()).await?;
    writer.flush().await?;

    loop {
        let line = lines
            .next_line()
            .await?
            .ok_or_else(|| ExecutionError::Modem("modem closed the connection".to_string()))?;
        let line = line.trim();

        if line.is_empty() || line == "OK" || line.starts_with("AT") {
            continue;
        }
        if line == "ERROR" || line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR") {
            return Err(ExecutionError::Modem(format!(
                "modem rejected request: {}",
                line
            )));
        }

        let Some(body) = line.strip_prefix("+CUSD:") else {
            log::debug!("Ignoring modem line: {}", line);
            continue;
        };

        // Network replies may span several lines inside the quotes.
        let mut body = body.to_string();
        while !quotes_balanced(&body) {
            match lines.next_line().await? {
                Some(more) => {
                    body.push('\n');
                    body.push_str(more.trim_end());
                }
                None => break,
            }
        }

        let report = parse_cusd(&body)?;
        if report.status == 1 {
            // The network wants a follow-up; close the session instead.
            writer.write_all(b"AT+CUSD=2\r").await?;
            writer.flush().await?;
        }

        return match report.status {
            0 | 1 => report
                .text
                .ok_or_else(|| ExecutionError::Modem("empty USSD response".to_string())),
            2 => Err(ExecutionError::Modem(
                "USSD session terminated by network".to_string(),
            )),
            4 => Err(ExecutionError::Modem(
                "USSD operation not supported".to_string(),
            )),
            5 => Err(ExecutionError::Modem("network timeout".to_string())),
            other => Err(ExecutionError::Modem(format!(
                "unexpected USSD status {}",
                other
            ))),
        };
    }
}
