//! Minimal QMP client: enough to ask the guest to power down.

use std::time::Duration;

use facet::Facet;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::VmError;

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct QmpErrorReply {
    error: QmpError,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct QmpError {
    #[facet(default)]
    class: String,
    #[facet(default)]
    desc: String,
}

fn qmp_err(message: impl Into<String>) -> VmError {
    VmError::ExternalCommand {
        command: "qmp".into(),
        message: message.into(),
    }
}

/// Negotiate capabilities and send `system_powerdown` (an ACPI power
/// button press). Returns once QEMU acknowledges; the guest shuts down
/// asynchronously.
pub async fn system_powerdown(port: u16, timeout: Duration) -> Result<(), VmError> {
    tokio::time::timeout(timeout, powerdown(port))
        .await
        .map_err(|_| qmp_err(format!("no response on 127.0.0.1:{port}")))?
}

async fn powerdown(port: u16) -> Result<(), VmError> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|e| qmp_err(format!("connecting to 127.0.0.1:{port}: {e}")))?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let greeting = next_line(&mut lines).await?;
    if !greeting.contains("\"QMP\"") {
        return Err(qmp_err(format!("unexpected greeting: {greeting}")));
    }

    for command in ["qmp_capabilities", "system_powerdown"] {
        writer
            .write_all(format!("{{\"execute\":\"{command}\"}}\n").as_bytes())
            .await
            .map_err(|e| qmp_err(format!("sending {command}: {e}")))?;
        await_reply(&mut lines, command).await?;
    }
    tracing::debug!(port, "QMP system_powerdown acknowledged");
    Ok(())
}

type Lines = tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>;

async fn next_line(lines: &mut Lines) -> Result<String, VmError> {
    lines
        .next_line()
        .await
        .map_err(|e| qmp_err(format!("reading: {e}")))?
        .ok_or_else(|| qmp_err("connection closed"))
}

/// Skip asynchronous events until the command's reply arrives.
async fn await_reply(lines: &mut Lines, command: &str) -> Result<(), VmError> {
    loop {
        let line = next_line(lines).await?;
        if line.contains("\"return\"") {
            return Ok(());
        }
        if line.contains("\"error\"") {
            let reply: QmpErrorReply = facet_json::from_str(&line).unwrap_or_default();
            return Err(qmp_err(format!(
                "{command} rejected: {} {}",
                reply.error.class, reply.error.desc
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn fake_qmp(replies: Vec<&'static str>) -> (u16, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            writer
                .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
                .await
                .unwrap();
            let mut received = Vec::new();
            for reply in replies {
                let Ok(Some(line)) = lines.next_line().await else {
                    break;
                };
                received.push(line);
                writer.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        });
        (port, handle)
    }

    #[tokio::test]
    async fn powerdown_negotiates_then_sends_command() {
        let (port, server) = fake_qmp(vec![
            "{\"return\": {}}\n",
            "{\"event\": \"POWERDOWN\", \"timestamp\": {}}\n{\"return\": {}}\n",
        ])
        .await;
        system_powerdown(port, Duration::from_secs(2)).await.unwrap();
        let received = server.await.unwrap();
        assert_eq!(received.len(), 2);
        assert!(received[0].contains("qmp_capabilities"));
        assert!(received[1].contains("system_powerdown"));
    }

    #[tokio::test]
    async fn error_reply_is_reported() {
        let (port, _server) = fake_qmp(vec![
            "{\"return\": {}}\n",
            "{\"error\": {\"class\": \"GenericError\", \"desc\": \"no ACPI\"}}\n",
        ])
        .await;
        let err = system_powerdown(port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("qmp failed"));
        assert!(format!("{err:?}").contains("no ACPI"));
    }

    #[tokio::test]
    async fn nothing_listening_fails() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        assert!(system_powerdown(port, Duration::from_secs(1)).await.is_err());
    }
}
