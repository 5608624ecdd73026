//! The local receiver: binds the command socket and services one request
//! per connection, exactly as `original_source/erddaputil/main/main.py`'s
//! `CommandReceiver` does (`select()`-gated `accept`, handle, close).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::core::command::CommandResponse;
use crate::core::errors::CoreError;
use crate::core::registry::CommandRegistry;
use crate::core::router::{END_OF_TRANSMISSION, read_until_eot};
use crate::core::serializer::Serializer;

pub struct Receiver {
    addr: SocketAddr,
    read_timeout: Duration,
    serializer: Arc<Serializer>,
    registry: Arc<CommandRegistry>,
}

impl Receiver {
    pub fn new(
        addr: SocketAddr,
        read_timeout: Duration,
        serializer: Arc<Serializer>,
        registry: Arc<CommandRegistry>,
    ) -> Self {
        Self {
            addr,
            read_timeout,
            serializer,
            registry,
        }
    }

    /// Runs until `halt` fires. Every accepted connection is handled
    /// inline (one request per connection, matching the original) rather
    /// than spawned, since control-plane traffic is low-volume and this
    /// keeps `tidy()` cadence predictable between accepts.
    pub async fn run(self, mut halt: broadcast::Receiver<()>) -> Result<(), CoreError> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "local command receiver listening");

        loop {
            tokio::select! {
                biased;
                _ = halt.recv() => {
                    tracing::info!("local command receiver shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = self.handle_connection(stream).await {
                                tracing::warn!(%peer, error = %e, "command connection failed");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                    self.registry.tidy();
                }
            }
        }
    }

    /// Always writes exactly one response envelope back before returning,
    /// even when the frame never decodes into a command — a malformed
    /// frame, a read timeout, or a signature mismatch all get converted
    /// into an error response rather than silently dropping the
    /// connection (spec.md §4.4, §7, and testable property "envelope
    /// tamper detection").
    async fn handle_connection(&self, mut stream: tokio::net::TcpStream) -> Result<(), CoreError> {
        let resp = match self.read_and_route(&mut stream).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(error = %e, "command request failed before routing");
                CommandResponse::error(String::new(), &e)
            }
        };
        let mut out = self.serializer.serialize(&resp)?.into_bytes();
        out.push(END_OF_TRANSMISSION);
        stream.write_all(&out).await?;
        Ok(())
    }

    async fn read_and_route(&self, stream: &mut tokio::net::TcpStream) -> Result<CommandResponse, CoreError> {
        let raw = tokio::time::timeout(self.read_timeout, read_until_eot(stream))
            .await
            .map_err(|_| CoreError::transport("timed out awaiting command"))??;
        let text = std::str::from_utf8(&raw)?;
        let cmd = self.serializer.unserialize(text)?;

        let span = tracing::info_span!("command", name = %cmd_name(&cmd), guid = %cmd_guid(&cmd));
        let _enter = span.enter();

        Ok(self.registry.route(&cmd))
    }
}

fn cmd_name(cmd: &crate::core::command::Command) -> &str {
    &cmd.name
}

fn cmd_guid(cmd: &crate::core::command::Command) -> &str {
    &cmd.guid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::{Command, CommandResponse};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn serves_one_request_and_keeps_listening() {
        let serializer = Arc::new(Serializer::new("secret"));
        let registry = Arc::new(CommandRegistry::new());
        registry.register(
            "ping",
            Arc::new(|cmd: &Command| Ok(CommandResponse::ok(cmd.guid.clone()))),
        );

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let receiver = Receiver::new(addr, Duration::from_secs(1), serializer.clone(), registry);
        let (halt_tx, halt_rx) = broadcast::channel(1);
        let handle = tokio::spawn(receiver.run(halt_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = serializer.serialize(&Command::new("ping")).unwrap().into_bytes();
        framed.push(END_OF_TRANSMISSION);
        stream.write_all(&framed).await.unwrap();

        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        let text = std::str::from_utf8(&buf[..n - 1]).unwrap();
        let resp: CommandResponse = serializer.unserialize(text).unwrap();
        assert!(resp.is_success());

        halt_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn a_tampered_envelope_still_gets_exactly_one_error_response() {
        let serializer = Arc::new(Serializer::new("secret"));
        let registry = Arc::new(CommandRegistry::new());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let receiver = Receiver::new(addr, Duration::from_secs(1), serializer.clone(), registry);
        let (halt_tx, halt_rx) = broadcast::channel(1);
        let handle = tokio::spawn(receiver.run(halt_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = b"not-a-valid-envelope".to_vec();
        framed.push(END_OF_TRANSMISSION);
        stream.write_all(&framed).await.unwrap();

        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        let text = std::str::from_utf8(&buf[..n - 1]).unwrap();
        let resp: CommandResponse = serializer.unserialize(text).unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.message["kind"], "integrity_error");

        halt_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
