//! The command router: fans a [`Command`] out to the local daemon and, if
//! configured and the command's scope allows it, to the message broker.
//!
//! Grounded on `original_source/erddaputil/main/commands.py`
//! (`CommandAndControl.send_command`): try the broker first when the scope
//! calls for it, then always deliver locally, and let the local response
//! win when both paths run.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::core::broker::{BrokerAdapter, PublishTarget};
use crate::core::command::{Command, CommandResponse};
use crate::core::errors::CoreError;
use crate::core::serializer::Serializer;

/// Trailing byte the local receiver framing protocol uses to mark the end
/// of a message (the original's `b"\4"`, ASCII EOT).
pub const END_OF_TRANSMISSION: u8 = 0x04;

pub struct Router {
    local_addr: SocketAddr,
    read_timeout: Duration,
    serializer: Arc<Serializer>,
    broker: Arc<dyn BrokerAdapter>,
    hostname: String,
}

impl Router {
    pub fn new(
        local_addr: SocketAddr,
        read_timeout: Duration,
        serializer: Arc<Serializer>,
        broker: Arc<dyn BrokerAdapter>,
        hostname: String,
    ) -> Self {
        Self {
            local_addr,
            read_timeout,
            serializer,
            broker,
            hostname,
        }
    }

    /// Sends `cmd`, publishing to the broker first (if its scope and the
    /// broker's validity allow it) and always delivering locally. The
    /// local response is authoritative; the broker path is fire-and-forget
    /// from the caller's point of view, matching the original.
    pub async fn send(&self, mut cmd: Command) -> Result<CommandResponse, CoreError> {
        if cmd.broadcast_scope != crate::core::command::BroadcastScope::None && self.broker.is_valid() {
            cmd.ignore_host(self.hostname.clone());
            let target = match cmd.broadcast_scope {
                crate::core::command::BroadcastScope::Global => PublishTarget::Global,
                _ => PublishTarget::Cluster,
            };
            let envelope = self.serializer.serialize(&cmd)?;
            if let Err(e) = self.broker.publish(&envelope, target).await {
                tracing::warn!(guid = %cmd.guid, error = %e, "broker publish failed, continuing with local delivery");
            }
        }

        self.send_local(&cmd).await
    }

    async fn send_local(&self, cmd: &Command) -> Result<CommandResponse, CoreError> {
        let envelope = self.serializer.serialize(cmd)?;
        let mut stream = tokio::time::timeout(self.read_timeout, TcpStream::connect(self.local_addr))
            .await
            .map_err(|_| CoreError::transport("timed out connecting to local daemon"))??;

        let mut framed = envelope.into_bytes();
        framed.push(END_OF_TRANSMISSION);
        tokio::time::timeout(self.read_timeout, stream.write_all(&framed))
            .await
            .map_err(|_| CoreError::transport("timed out sending command"))??;

        let raw = tokio::time::timeout(self.read_timeout, read_until_eot(&mut stream))
            .await
            .map_err(|_| CoreError::transport("timed out awaiting response"))??;

        let text = std::str::from_utf8(&raw)?;
        self.serializer.unserialize(text)
    }
}

/// Reads from `stream` until an `END_OF_TRANSMISSION` byte is seen,
/// returning everything before it. Shared by the router's client path and
/// the local receiver's server path.
pub async fn read_until_eot(stream: &mut TcpStream) -> Result<Vec<u8>, CoreError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(CoreError::transport("connection closed before end marker"));
        }
        if let Some(pos) = chunk[..n].iter().position(|&b| b == END_OF_TRANSMISSION) {
            buf.extend_from_slice(&chunk[..pos]);
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::broker::NullBrokerAdapter;
    use crate::core::registry::CommandRegistry;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn send_local_round_trips_through_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serializer = Arc::new(Serializer::new("secret"));
        let registry = Arc::new(CommandRegistry::new());
        registry.register(
            "ping",
            Arc::new(|cmd: &Command| Ok(CommandResponse::ok(cmd.guid.clone()))),
        );

        let server_serializer = serializer.clone();
        let server_registry = registry.clone();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let raw = read_until_eot(&mut stream).await.unwrap();
            let text = std::str::from_utf8(&raw).unwrap();
            let cmd: Command = server_serializer.unserialize(text).unwrap();
            let resp = server_registry.route(&cmd);
            let mut out = server_serializer.serialize(&resp).unwrap().into_bytes();
            out.push(END_OF_TRANSMISSION);
            stream.write_all(&out).await.unwrap();
        });

        let router = Router::new(
            addr,
            Duration::from_secs(5),
            serializer,
            Arc::new(NullBrokerAdapter),
            "test-host".to_string(),
        );
        let resp = router.send(Command::new("ping")).await.unwrap();
        assert!(resp.is_success());
    }
}
