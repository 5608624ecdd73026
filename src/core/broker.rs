//! The message-broker interface. Only the interface and a `NullBrokerAdapter`
//! stub live in this crate — concrete AMQP/Azure Service Bus bindings are
//! out of scope (`original_source/erddaputil/ampq/ampq.py`'s
//! `_PikaHandler`/`_AzureServiceBusHandler`).

use async_trait::async_trait;

use crate::core::command::Command;
use crate::core::errors::CoreError;

/// A destination a command can be published toward, generalizing the
/// original's per-backend topic/queue naming
/// (`erddap.cluster.<cluster_name>` / `<prefix>_<cluster_name>_<hostname>`)
/// into the two-way distinction the router actually needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishTarget {
    Cluster,
    Global,
}

/// Implemented by a concrete broker binding. `is_valid` mirrors
/// `AmpqManager.is_valid` in the original: `false` whenever no backend
/// could be configured, in which case the router silently skips
/// broker fan-out rather than failing the command.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn is_valid(&self) -> bool;

    async fn publish(&self, envelope: &str, target: PublishTarget) -> Result<(), CoreError>;

    /// Runs until `halt` fires, invoking `on_message` for each envelope
    /// received from the broker. Implementations that are not valid should
    /// return `Ok(())` immediately rather than erroring, matching the
    /// original's guard of simply not starting `AmpqReceiver` when
    /// `is_valid` is false.
    async fn consume(
        &self,
        halt: tokio::sync::broadcast::Receiver<()>,
        on_message: BrokerMessageHandler,
    ) -> Result<(), CoreError>;
}

pub type BrokerMessageHandler = std::sync::Arc<dyn Fn(String) + Send + Sync>;

/// Used whenever no broker backend is configured or validated. Every
/// operation is an immediate no-op; `is_valid` is always `false` so the
/// router and supervisor never attempt to use it.
pub struct NullBrokerAdapter;

#[async_trait]
impl BrokerAdapter for NullBrokerAdapter {
    fn is_valid(&self) -> bool {
        false
    }

    async fn publish(&self, _envelope: &str, _target: PublishTarget) -> Result<(), CoreError> {
        Err(CoreError::transport("no broker is configured"))
    }

    async fn consume(
        &self,
        _halt: tokio::sync::broadcast::Receiver<()>,
        _on_message: BrokerMessageHandler,
    ) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Shared inbound-message handling for any broker backend: unserialize the
/// envelope, strip its broadcast scope so it can't be re-published, and
/// route it locally unless this host is already in `ignore_on_hosts`.
///
/// Grounded on `original_source/erddaputil/ampq/ampq.py::AmpqManager.handle_message`.
pub fn dispatch_inbound(
    envelope: &str,
    serializer: &crate::core::serializer::Serializer,
    registry: &crate::core::registry::CommandRegistry,
    local_hostname: &str,
) -> Result<(), CoreError> {
    let mut cmd: Command = serializer.unserialize(envelope)?;
    if cmd.ignore_on_hosts.iter().any(|h| h == local_hostname) {
        tracing::debug!(guid = %cmd.guid, "suppressing re-delivery loop for {}", local_hostname);
        return Ok(());
    }
    cmd.broadcast_scope = crate::core::command::BroadcastScope::None;
    registry.route(&cmd);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_adapter_is_never_valid() {
        let adapter = NullBrokerAdapter;
        assert!(!adapter.is_valid());
        assert!(adapter.publish("x", PublishTarget::Cluster).await.is_err());
    }

    #[test]
    fn dispatch_inbound_skips_hosts_already_seen() {
        let serializer = crate::core::serializer::Serializer::new("secret");
        let registry = crate::core::registry::CommandRegistry::new();
        let called = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = called.clone();
        registry.register(
            "noop",
            std::sync::Arc::new(move |cmd: &Command| {
                called_clone.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(crate::core::command::CommandResponse::ok(cmd.guid.clone()))
            }),
        );

        let mut cmd = Command::new("noop");
        cmd.ignore_host("host-a");
        let envelope = serializer.serialize(&cmd).unwrap();

        dispatch_inbound(&envelope, &serializer, &registry, "host-a").unwrap();
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));

        dispatch_inbound(&envelope, &serializer, &registry, "host-b").unwrap();
        assert!(called.load(std::sync::atomic::Ordering::SeqCst));
    }
}
