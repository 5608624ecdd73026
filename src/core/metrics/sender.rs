//! Background task that batches metric samples and POSTs them to an
//! external sink. Grounded on
//! `original_source/erddaputil/main/metrics.py::LocalPrometheusSendThread`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use url::Url;

use crate::core::errors::CoreError;

#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub metric_type: &'static str,
    pub metric_name: String,
    pub labels: BTreeMap<String, String>,
    pub description: String,
    pub method: &'static str,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct MetricSenderConfig {
    pub push_url: Url,
    pub username: Option<String>,
    pub password: Option<String>,
    pub batch_size: usize,
    pub batch_wait: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

pub struct MetricSender {
    config: MetricSenderConfig,
    rx: mpsc::Receiver<MetricSample>,
    client: reqwest::Client,
}

impl MetricSender {
    pub fn new(config: MetricSenderConfig, rx: mpsc::Receiver<MetricSample>) -> Self {
        Self {
            config,
            rx,
            client: reqwest::Client::new(),
        }
    }

    /// Drains samples in batches until `halt` fires, then drains whatever
    /// remains with a single best-effort attempt (the original's "halt
    /// collapses `max_retries` to 1").
    pub async fn run(mut self, mut halt: tokio::sync::broadcast::Receiver<()>) -> Result<(), CoreError> {
        loop {
            let mut batch = Vec::with_capacity(self.config.batch_size);
            let halted = tokio::select! {
                biased;
                _ = halt.recv() => true,
                () = self.fill_batch(&mut batch) => false,
            };

            if !batch.is_empty() {
                let retries = if halted { 1 } else { self.config.max_retries };
                if let Err(e) = self.send_batch(&batch, retries).await {
                    tracing::warn!(error = %e, count = batch.len(), "dropping metric batch after exhausting retries");
                }
            }

            if halted {
                // Drain anything still buffered in the channel, one final
                // best-effort push, then stop.
                let mut tail = Vec::new();
                while let Ok(sample) = self.rx.try_recv() {
                    tail.push(sample);
                }
                if !tail.is_empty() {
                    let _ = self.send_batch(&tail, 1).await;
                }
                return Ok(());
            }
        }
    }

    /// Fills `batch` up to `batch_size`, waiting up to `batch_wait` for a
    /// partial fill once at least one sample has arrived — matching the
    /// original's `max_messages_to_send`/`message_wait_time` pair.
    async fn fill_batch(&mut self, batch: &mut Vec<MetricSample>) {
        match self.rx.recv().await {
            Some(first) => batch.push(first),
            None => return,
        }
        let deadline = tokio::time::sleep(self.config.batch_wait);
        tokio::pin!(deadline);
        while batch.len() < self.config.batch_size {
            tokio::select! {
                biased;
                sample = self.rx.recv() => match sample {
                    Some(sample) => batch.push(sample),
                    None => return,
                },
                () = &mut deadline => return,
            }
        }
    }

    async fn send_batch(&self, batch: &[MetricSample], max_retries: u32) -> Result<(), CoreError> {
        let body = serde_json::json!({ "metrics": batch });
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut req = self.client.post(self.config.push_url.clone()).json(&body);
            if let Some(user) = &self.config.username {
                req = req.basic_auth(user, self.config.password.as_ref());
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    tracing::warn!(status = %resp.status(), attempt, "metric push rejected");
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "metric push failed");
                }
            }
            if attempt >= max_retries {
                return Err(CoreError::transport(format!(
                    "metric push failed after {attempt} attempt(s)"
                )));
            }
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> MetricSample {
        MetricSample {
            metric_type: "counter",
            metric_name: name.to_string(),
            labels: BTreeMap::new(),
            description: "test".to_string(),
            method: "inc",
            arguments: serde_json::json!({"amount": 1.0}),
        }
    }

    #[tokio::test]
    async fn fill_batch_respects_batch_size() {
        let (tx, rx) = mpsc::channel(8);
        let config = MetricSenderConfig {
            push_url: Url::parse("http://127.0.0.1:0/push").unwrap(),
            username: None,
            password: None,
            batch_size: 2,
            batch_wait: Duration::from_millis(200),
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
        };
        let mut sender = MetricSender::new(config, rx);
        tx.send(sample("a")).await.unwrap();
        tx.send(sample("b")).await.unwrap();
        tx.send(sample("c")).await.unwrap();

        let mut batch = Vec::new();
        sender.fill_batch(&mut batch).await;
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn fill_batch_returns_early_on_partial_fill_timeout() {
        let (tx, rx) = mpsc::channel(8);
        let config = MetricSenderConfig {
            push_url: Url::parse("http://127.0.0.1:0/push").unwrap(),
            username: None,
            password: None,
            batch_size: 10,
            batch_wait: Duration::from_millis(50),
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
        };
        let mut sender = MetricSender::new(config, rx);
        tx.send(sample("a")).await.unwrap();

        let mut batch = Vec::new();
        sender.fill_batch(&mut batch).await;
        assert_eq!(batch.len(), 1);
    }
}
