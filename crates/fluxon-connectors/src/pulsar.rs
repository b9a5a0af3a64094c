//! Pulsar producer adapter.
//!
//! The pipeline's publisher runs on a plain OS thread; the Pulsar
//! client is async, so the adapter owns a current-thread runtime and
//! blocks on each send. The bus only ever sees opaque byte payloads.

use fluxon_core::error::{Error, Result};
use fluxon_core::publish::{BusProducer, DEFAULT_MAX_MESSAGE_SIZE};

use pulsar::producer::{Message, ProducerOptions};
use pulsar::{Pulsar, SerializeMessage, TokioExecutor};

/// Pulsar batching producer options.
#[derive(Debug, Clone)]
pub struct BatchingOptions {
    /// Maximum messages per batch.
    pub max_messages: u32,
    /// Maximum bytes per batch.
    pub max_bytes: usize,
}

/// Pulsar connection options.
#[derive(Debug, Clone)]
pub struct PulsarOptions {
    /// Broker service URL.
    pub url: String,
    /// Topic to publish on.
    pub topic: String,
    /// Maximum message size accepted by the broker; the resizer and
    /// serializer ceilings derive from this.
    pub max_message_size: usize,
    /// Producer name; the broker derives one when absent.
    pub producer_name: Option<String>,
    /// Batching configuration; disabled when absent.
    pub batching: Option<BatchingOptions>,
}

impl Default for PulsarOptions {
    fn default() -> Self {
        Self {
            url: "pulsar://localhost:6650/".into(),
            topic: "persistent://public/default/fluxon".into(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            producer_name: None,
            batching: None,
        }
    }
}

impl PulsarOptions {
    /// Logs the connection parameters at info level.
    pub fn log(&self) {
        tracing::info!("Pulsar:");
        tracing::info!("  URL           : {}", self.url);
        tracing::info!("  Topic         : {}", self.topic);
        tracing::info!("  Max msg. size : {} B", self.max_message_size);
        match &self.batching {
            Some(b) => {
                tracing::info!("  Batching      : enabled");
                tracing::info!("    Max messages: {}", b.max_messages);
                tracing::info!("    Max bytes   : {} B", b.max_bytes);
            }
            None => tracing::info!("  Batching      : disabled"),
        }
    }
}

/// An already-serialized IPC message; published as-is.
struct RawPayload(Vec<u8>);

impl SerializeMessage for RawPayload {
    fn serialize_message(input: Self) -> std::result::Result<Message, pulsar::Error> {
        Ok(Message {
            payload: input.0,
            ..Message::default()
        })
    }
}

/// Blocking [`BusProducer`] over the async Pulsar client.
pub struct PulsarProducer {
    runtime: tokio::runtime::Runtime,
    producer: pulsar::producer::Producer<TokioExecutor>,
    // The client owns the connection pool backing the producer.
    _client: Pulsar<TokioExecutor>,
}

impl PulsarProducer {
    /// Connects the client and creates the producer.
    ///
    /// # Errors
    ///
    /// Returns `Error::Bus` when the client or producer cannot be set
    /// up.
    pub fn connect(opts: &PulsarOptions) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Bus(format!("cannot build producer runtime: {e}")))?;

        let url = opts.url.clone();
        let topic = opts.topic.clone();
        let name = opts.producer_name.clone();
        let batching = opts.batching.clone();

        let (client, producer) = runtime
            .block_on(async move {
                let client = Pulsar::builder(url, TokioExecutor).build().await?;

                let mut producer_opts = ProducerOptions::default();
                if let Some(batching) = batching {
                    producer_opts.batch_size = Some(batching.max_messages);
                    producer_opts.batch_byte_size = Some(batching.max_bytes);
                }

                let mut builder = client
                    .producer()
                    .with_topic(topic)
                    .with_options(producer_opts);
                if let Some(name) = name {
                    builder = builder.with_name(name);
                }
                let producer = builder.build().await?;
                Ok::<_, pulsar::Error>((client, producer))
            })
            .map_err(|e| Error::Bus(format!("cannot set up Pulsar producer: {e}")))?;

        Ok(Self {
            runtime,
            producer,
            _client: client,
        })
    }
}

impl BusProducer for PulsarProducer {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        let message = RawPayload(payload.to_vec());
        self.runtime
            .block_on(async {
                let receipt = self.producer.send_non_blocking(message).await?;
                receipt.await?;
                Ok::<_, pulsar::Error>(())
            })
            .map_err(|e| Error::Bus(format!("send failed: {e}")))
    }
}
