//! Command-line surface.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};

use fluxon_connectors::{BatchingOptions, ClientOptions, PulsarOptions};
use fluxon_core::convert::ConverterOptions;
use fluxon_core::error::{Error, Result};
use fluxon_core::parse::{BatteryOptions, ParserOptions, SoftwareOptions};
use fluxon_core::publish::DEFAULT_MAX_MESSAGE_SIZE;

use crate::stream::StreamOptions;

/// JSON to Arrow IPC conversion and Pulsar publishing tool.
#[derive(Debug, Parser)]
#[command(name = "fluxon", version, about)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Produce Pulsar messages from a JSON TCP stream.
    Stream(StreamArgs),

    /// Run micro-benchmarks on isolated pipeline stages.
    #[command(subcommand)]
    Bench(BenchCommand),
}

/// `stream` subcommand options.
#[derive(Debug, Args)]
pub struct StreamArgs {
    #[command(flatten)]
    pub pulsar: PulsarArgs,

    #[command(flatten)]
    pub client: ClientArgs,

    #[command(flatten)]
    pub converter: ConverterArgs,

    /// Record batch latency measurements and write them to this file.
    #[arg(long)]
    pub latency: Option<PathBuf>,

    /// Write per-worker conversion metrics to this file.
    #[arg(long)]
    pub metrics: Option<PathBuf>,
}

impl StreamArgs {
    /// Resolves CLI arguments into pipeline options.
    ///
    /// # Errors
    ///
    /// `Error::Config` for invalid combinations or unreadable schema
    /// files.
    pub fn into_options(self) -> Result<StreamOptions> {
        let pulsar = self.pulsar.to_options();
        let converter = self.converter.to_options(pulsar.max_message_size)?;
        Ok(StreamOptions {
            client: self.client.to_options(),
            pulsar,
            converter,
            latency_file: self.latency,
            metrics_file: self.metrics,
        })
    }
}

/// Pulsar connection arguments.
#[derive(Debug, Args)]
pub struct PulsarArgs {
    /// Pulsar broker service URL.
    #[arg(short = 'u', long = "pulsar-url", default_value = "pulsar://localhost:6650/")]
    pub url: String,

    /// Pulsar topic.
    #[arg(short = 't', long = "pulsar-topic", default_value = "persistent://public/default/fluxon")]
    pub topic: String,

    /// Maximum message size accepted by the broker.
    #[arg(long = "pulsar-max-msg-size", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_msg_size: usize,

    /// Enable the batching producer.
    #[arg(long = "pulsar-batch")]
    pub batch: bool,

    /// Batching: maximum messages per batch.
    #[arg(long = "pulsar-batch-max-messages", default_value_t = 1000)]
    pub batch_max_messages: u32,

    /// Batching: maximum bytes per batch.
    #[arg(long = "pulsar-batch-max-bytes", default_value_t = 128 * 1024)]
    pub batch_max_bytes: usize,
}

impl PulsarArgs {
    #[must_use]
    pub fn to_options(&self) -> PulsarOptions {
        PulsarOptions {
            url: self.url.clone(),
            topic: self.topic.clone(),
            max_message_size: self.max_msg_size,
            producer_name: None,
            batching: self.batch.then(|| BatchingOptions {
                max_messages: self.batch_max_messages,
                max_bytes: self.batch_max_bytes,
            }),
        }
    }
}

/// JSON source connection arguments.
#[derive(Debug, Args)]
pub struct ClientArgs {
    /// JSON source TCP hostname.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// JSON source TCP port.
    #[arg(long, default_value_t = 10197)]
    pub port: u16,

    /// First sequence number assigned to incoming records.
    #[arg(long = "seq-base", default_value_t = 0)]
    pub seq_base: u64,
}

impl ClientArgs {
    #[must_use]
    pub fn to_options(&self) -> ClientOptions {
        ClientOptions {
            host: self.host.clone(),
            port: self.port,
            seq_base: self.seq_base,
        }
    }
}

/// Parser backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ParserKind {
    /// Generic software parser over the Arrow JSON reader.
    Software,
    /// Accelerator-backed battery-status parser.
    Battery,
}

/// Conversion pipeline arguments.
#[derive(Debug, Args)]
pub struct ConverterArgs {
    /// Parser backend.
    #[arg(long = "parser", value_enum, default_value_t = ParserKind::Software)]
    pub parser: ParserKind,

    /// Number of conversion threads.
    #[arg(long, default_value_t = 1)]
    pub threads: usize,

    /// Number of input buffers; zero derives it from the thread count.
    #[arg(long = "input-buffers", default_value_t = 0)]
    pub input_buffers: usize,

    /// Total capacity of all input buffers. Accepts Ki/Mi/Gi/K/M/G
    /// scales, e.g. 16Mi.
    #[arg(long = "input-capacity", default_value = "16Mi", value_parser = parse_size)]
    pub input_capacity: usize,

    /// Maximum rows per record batch.
    #[arg(long = "max-rows", default_value_t = 1024)]
    pub max_rows: usize,

    /// Maximum IPC message size in bytes; defaults to the Pulsar
    /// maximum message size.
    #[arg(long = "max-ipc")]
    pub max_ipc: Option<usize>,

    /// Arrow schema file (JSON) for the software parser; defaults to
    /// the battery-status schema.
    #[arg(long)]
    pub schema: Option<PathBuf>,

    /// Carry sequence identity only as schema metadata instead of a
    /// prepended column.
    #[arg(long = "no-seq-column")]
    pub no_seq_column: bool,

    /// Battery backend: number of kernel parser instances.
    #[arg(long = "battery-parsers", default_value_t = 8)]
    pub battery_parsers: usize,

    /// Battery backend: accelerator function ID; derived from the
    /// parser count when absent.
    #[arg(long = "battery-afu-id")]
    pub battery_afu_id: Option<String>,

    /// Battery backend: register window device file.
    #[arg(long)]
    pub device: Option<PathBuf>,
}

impl ConverterArgs {
    /// Resolves converter options against the bus message ceiling.
    ///
    /// # Errors
    ///
    /// `Error::Config` for an unreadable or invalid schema file.
    pub fn to_options(&self, bus_max_message_size: usize) -> Result<ConverterOptions> {
        let seq_column = !self.no_seq_column;
        let parser = match self.parser {
            ParserKind::Software => ParserOptions::Software(SoftwareOptions {
                schema: self.load_schema()?,
                seq_column,
                ..SoftwareOptions::default()
            }),
            ParserKind::Battery => ParserOptions::Battery(BatteryOptions {
                afu_id: self.battery_afu_id.clone(),
                num_parsers: self.battery_parsers,
                seq_column,
                device_path: self.device.clone(),
                ..BatteryOptions::default()
            }),
        };

        Ok(ConverterOptions {
            num_threads: self.threads,
            num_buffers: self.input_buffers,
            input_capacity: self.input_capacity,
            max_batch_rows: self.max_rows,
            max_message_size: self.max_ipc.unwrap_or(bus_max_message_size),
            parser,
            ..ConverterOptions::default()
        })
    }

    fn load_schema(&self) -> Result<Option<arrow_schema::SchemaRef>> {
        let Some(path) = &self.schema else {
            return Ok(None);
        };
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read schema file {}: {e}", path.display())))?;
        let schema: arrow_schema::Schema = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("invalid schema file {}: {e}", path.display())))?;
        Ok(Some(Arc::new(schema)))
    }
}

/// `bench` subcommands.
#[derive(Debug, Subcommand)]
pub enum BenchCommand {
    /// TCP client interface micro-benchmark.
    Client(BenchClientArgs),
    /// JSON to Arrow IPC conversion micro-benchmark.
    Convert(BenchConvertArgs),
    /// Queue micro-benchmark.
    Queue(BenchQueueArgs),
    /// Pulsar publishing micro-benchmark.
    Pulsar(BenchPulsarArgs),
}

#[derive(Debug, Args)]
pub struct BenchClientArgs {
    #[command(flatten)]
    pub client: ClientArgs,
}

#[derive(Debug, Args)]
pub struct BenchConvertArgs {
    #[command(flatten)]
    pub converter: ConverterArgs,

    /// Approximate number of JSON bytes to generate in total; zero
    /// fills the input buffers once. Accepts Ki/Mi/Gi/K/M/G scales.
    #[arg(long = "total-json-bytes", default_value = "0", value_parser = parse_size)]
    pub total_json_bytes: usize,

    /// Only parse; skip resizing and serialization.
    #[arg(long = "parse-only")]
    pub parse_only: bool,

    /// Generation seed.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Number of times to repeat converting the same input.
    #[arg(long, default_value_t = 1)]
    pub repeats: usize,

    /// Write per-worker conversion metrics to this file.
    #[arg(long)]
    pub metrics: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct BenchQueueArgs {
    /// Number of items to pass through the queue.
    #[arg(short = 'm', long = "num-items", default_value_t = 256)]
    pub num_items: usize,
}

#[derive(Debug, Args)]
pub struct BenchPulsarArgs {
    #[command(flatten)]
    pub pulsar: PulsarArgs,

    /// Number of messages to publish.
    #[arg(long = "num-messages", default_value_t = 1024)]
    pub num_messages: usize,

    /// Size of each message in bytes.
    #[arg(long = "message-size", default_value_t = 64 * 1024)]
    pub message_size: usize,
}

/// Parses a byte count with an optional scaling suffix (`Ki`, `Mi`,
/// `Gi`, `K`, `M`, `G`).
pub fn parse_size(input: &str) -> std::result::Result<usize, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    let base: usize = digits
        .parse()
        .map_err(|_| format!("invalid size: {input}"))?;
    let scale: usize = match suffix.trim() {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "K" => 1000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        other => return Err(format!("unknown scaling factor: {other}; accepts Ki, Mi, Gi, K, M, or G")),
    };
    base.checked_mul(scale)
        .ok_or_else(|| format!("size overflows: {input}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_size_accepts_scales() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("16Mi").unwrap(), 16 << 20);
        assert_eq!(parse_size("2Ki").unwrap(), 2048);
        assert_eq!(parse_size("3K").unwrap(), 3000);
        assert!(parse_size("5X").is_err());
        assert!(parse_size("Mi").is_err());
    }

    #[test]
    fn stream_args_resolve_backend_and_ceiling() {
        let cli = Cli::parse_from([
            "fluxon",
            "stream",
            "--parser",
            "software",
            "--threads",
            "4",
            "--max-ipc",
            "1048576",
            "--seq-base",
            "7",
        ]);
        let Command::Stream(args) = cli.command else {
            panic!("expected stream subcommand");
        };
        let opts = args.into_options().unwrap();
        assert_eq!(opts.converter.num_threads, 4);
        assert_eq!(opts.converter.max_message_size, 1 << 20);
        assert_eq!(opts.client.seq_base, 7);
        assert!(opts.converter.parser.seq_column());
    }

    #[test]
    fn bench_convert_args_parse() {
        let cli = Cli::parse_from([
            "fluxon",
            "bench",
            "convert",
            "--total-json-bytes",
            "1Mi",
            "--parse-only",
            "--seed",
            "42",
            "--repeats",
            "3",
        ]);
        let Command::Bench(BenchCommand::Convert(args)) = cli.command else {
            panic!("expected bench convert subcommand");
        };
        assert_eq!(args.total_json_bytes, 1 << 20);
        assert!(args.parse_only);
        assert_eq!(args.seed, 42);
        assert_eq!(args.repeats, 3);
    }
}
