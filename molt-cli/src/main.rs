use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use molt_core::config::{StorageType, SubtaskConfig};
use molt_core::recovery::{decode_log, open_log_storage, LogRecord, LogStorage};
use molt_core::runtime::{
    CheckpointCoordinator, CheckpointMetadata, CheckpointOptions, InputGate, InputPoll,
    OperatorChain, PartitionWriter, RecordWriter, SubtaskDriver, SubtaskEnvironment, TaskInfo,
};
use molt_core::util::SignalFuture;

#[derive(Parser, Debug)]
#[command(name = "molt")]
#[command(about = "Molt subtask driver demo and replay-log tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StorageArg {
    Mem,
    Local,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a demo subtask; optionally crash it and replay from the log.
    Run {
        #[arg(long, default_value_t = 10)]
        records: usize,
        #[arg(long)]
        enable_logging: bool,
        #[arg(long, value_enum, default_value = "mem")]
        storage: StorageArg,
        #[arg(long, default_value = "./molt-logs")]
        log_dir: PathBuf,
        #[arg(long)]
        clear_old_log: bool,
        #[arg(long)]
        enable_output_cache: bool,
        /// Period of the no-op starvation ping, milliseconds.
        #[arg(long)]
        control_delay_ms: Option<u64>,
        /// Fail after this many records, then restart and replay.
        #[arg(long)]
        fail_at: Option<usize>,
        #[arg(long, default_value_t = 0)]
        print_level: u8,
    },
    /// Decode and print a replay log file.
    Inspect {
        /// Path to a `.rlog` file.
        log_file: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Run {
            records,
            enable_logging,
            storage,
            log_dir,
            clear_old_log,
            enable_output_cache,
            control_delay_ms,
            fail_at,
            print_level,
        } => {
            let mut config = SubtaskConfig {
                enable_logging,
                storage_type: match storage {
                    StorageArg::Mem => StorageType::Memory,
                    StorageArg::Local => StorageType::LocalDisk,
                },
                clear_old_log,
                enable_output_cache,
                print_level,
                ..SubtaskConfig::default()
            };
            config.local_log_dir = log_dir;
            config.control_delay = control_delay_ms.map(Duration::from_millis);
            run_demo(config, records, fail_at)
        }
        Commands::Inspect { log_file } => inspect(&log_file),
    }
}

fn run_demo(config: SubtaskConfig, records: usize, fail_at: Option<usize>) -> Result<()> {
    let task_info = TaskInfo::new("demo-job", 0);
    let storage = open_log_storage(&config, &task_info.log_name())
        .context("opening demo log storage")?;

    match run_once(&config, &task_info, Arc::clone(&storage), records, fail_at) {
        Ok(outputs) => {
            println!("clean run produced {} records", outputs.len());
            Ok(())
        }
        Err(err) => {
            if fail_at.is_none() {
                return Err(err);
            }
            tracing::warn!("subtask crashed as requested: {err:#}");
            if !config.enable_logging {
                println!("no replay log was kept (run with --enable-logging); stopping here");
                return Ok(());
            }
            println!("restarting from the replay log...");
            // Second incarnation: no input, no injected failure; everything
            // it emits comes from the log.
            let outputs = run_once(&config, &task_info, storage, 0, None)?;
            println!("replayed {} records after the crash:", outputs.len());
            for line in outputs.iter().take(10) {
                println!("  {line}");
            }
            Ok(())
        }
    }
}

fn run_once(
    config: &SubtaskConfig,
    task_info: &TaskInfo,
    storage: Arc<dyn LogStorage>,
    records: usize,
    fail_at: Option<usize>,
) -> Result<Vec<String>> {
    let outputs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let env = SubtaskEnvironment {
        task_info: task_info.clone(),
        input_gates: vec![Box::new(GeneratedGate::new(records))],
        partition_writer: Box::new(CollectingWriter {
            outputs: Arc::clone(&outputs),
        }),
        operator_chain: Box::new(UppercaseChain {
            processed: 0,
            fail_at,
        }),
        checkpoint_coordinator: Box::new(LoggingCoordinator),
        control_handler: None,
        fail_external: None,
    };

    let mut driver = SubtaskDriver::with_storage(env, config.clone(), storage)?;
    let handle = driver.handle();
    driver.invoke()?;
    handle.shutdown().wait();

    let outputs = outputs.lock().unwrap().clone();
    Ok(outputs)
}

fn inspect(log_file: &PathBuf) -> Result<()> {
    let bytes = std::fs::read(log_file)
        .with_context(|| format!("reading {}", log_file.display()))?;
    let records = decode_log(&bytes).context("decoding replay log")?;
    for record in &records {
        match record {
            LogRecord::MailEnqueued { step, name, args } => {
                println!("{step:>8}  M  {name:?} ({} args)", args.len());
            }
            LogRecord::OutputEmitted {
                step,
                partition,
                bytes,
            } => {
                println!("{step:>8}  O  partition {partition}, {} bytes", bytes.len());
            }
            LogRecord::CheckpointBoundary {
                step,
                checkpoint_id,
            } => {
                println!("{step:>8}  C  checkpoint {checkpoint_id}");
            }
            LogRecord::Clear { step } => {
                println!("{step:>8}  X  clear up to step {step}");
            }
        }
    }
    let last_step = records.iter().map(LogRecord::step).max().unwrap_or(0);
    println!("{} records, last step {last_step}", records.len());
    Ok(())
}

/// Input gate over a generated record sequence. Data only flows once
/// partitions have been requested.
struct GeneratedGate {
    records: VecDeque<Vec<u8>>,
    requested: bool,
    state_consumed: SignalFuture,
    listener: Option<Box<dyn Fn() + Send + Sync>>,
}

impl GeneratedGate {
    fn new(count: usize) -> Self {
        let state_consumed = SignalFuture::new();
        state_consumed.complete();
        Self {
            records: (0..count)
                .map(|i| format!("event-{i:04}").into_bytes())
                .collect(),
            requested: false,
            state_consumed,
            listener: None,
        }
    }
}

impl InputGate for GeneratedGate {
    fn poll_next(&mut self) -> Result<InputPoll> {
        if !self.requested {
            return Ok(InputPoll::Pending);
        }
        match self.records.pop_front() {
            Some(record) => Ok(InputPoll::Record(record)),
            None => Ok(InputPoll::EndOfInput),
        }
    }

    fn request_partitions(&mut self) -> Result<()> {
        self.requested = true;
        if let Some(listener) = &self.listener {
            listener();
        }
        Ok(())
    }

    fn state_consumed(&self) -> SignalFuture {
        self.state_consumed.clone()
    }

    fn set_available_listener(&mut self, listener: Box<dyn Fn() + Send + Sync>) {
        let fire_now = self.requested;
        self.listener = Some(listener);
        if fire_now {
            (self.listener.as_ref().unwrap())();
        }
    }
}

struct CollectingWriter {
    outputs: Arc<Mutex<Vec<String>>>,
}

impl PartitionWriter for CollectingWriter {
    fn write(&mut self, partition: u16, bytes: &[u8]) -> Result<()> {
        let line = format!("[p{partition}] {}", String::from_utf8_lossy(bytes));
        tracing::info!("{line}");
        self.outputs.lock().unwrap().push(line);
        Ok(())
    }

    fn broadcast_cancel_checkpoint_marker(&mut self, checkpoint_id: u64) -> Result<()> {
        tracing::info!("cancel checkpoint marker {checkpoint_id}");
        Ok(())
    }

    fn broadcast_epoch_barrier(&mut self, epoch: u64, _payload: &[u8]) -> Result<()> {
        tracing::info!("epoch barrier {epoch}");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

struct UppercaseChain {
    processed: usize,
    fail_at: Option<usize>,
}

impl OperatorChain for UppercaseChain {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn process_record(&mut self, record: Vec<u8>, out: &mut RecordWriter) -> Result<()> {
        if self.fail_at == Some(self.processed) {
            anyhow::bail!("simulated crash after {} records", self.processed);
        }
        self.processed += 1;
        let mut echoed = record;
        echoed.make_ascii_uppercase();
        out.emit(0, &echoed)
    }

    fn dispatch_operator_event(&mut self, operator_id: u32, _event: &[u8]) -> Result<()> {
        tracing::info!("operator event for {operator_id}");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

struct LoggingCoordinator;

impl CheckpointCoordinator for LoggingCoordinator {
    fn checkpoint_state(
        &mut self,
        metadata: &CheckpointMetadata,
        _options: &CheckpointOptions,
        _chain: &mut dyn OperatorChain,
        _is_running: bool,
    ) -> Result<()> {
        tracing::info!("snapshotting for checkpoint {}", metadata.checkpoint_id);
        Ok(())
    }

    fn notify_checkpoint_complete(
        &mut self,
        checkpoint_id: u64,
        _chain: &mut dyn OperatorChain,
        _is_running: bool,
    ) -> Result<()> {
        tracing::info!("checkpoint {checkpoint_id} complete");
        Ok(())
    }

    fn notify_checkpoint_aborted(
        &mut self,
        checkpoint_id: u64,
        _chain: &mut dyn OperatorChain,
        _is_running: bool,
    ) -> Result<()> {
        tracing::info!("checkpoint {checkpoint_id} aborted");
        Ok(())
    }

    fn decline_checkpoint(&mut self, checkpoint_id: u64, reason: &str) {
        tracing::warn!("checkpoint {checkpoint_id} declined: {reason}");
    }
}
