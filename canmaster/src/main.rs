use chrono::Local;
use clap::{ArgEnum, Parser, Subcommand};
use clap_verbosity_flag::Verbosity;
use hex_slice::AsHex;
use log::{debug, error, info, warn};
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use canmaster_core::eds::{eds_default_root, EdsDatabase};
use canmaster_core::frame::FrameFunction;
use canmaster_core::runtime::{Master, MasterConfig};
use canmaster_core::transport::CanTransport;
use canmaster_core::util::range_parser;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ArgEnum, Debug)]
enum FrameType {
    PDO,
    SDO,
    NMT,
    EMG,
    ERR,
}

impl FrameType {
    fn matches(self, function: FrameFunction) -> bool {
        use FrameFunction::*;
        match self {
            FrameType::PDO => matches!(
                function,
                Rpdo1 | Rpdo2 | Rpdo3 | Rpdo4 | Tpdo1 | Tpdo2 | Tpdo3 | Tpdo4
            ),
            FrameType::SDO => matches!(function, SdoRx | SdoTx),
            FrameType::NMT => matches!(function, Nmt),
            FrameType::EMG => matches!(function, SyncOrEmergency),
            FrameType::ERR => matches!(function, NmtErrorControl),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Dump raw traffic to stdout instead of running the master loop.
    Mon {
        /// Restrict the dump to these node ids (all nodes if empty).
        #[clap(short, long, multiple_occurrences(true))]
        nodes: Vec<u8>,

        /// Restrict the dump to these frame categories (all if empty).
        #[clap(arg_enum, short, long, multiple_occurrences(true))]
        frame_types: Vec<FrameType>,
    },
}

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// CAN interface name, or host:port when --use-tcp is set
    interface: String,

    /// Allow verbose output
    #[clap(flatten)]
    verbose: Verbosity,

    /// Number of SDO worker threads
    #[clap(short = 'W', long, default_value_t = canmaster_core::engine::DEFAULT_WORKERS)]
    worker_threads: usize,

    /// Stack size in bytes for each worker thread (platform default if unset)
    #[clap(short = 's', long)]
    worker_stack_size: Option<usize>,

    /// Capacity of the global job-ready channel
    #[clap(short = 'j', long, default_value_t = canmaster_core::engine::DEFAULT_JOB_QUEUE_LENGTH)]
    job_queue_length: usize,

    /// Per-node SDO queue capacity
    #[clap(short = 'S', long, default_value_t = canmaster_core::engine::DEFAULT_SDO_QUEUE_LENGTH)]
    sdo_queue_length: usize,

    /// REST status port (reserved; not yet served)
    #[clap(short = 'R', long, default_value_t = 9191)]
    rest_port: u16,

    /// Disable per-device quirks, run strictly to the standard
    #[clap(short = 'f', long)]
    strict: bool,

    /// Talk to a TCP-tunneled CAN bridge instead of a local SocketCAN interface
    #[clap(short = 'T', long)]
    use_tcp: bool,

    /// Managed node-id interval, e.g. 1-32
    #[clap(short = 'n', long, default_value = "1-127", value_parser = range_parser)]
    range: RangeInclusive<u8>,

    /// Heartbeat production period in milliseconds
    #[clap(short = 'p', long, default_value_t = 10_000)]
    heartbeat_period: u64,

    /// Heartbeat/node-guard timeout in milliseconds
    #[clap(short = 'P', long, default_value_t = 1_000)]
    heartbeat_timeout: u64,

    /// Consecutive SDO timeouts tolerated before a node is reset (0 = never reset)
    #[clap(short = 'x', long, default_value_t = 0)]
    ntimeouts_max: u32,

    /// Directory of .eds files describing known devices
    #[clap(long, default_value_os_t = eds_default_root())]
    eds_dir: PathBuf,

    #[clap(subcommand)]
    command: Option<Commands>,
}

fn init_logging(verbose: &Verbosity) {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .format(|buf, record| {
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "{} {}: {}",
                Local::now().format("%H:%M:%S%.3f"),
                level_style.value(record.level()),
                record.args()
            )
        })
        .filter_level(verbose.log_level_filter())
        .init();
}

async fn run_mon(
    transport: &mut CanTransport,
    nodes: &[u8],
    frame_types: &[FrameType],
) -> Result<(), canmaster_core::CanOpenError> {
    if nodes.is_empty() {
        info!("Monitor traffic for all nodes");
    } else {
        info!("Monitor traffic for node {:02x}", nodes.as_hex());
    }
    if frame_types.is_empty() {
        info!("Monitor traffic for all frame types");
    } else {
        info!("Monitor traffic for frame types {:?}", frame_types);
    }

    loop {
        let frame = transport.recv().await?;
        let (function, node_id) = match canmaster_core::frame::split_cob_id(frame.cob_id) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if !nodes.is_empty() && !nodes.contains(&node_id) {
            continue;
        }
        if !frame_types.is_empty() && !frame_types.iter().any(|t| t.matches(function)) {
            continue;
        }
        println!(
            "{:03x} {} [{}] {:02x}",
            frame.cob_id,
            function,
            node_id,
            frame.data().as_hex()
        );
    }
}

async fn run_master(cli: &Cli) -> Result<(), canmaster_core::CanOpenError> {
    let (eds, report) = EdsDatabase::load_all(&cli.eds_dir);
    for failure in &report.failures {
        warn!("eds load: {failure}");
    }
    info!("loaded {} eds record(s) from {:?}", eds.len(), cli.eds_dir);

    let config = MasterConfig {
        managed_range: cli.range.clone(),
        heartbeat_period: Duration::from_millis(cli.heartbeat_period),
        heartbeat_timeout: Duration::from_millis(cli.heartbeat_timeout),
        ntimeouts_max: cli.ntimeouts_max,
        strict: cli.strict,
        sdo_queue_length: cli.sdo_queue_length,
        job_queue_length: cli.job_queue_length,
        ..MasterConfig::default()
    };

    let (mut master, mut outgoing_rx, mut control_rx) = Master::new(eds, config);
    master
        .engine
        .spawn_workers_with_stack_size(cli.worker_threads, cli.worker_stack_size);

    let mut transport = CanTransport::open(&cli.interface, cli.use_tcp).await?;
    master.run(&mut transport, &mut outgoing_rx, &mut control_rx).await
}

#[quit::main]
fn main() {
    let cli = Cli::parse();
    init_logging(&cli.verbose);

    debug!("Verbose: {:?}", cli.verbose);
    info!("CAN interface: {}", cli.interface);

    let rt = tokio::runtime::Runtime::new().unwrap();
    let outcome = rt.block_on(async {
        match &cli.command {
            Some(Commands::Mon { nodes, frame_types }) => {
                match CanTransport::open(&cli.interface, cli.use_tcp).await {
                    Ok(mut transport) => run_mon(&mut transport, nodes, frame_types).await,
                    Err(err) => Err(err),
                }
            }
            None => run_master(&cli).await,
        }
    });

    if let Err(err) = outcome {
        error!("{err}");
        quit::with_code(1);
    }
}
