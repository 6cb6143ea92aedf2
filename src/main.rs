/*
Freezing-of-Gait detection daemon.

Reads IMU samples from a sensor stream, decides walk / pre-freeze / freeze ten times a
second and publishes the severity (0, 0.5, 1) for the feedback device.

    fogwatch --config fogwatch.toml                  # text lines from transport.data_addr
    fogwatch --config config/single_imu.toml --source frames --stdout
    fogwatch --config config/single_imu.toml --source ble --device 28:CD:C1:08:37:69

Frames carry 9 fields, so the frame and BLE sources need a 9-channel layout with
matching feature lists (config/single_imu.toml); the BLE source also needs
`--features ble`.

Log level follows RUST_LOG (default info).
*/

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fogwatch::config::PipelineConfig;
use fogwatch::sample_queue::{sample_queue, SampleProducer};
use fogwatch::scheduler::CycleScheduler;
use fogwatch::shutdown::Shutdown;
use fogwatch::transport::{
    connect, pump_frames, pump_lines, DecisionSink, LineSink, TcpBroadcastSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Source {
    /// Space separated text lines (`<topic> <fields...>`) over TCP
    Text,
    /// Binary CRC-8 frames over TCP
    Frames,
    /// BlueZ GATT notifications carrying binary frames
    Ble,
}

#[derive(Parser, Debug)]
#[command(name = "fogwatch", version, about = "Real-time Freezing-of-Gait detection")]
struct Args {
    /// Pipeline configuration (TOML); defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where samples come from
    #[arg(short, long, value_enum, default_value_t = Source::Text)]
    source: Source,

    /// Override the sensor endpoint (host:port)
    #[arg(long)]
    data_addr: Option<String>,

    /// BLE device MAC address (overrides transport.ble_device)
    #[arg(long)]
    device: Option<String>,

    /// Print decisions on stdout instead of serving them over TCP
    #[arg(long)]
    stdout: bool,
}

fn run_source(
    source: Source,
    config: &PipelineConfig,
    device: Option<&str>,
    producer: SampleProducer,
    shutdown: &Shutdown,
) -> Result<()> {
    let transport = &config.transport;
    match source {
        Source::Text => {
            let stream = connect(&transport.data_addr, config.poll_interval())?;
            let stats = pump_lines(
                BufReader::new(stream),
                &transport.imu_topic,
                &config.layout,
                &producer,
                shutdown,
            )?;
            info!(?stats, "text source stopped");
        }
        Source::Frames => {
            let mut decoder = config.frame_decoder()?;
            if decoder.field_count() != config.layout.len() {
                bail!(
                    "frames carry {} fields but the layout has {} channels \
                     (see config/single_imu.toml)",
                    decoder.field_count(),
                    config.layout.len()
                );
            }
            let stream = connect(&transport.data_addr, config.poll_interval())?;
            let stats = pump_frames(stream, &mut decoder, &producer, shutdown)?;
            info!(?stats, "frame source stopped");
        }
        #[cfg(feature = "ble")]
        Source::Ble => {
            let device = device
                .or(transport.ble_device.as_deref())
                .context("BLE source needs --device or transport.ble_device")?;
            let characteristic = transport
                .ble_characteristic
                .as_deref()
                .unwrap_or("service0001/char0002");
            let stats = fogwatch::ble::run_ble_source(
                device,
                characteristic,
                config.frame_decoder()?,
                producer,
                shutdown,
                config.poll_interval(),
            )?;
            info!(?stats, "ble source stopped");
        }
        #[cfg(not(feature = "ble"))]
        Source::Ble => {
            let _ = (device, producer);
            bail!("built without BLE support (rebuild with `--features ble`)");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config =
        PipelineConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(addr) = args.data_addr.clone() {
        config.transport.data_addr = addr;
    }
    config.validate().context("Invalid configuration")?;

    let fusion = config.load_fusion().context("Failed to load classifiers")?;
    info!(
        pre_fog = fusion.has_pre_fog(),
        step = config.step_size(),
        window = config.window.size,
        "classifiers loaded"
    );

    let topic = config.transport.predict_topic.clone();
    let sink: Box<dyn DecisionSink> = if args.stdout {
        Box::new(LineSink::new(io::stdout(), topic))
    } else {
        Box::new(
            TcpBroadcastSink::bind(config.transport.predict_addr.as_str(), topic)
                .context("Failed to bind prediction endpoint")?,
        )
    };

    let (producer, consumer) = sample_queue();
    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("interrupt received, shutting down");
            shutdown.trigger();
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    let ingest = {
        let shutdown = shutdown.clone();
        let config = config.clone();
        let device = args.device.clone();
        thread::Builder::new()
            .name("ingest".into())
            .spawn(move || {
                let result = run_source(args.source, &config, device.as_deref(), producer, &shutdown);
                if let Err(e) = &result {
                    error!(error = %e, "sensor source failed");
                }
                shutdown.trigger();
                result
            })?
    };

    let scheduler = {
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || {
                let mut scheduler = CycleScheduler::new(&config, fusion, sink);
                let stats = scheduler.run(&consumer, &shutdown);
                shutdown.trigger();
                stats
            })?
    };

    let source_result = ingest
        .join()
        .map_err(|_| anyhow!("ingest thread panicked"))?;
    let stats = scheduler
        .join()
        .map_err(|_| anyhow!("scheduler thread panicked"))?;
    info!(published = stats.published, ticks = stats.ticks, "stopped");

    source_result
}
