use bridge_tuner::bridge::{BridgeModel, BridgeParams};
use bridge_tuner::calibration::HttpCalibrationClient;
use bridge_tuner::config::TunerConfig;
use bridge_tuner::console_display::{parse_key, ConsoleDisplay, KeyCommand};
use bridge_tuner::controller::{SessionContext, SessionController, SessionView};
use bridge_tuner::detector::NoteDetector;
use bridge_tuner::pitch_log::{export_pitches_csv, read_rounds, PitchLogger, PitchRound};
use bridge_tuner::service::CalibrationServer;
use bridge_tuner::simulator::Simulator;
use bridge_tuner::types::{NoteEvent, STRING_COUNT};

use clap::Parser;
use crossbeam_channel::unbounded;
use log::{error, info, trace};
use std::error::Error;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;

/// A guitar that has drifted: some strings sharp, some flat.
const DRIFTED: [f64; STRING_COUNT] = [325.0, 249.0, 193.5, 148.0, 108.7, 83.0];

#[derive(Parser)]
#[command(name = "bridge-tuner")]
#[command(about = "Guided six-string tuner with floating-bridge calibration")]
struct Cli {
    /// Run only the calibration service
    #[arg(long)]
    serve: bool,

    /// Calibration service bind address (with --serve or --local-service)
    #[arg(long, default_value = "127.0.0.1:5000")]
    bind: String,

    /// Bridge model parameters (JSON). Defaults to the built-in fitted guitar
    #[arg(long)]
    model: Option<PathBuf>,

    /// Tuner config file
    #[arg(long, default_value = "bridge-tuner.json")]
    config: PathBuf,

    /// Calibration service base URL (overrides the config file)
    #[arg(long)]
    service_url: Option<String>,

    /// Start an in-process calibration service on --bind and use it
    #[arg(long)]
    local_service: bool,

    /// Append every calibration exchange to this JSONL file
    #[arg(long)]
    log_pitches: Option<PathBuf>,

    /// Write the pitches from --log-pitches as CSV to this file and exit
    #[arg(long, requires = "log_pitches")]
    export_csv: Option<PathBuf>,

    /// Simulated detector readings per second
    #[arg(long, default_value_t = 20)]
    sim_rate: u32,

    /// Starting pitches of the simulated guitar, 1st string first (comma separated)
    #[arg(long, value_delimiter = ',')]
    start_pitches: Option<Vec<f64>>,

    /// Write the effective config to --config and exit
    #[arg(long)]
    save_config: bool,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    if let (Some(csv), Some(log)) = (&cli.export_csv, &cli.log_pitches) {
        export_pitches_csv(&read_rounds(log)?, csv)?;
        return Ok(());
    }

    let model = match &cli.model {
        Some(path) => BridgeModel::new(BridgeParams::load(path)?),
        None => BridgeModel::fitted(),
    };

    if cli.serve {
        info!("═══════════════════════════════════════════════");
        info!("  BRIDGE TUNER SERVICE v{}", env!("CARGO_PKG_VERSION"));
        info!("═══════════════════════════════════════════════");
        CalibrationServer::bind(&cli.bind, model)?.run();
        return Ok(());
    }

    let mut config = TunerConfig::load(&cli.config).unwrap_or_default();
    if let Some(url) = &cli.service_url {
        config.service_url = url.clone();
    }
    if cli.save_config {
        config.save(&cli.config)?;
        return Ok(());
    }

    let start = match &cli.start_pitches {
        Some(p) => <[f64; STRING_COUNT]>::try_from(p.as_slice()).map_err(|_| {
            format!("--start-pitches needs {} values, got {}", STRING_COUNT, p.len())
        })?,
        None => DRIFTED,
    };

    if cli.local_service {
        let addr = CalibrationServer::bind(&cli.bind, model.clone())?.spawn()?;
        config.service_url = format!("http://{}", addr);
    }

    info!("═══════════════════════════════════════════════");
    info!("  BRIDGE TUNER v{}", env!("CARGO_PKG_VERSION"));
    info!("  Service: {}", config.service_url);
    info!("  Guitar: simulated, starting at {:?}", start);
    info!("═══════════════════════════════════════════════");

    // The host's own listener; sessions chain behind it.
    let detector = NoteDetector::new();
    detector.set_host_callback(Some(Box::new(|event: &NoteEvent| {
        trace!("detector: {}", event);
    })))?;

    let mut handles = Vec::new();
    let mut view_txs = Vec::new();

    // ─── Console display ────────────────────────────────────────────
    let (tx, rx) = unbounded::<SessionView>();
    view_txs.push(tx);
    handles.push(thread::Builder::new().name("display".into()).spawn(move || {
        ConsoleDisplay::new(rx).run();
    })?);

    // ─── Simulated guitar and player ────────────────────────────────
    let mut sim = Simulator::new(detector.clone(), model, &start, cli.sim_rate)?;
    let player = sim.player();
    let stop = sim.stop_flag();
    let (tx, rx) = unbounded::<SessionView>();
    view_txs.push(tx);
    handles.push(thread::Builder::new().name("player".into()).spawn(move || {
        for view in rx.iter() {
            player.follow(&view);
        }
    })?);
    handles.push(thread::Builder::new().name("simulator".into()).spawn(move || {
        sim.run();
    })?);

    // ─── Pitch log ──────────────────────────────────────────────────
    let pitch_log_tx = match cli.log_pitches {
        Some(path) => {
            let (tx, rx) = unbounded::<PitchRound>();
            handles.push(thread::Builder::new().name("pitch-log".into()).spawn(move || {
                if let Err(e) = PitchLogger::new(rx, &path).run() {
                    error!("Pitch log {:?} failed: {}", path, e);
                }
            })?);
            Some(tx)
        }
        None => None,
    };

    // ─── Session controller ─────────────────────────────────────────
    let client = HttpCalibrationClient::new(&config.service_url, config.request_timeout())?;
    let ctx = SessionContext {
        detector,
        calibration: Box::new(client),
        view_txs,
        pitch_log_tx,
        timing: config.window_timing(),
    };
    let (mut controller, intents) = SessionController::new(ctx, config.new_session());
    let controller_handle = thread::Builder::new().name("session".into()).spawn(move || {
        controller.run();
    })?;

    // ─── Keyboard ───────────────────────────────────────────────────
    for line in io::stdin().lock().lines() {
        match parse_key(&line?) {
            Some(KeyCommand::Quit) => break,
            Some(KeyCommand::Intent(intent)) => {
                if !intents.send(intent) {
                    break;
                }
            }
            None => {}
        }
    }

    intents.shutdown();
    stop.store(true, Ordering::Relaxed);
    let _ = controller_handle.join();
    for h in handles {
        let _ = h.join();
    }
    Ok(())
}
