use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fogwatch::config::{PipelineConfig, StageKind};
use fogwatch::csv_loader::load_samples_from_csv;
use fogwatch::types::Decision;
use fogwatch::window_buffer::SlidingWindow;

/// Replays a recorded session through the detection pipeline without wall-clock pacing
#[derive(Parser, Debug)]
#[command(name = "replay_csv", version)]
struct Args {
    /// Session CSV: header row, one column per layout channel, optional label column
    csv: PathBuf,

    /// Pipeline configuration (TOML); defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print both feature vectors of every cycle
    #[arg(long)]
    dump_features: bool,
}

/// Maps a recorded ground-truth label onto the decision it should produce
fn expected_decision(label: f64) -> Option<Decision> {
    Decision::from_severity(label).or(match label as i64 {
        0 => Some(Decision::Walk),
        1 => Some(Decision::Fog),
        2 => Some(Decision::PreFog),
        _ => None,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = PipelineConfig::load(args.config.as_deref()).context("Failed to load config")?;
    config.validate().context("Invalid configuration")?;

    let samples = load_samples_from_csv(&args.csv, &config.layout)?;
    info!(samples = samples.len(), csv = ?args.csv, "session loaded");

    let mut fusion = config.load_fusion().context("Failed to load classifiers")?;
    let mut extractor = config.feature_extractor();
    let mut window = SlidingWindow::new(config.window.size);
    let step = config.step_size();

    let mut dump_schemas = Vec::new();
    if args.dump_features {
        for kind in [StageKind::PreFog, StageKind::Fog] {
            if config.stage(kind).enabled {
                dump_schemas.push((kind.name(), config.schema(kind)?));
            }
        }
    }

    let mut total = 0usize;
    let mut labelled = 0usize;
    let mut matching = 0usize;

    println!("{:>6}  {:<8} {:>9}  {:<8}", "cycle", "decision", "severity", "label");
    for (cycle_idx, batch) in samples.chunks_exact(step).enumerate() {
        window.push_batch(batch.to_vec());
        let reference = window.reference_label();
        let Some(view) = window.view() else {
            continue;
        };

        let mut cycle = extractor.cycle(view);
        let outcome = match fusion.classify_cycle(&mut cycle) {
            Ok(outcome) => outcome,
            Err(e) => {
                eprintln!("cycle {cycle_idx}: classification failed: {e}");
                continue;
            }
        };

        total += 1;
        let decision = outcome.decision;
        let label = reference.map_or_else(|| "-".to_string(), |l| format!("{l}"));
        let expected = reference.and_then(expected_decision);
        let mark = match expected {
            Some(e) if e == decision => {
                labelled += 1;
                matching += 1;
                ""
            }
            Some(_) => {
                labelled += 1;
                "  *"
            }
            None => "",
        };
        println!(
            "{:>6}  {:<8} {:>9.6}  {:<8}{}",
            cycle_idx,
            decision.to_string(),
            decision.severity(),
            label,
            mark
        );

        for (name, schema) in &dump_schemas {
            let values = cycle.extract(schema);
            for (feature, value) in schema.names().iter().zip(values.as_slice()) {
                println!("        {name:<8} {feature:<32} {value:>14.6}");
            }
        }
    }

    println!("\n{total} decisions");
    if labelled > 0 {
        println!(
            "agreement: {matching} / {labelled} ({:.1}%)",
            100.0 * matching as f64 / labelled as f64
        );
    }
    Ok(())
}
