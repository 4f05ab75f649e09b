#![warn(clippy::unwrap_used, clippy::pedantic)]
#![allow(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::similar_names,
    clippy::doc_markdown,
    clippy::struct_field_names,
    clippy::struct_excessive_bools
)]
use std::{
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration as StdDuration, Instant},
};

use astrogator::{
    config::Settings,
    host::Host,
    loader::{LoadEvent, Loader},
    model::AstrogationModel,
    time::{format_duration, UT},
    transfer::{BurnKind, TransferModel},
};
use clap::Parser;
use color_eyre::eyre::{self, bail, OptionExt, WrapErr};
use itertools::Itertools;
use parking_lot::Mutex;
use scenario::Scenario;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod scenario;

#[derive(Parser, Debug)]
#[command(author, version, about = "Transfer windows for a KSP-style solar system")]
struct Cli {
    /// RON scenario describing bodies, vessels and the active vessel
    #[arg(long)]
    scenario: PathBuf,

    /// TOML settings file (defaults apply when absent)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Create maneuver nodes for this destination
    #[arg(long)]
    create: Option<String>,

    /// After creating nodes, warp to just before the ejection burn
    #[arg(long, requires = "create")]
    warp: bool,

    /// Give up waiting for plane changes after this many seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

fn load_settings(path: Option<&PathBuf>) -> eyre::Result<Settings> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading settings {}", path.display()))?;
    toml::from_str(&text).wrap_err_with(|| format!("parsing settings {}", path.display()))
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let settings = Arc::new(load_settings(cli.settings.as_ref())?);
    let host = Arc::new(Mutex::new(Scenario::load(&cli.scenario)?.into_host()?));
    let mut loader = Loader::new(host.clone(), settings.clone())?;
    loader.subscribe(|model, event| match event {
        LoadEvent::DestinationsChanged => debug!(transfers = model.len(), "destinations changed"),
        LoadEvent::TransferUpdated(index) => {
            if let Some(t) = model.transfers.get(*index) {
                debug!(destination = %t.name, state = %t.state, "transfer updated");
            }
        }
        LoadEvent::Finished => info!(generation = model.generation, "all transfers calculated"),
    });
    loader.notify_display_opened();

    let deadline = Instant::now() + StdDuration::from_secs(cli.timeout);
    loader.tick();
    while !loader.is_idle() {
        if Instant::now() > deadline {
            bail!("plane change calculations did not finish in {}s", cli.timeout);
        }
        thread::sleep(StdDuration::from_millis(10));
        loader.tick();
    }
    loader.notify_display_closed();

    let now = host.lock().universal_time();
    print_table(loader.model(), &settings, now);

    if let Some(name) = &cli.create {
        let destination = loader
            .model()
            .transfers
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .map(|t| t.destination.clone())
            .ok_or_eyre("no transfer to that destination")?;
        loader.create_maneuvers(&destination)?;
        let nodes = host.lock().nodes();
        println!("created {} maneuver node(s) for {name}", nodes.len());
        if cli.warp {
            loader.warp_to_ejection(&destination)?;
            println!("warped to {:#}", host.lock().universal_time());
        }
    }
    Ok(())
}

fn burn_cell(transfer: &TransferModel, kind: BurnKind, now: UT) -> String {
    transfer.burn(kind).map_or_else(
        || "-".to_string(),
        |b| {
            format!(
                "{:>9.1} m/s in {}",
                b.magnitude(),
                format_duration(b.ut - now)
            )
        },
    )
}

fn print_table(model: &AstrogationModel, settings: &Settings, now: UT) {
    println!("Transfers from {:?} at {now:#}", model.origin);
    for (tier, transfers) in &model.transfers.iter().group_by(|t| t.tier) {
        println!("-- tier {tier}");
        for t in transfers {
            let marker = if t.active { "*" } else { " " };
            let total = t
                .total_delta_v(settings)
                .map_or_else(|| "-".to_string(), |dv| format!("{dv:.1} m/s"));
            println!(
                "{marker} {:<16} {:<32} {:<32} {:>14}  {}",
                t.name,
                burn_cell(t, BurnKind::Ejection, now),
                burn_cell(t, BurnKind::PlaneChange, now),
                total,
                t.state
            );
        }
    }
}
