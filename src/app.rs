use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use clap::Parser;
use log::LevelFilter;
use tokio::io::{self, AsyncBufReadExt, BufReader};

use ratelock::{
    sim::{SimulatedMedia, SimulatedPage},
    Config, FileStore, KeyEvent, LogNotifier, MediaElement, MemoryStore, RateController,
    RateStore,
};

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    #[arg(
        short,
        long,
        help = "The path to the config file. The default is `ratelock.toml`."
    )]
    pub config: Option<PathBuf>,

    #[arg(
        short,
        long,
        help = "File used to remember the last rate. Without it the rate is only kept in memory."
    )]
    pub store: Option<PathBuf>,

    #[arg(short, long, help = "Log every rejected write and correction.")]
    pub debug: bool,
}

pub async fn start() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let loaded = Config::load(cli.config.as_deref());

    let debug = cli.debug
        || loaded
            .as_ref()
            .is_ok_and(|config| config.advanced.debug_mode);
    pretty_env_logger::formatted_builder()
        .filter_level(if debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_env("RATELOCK_LOG")
        .init();

    let config = loaded.unwrap_or_else(|err| {
        log::warn!("Using default config: {err:?}");
        Config::default()
    });

    let store: Arc<dyn RateStore> = match &cli.store {
        Some(path) => Arc::new(FileStore::new(path)),
        None => Arc::new(MemoryStore::default()),
    };
    let controller = RateController::new(config, store, Arc::new(LogNotifier))?;
    let page = SimulatedPage::new();
    controller.observe(page.clone());

    log::info!("Type `help` for commands");
    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }
        if let Err(err) = run_command(&controller, &page, line).await {
            log::error!("{err:#}");
        }
    }

    controller.shutdown();
    Ok(())
}

const HELP: &str = "\
add [duration]       insert a media element
remove <n>           remove element n from the page
key <chord>          press a key chord, e.g. alt+d
write <n> <rate>     page script writes element n's rate
drift <n> <rate>     media pipeline resets element n's rate
play <n> | pause <n>
wait <ms>            let timers run
status               show every element
quit";

async fn run_command(
    controller: &RateController,
    page: &Arc<SimulatedPage>,
    line: &str,
) -> anyhow::Result<()> {
    let mut args = line.split_whitespace();
    let command = args.next().unwrap_or_default();
    match command {
        "help" => log::info!("\n{HELP}"),
        "add" => {
            let duration = args.next().map(str::parse).transpose()?;
            page.insert(SimulatedMedia::new(duration));
            log::info!("Added element {}", page.elements().len() - 1);
        }
        "remove" => {
            let index = parse_index(args.next())?;
            page.remove(index)
                .ok_or_else(|| anyhow!("No element {index}"))?;
        }
        "key" => {
            let chord: KeyEvent = args
                .next()
                .ok_or_else(|| anyhow!("Missing key chord"))?
                .parse()?;
            let outcome = controller.handle_key(&**page, &chord);
            log::info!("{outcome:?}");
        }
        "write" => {
            let media = element(page, args.next())?;
            media.set_playback_rate(parse_rate(args.next())?);
        }
        "drift" => {
            let media = element(page, args.next())?;
            media.pipeline_reset_rate(parse_rate(args.next())?);
        }
        "play" => element(page, args.next())?.play(),
        "pause" => element(page, args.next())?.pause(),
        "wait" => {
            let millis: u64 = args
                .next()
                .ok_or_else(|| anyhow!("Missing duration"))?
                .parse()?;
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
        "status" => {
            log::info!("Target rate {:.2}x", controller.target_rate());
            for (index, media) in page.elements().iter().enumerate() {
                log::info!(
                    "#{index} rate {:.2}x (raw {:.2}x) time {:.1}/{} {} {}",
                    media.playback_rate(),
                    media.raw_rate(),
                    media.current_time(),
                    media
                        .duration()
                        .map_or_else(|| "?".to_string(), |d| format!("{d:.1}")),
                    if media.is_paused() { "paused" } else { "playing" },
                    if controller.guard().is_guarded(media.id()) {
                        "guarded"
                    } else {
                        "unguarded"
                    },
                );
            }
        }
        other => return Err(anyhow!("Unknown command '{other}'")),
    }
    Ok(())
}

fn parse_index(arg: Option<&str>) -> anyhow::Result<usize> {
    arg.ok_or_else(|| anyhow!("Missing element index"))?
        .parse()
        .context("Element index must be a number")
}

fn parse_rate(arg: Option<&str>) -> anyhow::Result<f64> {
    arg.ok_or_else(|| anyhow!("Missing rate"))?
        .parse()
        .context("Rate must be a number")
}

fn element(page: &SimulatedPage, arg: Option<&str>) -> anyhow::Result<Arc<SimulatedMedia>> {
    let index = parse_index(arg)?;
    page.get(index).ok_or_else(|| anyhow!("No element {index}"))
}
