use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use timeline_client::transport::{Endpoints, HttpSnapshotFetcher, SnapshotFetcher};
use timeline_client::{load_settings, load_settings_from_path, ClientSettings, ConnectArgs, SessionMultiplexer};
use timeline_core::action::{TimelineAction, TimelineSink};
use timeline_core::entity::TimelineEntity;
use timeline_core::ids::ConversationId;
use timeline_sem::SemRuntime;
use timeline_store::SharedTimeline;
use timeline_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "timeline", about = "Follow a conversation timeline from a chat server")]
struct Cli {
    /// Settings file (defaults to ~/.timeline/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Server origin, overriding settings.
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print the timeline whenever it changes, until Ctrl-C.
    Tail {
        #[arg(long)]
        conv: String,

        /// Skip the initial snapshot fetch.
        #[arg(long)]
        no_hydrate: bool,

        /// Print the raw frames received for the conversation on exit.
        #[arg(long)]
        dump_history: bool,
    },
    /// Fetch one snapshot and print its entities as JSON.
    Snapshot {
        #[arg(long)]
        conv: String,
    },
}

fn settings(cli: &Cli) -> anyhow::Result<ClientSettings> {
    let mut settings = match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("loading settings")?;
    if let Some(base_url) = &cli.base_url {
        settings.base_url = base_url.clone();
        settings.validate().context("--base-url")?;
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = settings(&cli)?;
    let _telemetry = init_telemetry(TelemetryConfig::from_level_str(&settings.log_level, settings.log_json));

    match cli.command {
        Command::Tail {
            conv,
            no_hydrate,
            dump_history,
        } => tail(&settings, ConversationId::from_raw(conv), !no_hydrate && settings.hydrate, dump_history).await,
        Command::Snapshot { conv } => snapshot(&settings, ConversationId::from_raw(conv)).await,
    }
}

async fn tail(settings: &ClientSettings, conv_id: ConversationId, hydrate: bool, dump_history: bool) -> anyhow::Result<()> {
    let runtime = Arc::new(SemRuntime::with_defaults());
    let mux = SessionMultiplexer::from_settings(settings, runtime)?;
    let store = Arc::new(SharedTimeline::new());
    let mut revisions = store.subscribe();

    let args = ConnectArgs::new(conv_id.clone(), store.clone())
        .with_hydrate(hydrate)
        .with_status_observer(|status| println!("status: {status}"));
    tracing::info!(%conv_id, hydrate, "tailing conversation");
    mux.connect(args).await.context("connecting")?;
    print_timeline(&store, &conv_id);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                print_timeline(&store, &conv_id);
            }
        }
    }

    if dump_history {
        let frames = mux.history().frames(&conv_id);
        println!("{}", serde_json::to_string_pretty(&frames)?);
    }
    mux.disconnect(&conv_id);
    tracing::info!("disconnected");
    Ok(())
}

async fn snapshot(settings: &ClientSettings, conv_id: ConversationId) -> anyhow::Result<()> {
    let endpoints = Endpoints::from_settings(settings)?;
    let fetcher = HttpSnapshotFetcher::new(endpoints, settings.fetch_timeout());
    let snapshot = fetcher.fetch(&conv_id).await.context("fetching snapshot")?;

    // Run it through the store so duplicates collapse the same way they
    // would during hydration.
    let store = SharedTimeline::new();
    store.dispatch(TimelineAction::ApplySnapshot {
        conv_id: conv_id.clone(),
        entities: snapshot.entities,
    });
    let entities = store.entities(&conv_id);
    println!("{}", serde_json::to_string_pretty(&entities)?);
    Ok(())
}

fn print_timeline(store: &SharedTimeline, conv_id: &ConversationId) {
    let entities = store.entities(conv_id);
    println!("--- rev {} ({} entities)", store.revision(), entities.len());
    for entity in &entities {
        println!("{}", summarize(entity));
    }
    if let Some(err) = store.session(conv_id).and_then(|s| s.last_error().cloned()) {
        println!("last error: {err}");
    }
}

fn summarize(entity: &TimelineEntity) -> String {
    let text = ["content", "message", "name"]
        .iter()
        .find_map(|key| entity.prop_str(key))
        .unwrap_or("");
    let mut line: String = text.chars().take(72).collect();
    if text.chars().count() > 72 {
        line.push('…');
    }
    let version = entity.version.map(|v| format!(" v{v}")).unwrap_or_default();
    format!("{:<10} {}{}  {}", entity.kind, entity.id, version, line.replace('\n', " "))
}
