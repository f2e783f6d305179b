use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;

use portal_sync::agent::{
  AgentRegistration, AgentRequest, HttpFetcher, Interception, NetworkAgent, ResourceCaches,
};
use portal_sync::api::PostOutcome;
use portal_sync::cache::CacheResult;
use portal_sync::connectivity::NetworkStatus;
use portal_sync::{logging, Config, SyncContext};

#[derive(Parser, Debug)]
#[command(name = "portal-sync")]
#[command(about = "Offline-first access to the portal spreadsheet API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/portal-sync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Treat the network as unreachable: reads are served only from the cache, writes are queued
  #[arg(long, global = true)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List shared files
  Files,
  /// List exams
  Exams,
  /// Show scores for an exam
  Scores { exam_id: String },
  /// Send a write action; queued if the backend is unreachable
  Post {
    action: String,
    /// JSON object merged into the request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Inspect or drive the outbox
  Queue {
    #[command(subcommand)]
    command: QueueCommand,
  },
  /// Inspect or clear the local cache
  Cache {
    #[command(subcommand)]
    command: CacheCommand,
  },
  /// Static asset agent
  Agent {
    #[command(subcommand)]
    command: AgentCommand,
  },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Show pending writes in delivery order
  List,
  /// Deliver pending writes now
  Flush,
  /// Drop every pending write
  Clear,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Show the cached value for a key
  Get { key: String },
  /// Remove every cached value
  Clear,
}

#[derive(Subcommand, Debug)]
enum AgentCommand {
  /// Pre-cache the manifest and activate the configured version
  Install,
  /// Request a URL through the installed agent
  Fetch {
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log);

  let status = if args.offline {
    NetworkStatus::Offline
  } else {
    NetworkStatus::Online
  };

  match args.command {
    Command::Agent { command } => run_agent(&config, command).await,
    command => {
      let ctx = SyncContext::open(&config, status)?;
      run_page(&ctx, command).await
    }
  }
}

async fn run_page(ctx: &SyncContext, command: Command) -> Result<()> {
  let portal = ctx.portal();

  match command {
    Command::Files => print_listing(portal.get_files(None).await?).await,
    Command::Exams => print_listing(portal.get_exams(None).await?).await,
    Command::Scores { exam_id } => print_json(&portal.get_scores(&exam_id).await?),
    Command::Post { action, data } => {
      let payload = match data {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| eyre!("Invalid --data JSON: {}", e))?,
        None => Value::Null,
      };
      match portal.api().post(&action, &payload).await? {
        PostOutcome::Delivered(data) => print_json(&data),
        PostOutcome::Queued { pending } => {
          eprintln!(
            "Backend unreachable; {} queued ({} pending). Run `portal-sync queue flush` to retry.",
            action, pending
          );
          Ok(())
        }
      }
    }
    Command::Queue { command } => run_queue(ctx, command).await,
    Command::Cache { command } => run_cache(ctx, command),
    Command::Agent { .. } => Err(eyre!("agent commands do not use the page context")),
  }
}

async fn run_queue(ctx: &SyncContext, command: QueueCommand) -> Result<()> {
  let outbox = ctx.outbox();
  if !outbox.is_available() {
    return Err(eyre!("Outbox storage is unavailable"));
  }

  match command {
    QueueCommand::List => {
      for item in outbox.get_pending()? {
        println!(
          "{}\t{}\tretries={}\t{}",
          item.id,
          item.label(),
          item.retry_count,
          item.target_url
        );
      }
      Ok(())
    }
    QueueCommand::Flush => {
      if !ctx.connectivity().is_online() {
        return Err(eyre!("Cannot flush while offline"));
      }
      let summary = outbox.flush().await;
      let remaining = outbox.get_pending()?.len();
      println!(
        "delivered={} dropped={} pending={}",
        summary.delivered, summary.dropped, remaining
      );
      Ok(())
    }
    QueueCommand::Clear => {
      outbox.clear()?;
      Ok(())
    }
  }
}

fn run_cache(ctx: &SyncContext, command: CacheCommand) -> Result<()> {
  let cache = ctx.cache();
  match command {
    CacheCommand::Get { key } => match cache.try_get(&key)? {
      Some(entry) => {
        eprintln!(
          "written {} expires in {}s",
          entry
            .written_at_utc()
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
          (entry.expires_at - portal_sync::cache::epoch_millis()).max(0) / 1000
        );
        print_json(&entry.value)
      }
      None => Err(eyre!("No live cache entry for {}", key)),
    },
    CacheCommand::Clear => {
      if !cache.clear() {
        return Err(eyre!("Cache store is unavailable"));
      }
      Ok(())
    }
  }
}

async fn run_agent(config: &Config, command: AgentCommand) -> Result<()> {
  let path = match &config.agent.path {
    Some(p) => p.clone(),
    None => ResourceCaches::default_path()?,
  };
  let caches = Arc::new(ResourceCaches::open(&path)?);
  let agent = NetworkAgent::new(caches, HttpFetcher::new(config.api.timeout())?, &config.agent)?;
  let mut registration = AgentRegistration::new();

  match command {
    AgentCommand::Install => {
      let report = registration.deploy(agent).await?;
      println!(
        "{}: cached {} of {} assets",
        report.cache_name,
        report.cached.len(),
        report.cached.len() + report.failed.len()
      );
      for path in &report.failed {
        eprintln!("  failed: {}", path);
      }
      Ok(())
    }
    AgentCommand::Fetch { url, method } => {
      registration.restore(agent)?;
      let handled = registration
        .handle_fetch(&AgentRequest::new(&method, &url)?)
        .await;

      match &handled.interception {
        Interception::Passthrough => println!("passthrough"),
        Interception::Respond(response) => {
          println!("{} ({:?}, {} bytes)", response.status, response.source, response.body.len());
        }
      }
      if let Some(refresh) = handled.refresh {
        refresh.await?;
      }
      Ok(())
    }
  }
}

async fn print_listing(result: CacheResult<Value>) -> Result<()> {
  eprintln!("source: {}", result.source);
  print_json(&result.data)?;
  // Let the background refresh land before the process exits
  if let Some(refresh) = result.refresh {
    refresh.await?;
  }
  Ok(())
}

fn print_json(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
