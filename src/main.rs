//! foxden CLI: manage profiles and drive browser sessions from a terminal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use foxden::{
  BrowserEngine, CamoufoxEngine, Profile, ProfileStore, SessionLauncher, SessionRegistry, VlessUri,
};

#[derive(Parser)]
#[command(name = "foxden", version, about = "Profile, proxy and session manager for Camoufox")]
struct Cli {
  /// Path to the profile store document (defaults to the platform data dir)
  #[arg(long, global = true)]
  store: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// List all profiles
  List,
  /// Create a profile
  Create {
    name: String,
    /// VLESS connection string for the profile's proxy
    #[arg(long)]
    vless: Option<String>,
    /// Run the browser headless
    #[arg(long)]
    headless: bool,
  },
  /// Delete a profile
  Delete { id: String },
  /// Duplicate a profile under a new identity
  Copy {
    id: String,
    /// Name for the duplicate (defaults to "<source> (copy)")
    #[arg(long)]
    name: Option<String>,
  },
  /// Print a profile as JSON
  Export { id: String },
  /// Import a profile from a JSON file (gets a fresh id)
  Import { path: PathBuf },
  /// Parse and validate a VLESS connection string
  CheckVless { uri: String },
  /// Launch a profile's browser session and wait for it to end
  Launch {
    id: String,
    /// Explicit path to the Camoufox executable
    #[arg(long)]
    camoufox: Option<PathBuf>,
    /// Use a throwaway user-data directory instead of the persistent one
    #[arg(long)]
    ephemeral: bool,
  },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  env_logger::init();
  let cli = Cli::parse();

  let store = Arc::new(match &cli.store {
    Some(path) => ProfileStore::open(path)?,
    None => ProfileStore::open_default()?,
  });

  match cli.command {
    Commands::List => {
      let profiles = store.list_all();
      if profiles.is_empty() {
        println!("no profiles");
        return Ok(());
      }
      for profile in profiles {
        let proxy = if profile.effective_vless().is_some() {
          "vless"
        } else if profile.proxy.is_some() {
          "manual"
        } else {
          "none"
        };
        println!(
          "{}  {:<20}  proxy: {:<6}  cookies: {}",
          profile.id,
          profile.name,
          proxy,
          profile.cookies.len()
        );
      }
    }

    Commands::Create {
      name,
      vless,
      headless,
    } => {
      if let Some(raw) = &vless {
        // Reject obviously broken strings at creation time instead of at
        // first launch.
        VlessUri::parse(raw)?;
      }
      let mut profile = Profile::new(name);
      profile.vless_raw = vless;
      if headless {
        let mut settings = profile.settings();
        settings.headless = true;
        profile.camoufox = Some(settings);
      }
      let created = store.create(profile)?;
      println!("created {} ({})", created.name, created.id);
    }

    Commands::Delete { id } => {
      if store.delete(&id)? {
        println!("deleted {id}");
      } else {
        println!("no profile with id {id}");
      }
    }

    Commands::Copy { id, name } => {
      let copy = store.copy(&id, name.as_deref())?;
      println!("created {} ({})", copy.name, copy.id);
    }

    Commands::Export { id } => {
      let doc = store.export_profile(&id)?;
      println!("{}", serde_json::to_string_pretty(&doc)?);
    }

    Commands::Import { path } => {
      let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
      let imported = store.import_profile(raw)?;
      println!("imported {} ({})", imported.name, imported.id);
    }

    Commands::CheckVless { uri } => {
      let parsed = VlessUri::parse(&uri)?;
      println!("host:     {}", parsed.host());
      println!("port:     {}", parsed.port());
      println!("uuid:     {}", parsed.uuid());
      println!("security: {}", parsed.param("security", "reality"));
      println!("type:     {}", parsed.param("type", "tcp"));
      if !parsed.name().is_empty() {
        println!("name:     {}", parsed.name());
      }
    }

    Commands::Launch {
      id,
      camoufox,
      ephemeral,
    } => {
      let engine: Arc<dyn BrowserEngine> = Arc::new(match camoufox {
        Some(path) => CamoufoxEngine::with_executable(path),
        None => CamoufoxEngine::new(),
      });
      let mut launcher = SessionLauncher::new(engine);
      if ephemeral {
        launcher = launcher.ephemeral();
      }
      let registry = SessionRegistry::new(store.clone(), launcher);

      registry.launch(&id, None).await?;
      println!("session running; close the window or press Ctrl-C to stop");

      loop {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => {
            println!("stopping");
            break;
          }
          _ = tokio::time::sleep(Duration::from_secs(2)) => {
            if !registry.is_running(&id).await {
              println!("window closed");
              break;
            }
            // Keep the stored cookies fresh while the session lives.
            if let Err(e) = registry.snapshot_cookies(&id).await {
              log::warn!("cookie snapshot failed: {e}");
            }
          }
        }
      }

      if let Err(e) = registry.snapshot_cookies(&id).await {
        log::warn!("final cookie snapshot failed: {e}");
      }
      registry.stop(&id).await;
    }
  }

  Ok(())
}
