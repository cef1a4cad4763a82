//! AgenShield - Skill Lifecycle Daemon
//!
//! Usage:
//!   agenshield watch                # run the integrity watcher
//!   agenshield upload ...           # lifecycle operations
//!   agenshield list                 # inspect state

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agenshield_core::config::ShieldConfig;
use agenshield_core::lifecycle::{InstallRequest, UploadRequest};
use agenshield_core::manager::{ShieldManager, ShieldManagerOptions};
use agenshield_core::types::FileEntry;

#[derive(Parser)]
#[command(name = "agenshield")]
#[command(about = "Skill lifecycle daemon", long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, short, default_value = "agenshield.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the integrity watcher in the foreground
    Watch,
    /// Upload a skill from a directory or zip archive
    Upload {
        /// Skill slug
        slug: String,
        /// Version string
        version: String,
        /// Directory (or .zip archive) holding the skill files
        path: PathBuf,
        /// Display name (defaults to the slug)
        #[arg(long)]
        name: Option<String>,
    },
    /// Install a skill (local id, or marketplace id with --remote)
    Install {
        /// Skill id, or remote id with --remote
        id: String,
        /// Treat the id as a marketplace remote id
        #[arg(long)]
        remote: bool,
        /// Specific version (latest when omitted)
        #[arg(long)]
        version: Option<String>,
    },
    /// Remove an installation
    Uninstall {
        /// Installation id
        installation_id: String,
    },
    /// Approve a version
    Approve {
        /// Version id
        version_id: String,
    },
    /// List skills and their versions
    List,
    /// List installations
    Installations,
    /// Analyze a version (or everything pending)
    Analyze {
        /// Version id; analyzes all pending versions when omitted
        version_id: Option<String>,
    },
    /// Check marketplace skills for pending updates
    CheckUpdates,
    /// Apply all pending updates
    ApplyUpdates,
    /// Run one poll pass and exit
    Poll,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("agenshield=info,agenshield_core=info")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ShieldConfig::load_or_default(&cli.config)?;
    let manager = ShieldManager::new(ShieldManagerOptions::new(config))?;

    match cli.command {
        Commands::Watch => {
            manager.start_watcher()?;
            tracing::info!("watching; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("signal handler failed")?;
            manager.stop_watcher();
        }
        Commands::Upload {
            slug,
            version,
            path,
            name,
        } => {
            let name = name.unwrap_or_else(|| slug.clone());
            let (skill, stored) = if path.extension().and_then(|e| e.to_str()) == Some("zip") {
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("Failed to read archive: {}", path.display()))?;
                manager.upload_archive(&name, &slug, &version, &bytes)?
            } else {
                let files: Vec<FileEntry> = agenshield_core::fs::read_files(&path)?;
                let mut request = UploadRequest::new(name, slug, version, files);
                request.folder_path = Some(path.display().to_string());
                manager.upload(request)?
            };
            println!("uploaded {} {} ({})", skill.slug, stored.version, stored.id);
            println!("content hash: {}", stored.content_hash);
        }
        Commands::Install {
            id,
            remote,
            version,
        } => {
            let mut request = if remote {
                InstallRequest::remote(id)
            } else {
                InstallRequest::local(id)
            };
            request.version = version;
            let installation = manager.install(request).await?;
            println!("installed: {} ({:?})", installation.id, installation.status);
        }
        Commands::Uninstall { installation_id } => {
            manager.uninstall(&installation_id).await?;
            println!("uninstalled: {installation_id}");
        }
        Commands::Approve { version_id } => {
            manager.approve_version(&version_id)?;
            println!("approved: {version_id}");
        }
        Commands::List => {
            for skill in manager.skills(None)? {
                println!("{} [{}] ({})", skill.slug, skill.source.as_str(), skill.id);
                for version in manager.versions(&skill.id)? {
                    println!(
                        "  {} {} approval={} hash={}",
                        version.id,
                        version.version,
                        version.approval.as_str(),
                        &version.content_hash
                    );
                }
            }
        }
        Commands::Installations => {
            for installation in manager.installations()? {
                println!(
                    "{} version={} status={} auto_update={}",
                    installation.id,
                    installation.skill_version_id,
                    installation.status.as_str(),
                    installation.auto_update
                );
            }
        }
        Commands::Analyze { version_id } => match version_id {
            Some(version_id) => {
                let result = manager.analyze_version(&version_id).await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            None => {
                let analyzed = manager.analyze_pending().await?;
                println!("analyzed {analyzed} pending version(s)");
            }
        },
        Commands::CheckUpdates => {
            for update in manager.check_updates().await? {
                println!(
                    "{}: {} -> {}",
                    update.slug,
                    update.current_version.as_deref().unwrap_or("-"),
                    update.latest_version
                );
            }
        }
        Commands::ApplyUpdates => {
            let applied = manager.apply_pending_updates().await?;
            println!("applied {applied} update(s)");
        }
        Commands::Poll => {
            let violations = manager.poll().await?;
            println!("poll complete: {violations} violation(s)");
        }
    }

    Ok(())
}
