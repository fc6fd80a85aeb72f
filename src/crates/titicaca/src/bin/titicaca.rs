//! Titicaca CLI - image import tasks and image cache maintenance
//!
//! Main entry point for the titicaca command-line tool.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use titicaca::cli::{self, App};
use titicaca::{RequestContext, Result};

#[derive(Parser)]
#[command(name = "titicaca")]
#[command(about = "Titicaca - image import tasks and image cache maintenance", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (default: ~/.titicaca/config.toml, then ./.titicaca/config.toml)
    #[arg(long, global = true, env = "TITICACA_CONFIG")]
    config: Option<PathBuf>,

    /// Act as this user instead of the service
    #[arg(long, global = true, env = "TITICACA_USER")]
    user: Option<String>,

    /// Project the user acts in
    #[arg(long, global = true, env = "TITICACA_PROJECT", default_value = "")]
    project: String,

    /// Roles of the user (repeatable)
    #[arg(long = "role", global = true)]
    roles: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn request_context(&self) -> RequestContext {
        match &self.user {
            Some(user) => {
                RequestContext::new(user.clone(), self.project.clone()).with_roles(self.roles.clone())
            }
            None => RequestContext::admin(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Task management commands
    #[command(subcommand)]
    Task(TaskCommands),

    /// Image cache commands
    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create a pending task
    Create {
        /// Task type: import, api_image_import
        #[arg(short = 't', long = "type")]
        task_type: String,
        /// Owning project (default: the caller's project)
        #[arg(short, long)]
        owner: Option<String>,
        /// Image the task works on
        #[arg(long)]
        image_id: Option<String>,
        /// Task input as JSON
        #[arg(short, long)]
        input: String,
    },
    /// Show task details
    Show {
        /// Task ID
        id: String,
    },
    /// List all tasks
    List,
    /// Run a pending task to completion
    Run {
        /// Task ID
        id: String,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Cache every queued image
    Prefetch,
    /// Remove invalid and stalled entries
    Clean,
    /// Evict least recently used images down to the size limit
    Prune,
    /// List cached images
    ListCached,
    /// List queued images
    ListQueued,
    /// Queue an image for prefetching
    QueueImage {
        /// Image ID
        id: String,
    },
    /// Delete one cached image
    DeleteCachedImage {
        /// Image ID
        id: String,
    },
    /// Remove one image from the queue
    DeleteQueuedImage {
        /// Image ID
        id: String,
    },
    /// Delete every cached image
    DeleteAllCachedImages,
    /// Empty the queue
    DeleteAllQueuedImages,
}

async fn run(cli: Cli) -> Result<()> {
    let config = titicaca::load_config(cli.config.clone()).await?;
    cli::init_logging(&config.logging);

    let ctx = cli.request_context();
    let app = App::new(config).await?;

    match cli.command {
        Commands::Task(task_cmd) => match task_cmd {
            TaskCommands::Create {
                task_type,
                owner,
                image_id,
                input,
            } => cli::task::handle_create(&app, &ctx, task_type, owner, image_id, input).await,
            TaskCommands::Show { id } => cli::task::handle_show(&app, &ctx, id).await,
            TaskCommands::List => cli::task::handle_list(&app, &ctx).await,
            TaskCommands::Run { id } => cli::task::handle_run(&app, &ctx, id).await,
        },
        Commands::Cache(cache_cmd) => match cache_cmd {
            CacheCommands::Prefetch => cli::cache::handle_prefetch(&app).await,
            CacheCommands::Clean => cli::cache::handle_clean(&app).await,
            CacheCommands::Prune => cli::cache::handle_prune(&app).await,
            CacheCommands::ListCached => cli::cache::handle_list_cached(&app).await,
            CacheCommands::ListQueued => cli::cache::handle_list_queued(&app).await,
            CacheCommands::QueueImage { id } => cli::cache::handle_queue_image(&app, id).await,
            CacheCommands::DeleteCachedImage { id } => {
                cli::cache::handle_delete_cached_image(&app, id).await
            }
            CacheCommands::DeleteQueuedImage { id } => {
                cli::cache::handle_delete_queued_image(&app, id).await
            }
            CacheCommands::DeleteAllCachedImages => {
                cli::cache::handle_delete_all_cached_images(&app).await
            }
            CacheCommands::DeleteAllQueuedImages => {
                cli::cache::handle_delete_all_queued_images(&app).await
            }
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::from(e.exit_code())
        }
    }
}
