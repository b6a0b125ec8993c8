use anyhow::Result;
use clap::{ArgGroup, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "ctxprune")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "ctxprune - prune superseded tool outputs from LLM requests")]
struct Args {
    /// Root of conversation, pruned-id and log files (default ~/.ctxprune)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Settings file (default <data-dir>/settings.toml)
    #[arg(long, global = true, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Also log to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rewrite a request body (file or stdin) and print the result
    #[command(group(ArgGroup::new("scope").required(true).args(["conversation", "global"])))]
    Rewrite {
        /// Filter against this conversation's pruned ids
        #[arg(long, value_name = "ID")]
        conversation: Option<String>,

        /// Filter against the union of every conversation's pruned ids
        #[arg(long)]
        global: bool,

        /// Request body; read from stdin when omitted
        file: Option<PathBuf>,
    },
    /// Run one janitor pass over a conversation
    Janitor {
        #[arg(long, value_name = "ID")]
        conversation: String,
    },
    /// List pruned call ids for a conversation, or across all of them
    Pruned {
        #[arg(long, value_name = "ID")]
        conversation: Option<String>,
    },
    /// Print the JSON schema of the settings file
    Schema,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => ctxprune_core::persistence::default_data_dir()?,
    };
    setup_tracing(&data_dir, args.verbose)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, data_dir))
}

async fn async_main(args: Args, data_dir: PathBuf) -> Result<()> {
    info!(?data_dir, command = ?args.command, "CLI startup");

    if let Command::Schema = args.command {
        return commands::print_schema();
    }

    let settings_path = args
        .settings
        .unwrap_or_else(|| data_dir.join("settings.toml"));
    let ctx = commands::build_context(&data_dir, settings_path)?;

    match args.command {
        Command::Rewrite {
            conversation,
            global: _,
            file,
        } => commands::rewrite(ctx, conversation, file).await,
        Command::Janitor { conversation } => commands::janitor(ctx, &conversation).await,
        Command::Pruned { conversation } => commands::pruned(ctx, conversation).await,
        Command::Schema => Ok(()),
    }
}

fn setup_tracing(data_dir: &Path, verbose: bool) -> Result<()> {
    use std::fs;
    use tracing_subscriber::fmt;

    let log_dir = data_dir.join("logs");
    fs::create_dir_all(&log_dir)?;
    let file = tracing_appender::rolling::daily(&log_dir, "ctxprune.log");

    let stderr = verbose.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(stderr)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Tracing initialized to {:?}", log_dir);
    Ok(())
}
