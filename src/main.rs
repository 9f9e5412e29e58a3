mod console;

use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use dotenvy::dotenv;

use aimo_admin::{AdminClient, AdminConfig, AdminError, DEFAULT_BASE_URL, UserLevel};
use console::{ConsoleError, UserFilter};

#[derive(Debug, Parser)]
#[command(author, version, about = "Admin console for the AIMO backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the dashboard: user totals, trends and consumption summaries.
    Dashboard(DashboardArgs),
    /// List users with optional filtering and pagination.
    Users(UsersArgs),
    /// Export users as CSV.
    Export(ExportArgs),
    /// Print the full derived statistics as JSON.
    Stats(StatsArgs),
    /// Show token consumption reported by the backend.
    Tokens(TokensArgs),
    /// Change a user's level.
    SetLevel(SetLevelArgs),
    /// Delete a user.
    Delete(DeleteArgs),
    /// Probe backend health.
    Status(StatusArgs),
    /// Inspect and optionally clear the response cache.
    Cache(CacheArgs),
}

#[derive(Debug, Parser)]
struct ConnectionArgs {
    /// Base URL of the admin backend.
    #[arg(long, env = "AIMO_API_URL", default_value = DEFAULT_BASE_URL)]
    api_url: String,

    /// Admin token sent with mutation requests.
    #[arg(
        long,
        env = "AIMO_ADMIN_TOKEN",
        default_value = "admin_secret_token",
        hide_env_values = true
    )]
    admin_token: String,

    /// Cache time-to-live in milliseconds.
    #[arg(long, env = "AIMO_CACHE_TTL_MS", default_value_t = 30_000)]
    cache_ttl_ms: u64,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Bypass the cache and always refetch.
    #[arg(long)]
    no_cache: bool,
}

#[derive(Debug, Parser)]
struct DashboardArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Emit JSON instead of the formatted dashboard.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct UsersArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Substring filter over nickname and openid.
    #[arg(long)]
    search: Option<String>,

    /// Exact level filter (normal, vip, svip or admin).
    #[arg(long)]
    level: Option<UserLevel>,

    /// Page number, starting at 1.
    #[arg(long, default_value_t = 1)]
    page: usize,

    /// Rows per page.
    #[arg(long, default_value_t = 10)]
    page_size: usize,

    /// Use the legacy key-by-key scan instead of the bulk endpoint.
    #[arg(long)]
    legacy_scan: bool,

    /// Emit JSON instead of the formatted table.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct ExportArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Output file; prints to stdout when omitted.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Substring filter over nickname and openid.
    #[arg(long)]
    search: Option<String>,

    /// Exact level filter (normal, vip, svip or admin).
    #[arg(long)]
    level: Option<UserLevel>,
}

#[derive(Debug, Parser)]
struct StatsArgs {
    #[command(flatten)]
    connection: ConnectionArgs,
}

#[derive(Debug, Parser)]
struct TokensArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Also list the recent daily consumption history.
    #[arg(long)]
    history: bool,

    /// Emit JSON instead of formatted text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct SetLevelArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Target user openid.
    openid: String,

    /// New level (normal, vip, svip or admin).
    level: UserLevel,
}

#[derive(Debug, Parser)]
struct DeleteArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Target user openid.
    openid: String,

    /// Skip the confirmation gate.
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Emit JSON instead of formatted text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct CacheArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Clear the cache after showing it.
    #[arg(long)]
    clear: bool,

    /// Emit JSON instead of formatted text.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        report_error(&err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), ConsoleError> {
    match cli.command {
        Command::Dashboard(args) => {
            let client = build_client(&args.connection)?;
            console::dashboard(&client, !args.connection.no_cache, args.json).await
        }
        Command::Users(args) => {
            let client = build_client(&args.connection)?;
            let filter = UserFilter {
                search: args.search.as_deref(),
                level: args.level,
            };
            console::users(
                &client,
                filter,
                args.page,
                args.page_size,
                args.legacy_scan,
                !args.connection.no_cache,
                args.json,
            )
            .await
        }
        Command::Export(args) => {
            let client = build_client(&args.connection)?;
            let filter = UserFilter {
                search: args.search.as_deref(),
                level: args.level,
            };
            console::export(
                &client,
                args.output.as_deref(),
                filter,
                !args.connection.no_cache,
            )
            .await
        }
        Command::Stats(args) => {
            let client = build_client(&args.connection)?;
            console::stats(&client, !args.connection.no_cache).await
        }
        Command::Tokens(args) => {
            let client = build_client(&args.connection)?;
            console::tokens(&client, args.history, !args.connection.no_cache, args.json).await
        }
        Command::SetLevel(args) => {
            let client = build_client(&args.connection)?;
            console::set_level(&client, &args.openid, args.level).await
        }
        Command::Delete(args) => {
            let client = build_client(&args.connection)?;
            console::delete(&client, &args.openid, args.yes).await
        }
        Command::Status(args) => {
            let client = build_client(&args.connection)?;
            console::status(&client, args.json).await
        }
        Command::Cache(args) => {
            let client = build_client(&args.connection)?;
            console::cache(&client, args.clear, args.json).await
        }
    }
}

fn build_client(connection: &ConnectionArgs) -> Result<AdminClient, ConsoleError> {
    let mut config = AdminConfig::new(connection.api_url.clone(), connection.admin_token.clone());
    config.cache_ttl = Duration::from_millis(connection.cache_ttl_ms);
    config.request_timeout = Duration::from_secs(connection.timeout_secs);
    Ok(AdminClient::new(config)?)
}

fn report_error(err: &ConsoleError) {
    eprintln!("error: {err}");
    let ConsoleError::Admin(admin) = err else {
        return;
    };
    match admin {
        AdminError::InvalidBaseUrl { url, .. } => {
            eprintln!("  url: {url}");
        }
        AdminError::Http(source) => {
            if source.is_timeout() {
                eprintln!("  timed out");
            }
            if let Some(url) = source.url() {
                eprintln!("  url: {url}");
            }
        }
        AdminError::Status {
            endpoint,
            status,
            message,
        } => {
            eprintln!("  endpoint: {endpoint}");
            eprintln!("  status: {status}");
            eprintln!("  message: {message}");
        }
        AdminError::Decode { endpoint, source } => {
            eprintln!("  endpoint: {endpoint}");
            eprintln!("  detail: {source}");
        }
        AdminError::Rejected { endpoint, message } => {
            eprintln!("  endpoint: {endpoint}");
            eprintln!("  message: {message}");
        }
    }
}
