use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "gmfetch", version, about = "Gmail credential lifecycle and batched fetcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// Identity key the credential is stored under
    #[arg(long, global = true, env = "GMFETCH_IDENTITY", default_value = "default")]
    identity: String,

    /// Config file (defaults to ~/.gmfetch/config.json)
    #[arg(long, global = true, env = "GMFETCH_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the consent URL to visit
    AuthUrl {
        /// Opaque value echoed back on the redirect
        #[arg(long)]
        state: Option<String>,
    },
    /// Exchange an authorization code and store the credential
    Authorize { code: String },
    /// Show the stored credential's state
    Status,
    /// Print a valid access token, refreshing if needed
    Token,
    /// List message ids
    List(ListArgs),
    /// Fetch full messages by id, or for the first page of a query
    Fetch(FetchArgs),
    /// Revoke the grant and delete the stored credential
    Logout,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Gmail search expression
    #[arg(long, short)]
    query: Option<String>,
    #[arg(long = "label")]
    labels: Vec<String>,
    #[arg(long, default_value_t = 50)]
    limit: u32,
    #[arg(long, default_value_t = false)]
    include_spam_trash: bool,
    /// Follow continuation tokens until the listing is exhausted
    #[arg(long, default_value_t = false)]
    all: bool,
}

#[derive(Debug, Args)]
struct FetchArgs {
    ids: Vec<String>,
    /// Fetch the first page of this search instead of explicit ids
    #[arg(long, short)]
    query: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: u32,
    /// Stop issuing groups after this many seconds
    #[arg(long)]
    deadline_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use gmfetch::config::{Config, TokenStoreKind};
    use gmfetch::credentials::{CredentialStore, FileCredentialStore, TokenCipher};
    use gmfetch::gmail::{GmailClient, GoogleOAuthClient};
    use gmfetch::output::{self, CredentialStatus, FetchReportItem, OutputFormat};
    use gmfetch::{BatchFetcher, CredentialManager, ListQuery, Pager, SqliteCredentialStore};

    use super::{Cli, Commands, FetchArgs, ListArgs};

    const DB_FILE_NAME: &str = "gmfetch.db";

    struct Services {
        manager: Arc<CredentialManager>,
        gmail: Arc<GmailClient>,
    }

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let format = OutputFormat::from_json_flag(cli.json);
        let services = build_services(cli.config.as_deref(), &cli.identity)?;

        match cli.command {
            Commands::AuthUrl { state } => handle_auth_url(&services, state.as_deref()),
            Commands::Authorize { code } => handle_authorize(&services, &code, format).await,
            Commands::Status => handle_status(&services, format).await,
            Commands::Token => handle_token(&services).await,
            Commands::List(args) => handle_list(&services, args, format).await,
            Commands::Fetch(args) => handle_fetch(&services, args, format).await,
            Commands::Logout => handle_logout(&services).await,
        }
    }

    fn build_services(config_path: Option<&Path>, identity: &str) -> Result<Services> {
        let config_path = match config_path {
            Some(path) => path.to_path_buf(),
            None => Config::default_config_path().context("resolve default gmfetch config path")?,
        };
        let config = Config::load(Some(&config_path))
            .with_context(|| format!("load gmfetch config from {}", config_path.display()))?;
        config.oauth.validate()?;

        let data_dir = config.data_dir()?;
        let store: Arc<dyn CredentialStore> = match config.token_store {
            TokenStoreKind::Sqlite => {
                let db_path = data_dir.join(DB_FILE_NAME);
                Arc::new(
                    SqliteCredentialStore::open(&db_path)
                        .with_context(|| format!("open token database at {}", db_path.display()))?,
                )
            }
            TokenStoreKind::File => {
                let mut store = FileCredentialStore::new(&data_dir, &config.credentials_file_name)
                    .allow_multiple(config.allow_multiple_credentials);
                if let Some(key) = &config.token_cache_key {
                    store = store.with_cipher(
                        TokenCipher::from_hex(key).context("parse GMFETCH_TOKEN_CACHE_KEY")?,
                    );
                }
                Arc::new(store)
            }
        };

        let timeout = config.request_timeout();
        let oauth = GoogleOAuthClient::with_timeout(config.oauth.clone(), timeout)?;
        let gmail = Arc::new(GmailClient::with_timeout(timeout)?);
        let manager = CredentialManager::new(identity, store, Arc::new(oauth))
            .with_profile_lookup(gmail.clone());

        Ok(Services {
            manager: Arc::new(manager),
            gmail,
        })
    }

    fn handle_auth_url(services: &Services, state: Option<&str>) -> Result<()> {
        let url = services.manager.authorization_url(state)?;
        println!("{url}");
        Ok(())
    }

    async fn handle_authorize(services: &Services, code: &str, format: OutputFormat) -> Result<()> {
        services
            .manager
            .exchange_authorization_code(code)
            .await
            .context("authorize gmail access")?;
        handle_status(services, format).await
    }

    async fn handle_status(services: &Services, format: OutputFormat) -> Result<()> {
        let manager = &services.manager;
        let state = manager.state().await?;
        let credential = manager.current().await?;
        let status = CredentialStatus::new(manager.identity_key(), state, credential.as_ref());
        println!("{}", output::format_status(format, &status)?);
        Ok(())
    }

    async fn handle_token(services: &Services) -> Result<()> {
        let token = services
            .manager
            .valid_access_token()
            .await
            .context("obtain gmail access token")?;
        println!("{}", token.as_str());
        Ok(())
    }

    async fn handle_list(services: &Services, args: ListArgs, format: OutputFormat) -> Result<()> {
        let mut query = ListQuery::new()
            .take(args.limit)
            .include_spam_trash(args.include_spam_trash);
        if let Some(q) = args.query {
            query = query.query(q);
        }
        for label in args.labels {
            query = query.label(label);
        }

        let mut pager = Pager::new(services.gmail.clone(), services.manager.clone());
        let mut page = pager.first(query).await.context("list gmail messages")?;
        if args.all {
            while pager.has_next() {
                let next = pager.next().await.context("list next gmail page")?;
                page.items.extend(next.items);
                page.continuation_token = next.continuation_token;
            }
        }
        page.estimated_total = pager.estimated_total();

        println!("{}", output::format_listing(format, &page)?);
        Ok(())
    }

    async fn handle_fetch(services: &Services, args: FetchArgs, format: OutputFormat) -> Result<()> {
        let fetcher = BatchFetcher::new(services.gmail.clone(), services.manager.clone());

        let ids = match (&args.query, args.ids.is_empty()) {
            (Some(q), true) => {
                let mut pager = Pager::new(services.gmail.clone(), services.manager.clone());
                pager
                    .first(ListQuery::new().query(q.clone()).take(args.limit))
                    .await
                    .context("list gmail messages to fetch")?
                    .ids()
            }
            (None, false) => args.ids,
            (Some(_), false) => return Err(anyhow!("pass either message ids or --query, not both")),
            (None, true) => return Err(anyhow!("no message ids given")),
        };

        if ids.len() == 1 && format == OutputFormat::Table {
            let message = fetcher.resolve_one(&ids[0]).await?;
            println!("{}", output::format_message(format, &message)?);
            return Ok(());
        }

        let deadline = args
            .deadline_secs
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
        let items: Vec<FetchReportItem> = fetcher
            .resolve_until(&ids, deadline)
            .await
            .into_iter()
            .map(FetchReportItem::from_outcome)
            .collect();

        println!("{}", output::format_fetch_results(format, &items)?);
        Ok(())
    }

    async fn handle_logout(services: &Services) -> Result<()> {
        services
            .manager
            .revoke()
            .await
            .context("revoke gmail credential")?;
        println!("Signed out '{}'.", services.manager.identity_key());
        Ok(())
    }
}
