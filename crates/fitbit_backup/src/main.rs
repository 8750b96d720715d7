use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use fitbit_client::config::{
    Config, DEFAULT_API_BASE_URL, DEFAULT_AUTH_URL, DEFAULT_TOKEN_URL,
};
use fitbit_client::export::WeightExporter;
use fitbit_client::http_client::ReqwestFitbitClient;
use fitbit_client::oauth::{
    self, CodePrompt, FileTokenSource, LoopbackPrompt, StaticTokenSource, StdinPrompt, Token,
    TokenSource,
};
use secrecy::{ExposeSecret, SecretString};

/// Export all body-weight measurements of a Fitbit account as plain
/// `date time weight` lines on stdout. Redirect stdout to archive them.
#[derive(Debug, Parser)]
#[command(name = "fitbit_backup", version, about)]
struct Args {
    /// OAuth client (consumer) ID (see dev.fitbit.com)
    #[arg(long, env = "FITBIT_CLIENT_ID")]
    client_id: String,

    /// OAuth client (consumer) secret (see dev.fitbit.com)
    #[arg(long, env = "FITBIT_CLIENT_SECRET")]
    client_secret: String,

    /// Path to a JSON-encoded file which will contain the OAuth token
    #[arg(long, env = "FITBIT_TOKEN_CACHE")]
    token_cache: Option<PathBuf>,

    /// Use this access token directly and skip the OAuth flow
    #[arg(long, env = "FITBIT_ACCESS_TOKEN")]
    access_token: Option<String>,

    /// Refresh token paired with --access-token
    #[arg(long, env = "FITBIT_REFRESH_TOKEN", requires = "access_token")]
    refresh_token: Option<String>,

    /// Local address for the OAuth redirect listener (e.g. 127.0.0.1:7319).
    /// Without it the auth code is pasted on stdin.
    #[arg(long, env = "FITBIT_LISTEN")]
    listen: Option<std::net::SocketAddr>,

    /// Base URL of the Fitbit API
    #[arg(long, env = "FITBIT_API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    api_base_url: String,

    /// OAuth authorization page URL
    #[arg(long, env = "FITBIT_AUTH_URL", default_value = DEFAULT_AUTH_URL)]
    auth_url: String,

    /// OAuth token endpoint URL
    #[arg(long, env = "FITBIT_TOKEN_URL", default_value = DEFAULT_TOKEN_URL)]
    token_url: String,
}

impl Args {
    fn into_config(self) -> (Config, Option<std::net::SocketAddr>) {
        let config = Config {
            client_id: self.client_id,
            client_secret: SecretString::new(self.client_secret.into()),
            token_cache: self.token_cache,
            access_token: self.access_token.map(|t| SecretString::new(t.into())),
            refresh_token: self.refresh_token.map(|t| SecretString::new(t.into())),
            api_base_url: self.api_base_url,
            auth_url: self.auth_url,
            token_url: self.token_url,
        };
        (config, self.listen)
    }
}

fn init_logging() {
    // Logs go to stderr; stdout carries only the exported lines.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_env_filter(env_filter)
        .init();
}

async fn token_source(
    config: &Config,
    listen: Option<std::net::SocketAddr>,
) -> anyhow::Result<Arc<dyn TokenSource>> {
    if let Some(access) = &config.access_token {
        let token = Token {
            access_token: access.expose_secret().to_string(),
            token_type: "Bearer".into(),
            refresh_token: config
                .refresh_token
                .as_ref()
                .map(|t| t.expose_secret().to_string()),
            expiry: None,
        };
        return Ok(Arc::new(StaticTokenSource::new(token)));
    }

    let state = oauth::random_state();
    let mut oauth_config = config.oauth();
    let prompt: Box<dyn CodePrompt> = match listen {
        Some(addr) => {
            let prompt = LoopbackPrompt::bind(addr, state.clone())
                .await
                .with_context(|| format!("binding oauth redirect listener on {addr}"))?;
            oauth_config.redirect_uri = Some(prompt.redirect_uri()?);
            Box::new(prompt)
        }
        None => Box::new(StdinPrompt),
    };
    Ok(Arc::new(FileTokenSource::new(
        oauth_config,
        config.token_cache.clone(),
        prompt,
        state,
    )))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let (config, listen) = args.into_config();
    if config.token_cache.is_none() && config.access_token.is_none() {
        tracing::warn!("no --token-cache given; the token will not be persisted across runs");
    }

    let tokens = token_source(&config, listen).await?;
    let client = ReqwestFitbitClient::new(&config.api_base_url, tokens);
    let exporter = WeightExporter::new(client);

    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    let lines = exporter
        .export(&mut out, Utc::now().date_naive())
        .await
        .context("exporting weight measurements")?;
    out.flush().context("flushing stdout")?;

    tracing::info!("exported {lines} weight measurements");
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}
