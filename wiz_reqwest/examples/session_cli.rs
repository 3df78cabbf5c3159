use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use reqwest::Method;
use reqwest_middleware::ClientBuilder;
use tracing_subscriber::EnvFilter;
use wiz_clock::DurationSecs;
use wiz_reqwest::{ApiClient, UnauthorizedBehavior};
use wiz_session::{
    jitter, spawn_background_renewal, FilePersistence, Password, ProviderToken, RenewalBackoff,
    SessionConfig, SessionManagerBuilder, UserSnapshot, Username,
};

#[derive(Debug, Parser)]
struct Opts {
    /// The base URL of the API
    #[arg(short, long, env, default_value = SessionConfig::DEFAULT_API_BASE_URL)]
    api_base_url: url::Url,

    /// The local file used to keep the session between runs
    #[arg(short = 'f', long, env, default_value = ".session.json")]
    session_file: PathBuf,

    /// How many seconds before expiry credentials are renewed
    #[arg(long, env, default_value_t = 300)]
    renewal_margin: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in with a username and password
    Login {
        #[arg(short, long, env = "WIZ_USERNAME")]
        username: Username,

        #[arg(short, long, env = "WIZ_PASSWORD", hide_env_values = true)]
        password: Password,
    },
    /// Log in with a Google access token
    Google {
        #[arg(env = "GOOGLE_ACCESS_TOKEN", hide_env_values = true)]
        token: ProviderToken,
    },
    /// Show the logged-in user
    Whoami,
    /// Fetch a resource from the API
    Get { path: String },
    /// Keep the session renewed until it ends
    Watch,
    /// Log out
    Logout,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let config = SessionConfig::new(opts.api_base_url)
        .with_renewal_margin(DurationSecs(opts.renewal_margin));
    let client = ClientBuilder::new(reqwest::Client::new()).build();

    let manager = SessionManagerBuilder::from_config(&config, client.clone())?
        .with_persistence(Arc::new(FilePersistence::new(opts.session_file)))
        .build();
    let api = ApiClient::new(client, config.api_base_url().clone(), manager.clone());

    if let Some(session) = manager.restore().await {
        tracing::debug!(
            user = %session.user().username,
            expires_at = session.credentials().expires_at().0,
            "restored session"
        );
    }

    match opts.command {
        Command::Login { username, password } => {
            let session = manager.login(&username, &password).await?;
            tracing::info!(
                user = %session.user().username,
                credits = session.user().credits,
                "logged in"
            );
        }
        Command::Google { token } => {
            let session = manager.login_with_google(&token).await?;
            tracing::info!(user = %session.user().username, "logged in with Google");
        }
        Command::Whoami => {
            match api
                .query::<UserSnapshot>("user", UnauthorizedBehavior::ReturnNone)
                .await?
            {
                Some(user) => println!("{} ({} credits)", user.username, user.credits),
                None => println!("not logged in"),
            }
        }
        Command::Get { path } => {
            let response = api.api_request(Method::GET, &path, None).await?;
            let body: serde_json::Value = response.json().await?;
            println!("{body:#}");
        }
        Command::Watch => {
            if manager.session().is_none() {
                println!("not logged in");
                return Ok(());
            }

            let mut ended = manager.subscribe();
            let renewal = spawn_background_renewal(
                manager.clone(),
                jitter::RandomLead::new(DurationSecs(30)),
                RenewalBackoff::default(),
            );

            let ended = ended.recv().await?;
            tracing::info!(reason = %ended.reason, "session ended");
            renewal.abort();
        }
        Command::Logout => {
            manager.logout().await?;
            tracing::info!("logged out");
        }
    }

    Ok(())
}
