use anyhow::{Context, Result};
use auth_session_client::{
    auth::{Credential, SessionEvent},
    config::{CliArgs, Command, Config},
    AuthenticatedClient,
};
use clap::Parser;
use dialoguer::Password;
use reqwest::{Method, Response};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::load(&args)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    tracing::debug!(
        api_url = %config.api_url,
        storage = ?config.storage,
        storage_file = %config.storage_file.display(),
        "Configuration loaded"
    );

    let client = AuthenticatedClient::from_config(&config)?;
    let mut events = client.subscribe();

    let result = run(&client, args.command).await;

    // Events are published before waiters see the refresh outcome, so they are queued by now
    report_session_events(&mut events);

    result
}

async fn run(client: &AuthenticatedClient, command: Command) -> Result<()> {
    match command {
        Command::Request { method, path, data } => {
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;

            let mut builder = client.request(method, &path);
            if let Some(data) = data {
                let body: serde_json::Value =
                    serde_json::from_str(&data).context("Request body is not valid JSON")?;
                builder = builder.json(&body);
            }

            let response = client.send(builder).await?;
            print_response(response).await
        }

        Command::Login { token } => {
            let token = match token {
                Some(token) => token,
                None => Password::new()
                    .with_prompt("Bearer token")
                    .interact()
                    .context("Failed to read token")?,
            };

            if token.trim().is_empty() {
                anyhow::bail!("Token cannot be empty");
            }

            client.login(&Credential::new(token.trim()))?;
            eprintln!("✅ Token stored");
            Ok(())
        }

        Command::Logout => {
            client.logout()?;
            eprintln!("👋 Logged out");
            Ok(())
        }

        Command::Whoami => match client.current_session().await {
            Ok(response) => print_response(response).await,
            Err(e) if e.is_unauthorized() => {
                eprintln!("Not logged in");
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
    }
}

/// Print status to stderr and the body to stdout, pretty-printing JSON
async fn print_response(response: Response) -> Result<()> {
    let status = response.status();
    let body = response.text().await.context("Failed to read response body")?;

    eprintln!("{}", status);
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", body),
    }

    Ok(())
}

fn report_session_events(events: &mut broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Refreshed { expires_at } => {
                tracing::info!(expires_at = ?expires_at, "Session renewed");
            }
            SessionEvent::Expired {
                reason,
                login_route,
            } => {
                tracing::error!(reason = %reason, "Session expired");
                eprintln!("❌ Session expired. Please log in again.");
                eprintln!("   Redirect: {}", login_route);
            }
        }
    }
}
