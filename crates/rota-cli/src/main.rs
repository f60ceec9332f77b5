//! rota - command-line client for the membership API.
//!
//! Signs in, keeps the session alive and makes authenticated calls. Useful on
//! its own for scripting and as a smoke test of the session authority.

use std::io::{self, Write};

use anyhow::{Context, Result};
use rota_core::api::{ApiRequest, Method};
use rota_core::auth::{
    CredentialStore, FileBackend, KeyringBackend, SessionAuthority, SessionSettings, ViewGuard,
};
use rota_core::{ApiError, Config, Gateway, HttpTransport, StorageKind};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: rota <command>

Commands:
  login [username]     Sign in and store the session
  logout               Forget the stored session
  status               Show what is stored locally
  whoami               Show the signed-in member (renews if needed)
  get <path>           GET an API path and print the response body
  delete <path>        DELETE an API path";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr, filtered by `RUST_LOG` (default `warn`). When
/// `ROTA_LOG_DIR` is set they are also written to a daily rolling file there;
/// the returned guard must live until exit so the file gets flushed.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var("ROTA_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "rota.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn open_store(config: &Config) -> Result<CredentialStore> {
    Ok(match config.storage {
        StorageKind::File => CredentialStore::new(FileBackend::new(&config.cache_dir()?)),
        StorageKind::Keyring => CredentialStore::new(KeyringBackend::new()),
    })
}

fn build_gateway(config: &Config) -> Result<Gateway<HttpTransport>> {
    let transport = HttpTransport::new(config.request_timeout())
        .context("Failed to build HTTP client")?;
    let authority = SessionAuthority::new(
        open_store(config)?,
        transport,
        || eprintln!("Your session has ended. Run `rota login` to sign in again."),
        SessionSettings::from_config(config),
    );
    Ok(Gateway::new(authority, &config.api_base_url))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = Config::load()?;
    let gateway = build_gateway(&config)?;
    info!(command, "rota starting");

    match command {
        "login" => login(&gateway, &config, args.get(1).cloned()).await,
        "logout" => {
            gateway.authority().logout();
            println!("Signed out.");
            Ok(())
        }
        "status" => {
            status(&gateway);
            Ok(())
        }
        "whoami" => whoami(&gateway).await,
        "get" | "delete" => {
            let path = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("{} needs an API path", command))?;
            let method = if command == "get" {
                Method::Get
            } else {
                Method::Delete
            };
            call(&gateway, method, path).await
        }
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

async fn login(
    gateway: &Gateway<HttpTransport>,
    config: &Config,
    username: Option<String>,
) -> Result<()> {
    let username = match username {
        Some(name) => name,
        None => match config.last_username.clone() {
            Some(last) => {
                let input = prompt(&format!("Username [{}]: ", last))?;
                if input.is_empty() {
                    last
                } else {
                    input
                }
            }
            None => prompt("Username: ")?,
        },
    };
    if username.is_empty() {
        anyhow::bail!("Username required");
    }
    let password = rpassword::prompt_password("Password: ")?;

    match gateway.login(&username, &password).await {
        Ok(()) => {}
        Err(ApiError::Unauthorized) => anyhow::bail!("Invalid username or password"),
        Err(e) => return Err(e).context("Login failed"),
    }

    if let Err(e) = Config::remember_username(&username) {
        tracing::warn!(error = %e, "Failed to save config");
    }

    let name = gateway
        .authority()
        .identity()
        .map(|who| who.display_name())
        .unwrap_or(username);
    println!("Signed in as {}.", name);
    Ok(())
}

fn status(gateway: &Gateway<HttpTransport>) {
    let status = gateway.authority().status();
    if !status.is_signed_in() {
        println!("Not signed in.");
        return;
    }
    if let Some(who) = &status.identity {
        println!("Member:   {}", who.display_name());
    }
    let now = chrono::Utc::now();
    match (status.access_expires_at, status.access_expired_at(now)) {
        (Some(at), Some(true)) => println!("Access:   expired at {}", at.to_rfc3339()),
        (Some(at), _) => println!(
            "Access:   valid until {} ({} min)",
            at.to_rfc3339(),
            status.minutes_until_expiry().unwrap_or(0)
        ),
        _ if status.has_access => println!("Access:   present but unreadable"),
        _ => println!("Access:   none"),
    }
    println!(
        "Renewal:  {}",
        if status.has_renewal { "stored" } else { "none" }
    );
}

async fn whoami(gateway: &Gateway<HttpTransport>) -> Result<()> {
    let mut guard = ViewGuard::new(gateway.authority().clone());
    let Some(cached) = guard.render(|| gateway.authority().identity()).await else {
        // The guard already sent the user back to login
        std::process::exit(1);
    };

    let who = match gateway.refresh_identity().await {
        Ok(fresh) => fresh,
        Err(e) if !e.requires_login() => match cached {
            Some(cached) => {
                tracing::warn!(error = %e, "Showing cached profile");
                cached
            }
            None => return Err(e).context("Failed to fetch profile"),
        },
        Err(e) => return Err(e.into()),
    };

    println!("{}", who.display_name());
    if let Some(email) = &who.email {
        println!("{}", email);
    }
    if !who.roles.is_empty() {
        println!("Roles: {}", who.roles.join(", "));
    }
    Ok(())
}

async fn call(gateway: &Gateway<HttpTransport>, method: Method, path: &str) -> Result<()> {
    let request = ApiRequest::new(method, gateway.url(path));
    let response = gateway.call(request).await?;

    // Pretty-print JSON bodies, pass anything else through untouched
    match serde_json::from_str::<serde_json::Value>(&response.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) if !response.body.is_empty() => println!("{}", response.body),
        Err(_) => {}
    }

    if !response.is_success() {
        return Err(ApiError::from_status(response.status, &response.body).into());
    }
    Ok(())
}
