//! authrelay - command-line access to a JWT-protected API.
//!
//! Credentials live in the OS keychain. Expired access tokens are renewed
//! transparently; when renewal fails the session is dropped and the user is
//! asked to log in again.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use authrelay_core::{
    ApiError, ApiRequest, Config, CredentialStore, Dispatcher, KeyringStore, SessionEvent,
};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: authrelay <command>

Commands:
  login [email]          Log in and store tokens in the keychain
  logout                 Forget stored tokens
  whoami                 Show the cached user profile
  get <path>             GET a path relative to the API base URL
  post <path> <json>     POST a JSON body
  delete <path>          DELETE a path
  burst <path> <count>   Fire <count> concurrent GETs (exercises renewal)";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

/// Stand-in for the navigation layer: a terminated session sends the user
/// back to login.
fn watch_session(mut events: broadcast::Receiver<SessionEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Terminated { reason, .. }) => {
                    warn!(%reason, "Session terminated");
                    eprintln!("Session expired. Run `authrelay login` to sign in again.");
                }
                Ok(SessionEvent::Renewed { at }) => info!(%at, "Session renewed"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let config = Config::load().context("Failed to load configuration")?;
    let store: Arc<dyn CredentialStore> = Arc::new(KeyringStore::new(&config.keyring_service));
    let dispatcher = Dispatcher::new(&config, store).context("Failed to create HTTP client")?;
    watch_session(dispatcher.subscribe());

    info!(command = %command, base_url = %config.base_url, "authrelay starting");

    let result = match command.as_str() {
        "login" => login(&dispatcher, args.get(1).cloned()).await,
        "logout" => {
            dispatcher.logout();
            println!("Logged out.");
            Ok(())
        }
        "whoami" => whoami(&dispatcher),
        "get" => {
            let path = required(&args, 1, "path")?;
            print_response(dispatcher.send(ApiRequest::get(path)).await)
        }
        "post" => {
            let path = required(&args, 1, "path")?;
            let body: Value = serde_json::from_str(required(&args, 2, "json")?)
                .context("Body must be valid JSON")?;
            print_response(dispatcher.send(ApiRequest::post(path).json(&body)?).await)
        }
        "delete" => {
            let path = required(&args, 1, "path")?;
            print_response(dispatcher.delete(path).await)
        }
        "burst" => {
            let path = required(&args, 1, "path")?;
            let count: usize = required(&args, 2, "count")?
                .parse()
                .context("Count must be a number")?;
            burst(&dispatcher, path, count).await
        }
        other => {
            eprintln!("{}", USAGE);
            bail!("Unknown command: {}", other)
        }
    };

    // Let the session watcher print any termination notice
    tokio::task::yield_now().await;
    result
}

fn required<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .with_context(|| format!("Missing <{}> argument\n\n{}", name, USAGE))
}

async fn login(dispatcher: &Dispatcher, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;

    match dispatcher.login(&email, &password).await {
        Ok(_) => {
            println!("Logged in as {}.", email);
            Ok(())
        }
        Err(ApiError::InvalidCredentials) => bail!("Invalid email or password"),
        Err(e) => Err(e).context("Login failed"),
    }
}

fn whoami(dispatcher: &Dispatcher) -> Result<()> {
    match dispatcher.store().user() {
        Some(user) => println!("{}", serde_json::to_string_pretty(&user)?),
        None if dispatcher.is_authenticated() => println!("Logged in (no cached profile)."),
        None => println!("Not logged in."),
    }
    Ok(())
}

async fn burst(dispatcher: &Dispatcher, path: &str, count: usize) -> Result<()> {
    let requests = (0..count).map(|i| {
        let dispatcher = dispatcher.clone();
        let path = path.to_string();
        async move { (i, dispatcher.send(ApiRequest::get(path)).await) }
    });

    let mut failures = 0;
    for (i, outcome) in join_all(requests).await {
        match outcome {
            Ok(response) => println!("#{} -> {}", i, response.status()),
            Err(e) => {
                failures += 1;
                println!("#{} -> error: {}", i, e);
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} requests failed", failures, count);
    }
    Ok(())
}

fn print_response(outcome: Result<authrelay_core::ApiResponse, ApiError>) -> Result<()> {
    let response = match outcome {
        Ok(response) => response,
        Err(e) if e.is_session_terminated() => bail!("{}", e),
        Err(e) => return Err(e).context("Request failed"),
    };

    match response.json::<Value>() {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.text()),
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("{} cannot be empty", label.trim_end_matches(": "));
    }
    Ok(value)
}
