use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use commlink_client::{init_tracing, spawn_session, ClientConfig, ClientEvent, Command};
use commlink_media::WebRtcRuntime;
use commlink_net::{ApiClient, ServiceApi};
use commlink_shared::constants::APP_NAME;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ClientConfig::from_env();
    info!(api = %config.api_url, ws = %config.ws_url, "Starting {APP_NAME} terminal client");

    let mut args = std::env::args().skip(1);
    let username = args
        .next()
        .or_else(|| std::env::var("COMMLINK_USERNAME").ok())
        .context("usage: commlink <username> <password> (or COMMLINK_USERNAME/COMMLINK_PASSWORD)")?;
    let password = args
        .next()
        .or_else(|| std::env::var("COMMLINK_PASSWORD").ok())
        .context("missing password")?;

    let mut client = ApiClient::new(&config.api_url)?;
    match client.health().await {
        Ok(health) if health.is_healthy() => {}
        Ok(health) => warn!(status = %health.status, "Server reports degraded health"),
        Err(e) => warn!(error = %e, "Health check failed"),
    }

    let credential = client.login(&username, &password).await?;
    client.set_credential(credential.clone());
    let user = client.current_user().await?;
    info!(user = %user.id, username = %user.username, "Logged in");

    match client.conversations().await {
        Ok(conversations) => {
            for c in conversations {
                println!(
                    "[{}] {} unread, last: {}",
                    c.user_id, c.unread_count, c.last_message
                );
            }
        }
        Err(e) => warn!(error = %e, "Could not list conversations"),
    }

    let client = Arc::new(client);
    let api: Arc<dyn ServiceApi> = client.clone();
    let media = Arc::new(WebRtcRuntime::new(config.ice_servers.clone()));
    let mut session = spawn_session(config, user, credential, api, media);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let line = match line? {
                    Some(line) => line,
                    None => {
                        stdin_open = false;
                        let _ = session.commands.send(Command::Logout);
                        continue;
                    }
                };
                match Command::parse(&line) {
                    Ok(Some(cmd)) => {
                        if let Command::OpenConversation(peer) = cmd {
                            let client = client.clone();
                            tokio::spawn(async move {
                                if let Err(e) = client.mark_read(peer).await {
                                    warn!(peer = %peer, error = %e, "Mark read failed");
                                }
                            });
                        }
                        if session.commands.send(cmd).is_err() {
                            bail!("session ended unexpectedly");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => eprintln!("{e}"),
                }
            }
            event = session.events.recv() => match event {
                Some(ClientEvent::LoggedOut) | None => break,
                Some(event) => println!("{}", serde_json::to_string(&event)?),
            },
        }
    }

    session.task.await?;
    Ok(())
}
