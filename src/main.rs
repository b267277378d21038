//! Entry point: load config, wire the API client and connection
//! manager, and run an interactive ticket chat in the terminal.

use std::sync::Arc;

use ticketchat::models::frame::{EventKind, ServerFrame};
use ticketchat::{ApiClient, ChatController, Config, ConnectionManager, SendPath};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let ticket_id = config
        .ticket_id
        .ok_or_else(|| anyhow::anyhow!("CTF_TICKET_ID must be set"))?;

    let api = ApiClient::new(&config.base_url, &config.token);
    let conn = Arc::new(ConnectionManager::new(config.base_url.clone()));
    let controller = ChatController::new(api, Arc::clone(&conn), ticket_id);

    let ticket = controller.load().await?;
    println!(
        "{} / {} [{:?}]",
        ticket.display_id(),
        ticket.challenge_name.as_deref().unwrap_or("unknown challenge"),
        ticket.status
    );
    for message in controller.messages().iter().rev() {
        print_message(&message.author_username, message.sent_time, &message.content);
    }

    // Live rendering straight off the wire; the controller keeps the
    // canonical de-duplicated feed behind it.
    conn.on(EventKind::Message, |frame| {
        if let ServerFrame::Message { message } = frame {
            print_message(&message.author_username, message.sent_time, &message.content);
        }
    });
    conn.on(EventKind::Typing, |frame| {
        if let ServerFrame::Typing { username } = frame {
            println!("* {} is typing...", username);
        }
    });

    if let Err(e) = controller.connect_realtime(&config.token).await {
        tracing::warn!(error = %e, "realtime connection unavailable, sends will use REST");
    }

    println!("type a message and press enter (/close closes the ticket, /quit exits)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/close" => {
                controller.close_ticket().await?;
                println!("ticket closed");
                break;
            }
            text => match controller.send(text).await {
                Ok(SendPath::Realtime) => {}
                Ok(SendPath::Rest) => println!("(sent via fallback)"),
                Err(e) => eprintln!("send failed: {}", e),
            },
        }
    }

    controller.shutdown();
    Ok(())
}

fn print_message(author: &str, sent_time: chrono::DateTime<chrono::Utc>, content: &str) {
    println!("[{}] {}: {}", sent_time.format("%H:%M"), author, content);
}
