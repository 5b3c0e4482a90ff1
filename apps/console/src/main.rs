use anyhow::Result;
use clap::Parser;
use client_core::{ClientConfig, ClientEvent, InboxState, RealtimeClient, RealtimeHandle};
use shared::domain::RoomId;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

const DEDUP_CAPACITY: usize = 500;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    /// Discussion to open in the detail view.
    #[arg(long)]
    room: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let client = RealtimeClient::new(ClientConfig::new(&args.server_url));
    run(&client, &args).await?;
    client.disconnect().await;
    Ok(())
}

async fn run(client: &dyn RealtimeHandle, args: &Args) -> Result<()> {
    let token = client.login(&args.username, &args.password).await?;
    client.connect(&token).await?;

    let mut inbox = InboxState::new(DEDUP_CAPACITY);
    inbox.load_rooms(client.fetch_rooms().await?);

    if let Some(room) = args.room {
        let room = RoomId(room);
        client.join_room(room).await?;
        inbox.open_conversation(room);
        inbox.load_history(client.fetch_messages(room, 50).await?);
    }
    render(&inbox);

    let mut events = client.subscribe_events();
    let mut status = client.subscribe_status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("connection: {:?}", *status.borrow());
            }
            event = events.recv() => match event {
                Ok(ClientEvent::Server(event)) => {
                    inbox.apply(&event);
                    render(&inbox);
                }
                Ok(ClientEvent::Error(err)) => warn!(error = %err, "client error"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged; previews may be stale");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Some(room) = args.room {
        client.leave_room(RoomId(room)).await?;
    }
    Ok(())
}

fn render(inbox: &InboxState) {
    println!("--- conversations ---");
    for room in inbox.rooms() {
        let preview = room.last_message.as_deref().unwrap_or("(no messages)");
        println!("#{} {:<24} {}", room.room_id.0, room.topic, preview);
    }
    if let Some(open) = inbox.open_room() {
        println!("--- open room #{} ---", open.0);
        for message in inbox.open_messages() {
            let sender = message
                .sender
                .as_ref()
                .map(|s| s.display_name.as_str())
                .unwrap_or("unknown");
            println!("[{}] {}: {}", message.created_at, sender, message.content);
        }
    }
}
