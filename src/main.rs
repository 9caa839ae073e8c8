mod ai;
mod bot;
mod config;
mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::ChatKind;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use ai::CompletionClient;
use bot::{Engine, InboundMessage, TelegramClient};
use config::Config;
use store::UserStore;

struct AppState {
    engine: Engine,
    telegram: TelegramClient,
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("charla.log"))
        .expect("Failed to open log file");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting charla...");
    info!("Admin IDs: {:?}", config.admin_ids);

    let store = match UserStore::open(config.data_dir.join("users.json")) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open user store: {e}");
            std::process::exit(1);
        }
    };

    let ai = if !config.ai.enabled {
        info!("AI features disabled by configuration");
        None
    } else if config.ai.api_key.is_empty() {
        warn!("AI_API_KEY not set, AI features disabled");
        None
    } else {
        info!("AI enabled (model: {})", config.ai.model);
        Some(CompletionClient::new(config.ai.clone()))
    };

    let bot = Bot::new(&config.bot_token);

    spawn_reminder_task(store.clone(), TelegramClient::new(bot.clone()));
    spawn_digest_task(
        store.clone(),
        TelegramClient::new(bot.clone()),
        config.admin_ids.iter().copied().collect(),
    );

    let telegram = TelegramClient::new(bot.clone());
    let engine = Engine::new(config, store, ai);
    let state = Arc::new(AppState { engine, telegram });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let user = match msg.from {
        Some(ref u) => u,
        None => return Ok(()),
    };
    let text = match msg.text() {
        Some(t) => t,
        None => return Ok(()),
    };

    // In groups only commands are for us; free text belongs to the group.
    if matches!(msg.chat.kind, ChatKind::Public(_)) && !text.trim_start().starts_with('/') {
        return Ok(());
    }

    let display_name = match &user.last_name {
        Some(last) => format!("{} {}", user.first_name, last),
        None => user.first_name.clone(),
    };

    let inbound = InboundMessage {
        user_id: user.id.0 as i64,
        chat_id: msg.chat.id.0,
        username: user.username.clone(),
        display_name,
        text: text.to_string(),
        timestamp: msg.date,
    };

    let reply = state.engine.dispatch(&inbound).await;

    // Send failures are logged inside the client and not retried.
    state
        .telegram
        .send_message(inbound.chat_id, &reply.text, Some(msg.id.0 as i64))
        .await
        .ok();
    if let Some(attachment) = reply.attachment {
        state
            .telegram
            .send_document(inbound.chat_id, &attachment.filename, attachment.bytes, None)
            .await
            .ok();
    }

    Ok(())
}

/// Deliver due reminders every 30 seconds.
fn spawn_reminder_task(store: Arc<UserStore>, telegram: TelegramClient) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            match store.pop_due_reminders(Utc::now()).await {
                Ok(due) => {
                    for (user_id, text) in due {
                        let notice = format!("🔔 Reminder: {text}");
                        if let Err(e) = telegram.send_message(user_id, &notice, None).await {
                            warn!("Failed to deliver reminder to {user_id}: {e}");
                        }
                    }
                }
                Err(e) => warn!("Reminder sweep failed: {e}"),
            }
        }
    });
}

/// Send yesterday's activity summary to every admin once the date flips.
fn spawn_digest_task(store: Arc<UserStore>, telegram: TelegramClient, admin_ids: Vec<i64>) {
    if admin_ids.is_empty() {
        return;
    }
    tokio::spawn(async move {
        let mut last_sent = Utc::now().date_naive();
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            let now = Utc::now();
            if now.date_naive() == last_sent {
                continue;
            }
            last_sent = now.date_naive();

            let summary = store.activity_summary(now - chrono::Duration::days(1));
            let text = format!(
                "📊 Daily digest\n\n\
                 • Total users: {}\n\
                 • New yesterday: {}\n\
                 • Active yesterday: {}\n\
                 • Messages total: {}",
                summary.total_users,
                summary.new_today,
                summary.active_today,
                summary.messages_total,
            );
            for admin_id in &admin_ids {
                if let Err(e) = telegram.send_message(*admin_id, &text, None).await {
                    warn!("Failed to send digest to admin {admin_id}: {e}");
                }
            }
        }
    });
}
