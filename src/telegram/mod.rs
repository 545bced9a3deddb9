use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use teloxide::{
    payloads::SendDocumentSetters,
    prelude::*,
    types::{BotCommand, ChatId, InputFile},
    utils::command::BotCommands,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{InboundMessage, MessageBus, OutboundMessage, OutboundSink};
use crate::config::TelegramConfig;

pub const CHANNEL: &str = "telegram";
const MAX_MESSAGE_CHARS: usize = 4000;
const MAX_CAPTION_CHARS: usize = 1024;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    #[command(description = "Welcome message")]
    Start,
    #[command(description = "Show commands")]
    Help,
}

/// Telegram user ids allowed to talk to the agent. Empty means nobody.
#[derive(Debug, Clone)]
pub struct AllowList(Vec<i64>);

impl AllowList {
    pub fn new(ids: Vec<i64>) -> Self {
        Self(ids)
    }

    pub fn permits(&self, id: i64) -> bool {
        self.0.contains(&id)
    }
}

pub struct TelegramChannel {
    bot: Bot,
    allowed: Arc<AllowList>,
    bus: MessageBus,
}

impl TelegramChannel {
    pub fn new(config: &TelegramConfig, bus: MessageBus) -> Self {
        if config.allowed_users.is_empty() {
            warn!("telegram.allowed_users is empty; every message will be ignored");
        }
        Self {
            bot: Bot::new(config.token.clone()),
            allowed: Arc::new(AllowList::new(config.allowed_users.clone())),
            bus,
        }
    }

    pub fn sink(&self) -> Arc<TelegramSink> {
        Arc::new(TelegramSink {
            bot: self.bot.clone(),
        })
    }

    /// Long-polls until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.bot
            .set_my_commands(vec![
                BotCommand::new("start", "Welcome message"),
                BotCommand::new("help", "Show commands"),
            ])
            .await
            .context("Failed to register bot commands")?;

        let handler = Update::filter_message()
            .branch(
                dptree::entry()
                    .filter_command::<Command>()
                    .endpoint(handle_command),
            )
            .branch(dptree::endpoint(handle_message));

        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![self.bus.clone(), self.allowed.clone()])
            .build();

        let shutdown = dispatcher.shutdown_token();
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Ok(done) = shutdown.shutdown() {
                done.await;
            }
        });

        info!("🦀 Telegram bot is ready! Waiting for messages...");
        dispatcher.dispatch().await;
        info!("Telegram bot stopped");
        Ok(())
    }
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    allowed: Arc<AllowList>,
) -> ResponseResult<()> {
    if !sender_id(&msg).is_some_and(|id| allowed.permits(id)) {
        return Ok(());
    }

    let text = match cmd {
        Command::Start => "🦀 Littleclaw is online!\n\n\
            Just send me a message. I can read and write files in my workspace, run commands, \
            remember things about you and schedule recurring jobs."
            .to_string(),
        Command::Help => Command::descriptions().to_string(),
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

async fn handle_message(
    msg: Message,
    bus: MessageBus,
    allowed: Arc<AllowList>,
) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    let Some(user_id) = sender_id(&msg).filter(|id| allowed.permits(*id)) else {
        warn!(
            "Ignoring message from unauthorized sender {:?} in chat {}",
            sender_id(&msg),
            chat_id
        );
        return Ok(());
    };

    let Some(text) = msg.text() else {
        return Ok(());
    };

    let inbound = InboundMessage {
        channel: CHANNEL.to_string(),
        sender_id: user_id.to_string(),
        chat_id: chat_id.to_string(),
        message_id: Some(i64::from(msg.id.0)),
        content: text.to_string(),
        reply_to: msg
            .reply_to_message()
            .and_then(|quoted| quoted.text())
            .map(str::to_string),
        media: Vec::new(),
    };
    bus.send_inbound(inbound).await;
    Ok(())
}

/// The Telegram user who wrote the message. Channel posts have none.
fn sender_id(msg: &Message) -> Option<i64> {
    msg.from.as_ref().map(|user| user.id.0 as i64)
}

pub struct TelegramSink {
    bot: Bot,
}

#[async_trait]
impl OutboundSink for TelegramSink {
    fn channel(&self) -> &str {
        CHANNEL
    }

    async fn deliver(&self, msg: OutboundMessage) -> Result<()> {
        let chat = ChatId(
            msg.chat_id
                .parse::<i64>()
                .with_context(|| format!("Invalid Telegram chat id '{}'", msg.chat_id))?,
        );

        let caption_fits = msg.content.chars().count() <= MAX_CAPTION_CHARS;
        let text_as_caption = !msg.files.is_empty() && caption_fits;

        if !text_as_caption {
            for chunk in split_message(&msg.content, MAX_MESSAGE_CHARS) {
                self.bot.send_message(chat, chunk).await?;
            }
        }

        for (i, file) in msg.files.iter().enumerate() {
            let mut request = self.bot.send_document(chat, InputFile::file(file.clone()));
            if i == 0 && text_as_caption && !msg.content.is_empty() {
                request = request.caption(msg.content.clone());
            }
            if let Err(e) = request.await {
                warn!("Failed to send {:?} to chat {}: {}", file, chat, e);
                self.bot
                    .send_message(chat, format!("❌ Could not send {}", file.display()))
                    .await?;
            }
        }
        Ok(())
    }
}

/// Splits on line boundaries where possible; never returns empty chunks.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > max_chars {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks.retain(|c| !c.trim().is_empty());
    chunks
}
