use alpaca_base::{PromptTemplate, StopReason, Trigger, WorkerError, WorkerHandle};
use color_eyre::eyre::{self, WrapErr};
use serenity::{
    async_trait,
    model::{channel::Message, gateway::Ready},
    prelude::{Context, EventHandler, GatewayIntents},
    Client,
};

use crate::reply;

pub struct Handler {
    trigger: Trigger,
    template: PromptTemplate,
    worker: WorkerHandle,
}
impl Handler {
    pub fn new(trigger: Trigger, template: PromptTemplate, worker: WorkerHandle) -> Self {
        Self {
            trigger,
            template,
            worker,
        }
    }
}

/// The instruction in `content`, or `None` if the message is not for the bot.
fn extract_instruction<'a>(
    trigger: &Trigger,
    author_is_bot: bool,
    content: &'a str,
) -> Option<&'a str> {
    if author_is_bot {
        return None;
    }
    trigger.extract(content)
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        let Some(instruction) =
            extract_instruction(&self.trigger, msg.author.bot, &msg.content)
        else {
            return;
        };

        log::info!(
            "Request from {} in channel {} ({} queued)",
            msg.author.name,
            msg.channel_id,
            self.worker.queued()
        );
        let prompt = self.template.render(instruction);

        let typing = msg.channel_id.start_typing(&ctx.http);
        let outcome = match self.worker.submit(prompt) {
            Ok(pending) => pending.wait().await,
            Err(err) => Err(err),
        };
        typing.stop();

        match &outcome {
            Ok(completion) => {
                let stats = &completion.stats;
                log::info!(
                    "Answered with {} tokens in {}ms ({:.2} tokens/s, {} prompt tokens)",
                    stats.predict_tokens,
                    stats.predict_duration.as_millis(),
                    stats.tokens_per_second().unwrap_or_default(),
                    stats.prompt_tokens
                );
                if let StopReason::Interrupted(err) = &completion.stop_reason {
                    log::warn!("Generation was interrupted: {err}");
                }
            }
            Err(WorkerError::Busy) => log::warn!("Queue is full, turning the request away"),
            Err(err) => log::error!("Could not answer the request: {err}"),
        }

        let text = reply::format_outcome(&outcome);
        for (i, chunk) in reply::split_message(&text, reply::MESSAGE_LIMIT)
            .into_iter()
            .enumerate()
        {
            let sent = if i == 0 {
                msg.reply(&ctx, chunk).await
            } else {
                msg.channel_id.say(&ctx.http, chunk).await
            };
            if let Err(err) = sent {
                log::error!("Could not send part {} of the reply: {err}", i + 1);
            }
        }
    }

    async fn ready(&self, _: Context, ready: Ready) {
        log::info!(
            "Connected as {}, answering messages starting with {:?}",
            ready.user.name,
            self.trigger.prefix()
        );
    }
}

/// Connects to Discord and runs until the connection fails or Ctrl-C is pressed.
pub async fn run(token: &str, handler: Handler) -> eyre::Result<()> {
    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(token, intents)
        .event_handler(handler)
        .await
        .wrap_err("Could not create the Discord client")?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Shutting down");
                shard_manager.shutdown_all().await;
            }
            Err(err) => log::error!("Could not listen for Ctrl-C: {err}"),
        }
    });

    client
        .start()
        .await
        .wrap_err("The Discord client stopped with an error")
}
