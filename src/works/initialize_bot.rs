use crate::execution::Execution;
use crate::services::{OutgoingMessage, Services};
use crate::work::Work;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{debug, info};
use uuid::Uuid;

const GREETING: &str = "Hi";

/// Adds a bot as a friend and greets it.
///
/// Not persisted: losing it on restart only skips the greeting.
#[derive(Debug, Clone)]
pub struct InitializeBotWork {
    bot_user_id: String,
}

impl InitializeBotWork {
    /// Id shared by every bot initialization.
    pub const ID: &'static str = "initialize-bot";

    /// A work initializing the bot `bot_user_id`.
    pub fn new(bot_user_id: impl Into<String>) -> Self {
        Self {
            bot_user_id: bot_user_id.into(),
        }
    }
}

impl Work for InitializeBotWork {
    type Env = Services;

    fn id(&self) -> &str {
        Self::ID
    }

    fn name(&self) -> &'static str {
        "initialize_bot"
    }

    fn run<'a>(&'a self, env: Services, _execution: &'a Execution) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            if Uuid::parse_str(&self.bot_user_id).is_err() {
                debug!(bot.id = %self.bot_user_id, "Not a valid bot id, skipping");
                return Ok(());
            }

            let bot = env.user_api.add_friend(&self.bot_user_id).await?;
            let Some(bot) = env.users.save_user(bot) else {
                debug!(bot.id = %self.bot_user_id, "Bot was not saved, skipping greeting");
                return Ok(());
            };

            let conversation_id = env
                .conversations
                .make_conversation_id(&env.my_user_id, &self.bot_user_id);
            let message = OutgoingMessage::plain_text(conversation_id, &env.my_user_id, GREETING);
            env.message_sender.send_message(message, &bot, false);

            info!(bot.id = %self.bot_user_id, "Bot initialized");
            Ok(())
        }
        .boxed()
    }
}
