//! Default chat transport: a minimal Telegram Bot API client and the
//! long-polling loop feeding the dispatcher. The session layer never sees
//! this module — it only talks to the `ChatTransport` / `TransportProbe`
//! traits.

pub mod api;
pub mod bot;

pub use api::TelegramApi;
pub use bot::{PollProbe, TelegramBot, TelegramTransport};
