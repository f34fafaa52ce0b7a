mod dispatcher;
mod formatter;

pub use self::dispatcher::{
    channels_from_config, classify_response, AlertDispatcher, ChannelKind, SendDecision,
    TokenBucket,
};
pub use self::formatter::{discord_payload, sink_payload, telegram_payload};
