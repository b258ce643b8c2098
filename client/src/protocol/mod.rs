//! Wire vocabulary of the attendance socket channel.
//!
//! Every socket message is a JSON text [`Frame`] naming an event and carrying
//! its payload. Inbound frames decode into [`ServerEvent`]s, outbound intents
//! encode from [`ClientCommand`]s.

pub mod commands;
pub mod events;
pub mod frame;

pub use commands::{ClientCommand, MarkEntry};
pub use events::ServerEvent;
pub use frame::Frame;
