//! Rollcall: client-side synchronization for live attendance sessions.
//!
//! A [`client::SessionClient`] joins or creates a shared marking session over
//! a [`transport::Transport`], applies server events to a
//! [`session::SessionStore`] and sends commands through a
//! [`session::CommandDispatcher`].

pub mod client;
pub mod config;
pub mod model;
pub mod notify;
pub mod permissions;
pub mod protocol;
pub mod session;
pub mod shell;
pub mod transport;
