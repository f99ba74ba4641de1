/*
Async client for the TCL Home cloud.

Authenticates an account against the vendor's identity service, walks the
dependent federation steps to temporary AWS credentials, discovers the
account's registered devices and publishes SigV4-signed desired-state
commands to the per-device IoT shadow endpoint.

The session lives in memory for the lifetime of a [`Client`] and is
refreshed proactively in the background; see the `auth` module for the
credential machinery and the `command` module for signing and dispatch.
*/

pub mod auth;
pub mod client;
pub mod command;
pub mod config;
pub mod directory;
mod util;

pub use auth::{AuthError, Credentials, Session, SessionState, Token, TokenKind};
pub use client::Client;
pub use command::{
    CommandError, CommandErrorKind, CommandResult, Control, DesiredState, FanSpeed,
};
pub use config::Config;
pub use directory::{Capabilities, Device, DirectoryError};
pub use util::http::NetworkError;
pub use util::retry::RetryPolicy;
