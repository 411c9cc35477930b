#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

mod client;
pub mod connection;
pub mod flags;
mod flow;
pub mod frame;
pub mod hpack;
mod queue;
mod request;
mod response;
pub mod settings;
mod socket;
mod stream;
pub mod types;

pub use bytes::Bytes;
pub use client::Client;
pub use connection::{Connection, ConnectionEvent, Handle};
pub use request::{Method, Request};
pub use response::Response;
pub use settings::Settings;
pub use types::{Error, ErrorCode};
pub use url::Url;
