//! Per-protocol HTTP client with write instrumentation.

pub use self::{
    body::{BodyReader, BodySender, BoxBody},
    client::{used_tls, Client, Error, SendOptions, Tls},
};

pub mod body;
mod client;
mod h3;
mod io;
mod raw;
mod tls;
