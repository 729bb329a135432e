//! modlink Runner - Stand-in host for the client library
//!
//! This crate is the *composition root*: it loads configuration, opens the configured
//! endpoints on a registry and plays the host by draining the dispatch queue on a fixed
//! tick until interrupted.

mod config;
mod run;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run::run().await
}
