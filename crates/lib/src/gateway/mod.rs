//! Gateway: HTTP front for the send capability.
//!
//! `POST /send` goes through the dispatch facade to the live session; `GET /health` is a
//! liveness probe that answers regardless of session state.

mod server;

pub use server::{build_session, router, run_gateway, serve, GatewayState};
