//! Process wiring for a standalone pg-pubsub daemon: shared state and the
//! thin admin HTTP surface (§4.5, §6.3). Business logic lives entirely in
//! the `pubsub-*` library crates; this crate only boots them and exposes
//! `/healthz`, `/status`, `/pause`, `/resume` for operators.

pub mod routes;
pub mod state;
