//! leadline: outbound message delivery engine.
//!
//! Sends generated replies to leads over a third-party messaging transport,
//! tracks asynchronous delivery confirmations, retries failed or unconfirmed
//! sends within bounded limits, honors opt-out requests, and exposes
//! delivery metrics. Text generation, HTTP routing, and the relational
//! schema live in the embedding application and reach this crate through
//! the ports in [`store`] and [`transport`].
//!
//! Wiring sketch:
//! construct a [`DeliveryOrchestrator`] over a store, a transport client,
//! and a metrics sink; feed it `ReplyReady` events and forward provider
//! webhooks / inbound messages to it; spawn
//! [`orchestrator::sweeper::run_sweeper`] alongside so retries survive
//! process restarts.

pub mod config;
pub mod format;
pub mod logging;
pub mod metrics;
pub mod optout;
pub mod orchestrator;
pub mod phone;
pub mod store;
pub mod timers;
pub mod transport;

pub use config::DeliveryConfig;
pub use orchestrator::{
    CallbackStatus, DeliveryCallback, DeliveryError, DeliveryOrchestrator, InboundMessage,
    ReplyReady,
};
pub use store::{DeliveryRecord, DeliveryStatus};
