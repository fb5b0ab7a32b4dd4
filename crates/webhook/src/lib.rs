//! Webhook outbox delivery: durable at-least-once notification pipeline,
//! decoupled from the request path.

pub mod delivery;
pub mod signer;

pub use delivery::{DeliveryConfig, DeliveryPool};
pub use signer::sign_payload;
