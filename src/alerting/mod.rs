//! Emergency alert dispatch.

pub mod dispatcher;
pub mod message;

pub use dispatcher::{AlertDispatcher, AlertOutcome, DeliveryMethod};
