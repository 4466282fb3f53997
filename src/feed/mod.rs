//! Feed control protocol
//!
//! JSON messages the client sends to choose which instruments stream.

mod subscription;

pub use subscription::{SubscriptionAction, SubscriptionParams, SubscriptionRequest, TokenList};
