pub mod event;
pub mod fanout;
pub mod feed_client;
pub mod normalizer;
pub mod wire;

// Re-export the canonical event for convenient access (e.g. `use crate::market_data::CanonicalEvent`).
pub use event::{CanonicalEvent, EventDetail};
pub use fanout::EventFanout;
pub use feed_client::FeedClient;
pub use normalizer::NormalizerPool;
