pub mod batch;
pub mod message;
pub mod sink;

pub use batch::BatchPublisher;
pub use sink::{LogSink, RecordSink, RestProxySink};
