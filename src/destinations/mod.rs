//! Downstream writers.
//!
//! Exactly one writer consumes the outbound queue of formatted flush
//! buffers: the Graphite TCP writer or the HTTP metrics-gateway writer.
//! Both deliver at-least-once and never drop a buffer; a struggling
//! downstream backs pressure up the bounded queue instead.

mod backoff;
pub use self::backoff::ExponentialBackoff;

mod graphite;
pub use self::graphite::GraphiteWriter;

mod gateway;
pub use self::gateway::GatewayWriter;
