//! Sagas: event-driven processes coordinating several aggregates.
//!
//! A saga approximates a multi-aggregate transaction with the
//! reserve-then-act-release-on-failure compensation pattern. Each saga is
//! itself a small aggregate persisting only a `completed` flag, so crash
//! recovery is a replay from the last processed sequence number.

pub mod member_request;

pub use member_request::{saga_stream_id, MemberRequestSaga, MemberRequestSagaRepository};
