//! Runtime components around the broker session.

pub mod readiness;
pub mod reporter;
