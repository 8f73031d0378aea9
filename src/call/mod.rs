//! The four caller call primitives (spec §4.3 "Caller") and the prologue
//! they share.

mod common;

pub mod bidi;
pub mod client_stream;
pub mod server_stream;
pub mod unary;
