pub mod client;
pub mod dialer;
pub mod pipeline;
