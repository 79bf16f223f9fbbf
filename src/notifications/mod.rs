pub mod fanout;
pub mod publisher;
pub mod senders;
pub mod service;
