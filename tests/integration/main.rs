// Integration tests run against the in-process broker unless marked #[ignore].

mod common;

mod channel_test;
mod connection_test;
mod rpc_test;
