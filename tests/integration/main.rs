// Integration tests against a live broker.
// Every test is #[ignore]d; run with `cargo test --test integration -- --ignored`
// and point RABBITMQ_URI at a disposable vhost.

mod common;
mod connection_test;
mod rpc_test;
mod subscriber_test;
