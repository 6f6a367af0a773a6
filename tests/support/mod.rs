//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod range_server;
pub mod socket_guard;

/// Starts a mock server or returns early from the test when sockets are
/// unavailable.
macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = support::socket_guard::start_mock_server_or_skip().await else {
            return;
        };
        mock_server
    }};
}
