//! Socket-level tests for the UDP and TCP transports
