/*
    A Practical Byzantine Fault Tolerant replica engine.

    n = 3f + 1 replicas agree on a totally ordered sequence of client
    operations while up to f of them behave arbitrarily. The primary of a
    view batches requests into pre-prepares; replicas exchange prepares and
    commits, execute in sequence order and reply. A view change replaces a
    primary that stops making progress.
*/

pub mod common;
pub mod config;
pub mod consensus;
pub mod error;
pub mod network;
