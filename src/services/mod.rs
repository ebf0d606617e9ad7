/// Contest REST API abstraction and its HTTP client.
pub mod contest_api;
/// Per-contest event loop and its public handle.
pub mod contest_sync;
/// Live channel connection, resync and reconnection.
pub mod push_channel;
/// Log-friendly rendering of session events.
pub mod sync_events;

#[cfg(test)]
pub(crate) mod testing;
