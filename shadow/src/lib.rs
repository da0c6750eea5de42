pub mod agents;
pub mod arbiter;
pub mod attributes;
pub mod config;
pub mod coordinator;
pub mod event;
pub mod hooks;
pub mod matches;
pub mod peer;
pub mod reason;
pub mod reconnect;
pub mod sequencer;
pub mod store;
pub mod usage;
pub mod userlog;

#[cfg(test)]
mod coordinator_test;
#[cfg(test)]
mod store_test;
