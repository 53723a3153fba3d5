//! Test fixtures

mod two_node;

pub use two_node::{ALICE, BOB, BusPresence, PresenceBus, TwoNodeFixture, wait_until, within};
