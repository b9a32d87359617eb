pub mod fake_broker;
pub mod store;

pub use fake_broker::FakeBroker;
pub use store::Store;
pub use taskmesh_common::clock::FakeClock;
