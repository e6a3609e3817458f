pub mod network;
pub mod policy;
pub mod selector;
pub mod tree;

// Re-export the engine entry points
pub use network::merge_network;
pub use policy::merge_policies;
pub use tree::{IdMap, merge_trees};
