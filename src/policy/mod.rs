pub mod model;
pub mod net;
pub mod process;
pub mod selector;

// Re-export main types for convenience
pub use model::{API_VERSION, POLICY_KIND, Policy, PolicySpec};
pub use net::{Direction, NetworkPolicy, NetworkRule, PeerSelector, PortProto, Protocol};
pub use process::ProcessNode;
pub use selector::{ContainerSelector, LabelSelector, MatchExpression, Operator};
