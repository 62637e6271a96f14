pub mod registry;

pub use registry::{Effect, Peer, Role, SessionRegistry, SessionSnapshot};
