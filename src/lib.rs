pub mod bencode;
pub mod contact;
pub mod engine;
pub mod error;
pub mod node;
pub mod protocol;
pub mod routing;

pub use contact::{Contact, Endpoint};
pub use engine::{CancelHandle, DiscoveryEvent, DiscoveryTag, Engine, EngineConfig, ProgressStats};
pub use error::{BencodeError, DhtError, ProtocolError, Result};
pub use node::NodeId;
