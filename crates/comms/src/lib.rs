//! Transport clients and the container that polls and feeds them.

pub mod algorithm;
pub mod client;
pub mod collection;
pub mod container;
pub mod error;
pub mod holder;
pub mod memory;
pub mod policy;

pub use algorithm::{DefaultPriorityAlgorithm, ListenerPriorityAlgorithm};
pub use client::{ListenerClient, PayloadProcessor, SenderClient};
pub use collection::{ClientPriorityCollection, CollectionStatistics, LevelSummary, WeightedClient};
pub use container::{CommunicationContainer, CommunicationStatistics, SenderHolder, SenderStatistics};
pub use error::CommsError;
pub use holder::{ClientHolder, ListenerStatistics};
pub use memory::{ChannelMode, MemoryFabric, MemoryListener, MemorySender};
pub use policy::CommunicationPolicy;
