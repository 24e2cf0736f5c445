//! Capabilities the memory core consumes
//!
//! Everything the core needs from the outside world sits behind one of these
//! traits: text embedding, text generation, key/value persistence and a clock.
//! Production adapters live next to each trait; deterministic doubles live in
//! [`crate::testing`].

pub mod clock;
pub mod embedding;
pub mod generation;
pub mod persistence;

pub use clock::{Clock, SystemClock};
pub use embedding::{EmbeddingPort, FastEmbedder, cosine_similarity};
pub use generation::{GenerationOptions, GenerationPort, RemoteGenerator};
pub use persistence::{FilePersistence, InMemoryPersistence, StatePersistencePort};
