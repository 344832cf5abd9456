//! Concrete collaborators handed to the engine.

pub mod local_blob;
pub mod qdrant;
pub mod secrets;

pub use local_blob::LocalBlobStore;
pub use qdrant::QdrantClient;
pub use secrets::SecretFileResolver;
