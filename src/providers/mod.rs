pub mod backend;
pub mod models;
pub mod stream;
pub mod traits;
pub mod types;

pub use backend::Backend;
pub use traits::{ChatTransport, ChunkStream};
pub use types::{ChatError, ChatRequest, StreamEvent};
