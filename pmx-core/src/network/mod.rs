//! Pipe transport: naming and discovery, platform streams, framed halves.

pub mod connection;
pub mod endpoint;
pub mod pipe;

pub use connection::{PipeReader, PipeWriter, split_pipe};
pub use endpoint::{Endpoint, default_pipe_dir, discover, local_host_name, select};
pub use pipe::{BoxedPipe, PipeListener, PipeStream, open};
