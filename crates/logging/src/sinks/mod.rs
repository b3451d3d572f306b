pub mod callback;
pub mod file;
pub mod std_stream;

pub use callback::CallbackSink;
pub use file::FileSink;
pub use std_stream::StdStreamSink;
