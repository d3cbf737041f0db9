mod format;
mod reader;
mod record;
mod replay;
mod sync;
mod writer;

pub use format::*;
pub use reader::LogReader;
pub use record::{FieldSink, FieldSource, LogRecord, RecordKind};
pub use replay::*;
pub use sync::*;
pub use writer::LogWriter;
