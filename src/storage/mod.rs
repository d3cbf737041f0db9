mod backup;
mod data_file;
mod files;
mod free_space;
mod properties;

pub use backup::*;
pub use data_file::*;
pub use files::*;
pub use free_space::*;
pub use properties::*;
