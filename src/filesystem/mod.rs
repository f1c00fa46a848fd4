mod cache;
mod dispatcher;
mod error;
mod exec;
mod fuse;
mod handle;
mod index;
mod path;
mod reply;
mod view;

pub use cache::EntryCache;
pub use dispatcher::Dispatcher;
pub use error::OpError;
pub use exec::ExecCache;
pub use fuse::Filesystem;
pub use index::ArchiveIndex;
pub use view::NamespaceView;
