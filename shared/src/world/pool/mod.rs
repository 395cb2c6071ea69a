mod object_info;
mod object_pool;
mod weak_pool;

pub use object_info::ObjectInfo;
pub use object_pool::ObjectPool;
pub use weak_pool::{FreedObject, WeakObjectPool};
