// 数据库模块
// 包含配额档案实体定义和存储库实现

pub mod models; // 数据库实体定义
pub mod repositories; // 存储库实现

// 重新导出常用类型，方便其他模块使用
pub use models::profile::ProfileEntity;
pub use repositories::profile::{MemoryProfileRepository, PgProfileRepository, ProfileStore};
