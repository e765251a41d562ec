pub mod db;
pub mod entities;
pub mod records;
pub mod seaorm;
pub mod storage;

pub use records::{
    CredentialRecord, NewRequestLog, NewTask, StatsRecord, TaskRecord, TaskStatus,
};
pub use seaorm::SeaOrmStorage;
pub use storage::{Storage, StorageError, StorageResult};
