pub mod mongodb;
pub mod rabbit;
pub mod redis;
pub mod store;

pub use mongodb::MongoStageConfig;
pub use rabbit::RabbitStageConfig;
pub use redis::RedisStageConfig;
pub use store::TableStoreConfig;
