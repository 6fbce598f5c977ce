//! Error types for broker topology declaration and connection pooling.

use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_lapin::PoolError),

    #[error("pool configuration error: {0}")]
    PoolConfig(#[from] deadpool_lapin::CreatePoolError),
}
