use thiserror::Error;

pub type OrderResult<T> = Result<T, OrderError>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum OrderError {
    #[error("id is required")]
    IdRequired,

    #[error("price must be greater than zero")]
    PriceMustBePositive,

    #[error("tax must be greater than or equal to zero")]
    TaxMustBeNonNegative,

    #[error("invalid state transition: {event} is not valid from {from}")]
    InvalidStateTransition { from: String, event: String },

    #[error("unknown order status: {0}")]
    UnknownState(String),
}
