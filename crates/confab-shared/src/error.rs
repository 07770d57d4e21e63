use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Malformed room id: {0:?}")]
    MalformedRoomId(String),
}
