use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner already started")]
    AlreadyStarted,

    #[error("runner is not running")]
    NotRunning,
}
