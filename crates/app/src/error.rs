use adhikari_backend::StorageError;
use snafu::Snafu;

use crate::config::ConfigError;
use crate::planner::PlannerError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("invalid configuration: {source}"))]
    Config { source: ConfigError },
    #[snafu(display("failed to open the chat store on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to set up the outfit planner: {source}"))]
    Planner { source: PlannerError },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("chat sync stopped unexpectedly on `{stage}`"))]
    SendCommand { stage: &'static str },
}

pub type AppResult<T> = Result<T, AppError>;
