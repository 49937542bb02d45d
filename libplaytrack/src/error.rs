//! Why a submission did not produce a tracked job.

use thiserror::Error;

use crate::hooks::HookError;
use crate::ipc::ApiError;

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("no hosts selected")]
    NoHosts,
    #[error("playbook `{0}` is not known to the runner")]
    PlaybookNotFound(String),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Api(#[from] ApiError),
}
