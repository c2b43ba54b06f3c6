use thiserror::Error;

use cloudproxy_provider::ProviderError;
use cloudproxy_state::StateError;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("provisioning failure: {0}")]
    Provider(#[from] ProviderError),
}
