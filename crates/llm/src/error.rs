use snafu::Snafu;

use super::events::StreamTarget;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("model name must not be empty"))]
    MissingModel { stage: &'static str },
    #[snafu(display("model '{model_id}' is not installed on the server"))]
    ModelNotFound {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("stream request for {target:?} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("failed to build request on `{stage}`: {message}"))]
    BuildRequest {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("server answered {status} on `{stage}`: {body}"))]
    ServerStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse server payload on `{stage}`: {source}"))]
    PayloadParse {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

impl ProviderError {
    /// Splits rig's non-success status errors out of transport failures so the
    /// caller can tell a refusing server from an unreachable one.
    pub(crate) fn from_http(stage: &'static str, source: rig::http_client::Error) -> Self {
        match source {
            rig::http_client::Error::InvalidStatusCodeWithMessage(status, body) => {
                Self::ServerStatus {
                    stage,
                    status: status.as_u16(),
                    body,
                }
            }
            rig::http_client::Error::InvalidStatusCode(status) => Self::ServerStatus {
                stage,
                status: status.as_u16(),
                body: String::new(),
            },
            source => Self::HttpClient { stage, source },
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ServerStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;
