#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("broker: {0}")]
    Broker(#[from] ferry_api::error::TransportError),

    #[error("{0}")]
    Relay(#[from] ferry_engine::RelayError),

    #[error("api: {0}")]
    Api(#[from] ferry_api_server::ApiServerError),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
