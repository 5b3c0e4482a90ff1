use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected to the realtime server")]
    NotConnected,
    #[error("not authenticated: fetch a token with login first")]
    NotAuthenticated,
    #[error("connection closed before the server acknowledged the request")]
    ConnectionClosed,
    #[error("timed out waiting for server acknowledgement")]
    AckTimeout,
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    #[error("token request failed: {0}")]
    TokenRequest(String),
    #[error("http request failed: {0}")]
    Http(String),
    #[error("invalid server url: {0}")]
    InvalidServerUrl(String),
    #[error("malformed payload: {0}")]
    Payload(String),
}
