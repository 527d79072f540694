pub use client::{Client, ClientError, Method, Response, StatusCode};
pub use uri::{InvalidUriError, Uri};

mod uri {
    use std::fmt;
    use std::str::FromStr;

    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("invalid uri: {0}")]
    pub struct InvalidUriError(String);

    impl From<http::uri::InvalidUri> for InvalidUriError {
        fn from(value: http::uri::InvalidUri) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    impl From<http::uri::InvalidUriParts> for InvalidUriError {
        fn from(value: http::uri::InvalidUriParts) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    /// An absolute URI, serialized as a string
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Uri(http::Uri);

    impl Uri {
        pub fn from_static(src: &'static str) -> Self {
            Self(http::Uri::from_static(src))
        }

        pub fn host(&self) -> Option<&str> {
            self.0.host()
        }

        /// Point `base` at another path, keeping its scheme and authority
        pub fn from_parts(base: Uri, path: &str, query: Option<&str>) -> Result<Self, InvalidUriError> {
            let path_and_query = match query {
                Some(qs) => http::uri::PathAndQuery::from_maybe_shared(format!("{path}?{qs}"))?,
                None => http::uri::PathAndQuery::from_str(path)?,
            };
            let mut parts = base.0.into_parts();
            parts.path_and_query = Some(path_and_query);
            Ok(Self(http::Uri::from_parts(parts)?))
        }
    }

    impl fmt::Display for Uri {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    impl FromStr for Uri {
        type Err = InvalidUriError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let uri = http::Uri::from_str(s)?;
            if uri.scheme().is_none() || uri.host().is_none() {
                return Err(InvalidUriError(format!("'{s}' is not an absolute uri")));
            }
            Ok(Self(uri))
        }
    }

    impl Serialize for Uri {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(self)
        }
    }

    impl<'de> Deserialize<'de> for Uri {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        }
    }
}

mod client {
    use std::time::Duration;

    use reqwest::RequestBuilder;
    use serde::de::DeserializeOwned;
    use thiserror::Error;

    use super::uri::Uri;
    use crate::types::BearerToken;

    pub type Method = reqwest::Method;
    pub type StatusCode = reqwest::StatusCode;

    #[derive(Debug, Error)]
    pub enum ClientError {
        #[error("failed to build request: {0}")]
        Request(String),

        #[error("server replied with status: {0}")]
        Response(StatusCode),

        /// The request never got a reply (DNS, connect, timeout)
        #[error(transparent)]
        Client(reqwest::Error),

        /// The reply could not be read or decoded
        #[error(transparent)]
        Server(reqwest::Error),
    }

    #[derive(Debug)]
    pub struct Response(reqwest::Response);

    impl Response {
        pub fn status(&self) -> StatusCode {
            self.0.status()
        }

        pub async fn json<T: DeserializeOwned>(self) -> Result<T, ClientError> {
            self.0.json().await.map_err(ClientError::Server)
        }

        pub async fn text(self) -> Result<String, ClientError> {
            self.0.text().await.map_err(ClientError::Server)
        }
    }

    /// HTTP client with a per-request deadline and optional session token
    #[derive(Debug, Clone)]
    pub struct Client {
        inner: reqwest::Client,
        timeout: Option<Duration>,
        token: Option<BearerToken>,
    }

    impl Default for Client {
        /// Client with a 10 second deadline
        fn default() -> Self {
            Self::new(Some(Duration::from_secs(10)))
        }
    }

    impl Client {
        pub fn new(timeout: Option<Duration>) -> Self {
            Self {
                inner: reqwest::Client::new(),
                timeout,
                token: None,
            }
        }

        /// Send `token` as `X-Authorization: Bearer <token>` on every request.
        ///
        /// The management API reads the session from this header rather than
        /// `Authorization`, which proxies in front of it may own.
        pub fn authorized(self, token: &BearerToken) -> Self {
            Self {
                token: Some(token.clone()),
                ..self
            }
        }

        /// GET `uri` and decode a JSON reply, failing on any non-2xx status
        pub async fn get<T: DeserializeOwned>(&self, uri: &Uri) -> Result<T, ClientError> {
            let res = self.request(Method::GET, uri, Ok).await?;
            match res.status() {
                status if status.is_success() => res.json().await,
                status => Err(ClientError::Response(status)),
            }
        }

        /// Send a request, letting `decorator` add a query, body or headers.
        ///
        /// Any status is returned as is, it is up to the caller to tell
        /// success from failure.
        pub async fn request<D>(
            &self,
            method: Method,
            uri: &Uri,
            decorator: D,
        ) -> Result<Response, ClientError>
        where
            D: FnOnce(RequestBuilder) -> Result<RequestBuilder, ClientError>,
        {
            let mut request = self.inner.request(method, uri.to_string());
            if let Some(timeout) = self.timeout {
                request = request.timeout(timeout);
            }
            if let Some(token) = &self.token {
                request = request.header("X-Authorization", format!("Bearer {token}"));
            }

            let request = decorator(request)?;
            let res = request.send().await.map_err(ClientError::Client)?;
            Ok(Response(res))
        }
    }
}
