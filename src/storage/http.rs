use std::{sync::Arc, time::Duration};

use reqwest::{blocking::RequestBuilder, StatusCode, Url};
use serde::Deserialize;

use super::{IdentityProvider, ListPage, ObjectStore, RemoteConnector, StoreError};

/// Object store reached over a small REST protocol:
///
/// - `PUT    /{container}` creates the container (`409` when it exists)
/// - `PUT    /{container}/{key}` stores bytes
/// - `GET    /{container}/{key}` fetches bytes (`404` when absent)
/// - `HEAD   /{container}/{key}` existence check
/// - `DELETE /{container}/{key}` removes an object
/// - `GET    /{container}?prefix=&continuation=&limit=` returns a [`ListPage`]
pub struct HttpStore {
    client: reqwest::blocking::Client,
    remote_addr: Url,
    token: Option<String>,
    container: String,
}

/// Appends path segments to `base`, percent-encoding each one.
fn join_segments<'a>(
    base: &Url,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<Url, StoreError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| StoreError::InvalidEndpoint(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

impl HttpStore {
    /// `/{container}`, followed by the key's `/`-separated segments.
    fn url_for(&self, key: Option<&str>) -> Result<Url, StoreError> {
        let key_segments = key.into_iter().flat_map(|key| key.split('/'));
        join_segments(
            &self.remote_addr,
            std::iter::once(self.container.as_str()).chain(key_segments),
        )
    }

    fn request(&self, method: reqwest::Method, key: Option<&str>) -> Result<RequestBuilder, StoreError> {
        let url = self.url_for(key)?;
        log::debug!("{method} {url}");

        let builder = self.client.request(method, url);
        Ok(match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    fn object(&self, method: reqwest::Method, key: &str) -> Result<RequestBuilder, StoreError> {
        self.request(method, Some(key))
    }
}

fn status_error(status: StatusCode, key: &str) -> StoreError {
    StoreError::Status {
        status: status.as_u16(),
        key: key.to_string(),
    }
}

impl ObjectStore for HttpStore {
    fn container(&self) -> &str {
        &self.container
    }

    fn create_container_if_absent(&self) -> Result<(), StoreError> {
        let resp = self.request(reqwest::Method::PUT, None)?.send()?;
        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                log::debug!("container {} already exists", self.container);
                Ok(())
            }
            status => Err(status_error(status, &self.container)),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let resp = self
            .object(reqwest::Method::PUT, key)?
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(data.to_vec())
            .send()?;

        if !resp.status().is_success() {
            return Err(status_error(resp.status(), key));
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let resp = self.object(reqwest::Method::GET, key)?.send()?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(resp.bytes()?.to_vec())),
            status => Err(status_error(status, key)),
        }
    }

    fn head_exists(&self, key: &str) -> Result<bool, StoreError> {
        let resp = self.object(reqwest::Method::HEAD, key)?.send()?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(status_error(status, key)),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let resp = self.object(reqwest::Method::DELETE, key)?.send()?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(status_error(status, key)),
        }
    }

    fn list(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, StoreError> {
        let limit = limit.to_string();
        let mut query = vec![("prefix", prefix), ("limit", limit.as_str())];
        if let Some(token) = continuation {
            query.push(("continuation", token));
        }

        let resp = self.request(reqwest::Method::GET, None)?.query(&query).send()?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), prefix));
        }

        Ok(resp.json::<ListPage>()?)
    }
}

#[derive(Deserialize)]
struct IdentityResponse {
    account: String,
}

/// Connects to the REST object service with a bearer token.
pub struct HttpConnector {
    client: reqwest::blocking::Client,
    remote_addr: Url,
    token: Option<String>,
    region: String,
}

impl HttpConnector {
    pub fn new(
        addr: &str,
        token: Option<String>,
        region: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let remote_addr =
            Url::parse(addr).map_err(|err| StoreError::InvalidEndpoint(format!("{addr}: {err}")))?;
        if remote_addr.cannot_be_a_base() {
            return Err(StoreError::InvalidEndpoint(addr.to_string()));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(HttpConnector {
            client,
            remote_addr,
            token,
            region: region.to_string(),
        })
    }
}

impl IdentityProvider for HttpConnector {
    fn account_identity(&self) -> Option<String> {
        let url = match join_segments(&self.remote_addr, ["identity"]) {
            Ok(url) => url,
            Err(err) => {
                log::warn!("identity lookup skipped: {err}");
                return None;
            }
        };
        let builder = self.client.get(url);
        let builder = match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };

        let resp = match builder.send() {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                log::warn!("identity lookup returned {}", resp.status());
                return None;
            }
            Err(err) => {
                log::warn!("identity lookup failed: {err}");
                return None;
            }
        };

        match resp.json::<IdentityResponse>() {
            Ok(identity) if !identity.account.trim().is_empty() => Some(identity.account),
            Ok(_) => None,
            Err(err) => {
                log::warn!("identity lookup returned malformed body: {err}");
                None
            }
        }
    }
}

impl RemoteConnector for HttpConnector {
    fn region(&self) -> &str {
        &self.region
    }

    fn open(&self, container: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
        Ok(Arc::new(self.store(container)))
    }
}

impl HttpConnector {
    fn store(&self, container: &str) -> HttpStore {
        HttpStore {
            client: self.client.clone(),
            remote_addr: self.remote_addr.clone(),
            token: self.token.clone(),
            container: container.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(addr: &str) -> HttpStore {
        HttpConnector::new(addr, None, "us-east-1", Duration::from_secs(1))
            .unwrap()
            .store("c")
    }

    #[test]
    fn keys_are_percent_encoded_per_segment() {
        let store = store("http://localhost:9000");
        let url = |key: &str| store.url_for(Some(key)).unwrap().to_string();

        assert_eq!(
            url("semantic-types/C#.json"),
            "http://localhost:9000/c/semantic-types/C%23.json"
        );
        assert_eq!(url("semantic-types/A%B.json"), "http://localhost:9000/c/semantic-types/A%25B.json");
        assert_eq!(url("vectors/Q?.json"), "http://localhost:9000/c/vectors/Q%3F.json");
        assert_ne!(url("semantic-types/C#.json"), url("semantic-types/C##.json"));
    }

    #[test]
    fn endpoint_path_is_kept() {
        assert_eq!(
            store("http://localhost:9000/api/").url_for(None).unwrap().to_string(),
            "http://localhost:9000/api/c"
        );
        assert_eq!(
            store("http://localhost:9000/api").url_for(Some("a/b.json")).unwrap().to_string(),
            "http://localhost:9000/api/c/a/b.json"
        );
    }

    #[test]
    fn rejects_unusable_endpoints() {
        for addr in ["not a url", "mailto:ops@example.com"] {
            assert!(matches!(
                HttpConnector::new(addr, None, "us-east-1", Duration::from_secs(1)),
                Err(StoreError::InvalidEndpoint(_))
            ));
        }
    }
}
