//! Network fetch primitive.
//!
//! A document is retrieved by URL and returned as text. Tests swap in mock
//! fetchers through the [`Fetcher`] trait.

use std::time::Duration;

use sightings_core::types::{Result, SightingError};

const USER_AGENT: &str = concat!("cimon-sightings/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Retrieve the document at `url`. Transport errors and non-2xx
    /// statuses are both `SightingError::Fetch`.
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SightingError::Fetch(e.to_string()))?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SightingError::Fetch(format!("{url}: {e}")))?;

        response
            .text()
            .await
            .map_err(|e| SightingError::Fetch(format!("{url}: {e}")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves canned bodies by URL, counting calls.
    pub(crate) struct MockFetcher {
        bodies: Mutex<HashMap<String, std::result::Result<String, String>>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        pub(crate) fn new(delay: Duration) -> Self {
            MockFetcher {
                bodies: Mutex::new(HashMap::new()),
                delay,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn serve(&self, url: &str, body: &str) {
            self.bodies
                .lock()
                .unwrap()
                .insert(url.to_string(), Ok(body.to_string()));
        }

        pub(crate) fn fail(&self, url: &str, reason: &str) {
            self.bodies
                .lock()
                .unwrap()
                .insert(url.to_string(), Err(reason.to_string()));
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, url: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.bodies.lock().unwrap().get(url) {
                Some(Ok(body)) => Ok(body.clone()),
                Some(Err(reason)) => Err(SightingError::Fetch(reason.clone())),
                None => Err(SightingError::Fetch(format!("{url}: 404 Not Found"))),
            }
        }
    }

    #[test]
    fn test_http_fetcher_builds() {
        assert!(HttpFetcher::new().is_ok());
    }

    #[tokio::test]
    async fn test_mock_fetcher_counts() {
        let mock = MockFetcher::new(Duration::ZERO);
        mock.serve("http://x/a", "body");
        assert_eq!(mock.fetch("http://x/a").await.unwrap(), "body");
        assert!(mock.fetch("http://x/b").await.is_err());
        assert_eq!(mock.calls(), 2);
    }
}
