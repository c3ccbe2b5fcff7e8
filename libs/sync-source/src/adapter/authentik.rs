use super::{CredentialReader, IdentityAdapter, SyncUser};

use perm8s_k8s_util::error::{Error, Result};
use perm8s_k8s_util::types::IdentifierStyle;
use perm8s_operator::crd::{AuthentikSource, Provider, SynchronisationSource};

use futures::future::BoxFuture;
use kube::ResourceExt;
use serde::Deserialize;
use tokio::time::Duration;
use tracing::{debug, trace};
use url::Url;

const USERS_PATH: &str = "api/v3/core/users/";
const TOKEN_KEY: &str = "token";
const DEFAULT_PAGE_SIZE: u32 = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize, Debug)]
struct UserPage {
    pagination: Pagination,
    results: Vec<AuthentikUser>,
}

#[derive(Deserialize, Debug)]
struct Pagination {
    /// Number of the next page, `0` on the last one.
    #[serde(default)]
    next: Option<u64>,
}

#[derive(Deserialize, Debug)]
struct AuthentikUser {
    /// Display name, the identity of the projected user. The login `username` is not used.
    #[serde(default)]
    name: String,
    #[serde(default)]
    groups: Vec<String>,
}

/// A user is admitted when it is in one of `required_groups`, or when no group is required.
pub fn is_admitted(user_groups: &[String], required_groups: &[String]) -> bool {
    required_groups.is_empty() || required_groups.iter().any(|g| user_groups.contains(g))
}

/// Lists users from the Authentik core API.
pub struct AuthentikAdapter {
    http: reqwest::Client,
    page_size: u32,
}

impl Default for AuthentikAdapter {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl AuthentikAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(self, page_size: u32) -> Self {
        Self { page_size, ..self }
    }

    fn users_url(&self, config: &AuthentikSource, page: u64) -> Result<Url> {
        let base = format!("{}://{}/", config.scheme, config.url.trim_end_matches('/'));
        let mut url = Url::parse(&base)
            .and_then(|base| base.join(USERS_PATH))
            .map_err(|e| {
                Error::UrlParseError(format!("invalid Authentik url {base}"), e)
            })?;
        url.query_pairs_mut()
            .append_pair("page_size", &self.page_size.to_string())
            .append_pair("page", &page.to_string());
        Ok(url)
    }

    async fn read_token(
        source: &SynchronisationSource,
        config: &AuthentikSource,
        credentials: &dyn CredentialReader,
    ) -> Result<String> {
        let namespace = source.namespace().unwrap_or_default();
        let secret = credentials
            .read_secret(&namespace, &config.secret_name)
            .await?
            .ok_or_else(|| {
                Error::MissingData(format!(
                    "secret {} cannot be found in namespace {namespace}",
                    config.secret_name
                ))
            })?;
        secret
            .data
            .as_ref()
            .and_then(|data| data.get(TOKEN_KEY))
            .and_then(|token| String::from_utf8(token.0.clone()).ok())
            .ok_or_else(|| {
                Error::MissingData(format!(
                    "secret {namespace}/{} has no valid '{TOKEN_KEY}' key",
                    config.secret_name
                ))
            })
    }

    async fn fetch_page(
        &self,
        config: &AuthentikSource,
        token: &str,
        page: u64,
    ) -> Result<UserPage> {
        let url = self.users_url(config, page)?;
        trace!(msg = "requesting Authentik users", %url);
        self.http
            .get(url.clone())
            .bearer_auth(token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| {
                Error::HttpError(format!("user list request to {url} failed"), Box::new(e))
            })?
            .json::<UserPage>()
            .await
            .map_err(|e| {
                Error::HttpError(format!("invalid user list from {url}"), Box::new(e))
            })
    }

    async fn list_users(
        &self,
        source: &SynchronisationSource,
        config: &AuthentikSource,
        credentials: &dyn CredentialReader,
    ) -> Result<Vec<SyncUser>> {
        let token = Self::read_token(source, config, credentials).await?;
        let mut users = Vec::new();
        let mut page = 1;
        loop {
            let user_page = self.fetch_page(config, &token, page).await?;
            users.extend(
                user_page
                    .results
                    .into_iter()
                    .filter(|user| is_admitted(&user.groups, &config.required_groups))
                    .map(|user| SyncUser {
                        name: user.name,
                        groups: user.groups,
                    }),
            );
            match user_page.pagination.next {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }
        debug!(msg = format!("{} Authentik users admitted", users.len()));
        Ok(users)
    }
}

impl IdentityAdapter for AuthentikAdapter {
    fn identifier_style(&self) -> IdentifierStyle {
        IdentifierStyle::Separated('-')
    }

    fn compute_users<'a>(
        &'a self,
        source: &'a SynchronisationSource,
        provider: &'a Provider,
        credentials: &'a dyn CredentialReader,
    ) -> BoxFuture<'a, Result<Vec<SyncUser>>> {
        Box::pin(async move {
            match provider {
                Provider::Authentik(config) => self.list_users(source, config, credentials).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use futures::FutureExt;
    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticCredentials(Option<Secret>);

    impl CredentialReader for StaticCredentials {
        fn read_secret<'a>(
            &'a self,
            _namespace: &'a str,
            _name: &'a str,
        ) -> BoxFuture<'a, Result<Option<Secret>>> {
            futures::future::ready(Ok(self.0.clone())).boxed()
        }
    }

    fn token_secret(token: &str) -> StaticCredentials {
        StaticCredentials(Some(Secret {
            metadata: ObjectMeta {
                name: Some("authentik-token".to_string()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(
                TOKEN_KEY.to_string(),
                ByteString(token.as_bytes().to_vec()),
            )])),
            ..Secret::default()
        }))
    }

    fn source_for(
        server: &MockServer,
        required_groups: &[&str],
    ) -> (SynchronisationSource, Provider) {
        let mut source = SynchronisationSource::test("authentik", "authentik");
        let config = source.spec.authentik.as_mut().unwrap();
        config.scheme = "http".to_string();
        config.url = server.address().to_string();
        config.required_groups = required_groups.iter().map(|g| g.to_string()).collect();
        let provider = source.spec.provider().unwrap();
        (source, provider)
    }

    fn page(next: u64, users: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "pagination": {"next": next, "count": 3},
            "results": users,
        }))
    }

    #[test]
    fn test_is_admitted() {
        let groups = vec!["g1".to_string(), "g2".to_string()];
        assert!(is_admitted(&groups, &[]));
        assert!(is_admitted(&groups, &["g2".to_string()]));
        assert!(!is_admitted(&groups, &["g3".to_string()]));
        assert!(!is_admitted(&[], &["g1".to_string()]));
    }

    #[tokio::test]
    async fn test_list_users_follows_pagination_and_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/core/users/"))
            .and(query_param("page", "1"))
            .and(header("authorization", "Bearer s3cr3t"))
            .respond_with(page(
                2,
                json!([
                    {"pk": 1, "username": "jdoe", "name": "Jane Doe", "groups": ["g1"]},
                    {"pk": 2, "username": "bot", "name": "Bot", "groups": []},
                ]),
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v3/core/users/"))
            .and(query_param("page", "2"))
            .respond_with(page(
                0,
                json!([{"pk": 3, "username": "jsmith", "name": "John", "groups": ["g2", "g1"]}]),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let (source, provider) = source_for(&server, &["g1"]);
        let users = AuthentikAdapter::default()
            .with_page_size(2)
            .compute_users(&source, &provider, &token_secret("s3cr3t"))
            .await
            .unwrap();

        assert_eq!(
            users,
            vec![
                SyncUser::new("Jane Doe", &["g1"]),
                SyncUser::new("John", &["g2", "g1"]),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_required_groups_admit_everyone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/core/users/"))
            .respond_with(page(
                0,
                json!([
                    {"name": "jane", "groups": ["g1"]},
                    {"name": "bot"},
                ]),
            ))
            .mount(&server)
            .await;

        let (source, provider) = source_for(&server, &[]);
        let users = AuthentikAdapter::default()
            .compute_users(&source, &provider, &token_secret("s3cr3t"))
            .await
            .unwrap();

        assert_eq!(users.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_secret_fails() {
        let server = MockServer::start().await;
        let (source, provider) = source_for(&server, &[]);

        let error = AuthentikAdapter::default()
            .compute_users(&source, &provider, &StaticCredentials(None))
            .await
            .unwrap_err();

        assert!(matches!(error, Error::MissingData(_)));
    }

    #[tokio::test]
    async fn test_rejected_token_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let (source, provider) = source_for(&server, &[]);

        let error = AuthentikAdapter::default()
            .compute_users(&source, &provider, &token_secret("expired"))
            .await
            .unwrap_err();

        assert!(matches!(error, Error::HttpError(_, _)));
    }
}
