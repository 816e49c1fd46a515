use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use mcpsync_transport::{CredentialError, TokenSource};

/// Bearer token read from `data[key]` (or `stringData[key]`) of a namespaced Secret.
/// Looked up on every call so rotated secrets are picked up.
pub struct SecretTokenSource {
    api: Api<Secret>,
    namespace: String,
    name: String,
    key: String,
}

impl SecretTokenSource {
    pub fn new(client: Client, namespace: &str, name: &str, key: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), namespace: namespace.into(), name: name.into(), key: key.into() }
    }
}

/// The trimmed, non-empty token stored under `key`.
fn token_from(secret: &Secret, key: &str) -> Option<String> {
    let from_data = secret.data.as_ref().and_then(|d| d.get(key)).map(|b| String::from_utf8_lossy(&b.0).into_owned());
    let from_string = || secret.string_data.as_ref().and_then(|d| d.get(key)).cloned();
    from_data.or_else(from_string).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[async_trait::async_trait]
impl TokenSource for SecretTokenSource {
    async fn token(&self) -> Result<String, CredentialError> {
        let secret = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| CredentialError::Backend(e.to_string()))?
            .ok_or_else(|| CredentialError::NotFound { namespace: self.namespace.clone(), name: self.name.clone() })?;
        token_from(&secret, &self.key).ok_or_else(|| CredentialError::KeyMissing {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            key: self.key.clone(),
        })
    }
}
