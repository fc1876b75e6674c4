//! RFC 8414 authorization-server metadata, OIDC discovery, and RFC 9728
//! protected-resource metadata.

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    pub jwks_uri: String,
    pub scopes_supported: Vec<String>,
    pub response_types_supported: Vec<&'static str>,
    pub response_modes_supported: Vec<&'static str>,
    pub grant_types_supported: Vec<&'static str>,
    pub token_endpoint_auth_methods_supported: Vec<&'static str>,
    pub code_challenge_methods_supported: Vec<&'static str>,
    pub subject_types_supported: Vec<&'static str>,
    pub id_token_signing_alg_values_supported: Vec<&'static str>,
    pub client_id_metadata_document_supported: bool,
}

#[derive(Debug, Serialize)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    pub authorization_servers: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub bearer_methods_supported: Vec<&'static str>,
}

pub struct MetadataPublisher {
    issuer: String,
    scopes_supported: Vec<String>,
    dynamic_registration_enabled: bool,
    client_id_metadata_document_supported: bool,
}

impl MetadataPublisher {
    pub fn new(
        issuer: String,
        scopes_supported: Vec<String>,
        dynamic_registration_enabled: bool,
        client_id_metadata_document_supported: bool,
    ) -> Self {
        Self {
            issuer,
            scopes_supported,
            dynamic_registration_enabled,
            client_id_metadata_document_supported,
        }
    }

    /// Shared by `/.well-known/oauth-authorization-server` and
    /// `/.well-known/openid-configuration` — both are the same document.
    pub fn authorization_server_metadata(&self) -> AuthorizationServerMetadata {
        AuthorizationServerMetadata {
            issuer: self.issuer.clone(),
            authorization_endpoint: format!("{}/oauth/authorize", self.issuer),
            token_endpoint: format!("{}/oauth/token", self.issuer),
            registration_endpoint: self
                .dynamic_registration_enabled
                .then(|| format!("{}/oauth/register", self.issuer)),
            jwks_uri: format!("{}/.well-known/jwks.json", self.issuer),
            scopes_supported: self.scopes_supported.clone(),
            response_types_supported: vec!["code"],
            response_modes_supported: vec!["query"],
            grant_types_supported: vec!["authorization_code", "refresh_token"],
            token_endpoint_auth_methods_supported: vec![
                "client_secret_post",
                "client_secret_basic",
                "none",
            ],
            code_challenge_methods_supported: vec!["S256"],
            subject_types_supported: vec!["public"],
            id_token_signing_alg_values_supported: vec!["HS256"],
            client_id_metadata_document_supported: self.client_id_metadata_document_supported,
        }
    }

    pub fn protected_resource_metadata(&self) -> ProtectedResourceMetadata {
        ProtectedResourceMetadata {
            resource: self.issuer.clone(),
            authorization_servers: vec![self.issuer.clone()],
            scopes_supported: self.scopes_supported.clone(),
            bearer_methods_supported: vec!["header"],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_endpoint_is_omitted_when_disabled() {
        let publisher = MetadataPublisher::new(
            "https://broker.example".into(),
            vec!["openid".into()],
            false,
            false,
        );
        let metadata = publisher.authorization_server_metadata();
        assert!(metadata.registration_endpoint.is_none());
    }

    #[test]
    fn registration_endpoint_is_present_when_enabled() {
        let publisher = MetadataPublisher::new(
            "https://broker.example".into(),
            vec!["openid".into()],
            true,
            false,
        );
        let metadata = publisher.authorization_server_metadata();
        assert_eq!(
            metadata.registration_endpoint,
            Some("https://broker.example/oauth/register".to_string())
        );
    }

    #[test]
    fn protected_resource_metadata_names_this_issuer_as_its_own_authorization_server() {
        let publisher = MetadataPublisher::new(
            "https://broker.example".into(),
            vec!["mcp:tools".into()],
            true,
            false,
        );
        let metadata = publisher.protected_resource_metadata();
        assert_eq!(metadata.authorization_servers, vec!["https://broker.example".to_string()]);
    }

    #[test]
    fn client_id_metadata_document_support_is_advertised_when_enabled() {
        let publisher = MetadataPublisher::new(
            "https://broker.example".into(),
            vec!["openid".into()],
            true,
            true,
        );
        let metadata = publisher.authorization_server_metadata();
        assert!(metadata.client_id_metadata_document_supported);
    }
}
