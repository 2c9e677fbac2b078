//! Broker service credentials and the endpoints derived from them.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use super::vcap::VcapServices;
use super::ConfigError;
use crate::auth::{ClientCredentials, ClientSecret};

/// Name of the bound service carrying broker credentials.
pub const SERVICE_NAME: &str = "advanced-event-mesh";

/// Path of the management API below the broker's management URI.
pub const MANAGEMENT_PATH: &str = "/SEMP/v2/config";

/// Expected shape of the broker binding, shown when credentials are unusable.
pub const BINDING_FORMAT: &str = r#"{
  "authentication-service": {
    "tokenendpoint": "https://<ias host>/oauth2/token",
    "clientid": "<client id>",
    "clientsecret": "<client secret>"
  },
  "endpoints": {
    "advanced-event-mesh": {
      "uri": "https://<broker host>:<port>",
      "smf_uri": "wss://<broker host>:<port>"
    }
  },
  "vpn": "<vpn>"
}"#;

/// Credentials of the broker binding.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MeshCredentials {
    #[serde(rename = "authentication-service")]
    pub authentication_service: Option<AuthServiceCredentials>,
    pub endpoints: Option<BTreeMap<String, EndpointCredentials>>,
    pub vpn: Option<String>,
}

/// Identity provider section of the binding.
///
/// Either names the token endpoint directly, or points at another bound
/// service (`service-label`) whose credentials complete it.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthServiceCredentials {
    pub tokenendpoint: Option<String>,
    pub clientid: Option<String>,
    pub clientsecret: Option<String>,
    pub certificate: Option<String>,
    pub key: Option<String>,
    pub api: Option<String>,
    #[serde(rename = "service-label")]
    pub service_label: Option<String>,
    pub url: Option<String>,
}

impl fmt::Debug for AuthServiceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthServiceCredentials")
            .field("tokenendpoint", &self.tokenendpoint)
            .field("clientid", &self.clientid)
            .field("clientsecret", &self.clientsecret.as_ref().map(|_| "<redacted>"))
            .field("certificate", &self.certificate.as_ref().map(|_| "<pem>"))
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("api", &self.api)
            .field("service_label", &self.service_label)
            .field("url", &self.url)
            .finish()
    }
}

impl AuthServiceCredentials {
    /// Fields set in `other` win over fields set here.
    fn overlay(&self, other: AuthServiceCredentials) -> AuthServiceCredentials {
        AuthServiceCredentials {
            tokenendpoint: other.tokenendpoint.or_else(|| self.tokenendpoint.clone()),
            clientid: other.clientid.or_else(|| self.clientid.clone()),
            clientsecret: other.clientsecret.or_else(|| self.clientsecret.clone()),
            certificate: other.certificate.or_else(|| self.certificate.clone()),
            key: other.key.or_else(|| self.key.clone()),
            api: other.api.or_else(|| self.api.clone()),
            service_label: other.service_label.or_else(|| self.service_label.clone()),
            url: other.url.or_else(|| self.url.clone()),
        }
    }
}

/// One broker endpoint entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointCredentials {
    pub uri: Option<String>,
    pub smf_uri: Option<String>,
}

/// Resolved broker endpoints. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSet {
    /// Management API base, `{uri}/SEMP/v2/config`.
    pub management_uri: String,
    /// Streaming transport URI.
    pub smf_uri: String,
    pub vpn: String,
}

fn malformed(reason: &str) -> ConfigError {
    ConfigError::Credentials {
        reason: reason.to_string(),
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

impl MeshCredentials {
    /// Read the broker binding from bound services.
    pub fn from_vcap(vcap: &VcapServices) -> Result<Self, ConfigError> {
        let service = vcap
            .by_name(SERVICE_NAME)
            .ok_or_else(|| ConfigError::ServiceNotBound(SERVICE_NAME.to_string()))?;
        serde_json::from_value(service.credentials.clone())
            .map_err(|e| malformed(&format!("binding is not an object of the expected shape: {}", e)))
    }

    /// Validate the binding and resolve its endpoint set.
    pub fn endpoints(&self) -> Result<EndpointSet, ConfigError> {
        let auth = self
            .authentication_service
            .as_ref()
            .ok_or_else(|| malformed("authentication-service is missing"))?;
        let endpoints = self
            .endpoints
            .as_ref()
            .ok_or_else(|| malformed("endpoints are missing"))?;
        let vpn = self
            .vpn
            .as_ref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| malformed("vpn is missing"))?;

        match (present(&auth.tokenendpoint), present(&auth.service_label)) {
            (true, true) => {
                return Err(malformed(
                    "tokenendpoint and service-label are mutually exclusive",
                ))
            }
            (false, false) => return Err(malformed("tokenendpoint or service-label is required")),
            (true, false) => {
                let has_certificate = present(&auth.certificate) && present(&auth.key);
                if !present(&auth.clientid) || (!present(&auth.clientsecret) && !has_certificate) {
                    return Err(malformed(
                        "clientid and either clientsecret or certificate and key are required",
                    ));
                }
            }
            (false, true) => {
                if !present(&auth.api) {
                    return Err(malformed("api is required with service-label"));
                }
            }
        }

        let endpoint = endpoints
            .get(SERVICE_NAME)
            .or_else(|| endpoints.values().next())
            .ok_or_else(|| malformed("no endpoint is listed"))?;
        let (uri, smf_uri) = match (&endpoint.uri, &endpoint.smf_uri) {
            (Some(uri), Some(smf_uri)) if !uri.is_empty() && !smf_uri.is_empty() => (uri, smf_uri),
            _ => return Err(malformed("endpoint requires uri and smf_uri")),
        };

        Ok(EndpointSet {
            management_uri: format!("{}{}", uri.trim_end_matches('/'), MANAGEMENT_PATH),
            smf_uri: smf_uri.clone(),
            vpn: vpn.clone(),
        })
    }

    /// Resolve the data-plane client credentials.
    ///
    /// With `service-label`, the bound service carrying that label supplies the
    /// remaining fields and the token endpoint defaults to `{url}/oauth2/token`.
    pub fn client_credentials(
        &self,
        vcap: Option<&VcapServices>,
    ) -> Result<ClientCredentials, ConfigError> {
        let auth = self
            .authentication_service
            .as_ref()
            .ok_or_else(|| malformed("authentication-service is missing"))?;

        let resolved = match &auth.service_label {
            Some(label) if !label.is_empty() => {
                let vcap = vcap.ok_or(ConfigError::MissingVcapServices)?;
                let service = vcap
                    .by_label(label)
                    .ok_or_else(|| ConfigError::ServiceNotBound(label.clone()))?;
                let bound: AuthServiceCredentials =
                    serde_json::from_value(service.credentials.clone()).map_err(|e| {
                        malformed(&format!("credentials of service \"{}\": {}", label, e))
                    })?;
                let mut merged = auth.overlay(bound);
                if merged.tokenendpoint.is_none() {
                    merged.tokenendpoint = merged
                        .url
                        .as_ref()
                        .map(|url| format!("{}/oauth2/token", url.trim_end_matches('/')));
                }
                merged
            }
            _ => auth.clone(),
        };

        ClientCredentials::try_from(resolved)
    }
}

impl TryFrom<AuthServiceCredentials> for ClientCredentials {
    type Error = ConfigError;

    fn try_from(auth: AuthServiceCredentials) -> Result<Self, Self::Error> {
        let token_endpoint = auth
            .tokenendpoint
            .filter(|v| !v.is_empty())
            .ok_or_else(|| malformed("token endpoint could not be resolved"))?;
        let client_id = auth
            .clientid
            .filter(|v| !v.is_empty())
            .ok_or_else(|| malformed("clientid is missing"))?;

        let non_empty = |v: Option<String>| v.filter(|v| !v.is_empty());
        let secret = match (
            non_empty(auth.clientsecret),
            non_empty(auth.certificate),
            non_empty(auth.key),
        ) {
            (Some(secret), None, None) => ClientSecret::Secret(secret),
            (None, Some(certificate), Some(key)) => ClientSecret::Certificate { certificate, key },
            (Some(_), Some(_), _) => {
                return Err(malformed(
                    "clientsecret and certificate are mutually exclusive",
                ))
            }
            _ => {
                return Err(malformed(
                    "either clientsecret or certificate and key are required",
                ))
            }
        };

        Ok(ClientCredentials {
            token_endpoint,
            client_id,
            secret,
            api: auth.api.filter(|v| !v.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn creds(value: serde_json::Value) -> MeshCredentials {
        serde_json::from_value(value).unwrap()
    }

    fn secret_binding() -> serde_json::Value {
        json!({
            "authentication-service": {
                "tokenendpoint": "https://ias.example.com/oauth2/token",
                "clientid": "client",
                "clientsecret": "secret"
            },
            "endpoints": {
                "advanced-event-mesh": {
                    "uri": "https://broker.example.com:943",
                    "smf_uri": "wss://broker.example.com:443"
                }
            },
            "vpn": "prod-vpn"
        })
    }

    #[test]
    fn test_endpoints_resolved() {
        let endpoints = creds(secret_binding()).endpoints().unwrap();
        assert_eq!(
            endpoints,
            EndpointSet {
                management_uri: "https://broker.example.com:943/SEMP/v2/config".into(),
                smf_uri: "wss://broker.example.com:443".into(),
                vpn: "prod-vpn".into(),
            }
        );
    }

    #[test]
    fn test_missing_sections_rejected() {
        for field in ["authentication-service", "endpoints", "vpn"] {
            let mut binding = secret_binding();
            binding.as_object_mut().unwrap().remove(field);
            let err = creds(binding).endpoints().unwrap_err();
            assert!(err.to_string().contains(BINDING_FORMAT), "{}", field);
        }
    }

    #[test]
    fn test_token_endpoint_and_label_exclusive() {
        let mut binding = secret_binding();
        binding["authentication-service"]["service-label"] = json!("identity");
        binding["authentication-service"]["api"] = json!("mesh-api");
        assert!(creds(binding).endpoints().is_err());
    }

    #[test]
    fn test_label_requires_api() {
        let binding = json!({
            "authentication-service": {"service-label": "identity"},
            "endpoints": {"x": {"uri": "https://b:1", "smf_uri": "wss://b:2"}},
            "vpn": "v"
        });
        assert!(creds(binding).endpoints().is_err());
    }

    #[test]
    fn test_endpoint_requires_both_uris() {
        let mut binding = secret_binding();
        binding["endpoints"]["advanced-event-mesh"]
            .as_object_mut()
            .unwrap()
            .remove("smf_uri");
        assert!(creds(binding).endpoints().is_err());
    }

    #[test]
    fn test_certificate_without_key_rejected() {
        let mut binding = secret_binding();
        let auth = binding["authentication-service"].as_object_mut().unwrap();
        auth.remove("clientsecret");
        auth.insert("certificate".into(), json!("-----BEGIN CERTIFICATE-----"));
        assert!(creds(binding).endpoints().is_err());
    }

    #[test]
    fn test_secret_client_credentials() {
        let client = creds(secret_binding()).client_credentials(None).unwrap();
        assert_eq!(client.client_id, "client");
        assert_eq!(client.secret, ClientSecret::Secret("secret".into()));
        assert!(client.api.is_none());
    }

    #[test]
    fn test_secret_and_certificate_together_rejected() {
        let mut binding = secret_binding();
        binding["authentication-service"]["certificate"] = json!("cert");
        binding["authentication-service"]["key"] = json!("key");
        assert!(creds(binding).client_credentials(None).is_err());
    }

    #[test]
    fn test_service_label_rehydrates_from_bound_service() {
        let binding = json!({
            "authentication-service": {"service-label": "identity", "api": "mesh-api"},
            "endpoints": {"advanced-event-mesh": {"uri": "https://b:1", "smf_uri": "wss://b:2"}},
            "vpn": "v"
        });
        let vcap = VcapServices::from_json(
            r#"{"identity": [{"name": "ias", "label": "identity", "credentials": {
                "url": "https://tenant.accounts.example.com",
                "clientid": "ias-client",
                "certificate": "CERT",
                "key": "KEY"
            }}]}"#,
        )
        .unwrap();

        let mesh = creds(binding);
        mesh.endpoints().unwrap();
        let client = mesh.client_credentials(Some(&vcap)).unwrap();

        assert_eq!(
            client.token_endpoint,
            "https://tenant.accounts.example.com/oauth2/token"
        );
        assert_eq!(client.client_id, "ias-client");
        assert_eq!(client.api.as_deref(), Some("mesh-api"));
        assert!(matches!(client.secret, ClientSecret::Certificate { .. }));
    }

    #[test]
    fn test_service_label_without_bound_service() {
        let binding = json!({
            "authentication-service": {"service-label": "identity", "api": "mesh-api"}
        });
        let vcap = VcapServices::from_json("{}").unwrap();
        let err = creds(binding).client_credentials(Some(&vcap)).unwrap_err();
        assert!(matches!(err, ConfigError::ServiceNotBound(label) if label == "identity"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let binding = creds(secret_binding());
        let rendered = format!("{:?}", binding.authentication_service.unwrap());
        assert!(!rendered.contains("\"secret\""));
    }
}
