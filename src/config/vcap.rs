//! Bound-service and application metadata from the deployment environment.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::ConfigError;

/// Environment variable listing bound services.
pub const VCAP_SERVICES_ENV_VAR: &str = "VCAP_SERVICES";
/// Environment variable describing the running application.
pub const VCAP_APPLICATION_ENV_VAR: &str = "VCAP_APPLICATION";

/// Placeholder in queue names replaced by the application identity.
pub const APP_ID_PLACEHOLDER: &str = "$appId";
const DEFAULT_APP_NAME: &str = "CAP";
const DEFAULT_APP_ID: &str = "00000000";

/// One bound service instance.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BoundService {
    pub name: String,
    pub label: String,
    pub plan: String,
    pub credentials: Value,
}

/// Services bound to the application, grouped by service label in the
/// order the platform lists them.
#[derive(Debug, Clone, Default)]
pub struct VcapServices {
    services: Vec<(String, Vec<BoundService>)>,
}

impl VcapServices {
    /// Read `VCAP_SERVICES`. Returns `None` when the variable is unset.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        match std::env::var(VCAP_SERVICES_ENV_VAR) {
            Ok(raw) => Self::from_json(&raw).map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |source| ConfigError::InvalidJson {
            var: VCAP_SERVICES_ENV_VAR,
            source,
        };
        let labels: Map<String, Value> = serde_json::from_str(raw).map_err(invalid)?;
        let services: Vec<(String, Vec<BoundService>)> = labels
            .into_iter()
            .map(|(label, instances)| {
                serde_json::from_value(instances).map(|instances| (label, instances))
            })
            .collect::<Result<_, _>>()
            .map_err(invalid)?;
        Ok(Self { services })
    }

    /// First bound service matching `test`.
    ///
    /// Only the first instance listed under each label is considered.
    pub fn find(&self, test: impl Fn(&BoundService) -> bool) -> Option<&BoundService> {
        self.services
            .iter()
            .filter_map(|(_, instances)| instances.first())
            .find(|service| test(service))
    }

    pub fn by_name(&self, name: &str) -> Option<&BoundService> {
        self.find(|s| s.name == name)
    }

    pub fn by_label(&self, label: &str) -> Option<&BoundService> {
        self.find(|s| s.label == label)
    }

    pub fn by_plan(&self, plan: &str) -> Option<&BoundService> {
        self.find(|s| s.plan == plan)
    }
}

/// Identity of the running application, used in queue name templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppMetadata {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Deserialize)]
struct VcapApplication {
    application_id: Option<String>,
    application_name: Option<String>,
}

impl AppMetadata {
    /// Read `VCAP_APPLICATION`. Unset yields empty metadata.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(VCAP_APPLICATION_ENV_VAR) {
            Ok(raw) => {
                let app: VcapApplication =
                    serde_json::from_str(&raw).map_err(|source| ConfigError::InvalidJson {
                        var: VCAP_APPLICATION_ENV_VAR,
                        source,
                    })?;
                Ok(Self {
                    id: app.application_id,
                    name: app.application_name,
                })
            }
            Err(_) => Ok(Self::default()),
        }
    }

    /// `{name}/{first four characters of id}`, with fallbacks for missing parts.
    pub fn app_id(&self) -> String {
        let name = self.name.as_deref().unwrap_or(DEFAULT_APP_NAME);
        let id = self.id.as_deref().unwrap_or(DEFAULT_APP_ID);
        let shrunk: String = id.chars().take(4).collect();
        format!("{}/{}", name, shrunk)
    }

    /// Substitute every `$appId` placeholder in a queue name template.
    pub fn resolve_queue_name(&self, template: &str) -> String {
        template.replace(APP_ID_PLACEHOLDER, &self.app_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const SERVICES: &str = r#"{
        "user-provided": [
            {"name": "advanced-event-mesh", "label": "user-provided", "plan": "", "credentials": {"vpn": "v1"}},
            {"name": "second-ups", "label": "user-provided", "credentials": {}}
        ],
        "identity": [
            {"name": "my-ias", "label": "identity", "plan": "application", "credentials": {"clientid": "c"}}
        ]
    }"#;

    #[test]
    fn test_find_by_name_label_plan() {
        let vcap = VcapServices::from_json(SERVICES).unwrap();
        assert_eq!(vcap.by_name("advanced-event-mesh").unwrap().credentials["vpn"], "v1");
        assert_eq!(vcap.by_label("identity").unwrap().name, "my-ias");
        assert_eq!(vcap.by_plan("application").unwrap().label, "identity");
    }

    #[test]
    fn test_labels_searched_in_listed_order() {
        let vcap = VcapServices::from_json(
            r#"{
                "zeta": [{"name": "listed-first", "label": "zeta", "plan": "shared"}],
                "alpha": [{"name": "listed-second", "label": "alpha", "plan": "shared"}]
            }"#,
        )
        .unwrap();
        assert_eq!(vcap.by_plan("shared").unwrap().name, "listed-first");
    }

    #[test]
    fn test_only_first_instance_per_label_is_considered() {
        let vcap = VcapServices::from_json(SERVICES).unwrap();
        assert!(vcap.by_name("second-ups").is_none());
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        let err = VcapServices::from_json("not json").unwrap_err();
        assert!(err.to_string().contains(VCAP_SERVICES_ENV_VAR));
    }

    #[test]
    fn test_app_id_from_metadata() {
        let app = AppMetadata {
            id: Some("1a2b3c4d-ffff".into()),
            name: Some("orders-srv".into()),
        };
        assert_eq!(app.app_id(), "orders-srv/1a2b");
        assert_eq!(
            app.resolve_queue_name("$appId/in/$appId"),
            "orders-srv/1a2b/in/orders-srv/1a2b"
        );
    }

    #[test]
    fn test_app_id_defaults() {
        assert_eq!(AppMetadata::default().app_id(), "CAP/0000");
        assert_eq!(AppMetadata::default().resolve_queue_name("fixed"), "fixed");
    }

    #[test]
    #[serial]
    fn test_app_metadata_from_vcap_application() {
        std::env::set_var(
            VCAP_APPLICATION_ENV_VAR,
            r#"{"application_id": "abcd1234", "application_name": "billing", "name": "billing", "space_name": "dev"}"#,
        );
        let app = AppMetadata::from_env();
        std::env::remove_var(VCAP_APPLICATION_ENV_VAR);

        assert_eq!(app.unwrap().app_id(), "billing/abcd");
    }

    #[test]
    #[serial]
    fn test_vcap_services_unset() {
        std::env::remove_var(VCAP_SERVICES_ENV_VAR);
        assert!(VcapServices::from_env().unwrap().is_none());
    }
}
