//! The principal being evaluated.
use std::{borrow::Cow, collections::HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user (or any other unit) that flags are evaluated for.
///
/// `private_attributes` take part in evaluation but are never serialized: they are skipped by
/// `Serialize` and have no counterpart in [`LoggableUser`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "customIDs", default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_ids: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,
    #[serde(default, skip_serializing)]
    pub private_attributes: HashMap<String, Value>,
}

impl User {
    pub fn with_user_id(user_id: impl Into<String>) -> User {
        User {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_custom_ids<K: Into<String>, V: Into<String>>(
        custom_ids: impl IntoIterator<Item = (K, V)>,
    ) -> User {
        User {
            custom_ids: custom_ids
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn custom_id(mut self, id_type: impl Into<String>, id: impl Into<String>) -> User {
        self.custom_ids.insert(id_type.into(), id.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> User {
        self.email = Some(email.into());
        self
    }

    pub fn country(mut self, country: impl Into<String>) -> User {
        self.country = Some(country.into());
        self
    }

    pub fn app_version(mut self, app_version: impl Into<String>) -> User {
        self.app_version = Some(app_version.into());
        self
    }

    pub fn custom_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> User {
        self.custom.insert(key.into(), value.into());
        self
    }

    pub fn private_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> User {
        self.private_attributes.insert(key.into(), value.into());
        self
    }

    /// Returns `true` if the user carries a primary or any custom ID.
    pub fn has_any_id(&self) -> bool {
        self.user_id.as_deref().is_some_and(|id| !id.is_empty())
            || self.custom_ids.values().any(|id| !id.is_empty())
    }

    /// ID used for bucketing under `id_type`. `userID` selects the primary ID, anything else
    /// is looked up in custom IDs (exact match first, then case-insensitive).
    pub fn unit_id(&self, id_type: &str) -> Option<&str> {
        if id_type.is_empty() || id_type.eq_ignore_ascii_case("userid") {
            return self.user_id.as_deref();
        }
        if let Some(id) = self.custom_ids.get(id_type) {
            return Some(id);
        }
        self.custom_ids
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(id_type))
            .map(|(_, v)| v.as_str())
    }

    /// Look up a field for targeting: well-known fields, then `custom`, then `global_custom`,
    /// then private attributes.
    pub fn field(&self, field: &str, global_custom: &HashMap<String, Value>) -> Option<Value> {
        let well_known = match field.to_ascii_lowercase().as_str() {
            "userid" | "user_id" => self.user_id.as_ref(),
            "email" => self.email.as_ref(),
            "ip" | "ipaddress" | "ip_address" => self.ip.as_ref(),
            "country" => self.country.as_ref(),
            "locale" => self.locale.as_ref(),
            "appversion" | "app_version" => self.app_version.as_ref(),
            "useragent" | "user_agent" => self.user_agent.as_ref(),
            _ => None,
        };
        if let Some(value) = well_known {
            return Some(Value::String(value.clone()));
        }

        [&self.custom, global_custom, &self.private_attributes]
            .into_iter()
            .find_map(|map| lookup(map, field))
            .cloned()
    }

    /// Apply the nested attribute `policy` to `custom` and `private_attributes`.
    ///
    /// Borrows when nothing needs to change.
    pub fn normalized(&self, policy: NestedAttributePolicy) -> Cow<'_, User> {
        let has_nested = self
            .custom
            .values()
            .chain(self.private_attributes.values())
            .any(Value::is_object);
        if !has_nested || policy == NestedAttributePolicy::Preserve {
            return Cow::Borrowed(self);
        }

        let mut user = self.clone();
        user.custom = policy.apply(std::mem::take(&mut user.custom));
        user.private_attributes = policy.apply(std::mem::take(&mut user.private_attributes));
        Cow::Owned(user)
    }

    /// Telemetry form of the user. Custom fields are layered over `global_custom`, and the
    /// environment tier is attached when set.
    pub fn to_loggable(
        &self,
        environment: Option<&str>,
        global_custom: &HashMap<String, Value>,
    ) -> LoggableUser {
        let mut custom = global_custom.clone();
        custom.extend(self.custom.iter().map(|(k, v)| (k.clone(), v.clone())));

        LoggableUser {
            user_id: self.user_id.clone(),
            custom_ids: self.custom_ids.clone(),
            email: self.email.clone(),
            ip: self.ip.clone(),
            country: self.country.clone(),
            locale: self.locale.clone(),
            app_version: self.app_version.clone(),
            user_agent: self.user_agent.clone(),
            custom,
            statsig_environment: environment
                .map(|tier| HashMap::from([("tier".to_owned(), tier.to_owned())])),
        }
    }
}

fn lookup<'a>(map: &'a HashMap<String, Value>, field: &str) -> Option<&'a Value> {
    map.get(field).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(field))
            .map(|(_, v)| v)
    })
}

/// User as it appears in exposure and custom events. It has no place for private attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggableUser {
    #[serde(rename = "userID", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "customIDs", skip_serializing_if = "HashMap::is_empty")]
    pub custom_ids: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statsig_environment: Option<HashMap<String, String>>,
}

/// How object-valued entries in `custom` and `private_attributes` are treated.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NestedAttributePolicy {
    /// Object values are dropped, as if the attribute was not set.
    #[default]
    Reject,
    /// Object values are expanded into dotted keys: `{"a": {"b": 1}}` becomes `{"a.b": 1}`.
    Flatten,
    /// Object values are kept as is.
    Preserve,
}

impl NestedAttributePolicy {
    fn apply(self, attributes: HashMap<String, Value>) -> HashMap<String, Value> {
        match self {
            NestedAttributePolicy::Preserve => attributes,
            NestedAttributePolicy::Reject => attributes
                .into_iter()
                .filter(|(_, v)| !v.is_object())
                .collect(),
            NestedAttributePolicy::Flatten => {
                let mut out = HashMap::with_capacity(attributes.len());
                for (key, value) in attributes {
                    flatten_into(&mut out, key, value);
                }
                out
            }
        }
    }
}

fn flatten_into(out: &mut HashMap<String, Value>, key: String, value: Value) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(out, format!("{key}.{k}"), v);
            }
        }
        other => {
            out.insert(key, other);
        }
    }
}
