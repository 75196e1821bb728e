//! Service definitions document.
//!
//! The serialisable description of every service and operation a dispatcher
//! exposes. It is served at `GET /.lightwave/operations` and is the
//! externally visible contract of the dispatcher. Field names are camelCase
//! on the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::openapi::schema::Schema;
use utoipa::openapi::RefOr;

/// A JSON schema as produced by `utoipa`.
pub type JsonSchema = RefOr<Schema>;

/// Top-level definitions document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Definitions {
    pub services: Vec<Service>,
}

impl Definitions {
    /// Looks up a service entry by ID.
    #[must_use]
    pub fn service(&self, id: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.id == id)
    }

    /// Iterates over every `(service ID, operation ID)` pair in the document.
    pub fn operation_keys(&self) -> impl Iterator<Item = (&str, &str)> {
        self.services.iter().flat_map(|svc| {
            svc.operations
                .iter()
                .map(move |op| (svc.id.as_str(), op.id.as_str()))
        })
    }
}

/// One service entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub cli_name: String,
    pub name: String,
    pub description: String,
    pub operations: Vec<Operation>,
}

impl Service {
    /// Looks up an operation entry by ID.
    #[must_use]
    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }
}

/// One operation entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub name: String,
    pub cli_name: String,
    pub description: String,
    pub routing_rule: RoutingRule,
    /// Schema of the request body, absent for operations without input.
    pub request_body: Option<RootSchema>,
    /// Expected response body schema keyed by HTTP status code.
    #[serde(rename = "responses")]
    pub response_body: BTreeMap<String, JsonSchema>,
}

/// How a relay reaches an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub method: String,
    /// Target used for non-HTTP routing rules.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
}

impl RoutingRule {
    /// The `POST /<service>/<operation>` rule used for every dispatched operation.
    #[must_use]
    pub fn http_post(service: &str, operation: &str) -> Self {
        Self {
            kind: "http".to_string(),
            path: format!("/{service}/{operation}"),
            method: "POST".to_string(),
            target: String::new(),
        }
    }
}

/// Wrapper giving request schemas a `{"schema": ...}` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootSchema {
    pub schema: JsonSchema,
}

/// Converts an identifier such as `ListUsers` or `list_users` to `list-users`.
#[must_use]
pub fn cli_name(id: &str) -> String {
    let mut out = String::with_capacity(id.len() + 4);
    let mut prev_lower = false;
    for ch in id.chars() {
        if ch == '_' || ch == ' ' || ch == '-' {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
            prev_lower = false;
        } else if ch.is_uppercase() {
            if prev_lower && !out.ends_with('-') {
                out.push('-');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use utoipa::openapi::schema::{ObjectBuilder, Type};

    use super::*;

    fn string_schema() -> JsonSchema {
        RefOr::T(Schema::Object(ObjectBuilder::new().schema_type(Type::String).build()))
    }

    #[test]
    fn cli_name_kebab_cases_identifiers() {
        assert_eq!(cli_name("Foo"), "foo");
        assert_eq!(cli_name("ListUsers"), "list-users");
        assert_eq!(cli_name("list_users"), "list-users");
        assert_eq!(cli_name("example"), "example");
        assert_eq!(cli_name("GetV2Token"), "get-v2-token");
    }

    #[test]
    fn operation_serializes_with_wire_names() {
        let op = Operation {
            id: "Foo".to_string(),
            name: "Foo".to_string(),
            cli_name: "foo".to_string(),
            description: "does foo".to_string(),
            routing_rule: RoutingRule::http_post("example", "Foo"),
            request_body: Some(RootSchema {
                schema: string_schema(),
            }),
            response_body: BTreeMap::from([("200".to_string(), string_schema())]),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["cliName"], "foo");
        assert_eq!(json["routingRule"]["type"], "http");
        assert_eq!(json["routingRule"]["path"], "/example/Foo");
        assert_eq!(json["routingRule"]["method"], "POST");
        assert!(json["routingRule"].get("target").is_none());
        assert_eq!(json["requestBody"]["schema"]["type"], "string");
        assert_eq!(json["responses"]["200"]["type"], "string");
    }

    #[test]
    fn missing_request_body_serializes_as_null() {
        let op = Operation::default();
        let json = serde_json::to_value(&op).unwrap();
        assert!(json["requestBody"].is_null());
    }

    #[test]
    fn operation_keys_walk_every_pair() {
        let defs = Definitions {
            services: vec![
                Service {
                    id: "a".to_string(),
                    operations: vec![
                        Operation {
                            id: "One".to_string(),
                            ..Operation::default()
                        },
                        Operation {
                            id: "Two".to_string(),
                            ..Operation::default()
                        },
                    ],
                    ..Service::default()
                },
                Service {
                    id: "b".to_string(),
                    ..Service::default()
                },
            ],
        };
        let keys: Vec<_> = defs.operation_keys().collect();
        assert_eq!(keys, vec![("a", "One"), ("a", "Two")]);
        assert!(defs.service("b").is_some());
        assert!(defs.service("a").unwrap().operation("Two").is_some());
    }
}
