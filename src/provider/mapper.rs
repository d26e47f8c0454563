//! Provider Field Mapper
//!
//! Picks the payload shape for a provider and builds the provider-specific
//! payload from an (order, service) pair.
//!
//! Resolution order:
//! 1. explicit `wire_protocol` tag on the provider record
//! 2. case-insensitive substring rules over the provider name (legacy records)
//!
//! A provider matching neither is rejected with [`MapperError::UnknownProviderAdapter`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::models::{ApiFormat, ApiProvider, Order, Service, WireProtocol};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MapperError {
    #[error("No adapter registered for provider '{0}'")]
    UnknownProviderAdapter(String),
}

/// Payload family a name rule selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapperKind {
    /// DHRU-style: form body, base64 `parameters`
    DhruForm,
    /// JSON or XML body, encoding chosen by the provider's `api_format`
    Generic,
}

/// `pattern` is matched case-insensitively as a substring of the provider name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperRule {
    pub pattern: String,
    pub kind: MapperKind,
}

impl MapperRule {
    pub fn new(pattern: impl Into<String>, kind: MapperKind) -> Self {
        Self {
            pattern: pattern.into().to_lowercase(),
            kind,
        }
    }

    fn matches(&self, provider_name: &str) -> bool {
        provider_name
            .to_lowercase()
            .contains(&self.pattern.to_lowercase())
    }
}

/// Request shape for an upstream status lookup
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRequest {
    pub endpoint: String,
    pub action: Option<&'static str>,
    pub payload: Map<String, Value>,
}

pub trait FieldMapper: Send + Sync {
    fn name(&self) -> &'static str;

    /// Submission endpoint, relative to the provider base URL
    fn endpoint(&self) -> &'static str;

    /// Form `action` for submission, if the protocol carries one
    fn submit_action(&self) -> Option<&'static str>;

    fn build_payload(&self, order: &Order, service: &Service) -> Map<String, Value>;

    fn status_request(&self, external_order_id: &str) -> StatusRequest;
}

// ============================================================================
// Mappers
// ============================================================================

pub struct DhruFieldMapper;

impl FieldMapper for DhruFieldMapper {
    fn name(&self) -> &'static str {
        "dhru"
    }

    fn endpoint(&self) -> &'static str {
        "/api"
    }

    fn submit_action(&self) -> Option<&'static str> {
        Some("placeimeiorder")
    }

    fn build_payload(&self, order: &Order, service: &Service) -> Map<String, Value> {
        // Custom fields first so they can never shadow the core keys
        let mut payload = order.custom_fields.clone();
        payload.insert("ID".into(), json!(service.external_service_id));
        if let Some(imei) = &order.imei {
            payload.insert("IMEI".into(), json!(imei));
        }
        if order.quantity > 1 {
            payload.insert("QNT".into(), json!(order.quantity.to_string()));
        }
        payload.insert("REFERENCE".into(), json!(order.id));
        payload
    }

    fn status_request(&self, external_order_id: &str) -> StatusRequest {
        let mut payload = Map::new();
        payload.insert("ID".into(), json!(external_order_id));
        StatusRequest {
            endpoint: self.endpoint().to_string(),
            action: Some("getimeiorder"),
            payload,
        }
    }
}

pub struct GenericFieldMapper;

impl FieldMapper for GenericFieldMapper {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn endpoint(&self) -> &'static str {
        "/orders"
    }

    fn submit_action(&self) -> Option<&'static str> {
        None
    }

    fn build_payload(&self, order: &Order, service: &Service) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("service_id".into(), json!(service.external_service_id));
        payload.insert("reference".into(), json!(order.id));
        payload.insert("imei".into(), json!(order.imei));
        payload.insert("quantity".into(), json!(order.quantity));
        payload.insert("amount".into(), json!(order.amount));
        payload.insert("fields".into(), Value::Object(order.custom_fields.clone()));
        payload
    }

    fn status_request(&self, external_order_id: &str) -> StatusRequest {
        let mut payload = Map::new();
        payload.insert("order_id".into(), json!(external_order_id));
        StatusRequest {
            endpoint: "/orders/status".to_string(),
            action: None,
            payload,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Resolved mapper for one provider
#[derive(Clone)]
pub struct ProviderMapping {
    pub mapper: Arc<dyn FieldMapper>,
    pub protocol: WireProtocol,
    pub endpoint: String,
}

impl std::fmt::Debug for ProviderMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderMapping")
            .field("mapper", &self.mapper.name())
            .field("protocol", &self.protocol)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

pub struct MapperRegistry {
    rules: Vec<MapperRule>,
    dhru: Arc<DhruFieldMapper>,
    generic: Arc<GenericFieldMapper>,
}

impl Default for MapperRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MapperRegistry {
    /// Registry with the built-in name rules
    pub fn new() -> Self {
        Self::with_rules(Vec::new())
    }

    /// Built-in rules followed by `extra` rules
    pub fn with_rules(extra: Vec<MapperRule>) -> Self {
        let mut rules = vec![
            MapperRule::new("dhru", MapperKind::DhruForm),
            MapperRule::new("powergsm", MapperKind::DhruForm),
        ];
        rules.extend(extra);
        Self {
            rules,
            dhru: Arc::new(DhruFieldMapper),
            generic: Arc::new(GenericFieldMapper),
        }
    }

    /// Name-rule lookup. Generic matches default to a JSON body.
    pub fn get_mapper(&self, provider_name: &str) -> Result<ProviderMapping, MapperError> {
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.matches(provider_name))
            .ok_or_else(|| MapperError::UnknownProviderAdapter(provider_name.to_string()))?;

        Ok(match rule.kind {
            MapperKind::DhruForm => self.mapping(WireProtocol::DhruForm),
            MapperKind::Generic => self.mapping(WireProtocol::Json),
        })
    }

    /// Full resolution for a provider record: tag first, then name rules
    pub fn resolve(&self, provider: &ApiProvider) -> Result<ProviderMapping, MapperError> {
        if let Some(protocol) = provider.wire_protocol {
            return Ok(self.mapping(protocol));
        }

        let mut mapping = self.get_mapper(&provider.name)?;
        if mapping.protocol != WireProtocol::DhruForm {
            mapping.protocol = match provider.api_format {
                ApiFormat::Json => WireProtocol::Json,
                ApiFormat::Xml => WireProtocol::Xml,
            };
        }
        Ok(mapping)
    }

    fn mapping(&self, protocol: WireProtocol) -> ProviderMapping {
        let mapper: Arc<dyn FieldMapper> = match protocol {
            WireProtocol::DhruForm => self.dhru.clone(),
            WireProtocol::Json | WireProtocol::Xml => self.generic.clone(),
        };
        ProviderMapping {
            endpoint: mapper.endpoint().to_string(),
            mapper,
            protocol,
        }
    }
}
