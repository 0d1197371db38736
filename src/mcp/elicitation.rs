//! Mid-call elicitation: schema checks, handler seam, and wire mapping
//!
//! A server may send `elicitation/create` while one of our `tools/call`
//! requests is in flight, asking the user for a small flat form. The
//! requested schema is restricted to primitive fields (`string`, `number`,
//! `integer`, `boolean`, plus string enums). Anything richer is rejected
//! before the handler is consulted.
//!
//! [`coordinate`] runs on its own task per request (see
//! [`crate::mcp::client`]), so waiting on a human suspends only the related
//! call; the session keeps serving everything else.

use std::future::Future;

use serde_json::{Map, Value};

use crate::error::{ConduitError, Result};
use crate::mcp::client::{BoxFuture, JsonRpcClient};
use crate::mcp::types::{
    ElicitationAction, ElicitationCreateParams, ElicitationResult, JsonRpcError, INVALID_PARAMS,
    METHOD_TOOLS_CALL,
};

/// Primitive type of one form field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
}

impl FieldType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(FieldType::String),
            "number" => Some(FieldType::Number),
            "integer" => Some(FieldType::Integer),
            "boolean" => Some(FieldType::Boolean),
            _ => None,
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
        };
        f.write_str(s)
    }
}

/// One field of an elicitation form.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Allowed values for a string enum.
    pub choices: Option<Vec<String>>,
    pub required: bool,
    pub min_length: Option<u64>,
    pub max_length: Option<u64>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub default: Option<Value>,
}

/// A validated, flat elicitation schema.
///
/// # Examples
///
/// ```
/// use conduit::mcp::elicitation::ElicitationSchema;
/// use serde_json::json;
///
/// let schema = ElicitationSchema::parse(&json!({
///     "type": "object",
///     "properties": { "name": { "type": "string" } },
///     "required": ["name"]
/// })).unwrap();
/// assert_eq!(schema.fields().len(), 1);
///
/// let nested = json!({
///     "type": "object",
///     "properties": { "address": { "type": "object" } }
/// });
/// assert!(ElicitationSchema::parse(&nested).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ElicitationSchema {
    fields: Vec<SchemaField>,
}

fn schema_error(message: String) -> anyhow::Error {
    ConduitError::Schema(message).into()
}

impl ElicitationSchema {
    /// Parse and check a `requestedSchema`.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Schema`] naming the offending field when a
    /// property is nested, an array, untyped, or otherwise not primitive.
    pub fn parse(schema: &Value) -> Result<Self> {
        let Some(root) = schema.as_object() else {
            return Err(schema_error("requested schema must be a JSON object".to_string()));
        };
        if let Some(t) = root.get("type") {
            if t != "object" {
                return Err(schema_error(format!(
                    "requested schema must have type 'object', found {t}"
                )));
            }
        }

        let required: Vec<String> = match root.get("required") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| schema_error(format!("'required' entry {v} is not a string")))
                })
                .collect::<Result<_>>()?,
            Some(other) => {
                return Err(schema_error(format!("'required' must be an array, found {other}")))
            }
        };

        let empty = Map::new();
        let properties = match root.get("properties") {
            None => &empty,
            Some(Value::Object(p)) => p,
            Some(other) => {
                return Err(schema_error(format!(
                    "'properties' must be an object, found {other}"
                )))
            }
        };

        let mut fields = Vec::with_capacity(properties.len());
        for (name, property) in properties {
            fields.push(parse_field(name, property, required.contains(name))?);
        }
        if let Some(missing) = required.iter().find(|r| !properties.contains_key(*r)) {
            return Err(schema_error(format!(
                "required field '{missing}' is not declared in properties"
            )));
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check accepted form data against the schema.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Schema`] for an unknown field, a type or
    /// constraint mismatch, or a missing required field.
    pub fn validate(&self, content: &Map<String, Value>) -> Result<()> {
        for (name, value) in content {
            let Some(field) = self.field(name) else {
                return Err(schema_error(format!("field '{name}' is not in the requested schema")));
            };
            check_value(field, value)?;
        }
        if let Some(missing) = self
            .fields
            .iter()
            .find(|f| f.required && !content.contains_key(&f.name))
        {
            return Err(schema_error(format!("required field '{}' is missing", missing.name)));
        }
        Ok(())
    }
}

fn parse_field(name: &str, property: &Value, required: bool) -> Result<SchemaField> {
    let Some(property) = property.as_object() else {
        return Err(schema_error(format!("field '{name}' must be a schema object")));
    };
    let field_type = match property.get("type") {
        Some(Value::String(t)) => FieldType::parse(t).ok_or_else(|| {
            schema_error(format!(
                "field '{name}' has unsupported type '{t}'; only string, number, integer and boolean are allowed"
            ))
        })?,
        Some(other) => {
            return Err(schema_error(format!("field '{name}' has non-primitive type {other}")))
        }
        None => return Err(schema_error(format!("field '{name}' has no type"))),
    };
    if property.contains_key("properties") || property.contains_key("items") {
        return Err(schema_error(format!("field '{name}' must not nest other fields")));
    }

    let choices = match property.get("enum") {
        None => None,
        Some(Value::Array(values)) if field_type == FieldType::String => Some(
            values
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        schema_error(format!("field '{name}' enum values must be strings"))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        ),
        Some(_) => {
            return Err(schema_error(format!(
                "field '{name}' may only declare an enum of strings"
            )))
        }
    };

    let text = |key: &str| property.get(key).and_then(Value::as_str).map(str::to_string);
    Ok(SchemaField {
        name: name.to_string(),
        field_type,
        title: text("title"),
        description: text("description"),
        choices,
        required,
        min_length: property.get("minLength").and_then(Value::as_u64),
        max_length: property.get("maxLength").and_then(Value::as_u64),
        minimum: property.get("minimum").and_then(Value::as_f64),
        maximum: property.get("maximum").and_then(Value::as_f64),
        default: property.get("default").cloned(),
    })
}

fn check_value(field: &SchemaField, value: &Value) -> Result<()> {
    let name = &field.name;
    if !field.field_type.accepts(value) {
        return Err(schema_error(format!(
            "field '{name}' expects {}, got {value}",
            field.field_type
        )));
    }
    if let Some(s) = value.as_str() {
        if let Some(choices) = &field.choices {
            if !choices.iter().any(|c| c == s) {
                return Err(schema_error(format!("field '{name}' must be one of {choices:?}")));
            }
        }
        let len = s.chars().count() as u64;
        if field.min_length.is_some_and(|min| len < min)
            || field.max_length.is_some_and(|max| len > max)
        {
            return Err(schema_error(format!("field '{name}' has invalid length {len}")));
        }
    }
    if let Some(n) = value.as_f64() {
        if field.minimum.is_some_and(|min| n < min) || field.maximum.is_some_and(|max| n > max) {
            return Err(schema_error(format!("field '{name}' value {n} is out of range")));
        }
    }
    Ok(())
}

/// One pending question from a server, as presented to a handler.
#[derive(Debug, Clone)]
pub struct ElicitationExchange {
    pub server: String,
    pub message: String,
    pub schema: ElicitationSchema,
    /// Id of the `tools/call` this question belongs to, when known.
    pub related_request: Option<u64>,
}

/// The user's answer to an [`ElicitationExchange`].
#[derive(Debug, Clone, PartialEq)]
pub enum ElicitationOutcome {
    Accepted(Map<String, Value>),
    Declined,
    Cancelled,
}

impl ElicitationOutcome {
    pub fn action(&self) -> ElicitationAction {
        match self {
            ElicitationOutcome::Accepted(_) => ElicitationAction::Accept,
            ElicitationOutcome::Declined => ElicitationAction::Decline,
            ElicitationOutcome::Cancelled => ElicitationAction::Cancel,
        }
    }
}

impl From<ElicitationOutcome> for ElicitationResult {
    fn from(outcome: ElicitationOutcome) -> Self {
        let action = outcome.action();
        let content = match outcome {
            ElicitationOutcome::Accepted(data) => Some(data),
            _ => None,
        };
        ElicitationResult { action, content }
    }
}

/// Presents elicitations to a user and collects the answer.
///
/// Any `Fn(ElicitationExchange) -> impl Future<Output = Result<ElicitationOutcome>>`
/// closure is a handler.
///
/// # Examples
///
/// ```
/// use conduit::mcp::elicitation::{ElicitationExchange, ElicitationHandler, ElicitationOutcome};
/// use std::sync::Arc;
///
/// let handler: Arc<dyn ElicitationHandler> = Arc::new(|_ex: ElicitationExchange| async {
///     Ok::<_, anyhow::Error>(ElicitationOutcome::Declined)
/// });
/// ```
pub trait ElicitationHandler: Send + Sync {
    /// Answer one exchange. An error is reported to the server as `cancel`.
    fn elicit<'a>(&'a self, exchange: ElicitationExchange) -> BoxFuture<'a, Result<ElicitationOutcome>>;
}

impl<F, Fut> ElicitationHandler for F
where
    F: Fn(ElicitationExchange) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ElicitationOutcome>> + Send + 'static,
{
    fn elicit<'a>(&'a self, exchange: ElicitationExchange) -> BoxFuture<'a, Result<ElicitationOutcome>> {
        Box::pin(self(exchange))
    }
}

/// Handler that declines every question. Used by non-interactive frontends.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDecline;

impl ElicitationHandler for AutoDecline {
    fn elicit<'a>(&'a self, exchange: ElicitationExchange) -> BoxFuture<'a, Result<ElicitationOutcome>> {
        Box::pin(async move {
            tracing::info!(server = %exchange.server, message = %exchange.message, "declining elicitation");
            Ok(ElicitationOutcome::Declined)
        })
    }
}

/// Which outstanding call an elicitation belongs to.
///
/// `_meta.relatedRequestId` wins; otherwise the sole in-flight `tools/call`.
fn related_request(params: &ElicitationCreateParams, client: &JsonRpcClient) -> Option<u64> {
    let from_meta = params
        .meta
        .as_ref()
        .and_then(|m| m.get("relatedRequestId"))
        .and_then(|id| id.as_u64().or_else(|| id.as_str().and_then(|s| s.parse().ok())));
    if from_meta.is_some() {
        return from_meta;
    }
    match client.in_flight(METHOD_TOOLS_CALL).as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

/// Serve one `elicitation/create` request end to end.
///
/// Returns the reply for the server. On a schema violation the related call
/// (if identified) fails with [`ConduitError::Schema`].
pub(crate) async fn coordinate(
    client: &JsonRpcClient,
    handler: &dyn ElicitationHandler,
    raw_params: Value,
) -> std::result::Result<Value, JsonRpcError> {
    let server = client.server().to_string();
    let params: ElicitationCreateParams = serde_json::from_value(raw_params)
        .map_err(|e| JsonRpcError::new(INVALID_PARAMS, format!("invalid elicitation params: {e}")))?;

    if let Some(mode) = params.mode.as_deref().filter(|m| *m != "form") {
        return Err(JsonRpcError::new(
            INVALID_PARAMS,
            format!("unsupported elicitation mode '{mode}'"),
        ));
    }

    let related = related_request(&params, client);
    let schema = match ElicitationSchema::parse(&params.requested_schema) {
        Ok(schema) => schema,
        Err(e) => {
            let message = e.to_string();
            tracing::warn!(server = %server, error = %message, "rejecting elicitation schema");
            if let Some(id) = related {
                client.fail_request(id, ConduitError::Schema(schema_message(&e)));
            }
            return Err(JsonRpcError::new(INVALID_PARAMS, message));
        }
    };

    let exchange = ElicitationExchange {
        server: server.clone(),
        message: params.message,
        schema: schema.clone(),
        related_request: related,
    };

    let outcome = match handler.elicit(exchange).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(server = %server, error = %e, "elicitation handler failed; cancelling");
            ElicitationOutcome::Cancelled
        }
    };

    let outcome = match outcome {
        ElicitationOutcome::Accepted(data) => match schema.validate(&data) {
            Ok(()) => ElicitationOutcome::Accepted(data),
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "accepted data violates schema; cancelling");
                if let Some(id) = related {
                    client.fail_request(id, ConduitError::Schema(schema_message(&e)));
                }
                ElicitationOutcome::Cancelled
            }
        },
        other => other,
    };

    tracing::debug!(server = %server, action = ?outcome.action(), "elicitation answered");
    serde_json::to_value(ElicitationResult::from(outcome))
        .map_err(|e| JsonRpcError::new(crate::mcp::types::INTERNAL_ERROR, e.to_string()))
}

/// Inner message of a Schema error, without the Display prefix.
fn schema_message(err: &anyhow::Error) -> String {
    match crate::error::classify(err) {
        Some(ConduitError::Schema(m)) => m.clone(),
        _ => err.to_string(),
    }
}
