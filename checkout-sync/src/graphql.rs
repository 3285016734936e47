//! Storefront GraphQL adapter for [`MetafieldClient`].
//!
//! Request bodies and response parsing are pure functions so they can be
//! tested without a server. The HTTP round trip itself is blocking `ureq`
//! and runs on the blocking pool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use checkout_core::{CartId, CheckoutConfig, EntityId, FieldKey, RemoteMetafield};

use crate::client::{MetafieldClient, OpKind};
use crate::error::ClientError;

const LIST_QUERY: &str = "query CartMetafields($cart: String!, $namespace: String!) { \
site { cart(entityId: $cart) { metafields(namespace: $namespace) { \
edges { node { entityId key value } } } } } }";

const CREATE_MUTATION: &str = "mutation CreateCartMetafield($input: CreateCartMetafieldInput!) { \
cart { createCartMetafield(input: $input) { metafield { entityId key value } \
errors { ... on Error { message } } } } }";

const UPDATE_MUTATION: &str = "mutation UpdateCartMetafield($input: UpdateCartMetafieldInput!) { \
cart { updateCartMetafield(input: $input) { metafield { entityId key value } \
errors { ... on Error { message } } } } }";

const DELETE_MUTATION: &str = "mutation DeleteCartMetafield($input: DeleteCartMetafieldInput!) { \
cart { deleteCartMetafield(input: $input) { deletedMetafieldEntityId \
errors { ... on Error { message } } } } }";

#[derive(Debug, Clone)]
pub struct GraphqlMetafieldClient {
    endpoint: String,
    bearer: String,
    namespace: String,
    agent: ureq::Agent,
}

impl GraphqlMetafieldClient {
    pub fn new(
        endpoint: impl Into<String>,
        bearer: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            bearer: bearer.into(),
            namespace: namespace.into(),
            agent: ureq::AgentBuilder::new().build(),
        }
    }

    pub fn from_config(config: &CheckoutConfig) -> Self {
        Self::new(
            config.graphql_endpoint.clone(),
            config.bearer_token.clone(),
            config.namespace.clone(),
        )
    }

    async fn execute(&self, body: Value) -> Result<Value, ClientError> {
        let agent = self.agent.clone();
        let endpoint = self.endpoint.clone();
        let auth = format!("Bearer {}", self.bearer);
        tokio::task::spawn_blocking(move || {
            let response = agent
                .post(&endpoint)
                .set("Authorization", &auth)
                .set("Content-Type", "application/json")
                .send_json(body)?;
            response
                .into_json::<Value>()
                .map_err(|e| ClientError::Malformed(e.to_string()))
        })
        .await
        .map_err(|e| ClientError::Transport(format!("request task failed: {e}")))?
    }
}

impl From<ureq::Error> for ClientError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, response) => ClientError::Status {
                status,
                body: response.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(transport) => ClientError::Transport(transport.to_string()),
        }
    }
}

#[async_trait]
impl MetafieldClient for GraphqlMetafieldClient {
    async fn list(&self, cart: &CartId) -> Result<Vec<RemoteMetafield>, ClientError> {
        debug!(cart = %cart, "listing cart metafields");
        let response = self.execute(list_request(cart, &self.namespace)).await?;
        parse_list(response)
    }

    async fn create(
        &self,
        cart: &CartId,
        key: FieldKey,
        value: &str,
    ) -> Result<EntityId, ClientError> {
        debug!(cart = %cart, key = %key, "creating cart metafield");
        let response = self
            .execute(create_request(cart, &self.namespace, key, value))
            .await?;
        parse_mutation(OpKind::Create, response)
    }

    async fn update(
        &self,
        cart: &CartId,
        entity: EntityId,
        key: FieldKey,
        value: &str,
    ) -> Result<EntityId, ClientError> {
        debug!(cart = %cart, key = %key, entity = %entity, "updating cart metafield");
        let response = self
            .execute(update_request(cart, &self.namespace, entity, key, value))
            .await?;
        parse_mutation(OpKind::Update, response)
    }

    async fn delete(&self, cart: &CartId, entity: EntityId) -> Result<(), ClientError> {
        debug!(cart = %cart, entity = %entity, "deleting cart metafield");
        let response = self.execute(delete_request(cart, entity)).await?;
        parse_delete(response)
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

pub fn list_request(cart: &CartId, namespace: &str) -> Value {
    json!({
        "query": LIST_QUERY,
        "variables": { "cart": cart.0, "namespace": namespace },
    })
}

pub fn create_request(cart: &CartId, namespace: &str, key: FieldKey, value: &str) -> Value {
    json!({
        "query": CREATE_MUTATION,
        "variables": {
            "input": {
                "cartEntityId": cart.0,
                "data": {
                    "namespace": namespace,
                    "key": key.as_str(),
                    "value": value,
                    "permissionSet": "WRITE_AND_SF_ACCESS",
                },
            },
        },
    })
}

pub fn update_request(
    cart: &CartId,
    namespace: &str,
    entity: EntityId,
    key: FieldKey,
    value: &str,
) -> Value {
    json!({
        "query": UPDATE_MUTATION,
        "variables": {
            "input": {
                "cartEntityId": cart.0,
                "metafieldEntityId": entity.0,
                "data": {
                    "namespace": namespace,
                    "key": key.as_str(),
                    "value": value,
                },
            },
        },
    })
}

pub fn delete_request(cart: &CartId, entity: EntityId) -> Value {
    json!({
        "query": DELETE_MUTATION,
        "variables": {
            "input": {
                "cartEntityId": cart.0,
                "metafieldEntityId": entity.0,
            },
        },
    })
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldNode {
    #[serde(default)]
    entity_id: u64,
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct Edge {
    node: MetafieldNode,
}

#[derive(Debug, Deserialize)]
struct Connection {
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationPayload {
    metafield: Option<MetafieldNode>,
    #[serde(default)]
    deleted_metafield_entity_id: Option<u64>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

fn unwrap_envelope(operation: &'static str, response: Value) -> Result<Value, ClientError> {
    let envelope: Envelope =
        serde_json::from_value(response).map_err(|e| ClientError::Malformed(e.to_string()))?;
    if !envelope.errors.is_empty() {
        return Err(ClientError::Rejected {
            operation,
            message: join_messages(&envelope.errors),
        });
    }
    envelope
        .data
        .ok_or_else(|| ClientError::Malformed("response has no data".to_string()))
}

fn join_messages(errors: &[GraphqlError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Records under the namespace. Records with a zero entity id are dropped.
pub fn parse_list(response: Value) -> Result<Vec<RemoteMetafield>, ClientError> {
    let data = unwrap_envelope("list", response)?;
    let metafields = data.pointer("/site/cart/metafields").cloned();
    let Some(metafields) = metafields.filter(|v| !v.is_null()) else {
        // No cart yet means no records.
        return Ok(Vec::new());
    };
    let connection: Connection =
        serde_json::from_value(metafields).map_err(|e| ClientError::Malformed(e.to_string()))?;
    Ok(connection
        .edges
        .into_iter()
        .filter_map(|edge| {
            let node = edge.node;
            EntityId::from_raw(node.entity_id).map(|entity_id| RemoteMetafield {
                entity_id,
                key: node.key,
                value: node.value,
            })
        })
        .collect())
}

fn mutation_payload(kind: OpKind, response: Value) -> Result<MutationPayload, ClientError> {
    let field = match kind {
        OpKind::Create => "createCartMetafield",
        OpKind::Update => "updateCartMetafield",
        OpKind::Delete => "deleteCartMetafield",
    };
    let data = unwrap_envelope(kind.as_str(), response)?;
    let payload = data
        .get("cart")
        .and_then(|cart| cart.get(field))
        .cloned()
        .ok_or_else(|| ClientError::Malformed(format!("response has no cart.{field}")))?;
    let payload: MutationPayload =
        serde_json::from_value(payload).map_err(|e| ClientError::Malformed(e.to_string()))?;
    if !payload.errors.is_empty() {
        return Err(ClientError::Rejected {
            operation: kind.as_str(),
            message: join_messages(&payload.errors),
        });
    }
    Ok(payload)
}

/// Entity id of the created or updated record. A missing or zero id is a
/// rejection.
pub fn parse_mutation(kind: OpKind, response: Value) -> Result<EntityId, ClientError> {
    let payload = mutation_payload(kind, response)?;
    payload
        .metafield
        .and_then(|node| EntityId::from_raw(node.entity_id))
        .ok_or_else(|| ClientError::Rejected {
            operation: kind.as_str(),
            message: "store returned no metafield id".to_string(),
        })
}

pub fn parse_delete(response: Value) -> Result<(), ClientError> {
    let payload = mutation_payload(OpKind::Delete, response)?;
    match payload.deleted_metafield_entity_id.and_then(EntityId::from_raw) {
        Some(_) => Ok(()),
        None => Err(ClientError::Rejected {
            operation: OpKind::Delete.as_str(),
            message: "store did not confirm deletion".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_carries_namespace_key_and_value() {
        let body = create_request(&CartId::from("abc"), "bc_storefront", FieldKey::PoNumber, "NA");
        let data = &body["variables"]["input"]["data"];
        assert_eq!(body["variables"]["input"]["cartEntityId"], "abc");
        assert_eq!(data["namespace"], "bc_storefront");
        assert_eq!(data["key"], "po_number");
        assert_eq!(data["value"], "NA");
        assert!(body["query"].as_str().unwrap().contains("createCartMetafield"));
    }

    #[test]
    fn update_and_delete_requests_target_entity() {
        let cart = CartId::from("abc");
        let update = update_request(&cart, "ns", EntityId(41), FieldKey::Bottler, "Acme");
        assert_eq!(update["variables"]["input"]["metafieldEntityId"], 41);
        let delete = delete_request(&cart, EntityId(42));
        assert_eq!(delete["variables"]["input"]["metafieldEntityId"], 42);
    }

    #[test]
    fn from_config_uses_configured_namespace() {
        let mut config = CheckoutConfig::new("https://shop.test/graphql", "tok");
        config.namespace = "wholesale".to_string();
        let client = GraphqlMetafieldClient::from_config(&config);
        assert_eq!(client.namespace, "wholesale");
        assert_eq!(client.endpoint, "https://shop.test/graphql");
    }

    #[test]
    fn list_parses_edges_and_skips_zero_ids() {
        let response = json!({
            "data": { "site": { "cart": { "metafields": { "edges": [
                { "node": { "entityId": 7, "key": "bottler", "value": "Acme" } },
                { "node": { "entityId": 0, "key": "po_number", "value": "x" } },
            ] } } } }
        });
        let records = parse_list(response).expect("parse");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_id, EntityId(7));
        assert_eq!(records[0].key, "bottler");
    }

    #[test]
    fn list_without_cart_is_empty() {
        let response = json!({ "data": { "site": { "cart": null } } });
        assert!(parse_list(response).expect("parse").is_empty());
    }

    #[test]
    fn mutation_with_zero_id_is_rejected() {
        let response = json!({
            "data": { "cart": { "createCartMetafield": {
                "metafield": { "entityId": 0, "key": "bottler", "value": "Acme" },
                "errors": []
            } } }
        });
        let err = parse_mutation(OpKind::Create, response).unwrap_err();
        assert!(matches!(err, ClientError::Rejected { operation: "create", .. }));
    }

    #[test]
    fn mutation_returns_entity_id() {
        let response = json!({
            "data": { "cart": { "updateCartMetafield": {
                "metafield": { "entityId": 12, "key": "bottler", "value": "Acme" },
                "errors": []
            } } }
        });
        assert_eq!(
            parse_mutation(OpKind::Update, response).expect("parse"),
            EntityId(12)
        );
    }

    #[test]
    fn top_level_errors_become_rejections() {
        let response = json!({ "data": null, "errors": [{ "message": "bad token" }] });
        let err = parse_delete(response).unwrap_err();
        assert_eq!(
            err,
            ClientError::Rejected {
                operation: "delete",
                message: "bad token".to_string()
            }
        );
    }

    #[test]
    fn payload_errors_become_rejections() {
        let response = json!({
            "data": { "cart": { "deleteCartMetafield": {
                "deletedMetafieldEntityId": null,
                "errors": [{ "message": "not found" }]
            } } }
        });
        assert!(matches!(
            parse_delete(response),
            Err(ClientError::Rejected { operation: "delete", .. })
        ));
    }

    #[test]
    fn shape_mismatch_is_malformed() {
        let response = json!({ "data": { "cart": {} } });
        assert!(matches!(
            parse_mutation(OpKind::Create, response),
            Err(ClientError::Malformed(_))
        ));
    }
}
