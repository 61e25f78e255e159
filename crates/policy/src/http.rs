//! SpiceDB HTTP gateway client.
//!
//! Talks JSON to the gateway's `/v1/...` endpoints with a bearer token. Every
//! request carries the configured timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::client::PolicyEngine;
use crate::error::{PolicyEngineError, PolicyResult};
use crate::relationship::{ObjectRef, Relationship, SubjectRef};
use crate::schema::SchemaDefinition;

const OPERATION_TOUCH: &str = "OPERATION_TOUCH";
const OPERATION_DELETE: &str = "OPERATION_DELETE";
const HAS_PERMISSION: &str = "PERMISSIONSHIP_HAS_PERMISSION";

#[derive(Debug, Clone)]
pub struct SpiceDbHttpClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadSchemaResponse {
    schema_text: String,
}

#[derive(Debug, Deserialize)]
struct CheckPermissionResponse {
    permissionship: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ObjectReference<'a> {
    object_type: &'a str,
    object_id: &'a str,
}

impl<'a> From<&'a ObjectRef> for ObjectReference<'a> {
    fn from(obj: &'a ObjectRef) -> Self {
        Self {
            object_type: &obj.object_type,
            object_id: &obj.object_id,
        }
    }
}

fn relationship_json(rel: &Relationship) -> Value {
    json!({
        "resource": ObjectReference::from(&rel.resource),
        "relation": rel.relation,
        "subject": { "object": ObjectReference::from(&rel.subject) },
    })
}

fn write_body(operation: &str, relationships: &[Relationship]) -> Value {
    let updates: Vec<Value> = relationships
        .iter()
        .map(|rel| json!({ "operation": operation, "relationship": relationship_json(rel) }))
        .collect();
    json!({ "updates": updates })
}

fn subject_filter_body(resource_type: &str, subject: &SubjectRef) -> Value {
    json!({
        "relationshipFilter": {
            "resourceType": resource_type,
            "optionalSubjectFilter": {
                "subjectType": subject.object_type,
                "optionalSubjectId": subject.object_id,
            },
        },
    })
}

fn check_body(subject: &SubjectRef, permission: &str, resource: &ObjectRef) -> Value {
    json!({
        "consistency": { "fullyConsistent": true },
        "resource": ObjectReference::from(resource),
        "permission": permission,
        "subject": { "object": ObjectReference::from(subject) },
    })
}

impl SpiceDbHttpClient {
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> PolicyResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PolicyEngineError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
            timeout,
        })
    }

    async fn post(&self, path: &str, body: &Value) -> PolicyResult<Value> {
        let url = format!("{}{}", self.endpoint, path);
        debug!(%url, "policy engine request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PolicyEngineError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| self.map_reqwest_error(e))
    }

    fn map_reqwest_error(&self, err: reqwest::Error) -> PolicyEngineError {
        if err.is_timeout() {
            PolicyEngineError::Timeout(self.timeout)
        } else if err.is_decode() {
            PolicyEngineError::Decode(err.to_string())
        } else {
            PolicyEngineError::Transport(err.to_string())
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> PolicyResult<T> {
    serde_json::from_value(value).map_err(|e| PolicyEngineError::Decode(e.to_string()))
}

#[async_trait]
impl PolicyEngine for SpiceDbHttpClient {
    #[instrument(skip(self, schema), fields(namespace = %schema.namespace), err)]
    async fn update_schema(&self, schema: &SchemaDefinition) -> PolicyResult<()> {
        self.post("/v1/schema/write", &json!({ "schema": schema.render() }))
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn read_schema(&self) -> PolicyResult<String> {
        let value = self.post("/v1/schema/read", &json!({})).await?;
        Ok(decode::<ReadSchemaResponse>(value)?.schema_text)
    }

    #[instrument(skip(self, relationships), fields(count = relationships.len()), err)]
    async fn create_relationships(&self, relationships: &[Relationship]) -> PolicyResult<()> {
        if relationships.is_empty() {
            return Ok(());
        }
        self.post(
            "/v1/relationships/write",
            &write_body(OPERATION_TOUCH, relationships),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, relationships), fields(count = relationships.len()), err)]
    async fn delete_relationships(&self, relationships: &[Relationship]) -> PolicyResult<()> {
        if relationships.is_empty() {
            return Ok(());
        }
        self.post(
            "/v1/relationships/write",
            &write_body(OPERATION_DELETE, relationships),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, subject), fields(subject = %subject), err)]
    async fn delete_subject_relationships(
        &self,
        resource_type: &str,
        subject: &SubjectRef,
    ) -> PolicyResult<()> {
        self.post(
            "/v1/relationships/delete",
            &subject_filter_body(resource_type, subject),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, subject, resource), fields(subject = %subject, resource = %resource), err)]
    async fn check_permission(
        &self,
        subject: &SubjectRef,
        permission: &str,
        resource: &ObjectRef,
    ) -> PolicyResult<bool> {
        let value = self
            .post(
                "/v1/permissions/check",
                &check_body(subject, permission, resource),
            )
            .await?;
        Ok(decode::<CheckPermissionResponse>(value)?.permissionship == HAS_PERMISSION)
    }
}
