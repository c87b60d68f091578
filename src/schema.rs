//! Schema validation hook for publishes.
//!
//! Schema validation is a boolean predicate consulted before a publish is
//! admitted. This module turns that predicate into a real trait with a
//! default no-op implementation, so `MessageQueue::publish` has a concrete
//! extension point instead of a TODO. AVRO/Protocol-Buffer body validation
//! itself is not implemented.

use crate::error::{Result, Status};
use crate::message::PublishMessage;

/// The wire format a [`Schema`] validates against.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchemaType {
    Avro,
    ProtocolBuffer,
}

/// A named schema handle, returned by the client façade's `schema(id)`
/// factory.
#[derive(Clone, Debug)]
pub struct Schema {
    pub name: String,
    pub schema_type: SchemaType,
    pub definition: String,
}

impl Schema {
    pub fn new(name: impl Into<String>, schema_type: SchemaType, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema_type,
            definition: definition.into(),
        }
    }
}

/// Consulted by `MessageQueue::publish` as a boolean predicate before a
/// batch is admitted.
pub trait SchemaValidator: Send + Sync {
    fn validate_message(&self, draft: &PublishMessage) -> Result<()>;
}

/// The default validator: every message is admitted, matching a topic with
/// no `schemaSettings` configured.
pub struct NoSchema;

impl SchemaValidator for NoSchema {
    fn validate_message(&self, _draft: &PublishMessage) -> Result<()> {
        Ok(())
    }
}

/// A validator bound to one schema; body validation for AVRO and
/// Protocol-Buffer formats is not implemented.
pub struct BoundSchemaValidator {
    schema: Schema,
}

impl BoundSchemaValidator {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }
}

impl SchemaValidator for BoundSchemaValidator {
    fn validate_message(&self, _draft: &PublishMessage) -> Result<()> {
        Err(Status::unimplemented(format!(
            "{:?} schema body validation is not implemented (schema {:?})",
            self.schema.schema_type, self.schema.name
        )))
    }
}
