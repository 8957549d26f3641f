//! LLM plumbing: transports, the structured-output gateway, schemas, and
//! cost accounting.

pub mod gateway;
pub mod schema;
pub mod types;

pub use gateway::{AnthropicTransport, LlmGateway, LlmTransport, PromptTemplate, TransportConfig};
pub use schema::{FieldSpec, FieldType, ResponseSchema, ValidationError};
pub use types::{
    CompletionRequest, CompletionResponse, CostLedger, ModelSpec, PurposeCosts,
    StructuredResponse, TokenUsage,
};
