// Outbound collaborators: description generation and payments

pub mod llm;
pub mod paypal;

use thiserror::Error;

pub use llm::{build_prompt, DescriptionGenerator, DescriptionLength, DescriptionRequest, InputMode, OpenAiGenerator};
pub use paypal::{
    CaptureResult, CreatedSubscription, PayPalGateway, PaymentGateway, SubscriptionStatus,
};

#[derive(Debug, Clone, Error)]
pub enum ExternalError {
    #[error("description generation failed: {0}")]
    Llm(String),

    #[error("payment processor error: {0}")]
    Payment(String),

    #[error("{0} is not configured")]
    NotConfigured(String),
}
