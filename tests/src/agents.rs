//! Scripted agents with deterministic behavior.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use morf_kernel::agent::{AgentKind, AgentRequest, AgentResponse, ConversionAgent};
use morf_kernel::error::{AgentResult, InvocationError};

/// Succeeds immediately, echoing the step id and request payload.
pub struct EchoAgent {
    kind: AgentKind,
}

impl EchoAgent {
    pub fn new(kind: AgentKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl ConversionAgent for EchoAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, request: AgentRequest) -> AgentResult<AgentResponse> {
        Ok(AgentResponse::completed(serde_json::json!({
            "step": request.step_id,
            "echo": request.payload,
        })))
    }
}

/// Fails the first `fail_first` calls, then succeeds. Failures are
/// transient (`Unavailable`) unless built with [`FlakyAgent::permanent`],
/// in which case every call fails with `AgentFailed`.
pub struct FlakyAgent {
    kind: AgentKind,
    fail_first: usize,
    permanent: bool,
    calls: AtomicUsize,
}

impl FlakyAgent {
    pub fn new(kind: AgentKind, fail_first: usize) -> Self {
        Self {
            kind,
            fail_first,
            permanent: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails every call with a non-retryable error.
    pub fn permanent(kind: AgentKind) -> Self {
        Self {
            kind,
            fail_first: usize::MAX,
            permanent: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Total invocation attempts observed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversionAgent for FlakyAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn name(&self) -> &str {
        "flaky"
    }

    async fn invoke(&self, request: AgentRequest) -> AgentResult<AgentResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.permanent {
            return Err(InvocationError::AgentFailed {
                message: "scripted permanent failure".into(),
            });
        }
        if call < self.fail_first {
            return Err(InvocationError::Unavailable {
                message: format!("scripted transient failure {}", call + 1),
            });
        }
        Ok(AgentResponse::completed(serde_json::json!({
            "step": request.step_id,
            "attempts_used": call + 1,
        })))
    }
}

/// Asks its question until the request carries user input, then completes
/// with the answer folded into the output.
pub struct AskingAgent {
    kind: AgentKind,
    prompt: String,
    calls: AtomicUsize,
}

impl AskingAgent {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self::with_kind(AgentKind::MetadataQuestioner, prompt)
    }

    /// An asking agent registered under an arbitrary kind, for exercising
    /// input requests from steps that are not allowed to make them.
    pub fn with_kind(kind: AgentKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversionAgent for AskingAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn name(&self) -> &str {
        "asking"
    }

    async fn invoke(&self, request: AgentRequest) -> AgentResult<AgentResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match request.user_input {
            Some(answer) => Ok(AgentResponse::completed(serde_json::json!({
                "step": request.step_id,
                "metadata": answer,
            }))),
            None => Ok(AgentResponse::request_input(self.prompt.clone())),
        }
    }
}

/// Sleeps for a fixed delay before succeeding; pairs with short timeouts.
pub struct SlowAgent {
    kind: AgentKind,
    delay: Duration,
}

impl SlowAgent {
    pub fn new(kind: AgentKind, delay: Duration) -> Self {
        Self { kind, delay }
    }
}

#[async_trait]
impl ConversionAgent for SlowAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn name(&self) -> &str {
        "slow"
    }

    async fn invoke(&self, request: AgentRequest) -> AgentResult<AgentResponse> {
        tokio::time::sleep(self.delay).await;
        Ok(AgentResponse::completed(serde_json::json!({
            "step": request.step_id,
        })))
    }
}
