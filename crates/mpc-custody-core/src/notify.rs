//! Approver notification seam
//!
//! The orchestrator informs approvers through this trait; the real
//! dispatcher (email, push, node RPC) lives with an external collaborator.

use crate::types::{Approver, SigningRequest};
use crate::Result;
use async_trait::async_trait;
use tracing::info;

/// Dispatches approval invitations for a new signing request
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn notify_approvers(
        &self,
        request: &SigningRequest,
        approvers: &[Approver],
    ) -> Result<()>;
}

/// Default notifier that only logs the invitation
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl ApprovalNotifier for LogNotifier {
    async fn notify_approvers(
        &self,
        request: &SigningRequest,
        approvers: &[Approver],
    ) -> Result<()> {
        for approver in approvers {
            info!(request_id = %request.id, approver = %approver, "approval requested");
        }
        Ok(())
    }
}
