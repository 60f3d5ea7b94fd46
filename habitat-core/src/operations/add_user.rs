use crate::controller::NodeController;
use crate::error::{HabitatError, Result};
use crate::node::state::User;
use crate::node::transitions::AddUserTransition;

#[derive(Clone)]
pub struct AddUserOperation {
    controller: NodeController,
}

#[derive(Debug, Clone, Default)]
pub struct AddUserOperationRequest {
    pub username: String,
    pub certificate: Option<String>,
    pub atproto_did: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AddUserOperationResult {
    pub user: User,
}

impl AddUserOperation {
    pub fn new(controller: NodeController) -> Self {
        Self { controller }
    }

    pub async fn run(&self, request: AddUserOperationRequest) -> Result<AddUserOperationResult> {
        let AddUserOperationRequest {
            username,
            certificate,
            atproto_did,
        } = request;

        let state = self
            .controller
            .propose(vec![Box::new(AddUserTransition {
                user: User {
                    id: String::new(),
                    username: username.clone(),
                    certificate: certificate.unwrap_or_default(),
                    atproto_did,
                },
            })])
            .await?;

        let user = state.user_by_name(&username).cloned().ok_or_else(|| {
            HabitatError::Internal(format!("user {} missing after commit", username))
        })?;
        tracing::info!("Added user {} ({})", user.username, user.id);
        Ok(AddUserOperationResult { user })
    }
}
