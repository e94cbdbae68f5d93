use crate::model::SessionContext;

/// Collaborator-owned workflow object that carries a contract context.
pub trait ContractWorkflow {
    /// Installs the context restored from storage.
    fn attach_context(&mut self, context: SessionContext);

    fn context(&self) -> Option<&SessionContext>;
}

/// Rebuilds workflow objects from the `contract_template` reference stored with a session.
pub trait WorkflowFactory: Send + Sync {
    type Workflow: ContractWorkflow;

    /// Returns `None` when the template is unknown to this factory.
    fn reconstruct(&self, contract_template: &str) -> Option<Self::Workflow>;
}
