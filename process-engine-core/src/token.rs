use crate::context::ProcessEngineContext;
use crate::error::{EngineError, Result};
use crate::query::QueryOptions;
use crate::store::{Mutation, WorkUnit};
use crate::types::*;
use tracing::debug;

/// Token ledger. Counts the active branches of every scope; each call is
/// its own atomic unit. The engine itself folds token changes into the work
/// unit of the transition that causes them.
pub struct TokenService {
    ctx: ProcessEngineContext,
}

impl TokenService {
    pub fn new(ctx: ProcessEngineContext) -> Self {
        Self { ctx }
    }

    pub async fn create_token(
        &self,
        process_instance_id: InstanceId,
        ref_id: RefId,
        parent_ref_id: Option<RefId>,
    ) -> Result<Token> {
        self.create_tokens(process_instance_id, ref_id, parent_ref_id, 1)
            .await?
            .pop()
            .ok_or_else(|| EngineError::creation("token", "no token created"))
    }

    pub async fn create_tokens(
        &self,
        process_instance_id: InstanceId,
        ref_id: RefId,
        parent_ref_id: Option<RefId>,
        count: u32,
    ) -> Result<Vec<Token>> {
        let mut unit = WorkUnit::new();
        unit.create_tokens(process_instance_id, ref_id, parent_ref_id, count);
        let receipt = self.ctx.store.commit(unit).await?;
        debug!(process_instance_id, ref_id, count, "tokens created");
        Ok(receipt.created_tokens)
    }

    /// Fails with a modification error, deleting nothing, when fewer than
    /// `count` tokens live in the scope.
    pub async fn delete_tokens(
        &self,
        process_instance_id: InstanceId,
        ref_id: RefId,
        count: u32,
    ) -> Result<u64> {
        let mut unit = WorkUnit::new();
        unit.delete_tokens(process_instance_id, ref_id, count);
        let receipt = self.ctx.store.commit(unit).await?;
        Ok(receipt.remaining(ref_id).unwrap_or(0))
    }

    pub async fn delete_token(&self, token: &Token) -> Result<()> {
        let mut unit = WorkUnit::new();
        unit.push(Mutation::DeleteToken(token.id)).event(
            token.process_instance_id,
            crate::events::EngineEvent::TokensDeleted {
                ref_id: token.ref_id,
                count: 1,
            },
        );
        self.ctx.store.commit(unit).await?;
        Ok(())
    }

    /// Live tokens of the whole process instance.
    pub async fn get_number_of_tokens(&self, process_instance_id: InstanceId) -> Result<u64> {
        self.ctx.store.count_tokens(process_instance_id, None).await
    }

    /// Live tokens of one scope.
    pub async fn get_number_of_tokens_in_scope(
        &self,
        process_instance_id: InstanceId,
        ref_id: RefId,
    ) -> Result<u64> {
        self.ctx
            .store
            .count_tokens(process_instance_id, Some(ref_id))
            .await
    }

    pub async fn delete_all_tokens_of_process(&self, process_instance_id: InstanceId) -> Result<()> {
        let mut unit = WorkUnit::new();
        unit.push(Mutation::DeleteAllTokens(Some(process_instance_id)));
        self.ctx.store.commit(unit).await?;
        Ok(())
    }

    /// Drop every token in the store.
    pub async fn delete_all_tokens(&self) -> Result<()> {
        let mut unit = WorkUnit::new();
        unit.push(Mutation::DeleteAllTokens(None));
        self.ctx.store.commit(unit).await?;
        Ok(())
    }

    pub async fn search_tokens(&self, options: &QueryOptions) -> Result<Vec<Token>> {
        self.ctx.store.search_tokens(options).await
    }
}
